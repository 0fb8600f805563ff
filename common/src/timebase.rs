use chrono::{DateTime, FixedOffset, Offset, Utc};

use crate::{
    date::CivilDate,
    error::{Fatal, TimeError, WindowError},
    posix_tz::PosixTimeZone,
    watchdog::{await_condition, Clock, Watchdog},
    window::{resolve_window, AmbiguityPolicy, DateWindow},
};

/// Source of absolute (UTC) time, typically SNTP.
pub trait TimeSource {
    fn start_sync(&mut self, server: &str) -> Result<(), TimeError>;
    fn is_synced(&self) -> bool;
    fn now_utc(&self) -> DateTime<Utc>;
}

/// Process-wide time context: the UTC source plus the active zone.
pub struct TimeBase<S> {
    source: S,
    zone: Option<PosixTimeZone>,
    policy: AmbiguityPolicy,
    synced: bool,
}

impl<S: TimeSource> TimeBase<S> {
    pub fn new(source: S, policy: AmbiguityPolicy) -> Self {
        Self {
            source,
            zone: None,
            policy,
            synced: false,
        }
    }

    pub fn sync_utc<C, W>(
        &mut self,
        server: &str,
        timeout_secs: u32,
        clock: &C,
        watchdog: &W,
    ) -> Result<(), Fatal>
    where
        C: Clock + ?Sized,
        W: Watchdog + ?Sized,
    {
        log::info!("syncing time from `{server}`");
        self.source
            .start_sync(server)
            .map_err(|err| Fatal::Service {
                what: "time sync",
                reason: err.to_string(),
            })?;

        let source = &self.source;
        await_condition(clock, watchdog, "time sync", timeout_secs, || source.is_synced())?;

        self.synced = true;
        log::info!("time synchronized: {}", self.source.now_utc().to_rfc3339());
        Ok(())
    }

    pub fn activate_time_zone(&mut self, zone: PosixTimeZone) {
        log::info!("time zone set to `{zone}`");
        self.zone = Some(zone);
    }

    pub fn is_synced(&self) -> bool {
        self.synced
    }

    pub fn now_local(&self) -> Result<DateTime<FixedOffset>, TimeError> {
        if !self.synced {
            return Err(TimeError::NotSynced);
        }
        let zone = self.zone.as_ref().ok_or(TimeError::NoTimeZone)?;
        let local = self.source.now_utc().with_timezone(zone);
        Ok(local.with_timezone(&local.offset().fix()))
    }

    pub fn current_local_date(&self) -> Result<CivilDate, TimeError> {
        self.now_local()
            .map(|now| CivilDate::from_naive(now.date_naive()))
    }

    /// Window for `date` in the active zone. Needs no synchronized clock.
    pub fn resolve_window(&self, date: CivilDate) -> Result<Option<DateWindow>, WindowError> {
        match &self.zone {
            Some(zone) => resolve_window(date, zone, self.policy).map(Some),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        cell::Cell,
        sync::atomic::Ordering,
    };

    use chrono::TimeZone;

    use super::*;
    use crate::watchdog::testing::{ManualClock, RecordingWatchdog};

    struct FakeSntp {
        now: DateTime<Utc>,
        polls_until_synced: Cell<u32>,
        server: Option<String>,
        refuse: bool,
    }

    impl FakeSntp {
        fn new(now: DateTime<Utc>, polls_until_synced: u32) -> Self {
            Self {
                now,
                polls_until_synced: Cell::new(polls_until_synced),
                server: None,
                refuse: false,
            }
        }
    }

    impl TimeSource for FakeSntp {
        fn start_sync(&mut self, server: &str) -> Result<(), TimeError> {
            if self.refuse {
                return Err(TimeError::Source("no socket".to_string()));
            }
            self.server = Some(server.to_string());
            Ok(())
        }

        fn is_synced(&self) -> bool {
            let left = self.polls_until_synced.get();
            self.polls_until_synced.set(left.saturating_sub(1));
            left == 0
        }

        fn now_utc(&self) -> DateTime<Utc> {
            self.now
        }
    }

    fn paris() -> PosixTimeZone {
        PosixTimeZone::parse("CET-1CEST,M3.5.0,M10.5.0/3").unwrap()
    }

    #[test]
    fn local_date_needs_sync_and_zone() {
        let now = Utc.with_ymd_and_hms(2024, 2, 12, 23, 30, 0).unwrap();
        let clock = ManualClock::default();
        let watchdog = RecordingWatchdog::default();
        let mut time = TimeBase::new(FakeSntp::new(now, 2), AmbiguityPolicy::Earliest);

        assert_eq!(time.current_local_date(), Err(TimeError::NotSynced));

        time.sync_utc("pool.ntp.org", 10, &clock, &watchdog).unwrap();
        assert_eq!(time.source.server.as_deref(), Some("pool.ntp.org"));
        assert_eq!(clock.elapsed_ms(), 2_000);
        assert_eq!(watchdog.disarmed.load(Ordering::SeqCst), 1);
        assert_eq!(time.current_local_date(), Err(TimeError::NoTimeZone));

        time.activate_time_zone(paris());
        // 23:30 UTC is already the 13th in Paris.
        assert_eq!(time.current_local_date(), Ok(CivilDate::new(2024, 2, 13)));
    }

    #[test]
    fn sync_timeout_is_fatal() {
        let now = Utc.with_ymd_and_hms(2024, 2, 12, 0, 0, 0).unwrap();
        let mut time = TimeBase::new(FakeSntp::new(now, u32::MAX), AmbiguityPolicy::Earliest);

        let err = time
            .sync_utc(
                "pool.ntp.org",
                5,
                &ManualClock::default(),
                &RecordingWatchdog::default(),
            )
            .unwrap_err();

        assert!(matches!(err, Fatal::Timeout { what: "time sync", .. }));
        assert!(!time.is_synced());
    }

    #[test]
    fn sync_start_failure_requests_restart() {
        let now = Utc.with_ymd_and_hms(2024, 2, 12, 0, 0, 0).unwrap();
        let mut source = FakeSntp::new(now, 0);
        source.refuse = true;
        let mut time = TimeBase::new(source, AmbiguityPolicy::Earliest);

        let err = time
            .sync_utc(
                "pool.ntp.org",
                5,
                &ManualClock::default(),
                &RecordingWatchdog::default(),
            )
            .unwrap_err();

        assert_eq!(err.action(), crate::error::FatalAction::Restart);
    }

    #[test]
    fn windows_only_need_the_zone() {
        let now = Utc.with_ymd_and_hms(2024, 2, 12, 0, 0, 0).unwrap();
        let mut time = TimeBase::new(FakeSntp::new(now, 0), AmbiguityPolicy::Earliest);
        assert_eq!(time.resolve_window(CivilDate::new(2024, 2, 12)), Ok(None));

        time.activate_time_zone(paris());
        let window = time
            .resolve_window(CivilDate::new(2024, 2, 12))
            .unwrap()
            .unwrap();
        assert_eq!(window.start_iso(), "2024-02-12T00:00:00+01:00");
    }
}
