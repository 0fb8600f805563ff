//! Bounded "wait until true" loops backed by a hardware watchdog.

use std::{
    sync::OnceLock,
    thread,
    time::{Duration, Instant},
};

use crate::error::Fatal;

pub const POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Extra time given to the hardware timer so the software deadline always
/// fires first.
pub const WATCHDOG_GRACE: Duration = Duration::from_secs(5);

pub trait Clock: Send + Sync {
    fn monotonic_ms(&self) -> u64;
    fn sleep(&self, duration: Duration);
}

/// A timer that resets the device unless disarmed in time.
pub trait Watchdog: Send + Sync {
    fn arm(&self, timeout: Duration) -> Result<(), String>;
    fn disarm(&self);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn monotonic_ms(&self) -> u64 {
        static START: OnceLock<Instant> = OnceLock::new();
        START
            .get_or_init(Instant::now)
            .elapsed()
            .as_millis()
            .try_into()
            .unwrap_or(u64::MAX)
    }

    fn sleep(&self, duration: Duration) {
        thread::sleep(duration);
    }
}

struct ArmedWatchdog<'a, W: Watchdog + ?Sized> {
    watchdog: &'a W,
}

impl<W: Watchdog + ?Sized> Drop for ArmedWatchdog<'_, W> {
    fn drop(&mut self) {
        self.watchdog.disarm();
    }
}

/// Polls `condition` every [`POLL_INTERVAL`] until it holds.
///
/// Returns [`Fatal::Timeout`] once `timeout_secs` have elapsed; the caller is
/// expected to restart the device. The hardware watchdog is armed for the
/// duration of the wait and disarmed exactly once on return.
pub fn await_condition<C, W>(
    clock: &C,
    watchdog: &W,
    what: &'static str,
    timeout_secs: u32,
    mut condition: impl FnMut() -> bool,
) -> Result<(), Fatal>
where
    C: Clock + ?Sized,
    W: Watchdog + ?Sized,
{
    let timeout = Duration::from_secs(u64::from(timeout_secs));
    let _armed = match watchdog.arm(timeout + WATCHDOG_GRACE) {
        Ok(()) => Some(ArmedWatchdog { watchdog }),
        Err(err) => {
            log::warn!("watchdog unavailable while waiting for {what}: {err}");
            None
        }
    };

    let started_ms = clock.monotonic_ms();
    let limit_ms = u64::from(timeout_secs).saturating_mul(1_000);

    loop {
        if condition() {
            return Ok(());
        }

        let waited_ms = clock.monotonic_ms().saturating_sub(started_ms);
        if waited_ms >= limit_ms {
            log::warn!("{what} still pending after {timeout_secs}s");
            return Err(Fatal::Timeout { what, timeout_secs });
        }

        clock.sleep(POLL_INTERVAL);
    }
}
