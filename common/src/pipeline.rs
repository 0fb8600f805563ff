//! Startup sequence: link, token, zone, then the configured day reports.

use std::fmt;

use crate::{
    config::RuntimeConfig,
    date::CivilDate,
    error::{Fatal, ReportError, TimeError},
    link::{ConnectivitySupervisor, WifiDriver},
    posix_tz::PosixTimeZone,
    tempo::{AccessToken, DayColor, HttpTransport, TempoApi},
    timebase::{TimeBase, TimeSource},
    watchdog::{Clock, Watchdog},
};

#[derive(Debug)]
pub struct DayReport {
    /// `J`, `J-1`, `J+2`, ... relative to the section's reference date.
    pub label: String,
    pub date: CivilDate,
    pub outcome: Result<DayColor, ReportError>,
}

impl fmt::Display for DayReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.outcome {
            Ok(color) => write!(f, "Day {} Tempo color : {color}", self.label),
            Err(err) => write!(f, "Day {} Tempo color : no result ({err})", self.label),
        }
    }
}

#[derive(Debug)]
pub struct ReportSection {
    pub reference: CivilDate,
    pub days: Vec<DayReport>,
}

impl fmt::Display for ReportSection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} :", self.reference)?;
        for day in &self.days {
            write!(f, "\n{day}")?;
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct PipelineReport {
    pub custom: Option<ReportSection>,
    pub today: Option<ReportSection>,
}

pub fn offset_label(offset: i32) -> String {
    match offset {
        0 => "J".to_string(),
        n if n > 0 => format!("J+{n}"),
        n => format!("J{n}"),
    }
}

/// Runs the whole startup sequence once.
///
/// Per-day failures land in the report. Anything returned as `Err` must be
/// handled by the caller according to [`Fatal::action`].
pub fn run_pipeline<D, C, W, S, T>(
    config: &RuntimeConfig,
    link: &ConnectivitySupervisor<D, C, W>,
    time: &mut TimeBase<S>,
    api: &mut TempoApi<T>,
) -> Result<PipelineReport, Fatal>
where
    D: WifiDriver + 'static,
    C: Clock + 'static,
    W: Watchdog + 'static,
    S: TimeSource,
    T: HttpTransport,
{
    link.connect()?;

    let token = api
        .acquire_token(&config.api.token_url, &config.api.basic_auth)
        .map_err(|err| {
            log::warn!("cannot obtain access token: {err}");
            Fatal::NoToken(err)
        })?;
    log::info!("access token acquired: {token:?}");

    let zone = PosixTimeZone::parse(&config.time.timezone).map_err(|err| {
        Fatal::Config(format!("time zone `{}`: {err}", config.time.timezone))
    })?;
    time.activate_time_zone(zone);

    let mut report = PipelineReport::default();
    let calendar_url = config.api.calendar_url.as_str();

    if let Some(reference) = config.report.custom_date {
        if !config.report.custom_offsets.is_empty() {
            report.custom = Some(query_days(
                time,
                api,
                &token,
                calendar_url,
                reference,
                &config.report.custom_offsets,
            ));
        }
    }

    if !config.report.today_offsets.is_empty() {
        time.sync_utc(
            &config.time.ntp_server,
            config.time.sync_timeout_secs,
            link.clock(),
            link.watchdog(),
        )?;
        let today = time.current_local_date().map_err(|err| Fatal::Service {
            what: "local clock",
            reason: err.to_string(),
        })?;
        report.today = Some(query_days(
            time,
            api,
            &token,
            calendar_url,
            today,
            &config.report.today_offsets,
        ));
    }

    Ok(report)
}

fn query_days<S: TimeSource, T: HttpTransport>(
    time: &TimeBase<S>,
    api: &mut TempoApi<T>,
    token: &AccessToken,
    calendar_url: &str,
    reference: CivilDate,
    offsets: &[i32],
) -> ReportSection {
    let days = offsets
        .iter()
        .map(|&offset| {
            let date = reference.offset_days(offset);
            let outcome = time
                .resolve_window(date)
                .map_err(ReportError::from)
                .and_then(|window| window.ok_or(ReportError::Time(TimeError::NoTimeZone)))
                .and_then(|window| {
                    api.day_color(&window, token, calendar_url)
                        .map_err(ReportError::from)
                });

            let report = DayReport {
                label: offset_label(offset),
                date,
                outcome,
            };
            match &report.outcome {
                Ok(_) => log::info!("{date}: {report}"),
                Err(_) => log::warn!("{date}: {report}"),
            }
            report
        })
        .collect();

    ReportSection { reference, days }
}
