use chrono::{DateTime, Datelike, Days, FixedOffset, LocalResult, NaiveDate, NaiveTime, Offset, SecondsFormat, TimeZone};
use serde::{Deserialize, Serialize};

use crate::{
    date::CivilDate,
    error::{DateError, WindowError},
    posix_tz::PosixTimeZone,
};

/// How to pick between the two instants of a wall-clock time repeated by a
/// fall-back transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AmbiguityPolicy {
    /// The pre-transition (daylight) instant.
    #[default]
    Earliest,
    Reject,
}

/// One local civil day as a pair of offset-qualified instants.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DateWindow {
    pub start: DateTime<FixedOffset>,
    pub end: DateTime<FixedOffset>,
    /// Set when either boundary came out of a fall-back ambiguity.
    pub ambiguous: bool,
}

impl DateWindow {
    pub fn start_iso(&self) -> String {
        iso8601(&self.start)
    }

    pub fn end_iso(&self) -> String {
        iso8601(&self.end)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Boundary {
    Exact,
    Ambiguous,
    Shifted,
}

/// `[date 00:00, date+1 00:00)` in `zone`.
///
/// A local midnight skipped by a spring-forward transition is moved forward
/// by the length of the gap, so the window starts at the first instant that
/// exists on that day.
pub fn resolve_window(
    date: CivilDate,
    zone: &PosixTimeZone,
    policy: AmbiguityPolicy,
) -> Result<DateWindow, WindowError> {
    let day = date.normalize()?;
    let next = day.checked_add_days(Days::new(1)).ok_or(DateError::OutOfRange {
        year: date.year,
        month: date.month,
        day: date.day.saturating_add(1),
    })?;

    let (start, start_kind) = local_midnight(day, zone, policy)?;
    let (end, end_kind) = local_midnight(next, zone, policy)?;

    if start_kind == Boundary::Shifted || end_kind == Boundary::Shifted {
        log::debug!("midnight of {day} or {next} falls in a DST gap; shifted forward");
    }

    Ok(DateWindow {
        start,
        end,
        ambiguous: start_kind == Boundary::Ambiguous || end_kind == Boundary::Ambiguous,
    })
}

fn local_midnight(
    day: NaiveDate,
    zone: &PosixTimeZone,
    policy: AmbiguityPolicy,
) -> Result<(DateTime<FixedOffset>, Boundary), WindowError> {
    let naive = day.and_time(NaiveTime::default());

    let (instant, kind) = match zone.from_local_datetime(&naive) {
        LocalResult::Single(instant) => (instant, Boundary::Exact),
        LocalResult::Ambiguous(earliest, _latest) => match policy {
            AmbiguityPolicy::Earliest => (earliest, Boundary::Ambiguous),
            AmbiguityPolicy::Reject => return Err(WindowError::Ambiguous(day)),
        },
        LocalResult::None => {
            let utc = zone
                .offset_before_gap(&naive)
                .and_then(|before| naive.checked_sub_offset(before.fix()))
                .ok_or(DateError::OutOfRange {
                    year: day.year(),
                    month: day.month(),
                    day: day.day() as i32,
                })?;
            (zone.from_utc_datetime(&utc), Boundary::Shifted)
        }
    };

    Ok((instant.with_timezone(&instant.offset().fix()), kind))
}

fn iso8601(instant: &DateTime<FixedOffset>) -> String {
    instant.to_rfc3339_opts(SecondsFormat::Secs, false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const PARIS: &str = "CET-1CEST,M3.5.0,M10.5.0/3";

    fn paris() -> PosixTimeZone {
        PosixTimeZone::parse(PARIS).unwrap()
    }

    fn window(y: i32, m: u32, d: i32) -> DateWindow {
        resolve_window(CivilDate::new(y, m, d), &paris(), AmbiguityPolicy::Earliest).unwrap()
    }

    #[test]
    fn winter_day_in_paris() {
        let window = window(2024, 2, 12);
        assert_eq!(window.start_iso(), "2024-02-12T00:00:00+01:00");
        assert_eq!(window.end_iso(), "2024-02-13T00:00:00+01:00");
        assert!(!window.ambiguous);
    }

    #[test]
    fn summer_day_keeps_daylight_offset_on_both_ends() {
        let window = window(2024, 7, 14);
        assert_eq!(window.start_iso(), "2024-07-14T00:00:00+02:00");
        assert_eq!(window.end_iso(), "2024-07-15T00:00:00+02:00");
        assert_eq!((window.end - window.start).num_hours(), 24);
    }

    #[test]
    fn ordinary_days_span_24_hours_with_one_offset() {
        for (m, d) in [(1, 1), (2, 28), (5, 8), (8, 31), (11, 11), (12, 31)] {
            let window = window(2025, m, d);
            assert_eq!((window.end - window.start).num_hours(), 24, "{m}/{d}");
            assert_eq!(window.start.offset(), window.end.offset(), "{m}/{d}");
        }
    }

    #[test]
    fn transition_days_keep_civil_midnights() {
        let spring = window(2024, 3, 31);
        assert_eq!(spring.start_iso(), "2024-03-31T00:00:00+01:00");
        assert_eq!(spring.end_iso(), "2024-04-01T00:00:00+02:00");
        assert_eq!((spring.end - spring.start).num_hours(), 23);

        let autumn = window(2024, 10, 27);
        assert_eq!(autumn.start_iso(), "2024-10-27T00:00:00+02:00");
        assert_eq!(autumn.end_iso(), "2024-10-28T00:00:00+01:00");
        assert_eq!((autumn.end - autumn.start).num_hours(), 25);
    }

    #[test]
    fn rolls_over_month_end() {
        let leap = window(2024, 2, 29);
        assert_eq!(leap.end_iso(), "2024-03-01T00:00:00+01:00");

        let overflow = window(2024, 2, 30);
        assert_eq!(overflow.start_iso(), "2024-03-01T00:00:00+01:00");

        let new_year = window(2024, 12, 31);
        assert_eq!(new_year.end_iso(), "2025-01-01T00:00:00+01:00");
    }

    #[test]
    fn is_idempotent() {
        let zone = paris();
        let date = CivilDate::new(2024, 10, 27);
        let first = resolve_window(date, &zone, AmbiguityPolicy::Earliest).unwrap();
        let second = resolve_window(date, &zone, AmbiguityPolicy::Earliest).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn ambiguous_midnight_prefers_daylight_or_is_rejected() {
        // Clocks go back from 01:00 daylight to 00:00 standard: midnight happens twice.
        let zone = PosixTimeZone::parse("STD0DST,M3.5.0,M10.5.0/1").unwrap();
        let date = CivilDate::new(2024, 10, 27);

        let window = resolve_window(date, &zone, AmbiguityPolicy::Earliest).unwrap();
        assert!(window.ambiguous);
        assert_eq!(window.start_iso(), "2024-10-27T00:00:00+01:00");
        assert_eq!(window.end_iso(), "2024-10-28T00:00:00+00:00");

        let rejected = resolve_window(date, &zone, AmbiguityPolicy::Reject);
        assert_eq!(
            rejected,
            Err(WindowError::Ambiguous(NaiveDate::from_ymd_opt(2024, 10, 27).unwrap()))
        );
    }

    #[test]
    fn skipped_midnight_is_shifted_forward() {
        // Clocks jump from 00:00 standard to 01:00 daylight: midnight never happens.
        let zone = PosixTimeZone::parse("STD0DST,M3.5.0/0,M10.5.0").unwrap();
        let window = resolve_window(CivilDate::new(2024, 3, 31), &zone, AmbiguityPolicy::Reject)
            .unwrap();

        assert!(!window.ambiguous);
        assert_eq!(window.start_iso(), "2024-03-31T01:00:00+01:00");
        assert_eq!(window.end_iso(), "2024-04-01T00:00:00+01:00");
    }

    #[test]
    fn zones_without_daylight_rules() {
        let zone = PosixTimeZone::parse("<-03>3").unwrap();
        let window =
            resolve_window(CivilDate::new(2024, 6, 1), &zone, AmbiguityPolicy::Reject).unwrap();
        assert_eq!(window.start_iso(), "2024-06-01T00:00:00-03:00");
        assert_eq!(window.end_iso(), "2024-06-02T00:00:00-03:00");
    }

    #[test]
    fn invalid_month_is_reported() {
        let result = resolve_window(CivilDate::new(2024, 0, 1), &paris(), AmbiguityPolicy::Earliest);
        assert_eq!(result, Err(WindowError::Date(DateError::Month(0))));
    }

    #[test]
    fn dates_at_the_calendar_limits_are_out_of_range() {
        let zone = paris();
        for limit in [NaiveDate::MIN, NaiveDate::MAX] {
            let result = resolve_window(CivilDate::from_naive(limit), &zone, AmbiguityPolicy::Earliest);
            assert!(
                matches!(result, Err(WindowError::Date(DateError::OutOfRange { .. }))),
                "{limit}: {result:?}"
            );
        }
    }
}
