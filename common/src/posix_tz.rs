//! POSIX `TZ` rule strings (`CET-1CEST,M3.5.0,M10.5.0/3`) as a chrono
//! [`TimeZone`].
//!
//! Rule evaluation is done by `tz-rs`; this module adapts it to chrono so
//! local midnights come back as `LocalResult::{Single, Ambiguous, None}`.
//! Only the rule form is supported; `:path` and IANA names are rejected.

use std::{borrow::Cow, fmt, str::FromStr, sync::Arc};

use chrono::{FixedOffset, LocalResult, NaiveDate, NaiveDateTime, NaiveTime, Offset, TimeZone};

use crate::error::TzError;

/// Rules assumed when a daylight name is given without transitions.
const US_DEFAULT_RULES: &str = ",M3.2.0,M11.1.0";

const SECS_PER_DAY: i64 = 86_400;

/// 2000-01-01 and 2000-07-01 UTC; one of them is in standard time.
const STANDARD_SAMPLES: [i64; 2] = [946_684_800, 962_409_600];

struct Inner {
    source: String,
    rules: tz::TimeZone,
    standard: LocalType,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct LocalType {
    fixed: FixedOffset,
    is_dst: bool,
    abbreviation: String,
}

/// A parsed POSIX time-zone rule. Cheap to clone.
#[derive(Clone)]
pub struct PosixTimeZone {
    inner: Arc<Inner>,
}

/// The offset in effect at some instant of a [`PosixTimeZone`].
#[derive(Clone, PartialEq, Eq)]
pub struct ZoneOffset {
    zone: PosixTimeZone,
    local: LocalType,
}

impl PosixTimeZone {
    pub fn parse(source: &str) -> Result<Self, TzError> {
        let source = source.trim();
        if source.is_empty() {
            return Err(TzError::Empty);
        }
        if !is_rule_form(source) {
            return Err(TzError::Unsupported(source.to_string()));
        }

        let rule: Cow<'_, str> = if has_bare_daylight(source) {
            Cow::Owned(format!("{source}{US_DEFAULT_RULES}"))
        } else {
            Cow::Borrowed(source)
        };
        let rules =
            tz::TimeZone::from_posix_tz(&rule).map_err(|err| TzError::Invalid(err.to_string()))?;

        let samples = STANDARD_SAMPLES
            .iter()
            .filter_map(|&unix| lookup(&rules, unix))
            .collect::<Vec<_>>();
        let standard = samples
            .iter()
            .find(|local| !local.is_dst)
            .or_else(|| samples.first())
            .cloned()
            .ok_or_else(|| TzError::Invalid(format!("no local time type in `{source}`")))?;

        Ok(Self {
            inner: Arc::new(Inner {
                source: source.to_string(),
                rules,
                standard,
            }),
        })
    }

    pub fn as_str(&self) -> &str {
        &self.inner.source
    }

    /// The offset that applied just before a spring-forward gap containing
    /// `local`. Interpreting `local` with it lands after the gap, shifted
    /// forward by the gap length. `None` when the instant is out of range.
    pub fn offset_before_gap(&self, local: &NaiveDateTime) -> Option<ZoneOffset> {
        let wall = local.and_utc().timestamp();
        let widest = self
            .candidates(wall)
            .into_iter()
            .map(|candidate| candidate.fixed.local_minus_utc())
            .max()?;
        let before = self.type_at(wall.checked_sub(i64::from(widest))?)?;
        Some(self.zone_offset(before))
    }

    fn type_at(&self, unix: i64) -> Option<LocalType> {
        lookup(&self.inner.rules, unix)
    }

    /// Every local time type in effect within a day of the wall-clock
    /// reading `wall`, taken as seconds since the epoch.
    fn candidates(&self, wall: i64) -> Vec<LocalType> {
        let standard = i64::from(self.inner.standard.fixed.local_minus_utc());
        let mut found: Vec<LocalType> = Vec::with_capacity(2);
        for shift in [-SECS_PER_DAY, 0, SECS_PER_DAY] {
            let Some(local) = wall
                .checked_sub(standard)
                .and_then(|unix| unix.checked_add(shift))
                .and_then(|unix| self.type_at(unix))
            else {
                continue;
            };
            if !found.iter().any(|seen| seen.fixed == local.fixed) {
                found.push(local);
            }
        }
        found
    }

    fn zone_offset(&self, local: LocalType) -> ZoneOffset {
        ZoneOffset {
            zone: self.clone(),
            local,
        }
    }
}

fn lookup(rules: &tz::TimeZone, unix: i64) -> Option<LocalType> {
    let local = rules.find_local_time_type(unix).ok()?;
    Some(LocalType {
        fixed: FixedOffset::east_opt(local.ut_offset())?,
        is_dst: local.is_dst(),
        abbreviation: local.time_zone_designation().to_string(),
    })
}

/// `std offset [dst ...]` rather than a zoneinfo name or path.
fn is_rule_form(source: &str) -> bool {
    if source.starts_with(':') {
        return false;
    }
    let head = source.split(',').next().unwrap_or(source);
    let head = match head.strip_prefix('<') {
        Some(quoted) => quoted.split_once('>').map_or("", |(_, rest)| rest),
        None => head,
    };
    !head.contains('/') && head.bytes().any(|b| b.is_ascii_digit())
}

/// A daylight name follows the standard offset but no transitions do.
fn has_bare_daylight(source: &str) -> bool {
    if source.contains(',') {
        return false;
    }
    let rest = match source.strip_prefix('<') {
        Some(quoted) => quoted.split_once('>').map_or("", |(_, rest)| rest),
        None => source.trim_start_matches(|c: char| c.is_ascii_alphabetic()),
    };
    !rest
        .trim_start_matches(|c: char| c.is_ascii_digit() || matches!(c, '+' | '-' | ':'))
        .is_empty()
}

impl FromStr for PosixTimeZone {
    type Err = TzError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl PartialEq for PosixTimeZone {
    fn eq(&self, other: &Self) -> bool {
        self.inner.source == other.inner.source
    }
}

impl Eq for PosixTimeZone {}

impl fmt::Debug for PosixTimeZone {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("PosixTimeZone").field(&self.inner.source).finish()
    }
}

impl fmt::Display for PosixTimeZone {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.inner.source)
    }
}

impl ZoneOffset {
    pub fn is_dst(&self) -> bool {
        self.local.is_dst
    }

    pub fn abbreviation(&self) -> &str {
        &self.local.abbreviation
    }
}

impl fmt::Debug for ZoneOffset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.local.abbreviation, self.local.fixed)
    }
}

impl fmt::Display for ZoneOffset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.local.abbreviation)
    }
}

impl Offset for ZoneOffset {
    fn fix(&self) -> FixedOffset {
        self.local.fixed
    }
}

impl TimeZone for PosixTimeZone {
    type Offset = ZoneOffset;

    fn from_offset(offset: &Self::Offset) -> Self {
        offset.zone.clone()
    }

    fn offset_from_local_date(&self, local: &NaiveDate) -> LocalResult<Self::Offset> {
        self.offset_from_local_datetime(&local.and_time(NaiveTime::default()))
    }

    fn offset_from_local_datetime(&self, local: &NaiveDateTime) -> LocalResult<Self::Offset> {
        let wall = local.and_utc().timestamp();

        // A wall-clock reading is valid under an offset when the instant it
        // names is itself governed by that offset.
        let mut valid = self
            .candidates(wall)
            .into_iter()
            .filter(|candidate| {
                wall.checked_sub(i64::from(candidate.fixed.local_minus_utc()))
                    .and_then(|unix| self.type_at(unix))
                    .is_some_and(|actual| actual.fixed == candidate.fixed)
            })
            .collect::<Vec<_>>();

        // Earliest instant first: the larger offset reaches the wall time sooner.
        valid.sort_by_key(|candidate| std::cmp::Reverse(candidate.fixed.local_minus_utc()));

        let mut valid = valid.into_iter().map(|local| self.zone_offset(local));
        match (valid.next(), valid.next()) {
            (Some(earliest), Some(latest)) => LocalResult::Ambiguous(earliest, latest),
            (Some(single), None) => LocalResult::Single(single),
            _ => LocalResult::None,
        }
    }

    fn offset_from_utc_date(&self, utc: &NaiveDate) -> Self::Offset {
        self.offset_from_utc_datetime(&utc.and_time(NaiveTime::default()))
    }

    fn offset_from_utc_datetime(&self, utc: &NaiveDateTime) -> Self::Offset {
        let local = self
            .type_at(utc.and_utc().timestamp())
            .unwrap_or_else(|| self.inner.standard.clone());
        self.zone_offset(local)
    }
}
