use chrono::{Datelike, Days, NaiveDate};
use serde::{Deserialize, Serialize};

use crate::error::DateError;

/// A calendar date as a caller writes it. `day` may fall outside the month
/// (0, -3, 32, ...); [`CivilDate::normalize`] rolls it into the neighbouring
/// month or year.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CivilDate {
    pub year: i32,
    pub month: u32,
    pub day: i32,
}

impl CivilDate {
    pub fn new(year: i32, month: u32, day: i32) -> Self {
        Self { year, month, day }
    }

    pub fn from_naive(date: NaiveDate) -> Self {
        Self {
            year: date.year(),
            month: date.month(),
            day: date.day() as i32,
        }
    }

    /// Same month, `days` further along (negative goes back).
    pub fn offset_days(self, days: i32) -> Self {
        Self {
            day: self.day.saturating_add(days),
            ..self
        }
    }

    pub fn normalize(&self) -> Result<NaiveDate, DateError> {
        if !(1..=12).contains(&self.month) {
            return Err(DateError::Month(self.month));
        }

        let out_of_range = DateError::OutOfRange {
            year: self.year,
            month: self.month,
            day: self.day,
        };

        let first = NaiveDate::from_ymd_opt(self.year, self.month, 1).ok_or(out_of_range.clone())?;
        let shift = i64::from(self.day) - 1;
        let shifted = if shift >= 0 {
            first.checked_add_days(Days::new(shift.unsigned_abs()))
        } else {
            first.checked_sub_days(Days::new(shift.unsigned_abs()))
        };

        shifted.ok_or(out_of_range)
    }
}

impl std::fmt::Display for CivilDate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.normalize() {
            Ok(date) => write!(f, "{}", date.format("%-d/%-m/%Y")),
            Err(_) => write!(f, "{}/{}/{}", self.day, self.month, self.year),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ymd(year: i32, month: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(year, month, day).unwrap()
    }

    #[test]
    fn keeps_in_range_dates() {
        assert_eq!(CivilDate::new(2024, 2, 12).normalize().unwrap(), ymd(2024, 2, 12));
    }

    #[test]
    fn rolls_day_overflow_into_next_month_and_year() {
        assert_eq!(CivilDate::new(2024, 2, 30).normalize().unwrap(), ymd(2024, 3, 1));
        assert_eq!(CivilDate::new(2023, 2, 29).normalize().unwrap(), ymd(2023, 3, 1));
        assert_eq!(CivilDate::new(2024, 12, 32).normalize().unwrap(), ymd(2025, 1, 1));
    }

    #[test]
    fn rolls_day_underflow_into_previous_month() {
        assert_eq!(CivilDate::new(2024, 3, 0).normalize().unwrap(), ymd(2024, 2, 29));
        assert_eq!(CivilDate::new(2024, 1, 0).normalize().unwrap(), ymd(2023, 12, 31));
    }

    #[test]
    fn offset_days_is_normalized_lazily() {
        let date = CivilDate::new(2024, 2, 29).offset_days(1);
        assert_eq!(date, CivilDate::new(2024, 2, 30));
        assert_eq!(date.normalize().unwrap(), ymd(2024, 3, 1));
    }

    #[test]
    fn rejects_bad_month() {
        assert_eq!(CivilDate::new(2024, 13, 1).normalize(), Err(DateError::Month(13)));
        assert_eq!(CivilDate::new(2024, 0, 1).normalize(), Err(DateError::Month(0)));
    }

    #[test]
    fn displays_as_day_month_year() {
        assert_eq!(CivilDate::new(2024, 2, 12).to_string(), "12/2/2024");
        assert_eq!(CivilDate::new(2024, 7, 5).to_string(), "5/7/2024");
        assert_eq!(CivilDate::new(2024, 12, 31).to_string(), "31/12/2024");
        // Normalized before display.
        assert_eq!(CivilDate::new(2024, 1, 0).to_string(), "31/12/2023");
    }
}
