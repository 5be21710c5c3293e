//! Wall-clock abstraction and date/time parsing helpers.
//!
//! The scheduler and the job validator never read the system clock
//! directly; they go through [`Clock`] so tests can drive time manually.

use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::{Datelike, Duration, Local, NaiveDate, NaiveDateTime, NaiveTime};

/// Source of "now" plus a sleep primitive. Injectable for tests.
#[async_trait]
pub trait Clock: Send + Sync {
    fn now(&self) -> NaiveDateTime;

    async fn sleep(&self, duration: StdDuration);
}

/// Production clock backed by the local wall clock and `tokio::time`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

#[async_trait]
impl Clock for SystemClock {
    fn now(&self) -> NaiveDateTime {
        Local::now().naive_local()
    }

    async fn sleep(&self, duration: StdDuration) {
        tokio::time::sleep(duration).await;
    }
}

const DATETIME_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%d %H:%M",
    "%Y/%m/%d %H:%M:%S",
    "%Y/%m/%d %H:%M",
];

const DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%Y/%m/%d", "%Y%m%d"];

const TIME_FORMATS: &[&str] = &["%H:%M:%S", "%H:%M"];

/// Parse a date/time string the way users write them in config files.
///
/// Accepts full timestamps, bare dates (midnight assumed), `YYYY-MM-DD HH`
/// (minute/second zero) and bare times, which combine with `base_date`
/// (usually today). Returns `None` when nothing matches.
pub fn parse_datetime(s: &str, base_date: NaiveDate) -> Option<NaiveDateTime> {
    let s = s.trim();
    for fmt in DATETIME_FORMATS {
        if let Ok(dt) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(dt);
        }
    }
    // "%Y-%m-%d %H" and "%Y-%m" carry partial time/date information, so they
    // go through NaiveDate parsing with manual completion.
    if let Ok(dt) = NaiveDateTime::parse_from_str(&format!("{s}:00:00"), "%Y-%m-%d %H:%M:%S") {
        return Some(dt);
    }
    for fmt in DATE_FORMATS {
        if let Ok(d) = NaiveDate::parse_from_str(s, fmt) {
            return Some(d.and_time(NaiveTime::MIN));
        }
    }
    if let Ok(d) = NaiveDate::parse_from_str(&format!("{s}-01"), "%Y-%m-%d") {
        return Some(d.and_time(NaiveTime::MIN));
    }
    for fmt in TIME_FORMATS {
        if let Ok(t) = NaiveTime::parse_from_str(s, fmt) {
            return Some(base_date.and_time(t));
        }
    }
    None
}

/// Add a number of calendar months, clamping the day to the month's length
/// (Jan 31 + 1 month = Feb 28/29).
pub fn add_months(dt: NaiveDateTime, months: i64) -> NaiveDateTime {
    let total = dt.year() as i64 * 12 + dt.month0() as i64 + months;
    let year = total.div_euclid(12) as i32;
    let month0 = total.rem_euclid(12) as u32;
    let day = dt.day().min(days_in_month(year, month0 + 1));
    NaiveDate::from_ymd_opt(year, month0 + 1, day)
        .map(|d| d.and_time(dt.time()))
        .unwrap_or(dt)
}

pub fn days_in_month(year: i32, month: u32) -> u32 {
    let next = if month == 12 {
        NaiveDate::from_ymd_opt(year + 1, 1, 1)
    } else {
        NaiveDate::from_ymd_opt(year, month + 1, 1)
    };
    match (next, NaiveDate::from_ymd_opt(year, month, 1)) {
        (Some(n), Some(c)) => n.signed_duration_since(c).num_days() as u32,
        _ => 30,
    }
}

/// Relative date/time offset in the style of `dateutil.relativedelta`:
/// years/months shift the calendar first, the rest is a plain duration.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RelativeDelta {
    pub years: i64,
    pub months: i64,
    pub weeks: i64,
    pub days: i64,
    pub hours: i64,
    pub minutes: i64,
    pub seconds: i64,
    pub microseconds: i64,
}

impl RelativeDelta {
    pub fn apply(&self, dt: NaiveDateTime) -> NaiveDateTime {
        let shifted = add_months(dt, self.years * 12 + self.months);
        shifted
            + Duration::weeks(self.weeks)
            + Duration::days(self.days)
            + Duration::hours(self.hours)
            + Duration::minutes(self.minutes)
            + Duration::seconds(self.seconds)
            + Duration::microseconds(self.microseconds)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn parses_full_timestamp() {
        let dt = parse_datetime("2024-06-01 09:30:00", date(2024, 1, 1)).unwrap();
        assert_eq!(dt.to_string(), "2024-06-01 09:30:00");
    }

    #[test]
    fn parses_bare_date_as_midnight() {
        let dt = parse_datetime("2024-06-01", date(2024, 1, 1)).unwrap();
        assert_eq!(dt.to_string(), "2024-06-01 00:00:00");
    }

    #[test]
    fn parses_bare_time_against_base_date() {
        let dt = parse_datetime("09:30:00", date(2024, 6, 1)).unwrap();
        assert_eq!(dt.to_string(), "2024-06-01 09:30:00");
    }

    #[test]
    fn rejects_garbage() {
        assert!(parse_datetime("not a date", date(2024, 1, 1)).is_none());
    }

    #[test]
    fn add_months_clamps_day() {
        let dt = date(2024, 1, 31).and_time(NaiveTime::MIN);
        assert_eq!(add_months(dt, 1).to_string(), "2024-02-29 00:00:00");
        assert_eq!(add_months(dt, -2).to_string(), "2023-11-30 00:00:00");
    }

    #[test]
    fn relative_delta_orders_calendar_before_duration() {
        let dt = date(2024, 1, 31).and_time(NaiveTime::MIN);
        let delta = RelativeDelta {
            months: 1,
            days: 1,
            ..Default::default()
        };
        assert_eq!(delta.apply(dt).to_string(), "2024-03-01 00:00:00");
    }
}
