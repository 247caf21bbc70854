//! Sampling granularity and period arithmetic.
//!
//! Intraday and daily periods align to multiples of their length from the Unix
//! epoch (UTC). Weeks start Monday 00:00 UTC, months on the 1st 00:00 UTC.

use chrono::{DateTime, Datelike, Duration, NaiveDate, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Sampling period of a periodic dataset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Level {
    #[serde(rename = "tick")]
    Tick,
    #[serde(rename = "1m")]
    Minute1,
    #[serde(rename = "5m")]
    Minute5,
    #[serde(rename = "15m")]
    Minute15,
    #[serde(rename = "30m")]
    Minute30,
    #[serde(rename = "1h")]
    Hour1,
    #[serde(rename = "4h")]
    Hour4,
    #[serde(rename = "1d")]
    Day1,
    #[serde(rename = "1wk")]
    Week1,
    #[serde(rename = "1mon")]
    Month1,
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("unknown level '{0}' (expected tick, 1m, 5m, 15m, 30m, 1h, 4h, 1d, 1wk or 1mon)")]
pub struct ParseLevelError(pub String);

const MS_PER_SECOND: i64 = 1_000;
const MS_PER_DAY: i64 = 86_400_000;
/// 1970-01-01 was a Thursday; shifting by 3 days aligns week buckets to Monday.
const WEEK_EPOCH_SHIFT_DAYS: i64 = 3;

impl Level {
    pub const ALL: [Level; 10] = [
        Level::Tick,
        Level::Minute1,
        Level::Minute5,
        Level::Minute15,
        Level::Minute30,
        Level::Hour1,
        Level::Hour4,
        Level::Day1,
        Level::Week1,
        Level::Month1,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Level::Tick => "tick",
            Level::Minute1 => "1m",
            Level::Minute5 => "5m",
            Level::Minute15 => "15m",
            Level::Minute30 => "30m",
            Level::Hour1 => "1h",
            Level::Hour4 => "4h",
            Level::Day1 => "1d",
            Level::Week1 => "1wk",
            Level::Month1 => "1mon",
        }
    }

    /// Period length in milliseconds for levels with a fixed length.
    ///
    /// Months have no fixed length and return `None`. Ticks count as one second.
    pub fn fixed_millis(&self) -> Option<i64> {
        let secs = match self {
            Level::Tick => 1,
            Level::Minute1 => 60,
            Level::Minute5 => 5 * 60,
            Level::Minute15 => 15 * 60,
            Level::Minute30 => 30 * 60,
            Level::Hour1 => 3_600,
            Level::Hour4 => 4 * 3_600,
            Level::Day1 => 86_400,
            Level::Week1 => 7 * 86_400,
            Level::Month1 => return None,
        };
        Some(secs * MS_PER_SECOND)
    }

    pub fn is_intraday(&self) -> bool {
        *self < Level::Day1
    }

    /// Monotonic index of the period containing `ts`.
    pub fn period_index(&self, ts: DateTime<Utc>) -> i64 {
        match self {
            Level::Week1 => {
                let days = ts.timestamp_millis().div_euclid(MS_PER_DAY);
                (days + WEEK_EPOCH_SHIFT_DAYS).div_euclid(7)
            }
            Level::Month1 => i64::from(ts.year()) * 12 + i64::from(ts.month0()),
            _ => {
                let len = self.fixed_millis().unwrap_or(MS_PER_SECOND);
                ts.timestamp_millis().div_euclid(len)
            }
        }
    }

    /// First instant of the period with the given index.
    pub fn index_start(&self, index: i64) -> DateTime<Utc> {
        match self {
            Level::Week1 => {
                let days = index * 7 - WEEK_EPOCH_SHIFT_DAYS;
                millis_to_utc(days * MS_PER_DAY)
            }
            Level::Month1 => {
                let year = index.div_euclid(12) as i32;
                let month = index.rem_euclid(12) as u32 + 1;
                NaiveDate::from_ymd_opt(year, month, 1)
                    .and_then(|d| d.and_hms_opt(0, 0, 0))
                    .map(|dt| Utc.from_utc_datetime(&dt))
                    .unwrap_or(DateTime::<Utc>::MIN_UTC)
            }
            _ => {
                let len = self.fixed_millis().unwrap_or(MS_PER_SECOND);
                millis_to_utc(index * len)
            }
        }
    }

    pub fn period_start(&self, ts: DateTime<Utc>) -> DateTime<Utc> {
        self.index_start(self.period_index(ts))
    }

    /// Exclusive end of the period containing `ts` (start of the next one).
    pub fn period_end(&self, ts: DateTime<Utc>) -> DateTime<Utc> {
        self.index_start(self.period_index(ts) + 1)
    }

    /// `ts` moved back by one period length.
    pub fn step_back(&self, ts: DateTime<Utc>) -> DateTime<Utc> {
        match self.fixed_millis() {
            Some(len) => ts - Duration::milliseconds(len),
            None => {
                let prev = self.index_start(self.period_index(ts) - 1);
                prev + (ts - self.period_start(ts))
            }
        }
    }

    /// Number of period boundaries crossed going from `from` to `to`.
    pub fn elapsed_periods(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> i64 {
        self.period_index(to) - self.period_index(from)
    }

    pub fn same_period(&self, a: DateTime<Utc>, b: DateTime<Utc>) -> bool {
        self.period_index(a) == self.period_index(b)
    }
}

fn millis_to_utc(ms: i64) -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp_millis(ms).unwrap_or(DateTime::<Utc>::MIN_UTC)
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Level {
    type Err = ParseLevelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Level::ALL
            .iter()
            .copied()
            .find(|l| l.as_str() == s)
            .ok_or_else(|| ParseLevelError(s.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(y: i32, m: u32, d: u32, h: u32, min: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, min, 0).unwrap()
    }

    #[test]
    fn parse_and_display_roundtrip() {
        for level in Level::ALL {
            assert_eq!(level.as_str().parse::<Level>().unwrap(), level);
        }
        assert!("2d".parse::<Level>().is_err());
    }

    #[test]
    fn ordering_follows_granularity() {
        assert!(Level::Minute5 < Level::Hour1);
        assert!(Level::Day1 < Level::Month1);
        assert!(Level::Hour4.is_intraday());
        assert!(!Level::Day1.is_intraday());
    }

    #[test]
    fn daily_periods_align_to_midnight() {
        let ts = at(2024, 3, 5, 13, 45);
        assert_eq!(Level::Day1.period_start(ts), at(2024, 3, 5, 0, 0));
        assert_eq!(Level::Day1.period_end(ts), at(2024, 3, 6, 0, 0));
    }

    #[test]
    fn weeks_start_on_monday() {
        // 2024-03-07 is a Thursday
        let ts = at(2024, 3, 7, 9, 0);
        assert_eq!(Level::Week1.period_start(ts), at(2024, 3, 4, 0, 0));
        assert_eq!(Level::Week1.period_end(ts), at(2024, 3, 11, 0, 0));
    }

    #[test]
    fn months_start_on_the_first() {
        let ts = at(2024, 12, 20, 0, 0);
        assert_eq!(Level::Month1.period_start(ts), at(2024, 12, 1, 0, 0));
        assert_eq!(Level::Month1.period_end(ts), at(2025, 1, 1, 0, 0));
        assert_eq!(Level::Month1.step_back(at(2024, 3, 1, 0, 0)), at(2024, 2, 1, 0, 0));
    }

    #[test]
    fn elapsed_periods_counts_boundaries() {
        let t = at(2024, 1, 2, 0, 0);
        assert_eq!(Level::Day1.elapsed_periods(t, at(2024, 1, 2, 23, 59)), 0);
        assert_eq!(Level::Day1.elapsed_periods(t, at(2024, 1, 3, 0, 0)), 1);
        assert_eq!(Level::Minute5.elapsed_periods(t, at(2024, 1, 2, 1, 0)), 12);
        assert_eq!(Level::Month1.elapsed_periods(t, at(2024, 4, 1, 0, 0)), 3);
    }
}
