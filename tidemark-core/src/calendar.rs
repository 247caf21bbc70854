//! Market calendar and clock.
//!
//! Exchanges either trade around the clock (no close time; a period is final
//! only once it has ended) or close at a fixed UTC time of day, after which the
//! daily-or-coarser period containing that day is final.

use crate::domain::Level;
use chrono::{DateTime, Duration, NaiveTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Source of "now". Injected so tests never depend on wall time.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Manually driven clock for tests and replays.
#[derive(Debug)]
pub struct FixedClock {
    now: Mutex<DateTime<Utc>>,
}

impl FixedClock {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(now),
        }
    }

    pub fn set(&self, now: DateTime<Utc>) {
        *self.now.lock() = now;
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock();
        *now += by;
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock()
    }
}

/// Close times per exchange (UTC time of day).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarketCalendar {
    #[serde(default)]
    pub close_times: BTreeMap<String, NaiveTime>,
}

impl MarketCalendar {
    /// Every exchange trades around the clock.
    pub fn always_open() -> Self {
        Self::default()
    }

    pub fn with_close(mut self, exchange: impl Into<String>, close: NaiveTime) -> Self {
        self.close_times.insert(exchange.into(), close);
        self
    }

    pub fn close_time(&self, exchange: &str) -> Option<NaiveTime> {
        self.close_times.get(exchange).copied()
    }

    /// Close instant on the last day of the period containing `ts`.
    fn period_close(&self, exchange: &str, level: Level, ts: DateTime<Utc>) -> Option<DateTime<Utc>> {
        if level.is_intraday() {
            return None;
        }
        let close = self.close_time(exchange)?;
        let last_day = (level.period_end(ts) - Duration::days(1)).date_naive();
        Some(last_day.and_time(close).and_utc())
    }

    /// Instant at which the period containing `ts` becomes final.
    pub fn final_at(&self, exchange: &str, level: Level, ts: DateTime<Utc>) -> DateTime<Utc> {
        let end = level.period_end(ts);
        match self.period_close(exchange, level, ts) {
            Some(close) => close.min(end),
            None => end,
        }
    }

    /// Whether the period containing `ts` can no longer change at `now`.
    pub fn is_period_final(
        &self,
        exchange: &str,
        level: Level,
        ts: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> bool {
        now >= self.final_at(exchange, level, ts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(d: u32, h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, d, h, m, 0).unwrap()
    }

    fn sh_close() -> MarketCalendar {
        MarketCalendar::default().with_close("sh", NaiveTime::from_hms_opt(7, 0, 0).unwrap())
    }

    #[test]
    fn always_open_final_only_after_period_end() {
        let cal = MarketCalendar::always_open();
        assert!(!cal.is_period_final("binance", Level::Day1, at(5, 0, 0), at(5, 23, 59)));
        assert!(cal.is_period_final("binance", Level::Day1, at(5, 0, 0), at(6, 0, 0)));
    }

    #[test]
    fn fixed_close_final_after_close_time() {
        let cal = sh_close();
        assert!(!cal.is_period_final("sh", Level::Day1, at(5, 0, 0), at(5, 6, 59)));
        assert!(cal.is_period_final("sh", Level::Day1, at(5, 0, 0), at(5, 7, 0)));
    }

    #[test]
    fn close_time_ignored_for_intraday_levels() {
        let cal = sh_close();
        assert!(!cal.is_period_final("sh", Level::Hour1, at(5, 7, 0), at(5, 7, 30)));
    }

    #[test]
    fn final_at_uses_close_when_known() {
        let cal = sh_close();
        assert_eq!(cal.final_at("sh", Level::Day1, at(5, 3, 0)), at(5, 7, 0));
        assert_eq!(cal.final_at("nyse", Level::Day1, at(5, 3, 0)), at(6, 0, 0));
        // weekly bars of 2024-03-04..10 settle at Sunday's close
        assert_eq!(cal.final_at("sh", Level::Week1, at(5, 3, 0)), at(10, 7, 0));
    }

    #[test]
    fn fixed_clock_advances() {
        let clock = FixedClock::new(at(5, 0, 0));
        clock.advance(Duration::hours(2));
        assert_eq!(clock.now(), at(5, 2, 0));
        clock.set(at(9, 0, 0));
        assert_eq!(clock.now(), at(9, 0, 0));
    }
}
