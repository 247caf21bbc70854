//! Fetch window evaluator.
//!
//! Decides, per entity and per cycle, what to ask the source for. State is
//! re-derived from storage every time (the cursor is never cached), so a
//! restarted recorder resumes exactly where the previous one stopped.
//!
//! States:
//! - `NeedsInit`: nothing stored yet; start at listing, ask for a full page.
//! - `ClosedForNow`: no recordable period since the cursor; size 0 plus a
//!   wait hint until the following period can be recorded. The period holding
//!   `now` is only recordable once final, unless unfinished periods are kept.
//! - `OpenPeriod`: one or more recordable periods since the cursor; the window
//!   starts at the first unrecorded period and its size is their count capped
//!   at the page size.
//! - `Terminal`: nothing to do this run (listing in the future, or no
//!   unpersisted candidate timestamps).

use crate::calendar::MarketCalendar;
use crate::config::{FetchingStyle, RecorderConfig, TimestampConvention};
use crate::domain::{Entity, Level};
use crate::provider::FetchRequest;
use chrono::{DateTime, Utc};
use std::collections::BTreeSet;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowState {
    NeedsInit,
    ClosedForNow,
    OpenPeriod,
    Terminal,
}

/// What to request this cycle.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchWindow {
    pub state: WindowState,
    pub start: Option<DateTime<Utc>>,
    pub end: DateTime<Utc>,
    pub size: usize,
    pub timestamps: Vec<DateTime<Utc>>,
    /// Time until the period after the cursor can be recorded.
    pub wait: Option<Duration>,
}

impl FetchWindow {
    fn empty(state: WindowState, now: DateTime<Utc>) -> Self {
        Self {
            state,
            start: None,
            end: now,
            size: 0,
            timestamps: Vec::new(),
            wait: None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// Mask the window down to the fields `style` passes to the source.
    pub fn request(&self, style: FetchingStyle) -> FetchRequest {
        if style == FetchingStyle::ByTimestamps {
            return FetchRequest {
                timestamps: Some(self.timestamps.clone()),
                ..FetchRequest::default()
            };
        }
        FetchRequest {
            start: self.start.filter(|_| style.uses_start()),
            end: style.uses_end().then_some(self.end),
            size: style.uses_size().then_some(self.size),
            timestamps: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct WindowEvaluator {
    pub level: Level,
    pub default_size: usize,
    pub convention: TimestampConvention,
    pub calendar: MarketCalendar,
    /// Whether a still-open period counts as recordable.
    pub contain_unfinished: bool,
}

impl WindowEvaluator {
    pub fn new(level: Level, default_size: usize) -> Self {
        Self {
            level,
            default_size,
            convention: TimestampConvention::PeriodStart,
            calendar: MarketCalendar::always_open(),
            contain_unfinished: false,
        }
    }

    pub fn from_config(config: &RecorderConfig, calendar: MarketCalendar) -> Self {
        Self {
            level: config.level,
            default_size: config.default_size,
            convention: config.timestamp_convention,
            calendar,
            contain_unfinished: config.contain_unfinished_period,
        }
    }

    pub fn with_level(mut self, level: Level) -> Self {
        self.level = level;
        self
    }

    pub fn with_convention(mut self, convention: TimestampConvention) -> Self {
        self.convention = convention;
        self
    }

    pub fn with_calendar(mut self, calendar: MarketCalendar) -> Self {
        self.calendar = calendar;
        self
    }

    pub fn with_unfinished(mut self, contain_unfinished: bool) -> Self {
        self.contain_unfinished = contain_unfinished;
        self
    }

    /// Evaluate a cursor-driven window.
    pub fn evaluate(
        &self,
        entity: &Entity,
        cursor: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> FetchWindow {
        let Some(latest) = cursor else {
            if entity.list_timestamp.is_some_and(|listed| listed > now) {
                return FetchWindow::empty(WindowState::Terminal, now);
            }
            return FetchWindow {
                state: WindowState::NeedsInit,
                start: entity.list_timestamp,
                end: now,
                size: self.default_size,
                timestamps: Vec::new(),
                wait: None,
            };
        };

        let reference = match self.convention {
            TimestampConvention::PeriodStart => latest,
            TimestampConvention::PeriodEnd => self.level.step_back(latest),
        };
        let mut elapsed = self.level.elapsed_periods(reference, now);
        if elapsed > 0
            && !self.contain_unfinished
            && !self.calendar.is_period_final(&entity.exchange, self.level, now, now)
        {
            elapsed -= 1;
        }

        // stamps are period-aligned under either convention, so the next
        // record is stamped one period after the cursor's own period
        let next = self.level.period_end(latest);

        if elapsed <= 0 {
            let next_period = self.level.period_end(reference);
            let ready = if self.contain_unfinished {
                next_period
            } else {
                self.calendar.final_at(&entity.exchange, self.level, next_period)
            };
            let mut window = FetchWindow::empty(WindowState::ClosedForNow, now);
            window.start = Some(next);
            window.wait = (ready - now).to_std().ok();
            return window;
        }

        let size = usize::try_from(elapsed)
            .unwrap_or(usize::MAX)
            .min(self.default_size);
        FetchWindow {
            state: WindowState::OpenPeriod,
            start: Some(next),
            end: now,
            size,
            timestamps: Vec::new(),
            wait: None,
        }
    }

    /// Evaluate an explicit-timestamp window: candidates not yet persisted,
    /// ascending, at most one page.
    pub fn evaluate_timestamps(
        &self,
        candidates: &[DateTime<Utc>],
        persisted: &BTreeSet<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> FetchWindow {
        let remaining: BTreeSet<DateTime<Utc>> = candidates
            .iter()
            .copied()
            .filter(|ts| !persisted.contains(ts))
            .collect();
        if remaining.is_empty() {
            return FetchWindow::empty(WindowState::Terminal, now);
        }
        let timestamps: Vec<DateTime<Utc>> =
            remaining.into_iter().take(self.default_size).collect();
        FetchWindow {
            state: WindowState::OpenPeriod,
            start: timestamps.first().copied(),
            end: now,
            size: timestamps.len(),
            timestamps,
            wait: None,
        }
    }

    /// Whether a record stamped `ts` belongs to a period that can still change.
    pub fn is_unfinished(&self, entity: &Entity, ts: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        let period_ts = match self.convention {
            TimestampConvention::PeriodStart => ts,
            TimestampConvention::PeriodEnd => self.level.step_back(ts),
        };
        !self
            .calendar
            .is_period_final(&entity.exchange, self.level, period_ts, now)
    }
}
