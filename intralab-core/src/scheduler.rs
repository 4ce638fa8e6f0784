//! Trading scheduler: local-time entry window, per-day trade quota and
//! forced-close window.
//!
//! All decisions project the event's UTC timestamp into the configured zone.
//! Windows are inclusive on both ends and may wrap past midnight
//! (`start > end`). The day boundary is the local calendar date.

use crate::config::{ensure, ConfigError};
use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// IANA zone used for windows and the day boundary.
    pub timezone: Tz,
    pub entry_start: NaiveTime,
    pub entry_end: NaiveTime,
    pub force_close_start: Option<NaiveTime>,
    pub force_close_end: Option<NaiveTime>,
    pub max_trades_per_day: u32,
    /// Treat a quota overrun in `register_trade` as a defect.
    pub strict: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            timezone: Tz::UTC,
            entry_start: NaiveTime::default(),
            entry_end: NaiveTime::from_hms_opt(23, 59, 59).unwrap_or_default(),
            force_close_start: None,
            force_close_end: None,
            max_trades_per_day: 3,
            strict: false,
        }
    }
}

impl SchedulerConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        ensure(
            self.entry_start != self.entry_end,
            "scheduler",
            "entry_start and entry_end must differ",
        )?;
        ensure(
            self.force_close_window().map_or(true, |(start, end)| start != end),
            "scheduler",
            "force_close_start and force_close_end must differ",
        )?;
        ensure(
            self.force_close_start.is_some() == self.force_close_end.is_some(),
            "scheduler",
            "force_close_start and force_close_end must be set together",
        )?;
        ensure(
            self.max_trades_per_day >= 1,
            "scheduler",
            "max_trades_per_day must be >= 1",
        )
    }

    fn force_close_window(&self) -> Option<(NaiveTime, NaiveTime)> {
        self.force_close_start.zip(self.force_close_end)
    }
}

/// Why an entry was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DenyReason {
    OutsideWindow { local_time: NaiveTime },
    QuotaReached { count: u32, max: u32 },
}

impl fmt::Display for DenyReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DenyReason::OutsideWindow { local_time } => {
                write!(f, "outside entry window (local {})", local_time.format("%H:%M:%S"))
            }
            DenyReason::QuotaReached { count, max } => {
                write!(f, "daily trade quota reached ({count}/{max})")
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryDecision {
    Allowed,
    Denied(DenyReason),
}

impl EntryDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, EntryDecision::Allowed)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SchedulerError {
    #[error("trade quota violated for {symbol} on {date}: {count} trades > max {max}")]
    QuotaViolation {
        symbol: String,
        date: NaiveDate,
        count: u32,
        max: u32,
    },
}

/// Per-symbol counter for one local calendar date.
#[derive(Debug, Clone, Copy)]
struct DayCount {
    date: NaiveDate,
    count: u32,
}

#[derive(Debug, Clone)]
pub struct TradingScheduler {
    config: SchedulerConfig,
    counts: HashMap<String, DayCount>,
}

impl TradingScheduler {
    pub fn new(config: SchedulerConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            config,
            counts: HashMap::new(),
        })
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn local_time(&self, utc: DateTime<Utc>) -> DateTime<Tz> {
        utc.with_timezone(&self.config.timezone)
    }

    /// Trades registered for `symbol` on the local date of `utc`.
    pub fn trades_today(&self, utc: DateTime<Utc>, symbol: &str) -> u32 {
        let date = self.local_time(utc).date_naive();
        match self.counts.get(symbol) {
            Some(day) if day.date == date => day.count,
            _ => 0,
        }
    }

    pub fn can_enter(&self, utc: DateTime<Utc>, symbol: &str) -> EntryDecision {
        let local = self.local_time(utc).time();
        if !in_window(local, self.config.entry_start, self.config.entry_end) {
            return EntryDecision::Denied(DenyReason::OutsideWindow { local_time: local });
        }
        let count = self.trades_today(utc, symbol);
        if count >= self.config.max_trades_per_day {
            return EntryDecision::Denied(DenyReason::QuotaReached {
                count,
                max: self.config.max_trades_per_day,
            });
        }
        EntryDecision::Allowed
    }

    /// Count a new trade for the local date of `utc`; returns the new count.
    ///
    /// In strict mode, exceeding the daily maximum is an error: callers are
    /// expected to have checked `can_enter` first.
    pub fn register_trade(&mut self, utc: DateTime<Utc>, symbol: &str) -> Result<u32, SchedulerError> {
        let date = self.local_time(utc).date_naive();
        let day = self
            .counts
            .entry(symbol.to_string())
            .or_insert(DayCount { date, count: 0 });
        if day.date != date {
            *day = DayCount { date, count: 0 };
        }
        day.count += 1;
        let count = day.count;

        let max = self.config.max_trades_per_day;
        if count > max {
            if self.config.strict {
                return Err(SchedulerError::QuotaViolation {
                    symbol: symbol.to_string(),
                    date,
                    count,
                    max,
                });
            }
            debug!(symbol, %date, count, max, "trade quota exceeded (non-strict)");
        }
        Ok(count)
    }

    /// Reason string when `utc` falls inside the forced-close window.
    pub fn should_force_close(&self, utc: DateTime<Utc>) -> Option<String> {
        let (start, end) = self.config.force_close_window()?;
        let local = self.local_time(utc).time();
        in_window(local, start, end).then(|| {
            format!(
                "forced close window {}-{}",
                start.format("%H:%M"),
                end.format("%H:%M")
            )
        })
    }

    /// Forget all counters.
    pub fn reset(&mut self) {
        self.counts.clear();
    }
}

/// Inclusive window test; `start > end` wraps past midnight.
fn in_window(t: NaiveTime, start: NaiveTime, end: NaiveTime) -> bool {
    if start <= end {
        t >= start && t <= end
    } else {
        t >= start || t <= end
    }
}
