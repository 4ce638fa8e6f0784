//! TOML backtest configuration.
//!
//! One document with a section per component:
//!
//! ```toml
//! [run]
//! symbol = "BTCUSDT"
//! timeframe = "5m"
//! start = "2024-01-01"
//! end = "2024-03-31"
//!
//! [scheduler]
//! timezone = "Asia/Seoul"
//! entry_start = "09:00:00"
//! entry_end = "15:00:00"
//! max_trades_per_day = 2
//!
//! [broker]
//! initial_capital = 10000.0
//!
//! [strategy]
//! type = "orb"
//! [strategy.params]
//! range_candles = 6
//!
//! [data]
//! store_dir = "data"
//! ```
//!
//! Every section is validated once by [`BacktestConfig::validate`].

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, NaiveDate, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use intralab_core::broker::BrokerConfig;
use intralab_core::config::ConfigError as SectionError;
use intralab_core::data::FetcherConfig;
use intralab_core::domain::Timeframe;
use intralab_core::scheduler::SchedulerConfig;
use intralab_core::strategy::{create_strategy, Strategy, StrategyError};

use crate::runner::RunRequest;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {message}")]
    Io { path: String, message: String },

    #[error("failed to parse config: {0}")]
    Parse(String),

    #[error(transparent)]
    Invalid(#[from] SectionError),

    #[error("strategy config rejected: {0}")]
    Strategy(#[from] StrategyError),
}

/// Complete configuration of one backtest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BacktestConfig {
    pub run: RunSection,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub broker: BrokerConfig,
    pub strategy: StrategySection,
    #[serde(default)]
    pub data: DataSection,
}

/// What to simulate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSection {
    pub symbol: String,
    pub timeframe: Timeframe,
    /// First local calendar date (scheduler timezone), inclusive.
    pub start: NaiveDate,
    /// Last local calendar date, inclusive.
    pub end: NaiveDate,
    /// Candles between progress updates.
    #[serde(default = "default_progress_every")]
    pub progress_every: usize,
    /// Wall-clock ceiling for one run.
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

fn default_progress_every() -> usize {
    500
}

/// Strategy type key plus flat numeric parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrategySection {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub params: BTreeMap<String, f64>,
}

/// Where candles live and how to fetch more.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DataSection {
    pub store_dir: PathBuf,
    /// Klines REST endpoint base, e.g. `https://api.binance.com/api/v3`.
    pub base_url: String,
    pub source_name: String,
    pub request_timeout_secs: u64,
    /// Slack added to the candle interval before a spacing counts as a gap.
    pub gap_tolerance_secs: i64,
    pub fetcher: FetcherConfig,
}

impl Default for DataSection {
    fn default() -> Self {
        Self {
            store_dir: PathBuf::from("data"),
            base_url: "https://api.binance.com/api/v3".into(),
            source_name: "binance".into(),
            request_timeout_secs: 30,
            gap_tolerance_secs: 0,
            fetcher: FetcherConfig::default(),
        }
    }
}

impl DataSection {
    pub fn gap_tolerance(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.gap_tolerance_secs)
    }
}

impl BacktestConfig {
    pub fn from_toml(s: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(s).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
        Self::from_toml(&content)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.run.symbol.trim().is_empty() {
            return Err(SectionError::new("run", "symbol must not be empty").into());
        }
        if self.run.start > self.run.end {
            return Err(SectionError::new("run", "start must not be after end").into());
        }
        if self.run.progress_every == 0 {
            return Err(SectionError::new("run", "progress_every must be >= 1").into());
        }
        if self.data.gap_tolerance_secs < 0 {
            return Err(SectionError::new("data", "gap_tolerance_secs must be >= 0").into());
        }
        self.scheduler.validate()?;
        self.broker.validate()?;
        self.data.fetcher.validate()?;
        self.build_strategy()?;
        Ok(())
    }

    /// Fresh strategy instance from the `[strategy]` section.
    pub fn build_strategy(&self) -> Result<Box<dyn Strategy>, StrategyError> {
        create_strategy(&self.strategy.kind, &self.strategy.params)
    }

    /// Requested span as UTC instants: local midnight of `start` through the
    /// last second of `end`, in the scheduler's timezone.
    pub fn request(&self) -> RunRequest {
        let tz = self.scheduler.timezone;
        RunRequest {
            symbol: self.run.symbol.clone(),
            timeframe: self.run.timeframe,
            start: local_to_utc(tz, self.run.start, NaiveTime::default()),
            end: local_to_utc(tz, self.run.end, end_of_day()),
        }
    }

    /// BLAKE3 over the engine-relevant sections (scheduler, broker, strategy).
    ///
    /// Two configs with equal hashes build interchangeable engines.
    pub fn engine_hash(&self) -> String {
        let json = serde_json::to_string(&(&self.scheduler, &self.broker, &self.strategy))
            .unwrap_or_default();
        blake3::hash(json.as_bytes()).to_hex().to_string()
    }
}

fn end_of_day() -> NaiveTime {
    NaiveTime::from_hms_opt(23, 59, 59).unwrap_or_default()
}

/// Resolve a local wall-clock time, taking the earlier instant when ambiguous
/// and falling back to reading it as UTC when it does not exist locally.
fn local_to_utc(tz: Tz, date: NaiveDate, time: NaiveTime) -> DateTime<Utc> {
    let naive = date.and_time(time);
    tz.from_local_datetime(&naive)
        .earliest()
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|| naive.and_utc())
}
