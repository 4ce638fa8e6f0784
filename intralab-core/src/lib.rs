//! IntraLab Core — candle data, scheduling, order simulation and strategies.
//!
//! This crate contains the building blocks of the intraday backtest engine:
//! - Domain types (candles, signals, positions, trades, timeframes)
//! - Parquet candle store with gap detection and incremental writes
//! - Rate-limited fetcher over a pluggable candle source, with gap backfill
//! - Trading scheduler (entry window, daily quota, forced-close window)
//! - Order simulator (risk sizing, fees, slippage, stop/target evaluation)
//! - Strategy trait and factory

pub mod broker;
pub mod config;
pub mod data;
pub mod domain;
pub mod scheduler;
pub mod strategy;

pub use broker::{BrokerConfig, BrokerError, OpenOrder, OrderSimulator, Rejection, StopHit};
pub use config::ConfigError;
pub use scheduler::{DenyReason, EntryDecision, SchedulerConfig, SchedulerError, TradingScheduler};
pub use strategy::{create_strategy, Strategy, StrategyError};
