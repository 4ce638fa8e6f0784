//! IntraLab Runner — backtest orchestration, metrics, engine pool and export.
//!
//! This crate builds on `intralab-core` to provide:
//! - TOML backtest configuration
//! - The candle-by-candle run loop with classified failures
//! - Performance metrics over trades and the equity curve
//! - Keyed engine reuse and a bounded pool for concurrent runs
//! - Trade log, equity curve and JSON artifacts

pub mod config;
pub mod export;
pub mod metrics;
pub mod pool;
pub mod runner;

pub use config::{BacktestConfig, ConfigError, DataSection, RunSection, StrategySection};
pub use metrics::{DailyPnlStats, EquitySample, MetricsEngine, MetricsError, PerformanceMetrics};
pub use pool::{EngineKey, EnginePool, PoolError, RunHandle, RunJob, RunPool};
pub use runner::{
    BacktestRunner, CancelToken, ErrorCode, ProgressObserver, RunControl, RunFailure, RunOutcome,
    RunProgress, RunRequest, RunStage, SCHEMA_VERSION,
};

#[cfg(test)]
mod send_sync_checks {
    use super::*;

    fn assert_send<T: Send>() {}
    fn assert_sync<T: Sync>() {}

    #[test]
    fn results_are_send_sync() {
        assert_send::<RunOutcome>();
        assert_sync::<RunOutcome>();
        assert_send::<RunFailure>();
        assert_sync::<RunFailure>();
        assert_send::<PerformanceMetrics>();
        assert_sync::<PerformanceMetrics>();
    }

    #[test]
    fn config_is_send_sync() {
        assert_send::<BacktestConfig>();
        assert_sync::<BacktestConfig>();
    }

    #[test]
    fn runner_moves_between_threads() {
        assert_send::<BacktestRunner>();
        assert_send::<RunControl>();
        assert_sync::<RunControl>();
    }

    #[test]
    fn pools_are_shareable() {
        assert_send::<EnginePool>();
        assert_sync::<EnginePool>();
        assert_send::<RunPool>();
        assert_sync::<RunPool>();
        assert_send::<RunHandle>();
    }
}
