//! Backtest runner — the candle-by-candle simulation loop.
//!
//! One [`BacktestRunner`] owns one broker, one scheduler and one strategy.
//! `run` never lets an expected failure escape: every outcome is either a
//! [`RunOutcome`] or a classified [`RunFailure`]. The single exception is a
//! strict-mode quota violation, which panics because it means the loop itself
//! admitted an entry the scheduler had refused.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, trace, warn};

use intralab_core::broker::{BrokerError, OpenOrder, OrderSimulator};
use intralab_core::data::CandleStore;
use intralab_core::domain::{Candle, ExitReason, Timeframe, Trade};
use intralab_core::scheduler::{EntryDecision, TradingScheduler};
use intralab_core::strategy::{Strategy, StrategyError};

use crate::config::{BacktestConfig, ConfigError};
use crate::metrics::{EquitySample, MetricsEngine, PerformanceMetrics};

/// Current schema version for persisted artifacts.
pub const SCHEMA_VERSION: u32 = 1;

fn default_schema_version() -> u32 {
    SCHEMA_VERSION
}

// ─── Request / result types ─────────────────────────────────────────

/// One (symbol, timeframe, UTC range) to simulate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRequest {
    pub symbol: String,
    pub timeframe: Timeframe,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

/// Classification of a failed run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// No candles in the requested range. Recoverable by updating data.
    NoData,
    /// Metrics could not be computed from the trades.
    MetricsNone,
    /// Metrics were computed but failed their shape check.
    InvalidMetrics,
    /// Strategy error, store failure or any other unexpected condition.
    Exception,
    Cancelled,
    Timeout,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::NoData => "NO_DATA",
            ErrorCode::MetricsNone => "METRICS_NONE",
            ErrorCode::InvalidMetrics => "INVALID_METRICS",
            ErrorCode::Exception => "EXCEPTION",
            ErrorCode::Cancelled => "CANCELLED",
            ErrorCode::Timeout => "TIMEOUT",
        }
    }

    /// Human-readable headline.
    pub fn title(&self) -> &'static str {
        match self {
            ErrorCode::NoData => "No data for the requested range",
            ErrorCode::MetricsNone => "Metrics could not be computed",
            ErrorCode::InvalidMetrics => "Metrics failed validation",
            ErrorCode::Exception => "Backtest failed",
            ErrorCode::Cancelled => "Backtest cancelled",
            ErrorCode::Timeout => "Backtest timed out",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structured error result of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Error)]
#[error("{code} ({symbol} {start}..{end}): {message}")]
pub struct RunFailure {
    pub code: ErrorCode,
    pub title: String,
    pub message: String,
    pub symbol: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub elapsed_secs: f64,
}

impl RunFailure {
    fn new(code: ErrorCode, message: impl Into<String>, request: &RunRequest, started: Instant) -> Self {
        Self {
            code,
            title: code.title().to_string(),
            message: message.into(),
            symbol: request.symbol.clone(),
            start: request.start,
            end: request.end,
            elapsed_secs: started.elapsed().as_secs_f64(),
        }
    }
}

/// Complete result of a successful run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunOutcome {
    #[serde(default = "default_schema_version")]
    pub schema_version: u32,
    pub symbol: String,
    pub timeframe: Timeframe,
    pub strategy: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub trades: Vec<Trade>,
    pub metrics: PerformanceMetrics,
    pub equity_curve: Vec<EquitySample>,
    pub candles_processed: usize,
    pub elapsed_secs: f64,
}

// ─── Progress and control ───────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStage {
    Loading,
    Simulating,
    Metrics,
    Complete,
}

impl fmt::Display for RunStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RunStage::Loading => "loading",
            RunStage::Simulating => "simulating",
            RunStage::Metrics => "metrics",
            RunStage::Complete => "complete",
        })
    }
}

/// Progress snapshot delivered to observers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunProgress {
    pub stage: RunStage,
    pub message: String,
    /// 0.0 to 100.0 over the whole run.
    pub percent: f64,
    pub candles_processed: usize,
    pub total_candles: usize,
    pub trades_count: usize,
}

/// Receives progress updates. Purely observational.
pub trait ProgressObserver: Send + Sync {
    fn on_progress(&self, progress: &RunProgress);
}

impl<F> ProgressObserver for F
where
    F: Fn(&RunProgress) + Send + Sync,
{
    fn on_progress(&self, progress: &RunProgress) {
        self(progress)
    }
}

/// Shared cooperative cancellation flag.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// Cancellation, deadline and progress reporting for one run.
#[derive(Clone)]
pub struct RunControl {
    pub cancel: CancelToken,
    pub deadline: Option<Instant>,
    pub observer: Option<Arc<dyn ProgressObserver>>,
    /// Candles between `simulating` updates.
    pub progress_every: usize,
}

impl Default for RunControl {
    fn default() -> Self {
        Self {
            cancel: CancelToken::new(),
            deadline: None,
            observer: None,
            progress_every: 500,
        }
    }
}

impl fmt::Debug for RunControl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunControl")
            .field("cancel", &self.cancel)
            .field("deadline", &self.deadline)
            .field("observer", &self.observer.is_some())
            .field("progress_every", &self.progress_every)
            .finish()
    }
}

impl RunControl {
    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Deadline `timeout` from now.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.deadline = Some(Instant::now() + timeout);
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn ProgressObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn with_progress_every(mut self, every: usize) -> Self {
        self.progress_every = every.max(1);
        self
    }

    fn checkpoint(&self) -> Result<(), LoopError> {
        if self.cancel.is_cancelled() {
            return Err(LoopError::Cancelled);
        }
        if self.deadline.is_some_and(|d| Instant::now() >= d) {
            return Err(LoopError::Timeout);
        }
        Ok(())
    }

    fn emit(&self, progress: RunProgress) {
        if let Some(observer) = &self.observer {
            observer.on_progress(&progress);
        }
    }
}

/// Why the candle loop stopped early.
#[derive(Debug, Error)]
enum LoopError {
    #[error("strategy error: {0}")]
    Strategy(#[from] StrategyError),
    #[error("broker error: {0}")]
    Broker(#[from] BrokerError),
    #[error("cancelled")]
    Cancelled,
    #[error("deadline exceeded")]
    Timeout,
}

impl LoopError {
    fn code(&self) -> ErrorCode {
        match self {
            LoopError::Strategy(_) | LoopError::Broker(_) => ErrorCode::Exception,
            LoopError::Cancelled => ErrorCode::Cancelled,
            LoopError::Timeout => ErrorCode::Timeout,
        }
    }
}

// ─── Runner ─────────────────────────────────────────────────────────

/// Per-run engine: broker, scheduler, strategy and metrics.
///
/// Not shareable across threads; concurrent runs each own a runner.
pub struct BacktestRunner {
    broker: OrderSimulator,
    scheduler: TradingScheduler,
    strategy: Box<dyn Strategy>,
    metrics: MetricsEngine,
}

impl fmt::Debug for BacktestRunner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BacktestRunner")
            .field("strategy", &self.strategy.name())
            .field("equity", &self.broker.equity())
            .finish()
    }
}

impl BacktestRunner {
    pub fn new(broker: OrderSimulator, scheduler: TradingScheduler, strategy: Box<dyn Strategy>) -> Self {
        let metrics = MetricsEngine::new(broker.config().initial_capital, scheduler.config().timezone);
        Self {
            broker,
            scheduler,
            strategy,
            metrics,
        }
    }

    pub fn from_config(config: &BacktestConfig) -> Result<Self, ConfigError> {
        let broker = OrderSimulator::new(config.broker.clone())?;
        let scheduler = TradingScheduler::new(config.scheduler.clone())?;
        let strategy = config.build_strategy()?;
        Ok(Self::new(broker, scheduler, strategy))
    }

    pub fn strategy_name(&self) -> &str {
        self.strategy.name()
    }

    pub fn broker(&self) -> &OrderSimulator {
        &self.broker
    }

    pub fn scheduler(&self) -> &TradingScheduler {
        &self.scheduler
    }

    /// Back to initial capital, empty counters, fresh strategy state.
    pub fn reset(&mut self) {
        self.broker.reset();
        self.scheduler.reset();
        self.strategy.reset();
    }

    /// Load the request's candles from `store` and simulate them.
    pub fn run(
        &mut self,
        store: &CandleStore,
        request: &RunRequest,
        control: &RunControl,
    ) -> Result<RunOutcome, RunFailure> {
        let started = Instant::now();
        info!(
            symbol = %request.symbol,
            timeframe = %request.timeframe,
            strategy = self.strategy.name(),
            start = %request.start,
            end = %request.end,
            "backtest started"
        );
        control.emit(RunProgress {
            stage: RunStage::Loading,
            message: format!("loading {} {} candles", request.symbol, request.timeframe),
            percent: 0.0,
            candles_processed: 0,
            total_candles: 0,
            trades_count: 0,
        });

        let candles = store
            .read_range(&request.symbol, request.timeframe, request.start, request.end)
            .map_err(|e| self.fail(ErrorCode::Exception, e.to_string(), request, started))?;

        self.simulate(request, &candles, control, started)
    }

    /// Simulate pre-loaded candles, ascending by timestamp.
    pub fn run_candles(
        &mut self,
        request: &RunRequest,
        candles: &[Candle],
        control: &RunControl,
    ) -> Result<RunOutcome, RunFailure> {
        self.simulate(request, candles, control, Instant::now())
    }

    fn simulate(
        &mut self,
        request: &RunRequest,
        candles: &[Candle],
        control: &RunControl,
        started: Instant,
    ) -> Result<RunOutcome, RunFailure> {
        if candles.is_empty() {
            let message = format!(
                "no {} candles for {} between {} and {}",
                request.timeframe, request.symbol, request.start, request.end
            );
            return Err(self.fail(ErrorCode::NoData, message, request, started));
        }
        if let Err(e) = control.checkpoint() {
            return Err(self.fail(e.code(), e.to_string(), request, started));
        }

        self.reset();
        let (equity_curve, processed) = match self.candle_loop(&request.symbol, candles, control) {
            Ok(result) => result,
            Err(e) => return Err(self.fail(e.code(), e.to_string(), request, started)),
        };
        let trades = self.broker.take_trades();

        control.emit(RunProgress {
            stage: RunStage::Metrics,
            message: format!("computing metrics over {} trades", trades.len()),
            percent: 95.0,
            candles_processed: processed,
            total_candles: candles.len(),
            trades_count: trades.len(),
        });
        let metrics = self
            .metrics
            .compute(&trades, &equity_curve)
            .map_err(|e| self.fail(ErrorCode::MetricsNone, e.to_string(), request, started))?;
        metrics
            .validate()
            .map_err(|e| self.fail(ErrorCode::InvalidMetrics, e.to_string(), request, started))?;

        let elapsed_secs = started.elapsed().as_secs_f64();
        control.emit(RunProgress {
            stage: RunStage::Complete,
            message: format!("{} trades, return {:.2}%", trades.len(), metrics.total_return_pct),
            percent: 100.0,
            candles_processed: processed,
            total_candles: candles.len(),
            trades_count: trades.len(),
        });
        info!(
            symbol = %request.symbol,
            trades = trades.len(),
            final_equity = metrics.final_equity,
            elapsed_secs,
            "backtest complete"
        );

        Ok(RunOutcome {
            schema_version: SCHEMA_VERSION,
            symbol: request.symbol.clone(),
            timeframe: request.timeframe,
            strategy: self.strategy.name().to_string(),
            start: request.start,
            end: request.end,
            trades,
            metrics,
            equity_curve,
            candles_processed: processed,
            elapsed_secs,
        })
    }

    /// Returns the equity curve and the number of candles stepped through.
    fn candle_loop(
        &mut self,
        symbol: &str,
        candles: &[Candle],
        control: &RunControl,
    ) -> Result<(Vec<EquitySample>, usize), LoopError> {
        let total = candles.len();
        let warmup = self.strategy.warmup().min(total);
        let every = control.progress_every.max(1);
        let mut curve = Vec::with_capacity(total - warmup);
        let mut processed = 0usize;

        for index in warmup..total {
            control.checkpoint()?;
            let candle = &candles[index];
            let ts = candle.timestamp;
            curve.push(EquitySample {
                timestamp: ts,
                equity: self.broker.equity(),
            });

            if self.broker.has_position() {
                if let Some(hit) = self.broker.check_stops(candle) {
                    self.broker.close(ts, hit.price, hit.reason)?;
                    processed += 1;
                    continue;
                }
                if let Some(reason) = self.scheduler.should_force_close(ts) {
                    debug!(symbol, %ts, %reason, "force close");
                    self.broker.close(ts, candle.close, ExitReason::ForcedClose)?;
                    processed += 1;
                    continue;
                }
                let exit = match self.broker.position() {
                    Some(position) => self.strategy.should_close(candles, index, position)?,
                    None => None,
                };
                if let Some(reason) = exit {
                    self.broker.close(ts, candle.close, ExitReason::Strategy(reason))?;
                }
            }

            if !self.broker.has_position() {
                match self.scheduler.can_enter(ts, symbol) {
                    EntryDecision::Allowed => self.try_enter(symbol, candles, index)?,
                    EntryDecision::Denied(reason) => trace!(symbol, %ts, %reason, "entry denied"),
                }
            }

            processed += 1;
            if processed % every == 0 {
                let trades_count = self.broker.trades().len();
                control.emit(RunProgress {
                    stage: RunStage::Simulating,
                    message: format!("{processed}/{} candles, {trades_count} trades", total - warmup),
                    percent: 5.0 + 90.0 * processed as f64 / (total - warmup).max(1) as f64,
                    candles_processed: processed,
                    total_candles: total,
                    trades_count,
                });
            }
        }

        if self.broker.has_position() {
            if let Some(last) = candles.last() {
                self.broker.close(last.timestamp, last.close, ExitReason::BacktestEnd)?;
            }
        }
        Ok((curve, processed))
    }

    fn try_enter(&mut self, symbol: &str, candles: &[Candle], index: usize) -> Result<(), LoopError> {
        let Some(signal) = self.strategy.generate_signal(candles, index)? else {
            return Ok(());
        };
        let ts = candles[index].timestamp;
        match self.broker.open(OpenOrder::from_signal(symbol, ts, &signal)) {
            Ok(_) => {
                self.strategy.on_entry(candles, index);
                if let Err(violation) = self.scheduler.register_trade(ts, symbol) {
                    // can_enter admitted this entry, so the loop itself is broken
                    panic!("{violation}");
                }
            }
            Err(rejection) => debug!(symbol, %ts, %rejection, "entry rejected"),
        }
        Ok(())
    }

    fn fail(&self, code: ErrorCode, message: String, request: &RunRequest, started: Instant) -> RunFailure {
        let failure = RunFailure::new(code, message, request, started);
        warn!(
            symbol = %request.symbol,
            code = %failure.code,
            message = %failure.message,
            "backtest failed"
        );
        failure
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration as ChronoDuration, NaiveTime, TimeZone};
    use intralab_core::broker::BrokerConfig;
    use intralab_core::domain::{Position, Side, Signal};
    use intralab_core::scheduler::SchedulerConfig;
    use std::sync::Mutex;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 4, 0, 0, 0).unwrap()
    }

    /// 5m UTC candles with `high = close + 0.5`, `low = close - 0.5`.
    fn candles(closes: &[f64]) -> Vec<Candle> {
        closes
            .iter()
            .enumerate()
            .map(|(i, &close)| {
                let ts = t0() + ChronoDuration::minutes(5 * i as i64);
                Candle {
                    timestamp: ts,
                    local_time: ts.fixed_offset(),
                    open: close,
                    high: close + 0.5,
                    low: close - 0.5,
                    close,
                    volume: 1.0,
                    source: "test".into(),
                    updated_at: ts,
                }
            })
            .collect()
    }

    /// Goes long at the listed indices with a 2-point stop and 10-point target.
    struct Scripted {
        entries: Vec<usize>,
        exits: Vec<usize>,
        fail_at: Option<usize>,
    }

    impl Strategy for Scripted {
        fn name(&self) -> &str {
            "scripted"
        }
        fn warmup(&self) -> usize {
            0
        }
        fn generate_signal(&mut self, candles: &[Candle], index: usize) -> Result<Option<Signal>, StrategyError> {
            if self.fail_at == Some(index) {
                return Err(StrategyError::Evaluation("boom".into()));
            }
            if !self.entries.contains(&index) {
                return Ok(None);
            }
            let close = candles[index].close;
            Ok(Some(Signal {
                side: Side::Long,
                entry_price: close,
                stop_loss: close - 2.0,
                take_profit: close + 10.0,
                reason: "scripted".into(),
                confidence: None,
            }))
        }
        fn should_close(
            &mut self,
            _candles: &[Candle],
            index: usize,
            _position: &Position,
        ) -> Result<Option<String>, StrategyError> {
            Ok(self.exits.contains(&index).then(|| "scripted exit".to_string()))
        }
    }

    fn runner(strategy: Scripted, scheduler: SchedulerConfig) -> BacktestRunner {
        let broker = OrderSimulator::new(BrokerConfig {
            fee_rate: 0.0,
            slippage_pct: 0.0,
            ..BrokerConfig::default()
        })
        .unwrap();
        BacktestRunner::new(broker, TradingScheduler::new(scheduler).unwrap(), Box::new(strategy))
    }

    fn request() -> RunRequest {
        RunRequest {
            symbol: "BTCUSDT".into(),
            timeframe: Timeframe::M5,
            start: t0(),
            end: t0() + ChronoDuration::days(1),
        }
    }

    #[test]
    fn open_position_is_closed_at_backtest_end() {
        let mut r = runner(
            Scripted { entries: vec![1], exits: vec![], fail_at: None },
            SchedulerConfig::default(),
        );
        let outcome = r
            .run_candles(&request(), &candles(&[100.0, 100.0, 101.0, 103.0]), &RunControl::default())
            .unwrap();
        assert_eq!(outcome.trades.len(), 1);
        let trade = &outcome.trades[0];
        assert_eq!(trade.exit_reason, ExitReason::BacktestEnd);
        assert_eq!(trade.exit_price, 103.0);
        assert_eq!(outcome.equity_curve.len(), 4);
        assert_eq!(outcome.candles_processed, 4);
    }

    #[test]
    fn stop_is_checked_before_strategy_exit() {
        // entry at 100, stop 98; candle 2 low = 97.5
        let mut r = runner(
            Scripted { entries: vec![0], exits: vec![2], fail_at: None },
            SchedulerConfig::default(),
        );
        let outcome = r
            .run_candles(&request(), &candles(&[100.0, 100.0, 98.0, 99.0]), &RunControl::default())
            .unwrap();
        assert_eq!(outcome.trades[0].exit_reason, ExitReason::StopLoss);
        assert_eq!(outcome.trades[0].exit_price, 98.0);
    }

    #[test]
    fn strategy_exit_then_reentry_on_same_candle() {
        let mut r = runner(
            Scripted { entries: vec![0, 2], exits: vec![2], fail_at: None },
            SchedulerConfig::default(),
        );
        let outcome = r
            .run_candles(&request(), &candles(&[100.0, 100.5, 101.0, 101.0]), &RunControl::default())
            .unwrap();
        assert_eq!(outcome.trades.len(), 2);
        assert_eq!(
            outcome.trades[0].exit_reason,
            ExitReason::Strategy("scripted exit".into())
        );
        assert_eq!(outcome.trades[1].entry_time, outcome.trades[0].exit_time);
    }

    #[test]
    fn quota_limits_entries() {
        let config = SchedulerConfig {
            max_trades_per_day: 1,
            ..SchedulerConfig::default()
        };
        let mut r = runner(
            Scripted { entries: vec![0, 2], exits: vec![1], fail_at: None },
            config,
        );
        let outcome = r
            .run_candles(&request(), &candles(&[100.0, 100.0, 100.0, 100.0]), &RunControl::default())
            .unwrap();
        assert_eq!(outcome.trades.len(), 1);
    }

    #[test]
    fn force_close_window_closes_position() {
        let config = SchedulerConfig {
            force_close_start: NaiveTime::from_hms_opt(0, 10, 0),
            force_close_end: NaiveTime::from_hms_opt(0, 20, 0),
            ..SchedulerConfig::default()
        };
        let mut r = runner(
            Scripted { entries: vec![0], exits: vec![], fail_at: None },
            config,
        );
        let outcome = r
            .run_candles(&request(), &candles(&[100.0, 100.0, 101.0, 101.0]), &RunControl::default())
            .unwrap();
        assert_eq!(outcome.trades[0].exit_reason, ExitReason::ForcedClose);
        assert_eq!(outcome.trades[0].exit_time, t0() + ChronoDuration::minutes(10));
    }

    #[test]
    fn empty_range_is_no_data() {
        let mut r = runner(
            Scripted { entries: vec![], exits: vec![], fail_at: None },
            SchedulerConfig::default(),
        );
        let failure = r.run_candles(&request(), &[], &RunControl::default()).unwrap_err();
        assert_eq!(failure.code, ErrorCode::NoData);
        assert_eq!(failure.title, ErrorCode::NoData.title());
        assert_eq!(failure.symbol, "BTCUSDT");
    }

    #[test]
    fn strategy_error_is_exception() {
        let mut r = runner(
            Scripted { entries: vec![], exits: vec![], fail_at: Some(1) },
            SchedulerConfig::default(),
        );
        let failure = r
            .run_candles(&request(), &candles(&[100.0, 100.0]), &RunControl::default())
            .unwrap_err();
        assert_eq!(failure.code, ErrorCode::Exception);
        assert!(failure.message.contains("boom"));
    }

    #[test]
    fn cancelled_token_stops_run() {
        let mut r = runner(
            Scripted { entries: vec![], exits: vec![], fail_at: None },
            SchedulerConfig::default(),
        );
        let control = RunControl::default();
        control.cancel.cancel();
        let failure = r
            .run_candles(&request(), &candles(&[100.0, 100.0]), &control)
            .unwrap_err();
        assert_eq!(failure.code, ErrorCode::Cancelled);
    }

    #[test]
    fn expired_deadline_is_timeout() {
        let mut r = runner(
            Scripted { entries: vec![], exits: vec![], fail_at: None },
            SchedulerConfig::default(),
        );
        let control = RunControl::default().with_timeout(Duration::ZERO);
        let failure = r
            .run_candles(&request(), &candles(&[100.0, 100.0]), &control)
            .unwrap_err();
        assert_eq!(failure.code, ErrorCode::Timeout);
    }

    #[test]
    fn progress_reports_every_stage() {
        let seen: Arc<Mutex<Vec<RunStage>>> = Arc::default();
        let sink = seen.clone();
        let control = RunControl::default()
            .with_progress_every(2)
            .with_observer(Arc::new(move |p: &RunProgress| {
                sink.lock().unwrap().push(p.stage);
            }));
        let mut r = runner(
            Scripted { entries: vec![], exits: vec![], fail_at: None },
            SchedulerConfig::default(),
        );
        r.run_candles(&request(), &candles(&[100.0; 5]), &control).unwrap();
        assert_eq!(
            *seen.lock().unwrap(),
            vec![
                RunStage::Simulating,
                RunStage::Simulating,
                RunStage::Metrics,
                RunStage::Complete
            ]
        );
    }

    #[test]
    fn runner_is_reusable_after_a_run() {
        let mut r = runner(
            Scripted { entries: vec![0], exits: vec![], fail_at: None },
            SchedulerConfig::default(),
        );
        let data = candles(&[100.0, 101.0, 102.0]);
        let first = r.run_candles(&request(), &data, &RunControl::default()).unwrap();
        let second = r.run_candles(&request(), &data, &RunControl::default()).unwrap();
        assert_eq!(first.trades, second.trades);
        assert_eq!(first.metrics, second.metrics);
    }

    #[test]
    #[should_panic(expected = "trade quota violated")]
    fn strict_quota_overrun_in_entry_path_panics() {
        let config = SchedulerConfig {
            max_trades_per_day: 1,
            strict: true,
            ..SchedulerConfig::default()
        };
        let mut r = runner(
            Scripted { entries: vec![0], exits: vec![], fail_at: None },
            config,
        );
        // the day's only slot is already used, so registering this entry overruns it
        r.scheduler.register_trade(t0(), "BTCUSDT").unwrap();
        let bars = candles(&[100.0, 100.0]);
        let _ = r.try_enter("BTCUSDT", &bars, 0);
    }

    /// Signals at every listed index; a zero stop distance is rejected by the broker.
    struct RecordsEntries {
        stops: Vec<(usize, f64)>,
        entered: Arc<Mutex<Vec<usize>>>,
    }

    impl Strategy for RecordsEntries {
        fn name(&self) -> &str {
            "records_entries"
        }
        fn warmup(&self) -> usize {
            0
        }
        fn generate_signal(&mut self, candles: &[Candle], index: usize) -> Result<Option<Signal>, StrategyError> {
            let Some(&(_, distance)) = self.stops.iter().find(|(i, _)| *i == index) else {
                return Ok(None);
            };
            let close = candles[index].close;
            Ok(Some(Signal {
                side: Side::Long,
                entry_price: close,
                stop_loss: close - distance,
                take_profit: close + 10.0,
                reason: "recorded".into(),
                confidence: None,
            }))
        }
        fn should_close(
            &mut self,
            _candles: &[Candle],
            _index: usize,
            _position: &Position,
        ) -> Result<Option<String>, StrategyError> {
            Ok(None)
        }
        fn on_entry(&mut self, _candles: &[Candle], index: usize) {
            self.entered.lock().unwrap().push(index);
        }
    }

    #[test]
    fn only_filled_entries_reach_the_strategy_hook() {
        let entered: Arc<Mutex<Vec<usize>>> = Arc::default();
        let strategy = RecordsEntries {
            stops: vec![(1, 0.0), (2, 2.0)],
            entered: entered.clone(),
        };
        let broker = OrderSimulator::new(BrokerConfig {
            fee_rate: 0.0,
            slippage_pct: 0.0,
            ..BrokerConfig::default()
        })
        .unwrap();
        let scheduler = TradingScheduler::new(SchedulerConfig::default()).unwrap();
        let mut r = BacktestRunner::new(broker, scheduler, Box::new(strategy));

        let bars = candles(&[100.0, 100.0, 100.0, 100.0]);
        let outcome = r.run_candles(&request(), &bars, &RunControl::default()).unwrap();

        assert_eq!(*entered.lock().unwrap(), vec![2]);
        assert_eq!(outcome.trades.len(), 1);
        assert_eq!(outcome.trades[0].entry_time, bars[2].timestamp);
        assert_eq!(r.scheduler().trades_today(bars[2].timestamp, "BTCUSDT"), 1);
    }

    #[test]
    fn error_code_serializes_screaming_snake() {
        let json = serde_json::to_string(&ErrorCode::InvalidMetrics).unwrap();
        assert_eq!(json, "\"INVALID_METRICS\"");
    }
}
