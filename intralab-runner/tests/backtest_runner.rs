//! Integration tests for the runner: strategies over candles read back from a
//! real on-disk store.

use chrono::{DateTime, Duration, NaiveDate, NaiveTime, TimeZone, Timelike, Utc};
use chrono_tz::Tz;
use std::collections::HashMap;

use intralab_core::data::CandleStore;
use intralab_core::domain::{Candle, ExitReason, Position, RawCandle, Side, Signal, Timeframe};
use intralab_core::scheduler::{DenyReason, EntryDecision, SchedulerConfig, TradingScheduler};
use intralab_core::strategy::{Strategy, StrategyError};
use intralab_core::broker::{BrokerConfig, OrderSimulator};
use intralab_runner::{BacktestConfig, BacktestRunner, ErrorCode, RunControl, RunRequest};

const SEOUL: Tz = chrono_tz::Asia::Seoul;

/// 2024-01-01 00:00 KST.
fn seoul_midnight() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2023, 12, 31, 15, 0, 0).unwrap()
}

/// `days` of 5m candles from `start` on a slow sine wave with drift.
fn wave(start: DateTime<Utc>, days: i64) -> Vec<RawCandle> {
    (0..days * 288)
        .map(|i| {
            let close = 100.0 + 3.0 * (i as f64 / 20.0).sin() + i as f64 * 0.002;
            RawCandle {
                timestamp: start + Duration::minutes(5 * i),
                open: close - 0.1,
                high: close + 0.4,
                low: close - 0.4,
                close,
                volume: 10.0,
            }
        })
        .collect()
}

fn flat(start: DateTime<Utc>, count: i64) -> Vec<RawCandle> {
    (0..count)
        .map(|i| RawCandle {
            timestamp: start + Duration::minutes(5 * i),
            open: 100.0,
            high: 100.5,
            low: 99.5,
            close: 100.0,
            volume: 1.0,
        })
        .collect()
}

fn seeded_store(dir: &std::path::Path, tz: Tz, candles: &[RawCandle]) -> CandleStore {
    let store = CandleStore::new(dir, tz);
    store.write("BTCUSDT", Timeframe::M5, candles, "fetch").unwrap();
    store
}

const ORB_CONFIG: &str = r#"
[run]
symbol = "BTCUSDT"
timeframe = "5m"
start = "2024-01-01"
end = "2024-01-03"

[scheduler]
timezone = "Asia/Seoul"
entry_start = "09:00:00"
entry_end = "15:00:00"
force_close_start = "15:20:00"
force_close_end = "15:30:00"
max_trades_per_day = 2
strict = true

[strategy]
type = "orb"

[strategy.params]
range_candles = 6
reward_risk = 1.5
"#;

#[test]
fn orb_run_honours_window_quota_and_exclusivity() {
    let dir = tempfile::tempdir().unwrap();
    let store = seeded_store(dir.path(), SEOUL, &wave(seoul_midnight(), 3));
    let config = BacktestConfig::from_toml(ORB_CONFIG).unwrap();
    let mut runner = BacktestRunner::from_config(&config).unwrap();

    let outcome = runner
        .run(&store, &config.request(), &RunControl::default())
        .unwrap();

    assert_eq!(outcome.strategy, "orb");
    assert_eq!(outcome.candles_processed, 3 * 288 - 6);
    assert_eq!(outcome.equity_curve.len(), outcome.candles_processed);
    assert_eq!(outcome.metrics.trade_count, outcome.trades.len());

    let entry_start = NaiveTime::from_hms_opt(9, 0, 0).unwrap();
    let entry_end = NaiveTime::from_hms_opt(15, 0, 0).unwrap();
    let mut per_day: HashMap<NaiveDate, usize> = HashMap::new();
    for trade in &outcome.trades {
        let local_entry = trade.entry_time.with_timezone(&SEOUL);
        assert!(local_entry.time() >= entry_start && local_entry.time() <= entry_end);
        *per_day.entry(local_entry.date_naive()).or_default() += 1;

        if trade.exit_reason == ExitReason::ForcedClose {
            let local_exit = trade.exit_time.with_timezone(&SEOUL);
            assert_eq!(local_exit.hour(), 15);
            assert!((20..=30).contains(&local_exit.minute()));
        }
    }
    assert!(per_day.values().all(|&n| n <= 2));

    // one position at a time
    for pair in outcome.trades.windows(2) {
        assert!(pair[1].entry_time >= pair[0].exit_time);
    }

    let realized: f64 = outcome.trades.iter().map(|t| t.pnl).sum();
    assert!((outcome.metrics.final_equity - (10_000.0 + realized)).abs() < 1e-6);
}

#[test]
fn repeated_runs_are_deterministic() {
    let dir = tempfile::tempdir().unwrap();
    let store = seeded_store(dir.path(), SEOUL, &wave(seoul_midnight(), 3));
    let config = BacktestConfig::from_toml(ORB_CONFIG).unwrap();

    let mut a = BacktestRunner::from_config(&config).unwrap();
    let mut b = BacktestRunner::from_config(&config).unwrap();
    let first = a.run(&store, &config.request(), &RunControl::default()).unwrap();
    let second = b.run(&store, &config.request(), &RunControl::default()).unwrap();
    let again = a.run(&store, &config.request(), &RunControl::default()).unwrap();

    assert_eq!(first.trades, second.trades);
    assert_eq!(first.metrics, second.metrics);
    assert_eq!(first.equity_curve, again.equity_curve);
}

#[test]
fn empty_store_is_no_data() {
    let dir = tempfile::tempdir().unwrap();
    let store = CandleStore::new(dir.path(), SEOUL);
    let config = BacktestConfig::from_toml(ORB_CONFIG).unwrap();
    let mut runner = BacktestRunner::from_config(&config).unwrap();

    let failure = runner
        .run(&store, &config.request(), &RunControl::default())
        .unwrap_err();
    assert_eq!(failure.code, ErrorCode::NoData);
    assert_eq!(failure.symbol, "BTCUSDT");
    assert_eq!(failure.start, config.request().start);
    assert!(failure.elapsed_secs >= 0.0);
}

#[test]
fn candles_outside_the_request_are_ignored() {
    let dir = tempfile::tempdir().unwrap();
    // data lies a week after the requested range
    let store = seeded_store(
        dir.path(),
        SEOUL,
        &wave(seoul_midnight() + Duration::days(7), 1),
    );
    let config = BacktestConfig::from_toml(ORB_CONFIG).unwrap();
    let mut runner = BacktestRunner::from_config(&config).unwrap();
    let failure = runner
        .run(&store, &config.request(), &RunControl::default())
        .unwrap_err();
    assert_eq!(failure.code, ErrorCode::NoData);
}

/// Long signal whenever the candle's local time is listed; closes at `exit_at`.
struct AtLocalTimes {
    entries: Vec<NaiveTime>,
    exit_at: NaiveTime,
}

impl Strategy for AtLocalTimes {
    fn name(&self) -> &str {
        "at_local_times"
    }

    fn warmup(&self) -> usize {
        0
    }

    fn generate_signal(
        &mut self,
        candles: &[Candle],
        index: usize,
    ) -> Result<Option<Signal>, StrategyError> {
        let candle = &candles[index];
        if !self.entries.contains(&candle.local_time.time()) {
            return Ok(None);
        }
        Ok(Some(Signal {
            side: Side::Long,
            entry_price: candle.close,
            stop_loss: candle.close - 2.0,
            take_profit: candle.close + 10.0,
            reason: "scheduled".into(),
            confidence: Some(1.0),
        }))
    }

    fn should_close(
        &mut self,
        candles: &[Candle],
        index: usize,
        _position: &Position,
    ) -> Result<Option<String>, StrategyError> {
        Ok((candles[index].local_time.time() == self.exit_at).then(|| "scheduled exit".into()))
    }
}

#[test]
fn seoul_window_and_quota_scenario() {
    let dir = tempfile::tempdir().unwrap();
    let store = seeded_store(dir.path(), SEOUL, &flat(seoul_midnight(), 288));

    let hm = |h, m| NaiveTime::from_hms_opt(h, m, 0).unwrap();
    let scheduler = TradingScheduler::new(SchedulerConfig {
        timezone: SEOUL,
        entry_start: hm(6, 0),
        entry_end: hm(12, 0),
        force_close_start: None,
        force_close_end: None,
        max_trades_per_day: 1,
        strict: true,
    })
    .unwrap();
    let strategy = AtLocalTimes {
        entries: vec![hm(10, 0), hm(10, 30), hm(14, 0)],
        exit_at: hm(10, 15),
    };
    let broker = OrderSimulator::new(BrokerConfig::default()).unwrap();
    let mut runner = BacktestRunner::new(broker, scheduler, Box::new(strategy));

    let request = RunRequest {
        symbol: "BTCUSDT".into(),
        timeframe: Timeframe::M5,
        start: seoul_midnight(),
        end: seoul_midnight() + Duration::days(1) - Duration::seconds(1),
    };
    let outcome = runner.run(&store, &request, &RunControl::default()).unwrap();

    assert_eq!(outcome.trades.len(), 1);
    let trade = &outcome.trades[0];
    assert_eq!(trade.entry_time.with_timezone(&SEOUL).time(), hm(10, 0));
    assert_eq!(trade.exit_reason, ExitReason::Strategy("scheduled exit".into()));
    assert_eq!(trade.entry_reason, "scheduled");
    assert_eq!(trade.confidence, Some(1.0));

    let at = |h, m| seoul_midnight() + Duration::hours(h) + Duration::minutes(m);
    assert_eq!(
        runner.scheduler().can_enter(at(10, 30), "BTCUSDT"),
        EntryDecision::Denied(DenyReason::QuotaReached { count: 1, max: 1 })
    );
    assert!(matches!(
        runner.scheduler().can_enter(at(14, 0), "BTCUSDT"),
        EntryDecision::Denied(DenyReason::OutsideWindow { .. })
    ));
}
