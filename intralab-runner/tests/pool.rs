//! Integration tests for concurrent runs on the bounded pool.

use chrono::{DateTime, Duration, TimeZone, Utc};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};

use intralab_core::data::CandleStore;
use intralab_core::domain::{RawCandle, Timeframe};
use intralab_runner::{
    BacktestConfig, BacktestRunner, EngineKey, ErrorCode, PoolError, ProgressObserver, RunControl,
    RunJob, RunPool, RunProgress, RunStage,
};

fn start() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
}

fn seed(store: &CandleStore, symbol: &str, phase: f64) {
    let candles: Vec<RawCandle> = (0..2 * 288)
        .map(|i| {
            let close = 100.0 + 4.0 * ((i as f64 + phase) / 15.0).sin();
            RawCandle {
                timestamp: start() + Duration::minutes(5 * i),
                open: close,
                high: close + 0.3,
                low: close - 0.3,
                close,
                volume: 5.0,
            }
        })
        .collect();
    store.write(symbol, Timeframe::M5, &candles, "fetch").unwrap();
}

fn config(symbol: &str, strategy: &str, extra_run: &str) -> BacktestConfig {
    BacktestConfig::from_toml(&format!(
        r#"
[run]
symbol = "{symbol}"
timeframe = "5m"
start = "2024-01-01"
end = "2024-01-02"
{extra_run}

[strategy]
type = "{strategy}"
"#
    ))
    .unwrap()
}

fn shared_store() -> (tempfile::TempDir, Arc<CandleStore>) {
    let dir = tempfile::tempdir().unwrap();
    let store = CandleStore::new(dir.path(), chrono_tz::UTC);
    seed(&store, "BTCUSDT", 0.0);
    seed(&store, "ETHUSDT", 7.0);
    (dir, Arc::new(store))
}

#[test]
fn concurrent_runs_match_sequential_runs() {
    let (_dir, store) = shared_store();
    let pool = RunPool::new(3, 2).unwrap();
    let configs = vec![
        config("BTCUSDT", "momentum", ""),
        config("ETHUSDT", "momentum", ""),
        config("BTCUSDT", "orb", ""),
        config("ETHUSDT", "orb", ""),
    ];

    let handles: Vec<_> = configs
        .iter()
        .map(|c| {
            pool.submit(RunJob {
                config: c.clone(),
                store: store.clone(),
                observer: None,
            })
            .unwrap()
        })
        .collect();

    for (config, handle) in configs.iter().zip(handles) {
        let pooled = handle.wait().unwrap().unwrap();
        let mut runner = BacktestRunner::from_config(config).unwrap();
        let sequential = runner
            .run(&store, &config.request(), &RunControl::default())
            .unwrap();
        assert_eq!(pooled.symbol, config.run.symbol);
        assert_eq!(pooled.trades, sequential.trades);
        assert_eq!(pooled.metrics, sequential.metrics);
    }

    // engines went back to the pool, capped per key
    let momentum_key = EngineKey::for_config(&configs[0]);
    assert!((1..=2).contains(&pool.engines().idle_count(&momentum_key)));
}

#[test]
fn zero_timeout_is_reported_as_timeout() {
    let (_dir, store) = shared_store();
    let pool = RunPool::new(1, 1).unwrap();
    let handle = pool
        .submit(RunJob {
            config: config("BTCUSDT", "momentum", "timeout_secs = 0"),
            store,
            observer: None,
        })
        .unwrap();
    let failure = handle.wait().unwrap().unwrap_err();
    assert_eq!(failure.code, ErrorCode::Timeout);
}

#[test]
fn queued_run_can_be_cancelled() {
    let (_dir, store) = shared_store();
    let pool = RunPool::new(1, 1).unwrap();

    // hold the only worker inside the first run until the second is cancelled
    let (release_tx, release_rx) = mpsc::channel::<()>();
    let gate = Mutex::new(release_rx);
    let blocker: Arc<dyn ProgressObserver> = Arc::new(move |p: &RunProgress| {
        if p.stage == RunStage::Loading {
            let _ = gate.lock().unwrap().recv();
        }
    });

    let first = pool
        .submit(RunJob {
            config: config("BTCUSDT", "orb", ""),
            store: store.clone(),
            observer: Some(blocker),
        })
        .unwrap();
    let second = pool
        .submit(RunJob {
            config: config("ETHUSDT", "orb", ""),
            store,
            observer: None,
        })
        .unwrap();
    assert_ne!(first.id(), second.id());

    second.cancel();
    release_tx.send(()).unwrap();

    assert!(first.wait().unwrap().is_ok());
    assert_eq!(second.wait().unwrap().unwrap_err().code, ErrorCode::Cancelled);
}

#[test]
fn progress_snapshot_and_observer_see_completion() {
    let (_dir, store) = shared_store();
    let pool = RunPool::new(1, 0).unwrap();
    let stages: Arc<Mutex<Vec<RunStage>>> = Arc::default();
    let sink = stages.clone();

    let handle = pool
        .submit(RunJob {
            config: config("BTCUSDT", "momentum", "progress_every = 100"),
            store,
            observer: Some(Arc::new(move |p: &RunProgress| {
                sink.lock().unwrap().push(p.stage);
            })),
        })
        .unwrap();

    // the snapshot reaches `complete` before the result is sent
    let deadline = std::time::Instant::now() + std::time::Duration::from_secs(30);
    while handle.progress().map(|p| p.stage) != Some(RunStage::Complete) {
        assert!(std::time::Instant::now() < deadline, "run never completed");
        std::thread::sleep(std::time::Duration::from_millis(5));
    }
    let snapshot = handle.progress().unwrap();
    assert_eq!(snapshot.percent, 100.0);
    assert!(handle.wait().unwrap().is_ok());

    let stages = stages.lock().unwrap();
    assert_eq!(stages.first(), Some(&RunStage::Loading));
    assert_eq!(stages.last(), Some(&RunStage::Complete));
    assert!(stages.contains(&RunStage::Simulating));
}

#[test]
fn invalid_config_is_rejected_at_submit() {
    let (_dir, store) = shared_store();
    let pool = RunPool::new(1, 1).unwrap();
    let mut bad = config("BTCUSDT", "orb", "");
    bad.broker.initial_capital = -5.0;
    assert!(pool
        .submit(RunJob {
            config: bad,
            store,
            observer: None,
        })
        .is_err());
}

#[test]
fn panicking_run_is_reported_as_worker_lost() {
    let (_dir, store) = shared_store();
    let pool = RunPool::new(1, 1).unwrap();

    let exploding: Arc<dyn ProgressObserver> = Arc::new(|p: &RunProgress| {
        if p.stage == RunStage::Loading {
            panic!("observer failure");
        }
    });
    let lost = pool
        .submit(RunJob {
            config: config("BTCUSDT", "orb", ""),
            store: store.clone(),
            observer: Some(exploding),
        })
        .unwrap();
    let lost_id = lost.id();
    match lost.wait() {
        Err(PoolError::WorkerLost(id)) => assert_eq!(id, lost_id),
        Err(other) => panic!("expected a lost worker, got {other}"),
        Ok(_) => panic!("expected a lost worker, got a result"),
    }

    // the worker thread survives the panic and keeps serving runs
    let next = pool
        .submit(RunJob {
            config: config("ETHUSDT", "orb", ""),
            store,
            observer: None,
        })
        .unwrap();
    assert!(next.wait().unwrap().is_ok());
}
