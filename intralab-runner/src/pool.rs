//! Concurrent backtests: keyed engine reuse and a bounded worker pool.
//!
//! Every in-flight run owns its own [`BacktestRunner`]; nothing mutable is
//! shared between runs except the candle store, which serializes writers.

use std::any::Any;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, error};

use intralab_core::data::CandleStore;

use crate::config::{BacktestConfig, ConfigError};
use crate::runner::{
    BacktestRunner, CancelToken, ProgressObserver, RunControl, RunFailure, RunOutcome, RunProgress,
};

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("failed to build worker pool: {0}")]
    Build(String),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("run {0} ended without a result (worker panicked)")]
    WorkerLost(u64),
}

// ─── Engine pool ────────────────────────────────────────────────────

/// Identity of interchangeable engines: strategy type plus config hash.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EngineKey {
    pub strategy: String,
    pub config_hash: String,
}

impl EngineKey {
    pub fn for_config(config: &BacktestConfig) -> Self {
        Self {
            strategy: config.strategy.kind.clone(),
            config_hash: config.engine_hash(),
        }
    }
}

/// Idle runners keyed by [`EngineKey`].
///
/// Checked-out runners are reset before use. At most `max_idle_per_key`
/// idle runners are retained per key; the oldest is evicted first.
#[derive(Debug)]
pub struct EnginePool {
    idle: Mutex<HashMap<EngineKey, VecDeque<BacktestRunner>>>,
    max_idle_per_key: usize,
}

impl EnginePool {
    pub fn new(max_idle_per_key: usize) -> Self {
        Self {
            idle: Mutex::new(HashMap::new()),
            max_idle_per_key,
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<EngineKey, VecDeque<BacktestRunner>>> {
        // a panicked run never holds this lock across simulation
        self.idle.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Most recently returned idle runner for `config`, or a new one.
    pub fn checkout(&self, config: &BacktestConfig) -> Result<BacktestRunner, ConfigError> {
        let key = EngineKey::for_config(config);
        let reused = self.lock().get_mut(&key).and_then(VecDeque::pop_back);
        match reused {
            Some(mut runner) => {
                debug!(strategy = %key.strategy, "engine reused");
                runner.reset();
                Ok(runner)
            }
            None => BacktestRunner::from_config(config),
        }
    }

    pub fn checkin(&self, key: EngineKey, runner: BacktestRunner) {
        if self.max_idle_per_key == 0 {
            return;
        }
        let mut idle = self.lock();
        let queue = idle.entry(key).or_default();
        queue.push_back(runner);
        while queue.len() > self.max_idle_per_key {
            queue.pop_front();
        }
    }

    pub fn idle_count(&self, key: &EngineKey) -> usize {
        self.lock().get(key).map_or(0, VecDeque::len)
    }

    pub fn clear(&self) {
        self.lock().clear();
    }
}

// ─── Run pool ───────────────────────────────────────────────────────

/// One backtest to execute on the pool.
pub struct RunJob {
    pub config: BacktestConfig,
    pub store: Arc<CandleStore>,
    pub observer: Option<Arc<dyn ProgressObserver>>,
}

type RunResult = Result<RunOutcome, RunFailure>;

/// Caller's side of a submitted run.
pub struct RunHandle {
    id: u64,
    cancel: CancelToken,
    progress: Arc<Mutex<Option<RunProgress>>>,
    rx: mpsc::Receiver<RunResult>,
}

impl RunHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Request cooperative cancellation; takes effect at the next candle.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Latest progress update, if any was emitted yet.
    pub fn progress(&self) -> Option<RunProgress> {
        self.progress
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Block until the run finishes.
    pub fn wait(self) -> Result<RunResult, PoolError> {
        self.rx.recv().map_err(|_| PoolError::WorkerLost(self.id))
    }
}

/// Bounded rayon pool executing backtests, each with its own engine.
pub struct RunPool {
    pool: rayon::ThreadPool,
    engines: Arc<EnginePool>,
    next_id: AtomicU64,
}

impl RunPool {
    pub fn new(threads: usize, max_idle_per_key: usize) -> Result<Self, PoolError> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(|i| format!("intralab-run-{i}"))
            .panic_handler(|payload| {
                error!(panic = %panic_message(payload.as_ref()), "backtest worker panicked");
            })
            .build()
            .map_err(|e| PoolError::Build(e.to_string()))?;
        Ok(Self {
            pool,
            engines: Arc::new(EnginePool::new(max_idle_per_key)),
            next_id: AtomicU64::new(1),
        })
    }

    pub fn threads(&self) -> usize {
        self.pool.current_num_threads()
    }

    pub fn engines(&self) -> &EnginePool {
        &self.engines
    }

    /// Queue `job`. The config is validated and an engine checked out before
    /// returning; a configured timeout starts when the worker picks the job up.
    pub fn submit(&self, job: RunJob) -> Result<RunHandle, PoolError> {
        job.config.validate()?;
        let mut runner = self.engines.checkout(&job.config)?;

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let key = EngineKey::for_config(&job.config);
        let request = job.config.request();
        let timeout = job.config.run.timeout_secs.map(Duration::from_secs);
        let cancel = CancelToken::new();
        let progress: Arc<Mutex<Option<RunProgress>>> = Arc::default();

        let snapshot = progress.clone();
        let forward = job.observer;
        let observer = move |p: &RunProgress| {
            *snapshot.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(p.clone());
            if let Some(outer) = &forward {
                outer.on_progress(p);
            }
        };
        let mut control = RunControl::default()
            .with_cancel(cancel.clone())
            .with_observer(Arc::new(observer))
            .with_progress_every(job.config.run.progress_every);

        let (tx, rx) = mpsc::channel();
        let engines = self.engines.clone();
        let store = job.store;
        debug!(run = id, symbol = %request.symbol, "run queued");
        self.pool.spawn(move || {
            if let Some(timeout) = timeout {
                control = control.with_timeout(timeout);
            }
            let result = runner.run(&store, &request, &control);
            engines.checkin(key, runner);
            // the handle may have been dropped
            let _ = tx.send(result);
        });

        Ok(RunHandle {
            id,
            cancel,
            progress,
            rx,
        })
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
