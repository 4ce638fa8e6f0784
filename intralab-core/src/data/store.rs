//! Parquet candle store with Hive-style partitioning.
//!
//! Layout: `{root}/symbol={SYMBOL}/{timeframe}.parquet`
//!
//! Features:
//! - One logical table per (symbol, timeframe), unique by UTC timestamp, ascending
//! - Incremental merge: colliding timestamps keep the most recently written candle
//! - Idempotent writes (a market-identical row is left untouched)
//! - Atomic writes (write to .tmp, rename into place)
//! - Quarantine for corrupt files ({filename}.quarantined)
//! - Metadata sidecar per dataset (hash, range, row count)

use super::gaps::{find_gaps, CandleGap};
use crate::domain::{Candle, RawCandle, Timeframe};
use chrono::{DateTime, Duration, FixedOffset, Utc};
use chrono_tz::Tz;
use polars::prelude::{Column, DataFrame, ParquetReader, ParquetWriter, PolarsError, SerReader};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Column layout of a persisted dataset, in file order.
pub const COLUMNS: [&str; 9] = [
    "timestamp_utc",
    "timestamp_local",
    "open",
    "high",
    "low",
    "close",
    "volume",
    "source",
    "updated_at_utc",
];

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store I/O error: {0}")]
    Io(String),

    #[error("parquet I/O error: {0}")]
    Parquet(String),

    #[error("corrupt dataset {path} (quarantined): {reason}")]
    Corrupt { path: String, reason: String },

    #[error("metadata error: {0}")]
    Meta(String),

    #[error("writer lock poisoned for {0}")]
    LockPoisoned(String),
}

/// Metadata sidecar for one (symbol, timeframe) dataset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreMeta {
    pub symbol: String,
    pub timeframe: Timeframe,
    pub first: DateTime<Utc>,
    pub last: DateTime<Utc>,
    pub candle_count: usize,
    pub data_hash: String,
    pub written_at: DateTime<Utc>,
}

/// What a `write` did to the stored dataset.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriteSummary {
    /// New timestamps added.
    pub inserted: usize,
    /// Existing timestamps overwritten with different data.
    pub replaced: usize,
    /// Incoming candles identical to what was already stored.
    pub unchanged: usize,
    /// Incoming candles dropped by the sanity check.
    pub skipped: usize,
    /// Rows in the dataset after the write.
    pub total: usize,
}

impl WriteSummary {
    pub fn changed(&self) -> bool {
        self.inserted + self.replaced > 0
    }
}

/// Ordered contents of one dataset.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StoredCandles {
    pub candles: Vec<Candle>,
}

impl StoredCandles {
    pub fn last_timestamp(&self) -> Option<DateTime<Utc>> {
        self.candles.last().map(|c| c.timestamp)
    }

    pub fn first_timestamp(&self) -> Option<DateTime<Utc>> {
        self.candles.first().map(|c| c.timestamp)
    }

    pub fn len(&self) -> usize {
        self.candles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candles.is_empty()
    }

    pub fn timestamps(&self) -> Vec<DateTime<Utc>> {
        self.candles.iter().map(|c| c.timestamp).collect()
    }
}

/// The Parquet candle store.
///
/// Safe to share between runs behind an `Arc`: writes to the same
/// (symbol, timeframe) file are serialized by a per-file lock.
pub struct CandleStore {
    root: PathBuf,
    tz: Tz,
    locks: Mutex<HashMap<PathBuf, Arc<Mutex<()>>>>,
}

impl CandleStore {
    /// `tz` is the zone used for the local-time column.
    pub fn new(root: impl Into<PathBuf>, tz: Tz) -> Self {
        Self {
            root: root.into(),
            tz,
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Root directory of the store.
    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn timezone(&self) -> Tz {
        self.tz
    }

    /// Directory for a specific symbol: `{root}/symbol={SYMBOL}/`
    fn symbol_dir(&self, symbol: &str) -> PathBuf {
        self.root.join(format!("symbol={}", sanitize_symbol(symbol)))
    }

    /// Path to the dataset: `{root}/symbol={SYMBOL}/{timeframe}.parquet`
    pub fn data_path(&self, symbol: &str, timeframe: Timeframe) -> PathBuf {
        self.symbol_dir(symbol)
            .join(format!("{}.parquet", timeframe.as_str()))
    }

    fn meta_path(&self, symbol: &str, timeframe: Timeframe) -> PathBuf {
        self.symbol_dir(symbol)
            .join(format!("{}.meta.json", timeframe.as_str()))
    }

    fn file_lock(&self, path: &Path) -> Result<Arc<Mutex<()>>, StoreError> {
        let mut locks = self
            .locks
            .lock()
            .map_err(|_| StoreError::LockPoisoned("lock table".into()))?;
        Ok(locks
            .entry(path.to_path_buf())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone())
    }

    /// Read the whole dataset, ascending by timestamp. A missing dataset is empty.
    pub fn read(&self, symbol: &str, timeframe: Timeframe) -> Result<StoredCandles, StoreError> {
        let candles = self.load_file(&self.data_path(symbol, timeframe))?;
        Ok(StoredCandles { candles })
    }

    /// Candles with `start <= timestamp <= end`.
    pub fn read_range(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Candle>, StoreError> {
        let stored = self.read(symbol, timeframe)?;
        Ok(stored
            .candles
            .into_iter()
            .filter(|c| c.timestamp >= start && c.timestamp <= end)
            .collect())
    }

    /// Merge `candles` into the dataset.
    ///
    /// The incoming candle wins on timestamp collision unless it is
    /// market-identical to the stored row, in which case the stored row (and
    /// its `updated_at`) is kept. Within one batch a later duplicate wins.
    pub fn write(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        candles: &[RawCandle],
        source: &str,
    ) -> Result<WriteSummary, StoreError> {
        let path = self.data_path(symbol, timeframe);
        let lock = self.file_lock(&path)?;
        let _guard = lock
            .lock()
            .map_err(|_| StoreError::LockPoisoned(path.display().to_string()))?;

        let existing = self.load_file(&path)?;
        let mut merged: BTreeMap<i64, Candle> = existing
            .into_iter()
            .map(|c| (c.timestamp.timestamp_millis(), c))
            .collect();

        let written_at = now_millis();
        let mut summary = WriteSummary::default();

        // collapse the batch first so a later duplicate replaces an earlier one
        let mut incoming: BTreeMap<i64, Candle> = BTreeMap::new();
        for raw in candles {
            if !raw.is_sane() {
                summary.skipped += 1;
                continue;
            }
            let candle = Candle::from_raw(raw, self.tz, source, written_at);
            incoming.insert(candle.timestamp.timestamp_millis(), candle);
        }

        for (key, candle) in incoming {
            match merged.get(&key) {
                Some(stored) if stored.same_market_data(&candle) => summary.unchanged += 1,
                Some(_) => {
                    summary.replaced += 1;
                    merged.insert(key, candle);
                }
                None => {
                    summary.inserted += 1;
                    merged.insert(key, candle);
                }
            }
        }

        summary.total = merged.len();
        if summary.skipped > 0 {
            warn!(
                symbol,
                timeframe = %timeframe,
                skipped = summary.skipped,
                "dropped candles failing the OHLCV sanity check"
            );
        }
        if !summary.changed() {
            debug!(symbol, timeframe = %timeframe, "write is a no-op, dataset unchanged");
            return Ok(summary);
        }

        let rows: Vec<Candle> = merged.into_values().collect();
        fs::create_dir_all(self.symbol_dir(symbol))
            .map_err(|e| StoreError::Io(format!("failed to create dir: {e}")))?;

        let df = candles_to_dataframe(&rows)?;
        let tmp_path = path.with_extension("parquet.tmp");
        write_parquet(&df, &tmp_path)?;
        fs::rename(&tmp_path, &path).map_err(|e| {
            let _ = fs::remove_file(&tmp_path);
            StoreError::Io(format!("atomic rename failed: {e}"))
        })?;

        self.write_meta(symbol, timeframe, &rows, written_at)?;

        info!(
            symbol,
            timeframe = %timeframe,
            source,
            inserted = summary.inserted,
            replaced = summary.replaced,
            total = summary.total,
            "candles written"
        );
        Ok(summary)
    }

    /// Spans between consecutive candles wider than `interval + tolerance`.
    pub fn check_gaps(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        tolerance: Duration,
    ) -> Result<Vec<CandleGap>, StoreError> {
        let stored = self.read(symbol, timeframe)?;
        Ok(find_gaps(
            &stored.timestamps(),
            timeframe.interval(),
            tolerance,
        ))
    }

    /// First and last stored timestamps, or `None` for an empty dataset.
    pub fn date_range(
        &self,
        symbol: &str,
        timeframe: Timeframe,
    ) -> Result<Option<(DateTime<Utc>, DateTime<Utc>)>, StoreError> {
        let stored = self.read(symbol, timeframe)?;
        Ok(stored.first_timestamp().zip(stored.last_timestamp()))
    }

    /// Metadata sidecar for a dataset, if one was written.
    pub fn status(&self, symbol: &str, timeframe: Timeframe) -> Option<StoreMeta> {
        let content = fs::read_to_string(self.meta_path(symbol, timeframe)).ok()?;
        serde_json::from_str(&content).ok()
    }

    /// All (symbol directory name, timeframe) datasets present under the root.
    pub fn list_datasets(&self) -> Result<Vec<(String, Timeframe)>, StoreError> {
        let mut out = Vec::new();
        if !self.root.exists() {
            return Ok(out);
        }
        let entries =
            fs::read_dir(&self.root).map_err(|e| StoreError::Io(format!("read dir: {e}")))?;
        for entry in entries {
            let entry = entry.map_err(|e| StoreError::Io(format!("dir entry: {e}")))?;
            let name = entry.file_name().to_string_lossy().to_string();
            let Some(symbol) = name.strip_prefix("symbol=") else {
                continue;
            };
            let files = fs::read_dir(entry.path())
                .map_err(|e| StoreError::Io(format!("read dir: {e}")))?;
            for file in files {
                let file = file.map_err(|e| StoreError::Io(format!("dir entry: {e}")))?;
                let path = file.path();
                if path.extension().and_then(|e| e.to_str()) != Some("parquet") {
                    continue;
                }
                let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or("");
                if let Ok(tf) = stem.parse::<Timeframe>() {
                    out.push((symbol.to_string(), tf));
                }
            }
        }
        out.sort();
        Ok(out)
    }

    fn load_file(&self, path: &Path) -> Result<Vec<Candle>, StoreError> {
        if !path.exists() {
            return Ok(Vec::new());
        }
        match load_and_validate_parquet(path) {
            Ok(mut candles) => {
                candles.sort_by_key(|c| c.timestamp);
                candles.dedup_by_key(|c| c.timestamp);
                Ok(candles)
            }
            Err(e) => {
                let quarantine = path.with_extension("parquet.quarantined");
                warn!(path = %path.display(), error = %e, "quarantining corrupt candle file");
                if let Err(rename_err) = fs::rename(path, &quarantine) {
                    warn!(
                        path = %path.display(),
                        error = %rename_err,
                        "failed to move corrupt candle file into quarantine"
                    );
                }
                Err(StoreError::Corrupt {
                    path: path.display().to_string(),
                    reason: e.to_string(),
                })
            }
        }
    }

    fn write_meta(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        rows: &[Candle],
        written_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let (Some(first), Some(last)) = (rows.first(), rows.last()) else {
            return Ok(());
        };
        let meta = StoreMeta {
            symbol: symbol.to_string(),
            timeframe,
            first: first.timestamp,
            last: last.timestamp,
            candle_count: rows.len(),
            data_hash: dataset_hash(rows),
            written_at,
        };
        let json = serde_json::to_string_pretty(&meta)
            .map_err(|e| StoreError::Meta(format!("meta serialization: {e}")))?;
        fs::write(self.meta_path(symbol, timeframe), json)
            .map_err(|e| StoreError::Meta(format!("meta write: {e}")))
    }
}

/// File-system safe form of a symbol (`BTC/USDT` -> `BTC_USDT`).
pub fn sanitize_symbol(symbol: &str) -> String {
    symbol
        .trim()
        .chars()
        .map(|ch| match ch {
            '/' | '\\' | ':' | ' ' => '_',
            other => other,
        })
        .collect()
}

/// BLAKE3 over timestamps and OHLCV values, in stored order.
pub fn dataset_hash(candles: &[Candle]) -> String {
    let mut hasher = blake3::Hasher::new();
    for c in candles {
        hasher.update(&c.timestamp.timestamp_millis().to_le_bytes());
        hasher.update(&c.open.to_le_bytes());
        hasher.update(&c.high.to_le_bytes());
        hasher.update(&c.low.to_le_bytes());
        hasher.update(&c.close.to_le_bytes());
        hasher.update(&c.volume.to_le_bytes());
        hasher.update(c.source.as_bytes());
    }
    hasher.finalize().to_hex().to_string()
}

/// Current time truncated to the millisecond precision of the file format.
fn now_millis() -> DateTime<Utc> {
    let now = Utc::now();
    DateTime::from_timestamp_millis(now.timestamp_millis()).unwrap_or(now)
}

// ── Parquet I/O helpers ─────────────────────────────────────────────

fn candles_to_dataframe(candles: &[Candle]) -> Result<DataFrame, StoreError> {
    let timestamps: Vec<i64> = candles
        .iter()
        .map(|c| c.timestamp.timestamp_millis())
        .collect();
    let local: Vec<String> = candles.iter().map(|c| c.local_time.to_rfc3339()).collect();
    let opens: Vec<f64> = candles.iter().map(|c| c.open).collect();
    let highs: Vec<f64> = candles.iter().map(|c| c.high).collect();
    let lows: Vec<f64> = candles.iter().map(|c| c.low).collect();
    let closes: Vec<f64> = candles.iter().map(|c| c.close).collect();
    let volumes: Vec<f64> = candles.iter().map(|c| c.volume).collect();
    let sources: Vec<String> = candles.iter().map(|c| c.source.clone()).collect();
    let updated: Vec<i64> = candles
        .iter()
        .map(|c| c.updated_at.timestamp_millis())
        .collect();

    DataFrame::new(vec![
        Column::new(COLUMNS[0].into(), timestamps),
        Column::new(COLUMNS[1].into(), local),
        Column::new(COLUMNS[2].into(), opens),
        Column::new(COLUMNS[3].into(), highs),
        Column::new(COLUMNS[4].into(), lows),
        Column::new(COLUMNS[5].into(), closes),
        Column::new(COLUMNS[6].into(), volumes),
        Column::new(COLUMNS[7].into(), sources),
        Column::new(COLUMNS[8].into(), updated),
    ])
    .map_err(|e| StoreError::Parquet(format!("dataframe creation: {e}")))
}

fn write_parquet(df: &DataFrame, path: &Path) -> Result<(), StoreError> {
    let file =
        fs::File::create(path).map_err(|e| StoreError::Parquet(format!("create file: {e}")))?;
    ParquetWriter::new(file)
        .finish(&mut df.clone())
        .map_err(|e| StoreError::Parquet(format!("write parquet: {e}")))?;
    Ok(())
}

fn load_and_validate_parquet(path: &Path) -> Result<Vec<Candle>, StoreError> {
    let file = fs::File::open(path).map_err(|e| StoreError::Parquet(format!("open: {e}")))?;
    let df = ParquetReader::new(file)
        .finish()
        .map_err(|e| StoreError::Parquet(format!("read: {e}")))?;

    for col_name in COLUMNS {
        if df.column(col_name).is_err() {
            return Err(StoreError::Parquet(format!("missing column '{col_name}'")));
        }
    }

    dataframe_to_candles(&df)
}

fn dataframe_to_candles(df: &DataFrame) -> Result<Vec<Candle>, StoreError> {
    let map_err = |e: PolarsError| StoreError::Parquet(format!("column read: {e}"));

    let ts_ca = df.column(COLUMNS[0]).map_err(map_err)?.i64().map_err(map_err)?;
    let local_ca = df.column(COLUMNS[1]).map_err(map_err)?.str().map_err(map_err)?;
    let open_ca = df.column(COLUMNS[2]).map_err(map_err)?.f64().map_err(map_err)?;
    let high_ca = df.column(COLUMNS[3]).map_err(map_err)?.f64().map_err(map_err)?;
    let low_ca = df.column(COLUMNS[4]).map_err(map_err)?.f64().map_err(map_err)?;
    let close_ca = df.column(COLUMNS[5]).map_err(map_err)?.f64().map_err(map_err)?;
    let vol_ca = df.column(COLUMNS[6]).map_err(map_err)?.f64().map_err(map_err)?;
    let source_ca = df.column(COLUMNS[7]).map_err(map_err)?.str().map_err(map_err)?;
    let updated_ca = df.column(COLUMNS[8]).map_err(map_err)?.i64().map_err(map_err)?;

    let n = df.height();
    let mut candles = Vec::with_capacity(n);

    for i in 0..n {
        let ts_ms = ts_ca
            .get(i)
            .ok_or_else(|| StoreError::Parquet(format!("null timestamp at row {i}")))?;
        let timestamp = DateTime::from_timestamp_millis(ts_ms)
            .ok_or_else(|| StoreError::Parquet(format!("timestamp out of range at row {i}")))?;
        let local_time = local_ca
            .get(i)
            .and_then(|s| DateTime::<FixedOffset>::parse_from_rfc3339(s).ok())
            .ok_or_else(|| StoreError::Parquet(format!("bad local timestamp at row {i}")))?;
        let updated_at = updated_ca
            .get(i)
            .and_then(DateTime::from_timestamp_millis)
            .unwrap_or(timestamp);

        let source = source_ca
            .get(i)
            .ok_or_else(|| StoreError::Parquet(format!("null source at row {i}")))?;

        candles.push(Candle {
            timestamp,
            local_time,
            open: finite_cell(open_ca.get(i), COLUMNS[2], i)?,
            high: finite_cell(high_ca.get(i), COLUMNS[3], i)?,
            low: finite_cell(low_ca.get(i), COLUMNS[4], i)?,
            close: finite_cell(close_ca.get(i), COLUMNS[5], i)?,
            volume: finite_cell(vol_ca.get(i), COLUMNS[6], i)?,
            source: source.to_string(),
            updated_at,
        });
    }

    Ok(candles)
}

/// A price or volume cell must be present and finite.
fn finite_cell(value: Option<f64>, column: &str, row: usize) -> Result<f64, StoreError> {
    match value {
        Some(v) if v.is_finite() => Ok(v),
        Some(v) => Err(StoreError::Parquet(format!("non-finite {column} {v} at row {row}"))),
        None => Err(StoreError::Parquet(format!("null {column} at row {row}"))),
    }
}
