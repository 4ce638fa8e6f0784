//! Incremental update of a stored dataset: fetch what is new, then
//! reconcile gaps by backfilling.

use super::fetcher::{CandleFetcher, FetchError};
use super::source::CandleSource;
use super::store::{CandleStore, StoreError};
use crate::domain::Timeframe;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

pub const FETCH_PROVENANCE: &str = "fetch";
pub const BACKFILL_PROVENANCE: &str = "backfill";

#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Outcome of one [`sync_candles`] call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncReport {
    /// New candles written by the head and forward fetches.
    pub fetched: usize,
    /// Candles written by gap backfill.
    pub backfilled: usize,
    pub gaps_found: usize,
    /// Gaps still present after backfill (the source has no data for them).
    pub gaps_remaining: usize,
}

/// Bring `store` up to date for `[start, end]`.
///
/// Fetches forward from one interval past the last stored candle (or from
/// `start` when the dataset is empty), then detects gaps wider than
/// `interval + gap_tolerance` and backfills them.
pub fn sync_candles<S: CandleSource>(
    fetcher: &CandleFetcher<S>,
    store: &CandleStore,
    symbol: &str,
    timeframe: Timeframe,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    gap_tolerance: Duration,
) -> Result<SyncReport, SyncError> {
    let mut report = SyncReport::default();

    let interval = timeframe.interval();
    let stored = store.read(symbol, timeframe)?;
    let from = match stored.last_timestamp() {
        Some(last) => (last + interval).max(start),
        None => start,
    };

    // requested start moved earlier than the stored history
    if let Some(first) = stored.first_timestamp() {
        let head_end = (first - interval).min(end);
        if start <= head_end {
            let candles = fetcher.fetch_range(symbol, timeframe, start, head_end)?;
            let summary = store.write(symbol, timeframe, &candles, FETCH_PROVENANCE)?;
            report.fetched += summary.inserted + summary.replaced;
        }
    }

    if from <= end {
        let candles = fetcher.fetch_range(symbol, timeframe, from, end)?;
        let summary = store.write(symbol, timeframe, &candles, FETCH_PROVENANCE)?;
        report.fetched += summary.inserted + summary.replaced;
    }

    let gaps = store.check_gaps(symbol, timeframe, gap_tolerance)?;
    report.gaps_found = gaps.len();
    if !gaps.is_empty() {
        let filled = fetcher.backfill_gaps(symbol, timeframe, &gaps)?;
        let summary = store.write(symbol, timeframe, &filled, BACKFILL_PROVENANCE)?;
        report.backfilled = summary.inserted + summary.replaced;
        report.gaps_remaining = store.check_gaps(symbol, timeframe, gap_tolerance)?.len();
    }

    info!(
        symbol,
        timeframe = %timeframe,
        fetched = report.fetched,
        backfilled = report.backfilled,
        gaps_found = report.gaps_found,
        gaps_remaining = report.gaps_remaining,
        source = fetcher.source().name(),
        "sync complete"
    );
    Ok(report)
}
