//! Rate-limited candle fetcher: retries with exponential backoff, pagination
//! across a date range, and gap backfill.
//!
//! Every operation fails closed. A page that still fails after the last
//! attempt surfaces as [`FetchError::Unavailable`]; partial ranges are never
//! returned in place of an error.

use super::gaps::CandleGap;
use super::source::{CandleSource, SourceError};
use crate::config::{ensure, ConfigError};
use crate::domain::{RawCandle, Timeframe};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

/// Retry, backoff and pagination settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FetcherConfig {
    /// Total attempts per page, including the first.
    pub max_attempts: u32,
    /// Exponential base: the delay before retry `n` is `backoff_unit_ms * backoff_base^n`.
    pub backoff_base: f64,
    pub backoff_unit_ms: u64,
    /// Ceiling applied to every retry delay.
    pub max_backoff_ms: u64,
    /// Candles requested per page.
    pub page_limit: usize,
    /// Pause between successive pages of one range.
    pub request_pause_ms: u64,
}

impl Default for FetcherConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            backoff_base: 2.0,
            backoff_unit_ms: 1_000,
            max_backoff_ms: 60_000,
            page_limit: 1_000,
            request_pause_ms: 200,
        }
    }
}

impl FetcherConfig {
    /// No waiting at all; for tests and local replay sources.
    pub fn immediate() -> Self {
        Self {
            backoff_unit_ms: 0,
            max_backoff_ms: 0,
            request_pause_ms: 0,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        ensure(self.max_attempts >= 1, "fetcher", "max_attempts must be >= 1")?;
        ensure(
            self.backoff_base.is_finite() && self.backoff_base >= 1.0,
            "fetcher",
            "backoff_base must be a finite number >= 1",
        )?;
        ensure(self.page_limit >= 1, "fetcher", "page_limit must be >= 1")
    }

    /// Delay before retry number `retry` (1-based), capped at `max_backoff_ms`.
    pub fn backoff_delay(&self, retry: u32) -> Duration {
        let factor = self.backoff_base.powi(retry as i32);
        let ms = (self.backoff_unit_ms as f64 * factor).min(self.max_backoff_ms as f64);
        Duration::from_millis(ms.max(0.0) as u64)
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("data unavailable for {symbol} after {attempts} attempts: {last_error}")]
    Unavailable {
        symbol: String,
        attempts: u32,
        #[source]
        last_error: SourceError,
    },

    #[error("source rejected request for {symbol}: {source}")]
    Rejected {
        symbol: String,
        #[source]
        source: SourceError,
    },

    #[error("invalid range for {symbol}: start {start} is after end {end}")]
    InvalidRange {
        symbol: String,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    },
}

/// Wraps a [`CandleSource`] with retry, pagination and backfill.
pub struct CandleFetcher<S> {
    source: S,
    config: FetcherConfig,
}

impl<S: CandleSource> CandleFetcher<S> {
    pub fn new(source: S, config: FetcherConfig) -> Self {
        Self { source, config }
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    pub fn config(&self) -> &FetcherConfig {
        &self.config
    }

    /// One page with retries.
    ///
    /// Transient errors (rate limits, network, 5xx) are retried up to
    /// `max_attempts`; anything else fails immediately. The returned batch is
    /// ascending and starts at or after `since`.
    pub fn fetch(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        since: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<RawCandle>, FetchError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.source.fetch_page(symbol, timeframe, since, limit) {
                Ok(mut page) => {
                    page.retain(|c| c.timestamp >= since);
                    page.sort_by_key(|c| c.timestamp);
                    return Ok(page);
                }
                Err(e) if !e.is_transient() => {
                    return Err(FetchError::Rejected {
                        symbol: symbol.to_string(),
                        source: e,
                    });
                }
                Err(e) if attempt >= self.config.max_attempts => {
                    warn!(symbol, attempts = attempt, error = %e, "giving up on page");
                    return Err(FetchError::Unavailable {
                        symbol: symbol.to_string(),
                        attempts: attempt,
                        last_error: e,
                    });
                }
                Err(e) => {
                    let mut delay = self.config.backoff_delay(attempt);
                    if let Some(secs) = e.retry_after_secs() {
                        let cap = Duration::from_millis(self.config.max_backoff_ms);
                        delay = delay.max(Duration::from_secs(secs).min(cap));
                    }
                    warn!(
                        symbol,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "transient fetch failure, backing off"
                    );
                    std::thread::sleep(delay);
                }
            }
        }
    }

    /// All candles with `start <= timestamp <= end`, paginating forward.
    ///
    /// Each page starts one interval past the last returned open time.
    /// Pagination stops once `end` is reached or a page comes back empty.
    pub fn fetch_range(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<RawCandle>, FetchError> {
        if start > end {
            return Err(FetchError::InvalidRange {
                symbol: symbol.to_string(),
                start,
                end,
            });
        }

        let interval = timeframe.interval();
        let pause = Duration::from_millis(self.config.request_pause_ms);
        let mut since = start;
        let mut out: Vec<RawCandle> = Vec::new();
        let mut pages = 0usize;

        while since <= end {
            if pages > 0 && !pause.is_zero() {
                std::thread::sleep(pause);
            }
            let page = self.fetch(symbol, timeframe, since, self.config.page_limit)?;
            pages += 1;

            let Some(last) = page.last().map(|c| c.timestamp) else {
                break;
            };
            out.extend(page.into_iter().filter(|c| c.timestamp <= end));
            debug!(symbol, timeframe = %timeframe, pages, candles = out.len(), "page fetched");

            let next = last + interval;
            if next <= since {
                break;
            }
            since = next;
        }

        out.sort_by_key(|c| c.timestamp);
        out.dedup_by_key(|c| c.timestamp);
        Ok(out)
    }

    /// Re-fetch the missing interior of each gap, one range per gap.
    pub fn backfill_gaps(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        gaps: &[CandleGap],
    ) -> Result<Vec<RawCandle>, FetchError> {
        let interval = timeframe.interval();
        let mut out = Vec::new();
        for gap in gaps {
            let start = gap.start + interval;
            let end = gap.end - interval;
            if start > end {
                continue;
            }
            debug!(symbol, %start, %end, "backfilling gap");
            out.extend(self.fetch_range(symbol, timeframe, start, end)?);
        }
        out.sort_by_key(|c| c.timestamp);
        out.dedup_by_key(|c| c.timestamp);
        Ok(out)
    }
}
