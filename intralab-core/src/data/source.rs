//! Market-data source trait and structured error types.
//!
//! The CandleSource trait abstracts over upstream candle providers so the
//! fetcher can paginate and retry without knowing the wire format, and tests
//! can script responses.

use crate::domain::{RawCandle, Timeframe};
use chrono::{DateTime, Utc};
use thiserror::Error;

/// Errors raised by a single upstream request.
#[derive(Debug, Clone, Error)]
pub enum SourceError {
    #[error("rate limited by source (retry after {retry_after_secs}s)")]
    RateLimited { retry_after_secs: u64 },

    #[error("network unreachable: {0}")]
    Network(String),

    #[error("HTTP {status}: {message}")]
    Http { status: u16, message: String },

    #[error("response format changed: {0}")]
    Format(String),

    #[error("symbol not found: {symbol}")]
    NotFound { symbol: String },
}

impl SourceError {
    /// Rate limits, network failures and server-side errors are worth retrying.
    pub fn is_transient(&self) -> bool {
        match self {
            SourceError::RateLimited { .. } | SourceError::Network(_) => true,
            SourceError::Http { status, .. } => *status >= 500,
            SourceError::Format(_) | SourceError::NotFound { .. } => false,
        }
    }

    /// Server-requested wait before the next attempt, if any.
    pub fn retry_after_secs(&self) -> Option<u64> {
        match self {
            SourceError::RateLimited { retry_after_secs } => Some(*retry_after_secs),
            _ => None,
        }
    }
}

/// An upstream candle provider.
///
/// Implementations perform exactly one request per call; retries, backoff and
/// pagination belong to [`super::fetcher::CandleFetcher`].
pub trait CandleSource: Send + Sync {
    /// Short provenance name, e.g. `binance`.
    fn name(&self) -> &str;

    /// Up to `limit` candles with open time `>= since`, ascending.
    fn fetch_page(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        since: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<RawCandle>, SourceError>;
}
