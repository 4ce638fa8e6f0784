//! Candle — the fundamental market data unit.

use chrono::{DateTime, FixedOffset, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

/// OHLCV bar as delivered by an upstream source, before it is stamped for storage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawCandle {
    /// Open time of the interval (UTC).
    pub timestamp: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

impl RawCandle {
    /// Returns true if any OHLCV field is NaN or infinite.
    pub fn is_void(&self) -> bool {
        !(self.open.is_finite()
            && self.high.is_finite()
            && self.low.is_finite()
            && self.close.is_finite()
            && self.volume.is_finite())
    }

    /// Basic OHLCV sanity check: high >= low, high >= open/close, positive prices.
    pub fn is_sane(&self) -> bool {
        if self.is_void() {
            return false;
        }
        self.high >= self.low
            && self.high >= self.open
            && self.high >= self.close
            && self.low <= self.open
            && self.low <= self.close
            && self.low > 0.0
            && self.volume >= 0.0
    }
}

/// A stored candle: UTC open time is canonical, the local projection and
/// provenance are carried alongside.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub timestamp: DateTime<Utc>,
    /// `timestamp` projected into the dataset's local zone.
    pub local_time: DateTime<FixedOffset>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    /// Provenance tag, e.g. `fetch` or `backfill`.
    pub source: String,
    /// When this row was last written (UTC).
    pub updated_at: DateTime<Utc>,
}

impl Candle {
    pub fn from_raw(raw: &RawCandle, tz: Tz, source: &str, updated_at: DateTime<Utc>) -> Self {
        Self {
            timestamp: raw.timestamp,
            local_time: raw.timestamp.with_timezone(&tz).fixed_offset(),
            open: raw.open,
            high: raw.high,
            low: raw.low,
            close: raw.close,
            volume: raw.volume,
            source: source.to_string(),
            updated_at,
        }
    }

    /// Strip storage stamps.
    pub fn to_raw(&self) -> RawCandle {
        RawCandle {
            timestamp: self.timestamp,
            open: self.open,
            high: self.high,
            low: self.low,
            close: self.close,
            volume: self.volume,
        }
    }

    /// Same interval with the same prices, volume and provenance.
    ///
    /// `updated_at` is ignored so that re-writing an identical batch is a no-op.
    pub fn same_market_data(&self, other: &Candle) -> bool {
        self.timestamp == other.timestamp
            && self.open == other.open
            && self.high == other.high
            && self.low == other.low
            && self.close == other.close
            && self.volume == other.volume
            && self.source == other.source
    }
}
