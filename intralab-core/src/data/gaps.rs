//! Gap detection over a time-ordered candle series.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// A span between two consecutive stored candles that is wider than expected.
///
/// `start` and `end` are the open times of the candles bordering the hole;
/// both are present in the dataset, everything strictly between is missing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandleGap {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl CandleGap {
    pub fn span(&self) -> Duration {
        self.end - self.start
    }

    /// Number of whole intervals missing between the bordering candles.
    pub fn missing_candles(&self, interval: Duration) -> i64 {
        let step = interval.num_seconds();
        if step <= 0 {
            return 0;
        }
        (self.span().num_seconds() / step - 1).max(0)
    }
}

/// Scan consecutive timestamps and return spans exceeding `interval + tolerance`.
///
/// `timestamps` must be ascending; unsorted input yields no gaps for the
/// out-of-order pairs.
pub fn find_gaps(
    timestamps: &[DateTime<Utc>],
    interval: Duration,
    tolerance: Duration,
) -> Vec<CandleGap> {
    let limit = interval + tolerance;
    timestamps
        .windows(2)
        .filter(|pair| pair[1] - pair[0] > limit)
        .map(|pair| CandleGap {
            start: pair[0],
            end: pair[1],
        })
        .collect()
}
