//! Close-to-close momentum with percentage stop and target.

use super::{check_index, Strategy, StrategyError};
use crate::domain::{Candle, Position, Side, Signal};

#[derive(Debug, Clone)]
pub struct Momentum {
    lookback: usize,
    threshold_pct: f64,
    stop_pct: f64,
    target_pct: f64,
}

impl Momentum {
    pub fn new(lookback: usize, threshold_pct: f64, stop_pct: f64, target_pct: f64) -> Self {
        Self {
            lookback,
            threshold_pct,
            stop_pct,
            target_pct,
        }
    }

    /// Percent change of the close over `lookback` candles, `None` during warmup.
    fn rate_of_change(&self, candles: &[Candle], index: usize) -> Option<f64> {
        let past = candles[index.checked_sub(self.lookback)?].close;
        if past <= 0.0 {
            return None;
        }
        Some((candles[index].close - past) / past * 100.0)
    }
}

impl Strategy for Momentum {
    fn name(&self) -> &str {
        "momentum"
    }

    fn warmup(&self) -> usize {
        self.lookback
    }

    fn generate_signal(
        &mut self,
        candles: &[Candle],
        index: usize,
    ) -> Result<Option<Signal>, StrategyError> {
        check_index(candles, index)?;
        let Some(roc) = self.rate_of_change(candles, index) else {
            return Ok(None);
        };
        if roc.abs() < self.threshold_pct || roc == 0.0 {
            return Ok(None);
        }

        let side = if roc > 0.0 { Side::Long } else { Side::Short };
        let close = candles[index].close;
        let sign = side.sign();
        let confidence = if self.threshold_pct > 0.0 {
            (roc.abs() / (2.0 * self.threshold_pct)).min(1.0)
        } else {
            1.0
        };

        Ok(Some(Signal {
            side,
            entry_price: close,
            stop_loss: close * (1.0 - sign * self.stop_pct / 100.0),
            take_profit: close * (1.0 + sign * self.target_pct / 100.0),
            reason: format!("momentum roc={roc:.2}%"),
            confidence: Some(confidence),
        }))
    }

    /// Close when momentum flips against the position by at least the threshold.
    fn should_close(
        &mut self,
        candles: &[Candle],
        index: usize,
        position: &Position,
    ) -> Result<Option<String>, StrategyError> {
        check_index(candles, index)?;
        let Some(roc) = self.rate_of_change(candles, index) else {
            return Ok(None);
        };
        let against = roc * position.side.sign() < 0.0;
        Ok((against && roc.abs() >= self.threshold_pct).then(|| "momentum reversal".to_string()))
    }
}
