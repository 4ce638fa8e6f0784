//! Opening-range breakout on the local trading day.
//!
//! The first `range_candles` candles of each local calendar day define the
//! range. A close above the range high goes long with the stop at the range
//! low; a close below the range low goes short with the stop at the range
//! high. Targets sit `reward_risk` times the stop distance away. At most one
//! filled entry per local day; a breakout whose order was rejected keeps
//! signalling.

use super::{check_index, Strategy, StrategyError};
use crate::domain::{Candle, Position, Side, Signal};
use chrono::NaiveDate;

#[derive(Debug, Clone)]
pub struct OpeningRangeBreakout {
    range_candles: usize,
    reward_risk: f64,
    exit_on_range_reentry: bool,
    fired_on: Option<NaiveDate>,
}

impl OpeningRangeBreakout {
    pub fn new(range_candles: usize, reward_risk: f64, exit_on_range_reentry: bool) -> Self {
        Self {
            range_candles,
            reward_risk,
            exit_on_range_reentry,
            fired_on: None,
        }
    }

    /// (high, low) of the current local day's opening range, once the range
    /// is complete and `index` lies past it.
    fn opening_range(&self, candles: &[Candle], index: usize) -> Option<(f64, f64)> {
        let day = candles[index].local_time.date_naive();
        let session_start = candles[..=index]
            .iter()
            .rposition(|c| c.local_time.date_naive() != day)
            .map_or(0, |i| i + 1);

        if index - session_start < self.range_candles {
            return None;
        }
        let range = &candles[session_start..session_start + self.range_candles];
        let high = range.iter().map(|c| c.high).fold(f64::NEG_INFINITY, f64::max);
        let low = range.iter().map(|c| c.low).fold(f64::INFINITY, f64::min);
        Some((high, low))
    }
}

impl Strategy for OpeningRangeBreakout {
    fn name(&self) -> &str {
        "orb"
    }

    fn warmup(&self) -> usize {
        self.range_candles
    }

    fn generate_signal(
        &mut self,
        candles: &[Candle],
        index: usize,
    ) -> Result<Option<Signal>, StrategyError> {
        check_index(candles, index)?;
        let day = candles[index].local_time.date_naive();
        if self.fired_on == Some(day) {
            return Ok(None);
        }
        let Some((high, low)) = self.opening_range(candles, index) else {
            return Ok(None);
        };

        let close = candles[index].close;
        let (side, stop) = if close > high {
            (Side::Long, low)
        } else if close < low {
            (Side::Short, high)
        } else {
            return Ok(None);
        };

        let risk = (close - stop).abs();
        let take_profit = close + side.sign() * risk * self.reward_risk;

        Ok(Some(Signal {
            side,
            entry_price: close,
            stop_loss: stop,
            take_profit,
            reason: format!("orb_{side}_breakout"),
            confidence: None,
        }))
    }

    fn should_close(
        &mut self,
        candles: &[Candle],
        index: usize,
        position: &Position,
    ) -> Result<Option<String>, StrategyError> {
        check_index(candles, index)?;
        if !self.exit_on_range_reentry {
            return Ok(None);
        }
        let Some((high, low)) = self.opening_range(candles, index) else {
            return Ok(None);
        };
        let close = candles[index].close;
        let back_inside = match position.side {
            Side::Long => close < high,
            Side::Short => close > low,
        };
        Ok(back_inside.then(|| "range re-entry".to_string()))
    }

    fn on_entry(&mut self, candles: &[Candle], index: usize) {
        if let Some(candle) = candles.get(index) {
            self.fired_on = Some(candle.local_time.date_naive());
        }
    }

    fn reset(&mut self) {
        self.fired_on = None;
    }
}
