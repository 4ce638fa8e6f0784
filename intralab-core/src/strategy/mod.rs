//! Strategy capability and factory.
//!
//! The run loop only sees `dyn Strategy`. Implementations are selected by a
//! type string plus a flat `name -> f64` parameter map, so configs stay
//! serializable and hashable.

pub mod momentum;
pub mod orb;

pub use momentum::Momentum;
pub use orb::OpeningRangeBreakout;

use crate::domain::{Candle, Position, Signal};
use std::collections::BTreeMap;
use thiserror::Error;

// ─── Error type ──────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Error)]
pub enum StrategyError {
    #[error("unknown strategy type: {0}")]
    UnknownStrategy(String),

    #[error("invalid parameter {name}: {reason}")]
    InvalidParam { name: String, reason: String },

    #[error("candle index {index} out of range for history of {len}")]
    IndexOutOfRange { index: usize, len: usize },

    #[error("strategy evaluation failed: {0}")]
    Evaluation(String),
}

// ─── Trait ───────────────────────────────────────────────────────────

/// Signal generation and exit condition for one symbol.
///
/// Implementations must only read `candles[..=index]`.
pub trait Strategy: Send {
    /// Factory key, e.g. `orb`.
    fn name(&self) -> &str;

    /// Candles to skip before the run loop starts asking for signals.
    fn warmup(&self) -> usize;

    /// Entry proposal for the candle at `index`, if any.
    fn generate_signal(
        &mut self,
        candles: &[Candle],
        index: usize,
    ) -> Result<Option<Signal>, StrategyError>;

    /// Exit reason when the strategy's own condition for closing `position` holds.
    fn should_close(
        &mut self,
        candles: &[Candle],
        index: usize,
        position: &Position,
    ) -> Result<Option<String>, StrategyError>;

    /// Called after the signal at `index` opened a position.
    ///
    /// A rejected order never reaches this hook.
    fn on_entry(&mut self, _candles: &[Candle], _index: usize) {}

    /// Drop any per-run state so the instance can be reused.
    fn reset(&mut self) {}
}

// ─── Helpers ─────────────────────────────────────────────────────────

/// Extract a named f64 parameter, falling back to `default`.
fn param(params: &BTreeMap<String, f64>, name: &str, default: f64) -> f64 {
    params.get(name).copied().unwrap_or(default)
}

/// Extract a named usize parameter, falling back to `default`.
fn param_usize(params: &BTreeMap<String, f64>, name: &str, default: usize) -> usize {
    params
        .get(name)
        .copied()
        .map(|v| v.max(0.0) as usize)
        .unwrap_or(default)
}

fn require(ok: bool, name: &str, reason: &str) -> Result<(), StrategyError> {
    if ok {
        Ok(())
    } else {
        Err(StrategyError::InvalidParam {
            name: name.to_string(),
            reason: reason.to_string(),
        })
    }
}

/// Bounds check shared by implementations.
pub(crate) fn check_index(candles: &[Candle], index: usize) -> Result<(), StrategyError> {
    if index < candles.len() {
        Ok(())
    } else {
        Err(StrategyError::IndexOutOfRange {
            index,
            len: candles.len(),
        })
    }
}

// ─── Factory ─────────────────────────────────────────────────────────

/// Strategy type keys accepted by [`create_strategy`].
pub const STRATEGY_TYPES: [&str; 2] = ["orb", "momentum"];

/// Build a strategy from its type key and parameters.
pub fn create_strategy(
    kind: &str,
    params: &BTreeMap<String, f64>,
) -> Result<Box<dyn Strategy>, StrategyError> {
    match kind {
        "orb" => {
            let range_candles = param_usize(params, "range_candles", 6);
            let reward_risk = param(params, "reward_risk", 2.0);
            let exit_on_reentry = param(params, "exit_on_range_reentry", 0.0) != 0.0;
            require(range_candles >= 1, "range_candles", "must be >= 1")?;
            require(
                reward_risk.is_finite() && reward_risk > 0.0,
                "reward_risk",
                "must be positive",
            )?;
            Ok(Box::new(OpeningRangeBreakout::new(
                range_candles,
                reward_risk,
                exit_on_reentry,
            )))
        }
        "momentum" => {
            let lookback = param_usize(params, "lookback", 12);
            let threshold_pct = param(params, "threshold_pct", 1.0);
            let stop_pct = param(params, "stop_pct", 1.0);
            let target_pct = param(params, "target_pct", 2.0);
            require(lookback >= 1, "lookback", "must be >= 1")?;
            require(threshold_pct >= 0.0, "threshold_pct", "must be >= 0")?;
            require(stop_pct > 0.0 && stop_pct < 100.0, "stop_pct", "must be in (0, 100)")?;
            require(target_pct > 0.0, "target_pct", "must be positive")?;
            Ok(Box::new(Momentum::new(
                lookback,
                threshold_pct,
                stop_pct,
                target_pct,
            )))
        }
        other => Err(StrategyError::UnknownStrategy(other.to_string())),
    }
}
