//! Trade — a closed position with realized PnL.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use super::position::Position;
use super::signal::Side;

/// Why a position was closed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum ExitReason {
    StopLoss,
    TakeProfit,
    /// Local time entered the scheduler's forced-close window.
    ForcedClose,
    /// The strategy's own exit condition fired.
    Strategy(String),
    /// Still open when the candle range ran out.
    BacktestEnd,
}

impl fmt::Display for ExitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitReason::StopLoss => f.write_str("STOP_LOSS"),
            ExitReason::TakeProfit => f.write_str("TAKE_PROFIT"),
            ExitReason::ForcedClose => f.write_str("FORCE_CLOSE"),
            ExitReason::Strategy(reason) => write!(f, "SIGNAL: {reason}"),
            ExitReason::BacktestEnd => f.write_str("backtest end"),
        }
    }
}

/// Closed-position record. Immutable once appended to the trade list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trade {
    // ── Position ──
    pub symbol: String,
    pub side: Side,
    pub entry_time: DateTime<Utc>,
    pub entry_price: f64,
    pub size: f64,
    pub stop_loss: f64,
    pub take_profit: f64,
    pub entry_reason: String,
    pub entry_fee: f64,
    pub confidence: Option<f64>,

    // ── Exit ──
    pub exit_time: DateTime<Utc>,
    /// Execution price after slippage.
    pub exit_price: f64,
    pub exit_reason: ExitReason,
    pub exit_fee: f64,

    // ── PnL ──
    /// Net of entry and exit fees.
    pub pnl: f64,
    /// `pnl` as a percentage of entry notional.
    pub pnl_pct: f64,
    pub fees: f64,
    /// `pnl` in units of initial risk.
    pub r_multiple: f64,
}

impl Trade {
    /// Build the closed record from the open position and the exit fill.
    pub fn from_position(
        position: Position,
        exit_time: DateTime<Utc>,
        exit_price: f64,
        exit_fee: f64,
        exit_reason: ExitReason,
    ) -> Self {
        let gross = position.unrealized_pnl(exit_price);
        let fees = position.entry_fee + exit_fee;
        let pnl = gross - fees;
        let notional = position.notional();
        let pnl_pct = if notional > 0.0 {
            pnl / notional * 100.0
        } else {
            0.0
        };
        let risk = position.initial_risk();
        let r_multiple = if risk > 0.0 { pnl / risk } else { 0.0 };

        Self {
            symbol: position.symbol,
            side: position.side,
            entry_time: position.entry_time,
            entry_price: position.entry_price,
            size: position.size,
            stop_loss: position.stop_loss,
            take_profit: position.take_profit,
            entry_reason: position.entry_reason,
            entry_fee: position.entry_fee,
            confidence: position.confidence,
            exit_time,
            exit_price,
            exit_reason,
            exit_fee,
            pnl,
            pnl_pct,
            fees,
            r_multiple,
        }
    }

    pub fn is_winner(&self) -> bool {
        self.pnl > 0.0
    }

    pub fn holding_minutes(&self) -> i64 {
        (self.exit_time - self.entry_time).num_minutes()
    }
}
