use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::signal::Side;

/// The single open trade of a simulation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub symbol: String,
    pub side: Side,
    pub entry_time: DateTime<Utc>,
    /// Execution price after slippage.
    pub entry_price: f64,
    pub size: f64,
    pub stop_loss: f64,
    pub take_profit: f64,
    pub entry_reason: String,
    pub entry_fee: f64,
    pub confidence: Option<f64>,
}

impl Position {
    pub fn is_long(&self) -> bool {
        self.side == Side::Long
    }

    pub fn notional(&self) -> f64 {
        self.entry_price * self.size
    }

    /// Gross PnL if closed at `price`, before fees and exit slippage.
    pub fn unrealized_pnl(&self, price: f64) -> f64 {
        (price - self.entry_price) * self.size * self.side.sign()
    }

    /// Initial risk in account currency (entry-to-stop distance times size).
    pub fn initial_risk(&self) -> f64 {
        (self.entry_price - self.stop_loss).abs() * self.size
    }
}
