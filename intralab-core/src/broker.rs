//! Order-execution simulator.
//!
//! Owns the single open position of a run, sizes entries from account risk,
//! applies slippage and fees, evaluates stop-loss / take-profit against each
//! candle, and realizes PnL on close.
//!
//! Position lifecycle: `NONE -> OPEN` via [`OrderSimulator::open`], then
//! `OPEN -> NONE` via [`OrderSimulator::close`], which appends a [`Trade`].

use crate::config::{ensure, ConfigError};
use crate::domain::{Candle, ExitReason, Position, Side, Signal, Trade};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

/// Smallest entry-to-stop distance treated as non-zero.
const MIN_RISK_DISTANCE: f64 = 1e-12;

/// Account and execution-cost settings. Rates are fractions (`0.01` = 1%).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    pub initial_capital: f64,
    /// Fee charged on each side, as a fraction of traded notional.
    pub fee_rate: f64,
    /// Adverse price move applied to every fill.
    pub slippage_pct: f64,
    /// Equity fraction put at risk between entry and stop.
    pub risk_per_trade_pct: f64,
    /// Cap on position notional as a fraction of equity.
    pub max_position_pct: f64,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            initial_capital: 10_000.0,
            fee_rate: 0.0005,
            slippage_pct: 0.0005,
            risk_per_trade_pct: 0.01,
            max_position_pct: 1.0,
        }
    }
}

impl BrokerConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        ensure(
            self.initial_capital.is_finite() && self.initial_capital > 0.0,
            "broker",
            "initial_capital must be positive",
        )?;
        ensure(
            (0.0..1.0).contains(&self.fee_rate),
            "broker",
            "fee_rate must be in [0, 1)",
        )?;
        ensure(
            (0.0..1.0).contains(&self.slippage_pct),
            "broker",
            "slippage_pct must be in [0, 1)",
        )?;
        ensure(
            self.risk_per_trade_pct > 0.0 && self.risk_per_trade_pct <= 1.0,
            "broker",
            "risk_per_trade_pct must be in (0, 1]",
        )?;
        ensure(
            self.max_position_pct.is_finite() && self.max_position_pct > 0.0,
            "broker",
            "max_position_pct must be positive",
        )
    }
}

/// Entry request handed to [`OrderSimulator::open`].
#[derive(Debug, Clone, PartialEq)]
pub struct OpenOrder {
    pub symbol: String,
    pub side: Side,
    pub time: DateTime<Utc>,
    /// Intended price before slippage.
    pub entry_price: f64,
    pub stop_loss: f64,
    pub take_profit: f64,
    pub reason: String,
    pub confidence: Option<f64>,
}

impl OpenOrder {
    pub fn from_signal(symbol: &str, time: DateTime<Utc>, signal: &Signal) -> Self {
        Self {
            symbol: symbol.to_string(),
            side: signal.side,
            time,
            entry_price: signal.entry_price,
            stop_loss: signal.stop_loss,
            take_profit: signal.take_profit,
            reason: signal.reason.clone(),
            confidence: signal.confidence,
        }
    }
}

/// Why an entry was not opened. Expected during a run; never fatal.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum Rejection {
    #[error("a position is already open")]
    PositionAlreadyOpen,

    #[error("invalid order price: {0}")]
    InvalidPrice(String),

    #[error("entry and stop-loss coincide, risk distance is zero")]
    ZeroRiskDistance,

    #[error("computed position size {size} is not positive")]
    NonPositiveSize { size: f64 },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BrokerError {
    #[error("no open position to close")]
    NoOpenPosition,
}

/// A protective level touched by a candle.
#[derive(Debug, Clone, PartialEq)]
pub struct StopHit {
    /// The stop or target level (pre-slippage).
    pub price: f64,
    pub reason: ExitReason,
}

#[derive(Debug, Clone)]
pub struct OrderSimulator {
    config: BrokerConfig,
    equity: f64,
    position: Option<Position>,
    trades: Vec<Trade>,
}

impl OrderSimulator {
    pub fn new(config: BrokerConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            equity: config.initial_capital,
            config,
            position: None,
            trades: Vec::new(),
        })
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    /// Realized equity: initial capital plus net PnL of closed trades.
    pub fn equity(&self) -> f64 {
        self.equity
    }

    pub fn position(&self) -> Option<&Position> {
        self.position.as_ref()
    }

    pub fn has_position(&self) -> bool {
        self.position.is_some()
    }

    pub fn trades(&self) -> &[Trade] {
        &self.trades
    }

    /// Drain the trade list, leaving equity and any open position untouched.
    pub fn take_trades(&mut self) -> Vec<Trade> {
        std::mem::take(&mut self.trades)
    }

    /// Restore initial capital and clear position and trades.
    pub fn reset(&mut self) {
        self.equity = self.config.initial_capital;
        self.position = None;
        self.trades.clear();
    }

    /// Price after slippage against the trader.
    fn slipped(&self, price: f64, side: Side, entering: bool) -> f64 {
        let s = self.config.slippage_pct;
        let worse_up = matches!((side, entering), (Side::Long, true) | (Side::Short, false));
        if worse_up {
            price * (1.0 + s)
        } else {
            price * (1.0 - s)
        }
    }

    /// Units affordable under both the risk budget and the notional cap.
    pub fn position_size(&self, exec_price: f64, stop_loss: f64) -> f64 {
        let distance = (exec_price - stop_loss).abs();
        if distance < MIN_RISK_DISTANCE || exec_price <= 0.0 {
            return 0.0;
        }
        let risk_size = self.equity * self.config.risk_per_trade_pct / distance;
        let cap_size = self.equity * self.config.max_position_pct / exec_price;
        risk_size.min(cap_size)
    }

    pub fn open(&mut self, order: OpenOrder) -> Result<&Position, Rejection> {
        if self.position.is_some() {
            return Err(Rejection::PositionAlreadyOpen);
        }
        let prices = [order.entry_price, order.stop_loss, order.take_profit];
        if prices.iter().any(|p| !p.is_finite()) || order.entry_price <= 0.0 {
            return Err(Rejection::InvalidPrice(format!(
                "entry={} stop={} target={}",
                order.entry_price, order.stop_loss, order.take_profit
            )));
        }

        let exec_price = self.slipped(order.entry_price, order.side, true);
        if (exec_price - order.stop_loss).abs() < MIN_RISK_DISTANCE {
            return Err(Rejection::ZeroRiskDistance);
        }
        let size = self.position_size(exec_price, order.stop_loss);
        if size <= 0.0 || !size.is_finite() {
            return Err(Rejection::NonPositiveSize { size });
        }

        let entry_fee = exec_price * size * self.config.fee_rate;
        debug!(
            symbol = %order.symbol,
            side = %order.side,
            price = exec_price,
            size,
            "position opened"
        );
        Ok(&*self.position.insert(Position {
            symbol: order.symbol,
            side: order.side,
            entry_time: order.time,
            entry_price: exec_price,
            size,
            stop_loss: order.stop_loss,
            take_profit: order.take_profit,
            entry_reason: order.reason,
            entry_fee,
            confidence: order.confidence,
        }))
    }

    /// Stop-loss or take-profit touched by `candle`.
    ///
    /// When a single candle spans both levels, the stop-loss wins. This is a
    /// fixed tie-break kept for reproducibility, not a model of the intrabar path.
    pub fn check_stops(&self, candle: &Candle) -> Option<StopHit> {
        let pos = self.position.as_ref()?;
        let (stop_hit, target_hit) = match pos.side {
            Side::Long => (candle.low <= pos.stop_loss, candle.high >= pos.take_profit),
            Side::Short => (candle.high >= pos.stop_loss, candle.low <= pos.take_profit),
        };
        if stop_hit {
            Some(StopHit {
                price: pos.stop_loss,
                reason: ExitReason::StopLoss,
            })
        } else if target_hit {
            Some(StopHit {
                price: pos.take_profit,
                reason: ExitReason::TakeProfit,
            })
        } else {
            None
        }
    }

    /// Close the open position at `exit_price` (slippage applied here).
    pub fn close(
        &mut self,
        time: DateTime<Utc>,
        exit_price: f64,
        reason: ExitReason,
    ) -> Result<Trade, BrokerError> {
        let position = self.position.take().ok_or(BrokerError::NoOpenPosition)?;
        let exec_price = self.slipped(exit_price, position.side, false);
        let exit_fee = exec_price * position.size * self.config.fee_rate;

        let trade = Trade::from_position(position, time, exec_price, exit_fee, reason);
        self.equity += trade.pnl;
        debug!(
            symbol = %trade.symbol,
            reason = %trade.exit_reason,
            pnl = trade.pnl,
            equity = self.equity,
            "position closed"
        );
        self.trades.push(trade.clone());
        Ok(trade)
    }

    /// Unrealized PnL of the open position at `price`, zero when flat.
    pub fn mark_to_market(&self, price: f64) -> f64 {
        self.position
            .as_ref()
            .map(|p| p.unrealized_pnl(price))
            .unwrap_or(0.0)
    }
}
