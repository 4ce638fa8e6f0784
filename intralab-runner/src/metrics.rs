//! Performance metrics — pure functions over the trade list and equity curve.
//!
//! Conventions: fields ending in `_pct` are percentages (`12.5` = 12.5%),
//! `win_rate` and `cagr` are fractions, money amounts are in account currency.

use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDate, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use intralab_core::domain::Trade;

/// One point of the equity curve.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EquitySample {
    pub timestamp: DateTime<Utc>,
    pub equity: f64,
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum MetricsError {
    #[error("initial capital must be positive, got {0}")]
    InvalidCapital(f64),

    #[error("equity curve is not in time order at sample {0}")]
    UnorderedCurve(usize),

    #[error("metric {field} is not finite ({value})")]
    NonFinite { field: &'static str, value: f64 },

    #[error("inconsistent metrics: {0}")]
    Inconsistent(String),
}

/// PnL of trades grouped by exit date.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DailyPnlStats {
    pub days: usize,
    pub mean: f64,
    pub std: f64,
    pub min: f64,
    pub max: f64,
    pub best_day: Option<NaiveDate>,
    pub worst_day: Option<NaiveDate>,
}

/// Aggregate performance of one run. Computed once, never mutated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceMetrics {
    pub initial_capital: f64,
    pub final_equity: f64,
    pub total_return: f64,
    pub total_return_pct: f64,
    pub cagr: f64,
    pub max_drawdown: f64,
    pub max_drawdown_pct: f64,
    pub sharpe: f64,
    /// `+inf` when there is profit and no loss.
    #[serde(with = "serde_inf")]
    pub profit_factor: f64,
    /// Mean net PnL per trade.
    pub expectancy: f64,
    pub win_rate: f64,
    pub trade_count: usize,
    pub winning_trades: usize,
    pub losing_trades: usize,
    pub avg_win: f64,
    pub avg_loss: f64,
    pub largest_win: f64,
    pub largest_loss: f64,
    pub total_fees: f64,
    pub avg_r_multiple: f64,
    pub daily: DailyPnlStats,
}

impl PerformanceMetrics {
    /// Metrics of a run without trades: flat equity, every ratio zero.
    pub fn empty(initial_capital: f64) -> Self {
        Self {
            initial_capital,
            final_equity: initial_capital,
            total_return: 0.0,
            total_return_pct: 0.0,
            cagr: 0.0,
            max_drawdown: 0.0,
            max_drawdown_pct: 0.0,
            sharpe: 0.0,
            profit_factor: 0.0,
            expectancy: 0.0,
            win_rate: 0.0,
            trade_count: 0,
            winning_trades: 0,
            losing_trades: 0,
            avg_win: 0.0,
            avg_loss: 0.0,
            largest_win: 0.0,
            largest_loss: 0.0,
            total_fees: 0.0,
            avg_r_multiple: 0.0,
            daily: DailyPnlStats::default(),
        }
    }

    /// Shape check: every value finite (profit factor may be `+inf`) and
    /// counts consistent.
    pub fn validate(&self) -> Result<(), MetricsError> {
        let fields = [
            ("initial_capital", self.initial_capital),
            ("final_equity", self.final_equity),
            ("total_return", self.total_return),
            ("total_return_pct", self.total_return_pct),
            ("cagr", self.cagr),
            ("max_drawdown", self.max_drawdown),
            ("max_drawdown_pct", self.max_drawdown_pct),
            ("sharpe", self.sharpe),
            ("expectancy", self.expectancy),
            ("win_rate", self.win_rate),
            ("avg_win", self.avg_win),
            ("avg_loss", self.avg_loss),
            ("largest_win", self.largest_win),
            ("largest_loss", self.largest_loss),
            ("total_fees", self.total_fees),
            ("avg_r_multiple", self.avg_r_multiple),
            ("daily.mean", self.daily.mean),
            ("daily.std", self.daily.std),
        ];
        for (field, value) in fields {
            if !value.is_finite() {
                return Err(MetricsError::NonFinite { field, value });
            }
        }
        if self.profit_factor.is_nan() || self.profit_factor < 0.0 {
            return Err(MetricsError::NonFinite {
                field: "profit_factor",
                value: self.profit_factor,
            });
        }
        if self.winning_trades + self.losing_trades > self.trade_count {
            return Err(MetricsError::Inconsistent(format!(
                "{} winners + {} losers > {} trades",
                self.winning_trades, self.losing_trades, self.trade_count
            )));
        }
        if !(0.0..=1.0).contains(&self.win_rate) {
            return Err(MetricsError::Inconsistent(format!(
                "win rate {} outside [0, 1]",
                self.win_rate
            )));
        }
        Ok(())
    }
}

/// Derives [`PerformanceMetrics`] for one run.
#[derive(Debug, Clone)]
pub struct MetricsEngine {
    initial_capital: f64,
    /// Zone whose calendar dates group the daily PnL.
    tz: Tz,
}

impl MetricsEngine {
    pub fn new(initial_capital: f64, tz: Tz) -> Self {
        Self { initial_capital, tz }
    }

    pub fn initial_capital(&self) -> f64 {
        self.initial_capital
    }

    pub fn compute(
        &self,
        trades: &[Trade],
        equity_curve: &[EquitySample],
    ) -> Result<PerformanceMetrics, MetricsError> {
        let initial = self.initial_capital;
        if !(initial.is_finite() && initial > 0.0) {
            return Err(MetricsError::InvalidCapital(initial));
        }
        if let Some(i) = equity_curve
            .windows(2)
            .position(|w| w[1].timestamp < w[0].timestamp)
        {
            return Err(MetricsError::UnorderedCurve(i + 1));
        }
        if trades.is_empty() {
            return Ok(PerformanceMetrics::empty(initial));
        }

        let pnls: Vec<f64> = trades.iter().map(|t| t.pnl).collect();
        let total_pnl: f64 = pnls.iter().sum();
        let final_equity = initial + total_pnl;

        let wins: Vec<f64> = pnls.iter().copied().filter(|p| *p > 0.0).collect();
        let losses: Vec<f64> = pnls.iter().copied().filter(|p| *p < 0.0).collect();

        // the curve samples before each candle; the final realized equity closes it
        let mut curve: Vec<f64> = equity_curve.iter().map(|s| s.equity).collect();
        curve.push(final_equity);
        let (max_drawdown, max_drawdown_pct) = max_drawdown(&curve);

        Ok(PerformanceMetrics {
            initial_capital: initial,
            final_equity,
            total_return: total_pnl,
            total_return_pct: total_pnl / initial * 100.0,
            cagr: cagr(initial, final_equity, trades),
            max_drawdown,
            max_drawdown_pct,
            sharpe: sharpe_ratio(trades),
            profit_factor: profit_factor(&pnls),
            expectancy: mean_f64(&pnls),
            win_rate: wins.len() as f64 / trades.len() as f64,
            trade_count: trades.len(),
            winning_trades: wins.len(),
            losing_trades: losses.len(),
            avg_win: mean_f64(&wins),
            avg_loss: mean_f64(&losses),
            largest_win: wins.iter().copied().fold(0.0, f64::max),
            largest_loss: losses.iter().copied().fold(0.0, f64::min),
            total_fees: trades.iter().map(|t| t.fees).sum(),
            avg_r_multiple: mean_f64(&trades.iter().map(|t| t.r_multiple).collect::<Vec<_>>()),
            daily: daily_pnl(trades, self.tz),
        })
    }
}

// ─── Individual metric functions ────────────────────────────────────

/// Compound annual growth over the span from first entry to last exit.
///
/// Returns 0.0 for spans shorter than one whole day or non-positive equity.
pub fn cagr(initial: f64, final_equity: f64, trades: &[Trade]) -> f64 {
    let first = trades.iter().map(|t| t.entry_time).min();
    let last = trades.iter().map(|t| t.exit_time).max();
    let (Some(first), Some(last)) = (first, last) else {
        return 0.0;
    };
    let days = (last - first).num_days();
    if days < 1 || initial <= 0.0 || final_equity <= 0.0 {
        return 0.0;
    }
    (final_equity / initial).powf(365.0 / days as f64) - 1.0
}

/// Largest peak-to-trough decline: (absolute, percent of the peak).
pub fn max_drawdown(curve: &[f64]) -> (f64, f64) {
    let mut peak = f64::NEG_INFINITY;
    let mut max_abs = 0.0_f64;
    let mut max_pct = 0.0_f64;
    for &eq in curve {
        if eq > peak {
            peak = eq;
        }
        let dd = peak - eq;
        max_abs = max_abs.max(dd);
        if peak > 0.0 {
            max_pct = max_pct.max(dd / peak * 100.0);
        }
    }
    (max_abs, max_pct)
}

/// Simplified annualized Sharpe from per-trade returns.
///
/// Sharpe = mean(trade returns) / std(trade returns) * sqrt(252).
/// Returns 0.0 with fewer than 2 trades or zero variance.
pub fn sharpe_ratio(trades: &[Trade]) -> f64 {
    let returns: Vec<f64> = trades.iter().map(|t| t.pnl_pct / 100.0).collect();
    if returns.len() < 2 {
        return 0.0;
    }
    let std = std_dev(&returns);
    if std < 1e-15 {
        return 0.0;
    }
    mean_f64(&returns) / std * (252.0_f64).sqrt()
}

/// Gross profit / gross loss; `+inf` with profit and no loss, 0.0 with no profit.
pub fn profit_factor(pnls: &[f64]) -> f64 {
    let gross_profit: f64 = pnls.iter().filter(|p| **p > 0.0).sum();
    let gross_loss: f64 = pnls.iter().filter(|p| **p < 0.0).map(|p| p.abs()).sum();
    if gross_profit <= 0.0 {
        return 0.0;
    }
    if gross_loss < 1e-10 {
        return f64::INFINITY;
    }
    gross_profit / gross_loss
}

/// Net PnL per local exit date.
pub fn daily_pnl(trades: &[Trade], tz: Tz) -> DailyPnlStats {
    let mut by_day: BTreeMap<NaiveDate, f64> = BTreeMap::new();
    for t in trades {
        *by_day
            .entry(t.exit_time.with_timezone(&tz).date_naive())
            .or_default() += t.pnl;
    }
    if by_day.is_empty() {
        return DailyPnlStats::default();
    }

    let values: Vec<f64> = by_day.values().copied().collect();
    let best = by_day
        .iter()
        .max_by(|a, b| a.1.total_cmp(b.1))
        .map(|(d, _)| *d);
    let worst = by_day
        .iter()
        .min_by(|a, b| a.1.total_cmp(b.1))
        .map(|(d, _)| *d);

    DailyPnlStats {
        days: values.len(),
        mean: mean_f64(&values),
        std: std_dev(&values),
        min: values.iter().copied().fold(f64::INFINITY, f64::min),
        max: values.iter().copied().fold(f64::NEG_INFINITY, f64::max),
        best_day: best,
        worst_day: worst,
    }
}

// ─── Helpers ────────────────────────────────────────────────────────

pub(crate) fn mean_f64(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

pub(crate) fn std_dev(values: &[f64]) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    let mean = mean_f64(values);
    let variance =
        values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (values.len() - 1) as f64;
    variance.sqrt()
}

/// JSON has no infinity; `+inf` round-trips as the string `"inf"`.
mod serde_inf {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &f64, s: S) -> Result<S::Ok, S::Error> {
        if value.is_infinite() && value.is_sign_positive() {
            s.serialize_str("inf")
        } else {
            s.serialize_f64(*value)
        }
    }

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Repr {
        Number(f64),
        Text(String),
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<f64, D::Error> {
        match Repr::deserialize(d)? {
            Repr::Number(v) => Ok(v),
            Repr::Text(s) if s == "inf" => Ok(f64::INFINITY),
            Repr::Text(s) => Err(serde::de::Error::custom(format!(
                "expected a number or \"inf\", got {s:?}"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use intralab_core::domain::{ExitReason, Position, Side};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 2, 1, 0, 0).unwrap()
    }

    /// Long 10 units from 100 closed after `days`, with the given net PnL.
    fn make_trade(pnl: f64, days: i64) -> Trade {
        let position = Position {
            symbol: "BTCUSDT".into(),
            side: Side::Long,
            entry_time: t0(),
            entry_price: 100.0,
            size: 10.0,
            stop_loss: 95.0,
            take_profit: 110.0,
            entry_reason: "test".into(),
            entry_fee: 0.0,
            confidence: None,
        };
        Trade::from_position(
            position,
            t0() + Duration::days(days) + Duration::hours(2),
            100.0 + pnl / 10.0,
            0.0,
            ExitReason::TakeProfit,
        )
    }

    fn curve(values: &[f64]) -> Vec<EquitySample> {
        values
            .iter()
            .enumerate()
            .map(|(i, &equity)| EquitySample {
                timestamp: t0() + Duration::minutes(5 * i as i64),
                equity,
            })
            .collect()
    }

    fn engine() -> MetricsEngine {
        MetricsEngine::new(10_000.0, chrono_tz::UTC)
    }

    #[test]
    fn empty_trades_boundary() {
        let m = engine()
            .compute(&[], &curve(&[10_000.0, 10_000.0, 9_000.0]))
            .unwrap();
        assert_eq!(m.final_equity, 10_000.0);
        assert_eq!(m.total_return, 0.0);
        assert_eq!(m.sharpe, 0.0);
        assert_eq!(m.profit_factor, 0.0);
        assert_eq!(m.win_rate, 0.0);
        assert_eq!(m.cagr, 0.0);
        assert_eq!(m.max_drawdown, 0.0);
        assert!(m.validate().is_ok());
    }

    #[test]
    fn basic_statistics() {
        let trades = vec![make_trade(200.0, 0), make_trade(-100.0, 1), make_trade(100.0, 2)];
        let m = engine()
            .compute(&trades, &curve(&[10_000.0, 10_200.0, 10_100.0]))
            .unwrap();

        assert_eq!(m.trade_count, 3);
        assert_eq!(m.winning_trades, 2);
        assert_eq!(m.losing_trades, 1);
        assert!((m.final_equity - 10_200.0).abs() < 1e-9);
        assert!((m.total_return_pct - 2.0).abs() < 1e-9);
        assert!((m.win_rate - 2.0 / 3.0).abs() < 1e-9);
        assert!((m.profit_factor - 3.0).abs() < 1e-9);
        assert!((m.expectancy - 200.0 / 3.0).abs() < 1e-9);
        assert!((m.avg_win - 150.0).abs() < 1e-9);
        assert!((m.avg_loss + 100.0).abs() < 1e-9);
        assert!((m.largest_win - 200.0).abs() < 1e-9);
        assert!((m.largest_loss + 100.0).abs() < 1e-9);
        assert!(m.sharpe > 0.0);
        assert!(m.cagr > 0.0);
        assert!(m.validate().is_ok());
    }

    #[test]
    fn drawdown_is_peak_to_trough() {
        let (abs, pct) = max_drawdown(&[100.0, 120.0, 90.0, 130.0, 117.0]);
        assert!((abs - 30.0).abs() < 1e-9);
        assert!((pct - 25.0).abs() < 1e-9);
        assert_eq!(max_drawdown(&[100.0, 101.0, 102.0]), (0.0, 0.0));
    }

    #[test]
    fn final_realized_equity_closes_the_curve() {
        // loss realized on the last candle is not in the sampled curve
        let trades = vec![make_trade(-500.0, 0)];
        let m = engine()
            .compute(&trades, &curve(&[10_000.0, 10_000.0]))
            .unwrap();
        assert!((m.max_drawdown - 500.0).abs() < 1e-9);
        assert!((m.max_drawdown_pct - 5.0).abs() < 1e-9);
    }

    #[test]
    fn profit_factor_edges() {
        assert_eq!(profit_factor(&[10.0, 5.0]), f64::INFINITY);
        assert_eq!(profit_factor(&[-10.0]), 0.0);
        assert_eq!(profit_factor(&[]), 0.0);
        assert!((profit_factor(&[30.0, -10.0]) - 3.0).abs() < 1e-9);
    }

    #[test]
    fn sharpe_needs_two_trades() {
        assert_eq!(sharpe_ratio(&[make_trade(100.0, 0)]), 0.0);
        assert_eq!(sharpe_ratio(&[make_trade(100.0, 0), make_trade(100.0, 1)]), 0.0);
    }

    #[test]
    fn cagr_uses_trade_span_in_days() {
        let trades = vec![make_trade(1_000.0, 365)];
        let c = cagr(10_000.0, 11_000.0, &trades);
        assert!((c - 0.1).abs() < 1e-9);
        assert_eq!(cagr(10_000.0, 11_000.0, &[make_trade(1_000.0, 0)]), 0.0);
    }

    #[test]
    fn daily_pnl_groups_by_local_exit_date() {
        let trades = vec![make_trade(100.0, 0), make_trade(-50.0, 0), make_trade(30.0, 1)];
        let daily = daily_pnl(&trades, chrono_tz::UTC);
        assert_eq!(daily.days, 2);
        assert!((daily.max - 50.0).abs() < 1e-9);
        assert!((daily.min - 30.0).abs() < 1e-9);
        assert_eq!(daily.best_day, Some(NaiveDate::from_ymd_opt(2024, 1, 2).unwrap()));
        assert_eq!(daily.worst_day, Some(NaiveDate::from_ymd_opt(2024, 1, 3).unwrap()));

        // 03:00 UTC exits land on the previous local date in Los Angeles
        let la = daily_pnl(&trades, chrono_tz::America::Los_Angeles);
        assert_eq!(la.best_day, Some(NaiveDate::from_ymd_opt(2024, 1, 1).unwrap()));
    }

    #[test]
    fn unordered_curve_is_rejected() {
        let mut samples = curve(&[10_000.0, 10_000.0]);
        samples.swap(0, 1);
        assert_eq!(
            engine().compute(&[make_trade(1.0, 0)], &samples),
            Err(MetricsError::UnorderedCurve(1))
        );
    }

    #[test]
    fn invalid_capital_is_rejected() {
        let m = MetricsEngine::new(0.0, chrono_tz::UTC);
        assert!(matches!(
            m.compute(&[], &[]),
            Err(MetricsError::InvalidCapital(_))
        ));
    }

    #[test]
    fn validate_flags_non_finite() {
        let mut m = PerformanceMetrics::empty(10_000.0);
        m.sharpe = f64::NAN;
        assert!(matches!(
            m.validate(),
            Err(MetricsError::NonFinite { field: "sharpe", .. })
        ));

        let mut m = PerformanceMetrics::empty(10_000.0);
        m.profit_factor = f64::INFINITY;
        assert!(m.validate().is_ok());
    }

    #[test]
    fn infinite_profit_factor_survives_json() {
        let mut m = PerformanceMetrics::empty(10_000.0);
        m.profit_factor = f64::INFINITY;
        let json = serde_json::to_string(&m).unwrap();
        assert!(json.contains("\"profit_factor\":\"inf\""));
        let back: PerformanceMetrics = serde_json::from_str(&json).unwrap();
        assert_eq!(back.profit_factor, f64::INFINITY);
    }
}
