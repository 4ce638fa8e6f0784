//! Export — trade log CSV, equity curve CSV and JSON result artifacts.
//!
//! Persisted JSON carries a `schema_version`; newer versions are rejected on
//! load.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};

use intralab_core::domain::Trade;

use crate::metrics::EquitySample;
use crate::runner::{RunOutcome, SCHEMA_VERSION};

// ─── JSON export ────────────────────────────────────────────────────

pub fn export_json(outcome: &RunOutcome) -> Result<String> {
    serde_json::to_string_pretty(outcome).context("failed to serialize RunOutcome to JSON")
}

/// Deserialize a `RunOutcome`, rejecting unknown schema versions.
pub fn import_json(json: &str) -> Result<RunOutcome> {
    let outcome: RunOutcome =
        serde_json::from_str(json).context("failed to deserialize RunOutcome from JSON")?;
    if outcome.schema_version > SCHEMA_VERSION {
        bail!(
            "unsupported schema version {} (max supported: {})",
            outcome.schema_version,
            SCHEMA_VERSION
        );
    }
    Ok(outcome)
}

// ─── CSV export ─────────────────────────────────────────────────────

/// One row per trade.
///
/// Columns: symbol, side, entry_time, entry_price, exit_time, exit_price,
/// size, stop_loss, take_profit, entry_reason, exit_reason, confidence, pnl,
/// pnl_pct, fees, r_multiple
pub fn export_trades_csv(trades: &[Trade]) -> Result<String> {
    let mut wtr = csv::Writer::from_writer(vec![]);

    wtr.write_record([
        "symbol",
        "side",
        "entry_time",
        "entry_price",
        "exit_time",
        "exit_price",
        "size",
        "stop_loss",
        "take_profit",
        "entry_reason",
        "exit_reason",
        "confidence",
        "pnl",
        "pnl_pct",
        "fees",
        "r_multiple",
    ])?;

    for t in trades {
        wtr.write_record([
            &t.symbol,
            t.side.as_str(),
            &t.entry_time.to_rfc3339(),
            &format!("{:.6}", t.entry_price),
            &t.exit_time.to_rfc3339(),
            &format!("{:.6}", t.exit_price),
            &format!("{:.8}", t.size),
            &format!("{:.6}", t.stop_loss),
            &format!("{:.6}", t.take_profit),
            &t.entry_reason,
            &t.exit_reason.to_string(),
            &t.confidence.map(|c| format!("{c:.4}")).unwrap_or_default(),
            &format!("{:.2}", t.pnl),
            &format!("{:.4}", t.pnl_pct),
            &format!("{:.2}", t.fees),
            &format!("{:.4}", t.r_multiple),
        ])?;
    }

    let data = wtr.into_inner().context("failed to flush CSV writer")?;
    String::from_utf8(data).context("CSV output is not valid UTF-8")
}

pub fn export_equity_csv(equity_curve: &[EquitySample]) -> Result<String> {
    let mut wtr = csv::Writer::from_writer(vec![]);
    wtr.write_record(["timestamp", "equity"])?;
    for sample in equity_curve {
        wtr.write_record([&sample.timestamp.to_rfc3339(), &format!("{:.2}", sample.equity)])?;
    }
    let data = wtr.into_inner().context("failed to flush CSV writer")?;
    String::from_utf8(data).context("CSV output is not valid UTF-8")
}

// ─── Artifact bundle ────────────────────────────────────────────────

/// Save the artifact set for one run.
///
/// Creates `{symbol}_{strategy}_{timestamp}/` under `output_dir` containing
/// `result.json`, `trades.csv` and `equity.csv`. Returns the directory.
pub fn save_artifacts(outcome: &RunOutcome, output_dir: &Path) -> Result<PathBuf> {
    let dirname = format!(
        "{}_{}_{}",
        outcome.symbol.replace(['/', '\\', ':', ' '], "_"),
        outcome.strategy,
        chrono::Utc::now().format("%Y%m%d_%H%M%S")
    );
    let run_dir = output_dir.join(dirname);
    std::fs::create_dir_all(&run_dir)
        .with_context(|| format!("failed to create artifact dir: {}", run_dir.display()))?;

    std::fs::write(run_dir.join("result.json"), export_json(outcome)?)?;
    std::fs::write(run_dir.join("trades.csv"), export_trades_csv(&outcome.trades)?)?;
    std::fs::write(run_dir.join("equity.csv"), export_equity_csv(&outcome.equity_curve)?)?;

    Ok(run_dir)
}

pub fn load_artifacts(dir: &Path) -> Result<RunOutcome> {
    let path = dir.join("result.json");
    let json = std::fs::read_to_string(&path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    import_json(&json)
}
