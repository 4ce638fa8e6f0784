//! IntraLab CLI — data update, gap report, backtest runs and store status.
//!
//! Commands:
//! - `update` — fetch candles for the configured range and backfill gaps
//! - `gaps` — report gaps in the stored dataset
//! - `run` — execute one or more backtests from TOML config files
//! - `store status` — list stored datasets with their metadata

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::prelude::*;

use intralab_core::data::{sync_candles, CandleFetcher, CandleStore, HttpCandleSource};
use intralab_runner::export::save_artifacts;
use intralab_runner::{BacktestConfig, RunJob, RunOutcome, RunPool, RunProgress, RunStage};

#[derive(Parser)]
#[command(name = "intralab", about = "IntraLab CLI — intraday backtest engine")]
struct Cli {
    /// Log filter used when RUST_LOG is unset.
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Fetch candles for the configured symbol and range, then backfill gaps.
    Update {
        /// Path to a TOML config file.
        #[arg(long)]
        config: PathBuf,
    },
    /// Report gaps in the stored dataset for the configured symbol.
    Gaps {
        #[arg(long)]
        config: PathBuf,
    },
    /// Execute backtests from TOML config files, in parallel.
    Run {
        /// One or more config files.
        #[arg(long, required = true, num_args = 1..)]
        config: Vec<PathBuf>,

        /// Output directory for result artifacts.
        #[arg(long, default_value = "results")]
        output_dir: PathBuf,

        /// Worker threads. Defaults to the number of configs.
        #[arg(long)]
        jobs: Option<usize>,
    },
    /// Candle store commands.
    Store {
        #[command(subcommand)]
        action: StoreAction,
    },
}

#[derive(Subcommand)]
enum StoreAction {
    /// List datasets with candle counts and date ranges.
    Status {
        #[arg(long)]
        config: PathBuf,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| cli.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    match cli.command {
        Commands::Update { config } => run_update(&config),
        Commands::Gaps { config } => run_gaps(&config),
        Commands::Run {
            config,
            output_dir,
            jobs,
        } => run_backtests(&config, &output_dir, jobs),
        Commands::Store { action } => match action {
            StoreAction::Status { config } => run_store_status(&config),
        },
    }
}

fn load_config(path: &Path) -> Result<BacktestConfig> {
    BacktestConfig::from_file(path).with_context(|| format!("invalid config {}", path.display()))
}

fn open_store(config: &BacktestConfig) -> CandleStore {
    CandleStore::new(&config.data.store_dir, config.scheduler.timezone)
}

fn run_update(path: &Path) -> Result<()> {
    let config = load_config(path)?;
    let store = open_store(&config);
    let source = HttpCandleSource::new(
        &config.data.base_url,
        Duration::from_secs(config.data.request_timeout_secs),
    )?
    .with_name(&config.data.source_name);
    let fetcher = CandleFetcher::new(source, config.data.fetcher.clone());
    let request = config.request();
    tracing::info!(
        symbol = %request.symbol,
        timeframe = %request.timeframe,
        source = %config.data.source_name,
        "updating candles"
    );

    let report = sync_candles(
        &fetcher,
        &store,
        &request.symbol,
        request.timeframe,
        request.start,
        request.end,
        config.data.gap_tolerance(),
    )?;

    println!("Symbol:          {} {}", request.symbol, request.timeframe);
    println!("Fetched:         {}", report.fetched);
    println!("Backfilled:      {}", report.backfilled);
    println!("Gaps found:      {}", report.gaps_found);
    println!("Gaps remaining:  {}", report.gaps_remaining);
    Ok(())
}

fn run_gaps(path: &Path) -> Result<()> {
    let config = load_config(path)?;
    let store = open_store(&config);
    let symbol = &config.run.symbol;
    let timeframe = config.run.timeframe;

    let gaps = store.check_gaps(symbol, timeframe, config.data.gap_tolerance())?;
    if gaps.is_empty() {
        println!("No gaps in {symbol} {timeframe}.");
        return Ok(());
    }

    let tz = config.scheduler.timezone;
    println!("{:<27} {:<27} {:>8}", "From (local)", "To (local)", "Missing");
    println!("{}", "-".repeat(64));
    for gap in &gaps {
        println!(
            "{:<27} {:<27} {:>8}",
            gap.start.with_timezone(&tz).format("%Y-%m-%d %H:%M %Z").to_string(),
            gap.end.with_timezone(&tz).format("%Y-%m-%d %H:%M %Z").to_string(),
            gap.missing_candles(timeframe.interval())
        );
    }
    println!("{} gap(s) in {symbol} {timeframe}.", gaps.len());
    Ok(())
}

fn run_backtests(paths: &[PathBuf], output_dir: &Path, jobs: Option<usize>) -> Result<()> {
    let configs = paths
        .iter()
        .map(|p| load_config(p))
        .collect::<Result<Vec<_>>>()?;

    let threads = jobs.unwrap_or(configs.len()).max(1);
    let pool = RunPool::new(threads, 1)?;

    let mut handles = Vec::with_capacity(configs.len());
    for config in configs {
        let store = Arc::new(open_store(&config));
        let label = format!("{} {}", config.run.symbol, config.strategy.kind);
        let observer = move |p: &RunProgress| {
            if p.stage != RunStage::Complete {
                eprintln!("[{label}] {:>5.1}% {}: {}", p.percent, p.stage, p.message);
            }
        };
        handles.push(pool.submit(RunJob {
            config,
            store,
            observer: Some(Arc::new(observer)),
        })?);
    }

    let mut failed = 0usize;
    for handle in handles {
        match handle.wait()? {
            Ok(outcome) => {
                print_summary(&outcome);
                let run_dir = save_artifacts(&outcome, output_dir)?;
                println!("Artifacts saved to: {}", run_dir.display());
            }
            Err(failure) => {
                failed += 1;
                eprintln!();
                eprintln!("=== {} [{}] ===", failure.title, failure.code);
                eprintln!("Symbol:  {}", failure.symbol);
                eprintln!("Range:   {} to {}", failure.start, failure.end);
                eprintln!("Reason:  {}", failure.message);
                eprintln!("Elapsed: {:.2}s", failure.elapsed_secs);
            }
        }
    }

    if failed > 0 {
        bail!("{failed} backtest(s) failed");
    }
    Ok(())
}

fn run_store_status(path: &Path) -> Result<()> {
    let config = load_config(path)?;
    let store = open_store(&config);
    let datasets = store.list_datasets()?;
    if datasets.is_empty() {
        println!("Store is empty: {}", store.root().display());
        return Ok(());
    }

    println!("Store: {}", store.root().display());
    println!();
    println!(
        "{:<14} {:<4} {:>9} {:<22} {:<22}",
        "Symbol", "TF", "Candles", "First (UTC)", "Last (UTC)"
    );
    println!("{}", "-".repeat(75));
    for (symbol, timeframe) in &datasets {
        match store.status(symbol, *timeframe) {
            Some(meta) => println!(
                "{:<14} {:<4} {:>9} {:<22} {:<22}",
                symbol,
                timeframe.as_str(),
                meta.candle_count,
                meta.first.format("%Y-%m-%d %H:%M").to_string(),
                meta.last.format("%Y-%m-%d %H:%M").to_string()
            ),
            None => println!("{:<14} {:<4} {:>9}", symbol, timeframe.as_str(), "(no meta)"),
        }
    }
    Ok(())
}

fn print_summary(outcome: &RunOutcome) {
    let m = &outcome.metrics;
    println!();
    println!("=== Backtest Result ===");
    println!("Symbol:         {} {}", outcome.symbol, outcome.timeframe);
    println!("Strategy:       {}", outcome.strategy);
    println!("Period:         {} to {}", outcome.start, outcome.end);
    println!("Candles:        {}", outcome.candles_processed);
    println!("Trades:         {} ({} won, {} lost)", m.trade_count, m.winning_trades, m.losing_trades);
    println!();
    println!("--- Performance ---");
    println!("Final Equity:   {:.2}", m.final_equity);
    println!("Total Return:   {:.2}%", m.total_return_pct);
    println!("CAGR:           {:.2}%", m.cagr * 100.0);
    println!("Sharpe:         {:.3}", m.sharpe);
    println!("Max Drawdown:   {:.2}%", m.max_drawdown_pct);
    println!("Win Rate:       {:.1}%", m.win_rate * 100.0);
    println!("Profit Factor:  {:.2}", m.profit_factor);
    println!("Expectancy:     {:.2}", m.expectancy);
    println!("Avg R:          {:.2}", m.avg_r_multiple);
    println!("Fees:           {:.2}", m.total_fees);
    println!("Elapsed:        {:.2}s", outcome.elapsed_secs);
    println!();
}
