use anyhow::Context;
use chrono::Utc;
use clap::{Parser, Subcommand};
use market_dashboard::{
    config::AppConfig,
    sink::build_sink,
    utils::init_logger,
    worker::{self, UpdateOutcome},
    yahoo::YahooClient,
};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "market-dashboard")]
#[command(about = "Builds a trailing-returns market dashboard and writes it to a spreadsheet")]
pub struct Cli {
    /// YAML config file (falls back to CONFIG_FILE, then environment variables)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Print the table to stdout instead of the configured sink
    #[arg(long, global = true)]
    pub dry_run: bool,

    /// Debug-level logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Rebuild and write the table once
    Update {
        /// Write even when the market is closed
        #[arg(short, long)]
        force: bool,
    },
    /// Rebuild the table on an interval
    Watch {
        /// Number of updates to run (0 for infinite)
        #[arg(short, long, default_value_t = 0)]
        ticks: usize,
        /// Ignore market hours and always use the refresh interval
        #[arg(short, long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logger(cli.verbose)?;

    let config = AppConfig::load(cli.config.as_deref()).context("failed to load configuration")?;
    tracing::info!(
        pinned = config.pinned.len(),
        ranked = config.ranked.len(),
        sink = ?config.sink,
        enforce_market_hours = config.enforce_market_hours,
        "Loaded configuration"
    );

    let mut provider = YahooClient::new(true, config.rate_limit_per_minute)
        .context("failed to initialize Yahoo Finance client")?;
    let mut sink = build_sink(&config.sink, cli.dry_run).context("failed to initialize output sink")?;

    match cli.command {
        Commands::Update { force } => {
            match worker::run_once(&config, &mut provider, sink.as_mut(), force, Utc::now()).await? {
                UpdateOutcome::MarketClosed => {
                    tracing::info!("Market closed, nothing written");
                }
                UpdateOutcome::Written { rows, skipped } => {
                    tracing::info!(rows, skipped = skipped.len(), "Dashboard written");
                }
            }
        }
        Commands::Watch { ticks, force } => {
            let ticks = (ticks > 0).then_some(ticks);
            worker::run(&config, &mut provider, sink.as_mut(), force, ticks).await;
        }
    }

    Ok(())
}
