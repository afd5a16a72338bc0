use crate::config::{AppConfig, MarketHours};
use crate::data_structures::{PriceSeries, Quote, SkipReason, SkippedSymbol};
use crate::returns::build_table;
use crate::sink::{TableSink, render_sheet};
use crate::utils::Timer;
use crate::yahoo::MarketDataProvider;
use anyhow::Context;
use chrono::{DateTime, Datelike, Duration as ChronoDuration, NaiveDate, Utc, Weekday};
use chrono_tz::Tz;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, error, info, instrument, warn};

#[derive(Debug, Clone, PartialEq)]
pub enum UpdateOutcome {
    MarketClosed,
    Written {
        rows: usize,
        skipped: Vec<SkippedSymbol>,
    },
}

/// Everything fetched in one pass; failed symbols keep their error text.
#[derive(Debug, Default)]
pub struct MarketSnapshot {
    pub quotes: HashMap<String, Quote>,
    pub series: HashMap<String, PriceSeries>,
    pub failures: HashMap<String, String>,
}

// --- Market Hours ---

pub fn is_within_market_hours(hours: &MarketHours, now: DateTime<Utc>) -> bool {
    let tz: Tz = match hours.timezone.parse() {
        Ok(tz) => tz,
        Err(e) => {
            warn!("Failed to parse timezone '{}': {}", hours.timezone, e);
            return false; // Treat as closed if the timezone is unusable
        }
    };

    let now_local = now.with_timezone(&tz);

    if hours.weekdays_only && matches!(now_local.weekday(), Weekday::Sat | Weekday::Sun) {
        return false;
    }

    let time = now_local.time();
    time >= hours.open && time < hours.close
}

pub fn current_interval(config: &AppConfig, now: DateTime<Utc>) -> Duration {
    if !config.enforce_market_hours || is_within_market_hours(&config.market_hours, now) {
        config.refresh_interval
    } else {
        config.off_hours_interval
    }
}

fn market_tz(config: &AppConfig) -> Tz {
    config.market_hours.tz().unwrap_or(Tz::UTC)
}

// --- Update Pass ---

/// Fetches every watchlist symbol one after the other. A failed symbol is
/// logged and left out of the snapshot.
pub async fn collect_snapshot(
    config: &AppConfig,
    provider: &mut dyn MarketDataProvider,
    since: NaiveDate,
) -> MarketSnapshot {
    let mut snapshot = MarketSnapshot::default();
    let symbols: Vec<_> = config.pinned.iter().chain(config.ranked.iter()).collect();
    let total = symbols.len();

    for (idx, symbol) in symbols.into_iter().enumerate() {
        let ticker = symbol.symbol.as_str();

        match provider.fetch(ticker, since).await {
            Ok(data) => {
                debug!(symbol = ticker, points = data.series.len(), "Fetched symbol data");
                snapshot.quotes.insert(ticker.to_string(), data.quote);
                snapshot.series.insert(ticker.to_string(), data.series);
            }
            Err(e) => {
                debug!(symbol = ticker, error = %e, "Failed to fetch symbol");
                snapshot.failures.insert(ticker.to_string(), e.to_string());
            }
        }

        if !config.request_pause.is_zero() && idx + 1 < total {
            let base_ms = config.request_pause.as_millis() as u64;
            let jitter_ms = rand::random_range(0..=base_ms / 2);
            tokio::time::sleep(Duration::from_millis(base_ms + jitter_ms)).await;
        }
    }

    snapshot
}

/// One gate → fetch → build → write pass. Sink errors abort the pass.
#[instrument(skip(config, provider, sink), fields(sink = sink.name()))]
pub async fn run_once(
    config: &AppConfig,
    provider: &mut dyn MarketDataProvider,
    sink: &mut dyn TableSink,
    force: bool,
    now: DateTime<Utc>,
) -> anyhow::Result<UpdateOutcome> {
    if config.enforce_market_hours && !force && !is_within_market_hours(&config.market_hours, now) {
        info!("Market is closed, skipping update");
        return Ok(UpdateOutcome::MarketClosed);
    }

    let timer = Timer::start("dashboard update");
    let tz = market_tz(config);
    let as_of = now.with_timezone(&tz).date_naive();
    let since = ChronoDuration::try_days(config.history_days)
        .and_then(|lookback| as_of.checked_sub_signed(lookback))
        .filter(|since| *since < as_of)
        .with_context(|| format!("history_days {} is out of range", config.history_days))?;

    info!(symbols = config.symbol_count(), %as_of, %since, "Starting dashboard update");
    let snapshot = collect_snapshot(config, provider, since).await;

    let mut table = build_table(
        &config.pinned,
        &config.ranked,
        &snapshot.quotes,
        &snapshot.series,
        &config.consensus_forward_pe,
        as_of,
    );
    for skipped in &mut table.skipped {
        if let Some(message) = snapshot.failures.get(&skipped.symbol) {
            skipped.reason = SkipReason::QuoteUnavailable(message.clone());
        }
        warn!(symbol = %skipped.symbol, reason = %skipped.reason, "Symbol left out of the table");
    }

    let sheet = render_sheet(&table, now.with_timezone(&tz), &config.footer);
    sink.write(&sheet)
        .await
        .with_context(|| format!("failed to write dashboard to {}", sink.name()))?;

    info!(rows = table.rows.len(), skipped = table.skipped.len(), "Dashboard updated");
    timer.log_elapsed("WORKER");

    Ok(UpdateOutcome::Written {
        rows: table.rows.len(),
        skipped: table.skipped,
    })
}

/// Repeats `run_once` until `ticks` passes have run (forever when `None`)
/// or Ctrl+C is received.
#[instrument(skip(config, provider, sink))]
pub async fn run(
    config: &AppConfig,
    provider: &mut dyn MarketDataProvider,
    sink: &mut dyn TableSink,
    force: bool,
    ticks: Option<usize>,
) {
    let mut iteration_count = 0;

    loop {
        iteration_count += 1;
        debug!(iteration = iteration_count, "Starting update cycle");

        match run_once(config, provider, sink, force, Utc::now()).await {
            Ok(UpdateOutcome::MarketClosed) => {
                debug!(iteration = iteration_count, "Market closed");
            }
            Ok(UpdateOutcome::Written { rows, skipped }) => {
                info!(iteration = iteration_count, rows, skipped = skipped.len(), "Completed update cycle");
            }
            Err(e) => {
                error!(iteration = iteration_count, error = ?e, "Update cycle failed");
            }
        }

        if ticks.is_some_and(|limit| iteration_count >= limit) {
            info!(iterations = iteration_count, "Reached tick limit");
            break;
        }

        let interval = if force {
            config.refresh_interval
        } else {
            current_interval(config, Utc::now())
        };
        debug!(?interval, "Sleeping before next cycle");

        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = tokio::signal::ctrl_c() => {
                info!("Received Ctrl+C, stopping");
                break;
            }
        }
    }
}
