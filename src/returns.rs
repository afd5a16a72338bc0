//! Trailing-return computation and ranked table assembly.
//!
//! Everything here is pure: the same quotes, series and `as_of` date always
//! produce the same rows.

use crate::data_structures::{
    ConsensusOverrides, LOOKBACK_WINDOWS, NOT_AVAILABLE, PriceSeries, Quote, RankedTable,
    ReturnRow, RowOutcome, SkipReason, SkippedSymbol, Symbol, SymbolKind,
};
use chrono::{Duration, NaiveDate};
use std::collections::HashMap;

pub const HEADER: [&str; 15] = [
    "Name",
    "P/E (TTM)",
    "Fwd P/E (Consensus)",
    "Fwd P/E",
    "Price",
    "Market Cap",
    "1D %",
    "5D %",
    "14D %",
    "30D %",
    "90D %",
    "182D %",
    "365D %",
    "52W Low",
    "52W High",
];

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Percent change from the last close on or before `as_of - lookback_days`
/// to `current_price`, rounded to 2 decimals.
pub fn compute_return(
    series: &PriceSeries,
    as_of: NaiveDate,
    lookback_days: i64,
    current_price: f64,
) -> Option<f64> {
    let past_date = as_of - Duration::days(lookback_days);
    let past = series.at_or_before(past_date)?;

    if !past.close.is_finite() || past.close <= 0.0 || !current_price.is_finite() {
        return None;
    }

    Some(round2((current_price - past.close) / past.close * 100.0))
}

/// Returns for every window in `LOOKBACK_WINDOWS`.
pub fn compute_returns(
    series: &PriceSeries,
    as_of: NaiveDate,
    current_price: f64,
) -> [Option<f64>; 6] {
    LOOKBACK_WINDOWS.map(|days| compute_return(series, as_of, days, current_price))
}

pub fn format_market_cap(value: Option<f64>) -> String {
    match value {
        Some(v) if v.is_finite() && v >= 1e12 => format!("${:.2}T", v / 1e12),
        Some(v) if v.is_finite() && v >= 1e9 => format!("${:.2}B", v / 1e9),
        Some(v) if v.is_finite() && v > 0.0 => format!("${:.2}M", v / 1e6),
        _ => NOT_AVAILABLE.to_string(),
    }
}

/// Low/high close over the 365 days ending at `as_of`.
pub fn fifty_two_week_range(series: &PriceSeries, as_of: NaiveDate) -> Option<(f64, f64)> {
    let start = as_of - Duration::days(365);
    series
        .points()
        .iter()
        .filter(|p| p.date > start && p.date <= as_of)
        .fold(None, |acc, p| match acc {
            None => Some((p.close, p.close)),
            Some((lo, hi)) => Some((lo.min(p.close), hi.max(p.close))),
        })
}

pub fn build_row(
    symbol: &Symbol,
    kind: SymbolKind,
    quote: Option<&Quote>,
    series: Option<&PriceSeries>,
    consensus: &ConsensusOverrides,
    as_of: NaiveDate,
) -> RowOutcome {
    let skip = |reason| {
        RowOutcome::Skipped(SkippedSymbol {
            symbol: symbol.symbol.clone(),
            reason,
        })
    };

    let Some(quote) = quote else {
        return skip(SkipReason::QuoteUnavailable("no quote fetched".to_string()));
    };
    let price = match quote.price {
        Some(p) if p.is_finite() && p > 0.0 => p,
        _ => return skip(SkipReason::PriceUnavailable),
    };

    let empty = PriceSeries::default();
    let series = series.unwrap_or(&empty);

    let range = fifty_two_week_range(series, as_of);
    let fifty_two_week_low = quote.fifty_two_week_low.or(range.map(|(lo, _)| lo));
    let fifty_two_week_high = quote.fifty_two_week_high.or(range.map(|(_, hi)| hi));

    let (trailing_pe, consensus_forward_pe, forward_pe, market_cap) = match kind {
        SymbolKind::Pinned => (None, None, None, None),
        SymbolKind::Ranked => (
            quote.trailing_pe,
            consensus.get(&symbol.symbol).copied().or(quote.forward_pe),
            quote.forward_pe,
            quote.market_cap,
        ),
    };

    RowOutcome::Row(ReturnRow {
        symbol: symbol.symbol.clone(),
        name: symbol.name.clone(),
        kind,
        trailing_pe,
        consensus_forward_pe,
        forward_pe,
        price,
        market_cap,
        daily_change_percent: quote.daily_change_percent,
        returns: compute_returns(series, as_of, price),
        fifty_two_week_low,
        fifty_two_week_high,
    })
}

/// Pinned rows in input order, then ranked rows by descending market cap.
/// Symbols without a usable quote land in `skipped`.
pub fn build_table(
    pinned: &[Symbol],
    ranked: &[Symbol],
    quotes: &HashMap<String, Quote>,
    series_by_symbol: &HashMap<String, PriceSeries>,
    consensus: &ConsensusOverrides,
    as_of: NaiveDate,
) -> RankedTable {
    let mut table = RankedTable::default();
    let mut ranked_rows = Vec::with_capacity(ranked.len());

    let outcomes = pinned
        .iter()
        .map(|s| (s, SymbolKind::Pinned))
        .chain(ranked.iter().map(|s| (s, SymbolKind::Ranked)));

    for (symbol, kind) in outcomes {
        let outcome = build_row(
            symbol,
            kind,
            quotes.get(&symbol.symbol),
            series_by_symbol.get(&symbol.symbol),
            consensus,
            as_of,
        );
        match outcome {
            RowOutcome::Row(row) if row.kind == SymbolKind::Pinned => table.rows.push(row),
            RowOutcome::Row(row) => ranked_rows.push(row),
            RowOutcome::Skipped(skipped) => table.skipped.push(skipped),
        }
    }

    // sort_by is stable, ties keep watchlist order
    ranked_rows.sort_by(|a, b| {
        let cap_a = a.market_cap.unwrap_or(0.0);
        let cap_b = b.market_cap.unwrap_or(0.0);
        cap_b.total_cmp(&cap_a)
    });
    table.rows.extend(ranked_rows);

    table
}

fn fmt_number(value: Option<f64>) -> String {
    match value {
        Some(v) if v.is_finite() => format!("{:.2}", v),
        _ => NOT_AVAILABLE.to_string(),
    }
}

fn fmt_percent(value: Option<f64>) -> String {
    match value {
        Some(v) if v.is_finite() => format!("{:.2}%", v),
        _ => NOT_AVAILABLE.to_string(),
    }
}

impl ReturnRow {
    /// Display cells in `HEADER` order.
    pub fn cells(&self) -> Vec<String> {
        let mut cells = Vec::with_capacity(HEADER.len());
        cells.push(self.name.clone());
        cells.push(fmt_number(self.trailing_pe));
        cells.push(fmt_number(self.consensus_forward_pe));
        cells.push(fmt_number(self.forward_pe));
        cells.push(fmt_number(Some(self.price)));
        cells.push(format_market_cap(self.market_cap));
        cells.push(fmt_percent(self.daily_change_percent));
        cells.extend(self.returns.iter().map(|r| fmt_percent(*r)));
        cells.push(fmt_number(self.fifty_two_week_low));
        cells.push(fmt_number(self.fifty_two_week_high));
        cells
    }
}
