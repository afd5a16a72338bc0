use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Marker written into any cell whose value could not be computed.
pub const NOT_AVAILABLE: &str = "N/A";

/// Calendar-day lookback windows, in column order.
pub const LOOKBACK_WINDOWS: [i64; 6] = [5, 14, 30, 90, 182, 365];

// --- Watchlist ---

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Symbol {
    pub symbol: String,
    pub name: String,
}

impl Symbol {
    pub fn new(symbol: &str, name: &str) -> Self {
        Self {
            symbol: symbol.to_string(),
            name: name.to_string(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SymbolKind {
    /// Index or commodity benchmark, always listed first.
    Pinned,
    /// Equity, ranked by market capitalization.
    Ranked,
}

// Consensus forward P/E keyed by ticker
pub type ConsensusOverrides = HashMap<String, f64>;

// --- Market Data ---

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct PricePoint {
    pub date: NaiveDate,
    pub close: f64,
}

/// Daily closes for one symbol, strictly ascending by date.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct PriceSeries {
    points: Vec<PricePoint>,
}

impl PriceSeries {
    /// Builds a series from provider data in any order. Non-finite closes are
    /// dropped and a repeated date keeps the value seen last.
    pub fn new(points: Vec<PricePoint>) -> Self {
        let mut points: Vec<PricePoint> = points
            .into_iter()
            .filter(|p| p.close.is_finite())
            .collect();
        points.sort_by_key(|p| p.date);

        let mut deduped: Vec<PricePoint> = Vec::with_capacity(points.len());
        for point in points {
            match deduped.last_mut() {
                Some(last) if last.date == point.date => *last = point,
                _ => deduped.push(point),
            }
        }

        Self { points: deduped }
    }

    pub fn points(&self) -> &[PricePoint] {
        &self.points
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn last(&self) -> Option<&PricePoint> {
        self.points.last()
    }

    /// Most recent point dated on or before `date`.
    pub fn at_or_before(&self, date: NaiveDate) -> Option<&PricePoint> {
        let idx = self.points.partition_point(|p| p.date <= date);
        idx.checked_sub(1).map(|i| &self.points[i])
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Quote {
    pub price: Option<f64>,
    pub daily_change_percent: Option<f64>,
    pub fifty_two_week_low: Option<f64>,
    pub fifty_two_week_high: Option<f64>,
    pub market_cap: Option<f64>,
    pub trailing_pe: Option<f64>,
    pub forward_pe: Option<f64>,
}

/// Everything fetched for one symbol in a single provider call.
#[derive(Clone, Debug, PartialEq)]
pub struct SymbolData {
    pub quote: Quote,
    pub series: PriceSeries,
}

// --- Output Rows ---

#[derive(Clone, Debug, PartialEq)]
pub struct ReturnRow {
    pub symbol: String,
    pub name: String,
    pub kind: SymbolKind,
    pub trailing_pe: Option<f64>,
    pub consensus_forward_pe: Option<f64>,
    pub forward_pe: Option<f64>,
    pub price: f64,
    pub market_cap: Option<f64>,
    pub daily_change_percent: Option<f64>,
    /// One entry per `LOOKBACK_WINDOWS` element.
    pub returns: [Option<f64>; 6],
    pub fifty_two_week_low: Option<f64>,
    pub fifty_two_week_high: Option<f64>,
}

#[derive(Clone, Debug, PartialEq)]
pub enum SkipReason {
    QuoteUnavailable(String),
    PriceUnavailable,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::QuoteUnavailable(msg) => write!(f, "quote unavailable: {}", msg),
            SkipReason::PriceUnavailable => write!(f, "current price unavailable"),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct SkippedSymbol {
    pub symbol: String,
    pub reason: SkipReason,
}

#[derive(Clone, Debug, PartialEq)]
pub enum RowOutcome {
    Row(ReturnRow),
    Skipped(SkippedSymbol),
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct RankedTable {
    pub rows: Vec<ReturnRow>,
    pub skipped: Vec<SkippedSymbol>,
}

/// Cell grid handed to a sink, header row first.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SheetContents {
    pub rows: Vec<Vec<String>>,
}

impl SheetContents {
    pub fn width(&self) -> usize {
        self.rows.iter().map(Vec::len).max().unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 1, d).unwrap()
    }

    #[test]
    fn test_series_sorts_and_dedups() {
        let series = PriceSeries::new(vec![
            PricePoint { date: day(3), close: 3.0 },
            PricePoint { date: day(1), close: 1.0 },
            PricePoint { date: day(3), close: 30.0 },
            PricePoint { date: day(2), close: f64::NAN },
        ]);

        let dates: Vec<_> = series.points().iter().map(|p| p.date).collect();
        assert_eq!(dates, vec![day(1), day(3)]);
        assert_eq!(series.last().unwrap().close, 30.0);
    }

    #[test]
    fn test_at_or_before() {
        let series = PriceSeries::new(vec![
            PricePoint { date: day(2), close: 2.0 },
            PricePoint { date: day(5), close: 5.0 },
        ]);

        assert!(series.at_or_before(day(1)).is_none());
        assert_eq!(series.at_or_before(day(2)).unwrap().close, 2.0);
        assert_eq!(series.at_or_before(day(4)).unwrap().close, 2.0);
        assert_eq!(series.at_or_before(day(9)).unwrap().close, 5.0);
    }
}
