//! # market-dashboard
//!
//! Polls Yahoo Finance for a fixed watchlist of benchmarks and equities,
//! computes trailing returns over calendar-day windows and writes a ranked
//! table to a Google Sheet, a CSV file or stdout.
//!
//! The table logic in [`returns`] is pure and can be used on its own:
//!
//! ```rust
//! use market_dashboard::returns::format_market_cap;
//!
//! assert_eq!(format_market_cap(Some(2.3e9)), "$2.30B");
//! ```

pub mod config;
pub mod data_structures;
pub mod returns;
pub mod sheets;
pub mod sink;
pub mod utils;
pub mod worker;
pub mod yahoo;

pub mod prelude {
    pub use crate::config::{AppConfig, MarketHours, SinkConfig};
    pub use crate::data_structures::{
        PricePoint, PriceSeries, Quote, RankedTable, ReturnRow, RowOutcome, SkipReason, Symbol,
    };
    pub use crate::returns::{build_table, compute_return, format_market_cap};
    pub use crate::sink::{TableSink, build_sink, render_sheet};
    pub use crate::worker::{UpdateOutcome, is_within_market_hours, run_once};
    pub use crate::yahoo::{MarketDataProvider, YahooClient};
}
