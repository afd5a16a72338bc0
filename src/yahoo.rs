use crate::data_structures::{PricePoint, PriceSeries, Quote, SymbolData};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use reqwest::{Client, StatusCode, Url};
use serde::Deserialize;
use std::time::{Duration as StdDuration, SystemTime};
use thiserror::Error;
use tokio::time::sleep;
use tracing::{debug, warn};

const BASE_URL: &str = "https://query1.finance.yahoo.com";
const COOKIE_URL: &str = "https://fc.yahoo.com";

#[derive(Debug, Error)]
pub enum YahooError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("invalid url: {0}")]
    InvalidUrl(String),
    #[error("unexpected status {status} from {url}")]
    Status { status: StatusCode, url: String },
    #[error("api error [{code}]: {description}")]
    Api { code: String, description: String },
    #[error("invalid response: {0}")]
    InvalidResponse(String),
    #[error("no data")]
    NoData,
}

/// Source of quotes and daily closes, one symbol per call.
#[async_trait]
pub trait MarketDataProvider: Send {
    async fn fetch(&mut self, symbol: &str, since: NaiveDate) -> Result<SymbolData, YahooError>;
}

// --- Wire Format ---

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    code: String,
    description: String,
}

#[derive(Debug, Deserialize)]
struct ChartResponse {
    chart: ChartEnvelope,
}

#[derive(Debug, Deserialize)]
struct ChartEnvelope {
    result: Option<Vec<ChartData>>,
    error: Option<ApiErrorBody>,
}

#[derive(Debug, Deserialize)]
struct ChartData {
    meta: ChartMeta,
    #[serde(default)]
    timestamp: Vec<i64>,
    indicators: Indicators,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChartMeta {
    regular_market_price: Option<f64>,
    fifty_two_week_low: Option<f64>,
    fifty_two_week_high: Option<f64>,
    #[serde(default)]
    gmtoffset: i64,
}

#[derive(Debug, Deserialize)]
struct Indicators {
    #[serde(default)]
    quote: Vec<QuoteIndicator>,
}

#[derive(Debug, Deserialize)]
struct QuoteIndicator {
    #[serde(default)]
    close: Vec<Option<f64>>,
}

#[derive(Debug, Deserialize)]
struct QuoteResponse {
    #[serde(rename = "quoteResponse")]
    quote_response: QuoteEnvelope,
}

#[derive(Debug, Deserialize)]
struct QuoteEnvelope {
    #[serde(default)]
    result: Vec<QuoteResult>,
    error: Option<ApiErrorBody>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct QuoteResult {
    symbol: String,
    regular_market_price: Option<f64>,
    regular_market_change_percent: Option<f64>,
    fifty_two_week_low: Option<f64>,
    fifty_two_week_high: Option<f64>,
    market_cap: Option<f64>,
    #[serde(rename = "trailingPE")]
    trailing_pe: Option<f64>,
    #[serde(rename = "forwardPE")]
    forward_pe: Option<f64>,
}

/// Parses a chart payload into daily closes plus a quote built from the
/// chart metadata (no valuation fields).
pub fn parse_chart(json: &str) -> Result<SymbolData, YahooError> {
    let response: ChartResponse = serde_json::from_str(json)?;

    if let Some(error) = response.chart.error {
        return Err(YahooError::Api {
            code: error.code,
            description: error.description,
        });
    }

    let data = response
        .chart
        .result
        .and_then(|results| results.into_iter().next())
        .ok_or(YahooError::NoData)?;

    let closes = data
        .indicators
        .quote
        .first()
        .map(|q| q.close.as_slice())
        .unwrap_or_default();
    if closes.len() != data.timestamp.len() {
        return Err(YahooError::InvalidResponse(format!(
            "{} timestamps but {} closes",
            data.timestamp.len(),
            closes.len()
        )));
    }

    // Bars are stamped in UTC; shift by the exchange offset to get the trading date
    let mut points = Vec::with_capacity(closes.len());
    for (ts, close) in data.timestamp.iter().zip(closes) {
        let Some(close) = close else { continue };
        let time = DateTime::<Utc>::from_timestamp(ts + data.meta.gmtoffset, 0).ok_or_else(|| {
            YahooError::InvalidResponse(format!("cannot convert timestamp {} to a date", ts))
        })?;
        points.push(PricePoint {
            date: time.date_naive(),
            close: *close,
        });
    }
    let series = PriceSeries::new(points);

    let price = data
        .meta
        .regular_market_price
        .or_else(|| series.last().map(|p| p.close));
    let previous_close = series
        .len()
        .checked_sub(2)
        .map(|i| series.points()[i].close);
    let daily_change_percent = match (price, previous_close) {
        (Some(price), Some(prev)) if prev > 0.0 => Some((price - prev) / prev * 100.0),
        _ => None,
    };

    let quote = Quote {
        price,
        daily_change_percent,
        fifty_two_week_low: data.meta.fifty_two_week_low,
        fifty_two_week_high: data.meta.fifty_two_week_high,
        ..Quote::default()
    };

    Ok(SymbolData { quote, series })
}

pub fn parse_quote(json: &str, symbol: &str) -> Result<Quote, YahooError> {
    let response: QuoteResponse = serde_json::from_str(json)?;

    if let Some(error) = response.quote_response.error {
        return Err(YahooError::Api {
            code: error.code,
            description: error.description,
        });
    }

    let result = response
        .quote_response
        .result
        .into_iter()
        .find(|q| q.symbol.eq_ignore_ascii_case(symbol))
        .ok_or(YahooError::NoData)?;

    Ok(Quote {
        price: result.regular_market_price,
        daily_change_percent: result.regular_market_change_percent,
        fifty_two_week_low: result.fifty_two_week_low,
        fifty_two_week_high: result.fifty_two_week_high,
        market_cap: result.market_cap,
        trailing_pe: result.trailing_pe,
        forward_pe: result.forward_pe,
    })
}

/// Fields from the quote endpoint win; chart metadata fills the gaps.
fn merge_quotes(primary: Quote, fallback: Quote) -> Quote {
    Quote {
        price: primary.price.or(fallback.price),
        daily_change_percent: primary.daily_change_percent.or(fallback.daily_change_percent),
        fifty_two_week_low: primary.fifty_two_week_low.or(fallback.fifty_two_week_low),
        fifty_two_week_high: primary.fifty_two_week_high.or(fallback.fifty_two_week_high),
        market_cap: primary.market_cap.or(fallback.market_cap),
        trailing_pe: primary.trailing_pe.or(fallback.trailing_pe),
        forward_pe: primary.forward_pe.or(fallback.forward_pe),
    }
}

// --- Client ---

pub struct YahooClient {
    client: Client,
    base_url: String,
    cookie_url: String,
    rate_limit_per_minute: u32,
    request_timestamps: Vec<SystemTime>,
    user_agents: Vec<String>,
    random_agent: bool,
    crumb: Option<String>,
}

impl YahooClient {
    pub fn new(random_agent: bool, rate_limit_per_minute: u32) -> Result<Self, YahooError> {
        let client = Client::builder()
            .timeout(StdDuration::from_secs(30))
            .cookie_store(true)
            .build()?;

        let user_agents = vec![
            "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36".to_string(),
            "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36".to_string(),
            "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:120.0) Gecko/20100101 Firefox/120.0".to_string(),
            "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/16.3 Safari/605.1.15".to_string(),
        ];

        Ok(YahooClient {
            client,
            base_url: BASE_URL.to_string(),
            cookie_url: COOKIE_URL.to_string(),
            rate_limit_per_minute: rate_limit_per_minute.max(1),
            request_timestamps: Vec::new(),
            user_agents,
            random_agent,
            crumb: None,
        })
    }

    /// Points the client at another API host and cookie page.
    pub fn with_endpoints(mut self, base_url: &str, cookie_url: &str) -> Self {
        self.base_url = base_url.to_string();
        self.cookie_url = cookie_url.to_string();
        self
    }

    fn get_user_agent(&self) -> String {
        if self.random_agent {
            use rand::seq::IndexedRandom;
            self.user_agents
                .choose(&mut rand::rng())
                .cloned()
                .unwrap_or_default()
        } else {
            self.user_agents.first().cloned().unwrap_or_default()
        }
    }

    async fn enforce_rate_limit(&mut self) {
        let current_time = SystemTime::now();

        // Remove timestamps older than 1 minute
        self.request_timestamps.retain(|&timestamp| {
            current_time.duration_since(timestamp).unwrap_or(StdDuration::from_secs(0)) < StdDuration::from_secs(60)
        });

        // If we're at the rate limit, wait
        if self.request_timestamps.len() >= self.rate_limit_per_minute as usize {
            if let Some(&oldest_request) = self.request_timestamps.first() {
                let elapsed = current_time.duration_since(oldest_request).unwrap_or(StdDuration::from_secs(0));
                let wait_time = StdDuration::from_secs(60).saturating_sub(elapsed);
                if !wait_time.is_zero() {
                    debug!(wait_ms = wait_time.as_millis() as u64, "Rate limit reached, waiting");
                    sleep(wait_time + StdDuration::from_millis(100)).await;
                }
            }
        }

        self.request_timestamps.push(current_time);
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url, YahooError> {
        let mut url = Url::parse(&self.base_url).map_err(|e| YahooError::InvalidUrl(e.to_string()))?;
        url.path_segments_mut()
            .map_err(|_| YahooError::InvalidUrl(self.base_url.clone()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    async fn get_text(&mut self, url: Url, query: &[(&str, String)]) -> Result<String, YahooError> {
        self.enforce_rate_limit().await;

        let response = self
            .client
            .get(url.clone())
            .query(query)
            .header("Accept", "application/json, text/plain, */*")
            .header("Accept-Language", "en-US,en;q=0.9")
            .header("User-Agent", self.get_user_agent())
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(YahooError::Status {
                status,
                url: url.to_string(),
            });
        }
        Ok(response.text().await?)
    }

    /// Cookie + crumb handshake required by the quote endpoint.
    async fn ensure_crumb(&mut self) -> Result<String, YahooError> {
        if let Some(crumb) = &self.crumb {
            return Ok(crumb.clone());
        }

        // Sets the session cookie; the page itself answers 404
        let _ = self
            .client
            .get(&self.cookie_url)
            .header("User-Agent", self.get_user_agent())
            .send()
            .await?;

        let url = self.endpoint(&["v1", "test", "getcrumb"])?;
        let crumb = self.get_text(url, &[]).await?.trim().to_string();
        if crumb.is_empty() || crumb.contains('<') {
            return Err(YahooError::InvalidResponse("empty crumb".to_string()));
        }

        debug!("Obtained quote crumb");
        self.crumb = Some(crumb.clone());
        Ok(crumb)
    }

    /// Daily closes from `since` until now, plus a chart-derived quote.
    pub async fn get_history(&mut self, symbol: &str, since: NaiveDate) -> Result<SymbolData, YahooError> {
        let url = self.endpoint(&["v8", "finance", "chart", symbol])?;
        let period1 = since.and_time(NaiveTime::MIN).and_utc().timestamp();
        let period2 = Utc::now().timestamp();

        let body = self
            .get_text(
                url,
                &[
                    ("period1", period1.to_string()),
                    ("period2", period2.to_string()),
                    ("interval", "1d".to_string()),
                    ("includePrePost", "false".to_string()),
                ],
            )
            .await?;
        parse_chart(&body)
    }

    pub async fn get_quote(&mut self, symbol: &str) -> Result<Quote, YahooError> {
        let crumb = self.ensure_crumb().await?;
        let url = self.endpoint(&["v7", "finance", "quote"])?;

        let result = self
            .get_text(url, &[("symbols", symbol.to_string()), ("crumb", crumb)])
            .await;
        if let Err(YahooError::Status { status, .. }) = &result {
            if *status == StatusCode::UNAUTHORIZED || *status == StatusCode::FORBIDDEN {
                // Crumb expired with the session; the next call renews it
                self.crumb = None;
            }
        }
        parse_quote(&result?, symbol)
    }
}

#[async_trait]
impl MarketDataProvider for YahooClient {
    async fn fetch(&mut self, symbol: &str, since: NaiveDate) -> Result<SymbolData, YahooError> {
        let mut data = self.get_history(symbol, since).await?;
        if data.series.is_empty() {
            warn!(symbol, "Chart returned no daily closes, returns will be N/A");
        }

        match self.get_quote(symbol).await {
            Ok(quote) => data.quote = merge_quotes(quote, data.quote),
            Err(e) => {
                warn!(symbol, error = %e, "Quote endpoint failed, using chart metadata only");
            }
        }

        debug!(symbol, points = data.series.len(), price = ?data.quote.price, "Fetched symbol");
        Ok(data)
    }
}
