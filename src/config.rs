use crate::data_structures::{ConsensusOverrides, Symbol};
use chrono::NaiveTime;
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse YAML config: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("invalid timezone '{0}'")]
    InvalidTimezone(String),
    #[error("invalid value for {key}: '{value}'")]
    InvalidValue { key: String, value: String },
    #[error("market open {open} must be before close {close}")]
    InvalidMarketHours { open: NaiveTime, close: NaiveTime },
    #[error("watchlist is empty")]
    EmptyWatchlist,
}

// Exchange trading session, evaluated in `timezone`
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MarketHours {
    pub open: NaiveTime,     // e.g. 09:30:00
    pub close: NaiveTime,    // e.g. 16:00:00
    pub timezone: String,    // e.g. "America/New_York"
    pub weekdays_only: bool, // true for Monday-Friday only
}

impl Default for MarketHours {
    fn default() -> Self {
        Self {
            open: NaiveTime::from_hms_opt(9, 30, 0).unwrap_or_default(),
            close: NaiveTime::from_hms_opt(16, 0, 0).unwrap_or_default(),
            timezone: "America/New_York".to_string(),
            weekdays_only: true,
        }
    }
}

impl MarketHours {
    pub fn tz(&self) -> Result<Tz, ConfigError> {
        self.timezone
            .parse()
            .map_err(|_| ConfigError::InvalidTimezone(self.timezone.clone()))
    }
}

/// Where the rendered table goes.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SinkConfig {
    GoogleSheets {
        spreadsheet_id: String,
        #[serde(default = "default_sheet_name")]
        sheet_name: String,
        /// Service account key file, used when the base64 variable is unset.
        #[serde(default = "default_credentials_file")]
        credentials_file: PathBuf,
        /// Environment variable holding a base64-encoded service account key.
        #[serde(default = "default_credentials_base64_env")]
        credentials_base64_env: String,
        /// Environment variable holding a ready OAuth access token, used
        /// only when no service account key is found.
        #[serde(default = "default_token_env")]
        access_token_env: String,
    },
    Csv {
        path: PathBuf,
    },
    Stdout,
}

fn default_sheet_name() -> String {
    "Sheet1".to_string()
}

fn default_token_env() -> String {
    "GOOGLE_ACCESS_TOKEN".to_string()
}

fn default_credentials_file() -> PathBuf {
    PathBuf::from("credentials.json")
}

fn default_credentials_base64_env() -> String {
    "GOOGLE_CREDENTIALS_BASE64".to_string()
}

/// Accepted `history_days`: at least a year for the 365D column, at most ten.
pub const HISTORY_DAYS_RANGE: std::ops::RangeInclusive<i64> = 366..=3650;

// YAML-serializable configuration structure
#[derive(Serialize, Deserialize, Debug, Default)]
pub struct ConfigYaml {
    pub pinned: Option<Vec<Symbol>>,
    pub ranked: Option<Vec<Symbol>>,
    pub consensus_forward_pe: Option<ConsensusOverrides>,
    pub market_hours: Option<MarketHours>,
    pub enforce_market_hours: Option<bool>,
    pub refresh_interval_secs: Option<u64>,
    pub off_hours_interval_secs: Option<u64>,
    pub request_pause_ms: Option<u64>,
    pub rate_limit_per_minute: Option<u32>,
    pub history_days: Option<i64>,
    pub sink: Option<SinkConfig>,
    pub footer: Option<Vec<String>>,
}

// Holds application-wide settings
#[derive(Clone, Debug)]
pub struct AppConfig {
    pub pinned: Vec<Symbol>,
    pub ranked: Vec<Symbol>,
    pub consensus_forward_pe: ConsensusOverrides,
    pub market_hours: MarketHours,
    pub enforce_market_hours: bool,
    pub refresh_interval: Duration,
    pub off_hours_interval: Duration,
    pub request_pause: Duration,
    pub rate_limit_per_minute: u32,
    pub history_days: i64,
    pub sink: SinkConfig,
    pub footer: Vec<String>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            pinned: default_pinned(),
            ranked: default_ranked(),
            consensus_forward_pe: ConsensusOverrides::new(),
            market_hours: MarketHours::default(),
            enforce_market_hours: true,
            refresh_interval: Duration::from_secs(300),
            off_hours_interval: Duration::from_secs(1800),
            request_pause: Duration::from_millis(250),
            rate_limit_per_minute: 60,
            history_days: 730,
            sink: SinkConfig::Stdout,
            footer: default_footer(),
        }
    }
}

impl AppConfig {
    /// Explicit path first, then `CONFIG_FILE`, then environment variables.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        if let Some(path) = path {
            return Self::from_yaml(path);
        }
        if let Ok(config_file) = env::var("CONFIG_FILE") {
            Self::from_yaml(Path::new(&config_file))
        } else {
            Self::from_env()
        }
    }

    pub fn from_yaml(file_path: &Path) -> Result<Self, ConfigError> {
        let yaml_content = fs::read_to_string(file_path).map_err(|source| ConfigError::Read {
            path: file_path.to_path_buf(),
            source,
        })?;
        Self::from_yaml_str(&yaml_content)
    }

    pub fn from_yaml_str(yaml_content: &str) -> Result<Self, ConfigError> {
        let yaml: ConfigYaml = serde_yaml::from_str(yaml_content)?;
        let defaults = Self::default();

        let config = Self {
            pinned: yaml.pinned.unwrap_or(defaults.pinned),
            ranked: yaml.ranked.unwrap_or(defaults.ranked),
            consensus_forward_pe: yaml.consensus_forward_pe.unwrap_or_default(),
            market_hours: yaml.market_hours.unwrap_or_default(),
            enforce_market_hours: yaml.enforce_market_hours.unwrap_or(defaults.enforce_market_hours),
            refresh_interval: yaml
                .refresh_interval_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.refresh_interval),
            off_hours_interval: yaml
                .off_hours_interval_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.off_hours_interval),
            request_pause: yaml
                .request_pause_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.request_pause),
            rate_limit_per_minute: yaml.rate_limit_per_minute.unwrap_or(defaults.rate_limit_per_minute),
            history_days: yaml.history_days.unwrap_or(defaults.history_days),
            sink: yaml.sink.unwrap_or(defaults.sink),
            footer: yaml.footer.unwrap_or(defaults.footer),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok(); // Load .env file if present
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds the config from a key lookup over the built-in defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        let parse_u64 = |key: &str| -> Result<Option<u64>, ConfigError> {
            lookup(key)
                .map(|value| {
                    let parsed = value.trim().parse::<u64>();
                    parsed.map_err(|_| ConfigError::InvalidValue {
                        key: key.to_string(),
                        value,
                    })
                })
                .transpose()
        };

        if let Some(secs) = parse_u64("REFRESH_INTERVAL")? {
            config.refresh_interval = Duration::from_secs(secs);
        }
        if let Some(secs) = parse_u64("OFF_HOURS_INTERVAL")? {
            config.off_hours_interval = Duration::from_secs(secs);
        }
        if let Some(ms) = parse_u64("REQUEST_PAUSE_MS")? {
            config.request_pause = Duration::from_millis(ms);
        }
        if let Some(limit) = parse_u64("RATE_LIMIT_PER_MINUTE")? {
            config.rate_limit_per_minute = u32::try_from(limit).unwrap_or(u32::MAX);
        }
        if let Some(days) = parse_u64("HISTORY_DAYS")? {
            config.history_days = i64::try_from(days).unwrap_or(i64::MAX);
        }
        if let Some(value) = lookup("ENFORCE_MARKET_HOURS") {
            let parsed = value.trim().parse::<bool>();
            config.enforce_market_hours = parsed.map_err(|_| ConfigError::InvalidValue {
                key: "ENFORCE_MARKET_HOURS".to_string(),
                value,
            })?;
        }

        config.sink = if let Some(spreadsheet_id) = lookup("SHEET_ID") {
            SinkConfig::GoogleSheets {
                spreadsheet_id,
                sheet_name: lookup("SHEET_NAME").unwrap_or_else(default_sheet_name),
                credentials_file: lookup("GOOGLE_CREDENTIALS_FILE")
                    .map(PathBuf::from)
                    .unwrap_or_else(default_credentials_file),
                credentials_base64_env: default_credentials_base64_env(),
                access_token_env: default_token_env(),
            }
        } else if let Some(path) = lookup("OUTPUT_CSV") {
            SinkConfig::Csv { path: PathBuf::from(path) }
        } else {
            SinkConfig::Stdout
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.market_hours.tz()?;
        if self.market_hours.open >= self.market_hours.close {
            return Err(ConfigError::InvalidMarketHours {
                open: self.market_hours.open,
                close: self.market_hours.close,
            });
        }
        if self.pinned.is_empty() && self.ranked.is_empty() {
            return Err(ConfigError::EmptyWatchlist);
        }
        if !HISTORY_DAYS_RANGE.contains(&self.history_days) {
            return Err(ConfigError::InvalidValue {
                key: "history_days".to_string(),
                value: self.history_days.to_string(),
            });
        }
        Ok(())
    }

    pub fn symbol_count(&self) -> usize {
        self.pinned.len() + self.ranked.len()
    }
}

pub fn default_pinned() -> Vec<Symbol> {
    vec![
        Symbol::new("^GSPC", "S&P 500"),
        Symbol::new("^IXIC", "Nasdaq Composite"),
        Symbol::new("^DJI", "Dow Jones"),
        Symbol::new("^VIX", "VIX"),
        Symbol::new("GC=F", "Gold"),
        Symbol::new("CL=F", "Crude Oil"),
    ]
}

pub fn default_ranked() -> Vec<Symbol> {
    [
        ("NVDA", "NVIDIA"),
        ("MSFT", "Microsoft"),
        ("AAPL", "Apple"),
        ("AMZN", "Amazon"),
        ("GOOGL", "Alphabet"),
        ("META", "Meta Platforms"),
        ("AVGO", "Broadcom"),
        ("TSLA", "Tesla"),
        ("BRK-B", "Berkshire Hathaway"),
        ("JPM", "JPMorgan Chase"),
        ("WMT", "Walmart"),
        ("LLY", "Eli Lilly"),
        ("ORCL", "Oracle"),
        ("V", "Visa"),
        ("MA", "Mastercard"),
        ("NFLX", "Netflix"),
        ("XOM", "Exxon Mobil"),
        ("COST", "Costco"),
        ("JNJ", "Johnson & Johnson"),
        ("HD", "Home Depot"),
    ]
    .iter()
    .map(|(symbol, name)| Symbol::new(symbol, name))
    .collect()
}

pub fn default_footer() -> Vec<String> {
    vec![
        "Returns compare the current price with the last close on or before each calendar-day lookback.".to_string(),
        "Fwd P/E (Consensus) uses analyst consensus where configured, otherwise the provider forward P/E.".to_string(),
        "Data: Yahoo Finance. For information only.".to_string(),
    ]
}
