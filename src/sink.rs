//! Output side of a dashboard update: the cell grid and where it is written.

use crate::config::SinkConfig;
use crate::data_structures::{RankedTable, SheetContents};
use crate::returns::HEADER;
use crate::sheets::{GoogleSheetsSink, SheetsAuth};
use async_trait::async_trait;
use chrono::DateTime;
use chrono_tz::Tz;
use reqwest::StatusCode;
use std::path::PathBuf;
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("invalid url: {0}")]
    InvalidUrl(String),
    #[error("sheets api returned {status}: {body}")]
    Api { status: StatusCode, body: String },
    #[error("no Google credentials found: {0}")]
    MissingCredentials(String),
    #[error("invalid Google credentials: {0}")]
    Credentials(String),
    #[error("google auth error: {0}")]
    Auth(#[from] gcp_auth::Error),
}

/// Destination for the rendered grid. Each write replaces the previous
/// contents entirely.
#[async_trait]
pub trait TableSink: Send {
    fn name(&self) -> &str;

    async fn write(&mut self, sheet: &SheetContents) -> Result<(), SinkError>;
}

/// Header, rows, "Last Updated" lines, then the footer.
pub fn render_sheet(table: &RankedTable, updated_at: DateTime<Tz>, footer: &[String]) -> SheetContents {
    let mut rows: Vec<Vec<String>> = Vec::with_capacity(table.rows.len() + footer.len() + 5);

    rows.push(HEADER.iter().map(|h| h.to_string()).collect());
    rows.extend(table.rows.iter().map(|row| row.cells()));
    rows.push(Vec::new());
    rows.push(vec!["Last Updated".to_string()]);
    rows.push(vec![updated_at.format("%Y-%m-%d %H:%M:%S %Z").to_string()]);

    if !footer.is_empty() {
        rows.push(Vec::new());
        rows.extend(footer.iter().map(|line| vec![line.clone()]));
    }

    SheetContents { rows }
}

pub fn build_sink(config: &SinkConfig, dry_run: bool) -> Result<Box<dyn TableSink>, SinkError> {
    if dry_run {
        return Ok(Box::new(StdoutSink));
    }
    match config {
        SinkConfig::GoogleSheets {
            spreadsheet_id,
            sheet_name,
            credentials_file,
            credentials_base64_env,
            access_token_env,
        } => {
            let auth = SheetsAuth::resolve(
                credentials_file,
                credentials_base64_env,
                access_token_env,
                |key| std::env::var(key).ok(),
            )?;
            Ok(Box::new(GoogleSheetsSink::new(spreadsheet_id, sheet_name, auth)?))
        }
        SinkConfig::Csv { path } => Ok(Box::new(CsvSink::new(path.clone()))),
        SinkConfig::Stdout => Ok(Box::new(StdoutSink)),
    }
}

// --- CSV ---

pub struct CsvSink {
    path: PathBuf,
}

impl CsvSink {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }
}

#[async_trait]
impl TableSink for CsvSink {
    fn name(&self) -> &str {
        "csv"
    }

    async fn write(&mut self, sheet: &SheetContents) -> Result<(), SinkError> {
        let width = sheet.width();
        let mut writer = csv::Writer::from_path(&self.path)?;

        for row in &sheet.rows {
            let padding = width.saturating_sub(row.len());
            writer.write_record(row.iter().map(String::as_str).chain(std::iter::repeat_n("", padding)))?;
        }
        writer.flush()?;

        info!(path = %self.path.display(), rows = sheet.rows.len(), "Wrote CSV");
        Ok(())
    }
}

// --- Stdout ---

pub struct StdoutSink;

/// Left-aligned columns separated by two spaces.
pub fn render_text(sheet: &SheetContents) -> String {
    let mut widths = vec![0usize; sheet.width()];
    // Single-cell rows (timestamps, footer) don't stretch the first column
    for row in sheet.rows.iter().filter(|r| r.len() > 1) {
        for (i, cell) in row.iter().enumerate() {
            widths[i] = widths[i].max(cell.chars().count());
        }
    }

    let mut out = String::new();
    for row in &sheet.rows {
        let line = row
            .iter()
            .enumerate()
            .map(|(i, cell)| {
                if row.len() == 1 {
                    cell.clone()
                } else {
                    format!("{:<width$}", cell, width = widths[i])
                }
            })
            .collect::<Vec<_>>()
            .join("  ");
        out.push_str(line.trim_end());
        out.push('\n');
    }
    out
}

#[async_trait]
impl TableSink for StdoutSink {
    fn name(&self) -> &str {
        "stdout"
    }

    async fn write(&mut self, sheet: &SheetContents) -> Result<(), SinkError> {
        print!("{}", render_text(sheet));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data_structures::{ReturnRow, SymbolKind};
    use chrono::TimeZone;
    use chrono_tz::America::New_York;

    fn row(name: &str, price: f64, cap: Option<f64>) -> ReturnRow {
        ReturnRow {
            symbol: name.to_string(),
            name: name.to_string(),
            kind: SymbolKind::Ranked,
            trailing_pe: Some(30.0),
            consensus_forward_pe: Some(28.0),
            forward_pe: Some(27.5),
            price,
            market_cap: cap,
            daily_change_percent: Some(1.5),
            returns: [Some(1.0), Some(2.0), None, Some(-3.25), None, Some(40.0)],
            fifty_two_week_low: Some(price * 0.8),
            fifty_two_week_high: Some(price * 1.2),
        }
    }

    fn table() -> RankedTable {
        RankedTable {
            rows: vec![row("Apple", 200.0, Some(3.1e12)), row("Visa", 300.0, Some(6e11))],
            skipped: Vec::new(),
        }
    }

    fn updated_at() -> DateTime<Tz> {
        New_York.with_ymd_and_hms(2025, 7, 1, 15, 45, 0).unwrap()
    }

    #[test]
    fn test_render_sheet_layout() {
        let footer = vec!["note one".to_string(), "note two".to_string()];
        let sheet = render_sheet(&table(), updated_at(), &footer);

        assert_eq!(sheet.rows[0], HEADER.iter().map(|h| h.to_string()).collect::<Vec<_>>());
        assert_eq!(sheet.rows[1][0], "Apple");
        assert_eq!(sheet.rows[1][5], "$3.10T");
        assert_eq!(sheet.rows[2][0], "Visa");
        assert!(sheet.rows[3].is_empty());
        assert_eq!(sheet.rows[4], vec!["Last Updated".to_string()]);
        assert_eq!(sheet.rows[5], vec!["2025-07-01 15:45:00 EDT".to_string()]);
        assert!(sheet.rows[6].is_empty());
        assert_eq!(sheet.rows[7], vec!["note one".to_string()]);
        assert_eq!(sheet.rows[8], vec!["note two".to_string()]);
        assert_eq!(sheet.width(), HEADER.len());
    }

    #[test]
    fn test_render_sheet_without_footer() {
        let sheet = render_sheet(&RankedTable::default(), updated_at(), &[]);
        assert_eq!(sheet.rows.len(), 4);
    }

    #[test]
    fn test_render_text_aligns_columns() {
        let sheet = SheetContents {
            rows: vec![
                vec!["Name".to_string(), "Price".to_string()],
                vec!["Alphabet".to_string(), "1.00".to_string()],
                vec!["a long single-cell footer line".to_string()],
            ],
        };
        let text = render_text(&sheet);
        let lines: Vec<_> = text.lines().collect();

        assert_eq!(lines[0], "Name      Price");
        assert_eq!(lines[1], "Alphabet  1.00");
        assert_eq!(lines[2], "a long single-cell footer line");
    }

    #[tokio::test]
    async fn test_csv_sink_writes_full_grid() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dashboard.csv");
        let sheet = render_sheet(&table(), updated_at(), &["footer".to_string()]);

        let mut sink = CsvSink::new(path.clone());
        sink.write(&sheet).await.unwrap();

        let mut reader = csv::ReaderBuilder::new().has_headers(false).from_path(&path).unwrap();
        let records: Vec<csv::StringRecord> = reader.records().collect::<Result<_, _>>().unwrap();

        assert_eq!(records.len(), sheet.rows.len());
        assert_eq!(&records[0][0], "Name");
        assert_eq!(&records[1][0], "Apple");
        assert_eq!(&records[1][9], "N/A");
        assert!(records.iter().all(|r| r.len() == HEADER.len()));
    }

    #[tokio::test]
    async fn test_csv_sink_replaces_previous_contents() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dashboard.csv");
        let mut sink = CsvSink::new(path.clone());

        sink.write(&render_sheet(&table(), updated_at(), &[])).await.unwrap();
        sink.write(&render_sheet(&RankedTable::default(), updated_at(), &[])).await.unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(!contents.contains("Apple"));
    }

    #[test]
    fn test_build_sink_dry_run_is_stdout() {
        let config = SinkConfig::Csv { path: PathBuf::from("/tmp/x.csv") };
        let sink = build_sink(&config, true).unwrap();
        assert_eq!(sink.name(), "stdout");
        assert_eq!(build_sink(&config, false).unwrap().name(), "csv");
    }

    #[test]
    fn test_build_sink_requires_credentials() {
        let config = SinkConfig::GoogleSheets {
            spreadsheet_id: "id".to_string(),
            sheet_name: "Sheet1".to_string(),
            credentials_file: PathBuf::from("/nonexistent/market-dashboard/credentials.json"),
            credentials_base64_env: "MARKET_DASHBOARD_TEST_KEY_THAT_IS_NEVER_SET".to_string(),
            access_token_env: "MARKET_DASHBOARD_TEST_TOKEN_THAT_IS_NEVER_SET".to_string(),
        };
        assert!(matches!(build_sink(&config, false), Err(SinkError::MissingCredentials(_))));
    }
}
