use crate::data_structures::SheetContents;
use crate::sink::{SinkError, TableSink};
use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose};
use gcp_auth::{CustomServiceAccount, TokenProvider};
use reqwest::{Client, Response, Url};
use serde_json::{Value, json};
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info};

const SHEETS_API: &str = "https://sheets.googleapis.com/v4/spreadsheets";
const SPREADSHEETS_SCOPE: &str = "https://www.googleapis.com/auth/spreadsheets";

/// Where bearer tokens for the Sheets API come from.
pub enum SheetsAuth {
    /// Service account key. Tokens are cached and renewed before they expire.
    ServiceAccount(Box<CustomServiceAccount>),
    /// Pre-issued OAuth access token, sent as is.
    AccessToken(String),
}

impl SheetsAuth {
    /// Base64 key from `credentials_base64_env`, then the key file, then a
    /// raw token from `access_token_env`.
    pub fn resolve<F>(
        credentials_file: &Path,
        credentials_base64_env: &str,
        access_token_env: &str,
        lookup: F,
    ) -> Result<Self, SinkError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(encoded) = lookup(credentials_base64_env) {
            let decoded = general_purpose::STANDARD
                .decode(encoded.trim())
                .map_err(|e| SinkError::Credentials(format!("{} is not valid base64: {}", credentials_base64_env, e)))?;
            let key_json = String::from_utf8(decoded)
                .map_err(|_| SinkError::Credentials(format!("{} does not decode to UTF-8", credentials_base64_env)))?;
            debug!(source = credentials_base64_env, "Using service account key from environment");
            return Ok(Self::ServiceAccount(Box::new(CustomServiceAccount::from_json(&key_json)?)));
        }

        if credentials_file.exists() {
            debug!(path = %credentials_file.display(), "Using service account key file");
            return Ok(Self::ServiceAccount(Box::new(CustomServiceAccount::from_file(credentials_file)?)));
        }

        if let Some(token) = lookup(access_token_env) {
            debug!(source = access_token_env, "Using pre-issued access token");
            return Ok(Self::AccessToken(token));
        }

        Err(SinkError::MissingCredentials(format!(
            "set {}, create {}, or set {}",
            credentials_base64_env,
            credentials_file.display(),
            access_token_env
        )))
    }

    async fn access_token(&self) -> Result<String, SinkError> {
        match self {
            Self::ServiceAccount(account) => {
                let token = account.token(&[SPREADSHEETS_SCOPE]).await?;
                Ok(token.as_str().to_string())
            }
            Self::AccessToken(token) => Ok(token.clone()),
        }
    }
}

/// Replaces one tab of a Google spreadsheet with the rendered grid.
pub struct GoogleSheetsSink {
    client: Client,
    api_base: String,
    spreadsheet_id: String,
    sheet_name: String,
    auth: SheetsAuth,
}

impl GoogleSheetsSink {
    pub fn new(spreadsheet_id: &str, sheet_name: &str, auth: SheetsAuth) -> Result<Self, SinkError> {
        let client = Client::builder().timeout(Duration::from_secs(30)).build()?;

        Ok(Self {
            client,
            api_base: SHEETS_API.to_string(),
            spreadsheet_id: spreadsheet_id.to_string(),
            sheet_name: sheet_name.to_string(),
            auth,
        })
    }

    pub fn with_api_base(mut self, api_base: &str) -> Self {
        self.api_base = api_base.to_string();
        self
    }

    /// A1 range covering the whole tab.
    fn sheet_range(&self) -> String {
        format!("'{}'", self.sheet_name.replace('\'', "''"))
    }

    fn values_url(&self, range_segment: &str) -> Result<Url, SinkError> {
        let mut url = Url::parse(&self.api_base).map_err(|e| SinkError::InvalidUrl(e.to_string()))?;
        url.path_segments_mut()
            .map_err(|_| SinkError::InvalidUrl(self.api_base.clone()))?
            .pop_if_empty()
            .extend([self.spreadsheet_id.as_str(), "values", range_segment]);
        Ok(url)
    }

    fn update_body(&self, sheet: &SheetContents) -> Value {
        json!({
            "range": format!("{}!A1", self.sheet_range()),
            "majorDimension": "ROWS",
            "values": sheet.rows,
        })
    }

    async fn check(response: Response) -> Result<(), SinkError> {
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        Err(SinkError::Api { status, body })
    }

    async fn clear(&self, token: &str) -> Result<(), SinkError> {
        let url = self.values_url(&format!("{}:clear", self.sheet_range()))?;
        let response = self
            .client
            .post(url)
            .bearer_auth(token)
            .json(&json!({}))
            .send()
            .await?;
        Self::check(response).await
    }

    async fn update(&self, token: &str, sheet: &SheetContents) -> Result<(), SinkError> {
        let url = self.values_url(&format!("{}!A1", self.sheet_range()))?;
        let response = self
            .client
            .put(url)
            .query(&[("valueInputOption", "RAW")])
            .bearer_auth(token)
            .json(&self.update_body(sheet))
            .send()
            .await?;
        Self::check(response).await
    }
}

#[async_trait]
impl TableSink for GoogleSheetsSink {
    fn name(&self) -> &str {
        "google_sheets"
    }

    async fn write(&mut self, sheet: &SheetContents) -> Result<(), SinkError> {
        let token = self.auth.access_token().await?;

        debug!(spreadsheet_id = %self.spreadsheet_id, sheet = %self.sheet_name, "Clearing sheet");
        self.clear(&token).await?;
        self.update(&token, sheet).await?;

        info!(
            spreadsheet_id = %self.spreadsheet_id,
            sheet = %self.sheet_name,
            rows = sheet.rows.len(),
            "Updated Google Sheet"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    fn sink(name: &str) -> GoogleSheetsSink {
        GoogleSheetsSink::new("spreadsheet-1", name, SheetsAuth::AccessToken("token".to_string())).unwrap()
    }

    #[test]
    fn test_sheet_range_quotes_name() {
        assert_eq!(sink("Sheet1").sheet_range(), "'Sheet1'");
        assert_eq!(sink("Bob's Tab").sheet_range(), "'Bob''s Tab'");
    }

    #[test]
    fn test_values_url() {
        let s = sink("Sheet1");
        let url = s.values_url("'Sheet1':clear").unwrap();
        assert!(url.as_str().starts_with("https://sheets.googleapis.com/v4/spreadsheets/spreadsheet-1/values/"));
        assert!(url.as_str().ends_with(":clear"));
    }

    #[test]
    fn test_update_body() {
        let sheet = SheetContents {
            rows: vec![
                vec!["Name".to_string(), "Price".to_string()],
                Vec::new(),
                vec!["Last Updated".to_string()],
            ],
        };
        let body = sink("Dashboard").update_body(&sheet);

        assert_eq!(body["range"], "'Dashboard'!A1");
        assert_eq!(body["majorDimension"], "ROWS");
        assert_eq!(body["values"][0][1], "Price");
        assert_eq!(body["values"][1].as_array().map(Vec::len), Some(0));
        assert_eq!(body["values"].as_array().map(Vec::len), Some(3));
    }

    #[test]
    fn test_resolve_prefers_access_token_when_no_key() {
        let vars = HashMap::from([("GOOGLE_ACCESS_TOKEN", "ya29.token")]);
        let auth = SheetsAuth::resolve(
            Path::new("/nonexistent/credentials.json"),
            "GOOGLE_CREDENTIALS_BASE64",
            "GOOGLE_ACCESS_TOKEN",
            |key| vars.get(key).map(|v| v.to_string()),
        )
        .unwrap();
        assert!(matches!(auth, SheetsAuth::AccessToken(token) if token == "ya29.token"));
    }

    #[test]
    fn test_resolve_without_any_source() {
        let result = SheetsAuth::resolve(
            Path::new("/nonexistent/credentials.json"),
            "GOOGLE_CREDENTIALS_BASE64",
            "GOOGLE_ACCESS_TOKEN",
            |_| None,
        );
        assert!(matches!(result, Err(SinkError::MissingCredentials(msg)) if msg.contains("GOOGLE_CREDENTIALS_BASE64")));
    }

    #[test]
    fn test_resolve_rejects_bad_base64_key() {
        let vars = HashMap::from([
            ("GOOGLE_CREDENTIALS_BASE64", "%%% not base64 %%%"),
            ("GOOGLE_ACCESS_TOKEN", "ya29.token"),
        ]);
        let result = SheetsAuth::resolve(
            Path::new("/nonexistent/credentials.json"),
            "GOOGLE_CREDENTIALS_BASE64",
            "GOOGLE_ACCESS_TOKEN",
            |key| vars.get(key).map(|v| v.to_string()),
        );
        assert!(matches!(result, Err(SinkError::Credentials(_))));
    }

    #[test]
    fn test_resolve_uses_key_file_before_token() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "{{\"type\": \"not a service account\"}}").unwrap();
        let vars = HashMap::from([("GOOGLE_ACCESS_TOKEN", "ya29.token")]);

        let result = SheetsAuth::resolve(
            file.path(),
            "GOOGLE_CREDENTIALS_BASE64",
            "GOOGLE_ACCESS_TOKEN",
            |key| vars.get(key).map(|v| v.to_string()),
        );
        assert!(matches!(result, Err(SinkError::Auth(_))));
    }

    mod http {
        use super::*;
        use reqwest::StatusCode;
        use wiremock::matchers::{header, method, path_regex, query_param};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        fn sink_for(server: &MockServer) -> GoogleSheetsSink {
            sink("Sheet1").with_api_base(&format!("{}/v4/spreadsheets", server.uri()))
        }

        fn sheet() -> SheetContents {
            SheetContents {
                rows: vec![
                    vec!["Name".to_string(), "Price".to_string()],
                    vec!["Apple".to_string(), "200.00".to_string()],
                ],
            }
        }

        #[tokio::test]
        async fn test_write_clears_then_updates() {
            let server = MockServer::start().await;
            Mock::given(method("POST"))
                .and(path_regex(r"^/v4/spreadsheets/spreadsheet-1/values/.*:clear$"))
                .and(header("authorization", "Bearer token"))
                .respond_with(ResponseTemplate::new(200).set_body_json(json!({"spreadsheetId": "spreadsheet-1"})))
                .expect(1)
                .mount(&server)
                .await;
            Mock::given(method("PUT"))
                .and(path_regex(r"^/v4/spreadsheets/spreadsheet-1/values/.*!A1$"))
                .and(query_param("valueInputOption", "RAW"))
                .and(header("authorization", "Bearer token"))
                .respond_with(ResponseTemplate::new(200).set_body_json(json!({"updatedRows": 2})))
                .expect(1)
                .mount(&server)
                .await;

            sink_for(&server).write(&sheet()).await.unwrap();

            let requests = server.received_requests().await.unwrap();
            let methods: Vec<_> = requests.iter().map(|r| r.method.to_string()).collect();
            assert_eq!(methods, vec!["POST", "PUT"]);

            let body: Value = serde_json::from_slice(&requests[1].body).unwrap();
            assert_eq!(body["range"], "'Sheet1'!A1");
            assert_eq!(body["values"][1][0], "Apple");
        }

        #[tokio::test]
        async fn test_write_maps_error_status() {
            let server = MockServer::start().await;
            Mock::given(method("POST"))
                .respond_with(ResponseTemplate::new(403).set_body_string("caller does not have permission"))
                .mount(&server)
                .await;

            let err = sink_for(&server).write(&sheet()).await.unwrap_err();

            assert!(matches!(
                err,
                SinkError::Api { status, body } if status == StatusCode::FORBIDDEN && body.contains("permission")
            ));
            // Nothing is written after a failed clear
            assert_eq!(server.received_requests().await.unwrap().len(), 1);
        }
    }
}
