//! Google Sheets run report.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use leadsync_core::{FailureRecord, SuccessRecord};
use reqwest::Url;
use serde::Deserialize;
use serde_json::{json, Value as JsonValue};
use tracing::info;

use crate::auth::TokenProvider;
use crate::http::ApiClient;
use crate::{AdapterError, ReportGenerator};

pub const SUCCESS_SHEET: &str = "Successful Uploads";
pub const FAILED_SHEET: &str = "Failed Uploads";

pub const SUCCESS_HEADERS: [&str; 6] = [
    "Salesforce ID",
    "GCLID",
    "Original Lead Created",
    "Admission Date",
    "Status",
    "Error Details",
];
pub const FAILED_HEADERS: [&str; 2] = ["Salesforce ID", "Error Details"];

const SHEETS_BASE_URL: &str = "https://sheets.googleapis.com";
const DRIVE_BASE_URL: &str = "https://www.googleapis.com";

#[derive(Debug, Clone)]
pub struct SheetsSettings {
    pub report_title: String,
    /// Granted writer access to each new report when set.
    pub share_with: Option<String>,
}

impl Default for SheetsSettings {
    fn default() -> Self {
        Self {
            report_title: "Uploads Report".to_string(),
            share_with: None,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreatedSpreadsheet {
    spreadsheet_id: String,
    spreadsheet_url: String,
    #[serde(default)]
    sheets: Vec<SheetEntry>,
}

#[derive(Debug, Deserialize)]
struct SheetEntry {
    properties: SheetProperties,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SheetProperties {
    sheet_id: i64,
    title: String,
}

impl CreatedSpreadsheet {
    fn sheet_id(&self, title: &str) -> Result<i64, AdapterError> {
        self.sheets
            .iter()
            .find(|s| s.properties.title == title)
            .map(|s| s.properties.sheet_id)
            .ok_or_else(|| {
                AdapterError::decode("sheets create", format!("worksheet {title:?} missing"))
            })
    }
}

fn format_timestamp(ts: Option<DateTime<Utc>>) -> String {
    ts.map(|t| t.to_rfc3339()).unwrap_or_default()
}

pub fn success_rows(records: &[SuccessRecord]) -> Vec<Vec<String>> {
    let mut rows = vec![SUCCESS_HEADERS.iter().map(|h| h.to_string()).collect()];
    rows.extend(records.iter().map(|r| {
        vec![
            r.external_id.clone(),
            r.click_id.clone().unwrap_or_default(),
            format_timestamp(r.lead_created_at),
            format_timestamp(r.admitted_at),
            r.status.to_string(),
            r.error_details.clone().unwrap_or_default(),
        ]
    }));
    rows
}

pub fn failed_rows(records: &[FailureRecord]) -> Vec<Vec<String>> {
    let mut rows = vec![FAILED_HEADERS.iter().map(|h| h.to_string()).collect()];
    rows.extend(
        records
            .iter()
            .map(|r| vec![r.external_id.clone(), r.error.clone()]),
    );
    rows
}

/// Creates one spreadsheet per run with a worksheet for each outcome set.
pub struct GoogleSheetsReport {
    http: ApiClient,
    tokens: Arc<dyn TokenProvider>,
    settings: SheetsSettings,
    sheets_base: String,
    drive_base: String,
}

impl GoogleSheetsReport {
    pub fn new(http: ApiClient, tokens: Arc<dyn TokenProvider>, settings: SheetsSettings) -> Self {
        Self {
            http,
            tokens,
            settings,
            sheets_base: SHEETS_BASE_URL.to_string(),
            drive_base: DRIVE_BASE_URL.to_string(),
        }
    }

    pub fn with_base_urls(mut self, sheets_base: impl Into<String>, drive_base: impl Into<String>) -> Self {
        self.sheets_base = sheets_base.into();
        self.drive_base = drive_base.into();
        self
    }

    fn url(&self, base: &str, segments: &[&str]) -> Result<Url, AdapterError> {
        let mut url = Url::parse(base).map_err(|e| AdapterError::decode("sheets url", e.to_string()))?;
        url.path_segments_mut()
            .map_err(|_| AdapterError::decode("sheets url", format!("{base} cannot be a base")))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    async fn post(&self, context: &'static str, token: &str, url: Url, body: JsonValue) -> Result<JsonValue, AdapterError> {
        let request = self.http.inner().post(url).bearer_auth(token).json(&body);
        self.http.send_json(context, request).await
    }

    async fn create_document(&self, token: &str) -> Result<CreatedSpreadsheet, AdapterError> {
        let body = json!({
            "properties": {"title": self.settings.report_title},
            "sheets": [
                {"properties": {"title": SUCCESS_SHEET}},
                {"properties": {"title": FAILED_SHEET}},
            ],
        });
        let request = self
            .http
            .inner()
            .post(self.url(&self.sheets_base, &["v4", "spreadsheets"])?)
            .bearer_auth(token)
            .json(&body);
        self.http.send_json("sheets create", request).await
    }

    async fn share(&self, token: &str, spreadsheet_id: &str, email: &str) -> Result<(), AdapterError> {
        let mut url = self.url(&self.drive_base, &["drive", "v3", "files", spreadsheet_id, "permissions"])?;
        url.query_pairs_mut().append_pair("sendNotificationEmail", "false");
        let body = json!({"type": "user", "role": "writer", "emailAddress": email});
        self.post("drive share", token, url, body).await?;
        Ok(())
    }

    async fn write_worksheet(
        &self,
        token: &str,
        spreadsheet_id: &str,
        title: &str,
        rows: Vec<Vec<String>>,
    ) -> Result<(), AdapterError> {
        let range = format!("'{}'", title.replace('\'', "''"));

        let clear = self.url(
            &self.sheets_base,
            &["v4", "spreadsheets", spreadsheet_id, "values", &format!("{range}:clear")],
        )?;
        self.post("sheets clear", token, clear, json!({})).await?;

        let mut append = self.url(
            &self.sheets_base,
            &["v4", "spreadsheets", spreadsheet_id, "values", &format!("{range}!A1:append")],
        )?;
        append
            .query_pairs_mut()
            .append_pair("valueInputOption", "RAW")
            .append_pair("insertDataOption", "INSERT_ROWS");
        self.post("sheets append", token, append, json!({"values": rows})).await?;
        Ok(())
    }

    async fn resize(
        &self,
        token: &str,
        spreadsheet_id: &str,
        row_counts: &[(i64, usize)],
    ) -> Result<(), AdapterError> {
        let requests = row_counts
            .iter()
            .map(|(sheet_id, rows)| {
                json!({
                    "updateSheetProperties": {
                        "properties": {"sheetId": sheet_id, "gridProperties": {"rowCount": rows}},
                        "fields": "gridProperties.rowCount",
                    }
                })
            })
            .collect::<Vec<_>>();
        let url = self.url(
            &self.sheets_base,
            &["v4", "spreadsheets", &format!("{spreadsheet_id}:batchUpdate")],
        )?;
        self.post("sheets resize", token, url, json!({"requests": requests})).await?;
        Ok(())
    }
}

#[async_trait]
impl ReportGenerator for GoogleSheetsReport {
    async fn create_report(
        &self,
        success: &[SuccessRecord],
        failed: &[FailureRecord],
    ) -> Result<String, AdapterError> {
        let token = self.tokens.bearer_token().await?;
        let token = token.access_token.as_str();

        let doc = self.create_document(token).await?;
        let success_sheet = doc.sheet_id(SUCCESS_SHEET)?;
        let failed_sheet = doc.sheet_id(FAILED_SHEET)?;

        if let Some(email) = &self.settings.share_with {
            self.share(token, &doc.spreadsheet_id, email).await?;
        }

        self.write_worksheet(token, &doc.spreadsheet_id, SUCCESS_SHEET, success_rows(success))
            .await?;
        self.write_worksheet(token, &doc.spreadsheet_id, FAILED_SHEET, failed_rows(failed))
            .await?;
        self.resize(
            token,
            &doc.spreadsheet_id,
            &[(success_sheet, 1 + success.len()), (failed_sheet, 1 + failed.len())],
        )
        .await?;

        info!(
            spreadsheet_id = %doc.spreadsheet_id,
            success = success.len(),
            failed = failed.len(),
            "report spreadsheet written"
        );
        Ok(doc.spreadsheet_url)
    }
}
