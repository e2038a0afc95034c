//! Salesforce REST record source.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use leadsync_core::CandidateRecord;
use serde::Deserialize;
use tracing::{info, warn};

use crate::auth::TokenProvider;
use crate::http::ApiClient;
use crate::{AdapterError, RecordSource};

pub const DEFAULT_API_VERSION: &str = "55.0";

/// Lifecycle stages and trailing window selecting convertible opportunities.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CandidateQuery {
    pub stages: Vec<String>,
    pub window_days: u32,
}

impl Default for CandidateQuery {
    fn default() -> Self {
        Self {
            stages: vec!["Admitted".to_string(), "Alumni".to_string()],
            window_days: 90,
        }
    }
}

impl CandidateQuery {
    pub fn to_soql(&self) -> String {
        let stages = self
            .stages
            .iter()
            .map(|s| soql_quote(s))
            .collect::<Vec<_>>()
            .join(", ");
        format!(
            "SELECT Id, GCLID__c, Name, Original_Lead_Created_Date_Time__c, Admission_Date__c \
             FROM Opportunity \
             WHERE StageName IN ({stages}) \
             AND Original_Lead_Created_Date_Time__c = LAST_N_DAYS:{}",
            self.window_days
        )
    }
}

fn soql_quote(value: &str) -> String {
    let escaped = value.replace('\\', "\\\\").replace('\'', "\\'");
    format!("'{escaped}'")
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct QueryPage {
    done: bool,
    #[serde(default)]
    next_records_url: Option<String>,
    records: Vec<OpportunityRow>,
}

// `attributes` and any extra columns are ignored on decode.
#[derive(Debug, Deserialize)]
struct OpportunityRow {
    #[serde(rename = "Id")]
    id: String,
    #[serde(rename = "GCLID__c", default)]
    gclid: Option<String>,
    #[serde(rename = "Name", default)]
    name: Option<String>,
    #[serde(rename = "Original_Lead_Created_Date_Time__c", default)]
    original_lead_created: Option<String>,
    #[serde(rename = "Admission_Date__c", default)]
    admission_date: Option<String>,
}

impl OpportunityRow {
    fn into_candidate(self) -> CandidateRecord {
        let lead_created_at = parse_optional_timestamp(
            &self.id,
            "Original_Lead_Created_Date_Time__c",
            self.original_lead_created.as_deref(),
        );
        let admitted_at =
            parse_optional_timestamp(&self.id, "Admission_Date__c", self.admission_date.as_deref());
        CandidateRecord {
            external_id: self.id,
            click_id: self.gclid,
            name: self.name,
            lead_created_at,
            admitted_at,
        }
    }
}

fn parse_optional_timestamp(id: &str, field: &str, raw: Option<&str>) -> Option<DateTime<Utc>> {
    let raw = raw?;
    let parsed = parse_salesforce_datetime(raw);
    if parsed.is_none() {
        warn!(external_id = id, field, value = raw, "unparseable salesforce timestamp");
    }
    parsed
}

/// Accepts RFC 3339, Salesforce's `2024-03-01T09:30:00.000+0000` form, and
/// bare dates (taken as midnight UTC).
pub fn parse_salesforce_datetime(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(dt) = DateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f%z") {
        return Some(dt.with_timezone(&Utc));
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}

/// Opportunity query against the org named by the token's instance URL.
/// Follows `nextRecordsUrl` until the result set is exhausted.
pub struct SalesforceSource {
    http: ApiClient,
    tokens: Arc<dyn TokenProvider>,
    api_version: String,
    query: CandidateQuery,
}

impl SalesforceSource {
    pub fn new(http: ApiClient, tokens: Arc<dyn TokenProvider>, query: CandidateQuery) -> Self {
        Self {
            http,
            tokens,
            api_version: DEFAULT_API_VERSION.to_string(),
            query,
        }
    }

    pub fn with_api_version(mut self, api_version: impl Into<String>) -> Self {
        self.api_version = api_version.into();
        self
    }
}

#[async_trait]
impl RecordSource for SalesforceSource {
    async fn fetch_candidates(&self) -> Result<Vec<CandidateRecord>, AdapterError> {
        let token = self.tokens.bearer_token().await?;
        let instance_url = token
            .instance_url
            .as_deref()
            .ok_or_else(|| AdapterError::Auth("salesforce token has no instance_url".into()))?
            .trim_end_matches('/')
            .to_string();

        let soql = self.query.to_soql();
        let first = self
            .http
            .inner()
            .get(format!("{instance_url}/services/data/v{}/query", self.api_version))
            .bearer_auth(&token.access_token)
            .query(&[("q", soql.as_str())]);
        let mut page: QueryPage = self.http.send_json("salesforce query", first).await?;

        let mut records = Vec::new();
        loop {
            records.extend(page.records.drain(..).map(OpportunityRow::into_candidate));
            if page.done {
                break;
            }
            let Some(next) = page.next_records_url.take() else {
                return Err(AdapterError::decode(
                    "salesforce query",
                    "page not done but nextRecordsUrl missing",
                ));
            };
            let request = self
                .http
                .inner()
                .get(format!("{instance_url}{next}"))
                .bearer_auth(&token.access_token);
            page = self.http.send_json("salesforce query", request).await?;
        }

        info!(records = records.len(), "salesforce opportunities fetched");
        Ok(records)
    }
}
