//! Core domain model for the leadsync conversion relay.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const CRATE_NAME: &str = "leadsync-core";

/// One CRM opportunity eligible for conversion reporting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidateRecord {
    pub external_id: String,
    pub click_id: Option<String>,
    pub name: Option<String>,
    pub lead_created_at: Option<DateTime<Utc>>,
    pub admitted_at: Option<DateTime<Utc>>,
}

impl CandidateRecord {
    /// A record is trackable when it carries a non-blank click id.
    pub fn is_trackable(&self) -> bool {
        self.click_id
            .as_deref()
            .map(|id| !id.trim().is_empty())
            .unwrap_or(false)
    }
}

/// Result of reporting a single conversion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadOutcome {
    pub click_id: String,
    /// The record this outcome belongs to. Absent only when the producer
    /// could not tell which record was sent.
    pub external_id: Option<String>,
    pub success: bool,
    pub error: Option<String>,
}

impl UploadOutcome {
    pub fn succeeded(click_id: impl Into<String>) -> Self {
        Self {
            click_id: click_id.into(),
            external_id: None,
            success: true,
            error: None,
        }
    }

    pub fn failed(click_id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            click_id: click_id.into(),
            external_id: None,
            success: false,
            error: Some(error.into()),
        }
    }

    pub fn for_record(mut self, external_id: impl Into<String>) -> Self {
        self.external_id = Some(external_id.into());
        self
    }

    pub fn rejected_locally(record: &CandidateRecord, error: impl Into<String>) -> Self {
        Self {
            click_id: record.click_id.clone().unwrap_or_default(),
            external_id: Some(record.external_id.clone()),
            success: false,
            error: Some(error.into()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UploadStatus {
    Successful,
    Failed,
}

impl UploadStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            UploadStatus::Successful => "successful",
            UploadStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for UploadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for UploadStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "successful" => Ok(UploadStatus::Successful),
            "failed" => Ok(UploadStatus::Failed),
            other => Err(format!("unknown upload status {other:?}")),
        }
    }
}

/// Success-shaped record handed to the status store and the report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SuccessRecord {
    pub external_id: String,
    pub click_id: Option<String>,
    pub lead_created_at: Option<DateTime<Utc>>,
    pub admitted_at: Option<DateTime<Utc>>,
    pub status: UploadStatus,
    pub error_details: Option<String>,
}

/// Failure-shaped record; `external_id` is empty when the join could not be resolved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureRecord {
    pub external_id: String,
    pub error: String,
}

/// Persisted row of the append-only status log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusRecord {
    pub id: i64,
    pub external_id: String,
    pub click_id: Option<String>,
    pub lead_created_at: Option<DateTime<Utc>>,
    pub admitted_at: Option<DateTime<Utc>>,
    pub status: UploadStatus,
    pub recorded_at: DateTime<Utc>,
    pub error_details: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportSummary {
    pub spreadsheet_url: String,
    pub success_count: usize,
    pub failed_count: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryStatus {
    pub status: String,
    pub message: String,
}

/// Aggregate returned by one pipeline run. Never persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineRunReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub fetched_records: usize,
    pub unprocessed_records: usize,
    pub upload_successes: usize,
    pub upload_failures: usize,
    pub stored_records: usize,
    pub report: ReportSummary,
    pub notification: DeliveryStatus,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(click_id: Option<&str>) -> CandidateRecord {
        CandidateRecord {
            external_id: "006A".into(),
            click_id: click_id.map(str::to_string),
            name: None,
            lead_created_at: None,
            admitted_at: None,
        }
    }

    #[test]
    fn blank_click_ids_are_not_trackable() {
        assert!(record(Some("gclid-1")).is_trackable());
        assert!(!record(Some("   ")).is_trackable());
        assert!(!record(None).is_trackable());
    }

    #[test]
    fn local_rejections_keep_the_external_id() {
        let outcome = UploadOutcome::rejected_locally(&record(None), "missing gclid");
        assert_eq!(outcome.click_id, "");
        assert_eq!(outcome.external_id.as_deref(), Some("006A"));
        assert!(!outcome.success);
        assert_eq!(outcome.error.as_deref(), Some("missing gclid"));
    }

    #[test]
    fn upload_status_uses_lowercase_wire_names() {
        assert_eq!(
            serde_json::to_string(&UploadStatus::Successful).unwrap(),
            "\"successful\""
        );
        assert_eq!("failed".parse::<UploadStatus>().unwrap(), UploadStatus::Failed);
        assert!("partial".parse::<UploadStatus>().is_err());
    }
}
