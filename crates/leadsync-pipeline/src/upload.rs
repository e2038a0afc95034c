//! Conversion upload: local validation, batch request, per-record outcomes.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use leadsync_adapters::google_ads::{normalize_customer_id, PartialFailureStatus};
use leadsync_adapters::{
    AdapterError, ClickConversion, ConversionClient, UploadClickConversionsRequest,
    UploadClickConversionsResponse,
};
use leadsync_core::{CandidateRecord, UploadOutcome};
use thiserror::Error;
use tracing::{info, warn};

pub const MISSING_CLICK_ID: &str = "missing gclid";
pub const MISSING_EXTERNAL_ID: &str = "missing salesforce id";
pub const MISSING_CONVERSION_TIME: &str = "missing conversion timestamp (Admission_Date__c)";
pub const DUPLICATE_CLICK_ID: &str = "duplicate click id in batch; already submitted for another opportunity";

#[derive(Debug, Error)]
pub enum UploadError {
    #[error(transparent)]
    Transport(#[from] AdapterError),
    #[error("malformed upload response: {0}")]
    MalformedFailure(String),
}

/// Account and valuation applied to every conversion in a batch.
#[derive(Debug, Clone, PartialEq)]
pub struct ConversionSettings {
    pub customer_id: String,
    pub conversion_action_id: String,
    pub conversion_value: f64,
    pub currency_code: Option<String>,
}

impl ConversionSettings {
    pub fn conversion_action(&self) -> String {
        format!(
            "customers/{}/conversionActions/{}",
            normalize_customer_id(&self.customer_id),
            self.conversion_action_id
        )
    }
}

/// `yyyy-mm-dd hh:mm:ss+00:00`, the form the upload endpoint accepts.
pub fn format_conversion_time(ts: DateTime<Utc>) -> String {
    ts.format("%Y-%m-%d %H:%M:%S+00:00").to_string()
}

/// The record behind `request.conversions[i]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmittedConversion {
    pub click_id: String,
    pub external_id: String,
}

/// A request ready to send plus everything rejected before sending.
#[derive(Debug, Clone, PartialEq)]
pub struct PreparedBatch {
    pub request: UploadClickConversionsRequest,
    /// Parallel to `request.conversions`.
    pub submitted: Vec<SubmittedConversion>,
    pub rejected: Vec<UploadOutcome>,
}

pub fn prepare_batch(records: &[CandidateRecord], settings: &ConversionSettings) -> PreparedBatch {
    let conversion_action = settings.conversion_action();
    let mut seen = HashSet::new();
    let mut conversions = Vec::new();
    let mut submitted = Vec::new();
    let mut rejected = Vec::new();

    for record in records {
        let click_id = record
            .click_id
            .as_deref()
            .map(str::trim)
            .filter(|id| !id.is_empty());
        let Some(click_id) = click_id else {
            rejected.push(UploadOutcome::rejected_locally(record, MISSING_CLICK_ID));
            continue;
        };
        if record.external_id.trim().is_empty() {
            rejected.push(UploadOutcome::rejected_locally(record, MISSING_EXTERNAL_ID));
            continue;
        }
        let Some(admitted_at) = record.admitted_at else {
            rejected.push(UploadOutcome::rejected_locally(record, MISSING_CONVERSION_TIME));
            continue;
        };
        if !seen.insert(click_id.to_string()) {
            rejected.push(UploadOutcome::rejected_locally(record, DUPLICATE_CLICK_ID));
            continue;
        }

        conversions.push(ClickConversion {
            gclid: click_id.to_string(),
            conversion_action: conversion_action.clone(),
            conversion_date_time: format_conversion_time(admitted_at),
            conversion_value: settings.conversion_value,
            currency_code: settings.currency_code.clone(),
        });
        submitted.push(SubmittedConversion {
            click_id: click_id.to_string(),
            external_id: record.external_id.clone(),
        });
    }

    PreparedBatch {
        request: UploadClickConversionsRequest {
            conversions,
            partial_failure: true,
        },
        submitted,
        rejected,
    }
}

/// Failure message per submitted index. Several errors on one index are
/// joined with `"; "`.
pub fn index_partial_failure(
    status: &PartialFailureStatus,
    submitted: usize,
) -> Result<BTreeMap<usize, String>, UploadError> {
    let mut by_index: BTreeMap<usize, Vec<String>> = BTreeMap::new();
    for error in status.details.iter().flat_map(|d| d.errors.iter()) {
        let index = error.conversion_index().ok_or_else(|| {
            UploadError::MalformedFailure(format!("error without a conversions index: {}", error.message))
        })?;
        if index >= submitted {
            return Err(UploadError::MalformedFailure(format!(
                "conversions[{index}] out of range for a batch of {submitted}"
            )));
        }
        let message = if error.message.is_empty() {
            status.message.clone()
        } else {
            error.message.clone()
        };
        by_index.entry(index).or_default().push(message);
    }

    if by_index.is_empty() {
        return Err(UploadError::MalformedFailure(format!(
            "no per-conversion errors in status: {}",
            status.message
        )));
    }

    Ok(by_index
        .into_iter()
        .map(|(index, messages)| (index, messages.join("; ")))
        .collect())
}

/// One outcome per submitted conversion, in submission order, each carrying
/// the external id of the record that was sent.
pub fn decode_outcomes(
    submitted: &[SubmittedConversion],
    response: &UploadClickConversionsResponse,
) -> Result<Vec<UploadOutcome>, UploadError> {
    if response.results.len() != submitted.len() {
        return Err(UploadError::MalformedFailure(format!(
            "{} results for a batch of {}",
            response.results.len(),
            submitted.len()
        )));
    }
    let failed = match response.partial_failure() {
        Some(status) => index_partial_failure(status, submitted.len())?,
        None => BTreeMap::new(),
    };
    Ok(submitted
        .iter()
        .enumerate()
        .map(|(index, sent)| {
            let outcome = match failed.get(&index) {
                Some(message) => UploadOutcome::failed(&sent.click_id, message.as_str()),
                None => UploadOutcome::succeeded(&sent.click_id),
            };
            outcome.for_record(&sent.external_id)
        })
        .collect())
}

pub struct ConversionUploader {
    client: Arc<dyn ConversionClient>,
    settings: ConversionSettings,
}

impl ConversionUploader {
    pub fn new(client: Arc<dyn ConversionClient>, settings: ConversionSettings) -> Self {
        Self { client, settings }
    }

    /// Local rejections come first, then the remote outcomes in submission
    /// order. A batch with nothing valid never reaches the remote service.
    pub async fn upload(&self, records: &[CandidateRecord]) -> Result<Vec<UploadOutcome>, UploadError> {
        let batch = prepare_batch(records, &self.settings);
        for outcome in &batch.rejected {
            warn!(
                external_id = outcome.external_id.as_deref().unwrap_or_default(),
                error = outcome.error.as_deref().unwrap_or_default(),
                "conversion rejected before upload"
            );
        }

        let mut outcomes = batch.rejected;
        if batch.submitted.is_empty() {
            info!(rejected = outcomes.len(), "no valid conversions to upload");
            return Ok(outcomes);
        }

        let response = self.client.upload_click_conversions(&batch.request).await?;
        let remote = decode_outcomes(&batch.submitted, &response)?;
        info!(
            submitted = batch.submitted.len(),
            failed = remote.iter().filter(|o| !o.success).count(),
            rejected = outcomes.len(),
            "upload outcomes decoded"
        );
        outcomes.extend(remote);
        Ok(outcomes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::TimeZone;
    use std::sync::Mutex;

    fn settings() -> ConversionSettings {
        ConversionSettings {
            customer_id: "123-456-7890".into(),
            conversion_action_id: "555".into(),
            conversion_value: 0.0,
            currency_code: None,
        }
    }

    fn record(id: &str, click: Option<&str>) -> CandidateRecord {
        CandidateRecord {
            external_id: id.into(),
            click_id: click.map(String::from),
            name: None,
            lead_created_at: None,
            admitted_at: Utc.with_ymd_and_hms(2025, 3, 1, 9, 30, 0).single(),
        }
    }

    fn sent(click_id: &str, external_id: &str) -> SubmittedConversion {
        SubmittedConversion {
            click_id: click_id.into(),
            external_id: external_id.into(),
        }
    }

    /// Records every request and fails the conversions at `failing`.
    struct ScriptedClient {
        failing: Vec<usize>,
        calls: Mutex<Vec<UploadClickConversionsRequest>>,
    }

    impl ScriptedClient {
        fn new(failing: &[usize]) -> Arc<Self> {
            Arc::new(Self {
                failing: failing.to_vec(),
                calls: Mutex::new(Vec::new()),
            })
        }

        fn calls(&self) -> Vec<UploadClickConversionsRequest> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ConversionClient for ScriptedClient {
        async fn upload_click_conversions(
            &self,
            request: &UploadClickConversionsRequest,
        ) -> Result<UploadClickConversionsResponse, AdapterError> {
            self.calls.lock().unwrap().push(request.clone());
            Ok(failure_at(request.conversions.len(), &self.failing))
        }
    }

    /// A response for `submitted` conversions with errors at `indices`.
    fn failure_at(submitted: usize, indices: &[usize]) -> UploadClickConversionsResponse {
        let results = (0..submitted)
            .map(|i| {
                if indices.contains(&i) {
                    serde_json::json!({})
                } else {
                    serde_json::json!({"gclid": format!("g-{}", i + 1)})
                }
            })
            .collect::<Vec<_>>();
        if indices.is_empty() {
            return serde_json::from_value(serde_json::json!({ "results": results })).unwrap();
        }
        let errors = indices
            .iter()
            .map(|i| {
                serde_json::json!({
                    "errorCode": {"conversionUploadError": "CLICK_NOT_FOUND"},
                    "message": format!("The click was not found. ({i})"),
                    "location": {"fieldPathElements": [
                        {"fieldName": "conversions", "index": i},
                        {"fieldName": "gclid"}
                    ]}
                })
            })
            .collect::<Vec<_>>();
        serde_json::from_value(serde_json::json!({
            "results": results,
            "partialFailureError": {
                "code": 3,
                "message": "partial failure",
                "details": [{"@type": "type.googleapis.com/google.ads.googleads.v22.errors.GoogleAdsFailure", "errors": errors}]
            }
        }))
        .unwrap()
    }

    #[test]
    fn conversion_time_uses_utc_offset_form() {
        let ts = Utc.with_ymd_and_hms(2025, 3, 1, 9, 30, 5).single().unwrap();
        assert_eq!(format_conversion_time(ts), "2025-03-01 09:30:05+00:00");
    }

    #[test]
    fn conversion_action_resource_uses_digits_only_customer() {
        assert_eq!(settings().conversion_action(), "customers/1234567890/conversionActions/555");
    }

    #[test]
    fn duplicate_click_ids_keep_only_the_first_submission() {
        let batch = prepare_batch(
            &[record("006A", Some("g-1")), record("006B", Some(" g-1 ")), record("006C", Some("g-2"))],
            &settings(),
        );
        assert_eq!(batch.submitted, vec![sent("g-1", "006A"), sent("g-2", "006C")]);
        assert_eq!(batch.rejected.len(), 1);
        assert_eq!(batch.rejected[0].external_id.as_deref(), Some("006B"));
        assert_eq!(batch.rejected[0].error.as_deref(), Some(DUPLICATE_CLICK_ID));
        assert!(batch.request.partial_failure);
        assert_eq!(batch.request.conversions[0].conversion_date_time, "2025-03-01 09:30:00+00:00");
    }

    #[tokio::test]
    async fn records_missing_required_fields_never_reach_the_client() {
        let client = ScriptedClient::new(&[]);
        let uploader = ConversionUploader::new(client.clone(), settings());

        let mut no_time = record("006C", Some("g-3"));
        no_time.admitted_at = None;
        let outcomes = uploader
            .upload(&[record("006A", None), record("", Some("g-2")), no_time])
            .await
            .unwrap();

        assert!(client.calls().is_empty());
        assert_eq!(outcomes.len(), 3);
        assert!(outcomes.iter().all(|o| !o.success && o.error.is_some()));
        assert_eq!(outcomes[0].error.as_deref(), Some(MISSING_CLICK_ID));
        assert_eq!(outcomes[1].error.as_deref(), Some(MISSING_EXTERNAL_ID));
        assert_eq!(outcomes[2].error.as_deref(), Some(MISSING_CONVERSION_TIME));
    }

    #[tokio::test]
    async fn no_partial_failure_means_every_submission_succeeded() {
        let client = ScriptedClient::new(&[]);
        let uploader = ConversionUploader::new(client.clone(), settings());

        let outcomes = uploader
            .upload(&[record("006A", Some("g-1")), record("006B", Some("g-2"))])
            .await
            .unwrap();

        assert_eq!(client.calls().len(), 1);
        assert_eq!(
            outcomes,
            vec![
                UploadOutcome::succeeded("g-1").for_record("006A"),
                UploadOutcome::succeeded("g-2").for_record("006B"),
            ]
        );
    }

    #[tokio::test]
    async fn remote_outcomes_name_the_record_that_was_sent() {
        let client = ScriptedClient::new(&[]);
        let uploader = ConversionUploader::new(client.clone(), settings());

        let mut unusable = record("006A", Some("g-1"));
        unusable.admitted_at = None;
        let outcomes = uploader
            .upload(&[unusable, record("006B", Some("g-1"))])
            .await
            .unwrap();

        assert_eq!(client.calls()[0].conversions.len(), 1);
        assert_eq!(
            outcomes,
            vec![
                UploadOutcome::failed("g-1", MISSING_CONVERSION_TIME).for_record("006A"),
                UploadOutcome::succeeded("g-1").for_record("006B"),
            ]
        );
    }

    #[test]
    fn results_must_cover_every_submission() {
        let submitted = [sent("g-1", "006A"), sent("g-2", "006B")];
        assert!(matches!(
            decode_outcomes(&submitted, &failure_at(1, &[])),
            Err(UploadError::MalformedFailure(_))
        ));

        let empty: UploadClickConversionsResponse =
            serde_json::from_value(serde_json::json!({"results": []})).unwrap();
        assert!(matches!(
            decode_outcomes(&submitted, &empty),
            Err(UploadError::MalformedFailure(_))
        ));

        let outcomes = decode_outcomes(&submitted, &failure_at(2, &[])).unwrap();
        assert!(outcomes.iter().all(|o| o.success));
    }

    #[tokio::test]
    async fn partial_failure_marks_only_the_indexed_submission() {
        let client = ScriptedClient::new(&[1]);
        let uploader = ConversionUploader::new(client, settings());

        let outcomes = uploader
            .upload(&[
                record("006A", Some("g-1")),
                record("006B", Some("g-2")),
                record("006C", Some("g-3")),
            ])
            .await
            .unwrap();

        assert_eq!(outcomes.len(), 3);
        assert!(outcomes[0].success);
        assert!(!outcomes[1].success);
        assert_eq!(outcomes[1].click_id, "g-2");
        assert_eq!(outcomes[1].external_id.as_deref(), Some("006B"));
        assert_eq!(outcomes[1].error.as_deref(), Some("The click was not found. (1)"));
        assert!(outcomes[2].success);
    }

    #[test]
    fn repeated_errors_on_one_index_are_joined() {
        let mut response = failure_at(1, &[0, 0]);
        let status = response.partial_failure_error.take().unwrap();
        let map = index_partial_failure(&status, 1).unwrap();
        assert_eq!(map[&0], "The click was not found. (0); The click was not found. (0)");
    }

    #[test]
    fn out_of_range_or_unlocated_errors_are_rejected() {
        let response = failure_at(1, &[5]);
        assert!(matches!(
            decode_outcomes(&[sent("g-1", "006A")], &response),
            Err(UploadError::MalformedFailure(_))
        ));

        let unlocated: UploadClickConversionsResponse = serde_json::from_value(serde_json::json!({
            "results": [{}],
            "partialFailureError": {"code": 3, "message": "boom", "details": [{"errors": [{"message": "no location"}]}]}
        }))
        .unwrap();
        assert!(matches!(
            decode_outcomes(&[sent("g-1", "006A")], &unlocated),
            Err(UploadError::MalformedFailure(_))
        ));
    }
}
