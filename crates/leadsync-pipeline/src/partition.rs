//! Joins upload outcomes back onto their source records.

use std::collections::HashMap;

use leadsync_core::{CandidateRecord, FailureRecord, SuccessRecord, UploadOutcome, UploadStatus};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Partitioned {
    pub success: Vec<SuccessRecord>,
    pub failed: Vec<FailureRecord>,
}

/// Every outcome lands in exactly one set. An outcome naming its record is
/// joined by external id; only outcomes without one fall back to the first
/// candidate carrying the same click id. An outcome that joins nothing keeps
/// empty fields instead of failing the run.
pub fn partition_outcomes(candidates: &[CandidateRecord], outcomes: &[UploadOutcome]) -> Partitioned {
    let mut by_external: HashMap<&str, &CandidateRecord> = HashMap::new();
    let mut by_click: HashMap<&str, &CandidateRecord> = HashMap::new();
    for candidate in candidates {
        by_external.entry(candidate.external_id.as_str()).or_insert(candidate);
        if let Some(click_id) = candidate.click_id.as_deref().map(str::trim) {
            if !click_id.is_empty() {
                by_click.entry(click_id).or_insert(candidate);
            }
        }
    }

    let mut partitioned = Partitioned::default();
    for outcome in outcomes {
        let joined = match outcome.external_id.as_deref() {
            Some(external_id) => by_external.get(external_id).copied(),
            None => by_click.get(outcome.click_id.as_str()).copied(),
        };
        let external_id = outcome
            .external_id
            .clone()
            .or_else(|| joined.map(|c| c.external_id.clone()))
            .unwrap_or_default();

        if outcome.success {
            partitioned.success.push(SuccessRecord {
                external_id,
                click_id: Some(outcome.click_id.clone()).filter(|c| !c.is_empty()),
                lead_created_at: joined.and_then(|c| c.lead_created_at),
                admitted_at: joined.and_then(|c| c.admitted_at),
                status: UploadStatus::Successful,
                error_details: None,
            });
        } else {
            partitioned.failed.push(FailureRecord {
                external_id,
                error: outcome
                    .error
                    .clone()
                    .unwrap_or_else(|| "Unknown error".to_string()),
            });
        }
    }
    partitioned
}
