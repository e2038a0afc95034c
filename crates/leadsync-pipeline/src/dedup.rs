//! Skips opportunities the status log has already recorded.

use std::collections::HashSet;

use leadsync_core::CandidateRecord;
use leadsync_storage::{StatusStore, StoreError};
use tracing::info;

/// Keeps records whose external id is not in `recorded`, preserving order.
pub fn filter_unprocessed(
    records: Vec<CandidateRecord>,
    recorded: &HashSet<String>,
) -> Vec<CandidateRecord> {
    records
        .into_iter()
        .filter(|r| !recorded.contains(&r.external_id))
        .collect()
}

pub async fn dedup_against_store(
    store: &dyn StatusStore,
    records: Vec<CandidateRecord>,
) -> Result<Vec<CandidateRecord>, StoreError> {
    let recorded = store.recorded_external_ids().await?;
    let before = records.len();
    let unprocessed = filter_unprocessed(records, &recorded);
    info!(
        recorded = recorded.len(),
        skipped = before - unprocessed.len(),
        remaining = unprocessed.len(),
        "filtered already-processed records"
    );
    Ok(unprocessed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use leadsync_storage::InMemoryStatusStore;
    use proptest::prelude::*;

    fn candidate(id: &str) -> CandidateRecord {
        CandidateRecord {
            external_id: id.to_string(),
            click_id: Some(format!("gclid-{id}")),
            name: None,
            lead_created_at: None,
            admitted_at: None,
        }
    }

    #[tokio::test]
    async fn recorded_ids_are_dropped() {
        let store = InMemoryStatusStore::with_recorded_ids(["006B"]);
        let out = dedup_against_store(&store, vec![candidate("006A"), candidate("006B"), candidate("006C")])
            .await
            .unwrap();
        let ids = out.iter().map(|r| r.external_id.as_str()).collect::<Vec<_>>();
        assert_eq!(ids, vec!["006A", "006C"]);
    }

    #[tokio::test]
    async fn empty_store_passes_everything_through() {
        let store = InMemoryStatusStore::new();
        let out = dedup_against_store(&store, vec![candidate("006A")]).await.unwrap();
        assert_eq!(out.len(), 1);
    }

    proptest! {
        #[test]
        fn output_is_exactly_the_unrecorded_input_in_order(
            ids in prop::collection::vec("[a-e]{1,2}", 0..20),
            recorded in prop::collection::hash_set("[a-e]{1,2}", 0..10),
        ) {
            let records = ids.iter().map(|id| candidate(id)).collect::<Vec<_>>();
            let out = filter_unprocessed(records, &recorded);

            prop_assert!(out.iter().all(|r| !recorded.contains(&r.external_id)));
            let expected = ids.iter().filter(|id| !recorded.contains(*id)).cloned().collect::<Vec<_>>();
            let actual = out.iter().map(|r| r.external_id.clone()).collect::<Vec<_>>();
            prop_assert_eq!(actual, expected);

            let again = filter_unprocessed(out.clone(), &recorded);
            prop_assert_eq!(&again, &out);
        }

        #[test]
        fn empty_store_is_identity(ids in prop::collection::vec("[a-z]{1,4}", 0..20)) {
            let records = ids.iter().map(|id| candidate(id)).collect::<Vec<_>>();
            prop_assert_eq!(filter_unprocessed(records.clone(), &HashSet::new()), records);
        }
    }
}
