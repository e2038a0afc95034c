//! Append-only upload status log for leadsync.
//!
//! The log is the only cross-run checkpoint: an external id present here is
//! never submitted again. Uniqueness is enforced by the table itself, so two
//! overlapping runs cannot both record the same opportunity.

use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use leadsync_core::{StatusRecord, SuccessRecord, UploadStatus};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{info, warn};

pub const CRATE_NAME: &str = "leadsync-storage";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("corrupt status row: {0}")]
    Corrupt(String),
}

/// Durable log of processed opportunities.
#[async_trait]
pub trait StatusStore: Send + Sync {
    /// Every external id already present in the log.
    async fn recorded_external_ids(&self) -> Result<HashSet<String>, StoreError>;

    /// Append one row per record and return the rows actually written.
    /// Records whose external id is already logged are skipped.
    async fn append(&self, records: &[SuccessRecord]) -> Result<Vec<StatusRecord>, StoreError>;
}

#[derive(Debug, Clone)]
pub struct PgStoreConfig {
    pub database_url: String,
    pub max_connections: u32,
    pub acquire_timeout: Duration,
}

impl PgStoreConfig {
    pub fn new(database_url: impl Into<String>) -> Self {
        Self {
            database_url: database_url.into(),
            max_connections: 5,
            acquire_timeout: Duration::from_secs(10),
        }
    }
}

/// Postgres-backed status log.
///
/// Built once at startup and injected where needed; each call acquires its
/// own connection (or transaction) and releases it when the call returns,
/// on every exit path.
#[derive(Debug, Clone)]
pub struct PgStatusStore {
    pool: PgPool,
}

impl PgStatusStore {
    pub async fn connect(config: &PgStoreConfig) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(config.acquire_timeout)
            .connect(&config.database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        info!("upload_status migrations applied");
        Ok(())
    }
}

#[async_trait]
impl StatusStore for PgStatusStore {
    async fn recorded_external_ids(&self) -> Result<HashSet<String>, StoreError> {
        let mut conn = self.pool.acquire().await?;
        let rows = sqlx::query("SELECT salesforce_id FROM upload_status")
            .fetch_all(&mut *conn)
            .await?;

        let mut out = HashSet::with_capacity(rows.len());
        for row in rows {
            out.insert(row.try_get::<String, _>("salesforce_id")?);
        }
        Ok(out)
    }

    async fn append(&self, records: &[SuccessRecord]) -> Result<Vec<StatusRecord>, StoreError> {
        if records.is_empty() {
            return Ok(Vec::new());
        }

        // Dropping the transaction without commit rolls it back.
        let mut tx = self.pool.begin().await?;
        let mut written = Vec::with_capacity(records.len());
        for record in records {
            let row = sqlx::query(
                r#"
                INSERT INTO upload_status
                    (salesforce_id, gclid, original_lead_created_datetime, admission_date, status, error_details)
                VALUES ($1, $2, $3, $4, $5, $6)
                ON CONFLICT (salesforce_id) DO NOTHING
                RETURNING id, salesforce_id, gclid, original_lead_created_datetime,
                          admission_date, status, recorded_at, error_details
                "#,
            )
            .bind(&record.external_id)
            .bind(&record.click_id)
            .bind(record.lead_created_at)
            .bind(record.admitted_at)
            .bind(record.status.as_str())
            .bind(&record.error_details)
            .fetch_optional(&mut *tx)
            .await?;

            match row {
                Some(row) => written.push(status_record_from_row(&row)?),
                None => warn!(
                    external_id = %record.external_id,
                    "status row already present; skipping duplicate insert"
                ),
            }
        }
        tx.commit().await?;

        Ok(written)
    }
}

fn status_record_from_row(row: &PgRow) -> Result<StatusRecord, StoreError> {
    let status: String = row.try_get("status")?;
    let status = status.parse::<UploadStatus>().map_err(StoreError::Corrupt)?;
    Ok(StatusRecord {
        id: row.try_get("id")?,
        external_id: row.try_get("salesforce_id")?,
        click_id: row.try_get("gclid")?,
        lead_created_at: row.try_get::<Option<DateTime<Utc>>, _>("original_lead_created_datetime")?,
        admitted_at: row.try_get::<Option<DateTime<Utc>>, _>("admission_date")?,
        status,
        recorded_at: row.try_get("recorded_at")?,
        error_details: row.try_get("error_details")?,
    })
}

/// In-process status log with the same uniqueness rule as the table.
#[derive(Debug, Default)]
pub struct InMemoryStatusStore {
    rows: Mutex<Vec<StatusRecord>>,
}

impl InMemoryStatusStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the log with already-processed external ids.
    pub fn with_recorded_ids<I, S>(ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let now = Utc::now();
        let rows = ids
            .into_iter()
            .enumerate()
            .map(|(idx, id)| StatusRecord {
                id: idx as i64 + 1,
                external_id: id.into(),
                click_id: None,
                lead_created_at: None,
                admitted_at: None,
                status: UploadStatus::Successful,
                recorded_at: now,
                error_details: None,
            })
            .collect();
        Self {
            rows: Mutex::new(rows),
        }
    }

    pub async fn rows(&self) -> Vec<StatusRecord> {
        self.rows.lock().await.clone()
    }
}

#[async_trait]
impl StatusStore for InMemoryStatusStore {
    async fn recorded_external_ids(&self) -> Result<HashSet<String>, StoreError> {
        let rows = self.rows.lock().await;
        Ok(rows.iter().map(|r| r.external_id.clone()).collect())
    }

    async fn append(&self, records: &[SuccessRecord]) -> Result<Vec<StatusRecord>, StoreError> {
        let mut rows = self.rows.lock().await;
        let mut written = Vec::new();
        for record in records {
            if rows.iter().any(|r| r.external_id == record.external_id) {
                warn!(
                    external_id = %record.external_id,
                    "status row already present; skipping duplicate insert"
                );
                continue;
            }
            let row = StatusRecord {
                id: rows.len() as i64 + 1,
                external_id: record.external_id.clone(),
                click_id: record.click_id.clone(),
                lead_created_at: record.lead_created_at,
                admitted_at: record.admitted_at,
                status: record.status,
                recorded_at: Utc::now(),
                error_details: record.error_details.clone(),
            };
            rows.push(row.clone());
            written.push(row);
        }
        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn success(external_id: &str) -> SuccessRecord {
        SuccessRecord {
            external_id: external_id.to_string(),
            click_id: Some(format!("gclid-{external_id}")),
            lead_created_at: None,
            admitted_at: None,
            status: UploadStatus::Successful,
            error_details: None,
        }
    }

    #[tokio::test]
    async fn append_returns_written_rows_in_order() {
        let store = InMemoryStatusStore::new();
        let written = store
            .append(&[success("006A"), success("006B")])
            .await
            .expect("append");

        assert_eq!(written.len(), 2);
        assert_eq!(written[0].external_id, "006A");
        assert_eq!(written[1].external_id, "006B");
        assert_eq!(written[1].click_id.as_deref(), Some("gclid-006B"));
        assert!(written.iter().all(|r| r.status == UploadStatus::Successful));

        let ids = store.recorded_external_ids().await.expect("ids");
        assert!(ids.contains("006A") && ids.contains("006B"));
    }

    #[tokio::test]
    async fn duplicate_external_ids_are_skipped_not_rejected() {
        let store = InMemoryStatusStore::with_recorded_ids(["006A"]);
        let written = store
            .append(&[success("006A"), success("006C"), success("006C")])
            .await
            .expect("append");

        assert_eq!(written.len(), 1);
        assert_eq!(written[0].external_id, "006C");
        assert_eq!(store.rows().await.len(), 2);
    }

    #[tokio::test]
    async fn empty_store_has_no_recorded_ids() {
        let store = InMemoryStatusStore::new();
        assert!(store.recorded_external_ids().await.expect("ids").is_empty());
        assert!(store.append(&[]).await.expect("append").is_empty());
    }
}
