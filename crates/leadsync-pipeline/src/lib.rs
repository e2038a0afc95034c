//! The conversion relay run: fetch, dedup, upload, store, report, notify.
//!
//! A [`Pipeline`] owns one instance of every stage behind its trait and
//! executes them strictly in order. The first stage error aborts the run;
//! nothing is retried and no stage is skipped except the upload, which is
//! bypassed when dedup leaves nothing to send. At most one run executes
//! per pipeline at a time.

use std::fmt;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use leadsync_adapters::{
    AdapterError, ApiClient, ConversionClient, GmailNotifier, GoogleAdsClient, GoogleOAuthProvider,
    GoogleSheetsReport, Notifier, RecordSource, ReportGenerator, SalesforcePasswordProvider,
    SalesforceSource, TokenProvider,
};
use leadsync_core::{
    CandidateRecord, DeliveryStatus, PipelineRunReport, ReportSummary, SuccessRecord, UploadOutcome,
};
use leadsync_storage::{StatusStore, StoreError};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub mod config;
pub mod dedup;
pub mod partition;
pub mod upload;

pub use config::{ConfigError, PipelineConfig};
pub use partition::{partition_outcomes, Partitioned};
pub use upload::{ConversionSettings, ConversionUploader, UploadError};

pub const CRATE_NAME: &str = "leadsync-pipeline";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Fetch,
    Dedup,
    Upload,
    Store,
    Report,
    Notify,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Fetch => "fetch",
            Stage::Dedup => "dedup",
            Stage::Upload => "upload",
            Stage::Store => "store",
            Stage::Report => "report",
            Stage::Notify => "notify",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum StageFailure {
    #[error(transparent)]
    Adapter(#[from] AdapterError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Upload(#[from] UploadError),
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("a pipeline run is already in progress")]
    AlreadyRunning,
    #[error("{stage} stage failed: {source}")]
    Stage {
        stage: Stage,
        #[source]
        source: StageFailure,
    },
}

impl PipelineError {
    pub fn stage(&self) -> Option<Stage> {
        match self {
            PipelineError::AlreadyRunning => None,
            PipelineError::Stage { stage, .. } => Some(*stage),
        }
    }

    fn at<E: Into<StageFailure>>(stage: Stage) -> impl FnOnce(E) -> PipelineError {
        move |err| PipelineError::Stage {
            stage,
            source: err.into(),
        }
    }
}

/// Drops records without a usable click id. Returns the kept records and
/// how many were discarded.
pub fn retain_trackable(records: Vec<CandidateRecord>) -> (Vec<CandidateRecord>, usize) {
    let before = records.len();
    let kept = records
        .into_iter()
        .filter(CandidateRecord::is_trackable)
        .collect::<Vec<_>>();
    let discarded = before - kept.len();
    (kept, discarded)
}

/// Stage implementations a [`Pipeline`] is assembled from.
pub struct PipelineStages {
    pub source: Arc<dyn RecordSource>,
    pub store: Arc<dyn StatusStore>,
    pub conversions: Arc<dyn ConversionClient>,
    pub conversion_settings: ConversionSettings,
    pub reports: Arc<dyn ReportGenerator>,
    pub notifier: Arc<dyn Notifier>,
}

pub struct Pipeline {
    source: Arc<dyn RecordSource>,
    store: Arc<dyn StatusStore>,
    uploader: ConversionUploader,
    reports: Arc<dyn ReportGenerator>,
    notifier: Arc<dyn Notifier>,
    run_guard: Mutex<()>,
}

impl Pipeline {
    pub fn new(stages: PipelineStages) -> Self {
        Self {
            source: stages.source,
            store: stages.store,
            uploader: ConversionUploader::new(stages.conversions, stages.conversion_settings),
            reports: stages.reports,
            notifier: stages.notifier,
            run_guard: Mutex::new(()),
        }
    }

    /// Wires the production adapters. Tokens are fetched per call, so no
    /// network traffic happens here.
    pub fn from_config(config: &PipelineConfig, store: Arc<dyn StatusStore>) -> Result<Self> {
        let http = ApiClient::new(&config.http).context("building http client")?;

        let google: Arc<dyn TokenProvider> = Arc::new(GoogleOAuthProvider::new(
            http.clone(),
            config.google_oauth.clone(),
        ));
        let salesforce: Arc<dyn TokenProvider> = Arc::new(SalesforcePasswordProvider::new(
            http.clone(),
            config.salesforce.clone(),
        ));

        let source = SalesforceSource::new(http.clone(), salesforce, config.query.clone())
            .with_api_version(config.salesforce_api_version.clone());
        let conversions =
            GoogleAdsClient::new(http.clone(), google.clone(), config.google_ads.clone());
        let reports = GoogleSheetsReport::new(http.clone(), google.clone(), config.sheets.clone());
        let notifier = GmailNotifier::new(http, google, config.gmail.clone());

        Ok(Self::new(PipelineStages {
            source: Arc::new(source),
            store,
            conversions: Arc::new(conversions),
            conversion_settings: config.conversion.clone(),
            reports: Arc::new(reports),
            notifier: Arc::new(notifier),
        }))
    }

    /// Runs every stage once. Fails fast with [`PipelineError::AlreadyRunning`]
    /// if another run holds the guard.
    pub async fn run_once(&self) -> Result<PipelineRunReport, PipelineError> {
        let _guard = self
            .run_guard
            .try_lock()
            .map_err(|_| PipelineError::AlreadyRunning)?;

        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let span = info_span!("pipeline_run", %run_id);

        async move {
            info!("pipeline run started");

            let fetched = self.fetch().await?;
            let fetched_records = fetched.len();
            let unprocessed = self.dedup(fetched).await?;
            let outcomes = self.upload(&unprocessed).await?;
            let partitioned = partition_outcomes(&unprocessed, &outcomes);
            let stored_records = self.store(&partitioned.success).await?;

            let spreadsheet_url = self
                .reports
                .create_report(&partitioned.success, &partitioned.failed)
                .await
                .map_err(PipelineError::at(Stage::Report))?;
            let report = ReportSummary {
                spreadsheet_url,
                success_count: partitioned.success.len(),
                failed_count: partitioned.failed.len(),
            };
            let notification = self.notify(&report).await?;

            let summary = PipelineRunReport {
                run_id,
                started_at,
                finished_at: Utc::now(),
                fetched_records,
                unprocessed_records: unprocessed.len(),
                upload_successes: report.success_count,
                upload_failures: report.failed_count,
                stored_records,
                report,
                notification,
            };
            info!(
                fetched = summary.fetched_records,
                unprocessed = summary.unprocessed_records,
                successes = summary.upload_successes,
                failures = summary.upload_failures,
                stored = summary.stored_records,
                "pipeline run finished"
            );
            Ok(summary)
        }
        .instrument(span)
        .await
    }

    async fn fetch(&self) -> Result<Vec<CandidateRecord>, PipelineError> {
        let records = self
            .source
            .fetch_candidates()
            .await
            .map_err(PipelineError::at(Stage::Fetch))?;
        let (kept, discarded) = retain_trackable(records);
        if discarded > 0 {
            info!(discarded, "dropped records without a click id");
        }
        Ok(kept)
    }

    async fn dedup(&self, records: Vec<CandidateRecord>) -> Result<Vec<CandidateRecord>, PipelineError> {
        dedup::dedup_against_store(self.store.as_ref(), records)
            .await
            .map_err(PipelineError::at(Stage::Dedup))
    }

    async fn upload(&self, records: &[CandidateRecord]) -> Result<Vec<UploadOutcome>, PipelineError> {
        if records.is_empty() {
            info!("nothing new to upload");
            return Ok(Vec::new());
        }
        self.uploader
            .upload(records)
            .await
            .map_err(PipelineError::at(Stage::Upload))
    }

    async fn store(&self, success: &[SuccessRecord]) -> Result<usize, PipelineError> {
        let (keyed, unkeyed): (Vec<_>, Vec<_>) = success
            .iter()
            .cloned()
            .partition(|r| !r.external_id.is_empty());
        if !unkeyed.is_empty() {
            warn!(count = unkeyed.len(), "successful uploads without an external id are not logged");
        }
        let written = self
            .store
            .append(&keyed)
            .await
            .map_err(PipelineError::at(Stage::Store))?;
        Ok(written.len())
    }

    async fn notify(&self, report: &ReportSummary) -> Result<DeliveryStatus, PipelineError> {
        self.notifier
            .send_summary(report.success_count, report.failed_count, &report.spreadsheet_url)
            .await
            .map_err(PipelineError::at(Stage::Notify))
    }
}

/// Builds a cron scheduler that triggers [`Pipeline::run_once`], or `None`
/// when scheduling is disabled. Cron expressions carry a seconds field.
pub async fn maybe_build_scheduler(
    pipeline: Arc<Pipeline>,
    config: &PipelineConfig,
) -> Result<Option<JobScheduler>> {
    if !config.scheduler_enabled {
        return Ok(None);
    }

    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let cron = config.sync_cron.as_str();
    let job = Job::new_async(cron, move |_uuid, _l| {
        let pipeline = pipeline.clone();
        Box::pin(async move {
            match pipeline.run_once().await {
                Ok(report) => info!(run_id = %report.run_id, "scheduled run finished"),
                Err(PipelineError::AlreadyRunning) => {
                    warn!("scheduled run skipped; a run is already in progress")
                }
                Err(err) => error!(error = %err, "scheduled run failed"),
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(Some(sched))
}
