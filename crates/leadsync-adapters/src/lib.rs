//! External system adapters: CRM source, conversion upload, report, mail.
//!
//! Each collaborator sits behind a trait so the pipeline only depends on the
//! contract it needs. Every adapter gets its bearer token from a
//! [`TokenProvider`] on each call; nothing is cached between runs.

use async_trait::async_trait;
use leadsync_core::{CandidateRecord, DeliveryStatus, FailureRecord, SuccessRecord};
use thiserror::Error;

pub mod auth;
pub mod gmail;
pub mod google_ads;
pub mod http;
pub mod salesforce;
pub mod sheets;

pub use auth::{
    BearerToken, GoogleOAuthCredentials, GoogleOAuthProvider, SalesforceCredentials,
    SalesforcePasswordProvider, StaticTokenProvider, TokenProvider,
};
pub use gmail::{GmailNotifier, GmailSettings};
pub use google_ads::{
    ClickConversion, GoogleAdsClient, GoogleAdsSettings, UploadClickConversionsRequest,
    UploadClickConversionsResponse,
};
pub use http::{ApiClient, HttpClientConfig};
pub use salesforce::{CandidateQuery, SalesforceSource};
pub use sheets::{GoogleSheetsReport, SheetsSettings};

pub const CRATE_NAME: &str = "leadsync-adapters";

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("building http client: {0}")]
    Client(#[source] reqwest::Error),
    #[error("{context} request failed: {source}")]
    Request {
        context: &'static str,
        #[source]
        source: reqwest::Error,
    },
    #[error("http status {status} for {url}: {body}")]
    HttpStatus {
        status: u16,
        url: String,
        body: String,
    },
    #[error("unexpected {context} response: {message}")]
    Decode {
        context: &'static str,
        message: String,
    },
    #[error("authentication failed: {0}")]
    Auth(String),
}

impl AdapterError {
    pub fn decode(context: &'static str, message: impl Into<String>) -> Self {
        AdapterError::Decode {
            context,
            message: message.into(),
        }
    }
}

/// CRM query for opportunities eligible for conversion reporting.
#[async_trait]
pub trait RecordSource: Send + Sync {
    async fn fetch_candidates(&self) -> Result<Vec<CandidateRecord>, AdapterError>;
}

/// Remote half of the conversion upload: one batch in, one decoded response out.
#[async_trait]
pub trait ConversionClient: Send + Sync {
    async fn upload_click_conversions(
        &self,
        request: &UploadClickConversionsRequest,
    ) -> Result<UploadClickConversionsResponse, AdapterError>;
}

/// Writes the run's success/failure sets somewhere shareable and returns its URL.
#[async_trait]
pub trait ReportGenerator: Send + Sync {
    async fn create_report(
        &self,
        success: &[SuccessRecord],
        failed: &[FailureRecord],
    ) -> Result<String, AdapterError>;
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send_summary(
        &self,
        success_count: usize,
        failed_count: usize,
        report_url: &str,
    ) -> Result<DeliveryStatus, AdapterError>;
}
