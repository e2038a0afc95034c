//! JSON error responses for the HTTP surface.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use leadsync_pipeline::PipelineError;
use serde_json::json;
use thiserror::Error;
use tracing::{error, warn};

#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Pipeline(#[from] PipelineError),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let ApiError::Pipeline(err) = self;
        let status = match &err {
            PipelineError::AlreadyRunning => {
                warn!("pipeline trigger refused; a run is already in progress");
                StatusCode::CONFLICT
            }
            PipelineError::Stage { stage, source } => {
                error!(%stage, error = %source, "pipeline run failed");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        let body = json!({
            "error": err.to_string(),
            "stage": err.stage(),
        });
        (status, Json(body)).into_response()
    }
}
