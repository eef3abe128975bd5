//! Server-specific error types

use crate::db::StoreError;
use crate::updater::orchestrator::PipelineError;
use crate::updater::pipeline::StageError;
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

/// Errors surfaced by the HTTP front door
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Stage failed: {0}")]
    Stage(#[from] StageError),

    #[error("Pipeline error: {0}")]
    Pipeline(PipelineError),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),
}

impl From<PipelineError> for AppError {
    fn from(error: PipelineError) -> Self {
        match error {
            PipelineError::Jobs(e @ StoreError::AlreadyRunning(_)) => AppError::Store(e),
            other => AppError::Pipeline(other),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_message) = match self {
            AppError::Store(StoreError::AlreadyRunning(ref job_type)) => (
                StatusCode::CONFLICT,
                format!("A {job_type} run is already in progress"),
            ),
            AppError::Store(StoreError::NotFound(ref message)) => (StatusCode::NOT_FOUND, message.clone()),
            AppError::Store(ref e) => {
                tracing::error!(error = %e, "Store error");
                (StatusCode::INTERNAL_SERVER_ERROR, "A database error occurred".to_string())
            },
            AppError::Stage(ref e) => {
                tracing::error!(error = %e, "Stage error");
                (StatusCode::BAD_GATEWAY, e.to_string())
            },
            AppError::Pipeline(ref e) => {
                tracing::error!(error = %e, "Pipeline error");
                (StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
            },
            AppError::BadRequest(ref message) => (StatusCode::BAD_REQUEST, message.clone()),
            AppError::NotFound(ref message) => (StatusCode::NOT_FOUND, message.clone()),
            AppError::Conflict(ref message) => (StatusCode::CONFLICT, message.clone()),
        };

        let body = Json(json!({
            "error": {
                "message": error_message,
                "status": status.as_u16(),
            }
        }));

        (status, body).into_response()
    }
}
