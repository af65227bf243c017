pub mod config;
pub mod health;
pub mod jobs;
pub mod runs;

use axum::{extract::rejection::JsonRejection, http::StatusCode, Json};
use cadence_scheduler::SchedulerError;
use serde_json::{json, Value};
use tracing::error;

/// Error half of every handler result: status plus `{"error", "code"}` body.
pub type ApiError = (StatusCode, Json<Value>);

pub fn api_error(e: SchedulerError) -> ApiError {
    let status = match &e {
        SchedulerError::Validation(_) => StatusCode::BAD_REQUEST,
        SchedulerError::JobNotFound { .. } | SchedulerError::RunNotFound { .. } => {
            StatusCode::NOT_FOUND
        }
        SchedulerError::Persistence(_) | SchedulerError::Serialization(_) => {
            error!("scheduler error: {e}");
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    (
        status,
        Json(json!({"error": e.to_string(), "code": e.code()})),
    )
}

/// Malformed or mistyped request bodies are reported like validation errors.
pub fn body_error(rejection: JsonRejection) -> ApiError {
    (
        StatusCode::BAD_REQUEST,
        Json(json!({"error": rejection.body_text(), "code": "VALIDATION_ERROR"})),
    )
}
