//! Job management endpoints.
//!
//! Jobs are returned in their client-facing form ([`JobView`]): the schedule
//! fields exactly as they were submitted, plus the normalized trigger and the
//! next fire time.

use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::StatusCode,
    Json,
};
use cadence_scheduler::{JobPatch, JobSpec, JobView, ManualRun};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::info;

use super::{api_error, body_error, ApiError};
use crate::app::AppState;

/// GET /api/jobs
pub async fn list_jobs(State(state): State<Arc<AppState>>) -> Result<Json<Value>, ApiError> {
    let jobs: Vec<JobView> = state
        .kernel
        .list_jobs()
        .map_err(api_error)?
        .iter()
        .map(|j| j.view())
        .collect();
    Ok(Json(json!({ "jobs": jobs })))
}

/// POST /api/jobs: create, or replace when the body names an existing id.
pub async fn create_job(
    State(state): State<Arc<AppState>>,
    body: Result<Json<JobSpec>, JsonRejection>,
) -> Result<(StatusCode, Json<JobView>), ApiError> {
    let Json(spec) = body.map_err(body_error)?;
    let job = state.kernel.create_job(spec).map_err(api_error)?;
    Ok((StatusCode::CREATED, Json(job.view())))
}

/// GET /api/jobs/{id}
pub async fn get_job(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<JobView>, ApiError> {
    let job = state.kernel.get_job(&id).map_err(api_error)?;
    Ok(Json(job.view()))
}

/// PATCH /api/jobs/{id}
pub async fn update_job(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    body: Result<Json<JobPatch>, JsonRejection>,
) -> Result<Json<JobView>, ApiError> {
    let Json(patch) = body.map_err(body_error)?;
    let job = state.kernel.update_job(&id, patch).map_err(api_error)?;
    Ok(Json(job.view()))
}

/// DELETE /api/jobs/{id}
pub async fn delete_job(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    state.kernel.delete_job(&id).map_err(api_error)?;
    Ok(Json(json!({ "deleted": id })))
}

/// POST /api/jobs/{id}/run: execute now, outside the schedule.
///
/// Responds once the run and any reactive jobs it fired have finished.
pub async fn run_job(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<ManualRun>, ApiError> {
    info!(job_id = %id, "manual run requested");
    let run = state.kernel.run_now(&id).await.map_err(api_error)?;
    Ok(Json(run))
}
