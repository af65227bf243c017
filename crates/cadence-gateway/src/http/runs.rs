use axum::{
    extract::{Path, Query, State},
    Json,
};
use cadence_scheduler::RunRecord;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;

use super::{api_error, ApiError};
use crate::app::AppState;

#[derive(Debug, Deserialize)]
pub struct RunsQuery {
    pub limit: Option<i64>,
}

/// GET /api/runs?limit=N: newest first; default 200, clamped to 1..=1000.
pub async fn list_runs(
    State(state): State<Arc<AppState>>,
    Query(query): Query<RunsQuery>,
) -> Result<Json<Value>, ApiError> {
    let runs = state.kernel.list_runs(query.limit).map_err(api_error)?;
    Ok(Json(json!({ "runs": runs })))
}

/// GET /api/runs/{id}
pub async fn get_run(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<Json<RunRecord>, ApiError> {
    state.kernel.get_run(id).map(Json).map_err(api_error)
}
