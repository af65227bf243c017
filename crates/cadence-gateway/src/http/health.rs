use axum::{extract::State, http::StatusCode, Json};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::warn;

use crate::app::AppState;

/// GET /health: reports 503 when the job store cannot be read.
pub async fn health_handler(State(state): State<Arc<AppState>>) -> (StatusCode, Json<Value>) {
    let version = env!("CARGO_PKG_VERSION");
    match state.kernel.registry().ids() {
        Ok(ids) => (
            StatusCode::OK,
            Json(json!({ "status": "ok", "version": version, "jobs": ids.len() })),
        ),
        Err(e) => {
            warn!("health check could not read job store: {e}");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({ "status": "degraded", "version": version, "error": e.to_string() })),
            )
        }
    }
}
