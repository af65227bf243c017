use axum::{extract::State, Json};
use serde_json::{json, Value};
use std::sync::Arc;

use crate::app::AppState;

/// GET /api/config: read-only view of the settings the scheduler runs with.
pub async fn config_handler(State(state): State<Arc<AppState>>) -> Json<Value> {
    let config = &state.config;
    Json(json!({
        "database": { "path": config.database.path },
        "runtime": config.runtime,
        "scheduler": config.scheduler,
    }))
}
