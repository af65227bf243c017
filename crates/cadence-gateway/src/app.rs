use axum::{
    routing::{get, post},
    Router,
};
use cadence_core::CadenceConfig;
use cadence_scheduler::SchedulerKernel;
use std::sync::Arc;

/// Central shared state, passed as Arc<AppState> to all Axum handlers.
pub struct AppState {
    pub config: CadenceConfig,
    pub kernel: Arc<SchedulerKernel>,
}

impl AppState {
    pub fn new(config: CadenceConfig, kernel: Arc<SchedulerKernel>) -> Self {
        Self { config, kernel }
    }
}

/// Assemble the full Axum router.
pub fn build_router(state: Arc<AppState>) -> Router {
    use crate::http::{config, health, jobs, runs};

    Router::new()
        .route("/health", get(health::health_handler))
        .route("/api/config", get(config::config_handler))
        .route("/api/jobs", get(jobs::list_jobs).post(jobs::create_job))
        .route(
            "/api/jobs/{id}",
            get(jobs::get_job)
                .patch(jobs::update_job)
                .delete(jobs::delete_job),
        )
        .route("/api/jobs/{id}/run", post(jobs::run_job))
        .route("/api/runs", get(runs::list_runs))
        .route("/api/runs/{id}", get(runs::get_run))
        .with_state(state)
        .layer(tower_http::trace::TraceLayer::new_for_http())
}
