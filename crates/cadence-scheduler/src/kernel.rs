use std::sync::Arc;

use cadence_core::config::{RuntimeConfig, SchedulerConfig};
use rusqlite::Connection;
use serde::Serialize;
use tracing::{info, warn};

use crate::{
    error::Result,
    evaluator::{DependencyEvaluator, TriggerFiring},
    executor::{ExecutionReport, Executor},
    history::RunHistory,
    registry::JobRegistry,
    types::{Job, JobPatch, JobSpec, RunRecord, RunResult, TriggeredBy},
};

/// Result of [`SchedulerKernel::run_now`].
#[derive(Debug, Clone, Serialize)]
pub struct ManualRun {
    pub result: RunResult,
    pub run: RunRecord,
    /// Reactive jobs this run fired, in execution order.
    pub triggered: Vec<String>,
}

/// Owns every scheduler component. Shared as `Arc<SchedulerKernel>` between
/// the timing engine and the management API.
pub struct SchedulerKernel {
    registry: JobRegistry,
    executor: Executor,
    evaluator: DependencyEvaluator,
}

impl SchedulerKernel {
    /// Build a kernel over two connections to the same database: one for job
    /// definitions, one for run history.
    pub fn new(
        jobs: Connection,
        runs: Connection,
        runtime: &RuntimeConfig,
        scheduler: &SchedulerConfig,
    ) -> Result<Self> {
        let registry = JobRegistry::new(jobs)?;
        let history = Arc::new(RunHistory::new(runs)?);
        Ok(Self {
            registry,
            executor: Executor::new(runtime, history),
            evaluator: DependencyEvaluator::new(scheduler.max_trigger_depth),
        })
    }

    pub fn registry(&self) -> &JobRegistry {
        &self.registry
    }

    pub fn evaluator(&self) -> &DependencyEvaluator {
        &self.evaluator
    }

    pub fn executor(&self) -> &Executor {
        &self.executor
    }

    // ── Jobs ────────────────────────────────────────────────────────────────

    pub fn create_job(&self, spec: JobSpec) -> Result<Job> {
        self.registry.create(spec)
    }

    pub fn get_job(&self, id: &str) -> Result<Job> {
        self.registry.get(id)
    }

    pub fn list_jobs(&self) -> Result<Vec<Job>> {
        self.registry.list()
    }

    pub fn update_job(&self, id: &str, patch: JobPatch) -> Result<Job> {
        self.registry.update(id, patch)
    }

    pub fn delete_job(&self, id: &str) -> Result<()> {
        self.registry.delete(id)
    }

    // ── Runs ────────────────────────────────────────────────────────────────

    pub fn list_runs(&self, limit: Option<i64>) -> Result<Vec<RunRecord>> {
        self.executor.history().list(limit)
    }

    pub fn get_run(&self, id: i64) -> Result<RunRecord> {
        self.executor.history().get(id)
    }

    /// Rebuild dependency outcomes from run history.
    pub fn restore_outcomes(&self) -> Result<usize> {
        self.evaluator.restore(self.executor.history())
    }

    /// Execute a job immediately, ignoring its instance limit.
    ///
    /// Dependents are propagated before returning. If the run record could
    /// not be written the error is returned even though the job ran.
    pub async fn run_now(&self, id: &str) -> Result<ManualRun> {
        let job = self.registry.get(id)?;
        let report = self.executor.run(&job, TriggeredBy::Manual).await;
        let firings = self.complete(&job, &report).await;
        Ok(ManualRun {
            result: report.result,
            run: report.record?,
            triggered: firings.into_iter().map(|f| f.job_id).collect(),
        })
    }

    /// Timer firing. Skipped with a warning when `max_instances` copies of the
    /// job are already running.
    pub async fn fire_scheduled(&self, job: &Job) -> Option<ExecutionReport> {
        let Some(report) = self
            .executor
            .run_bounded(job, TriggeredBy::Schedule, job.policy.max_instances)
            .await
        else {
            warn!(
                job_id = %job.id,
                max_instances = job.policy.max_instances,
                "maximum running instances reached, skipping firing"
            );
            return None;
        };
        self.complete(job, &report).await;
        Some(report)
    }

    async fn complete(&self, job: &Job, report: &ExecutionReport) -> Vec<TriggerFiring> {
        self.evaluator.record_outcome(&job.id, report.result.success);
        let firings = self
            .evaluator
            .propagate(&job.id, &self.registry, &self.executor)
            .await;
        if !firings.is_empty() {
            info!(job_id = %job.id, fired = firings.len(), "dependent jobs triggered");
        }
        firings
    }
}
