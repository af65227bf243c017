//! Reactive job evaluation.
//!
//! The evaluator remembers the last outcome of every job. After any job
//! completes, [`DependencyEvaluator::propagate`] re-checks the reactive jobs
//! that reference it and runs the ones whose conditions now hold. Each of
//! those completions is evaluated the same way before the next sibling runs,
//! one level deeper each time, up to the configured depth.

use std::{
    collections::{HashMap, VecDeque},
    sync::{Mutex, MutexGuard, PoisonError},
};

use chrono::Utc;
use tracing::{debug, error, info, warn};

use crate::{
    error::Result,
    executor::{ExecutionReport, Executor},
    history::RunHistory,
    registry::JobRegistry,
    types::{
        parse_ts, Condition, Job, LastOutcome, LogicalOperator, Outcome, TriggerSpec,
        TriggeredBy,
    },
};

/// One reactive execution performed during propagation.
#[derive(Debug)]
pub struct TriggerFiring {
    pub job_id: String,
    /// Distance from the completion that started the pass (1 = direct dependent).
    pub depth: u32,
    pub report: ExecutionReport,
}

pub struct DependencyEvaluator {
    outcomes: Mutex<HashMap<String, LastOutcome>>,
    max_depth: u32,
}

impl DependencyEvaluator {
    pub fn new(max_depth: u32) -> Self {
        Self {
            outcomes: Mutex::new(HashMap::new()),
            max_depth,
        }
    }

    fn outcomes(&self) -> MutexGuard<'_, HashMap<String, LastOutcome>> {
        self.outcomes.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn record_outcome(&self, job_id: &str, succeeded: bool) {
        self.outcomes().insert(
            job_id.to_string(),
            LastOutcome {
                succeeded,
                updated_at: Utc::now(),
            },
        );
        debug!(%job_id, succeeded, "outcome recorded");
    }

    pub fn outcome(&self, job_id: &str) -> Option<LastOutcome> {
        self.outcomes().get(job_id).copied()
    }

    /// Point-in-time copy of every known outcome.
    pub fn snapshot(&self) -> HashMap<String, LastOutcome> {
        self.outcomes().clone()
    }

    /// Rebuild outcomes from the newest run of each job. Returns how many
    /// jobs were restored.
    pub fn restore(&self, history: &RunHistory) -> Result<usize> {
        let latest = history.latest_per_job()?;
        let mut outcomes = self.outcomes();
        for run in &latest {
            outcomes.insert(
                run.job_id.clone(),
                LastOutcome {
                    succeeded: run.status.is_success(),
                    updated_at: parse_ts(&run.finished_at).unwrap_or_else(Utc::now),
                },
            );
        }
        info!(count = latest.len(), "job outcomes restored from history");
        Ok(latest.len())
    }

    /// Run every reactive job made ready, directly or transitively, by the
    /// completion of `origin`.
    ///
    /// Evaluation is depth first: a job that fires has its own dependents
    /// evaluated before the next of its siblings runs. The dependents of one
    /// completion are all judged against a single snapshot taken before any
    /// of them runs, so siblings cannot see each other's outcomes within that
    /// step. A failing dependent is recorded like any other outcome and does
    /// not stop its siblings.
    pub async fn propagate(
        &self,
        origin: &str,
        registry: &JobRegistry,
        executor: &Executor,
    ) -> Vec<TriggerFiring> {
        let mut firings = Vec::new();
        let mut stack: Vec<Pass> = self.evaluate(origin, 0, registry).into_iter().collect();

        while let Some(pass) = stack.last_mut() {
            let Some(job) = pass.ready.pop_front() else {
                stack.pop();
                continue;
            };
            let depth = pass.depth + 1;
            info!(job_id = %job.id, upstream = %pass.changed, depth, "trigger conditions met");

            let report = executor.run(&job, TriggeredBy::Trigger).await;
            self.record_outcome(&job.id, report.result.success);
            if let Some(next) = self.evaluate(&job.id, depth, registry) {
                stack.push(next);
            }
            firings.push(TriggerFiring {
                job_id: job.id,
                depth,
                report,
            });
        }

        firings
    }

    /// Reactive jobs referencing `changed` whose conditions hold right now.
    fn evaluate(&self, changed: &str, depth: u32, registry: &JobRegistry) -> Option<Pass> {
        let dependents = match registry.dependents(changed) {
            Ok(jobs) => jobs,
            Err(e) => {
                error!(job_id = %changed, "failed to load dependent jobs: {e}");
                return None;
            }
        };
        if dependents.is_empty() {
            return None;
        }
        if depth >= self.max_depth {
            warn!(
                job_id = %changed,
                depth,
                max_depth = self.max_depth,
                "trigger depth limit reached, not propagating further"
            );
            return None;
        }

        let snapshot = self.snapshot();
        let ready: VecDeque<Job> = dependents
            .into_iter()
            .filter(|job| match &job.trigger {
                TriggerSpec::Reactive {
                    conditions,
                    operator,
                } => is_satisfied(conditions, *operator, &snapshot),
                _ => false,
            })
            .collect();

        Some(Pass {
            changed: changed.to_string(),
            depth,
            ready,
        })
    }
}

/// Satisfied dependents of one completion still waiting to run.
struct Pass {
    changed: String,
    depth: u32,
    ready: VecDeque<Job>,
}

/// Whether `conditions` hold against `outcomes`.
///
/// A condition holds when its job has an outcome matching `on`. An empty
/// condition list is never satisfied.
pub fn is_satisfied(
    conditions: &[Condition],
    operator: LogicalOperator,
    outcomes: &HashMap<String, LastOutcome>,
) -> bool {
    if conditions.is_empty() {
        return false;
    }
    let holds = |c: &Condition| {
        outcomes
            .get(&c.job_id)
            .is_some_and(|o| o.succeeded == (c.on == Outcome::Success))
    };
    match operator {
        LogicalOperator::And => conditions.iter().all(holds),
        LogicalOperator::Or => conditions.iter().any(holds),
    }
}
