use std::{sync::Arc, time::Duration};

use chrono::{DateTime, SubsecRound, Utc};
use tokio::{sync::watch, task::JoinHandle, time::MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::{
    error::Result,
    kernel::SchedulerKernel,
    schedule::{classify, following_fire, Firing},
};

/// Timer loop: polls the registry for due jobs and fires them on their own
/// tasks.
pub struct SchedulerEngine {
    kernel: Arc<SchedulerKernel>,
    period: Duration,
}

impl SchedulerEngine {
    pub fn new(kernel: Arc<SchedulerKernel>, period: Duration) -> Self {
        Self { kernel, period }
    }

    /// Main event loop. Ticks until `shutdown` broadcasts `true`.
    ///
    /// Jobs already running when the loop stops are left to finish on their
    /// own tasks.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(tick_ms = self.period.as_millis() as u64, "scheduler engine started");

        let mut interval = tokio::time::interval(self.period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.tick(Utc::now()) {
                        error!("scheduler tick error: {e}");
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("scheduler engine shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// Process every job due at `now`: advance its timer, apply the misfire
    /// policy and spawn the firings that should run.
    pub fn tick(&self, now: DateTime<Utc>) -> Result<Vec<JoinHandle<()>>> {
        let now = now.trunc_subsecs(3);
        let due = self.kernel.registry().due(now)?;
        let mut spawned = Vec::with_capacity(due.len());

        for job in due {
            let Some(scheduled) = job.next_run else {
                continue;
            };
            let firing = classify(scheduled, now, &job.policy);
            let next = following_fire(&job.trigger, scheduled, now, job.policy.coalesce);

            if !self.kernel.registry().set_next_run(&job.id, scheduled, next)? {
                debug!(job_id = %job.id, "job changed since it was read, skipping");
                continue;
            }

            let late_secs = (now - scheduled).num_seconds();
            match firing {
                Firing::Missed => {
                    warn!(job_id = %job.id, late_secs, "run time missed, skipping");
                    continue;
                }
                Firing::CatchUp => {
                    info!(job_id = %job.id, late_secs, "run time missed, running once to catch up");
                }
                Firing::OnTime => {
                    debug!(job_id = %job.id, next_run = ?next, "job due");
                }
            }

            let kernel = Arc::clone(&self.kernel);
            spawned.push(tokio::spawn(async move {
                kernel.fire_scheduled(&job).await;
            }));
        }
        Ok(spawned)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{DateType, JobSpec, ScheduleDescription, ScheduleType, TriggeredBy};
    use cadence_core::config::{RuntimeConfig, SchedulerConfig};
    use chrono::Duration as ChronoDuration;
    use rusqlite::Connection;

    fn engine() -> SchedulerEngine {
        let runtime = RuntimeConfig {
            root_dir: std::env::temp_dir().display().to_string(),
            interpreter: "sh".to_string(),
            inline_flag: "-c".to_string(),
            timeout_secs: Some(10),
            max_output_chars: 4096,
        };
        let kernel = SchedulerKernel::new(
            Connection::open_in_memory().unwrap(),
            Connection::open_in_memory().unwrap(),
            &runtime,
            &SchedulerConfig::default(),
        )
        .unwrap();
        SchedulerEngine::new(Arc::new(kernel), Duration::from_millis(50))
    }

    fn interval_job(id: &str, seconds: i64, coalesce: bool) -> JobSpec {
        JobSpec {
            id: Some(id.to_string()),
            script_code: Some("true".to_string()),
            schedule: ScheduleDescription {
                schedule_type: Some(ScheduleType::Interval),
                interval: Some(seconds),
                ..Default::default()
            },
            coalesce: Some(coalesce),
            ..Default::default()
        }
    }

    /// Move a job's timer to `at` and return the new value.
    fn reschedule(engine: &SchedulerEngine, id: &str, at: DateTime<Utc>) -> DateTime<Utc> {
        let registry = engine.kernel.registry();
        let current = registry.get(id).unwrap().next_run.unwrap();
        let at = at.trunc_subsecs(3);
        assert!(registry.set_next_run(id, current, Some(at)).unwrap());
        at
    }

    async fn join(handles: Vec<JoinHandle<()>>) -> usize {
        let n = handles.len();
        for h in handles {
            h.await.unwrap();
        }
        n
    }

    #[tokio::test]
    async fn due_job_fires_and_advances() {
        let engine = engine();
        engine.kernel.create_job(interval_job("tick", 60, true)).unwrap();
        let now = Utc::now().trunc_subsecs(3);
        let scheduled = reschedule(&engine, "tick", now - ChronoDuration::seconds(5));

        assert_eq!(join(engine.tick(now).unwrap()).await, 1);

        let runs = engine.kernel.list_runs(None).unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].triggered_by, TriggeredBy::Schedule);
        let next = engine.kernel.get_job("tick").unwrap().next_run.unwrap();
        assert_eq!(next, scheduled + ChronoDuration::seconds(60));

        // Nothing is due any more.
        assert!(engine.tick(now).unwrap().is_empty());
    }

    #[tokio::test]
    async fn late_firing_without_coalesce_is_dropped() {
        let engine = engine();
        engine.kernel.create_job(interval_job("strict", 60, false)).unwrap();
        let now = Utc::now().trunc_subsecs(3);
        let scheduled = reschedule(&engine, "strict", now - ChronoDuration::minutes(10));

        assert_eq!(join(engine.tick(now).unwrap()).await, 0);
        assert!(engine.kernel.list_runs(None).unwrap().is_empty());
        let next = engine.kernel.get_job("strict").unwrap().next_run.unwrap();
        assert_eq!(next, scheduled + ChronoDuration::seconds(60));
    }

    #[tokio::test]
    async fn late_firing_with_coalesce_runs_once() {
        let engine = engine();
        engine.kernel.create_job(interval_job("loose", 60, true)).unwrap();
        let now = Utc::now().trunc_subsecs(3);
        reschedule(&engine, "loose", now - ChronoDuration::minutes(10));

        assert_eq!(join(engine.tick(now).unwrap()).await, 1);
        assert_eq!(engine.kernel.list_runs(None).unwrap().len(), 1);
        let next = engine.kernel.get_job("loose").unwrap().next_run.unwrap();
        assert!(next > now);
        assert!(engine.tick(now).unwrap().is_empty());
    }

    #[tokio::test]
    async fn one_shot_fires_once() {
        let engine = engine();
        let run_date = (Utc::now() - ChronoDuration::seconds(2)).to_rfc3339();
        engine
            .kernel
            .create_job(JobSpec {
                id: Some("once".to_string()),
                script_code: Some("true".to_string()),
                schedule: ScheduleDescription {
                    schedule_type: Some(ScheduleType::Date),
                    date_type: Some(DateType::Once),
                    run_date: Some(run_date),
                    ..Default::default()
                },
                ..Default::default()
            })
            .unwrap();

        let now = Utc::now();
        assert_eq!(join(engine.tick(now).unwrap()).await, 1);
        assert_eq!(engine.kernel.get_job("once").unwrap().next_run, None);
        assert!(engine.tick(now + ChronoDuration::hours(1)).unwrap().is_empty());
    }

    #[tokio::test]
    async fn run_stops_on_shutdown() {
        let engine = engine();
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(engine.run(rx));
        tokio::time::sleep(Duration::from_millis(120)).await;
        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("engine did not stop")
            .unwrap();
    }
}
