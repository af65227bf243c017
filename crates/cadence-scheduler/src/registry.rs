use std::{
    collections::{HashMap, HashSet},
    sync::{Mutex, MutexGuard, PoisonError},
};

use chrono::{DateTime, SubsecRound, Utc};
use rusqlite::{Connection, OptionalExtension, Row};
use tracing::{info, warn};
use uuid::Uuid;

use crate::{
    db::init_db,
    error::{Result, SchedulerError},
    normalize::{normalize, NormalizeContext},
    schedule::{first_fire, MAX_YEAR},
    types::{fmt_ts, parse_ts, Job, JobPatch, JobSpec, RuntimePolicy, TriggerSpec},
};

const JOB_COLUMNS: &str = "id, name, script_path, script_code, trigger_spec, schedule_kind,
                           max_instances, coalesce, misfire_grace_secs, next_run,
                           created_at, updated_at";

/// Durable job definitions plus the engine-owned `next_run` column.
///
/// Every mutating operation validates and writes under one connection lock,
/// so the known-id set and cycle check always see a consistent registry.
pub struct JobRegistry {
    conn: Mutex<Connection>,
}

impl JobRegistry {
    pub fn new(conn: Connection) -> Result<Self> {
        init_db(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a job, replacing any existing job with the same id.
    pub fn create(&self, spec: JobSpec) -> Result<Job> {
        let conn = self.conn();
        let now = Utc::now().trunc_subsecs(3);

        let id = match spec.id.as_deref().map(str::trim) {
            Some(id) if !id.is_empty() => id.to_string(),
            _ => Uuid::new_v4().to_string(),
        };

        let jobs = load_all_strict(&conn)?;
        let known: HashSet<String> = jobs.iter().map(|j| j.id.clone()).collect();
        let (trigger, kind) = normalize(
            &spec.schedule,
            &NormalizeContext {
                job_id: &id,
                known_ids: &known,
            },
        )?;
        check_acyclic(&jobs, &id, &trigger)?;

        let (script_path, script_code) = payload(spec.script_path, spec.script_code)?;
        let defaults = RuntimePolicy::default();
        let policy = policy(
            spec.max_instances.unwrap_or(defaults.max_instances),
            spec.coalesce.unwrap_or(defaults.coalesce),
            spec.misfire_grace_time.unwrap_or(defaults.misfire_grace_secs),
        )?;

        let existing = jobs.into_iter().find(|j| j.id == id);
        let job = Job {
            name: non_empty(spec.name).unwrap_or_else(|| id.clone()),
            next_run: activate(&trigger, now)?,
            created_at: existing
                .as_ref()
                .map(|j| j.created_at.clone())
                .unwrap_or_else(|| fmt_ts(now)),
            updated_at: fmt_ts(now),
            id,
            script_path,
            script_code,
            trigger,
            kind,
            policy,
        };

        write_job(&conn, &job)?;
        if existing.is_some() {
            info!(job_id = %job.id, name = %job.name, "job replaced");
        } else {
            info!(job_id = %job.id, name = %job.name, "job created");
        }
        Ok(job)
    }

    pub fn get(&self, id: &str) -> Result<Job> {
        load_one(&self.conn(), id)?.ok_or_else(|| SchedulerError::JobNotFound { id: id.to_string() })
    }

    /// All jobs, ordered by creation time then id.
    pub fn list(&self) -> Result<Vec<Job>> {
        load_all(&self.conn())
    }

    pub fn ids(&self) -> Result<HashSet<String>> {
        let conn = self.conn();
        let mut stmt = conn.prepare_cached("SELECT id FROM jobs")?;
        let ids = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<HashSet<_>>>()?;
        Ok(ids)
    }

    /// Apply a partial update. A schedule in the patch replaces the trigger
    /// and restarts its timer from now.
    pub fn update(&self, id: &str, patch: JobPatch) -> Result<Job> {
        let conn = self.conn();
        let now = Utc::now().trunc_subsecs(3);

        let jobs = load_all_strict(&conn)?;
        let mut job = jobs
            .iter()
            .find(|j| j.id == id)
            .cloned()
            .ok_or_else(|| SchedulerError::JobNotFound { id: id.to_string() })?;

        if patch.schedule.schedule_type.is_some() {
            let known: HashSet<String> = jobs.iter().map(|j| j.id.clone()).collect();
            let (trigger, kind) = normalize(
                &patch.schedule,
                &NormalizeContext {
                    job_id: id,
                    known_ids: &known,
                },
            )?;
            check_acyclic(&jobs, id, &trigger)?;
            job.next_run = activate(&trigger, now)?;
            job.trigger = trigger;
            job.kind = kind;
        }

        if let Some(name) = non_empty(patch.name) {
            job.name = name;
        }
        let script_path = match patch.script_path {
            Some(p) => non_empty(Some(p)),
            None => job.script_path.take(),
        };
        let script_code = match patch.script_code {
            Some(c) => non_empty(Some(c)),
            None => job.script_code.take(),
        };
        (job.script_path, job.script_code) = payload(script_path, script_code)?;

        job.policy = policy(
            patch.max_instances.unwrap_or(job.policy.max_instances),
            patch.coalesce.unwrap_or(job.policy.coalesce),
            patch.misfire_grace_time.unwrap_or(job.policy.misfire_grace_secs),
        )?;
        job.updated_at = fmt_ts(now);

        write_job(&conn, &job)?;
        info!(job_id = %job.id, name = %job.name, "job updated");
        Ok(job)
    }

    /// Remove a job and with it any pending timer firing.
    pub fn delete(&self, id: &str) -> Result<()> {
        let n = self.conn().execute("DELETE FROM jobs WHERE id = ?1", [id])?;
        if n == 0 {
            return Err(SchedulerError::JobNotFound { id: id.to_string() });
        }
        info!(job_id = %id, "job deleted");
        Ok(())
    }

    /// Jobs whose timer is at or before `now`, earliest first.
    pub fn due(&self, now: DateTime<Utc>) -> Result<Vec<Job>> {
        let conn = self.conn();
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs
             WHERE next_run IS NOT NULL AND next_run <= ?1
             ORDER BY next_run, id"
        ))?;
        let rows = stmt
            .query_map([fmt_ts(now)], JobRow::read)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(decode_rows(rows))
    }

    /// Move a job's timer from `scheduled` to `next`.
    ///
    /// Returns `false` when the job was deleted or rescheduled since
    /// `scheduled` was read, in which case nothing is written.
    pub fn set_next_run(
        &self,
        id: &str,
        scheduled: DateTime<Utc>,
        next: Option<DateTime<Utc>>,
    ) -> Result<bool> {
        let n = self.conn().execute(
            "UPDATE jobs SET next_run = ?1 WHERE id = ?2 AND next_run = ?3",
            rusqlite::params![next.map(fmt_ts), id, fmt_ts(scheduled)],
        )?;
        Ok(n == 1)
    }

    /// Reactive jobs with at least one condition on `upstream`.
    pub fn dependents(&self, upstream: &str) -> Result<Vec<Job>> {
        let conn = self.conn();
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs
             WHERE json_extract(trigger_spec, '$.kind') = 'reactive'
             ORDER BY created_at, id"
        ))?;
        let rows = stmt
            .query_map([], JobRow::read)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(decode_rows(rows)
            .into_iter()
            .filter(|j| j.id != upstream && j.trigger.references(upstream))
            .collect())
    }
}

// ---------------------------------------------------------------------------
// Validation helpers
// ---------------------------------------------------------------------------

/// Timer for a newly set trigger. A time-based trigger with no reachable
/// firing would sit in the registry forever, so it is rejected.
fn activate(trigger: &TriggerSpec, now: DateTime<Utc>) -> Result<Option<DateTime<Utc>>> {
    let next = first_fire(trigger, now);
    if next.is_none() && !matches!(trigger, TriggerSpec::Reactive { .. }) {
        return Err(SchedulerError::validation(format!(
            "schedule has no firing on or before year {MAX_YEAR}"
        )));
    }
    Ok(next)
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn payload(
    script_path: Option<String>,
    script_code: Option<String>,
) -> Result<(Option<String>, Option<String>)> {
    let script_path = non_empty(script_path);
    let script_code = script_code.filter(|c| !c.trim().is_empty());
    if script_path.is_none() && script_code.is_none() {
        return Err(SchedulerError::validation(
            "either script_path or script_code is required",
        ));
    }
    Ok((script_path, script_code))
}

fn policy(max_instances: u32, coalesce: bool, misfire_grace_secs: u64) -> Result<RuntimePolicy> {
    if max_instances == 0 {
        return Err(SchedulerError::validation("max_instances must be at least 1"));
    }
    Ok(RuntimePolicy {
        max_instances,
        coalesce,
        misfire_grace_secs,
    })
}

/// Reject `trigger` for job `id` if it would close a dependency cycle.
///
/// Edges point from a reactive job to each job it waits on; the registry is
/// acyclic before the change, so any new cycle passes through `id`.
fn check_acyclic(jobs: &[Job], id: &str, trigger: &TriggerSpec) -> Result<()> {
    let mut edges: HashMap<&str, Vec<&str>> = jobs
        .iter()
        .filter(|j| j.id != id)
        .map(|j| (j.id.as_str(), j.trigger.upstream_ids().collect()))
        .collect();
    edges.insert(id, trigger.upstream_ids().collect());

    let mut stack: Vec<&str> = edges.get(id).cloned().unwrap_or_default();
    let mut seen: HashSet<&str> = HashSet::new();
    while let Some(node) = stack.pop() {
        if node == id {
            return Err(SchedulerError::validation(format!(
                "trigger conditions of job {id} form a dependency cycle"
            )));
        }
        if seen.insert(node) {
            if let Some(next) = edges.get(node) {
                stack.extend(next.iter().copied());
            }
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Row mapping
// ---------------------------------------------------------------------------

struct JobRow {
    id: String,
    name: String,
    script_path: Option<String>,
    script_code: Option<String>,
    trigger_json: String,
    kind_json: String,
    max_instances: u32,
    coalesce: bool,
    misfire_grace_secs: i64,
    next_run: Option<String>,
    created_at: String,
    updated_at: String,
}

impl JobRow {
    fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            name: row.get(1)?,
            script_path: row.get(2)?,
            script_code: row.get(3)?,
            trigger_json: row.get(4)?,
            kind_json: row.get(5)?,
            max_instances: row.get(6)?,
            coalesce: row.get(7)?,
            misfire_grace_secs: row.get(8)?,
            next_run: row.get(9)?,
            created_at: row.get(10)?,
            updated_at: row.get(11)?,
        })
    }

    fn into_job(self) -> Result<Job> {
        Ok(Job {
            trigger: serde_json::from_str(&self.trigger_json)?,
            kind: serde_json::from_str(&self.kind_json)?,
            policy: RuntimePolicy {
                max_instances: self.max_instances,
                coalesce: self.coalesce,
                misfire_grace_secs: u64::try_from(self.misfire_grace_secs).unwrap_or(0),
            },
            next_run: self.next_run.as_deref().and_then(parse_ts),
            id: self.id,
            name: self.name,
            script_path: self.script_path,
            script_code: self.script_code,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

/// Decode rows, skipping (and logging) any whose JSON columns are unreadable.
fn decode_rows(rows: Vec<JobRow>) -> Vec<Job> {
    rows.into_iter()
        .filter_map(|row| {
            let id = row.id.clone();
            match row.into_job() {
                Ok(job) => Some(job),
                Err(e) => {
                    warn!(job_id = %id, "skipping undecodable job row: {e}");
                    None
                }
            }
        })
        .collect()
}

fn load_rows(conn: &Connection) -> Result<Vec<JobRow>> {
    let mut stmt = conn.prepare_cached(&format!(
        "SELECT {JOB_COLUMNS} FROM jobs ORDER BY created_at, id"
    ))?;
    let rows = stmt
        .query_map([], JobRow::read)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

fn load_all(conn: &Connection) -> Result<Vec<Job>> {
    Ok(decode_rows(load_rows(conn)?))
}

/// Like [`load_all`] but fails on the first undecodable row, so validation
/// never runs against a partial view of the registry.
fn load_all_strict(conn: &Connection) -> Result<Vec<Job>> {
    load_rows(conn)?.into_iter().map(JobRow::into_job).collect()
}

fn load_one(conn: &Connection, id: &str) -> Result<Option<Job>> {
    let row = conn
        .query_row(
            &format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?1"),
            [id],
            JobRow::read,
        )
        .optional()?;
    row.map(JobRow::into_job).transpose()
}

fn write_job(conn: &Connection, job: &Job) -> Result<()> {
    conn.execute(
        "INSERT INTO jobs
         (id, name, script_path, script_code, trigger_spec, schedule_kind,
          max_instances, coalesce, misfire_grace_secs, next_run, created_at, updated_at)
         VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12)
         ON CONFLICT(id) DO UPDATE SET
             name = excluded.name,
             script_path = excluded.script_path,
             script_code = excluded.script_code,
             trigger_spec = excluded.trigger_spec,
             schedule_kind = excluded.schedule_kind,
             max_instances = excluded.max_instances,
             coalesce = excluded.coalesce,
             misfire_grace_secs = excluded.misfire_grace_secs,
             next_run = excluded.next_run,
             updated_at = excluded.updated_at",
        rusqlite::params![
            job.id,
            job.name,
            job.script_path,
            job.script_code,
            serde_json::to_string(&job.trigger)?,
            serde_json::to_string(&job.kind)?,
            job.policy.max_instances,
            job.policy.coalesce,
            i64::try_from(job.policy.misfire_grace_secs).unwrap_or(i64::MAX),
            job.next_run.map(fmt_ts),
            job.created_at,
            job.updated_at,
        ],
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{
        Condition, DateType, LogicalOperator, Outcome, ScheduleDescription, ScheduleKind,
        ScheduleType,
    };

    fn registry() -> JobRegistry {
        JobRegistry::new(Connection::open_in_memory().unwrap()).unwrap()
    }

    fn interval_spec(id: &str, seconds: i64) -> JobSpec {
        JobSpec {
            id: Some(id.to_string()),
            script_code: Some("print('hi')".to_string()),
            schedule: ScheduleDescription {
                schedule_type: Some(ScheduleType::Interval),
                interval: Some(seconds),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn trigger_spec(id: &str, upstream: &[&str]) -> JobSpec {
        JobSpec {
            id: Some(id.to_string()),
            script_code: Some("print('downstream')".to_string()),
            schedule: ScheduleDescription {
                schedule_type: Some(ScheduleType::Trigger),
                conditions: Some(
                    upstream
                        .iter()
                        .map(|u| Condition {
                            job_id: u.to_string(),
                            on: Outcome::Success,
                        })
                        .collect(),
                ),
                logical_operator: Some("or".to_string()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn create_defaults_and_activation() {
        let reg = registry();
        let before = Utc::now();
        let job = reg.create(interval_spec("tick", 30)).unwrap();

        assert_eq!(job.name, "tick");
        assert_eq!(job.policy, RuntimePolicy::default());
        assert_eq!(job.kind, ScheduleKind::Interval { seconds: 30 });
        let next = job.next_run.unwrap();
        assert!(next >= before + chrono::Duration::seconds(30));
        assert_eq!(reg.get("tick").unwrap(), job);
    }

    #[test]
    fn create_generates_uuid_when_id_missing() {
        let reg = registry();
        let mut spec = interval_spec("x", 5);
        spec.id = None;
        let job = reg.create(spec).unwrap();
        assert!(Uuid::parse_str(&job.id).is_ok());
    }

    #[test]
    fn payload_and_policy_are_validated() {
        let reg = registry();
        let mut spec = interval_spec("a", 5);
        spec.script_code = None;
        assert!(matches!(reg.create(spec), Err(SchedulerError::Validation(_))));

        let mut spec = interval_spec("a", 5);
        spec.max_instances = Some(0);
        assert!(matches!(reg.create(spec), Err(SchedulerError::Validation(_))));

        assert!(reg.list().unwrap().is_empty());
    }

    #[test]
    fn create_with_existing_id_replaces() {
        let reg = registry();
        let first = reg.create(interval_spec("a", 5)).unwrap();
        let mut spec = interval_spec("a", 60);
        spec.name = Some("renamed".to_string());
        let second = reg.create(spec).unwrap();

        assert_eq!(reg.list().unwrap().len(), 1);
        assert_eq!(second.name, "renamed");
        assert_eq!(second.created_at, first.created_at);
        assert_eq!(second.kind, ScheduleKind::Interval { seconds: 60 });
    }

    #[test]
    fn reactive_jobs_have_no_timer() {
        let reg = registry();
        reg.create(interval_spec("up", 5)).unwrap();
        let down = reg.create(trigger_spec("down", &["up"])).unwrap();
        assert_eq!(down.next_run, None);
        match &down.trigger {
            TriggerSpec::Reactive { operator, .. } => assert_eq!(*operator, LogicalOperator::Or),
            other => panic!("expected reactive trigger, got {other:?}"),
        }
        let deps = reg.dependents("up").unwrap();
        assert_eq!(deps.len(), 1);
        assert_eq!(deps[0].id, "down");
        assert!(reg.dependents("down").unwrap().is_empty());
    }

    #[test]
    fn unknown_upstream_is_rejected() {
        let reg = registry();
        let err = reg.create(trigger_spec("down", &["ghost"])).unwrap_err();
        assert!(matches!(err, SchedulerError::Validation(_)));
    }

    #[test]
    fn dependency_cycles_are_rejected() {
        let reg = registry();
        reg.create(interval_spec("a", 5)).unwrap();
        reg.create(trigger_spec("b", &["a"])).unwrap();
        reg.create(trigger_spec("c", &["b"])).unwrap();

        // Turning `a` into a job triggered by `c` closes a -> c -> b -> a.
        let patch = JobPatch {
            schedule: trigger_spec("a", &["c"]).schedule,
            ..Default::default()
        };
        match reg.update("a", patch) {
            Err(SchedulerError::Validation(msg)) => assert!(msg.contains("cycle")),
            other => panic!("expected cycle rejection, got {other:?}"),
        }
        assert!(!reg.get("a").unwrap().trigger.is_reactive());
    }

    #[test]
    fn update_applies_fields_and_reschedules() {
        let reg = registry();
        reg.create(interval_spec("a", 5)).unwrap();

        let patch = JobPatch {
            name: Some("nightly".to_string()),
            max_instances: Some(3),
            schedule: ScheduleDescription {
                schedule_type: Some(ScheduleType::Date),
                date_type: Some(DateType::Daily),
                run_date: Some("2024-03-04T02:15:00Z".to_string()),
                ..Default::default()
            },
            ..Default::default()
        };
        let job = reg.update("a", patch).unwrap();
        assert_eq!(job.name, "nightly");
        assert_eq!(job.policy.max_instances, 3);
        assert_eq!(
            job.kind,
            ScheduleKind::Daily {
                run_date: "2024-03-04T02:15:00+00:00".to_string()
            }
        );
        assert!(job.next_run.is_some());
        assert_eq!(job.script_code.as_deref(), Some("print('hi')"));
    }

    #[test]
    fn update_and_delete_unknown_are_not_found() {
        let reg = registry();
        assert!(matches!(
            reg.update("nope", JobPatch::default()),
            Err(SchedulerError::JobNotFound { .. })
        ));
        assert!(matches!(reg.delete("nope"), Err(SchedulerError::JobNotFound { .. })));
    }

    #[test]
    fn due_and_set_next_run() {
        let reg = registry();
        let job = reg.create(interval_spec("a", 5)).unwrap();
        let scheduled = job.next_run.unwrap();

        assert!(reg.due(scheduled - chrono::Duration::seconds(1)).unwrap().is_empty());
        let due = reg.due(scheduled).unwrap();
        assert_eq!(due.len(), 1);

        let next = scheduled + chrono::Duration::seconds(5);
        assert!(reg.set_next_run("a", scheduled, Some(next)).unwrap());
        // Stale `scheduled` no longer matches.
        assert!(!reg.set_next_run("a", scheduled, None).unwrap());
        assert_eq!(reg.get("a").unwrap().next_run, Some(next));
    }

    #[test]
    fn list_is_ordered_and_delete_removes() {
        let reg = registry();
        reg.create(interval_spec("a", 5)).unwrap();
        reg.create(interval_spec("b", 5)).unwrap();
        let ids: Vec<String> = reg.list().unwrap().into_iter().map(|j| j.id).collect();
        assert_eq!(ids.len(), 2);
        assert!(ids.contains(&"a".to_string()));

        reg.delete("a").unwrap();
        assert_eq!(reg.ids().unwrap(), HashSet::from(["b".to_string()]));
    }

    #[test]
    fn unreachable_intervals_are_rejected() {
        let reg = registry();
        for seconds in [400_000_000_000, 1_000_000_000_000_000] {
            assert!(matches!(
                reg.create(interval_spec("far", seconds)),
                Err(SchedulerError::Validation(_))
            ));
        }
        assert!(reg.list().unwrap().is_empty());

        reg.create(interval_spec("a", 5)).unwrap();
        let patch = JobPatch {
            schedule: ScheduleDescription {
                schedule_type: Some(ScheduleType::Interval),
                interval: Some(400_000_000_000),
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(matches!(reg.update("a", patch), Err(SchedulerError::Validation(_))));
        assert_eq!(reg.get("a").unwrap().kind, ScheduleKind::Interval { seconds: 5 });
    }

    #[test]
    fn undecodable_row_blocks_validation_but_not_listing() {
        let reg = registry();
        reg.create(interval_spec("a", 5)).unwrap();
        reg.conn()
            .execute("UPDATE jobs SET trigger_spec = 'not json' WHERE id = 'a'", [])
            .unwrap();

        assert!(reg.list().unwrap().is_empty());
        assert!(matches!(
            reg.create(trigger_spec("b", &["a"])),
            Err(SchedulerError::Serialization(_))
        ));
    }
}
