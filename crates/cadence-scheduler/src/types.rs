use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

/// Render a timestamp the way every table stores it.
///
/// Fixed width (millisecond precision, `Z` suffix) so lexical order in
/// SQLite matches chronological order.
pub fn fmt_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Parse a timestamp written by [`fmt_ts`].
pub fn parse_ts(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

// ---------------------------------------------------------------------------
// Outcomes & conditions
// ---------------------------------------------------------------------------

/// Result of one execution attempt, also used as the expected outcome of a
/// reactive condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Success,
    Failure,
}

impl Outcome {
    pub fn from_success(success: bool) -> Self {
        if success {
            Outcome::Success
        } else {
            Outcome::Failure
        }
    }

    pub fn is_success(self) -> bool {
        matches!(self, Outcome::Success)
    }
}

impl std::fmt::Display for Outcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Outcome::Success => write!(f, "success"),
            Outcome::Failure => write!(f, "failure"),
        }
    }
}

impl std::str::FromStr for Outcome {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "success" => Ok(Outcome::Success),
            "failure" => Ok(Outcome::Failure),
            other => Err(format!("unknown outcome: {other}")),
        }
    }
}

/// How the conditions of a reactive job are combined.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum LogicalOperator {
    #[default]
    #[serde(rename = "AND")]
    And,
    #[serde(rename = "OR")]
    Or,
}

impl std::fmt::Display for LogicalOperator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogicalOperator::And => write!(f, "AND"),
            LogicalOperator::Or => write!(f, "OR"),
        }
    }
}

impl std::str::FromStr for LogicalOperator {
    type Err = String;

    /// Case-insensitive: `and`, `And` and `AND` are all accepted.
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "AND" => Ok(LogicalOperator::And),
            "OR" => Ok(LogicalOperator::Or),
            other => Err(format!("unknown logical operator: {other}")),
        }
    }
}

/// One clause of a reactive trigger: "job `job_id` last finished with `on`".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Condition {
    pub job_id: String,
    pub on: Outcome,
}

// ---------------------------------------------------------------------------
// Normalized triggers
// ---------------------------------------------------------------------------

/// Six textual cron fields; parsed on demand by [`crate::cron::CronSchedule`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CronSpec {
    pub second: String,
    pub minute: String,
    pub hour: String,
    pub day_of_month: String,
    pub month: String,
    pub day_of_week: String,
}

/// When a job runs, in closed normalized form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TriggerSpec {
    /// Fire exactly once at the given UTC instant.
    OneShotAt { at: DateTime<Utc> },

    /// Fire every `every_secs` seconds, counted from activation.
    Periodic { every_secs: u64 },

    /// Fire whenever the UTC wall clock matches all cron fields.
    Cron(CronSpec),

    /// Never fires on a timer; fired by the dependency evaluator.
    Reactive {
        conditions: Vec<Condition>,
        operator: LogicalOperator,
    },
}

impl TriggerSpec {
    pub fn is_reactive(&self) -> bool {
        matches!(self, TriggerSpec::Reactive { .. })
    }

    /// Upstream job ids this trigger waits on (empty for time-based triggers).
    pub fn upstream_ids(&self) -> impl Iterator<Item = &str> {
        let conditions: &[Condition] = match self {
            TriggerSpec::Reactive { conditions, .. } => conditions,
            _ => &[],
        };
        conditions.iter().map(|c| c.job_id.as_str())
    }

    /// Whether any condition references `job_id`.
    pub fn references(&self, job_id: &str) -> bool {
        self.upstream_ids().any(|id| id == job_id)
    }
}

/// Display metadata kept alongside a [`TriggerSpec`] so the user-facing
/// schedule can be reproduced exactly.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ScheduleKind {
    Once { run_date: String },
    Daily { run_date: String },
    Weekly { run_date: String },
    Monthly { run_date: String },
    EveryXDays { days: u32 },
    Interval { seconds: u64 },
    Cron { expression: String },
    Trigger,
}

// ---------------------------------------------------------------------------
// User-facing schedule description
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScheduleType {
    Date,
    Interval,
    Cron,
    Trigger,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DateType {
    Once,
    Daily,
    Weekly,
    Monthly,
    EveryXDays,
}

/// Schedule fields as clients send and receive them.
///
/// Which fields are meaningful depends on `schedule_type` (and `date_type`
/// for `date`); the normalizer rejects missing ones.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleDescription {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schedule_type: Option<ScheduleType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date_type: Option<DateType>,
    /// ISO-8601 instant for `date` schedules.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_date: Option<String>,
    /// Seconds between runs for `interval` schedules.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval: Option<i64>,
    /// Day count for `every_x_days`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub days: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cron_expression: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conditions: Option<Vec<Condition>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logical_operator: Option<String>,
}

// ---------------------------------------------------------------------------
// Jobs
// ---------------------------------------------------------------------------

/// How concurrent and late firings of one job are handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimePolicy {
    /// Scheduled firings beyond this many running instances are skipped.
    pub max_instances: u32,
    /// Collapse missed firings into one catch-up run instead of dropping them.
    pub coalesce: bool,
    /// How late a firing may start and still count as on time.
    pub misfire_grace_secs: u64,
}

impl Default for RuntimePolicy {
    fn default() -> Self {
        Self {
            max_instances: 1,
            coalesce: true,
            misfire_grace_secs: 60,
        }
    }
}

/// A persisted job definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub name: String,
    /// Script file, shown to users and used to pick the working directory.
    pub script_path: Option<String>,
    /// Inline source. Executed in preference to `script_path` when both exist.
    pub script_code: Option<String>,
    pub trigger: TriggerSpec,
    pub kind: ScheduleKind,
    pub policy: RuntimePolicy,
    /// Next timer firing; `None` for reactive and exhausted one-shot jobs.
    pub next_run: Option<DateTime<Utc>>,
    pub created_at: String,
    pub updated_at: String,
}

impl Job {
    /// The string the executor resolves: inline code first, then the path.
    pub fn executable(&self) -> &str {
        self.script_code
            .as_deref()
            .or(self.script_path.as_deref())
            .unwrap_or_default()
    }

    /// Client-facing representation with the original schedule fields.
    pub fn view(&self) -> JobView {
        JobView {
            id: self.id.clone(),
            name: self.name.clone(),
            script_path: self.script_path.clone(),
            script_code: self.script_code.clone(),
            schedule: crate::normalize::describe(&self.kind, &self.trigger),
            max_instances: self.policy.max_instances,
            coalesce: self.policy.coalesce,
            misfire_grace_time: self.policy.misfire_grace_secs,
            next_run_time: self.next_run.map(fmt_ts),
            trigger: self.trigger.clone(),
            created_at: self.created_at.clone(),
            updated_at: self.updated_at.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct JobView {
    pub id: String,
    pub name: String,
    pub script_path: Option<String>,
    pub script_code: Option<String>,
    #[serde(flatten)]
    pub schedule: ScheduleDescription,
    pub max_instances: u32,
    pub coalesce: bool,
    pub misfire_grace_time: u64,
    pub next_run_time: Option<String>,
    pub trigger: TriggerSpec,
    pub created_at: String,
    pub updated_at: String,
}

/// Input for [`JobRegistry::create`](crate::registry::JobRegistry::create).
#[derive(Debug, Clone, Default, Deserialize)]
pub struct JobSpec {
    /// Supplying an existing id replaces that job.
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub script_path: Option<String>,
    #[serde(default)]
    pub script_code: Option<String>,
    #[serde(flatten)]
    pub schedule: ScheduleDescription,
    #[serde(default)]
    pub max_instances: Option<u32>,
    #[serde(default)]
    pub coalesce: Option<bool>,
    #[serde(default)]
    pub misfire_grace_time: Option<u64>,
}

/// Partial update. Absent fields are left alone; a present `schedule_type`
/// replaces the whole trigger.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct JobPatch {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub script_path: Option<String>,
    #[serde(default)]
    pub script_code: Option<String>,
    #[serde(flatten)]
    pub schedule: ScheduleDescription,
    #[serde(default)]
    pub max_instances: Option<u32>,
    #[serde(default)]
    pub coalesce: Option<bool>,
    #[serde(default)]
    pub misfire_grace_time: Option<u64>,
}

// ---------------------------------------------------------------------------
// Runs
// ---------------------------------------------------------------------------

/// What caused an execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggeredBy {
    Schedule,
    Manual,
    Trigger,
}

impl std::fmt::Display for TriggeredBy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TriggeredBy::Schedule => "schedule",
            TriggeredBy::Manual => "manual",
            TriggeredBy::Trigger => "trigger",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for TriggeredBy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "schedule" => Ok(TriggeredBy::Schedule),
            "manual" => Ok(TriggeredBy::Manual),
            "trigger" => Ok(TriggeredBy::Trigger),
            other => Err(format!("unknown trigger source: {other}")),
        }
    }
}

/// A run record before the history store has assigned its sequence id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewRunRecord {
    pub job_id: String,
    pub job_name: String,
    pub status: Outcome,
    pub triggered_by: TriggeredBy,
    pub started_at: String,
    pub finished_at: String,
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

/// Immutable log entry for one execution attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunRecord {
    /// Monotonic sequence id assigned on append.
    pub id: i64,
    pub job_id: String,
    pub job_name: String,
    pub status: Outcome,
    pub triggered_by: TriggeredBy,
    pub started_at: String,
    pub finished_at: String,
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

/// Structured result of [`Executor::run`](crate::executor::Executor::run).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunResult {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
    /// `None` when the process could not be launched or was killed.
    pub exit_code: Option<i32>,
    pub resolved_cwd: String,
}

/// Most recent completion of a job, as seen by the dependency evaluator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LastOutcome {
    pub succeeded: bool,
    pub updated_at: DateTime<Utc>,
}
