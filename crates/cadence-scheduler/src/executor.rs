//! Run one job as a child process and record the attempt.
//!
//! The executable unit is the job's inline code if present, otherwise its
//! script path. When that string names an existing file the interpreter runs
//! the file; otherwise the string is passed as inline source after the
//! interpreter's inline flag (`python3 -c <source>` by default).

use std::{
    path::{Path, PathBuf},
    process::Stdio,
    sync::Arc,
    time::Duration,
};

use cadence_core::config::RuntimeConfig;
use chrono::Utc;
use dashmap::DashMap;
use tokio::process::Command;
use tracing::{debug, error, info, warn};

use crate::{
    error::Result,
    history::RunHistory,
    types::{fmt_ts, Job, NewRunRecord, Outcome, RunRecord, RunResult, TriggeredBy},
};

/// What one execution attempt produced.
#[derive(Debug)]
pub struct ExecutionReport {
    pub result: RunResult,
    /// The appended history record, or the error that prevented the append.
    pub record: Result<RunRecord>,
}

pub struct Executor {
    root: PathBuf,
    interpreter: String,
    inline_flag: String,
    timeout: Option<Duration>,
    max_output_chars: usize,
    history: Arc<RunHistory>,
    /// Live instance count per job id; entries are removed at zero.
    running: DashMap<String, u32>,
}

impl Executor {
    pub fn new(config: &RuntimeConfig, history: Arc<RunHistory>) -> Self {
        Self {
            root: PathBuf::from(&config.root_dir),
            interpreter: config.interpreter.clone(),
            inline_flag: config.inline_flag.clone(),
            timeout: config.timeout_secs.map(Duration::from_secs),
            max_output_chars: config.max_output_chars,
            history,
            running: DashMap::new(),
        }
    }

    pub fn history(&self) -> &RunHistory {
        &self.history
    }

    /// Number of instances of `job_id` currently executing.
    pub fn running(&self, job_id: &str) -> u32 {
        self.running.get(job_id).map(|n| *n).unwrap_or(0)
    }

    /// Execute `job` unconditionally. See [`Executor::run_bounded`].
    pub async fn run(&self, job: &Job, triggered_by: TriggeredBy) -> ExecutionReport {
        let _guard = self.acquire(&job.id, None);
        self.run_attempt(job, triggered_by).await
    }

    /// Execute `job` unless `max_instances` copies are already running, in
    /// which case nothing is executed or recorded and `None` is returned.
    ///
    /// Never fails otherwise: launch errors and timeouts become a failed
    /// [`RunResult`], and a history write error is logged and handed back in
    /// [`ExecutionReport::record`]. Exactly one run record is appended per
    /// attempt.
    pub async fn run_bounded(
        &self,
        job: &Job,
        triggered_by: TriggeredBy,
        max_instances: u32,
    ) -> Option<ExecutionReport> {
        let _guard = self.acquire(&job.id, Some(max_instances))?;
        Some(self.run_attempt(job, triggered_by).await)
    }

    fn acquire(&self, job_id: &str, limit: Option<u32>) -> Option<InstanceGuard<'_>> {
        let mut count = self.running.entry(job_id.to_string()).or_insert(0);
        if limit.is_some_and(|max| *count >= max) {
            return None;
        }
        *count += 1;
        Some(InstanceGuard {
            running: &self.running,
            job_id: job_id.to_string(),
        })
    }

    async fn run_attempt(&self, job: &Job, triggered_by: TriggeredBy) -> ExecutionReport {
        let started_at = Utc::now();
        info!(job_id = %job.id, name = %job.name, %triggered_by, "job starting");

        let result = self.execute(job).await;
        let finished_at = Utc::now();
        let status = Outcome::from_success(result.success);
        info!(
            job_id = %job.id,
            %status,
            exit_code = ?result.exit_code,
            elapsed_ms = (finished_at - started_at).num_milliseconds(),
            "job finished"
        );

        let record = self.history.append(&NewRunRecord {
            job_id: job.id.clone(),
            job_name: job.name.clone(),
            status,
            triggered_by,
            started_at: fmt_ts(started_at),
            finished_at: fmt_ts(finished_at),
            exit_code: result.exit_code,
            stdout: result.stdout.clone(),
            stderr: result.stderr.clone(),
        });
        if let Err(ref e) = record {
            error!(job_id = %job.id, "failed to record run: {e}");
        }

        ExecutionReport { result, record }
    }

    async fn execute(&self, job: &Job) -> RunResult {
        let cwd = self.working_dir(job).await;
        let resolved_cwd = cwd.display().to_string();
        let unit = job.executable();

        let mut command = Command::new(&self.interpreter);
        match self.existing_file(unit).await {
            Some(file) => {
                debug!(job_id = %job.id, file = %file.display(), "running script file");
                command.arg(file);
            }
            None => {
                debug!(job_id = %job.id, "running inline source");
                command.arg(&self.inline_flag).arg(unit);
            }
        }
        command
            .current_dir(&cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let failed = |stderr: String| RunResult {
            success: false,
            stdout: String::new(),
            stderr,
            exit_code: None,
            resolved_cwd: resolved_cwd.clone(),
        };

        let child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                warn!(job_id = %job.id, interpreter = %self.interpreter, "launch failed: {e}");
                return failed(format!("failed to launch {}: {e}", self.interpreter));
            }
        };

        let output = match self.timeout {
            Some(limit) => match tokio::time::timeout(limit, child.wait_with_output()).await {
                Ok(output) => output,
                Err(_) => {
                    warn!(job_id = %job.id, timeout_secs = limit.as_secs(), "job timed out");
                    return failed(format!("timed out after {}s", limit.as_secs()));
                }
            },
            None => child.wait_with_output().await,
        };

        match output {
            Ok(output) => RunResult {
                success: output.status.success(),
                stdout: clip_output(&String::from_utf8_lossy(&output.stdout), self.max_output_chars),
                stderr: clip_output(&String::from_utf8_lossy(&output.stderr), self.max_output_chars),
                exit_code: output.status.code(),
                resolved_cwd: resolved_cwd.clone(),
            },
            Err(e) => failed(format!("failed to collect output: {e}")),
        }
    }

    /// Parent directory of the job's script path if it exists, else the root.
    async fn working_dir(&self, job: &Job) -> PathBuf {
        let Some(parent) = job
            .script_path
            .as_deref()
            .and_then(|p| Path::new(p).parent())
            .filter(|p| !p.as_os_str().is_empty())
        else {
            return self.root.clone();
        };

        let dir = self.root.join(parent);
        match tokio::fs::metadata(&dir).await {
            Ok(meta) if meta.is_dir() => dir,
            _ => self.root.clone(),
        }
    }

    async fn existing_file(&self, unit: &str) -> Option<PathBuf> {
        if unit.is_empty() || unit.contains('\n') {
            return None;
        }
        let path = self.root.join(unit);
        match tokio::fs::metadata(&path).await {
            Ok(meta) if meta.is_file() => Some(path),
            _ => None,
        }
    }
}

struct InstanceGuard<'a> {
    running: &'a DashMap<String, u32>,
    job_id: String,
}

impl Drop for InstanceGuard<'_> {
    fn drop(&mut self) {
        if let Some(mut count) = self.running.get_mut(&self.job_id) {
            *count = count.saturating_sub(1);
        }
        self.running.remove_if(&self.job_id, |_, count| *count == 0);
    }
}

/// Keep the first and last halves of `text` when it exceeds `max_chars`.
pub fn clip_output(text: &str, max_chars: usize) -> String {
    let total = text.chars().count();
    if total <= max_chars {
        return text.to_owned();
    }
    let half = max_chars / 2;
    let head: String = text.chars().take(half).collect();
    let tail: String = text.chars().skip(total - half).collect();
    format!("{head}\n[... {} chars clipped ...]\n{tail}", total - 2 * half)
}
