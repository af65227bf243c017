use std::sync::{Mutex, MutexGuard, PoisonError};

use rusqlite::{types::Type, Connection, OptionalExtension, Row};
use tracing::debug;

use crate::{
    db::init_db,
    error::{Result, SchedulerError},
    types::{NewRunRecord, RunRecord},
};

pub const DEFAULT_RUN_LIMIT: i64 = 200;
pub const MAX_RUN_LIMIT: i64 = 1000;

const RUN_COLUMNS: &str = "id, job_id, job_name, status, triggered_by, started_at, finished_at,
                           exit_code, stdout, stderr";

/// Append-only store of [`RunRecord`]s.
///
/// The SQLite rowid is the sequence id, so appends under the connection
/// lock are strictly increasing even with concurrent writers.
pub struct RunHistory {
    conn: Mutex<Connection>,
}

impl RunHistory {
    pub fn new(conn: Connection) -> Result<Self> {
        init_db(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Persist `new` and return it with its assigned sequence id.
    pub fn append(&self, new: &NewRunRecord) -> Result<RunRecord> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO job_runs
             (job_id, job_name, status, triggered_by, started_at, finished_at,
              exit_code, stdout, stderr)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9)",
            rusqlite::params![
                new.job_id,
                new.job_name,
                new.status.to_string(),
                new.triggered_by.to_string(),
                new.started_at,
                new.finished_at,
                new.exit_code,
                new.stdout,
                new.stderr,
            ],
        )?;
        let id = conn.last_insert_rowid();
        debug!(run_id = id, job_id = %new.job_id, status = %new.status, "run recorded");

        Ok(RunRecord {
            id,
            job_id: new.job_id.clone(),
            job_name: new.job_name.clone(),
            status: new.status,
            triggered_by: new.triggered_by,
            started_at: new.started_at.clone(),
            finished_at: new.finished_at.clone(),
            exit_code: new.exit_code,
            stdout: new.stdout.clone(),
            stderr: new.stderr.clone(),
        })
    }

    /// Most recent runs, newest first. See [`clamp_limit`].
    pub fn list(&self, limit: Option<i64>) -> Result<Vec<RunRecord>> {
        let conn = self.conn();
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {RUN_COLUMNS} FROM job_runs ORDER BY id DESC LIMIT ?1"
        ))?;
        let runs = stmt
            .query_map([clamp_limit(limit)], row_to_record)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(runs)
    }

    pub fn get(&self, id: i64) -> Result<RunRecord> {
        let conn = self.conn();
        conn.query_row(
            &format!("SELECT {RUN_COLUMNS} FROM job_runs WHERE id = ?1"),
            [id],
            row_to_record,
        )
        .optional()?
        .ok_or(SchedulerError::RunNotFound { id })
    }

    /// The newest run of every job that has one.
    pub fn latest_per_job(&self) -> Result<Vec<RunRecord>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {RUN_COLUMNS} FROM job_runs
             WHERE id IN (SELECT MAX(id) FROM job_runs GROUP BY job_id)
             ORDER BY id"
        ))?;
        let runs = stmt
            .query_map([], row_to_record)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(runs)
    }
}

/// Default 200; anything below 1 becomes 1 and anything above 1000 becomes 1000.
pub fn clamp_limit(limit: Option<i64>) -> i64 {
    limit.unwrap_or(DEFAULT_RUN_LIMIT).clamp(1, MAX_RUN_LIMIT)
}

fn row_to_record(row: &Row<'_>) -> rusqlite::Result<RunRecord> {
    let status: String = row.get(3)?;
    let triggered_by: String = row.get(4)?;
    Ok(RunRecord {
        id: row.get(0)?,
        job_id: row.get(1)?,
        job_name: row.get(2)?,
        status: status.parse().map_err(|e: String| conversion_error(3, e))?,
        triggered_by: triggered_by
            .parse()
            .map_err(|e: String| conversion_error(4, e))?,
        started_at: row.get(5)?,
        finished_at: row.get(6)?,
        exit_code: row.get(7)?,
        stdout: row.get(8)?,
        stderr: row.get(9)?,
    })
}

fn conversion_error(idx: usize, msg: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, msg.into())
}
