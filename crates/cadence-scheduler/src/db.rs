use rusqlite::Connection;

use crate::error::Result;

/// Initialise the scheduler schema in `conn`. Idempotent.
///
/// `jobs` holds definitions plus the engine's `next_run`; `job_runs` is the
/// append-only run history whose rowid is the run sequence id.
pub fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS jobs (
            id                  TEXT    NOT NULL PRIMARY KEY,
            name                TEXT    NOT NULL,
            script_path         TEXT,
            script_code         TEXT,
            trigger_spec        TEXT    NOT NULL,   -- JSON-encoded TriggerSpec
            schedule_kind       TEXT    NOT NULL,   -- JSON-encoded ScheduleKind
            max_instances       INTEGER NOT NULL DEFAULT 1,
            coalesce            INTEGER NOT NULL DEFAULT 1,
            misfire_grace_secs  INTEGER NOT NULL DEFAULT 60,
            next_run            TEXT,               -- fixed-width RFC 3339 or NULL
            created_at          TEXT    NOT NULL,
            updated_at          TEXT    NOT NULL
        ) STRICT;

        -- Polling: SELECT … WHERE next_run <= ?
        CREATE INDEX IF NOT EXISTS idx_jobs_next_run ON jobs (next_run);

        CREATE TABLE IF NOT EXISTS job_runs (
            id            INTEGER PRIMARY KEY AUTOINCREMENT,
            job_id        TEXT    NOT NULL,
            job_name      TEXT    NOT NULL,
            status        TEXT    NOT NULL,   -- success | failure
            triggered_by  TEXT    NOT NULL,   -- schedule | manual | trigger
            started_at    TEXT    NOT NULL,
            finished_at   TEXT    NOT NULL,
            exit_code     INTEGER,
            stdout        TEXT    NOT NULL DEFAULT '',
            stderr        TEXT    NOT NULL DEFAULT ''
        ) STRICT;

        CREATE INDEX IF NOT EXISTS idx_job_runs_job ON job_runs (job_id, id DESC);
        ",
    )?;
    Ok(())
}
