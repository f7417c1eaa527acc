use rusqlite::Connection;

use crate::error::Result;

/// Initialise the scheduler schema in `conn`.
///
/// Creates the `jobs` table (idempotent). Timestamps are Unix milliseconds so
/// the due/stale comparisons in the claim query are plain integer compares.
pub fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS jobs (
            id               TEXT    NOT NULL PRIMARY KEY,
            name             TEXT    NOT NULL,
            job_type         TEXT    NOT NULL DEFAULT 'normal',
            priority         INTEGER NOT NULL DEFAULT 0,
            data             TEXT    NOT NULL DEFAULT '{}',  -- opaque JSON payload
            repeat_interval  TEXT,                           -- NULL for one-shot jobs
            repeat_timezone  TEXT,
            start_date       INTEGER,
            end_date         INTEGER,
            next_run_at      INTEGER,                        -- NULL means never due
            last_run_at      INTEGER,
            last_finished_at INTEGER,
            locked_at        INTEGER,                        -- NULL means unclaimed
            locked_by        TEXT,
            failed_at        INTEGER,
            fail_reason      TEXT,
            fail_count       INTEGER NOT NULL DEFAULT 0,
            disabled         INTEGER NOT NULL DEFAULT 0,
            created_at       INTEGER NOT NULL,
            updated_at       INTEGER NOT NULL
        ) STRICT;

        -- A single-type job is unique by name; `every` upserts against this.
        CREATE UNIQUE INDEX IF NOT EXISTS idx_jobs_single_name
            ON jobs (name) WHERE job_type = 'single';

        -- Claim query: WHERE next_run_at <= ? ORDER BY next_run_at, priority DESC
        CREATE INDEX IF NOT EXISTS idx_jobs_next_run ON jobs (next_run_at, priority DESC);

        CREATE INDEX IF NOT EXISTS idx_jobs_locked_by ON jobs (locked_by);
        ",
    )?;
    Ok(())
}
