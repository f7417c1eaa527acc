use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::types::{Type, Value};
use rusqlite::{params, Connection, OptionalExtension, Row, Transaction, TransactionBehavior};
use tracing::{debug, info, instrument};

use crate::db::init_db;
use crate::error::{Result, SchedulerError};
use crate::types::{JobRecord, JobType};

/// How long a connection waits on another process's write lock before failing.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const JOB_COLUMNS: &str = "id, name, job_type, priority, data, repeat_interval, repeat_timezone,
     start_date, end_date, next_run_at, last_run_at, last_finished_at, locked_at, locked_by,
     failed_at, fail_reason, fail_count, disabled, created_at, updated_at";

/// Parameters of one atomic claim.
#[derive(Debug, Clone)]
pub struct ClaimRequest {
    /// Jobs with `next_run_at <= now` are due.
    pub now: DateTime<Utc>,
    /// Claim at most this many jobs.
    pub limit: usize,
    /// A lock taken at or before this instant is stale and may be taken over.
    pub stale_before: DateTime<Utc>,
    /// Identity written to `locked_by`.
    pub owner: String,
    /// Only claim jobs with one of these names. `None` claims any name.
    pub names: Option<Vec<String>>,
}

/// The exact lock one claim took: the worker that holds it and when it was taken.
///
/// A worker can reclaim its own stale lock, so the owner alone does not tell
/// two claims apart. Writes that end a run match on both fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    pub owner: String,
    pub locked_at: DateTime<Utc>,
}

impl Lease {
    /// The lease recorded on a claimed job, if it is locked.
    pub fn of(job: &JobRecord) -> Option<Self> {
        Some(Self {
            owner: job.locked_by.clone()?,
            locked_at: job.locked_at?,
        })
    }
}

/// Persistence used by the scheduler.
///
/// `claim_due` must be atomic: a job returned to one caller is never returned
/// to a concurrent caller until its lock is released or goes stale.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert `job`. A `single` job upserts the record with the same name.
    async fn create_or_replace(&self, job: JobRecord) -> Result<JobRecord>;

    /// Lock and return up to `request.limit` due jobs, oldest `next_run_at` first.
    async fn claim_due(&self, request: ClaimRequest) -> Result<Vec<JobRecord>>;

    /// Overwrite every mutable field of the record with the same ID.
    async fn update(&self, job: &JobRecord) -> Result<()>;

    /// Write run bookkeeping and clear the lock, only if `lease` is still the
    /// job's current lock.
    ///
    /// Returns `false` when the lock was lost (e.g. reclaimed as stale).
    async fn finish(&self, job: &JobRecord, lease: &Lease) -> Result<bool>;

    async fn delete(&self, job: &JobRecord) -> Result<()>;

    /// Delete the job only if `lease` is still its current lock.
    ///
    /// Returns `false` when the lock was lost and nothing was deleted.
    async fn delete_owned(&self, job: &JobRecord, lease: &Lease) -> Result<bool>;

    /// Delete every job with this name. Returns the number removed.
    async fn delete_by_name(&self, name: &str) -> Result<usize>;

    /// Clear every lock held by `owner`. Returns the number released.
    async fn release_owned(&self, owner: &str) -> Result<usize>;

    async fn get(&self, id: &str) -> Result<Option<JobRecord>>;

    async fn find_by_name(&self, name: &str) -> Result<Vec<JobRecord>>;

    /// All jobs ordered by creation time.
    async fn list(&self) -> Result<Vec<JobRecord>>;
}

/// [`JobStore`] backed by a SQLite database.
///
/// Several processes may open the same database file; claims run inside an
/// `IMMEDIATE` transaction so only one writer evaluates the due set at a time.
#[derive(Clone)]
pub struct SqliteJobStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteJobStore {
    /// Wrap an open connection, initialising the schema if needed.
    pub fn new(conn: Connection) -> Result<Self> {
        conn.busy_timeout(BUSY_TIMEOUT)?;
        init_db(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Open (or create) a database file in WAL mode.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        Self::new(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::new(Connection::open_in_memory()?)
    }

    /// Run `f` against the connection on the blocking pool.
    ///
    /// Once issued the closure runs to completion even if the caller's future
    /// is dropped.
    async fn call<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut guard = conn
                .lock()
                .map_err(|_| SchedulerError::Internal("job store connection poisoned".to_string()))?;
            f(&mut guard)
        })
        .await
        .map_err(|e| SchedulerError::Internal(format!("job store task failed: {e}")))?
    }
}

#[async_trait]
impl JobStore for SqliteJobStore {
    #[instrument(skip(self, job), fields(name = %job.name, job_type = %job.job_type))]
    async fn create_or_replace(&self, job: JobRecord) -> Result<JobRecord> {
        self.call(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let saved = match job.job_type {
                JobType::Single => upsert_single(&tx, &job)?,
                JobType::Normal => upsert_by_id(&tx, &job)?,
            };
            tx.commit()?;
            debug!(job_id = %saved.id, "job saved");
            Ok(saved)
        })
        .await
    }

    #[instrument(skip(self, request), fields(limit = request.limit, owner = %request.owner))]
    async fn claim_due(&self, request: ClaimRequest) -> Result<Vec<JobRecord>> {
        self.call(move |conn| claim(conn, &request)).await
    }

    #[instrument(skip(self, job), fields(job_id = %job.id))]
    async fn update(&self, job: &JobRecord) -> Result<()> {
        let job = job.clone();
        self.call(move |conn| {
            let n = conn.execute(
                "UPDATE jobs SET
                    name = ?2, job_type = ?3, priority = ?4, data = ?5,
                    repeat_interval = ?6, repeat_timezone = ?7, start_date = ?8, end_date = ?9,
                    next_run_at = ?10, last_run_at = ?11, last_finished_at = ?12,
                    locked_at = ?13, locked_by = ?14, failed_at = ?15, fail_reason = ?16,
                    fail_count = ?17, disabled = ?18, updated_at = ?19
                 WHERE id = ?1",
                params![
                    job.id,
                    job.name,
                    job.job_type.to_string(),
                    job.priority,
                    serde_json::to_string(&job.data)?,
                    job.repeat_interval,
                    job.repeat_timezone,
                    opt_ms(job.start_date),
                    opt_ms(job.end_date),
                    opt_ms(job.next_run_at),
                    opt_ms(job.last_run_at),
                    opt_ms(job.last_finished_at),
                    opt_ms(job.locked_at),
                    job.locked_by,
                    opt_ms(job.failed_at),
                    job.fail_reason,
                    job.fail_count,
                    job.disabled,
                    to_ms(job.updated_at),
                ],
            )?;
            if n == 0 {
                return Err(SchedulerError::JobNotFound { id: job.id });
            }
            Ok(())
        })
        .await
    }

    #[instrument(skip(self, job), fields(job_id = %job.id))]
    async fn finish(&self, job: &JobRecord, lease: &Lease) -> Result<bool> {
        let job = job.clone();
        let lease = lease.clone();
        self.call(move |conn| {
            let n = conn.execute(
                "UPDATE jobs SET
                    next_run_at = ?4, last_run_at = ?5, last_finished_at = ?6,
                    failed_at = ?7, fail_reason = ?8, fail_count = ?9,
                    locked_at = NULL, locked_by = NULL, updated_at = ?10
                 WHERE id = ?1 AND locked_by = ?2 AND locked_at = ?3",
                params![
                    job.id,
                    lease.owner,
                    to_ms(lease.locked_at),
                    opt_ms(job.next_run_at),
                    opt_ms(job.last_run_at),
                    opt_ms(job.last_finished_at),
                    opt_ms(job.failed_at),
                    job.fail_reason,
                    job.fail_count,
                    to_ms(job.updated_at),
                ],
            )?;
            Ok(n == 1)
        })
        .await
    }

    #[instrument(skip(self, job), fields(job_id = %job.id))]
    async fn delete(&self, job: &JobRecord) -> Result<()> {
        let id = job.id.clone();
        self.call(move |conn| {
            let n = conn.execute("DELETE FROM jobs WHERE id = ?1", [&id])?;
            if n == 0 {
                return Err(SchedulerError::JobNotFound { id });
            }
            Ok(())
        })
        .await
    }

    #[instrument(skip(self, job, lease), fields(job_id = %job.id, owner = %lease.owner))]
    async fn delete_owned(&self, job: &JobRecord, lease: &Lease) -> Result<bool> {
        let id = job.id.clone();
        let lease = lease.clone();
        self.call(move |conn| {
            let n = conn.execute(
                "DELETE FROM jobs WHERE id = ?1 AND locked_by = ?2 AND locked_at = ?3",
                params![id, lease.owner, to_ms(lease.locked_at)],
            )?;
            Ok(n == 1)
        })
        .await
    }

    #[instrument(skip(self))]
    async fn delete_by_name(&self, name: &str) -> Result<usize> {
        let name = name.to_string();
        self.call(move |conn| Ok(conn.execute("DELETE FROM jobs WHERE name = ?1", [&name])?))
            .await
    }

    #[instrument(skip(self))]
    async fn release_owned(&self, owner: &str) -> Result<usize> {
        let owner = owner.to_string();
        self.call(move |conn| {
            Ok(conn.execute(
                "UPDATE jobs SET locked_at = NULL, locked_by = NULL WHERE locked_by = ?1",
                [&owner],
            )?)
        })
        .await
    }

    async fn get(&self, id: &str) -> Result<Option<JobRecord>> {
        let id = id.to_string();
        self.call(move |conn| {
            Ok(conn
                .query_row(
                    &format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?1"),
                    [&id],
                    row_to_job,
                )
                .optional()?)
        })
        .await
    }

    async fn find_by_name(&self, name: &str) -> Result<Vec<JobRecord>> {
        let name = name.to_string();
        self.call(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {JOB_COLUMNS} FROM jobs WHERE name = ?1 ORDER BY created_at, id"
            ))?;
            let jobs = stmt
                .query_map([&name], row_to_job)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(jobs)
        })
        .await
    }

    async fn list(&self) -> Result<Vec<JobRecord>> {
        self.call(|conn| {
            let mut stmt =
                conn.prepare(&format!("SELECT {JOB_COLUMNS} FROM jobs ORDER BY created_at, id"))?;
            let jobs = stmt
                .query_map([], row_to_job)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(jobs)
        })
        .await
    }
}

// --- blocking helpers -------------------------------------------------------

/// Select the due set and lock it inside one IMMEDIATE transaction.
///
/// Each row is locked with a conditional UPDATE that re-checks the lock, so
/// a row another connection claimed in between is skipped, never stolen.
fn claim(conn: &mut Connection, request: &ClaimRequest) -> Result<Vec<JobRecord>> {
    if request.limit == 0 {
        return Ok(Vec::new());
    }
    if matches!(&request.names, Some(names) if names.is_empty()) {
        return Ok(Vec::new());
    }

    let now = to_ms(request.now);
    let stale_before = to_ms(request.stale_before);

    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

    let mut sql = String::from(
        "SELECT id, locked_at FROM jobs
         WHERE disabled = 0
           AND next_run_at IS NOT NULL AND next_run_at <= ?1
           AND (locked_at IS NULL OR locked_at <= ?2)",
    );
    let mut args: Vec<Value> = vec![Value::Integer(now), Value::Integer(stale_before)];
    if let Some(names) = &request.names {
        let placeholders: Vec<String> = (0..names.len())
            .map(|i| format!("?{}", args.len() + i + 1))
            .collect();
        sql.push_str(&format!(" AND name IN ({})", placeholders.join(", ")));
        args.extend(names.iter().map(|n| Value::Text(n.clone())));
    }
    sql.push_str(&format!(
        " ORDER BY next_run_at ASC, priority DESC LIMIT ?{}",
        args.len() + 1
    ));
    args.push(Value::Integer(request.limit as i64));

    // Collect eagerly so `stmt` is dropped before the UPDATEs below.
    let candidates: Vec<(String, Option<i64>)> = {
        let mut stmt = tx.prepare(&sql)?;
        let rows = stmt
            .query_map(rusqlite::params_from_iter(args.iter()), |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, Option<i64>>(1)?))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        rows
    };

    let mut claimed = Vec::with_capacity(candidates.len());
    for (id, previous_lock) in candidates {
        let n = tx.execute(
            "UPDATE jobs SET locked_at = ?1, locked_by = ?2, updated_at = ?1
             WHERE id = ?3 AND (locked_at IS NULL OR locked_at <= ?4)",
            params![now, request.owner, id, stale_before],
        )?;
        if n == 0 {
            continue;
        }
        if let Some(stale_at) = previous_lock {
            info!(job_id = %id, locked_at = %from_ms(stale_at), "reclaimed stale lock");
        }
        claimed.push(load(&tx, &id)?);
    }

    tx.commit()?;
    Ok(claimed)
}

fn load(tx: &Transaction<'_>, id: &str) -> Result<JobRecord> {
    Ok(tx.query_row(
        &format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?1"),
        [id],
        row_to_job,
    )?)
}

fn insert(tx: &Transaction<'_>, job: &JobRecord) -> Result<()> {
    tx.execute(
        &format!(
            "INSERT INTO jobs ({JOB_COLUMNS})
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,?16,?17,?18,?19,?20)"
        ),
        params![
            job.id,
            job.name,
            job.job_type.to_string(),
            job.priority,
            serde_json::to_string(&job.data)?,
            job.repeat_interval,
            job.repeat_timezone,
            opt_ms(job.start_date),
            opt_ms(job.end_date),
            opt_ms(job.next_run_at),
            opt_ms(job.last_run_at),
            opt_ms(job.last_finished_at),
            opt_ms(job.locked_at),
            job.locked_by,
            opt_ms(job.failed_at),
            job.fail_reason,
            job.fail_count,
            job.disabled,
            to_ms(job.created_at),
            to_ms(job.updated_at),
        ],
    )?;
    Ok(())
}

/// Upsert keyed on `(name, type = single)`.
///
/// The existing row keeps its ID, lock and run bookkeeping. Its
/// `next_run_at` is also kept when the incoming one is already due, so
/// re-registering on process restart does not fire the job again at once.
fn upsert_single(tx: &Transaction<'_>, job: &JobRecord) -> Result<JobRecord> {
    let existing = tx
        .query_row(
            &format!("SELECT {JOB_COLUMNS} FROM jobs WHERE name = ?1 AND job_type = 'single'"),
            [&job.name],
            row_to_job,
        )
        .optional()?;

    let Some(current) = existing else {
        insert(tx, job)?;
        return load(tx, &job.id);
    };

    let next_run_at = match (job.next_run_at, current.next_run_at) {
        (Some(incoming), Some(kept)) if incoming <= job.updated_at => Some(kept),
        (incoming, _) => incoming,
    };

    tx.execute(
        "UPDATE jobs SET
            priority = ?2, data = ?3, repeat_interval = ?4, repeat_timezone = ?5,
            start_date = ?6, end_date = ?7, disabled = ?8, next_run_at = ?9, updated_at = ?10
         WHERE id = ?1",
        params![
            current.id,
            job.priority,
            serde_json::to_string(&job.data)?,
            job.repeat_interval,
            job.repeat_timezone,
            opt_ms(job.start_date),
            opt_ms(job.end_date),
            job.disabled,
            opt_ms(next_run_at),
            to_ms(job.updated_at),
        ],
    )?;
    debug!(job_id = %current.id, "single job rescheduled in place");
    load(tx, &current.id)
}

fn upsert_by_id(tx: &Transaction<'_>, job: &JobRecord) -> Result<JobRecord> {
    let exists = tx
        .query_row("SELECT 1 FROM jobs WHERE id = ?1", [&job.id], |_| Ok(()))
        .optional()?
        .is_some();
    if exists {
        tx.execute(
            "UPDATE jobs SET
                name = ?2, job_type = ?3, priority = ?4, data = ?5,
                repeat_interval = ?6, repeat_timezone = ?7, start_date = ?8, end_date = ?9,
                next_run_at = ?10, disabled = ?11, updated_at = ?12
             WHERE id = ?1",
            params![
                job.id,
                job.name,
                job.job_type.to_string(),
                job.priority,
                serde_json::to_string(&job.data)?,
                job.repeat_interval,
                job.repeat_timezone,
                opt_ms(job.start_date),
                opt_ms(job.end_date),
                opt_ms(job.next_run_at),
                job.disabled,
                to_ms(job.updated_at),
            ],
        )?;
    } else {
        insert(tx, job)?;
    }
    load(tx, &job.id)
}

/// Map a SQLite row (selected with [`JOB_COLUMNS`]) to a `JobRecord`.
fn row_to_job(row: &Row<'_>) -> rusqlite::Result<JobRecord> {
    let job_type: String = row.get(2)?;
    let data: String = row.get(4)?;
    Ok(JobRecord {
        id: row.get(0)?,
        name: row.get(1)?,
        job_type: job_type
            .parse()
            .map_err(|e: String| conversion_error(2, e.into()))?,
        priority: row.get(3)?,
        data: serde_json::from_str(&data).map_err(|e| conversion_error(4, Box::new(e)))?,
        repeat_interval: row.get(5)?,
        repeat_timezone: row.get(6)?,
        start_date: row.get::<_, Option<i64>>(7)?.map(from_ms),
        end_date: row.get::<_, Option<i64>>(8)?.map(from_ms),
        next_run_at: row.get::<_, Option<i64>>(9)?.map(from_ms),
        last_run_at: row.get::<_, Option<i64>>(10)?.map(from_ms),
        last_finished_at: row.get::<_, Option<i64>>(11)?.map(from_ms),
        locked_at: row.get::<_, Option<i64>>(12)?.map(from_ms),
        locked_by: row.get(13)?,
        failed_at: row.get::<_, Option<i64>>(14)?.map(from_ms),
        fail_reason: row.get(15)?,
        fail_count: row.get(16)?,
        disabled: row.get(17)?,
        created_at: from_ms(row.get(18)?),
        updated_at: from_ms(row.get(19)?),
    })
}

fn conversion_error(
    column: usize,
    err: Box<dyn std::error::Error + Send + Sync + 'static>,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(column, Type::Text, err)
}

fn to_ms(dt: DateTime<Utc>) -> i64 {
    dt.timestamp_millis()
}

fn opt_ms(dt: Option<DateTime<Utc>>) -> Option<i64> {
    dt.map(to_ms)
}

fn from_ms(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration as ChronoDuration, TimeZone};
    use serde_json::json;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 5, 4, 8, 0, 0).unwrap()
    }

    fn due_job(name: &str, next: DateTime<Utc>) -> JobRecord {
        let mut job = JobRecord::new(name, json!({ "n": name }), t0()).unwrap();
        job.next_run_at = Some(next);
        job
    }

    fn request(now: DateTime<Utc>, limit: usize, owner: &str) -> ClaimRequest {
        ClaimRequest {
            now,
            limit,
            stale_before: now - ChronoDuration::minutes(10),
            owner: owner.to_string(),
            names: None,
        }
    }

    #[tokio::test]
    async fn normal_jobs_round_trip_payload_and_timestamps() {
        let store = SqliteJobStore::open_in_memory().unwrap();
        let job = due_job("mail", t0());
        let saved = store.create_or_replace(job.clone()).await.unwrap();
        assert_eq!(saved, job);
        assert_eq!(store.get(&job.id).await.unwrap(), Some(job));
    }

    #[tokio::test]
    async fn single_upsert_keeps_id_and_due_next_run() {
        let store = SqliteJobStore::open_in_memory().unwrap();
        let mut first = due_job("report", t0() + ChronoDuration::minutes(5));
        first.job_type = JobType::Single;
        let first = store.create_or_replace(first).await.unwrap();

        // Incoming next run is "now" (already due): the stored one wins.
        let mut again = due_job("report", t0());
        again.job_type = JobType::Single;
        again.data = json!({ "v": 2 });
        let saved = store.create_or_replace(again).await.unwrap();

        assert_eq!(saved.id, first.id);
        assert_eq!(saved.next_run_at, first.next_run_at);
        assert_eq!(saved.data, json!({ "v": 2 }));
        assert_eq!(store.find_by_name("report").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn single_upsert_takes_future_next_run() {
        let store = SqliteJobStore::open_in_memory().unwrap();
        let mut first = due_job("report", t0());
        first.job_type = JobType::Single;
        store.create_or_replace(first).await.unwrap();

        let mut later = due_job("report", t0() + ChronoDuration::hours(1));
        later.job_type = JobType::Single;
        let saved = store.create_or_replace(later).await.unwrap();
        assert_eq!(saved.next_run_at, Some(t0() + ChronoDuration::hours(1)));
    }

    #[tokio::test]
    async fn claim_orders_by_next_run_then_priority_and_respects_limit() {
        let store = SqliteJobStore::open_in_memory().unwrap();
        let mut low = due_job("low", t0());
        low.priority = -5;
        let mut high = due_job("high", t0());
        high.priority = 10;
        let early = due_job("early", t0() - ChronoDuration::minutes(1));
        let future = due_job("future", t0() + ChronoDuration::minutes(1));
        for job in [low, high, early, future] {
            store.create_or_replace(job).await.unwrap();
        }

        let claimed = store.claim_due(request(t0(), 2, "w1")).await.unwrap();
        let names: Vec<_> = claimed.iter().map(|j| j.name.as_str()).collect();
        assert_eq!(names, vec!["early", "high"]);
        assert!(claimed.iter().all(|j| j.locked_by.as_deref() == Some("w1")));
        assert!(claimed.iter().all(|j| j.locked_at == Some(t0())));

        let rest = store.claim_due(request(t0(), 10, "w2")).await.unwrap();
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].name, "low");
    }

    #[tokio::test]
    async fn claim_filters_by_name_and_skips_disabled() {
        let store = SqliteJobStore::open_in_memory().unwrap();
        let mut off = due_job("a", t0());
        off.disabled = true;
        store.create_or_replace(off).await.unwrap();
        store.create_or_replace(due_job("b", t0())).await.unwrap();
        store.create_or_replace(due_job("c", t0())).await.unwrap();

        let mut req = request(t0(), 10, "w1");
        req.names = Some(vec!["a".to_string(), "b".to_string()]);
        let claimed = store.claim_due(req).await.unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].name, "b");

        let mut none = request(t0(), 10, "w1");
        none.names = Some(vec![]);
        assert!(store.claim_due(none).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn finish_requires_lock_ownership() {
        let store = SqliteJobStore::open_in_memory().unwrap();
        store.create_or_replace(due_job("a", t0())).await.unwrap();
        let mut job = store
            .claim_due(request(t0(), 1, "w1"))
            .await
            .unwrap()
            .remove(0);

        job.next_run_at = None;
        let lease = Lease::of(&job).unwrap();
        let stranger = Lease {
            owner: "w2".to_string(),
            ..lease.clone()
        };
        assert!(!store.finish(&job, &stranger).await.unwrap());
        assert!(store.finish(&job, &lease).await.unwrap());
        assert!(!store.finish(&job, &lease).await.unwrap());

        let stored = store.get(&job.id).await.unwrap().unwrap();
        assert!(stored.locked_at.is_none());
        assert!(stored.locked_by.is_none());
        assert!(stored.next_run_at.is_none());
    }

    #[tokio::test]
    async fn reclaimed_lock_of_the_same_owner_is_a_new_lease() {
        let store = SqliteJobStore::open_in_memory().unwrap();
        store.create_or_replace(due_job("r", t0())).await.unwrap();
        let first = store.claim_due(request(t0(), 1, "w1")).await.unwrap().remove(0);

        let later = t0() + ChronoDuration::minutes(11);
        let second = store.claim_due(request(later, 1, "w1")).await.unwrap().remove(0);
        let (old, live) = (Lease::of(&first).unwrap(), Lease::of(&second).unwrap());
        assert_eq!(old.owner, live.owner);
        assert_ne!(old, live);

        assert!(!store.finish(&first, &old).await.unwrap());
        assert!(!store.delete_owned(&first, &old).await.unwrap());
        let stored = store.get(&first.id).await.unwrap().unwrap();
        assert_eq!(stored.locked_at, Some(later));

        assert!(store.delete_owned(&second, &live).await.unwrap());
        assert!(store.get(&first.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn update_overwrites_the_stored_record() {
        let store = SqliteJobStore::open_in_memory().unwrap();
        let mut job = store
            .create_or_replace(due_job("sync", t0()))
            .await
            .unwrap();

        job.data = json!({ "cursor": 42 });
        job.next_run_at = Some(t0() + ChronoDuration::hours(2));
        job.locked_by = Some("w9".to_string());
        job.locked_at = Some(t0() + ChronoDuration::minutes(1));
        job.fail_count = 3;
        job.fail_reason = Some("timeout".to_string());
        job.updated_at = t0() + ChronoDuration::minutes(1);
        store.update(&job).await.unwrap();

        assert_eq!(store.get(&job.id).await.unwrap(), Some(job.clone()));

        job.locked_by = None;
        job.locked_at = None;
        store.update(&job).await.unwrap();
        assert!(!store.get(&job.id).await.unwrap().unwrap().is_locked());
    }

    #[tokio::test]
    async fn release_owned_clears_only_that_owner() {
        let store = SqliteJobStore::open_in_memory().unwrap();
        store.create_or_replace(due_job("a", t0())).await.unwrap();
        store.create_or_replace(due_job("b", t0())).await.unwrap();
        store.claim_due(request(t0(), 1, "w1")).await.unwrap();
        store.claim_due(request(t0(), 1, "w2")).await.unwrap();

        assert_eq!(store.release_owned("w1").await.unwrap(), 1);
        let locked: Vec<_> = store
            .list()
            .await
            .unwrap()
            .into_iter()
            .filter(|j| j.is_locked())
            .collect();
        assert_eq!(locked.len(), 1);
        assert_eq!(locked[0].locked_by.as_deref(), Some("w2"));
    }

    #[tokio::test]
    async fn update_and_delete_report_missing_rows() {
        let store = SqliteJobStore::open_in_memory().unwrap();
        let ghost = due_job("ghost", t0());
        assert!(matches!(
            store.update(&ghost).await,
            Err(SchedulerError::JobNotFound { .. })
        ));
        assert!(matches!(
            store.delete(&ghost).await,
            Err(SchedulerError::JobNotFound { .. })
        ));
    }
}
