// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// SQLite implementation of the job and idempotency stores.
//
// Jobs, their attempt history and idempotency records live in one database
// file.  WAL mode lets readers (the HTTP API) proceed while a dispatcher
// writes, and every mutation is either a single conditional UPDATE or an
// IMMEDIATE transaction, so several processes can open the same file and
// still observe at most one claimant per job.
//
// Timestamps are stored as Unix milliseconds so eligibility and lease checks
// are plain integer comparisons inside the query.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{Connection, OptionalExtension, TransactionBehavior, params};
use tracing::{debug, info, instrument, warn};

use tillprint_core::error::{Result, TillprintError};
use tillprint_core::types::{
    AttemptOutcome, AttemptRecord, FailureKind, JobError, JobId, JobStatus, PrintJob,
    PrinterTarget,
};

use super::{Expected, IdempotencyStore, JobChange, JobStore, after};

const SCHEMA_SQL: &str = r#"
    CREATE TABLE IF NOT EXISTS jobs (
        seq INTEGER PRIMARY KEY AUTOINCREMENT,
        id TEXT NOT NULL UNIQUE,
        payload TEXT NOT NULL,
        target_host TEXT NOT NULL,
        target_port INTEGER NOT NULL,
        target_protocol TEXT NOT NULL,
        status TEXT NOT NULL,
        attempts INTEGER NOT NULL DEFAULT 0,
        next_eligible_at INTEGER NOT NULL,
        created_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL,
        last_attempt_at INTEGER,
        lease_token TEXT,
        lease_expires_at INTEGER,
        last_error TEXT
    );
    CREATE INDEX IF NOT EXISTS jobs_claim ON jobs (status, next_eligible_at, seq);
    CREATE INDEX IF NOT EXISTS jobs_lease ON jobs (lease_expires_at)
        WHERE lease_token IS NOT NULL;

    CREATE TABLE IF NOT EXISTS attempts (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        job_id TEXT NOT NULL,
        attempt INTEGER NOT NULL,
        outcome TEXT NOT NULL,
        duration_ms INTEGER NOT NULL,
        recorded_at INTEGER NOT NULL
    );
    CREATE INDEX IF NOT EXISTS attempts_job ON attempts (job_id, id);

    CREATE TABLE IF NOT EXISTS idempotency (
        key TEXT PRIMARY KEY,
        expires_at INTEGER NOT NULL,
        printed INTEGER NOT NULL DEFAULT 0
    );
"#;

/// Column list shared by every query that materialises a `PrintJob`.
///
/// Order must match `row_to_job`.
const JOB_COLUMNS: &str = "id, payload, target_host, target_port, target_protocol, status, \
     attempts, next_eligible_at, created_at, updated_at, last_attempt_at, lease_token, \
     lease_expires_at, last_error";

/// Writers wait this long for a competing process to release the database.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Job and idempotency store backed by one SQLite database.
///
/// `rusqlite` is synchronous; callers on the async runtime go through
/// `tokio::task::spawn_blocking` (see `JobQueue`).
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl std::fmt::Debug for SqliteStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteStore").finish_non_exhaustive()
    }
}

impl SqliteStore {
    /// Open (or create) the store at `path` in WAL mode.
    #[instrument(skip_all, fields(path = %path.as_ref().display()))]
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path.as_ref()).map_err(db("open"))?;

        conn.pragma_update(None, "journal_mode", "WAL")
            .map_err(db("WAL pragma"))?;
        conn.busy_timeout(BUSY_TIMEOUT).map_err(db("busy timeout"))?;
        conn.execute_batch(SCHEMA_SQL).map_err(db("create schema"))?;

        info!("job store opened");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open a private in-memory store (tests and tooling).
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(db("open in-memory"))?;
        conn.execute_batch(SCHEMA_SQL).map_err(db("create schema"))?;

        debug!("in-memory job store opened");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| TillprintError::Store("connection lock poisoned".into()))
    }
}

impl JobStore for SqliteStore {
    #[instrument(skip(self, job), fields(job_id = %job.id))]
    fn insert(&self, job: &PrintJob) -> Result<()> {
        let payload = serde_json::to_string(&job.payload)?;
        let last_error = job.last_error.as_ref().map(serde_json::to_string).transpose()?;

        self.lock()?
            .execute(
                "INSERT INTO jobs (id, payload, target_host, target_port, target_protocol,
                 status, attempts, next_eligible_at, created_at, updated_at, last_attempt_at,
                 lease_token, lease_expires_at, last_error)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
                params![
                    job.id.to_string(),
                    payload,
                    job.target.host,
                    job.target.port,
                    job.target.protocol.as_str(),
                    job.status.as_str(),
                    job.attempts,
                    millis(job.next_eligible_at),
                    millis(job.created_at),
                    millis(job.updated_at),
                    job.last_attempt_at.map(millis),
                    job.lease_token,
                    job.lease_expires_at.map(millis),
                    last_error,
                ],
            )
            .map_err(db("insert job"))?;

        debug!(printer = %job.target, "job stored");
        Ok(())
    }

    fn get(&self, id: &JobId) -> Result<Option<PrintJob>> {
        self.lock()?
            .query_row(
                &format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?1"),
                params![id.to_string()],
                row_to_job,
            )
            .optional()
            .map_err(db("get job"))
    }

    #[instrument(skip(self, lease_token))]
    fn claim_next(
        &self,
        now: DateTime<Utc>,
        lease: Duration,
        lease_token: &str,
    ) -> Result<Option<PrintJob>> {
        let mut conn = self.lock()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(db("begin claim"))?;

        let seq: Option<i64> = tx
            .query_row(
                "SELECT seq FROM jobs
                 WHERE status = ?1 AND next_eligible_at <= ?2
                 ORDER BY seq ASC LIMIT 1",
                params![JobStatus::Pending.as_str(), millis(now)],
                |row| row.get(0),
            )
            .optional()
            .map_err(db("select claimable"))?;

        let Some(seq) = seq else {
            return Ok(None);
        };

        let job = tx
            .query_row(
                &format!(
                    "UPDATE jobs SET status = ?1, attempts = attempts + 1,
                     lease_token = ?2, lease_expires_at = ?3,
                     last_attempt_at = ?4, updated_at = ?4
                     WHERE seq = ?5
                     RETURNING {JOB_COLUMNS}"
                ),
                params![
                    JobStatus::InFlight.as_str(),
                    lease_token,
                    millis(after(now, lease)),
                    millis(now),
                    seq,
                ],
                row_to_job,
            )
            .map_err(db("claim job"))?;

        tx.commit().map_err(db("commit claim"))?;

        debug!(job_id = %job.id, attempt = job.attempts, "job claimed");
        Ok(Some(job))
    }

    #[instrument(skip(self, expected, change), fields(job_id = %id, to = %change.status))]
    fn compare_and_set(
        &self,
        id: &JobId,
        expected: &Expected<'_>,
        change: &JobChange,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        if !expected.status.can_transition_to(change.status) {
            return Err(TillprintError::InvalidTransition {
                job_id: *id,
                from: expected.status,
                to: change.status,
            });
        }

        let (set_error, error_json) = match &change.last_error {
            None => (false, None),
            Some(None) => (true, None),
            Some(Some(error)) => (true, Some(serde_json::to_string(error)?)),
        };

        // A lease-guarded change also requires the lease to be live; an
        // expired lease belongs to the sweeper even before it has run.
        let rows = self
            .lock()?
            .execute(
                "UPDATE jobs SET
                    status = ?1,
                    next_eligible_at = COALESCE(?2, next_eligible_at),
                    last_error = CASE WHEN ?3 THEN ?4 ELSE last_error END,
                    lease_token = CASE WHEN ?5 THEN lease_token ELSE NULL END,
                    lease_expires_at = CASE WHEN ?5 THEN lease_expires_at ELSE NULL END,
                    updated_at = ?6
                 WHERE id = ?7 AND status = ?8
                   AND (?9 IS NULL OR (lease_token = ?9 AND lease_expires_at > ?6))",
                params![
                    change.status.as_str(),
                    change.next_eligible_at.map(millis),
                    set_error,
                    error_json,
                    change.keep_lease,
                    millis(now),
                    id.to_string(),
                    expected.status.as_str(),
                    expected.lease_token,
                ],
            )
            .map_err(db("compare and set"))?;

        if rows == 0 {
            debug!(from = %expected.status, "compare-and-set lost");
        }
        Ok(rows == 1)
    }

    #[instrument(skip(self))]
    fn release_expired_leases(&self, now: DateTime<Utc>) -> Result<Vec<JobId>> {
        let error = serde_json::to_string(&JobError::new(
            FailureKind::LeaseExpired,
            "lease expired before the attempt completed",
        ))?;

        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(
                "UPDATE jobs SET status = ?1, lease_token = NULL, lease_expires_at = NULL,
                    next_eligible_at = ?2, last_error = ?3, updated_at = ?2
                 WHERE status IN (?4, ?5)
                   AND lease_expires_at IS NOT NULL AND lease_expires_at <= ?2
                 RETURNING id",
            )
            .map_err(db("prepare lease release"))?;

        let ids = stmt
            .query_map(
                params![
                    JobStatus::Pending.as_str(),
                    millis(now),
                    error,
                    JobStatus::InFlight.as_str(),
                    JobStatus::Failed.as_str(),
                ],
                |row| row.get::<_, String>(0),
            )
            .map_err(db("release leases"))?
            .map(|id| {
                let id = id.map_err(db("read released id"))?;
                id.parse::<JobId>()
            })
            .collect::<Result<Vec<_>>>()?;

        if !ids.is_empty() {
            warn!(count = ids.len(), "expired leases returned to pending");
        }
        Ok(ids)
    }

    fn count(&self, status: Option<JobStatus>) -> Result<u64> {
        let count: i64 = self
            .lock()?
            .query_row(
                "SELECT COUNT(*) FROM jobs WHERE ?1 IS NULL OR status = ?1",
                params![status.map(|s| s.as_str())],
                |row| row.get(0),
            )
            .map_err(db("count jobs"))?;
        Ok(u64::try_from(count).unwrap_or(0))
    }

    fn status_counts(&self) -> Result<Vec<(JobStatus, u64)>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare("SELECT status, COUNT(*) FROM jobs GROUP BY status")
            .map_err(db("prepare status counts"))?;
        let rows = stmt
            .query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
            })
            .map_err(db("status counts"))?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(db("collect status counts"))?;

        Ok(JobStatus::ALL
            .into_iter()
            .map(|status| {
                let count = rows
                    .iter()
                    .find(|(name, _)| name == status.as_str())
                    .map_or(0, |(_, count)| u64::try_from(*count).unwrap_or(0));
                (status, count)
            })
            .collect())
    }

    fn list(&self, status: Option<JobStatus>, limit: u32) -> Result<Vec<PrintJob>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {JOB_COLUMNS} FROM jobs
                 WHERE ?1 IS NULL OR status = ?1
                 ORDER BY seq DESC LIMIT ?2"
            ))
            .map_err(db("prepare list"))?;

        let jobs = stmt
            .query_map(params![status.map(|s| s.as_str()), limit], row_to_job)
            .map_err(db("list jobs"))?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(db("collect rows"))?;
        Ok(jobs)
    }

    #[instrument(skip(self, record), fields(job_id = %record.job_id, attempt = record.attempt))]
    fn record_attempt(&self, record: &AttemptRecord) -> Result<()> {
        let outcome = serde_json::to_string(&record.outcome)?;
        self.lock()?
            .execute(
                "INSERT INTO attempts (job_id, attempt, outcome, duration_ms, recorded_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    record.job_id.to_string(),
                    record.attempt,
                    outcome,
                    i64::try_from(record.duration_ms).unwrap_or(i64::MAX),
                    millis(record.recorded_at),
                ],
            )
            .map_err(db("record attempt"))?;
        Ok(())
    }

    fn attempts_for(&self, id: &JobId) -> Result<Vec<AttemptRecord>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(
                "SELECT job_id, attempt, outcome, duration_ms, recorded_at
                 FROM attempts WHERE job_id = ?1 ORDER BY id ASC",
            )
            .map_err(db("prepare attempts"))?;

        let records = stmt
            .query_map(params![id.to_string()], row_to_attempt)
            .map_err(db("query attempts"))?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(db("collect attempts"))?;
        Ok(records)
    }

    #[instrument(skip(self))]
    fn purge_finished(&self, before: DateTime<Utc>) -> Result<u64> {
        let mut conn = self.lock()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(db("begin purge"))?;

        let (succeeded, dead, before) = (
            JobStatus::Succeeded.as_str(),
            JobStatus::Dead.as_str(),
            millis(before),
        );
        tx.execute(
            "DELETE FROM attempts WHERE job_id IN (
                SELECT id FROM jobs WHERE status IN (?1, ?2) AND updated_at < ?3
             )",
            params![succeeded, dead, before],
        )
        .map_err(db("purge attempts"))?;
        let removed = tx
            .execute(
                "DELETE FROM jobs WHERE status IN (?1, ?2) AND updated_at < ?3",
                params![succeeded, dead, before],
            )
            .map_err(db("purge jobs"))?;

        tx.commit().map_err(db("commit purge"))?;

        if removed > 0 {
            info!(removed, "finished jobs purged");
        }
        Ok(removed as u64)
    }
}

impl IdempotencyStore for SqliteStore {
    fn insert_if_absent(&self, key: &str, now: DateTime<Utc>, ttl: Duration) -> Result<bool> {
        // An expired record is overwritten in place; a live one is left alone.
        let rows = self
            .lock()?
            .execute(
                "INSERT INTO idempotency (key, expires_at, printed) VALUES (?1, ?2, 0)
                 ON CONFLICT(key) DO UPDATE SET expires_at = excluded.expires_at, printed = 0
                 WHERE idempotency.expires_at <= ?3",
                params![key, millis(after(now, ttl)), millis(now)],
            )
            .map_err(db("mark attempt"))?;
        Ok(rows == 1)
    }

    fn mark_printed(&self, key: &str, now: DateTime<Utc>, ttl: Duration) -> Result<()> {
        self.lock()?
            .execute(
                "INSERT INTO idempotency (key, expires_at, printed) VALUES (?1, ?2, 1)
                 ON CONFLICT(key) DO UPDATE SET expires_at = excluded.expires_at, printed = 1",
                params![key, millis(after(now, ttl))],
            )
            .map_err(db("mark printed"))?;
        Ok(())
    }

    fn is_printed(&self, key: &str, now: DateTime<Utc>) -> Result<bool> {
        let printed = self
            .lock()?
            .query_row(
                "SELECT printed FROM idempotency WHERE key = ?1 AND expires_at > ?2",
                params![key, millis(now)],
                |row| row.get::<_, bool>(0),
            )
            .optional()
            .map_err(db("read idempotency record"))?;
        Ok(printed.unwrap_or(false))
    }

    fn remove_unprinted(&self, key: &str) -> Result<bool> {
        let rows = self
            .lock()?
            .execute(
                "DELETE FROM idempotency WHERE key = ?1 AND printed = 0",
                params![key],
            )
            .map_err(db("release attempt"))?;
        Ok(rows == 1)
    }

    fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64> {
        let removed = self
            .lock()?
            .execute(
                "DELETE FROM idempotency WHERE expires_at <= ?1",
                params![millis(now)],
            )
            .map_err(db("purge idempotency"))?;
        Ok(removed as u64)
    }
}

// ---------------------------------------------------------------------------
// Row mapping
// ---------------------------------------------------------------------------

fn db(context: &'static str) -> impl Fn(rusqlite::Error) -> TillprintError {
    move |e| TillprintError::Store(format!("{context}: {e}"))
}

fn millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

fn conversion(
    idx: usize,
    ty: Type,
    e: impl std::error::Error + Send + Sync + 'static,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, ty, Box::new(e))
}

fn timestamp(idx: usize, ms: i64) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms).ok_or(rusqlite::Error::IntegralValueOutOfRange(idx, ms))
}

/// Map a row selected with `JOB_COLUMNS` to a `PrintJob`.
fn row_to_job(row: &rusqlite::Row<'_>) -> rusqlite::Result<PrintJob> {
    let id: String = row.get(0)?;
    let payload: String = row.get(1)?;
    let host: String = row.get(2)?;
    let port: u16 = row.get(3)?;
    let protocol: String = row.get(4)?;
    let status: String = row.get(5)?;
    let attempts: u32 = row.get(6)?;
    let next_eligible_at: i64 = row.get(7)?;
    let created_at: i64 = row.get(8)?;
    let updated_at: i64 = row.get(9)?;
    let last_attempt_at: Option<i64> = row.get(10)?;
    let lease_token: Option<String> = row.get(11)?;
    let lease_expires_at: Option<i64> = row.get(12)?;
    let last_error: Option<String> = row.get(13)?;

    let id: JobId = id.parse().map_err(|e| conversion(0, Type::Text, e))?;
    let payload = serde_json::from_str(&payload).map_err(|e| conversion(1, Type::Text, e))?;
    let protocol = protocol.parse().map_err(|e| conversion(4, Type::Text, e))?;
    let status = status.parse().map_err(|e| conversion(5, Type::Text, e))?;
    let last_error = last_error
        .map(|json| serde_json::from_str::<JobError>(&json))
        .transpose()
        .map_err(|e| conversion(13, Type::Text, e))?;

    Ok(PrintJob {
        id,
        payload,
        target: PrinterTarget::new(host, port, protocol),
        status,
        attempts,
        next_eligible_at: timestamp(7, next_eligible_at)?,
        created_at: timestamp(8, created_at)?,
        updated_at: timestamp(9, updated_at)?,
        last_attempt_at: last_attempt_at.map(|ms| timestamp(10, ms)).transpose()?,
        lease_token,
        lease_expires_at: lease_expires_at.map(|ms| timestamp(12, ms)).transpose()?,
        last_error,
    })
}

fn row_to_attempt(row: &rusqlite::Row<'_>) -> rusqlite::Result<AttemptRecord> {
    let job_id: String = row.get(0)?;
    let attempt: u32 = row.get(1)?;
    let outcome: String = row.get(2)?;
    let duration_ms: i64 = row.get(3)?;
    let recorded_at: i64 = row.get(4)?;

    let outcome: AttemptOutcome =
        serde_json::from_str(&outcome).map_err(|e| conversion(2, Type::Text, e))?;

    Ok(AttemptRecord {
        job_id: job_id.parse().map_err(|e| conversion(0, Type::Text, e))?,
        attempt,
        outcome,
        duration_ms: u64::try_from(duration_ms).unwrap_or(0),
        recorded_at: timestamp(4, recorded_at)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{sample_job, sample_payload};
    use chrono::TimeDelta;
    use std::sync::Arc;

    const LEASE: Duration = Duration::from_secs(30);

    fn store() -> SqliteStore {
        SqliteStore::open_in_memory().expect("open in-memory store")
    }

    #[test]
    fn insert_and_get_round_trips_the_job() {
        let store = store();
        let job = sample_job();
        store.insert(&job).expect("insert");

        let loaded = store.get(&job.id).expect("get").expect("found");
        assert_eq!(loaded.id, job.id);
        assert_eq!(loaded.payload, sample_payload());
        assert_eq!(loaded.target, job.target);
        assert_eq!(loaded.status, JobStatus::Pending);
        assert_eq!(loaded.created_at.timestamp_millis(), job.created_at.timestamp_millis());
    }

    #[test]
    fn get_unknown_job_returns_none() {
        assert!(store().get(&JobId::new()).expect("get").is_none());
    }

    #[test]
    fn claim_takes_oldest_eligible_job_first() {
        let store = store();
        let first = sample_job();
        let second = sample_job();
        store.insert(&first).expect("insert");
        store.insert(&second).expect("insert");

        let claimed = store
            .claim_next(Utc::now(), LEASE, "lease-a")
            .expect("claim")
            .expect("job available");
        assert_eq!(claimed.id, first.id);
        assert_eq!(claimed.status, JobStatus::InFlight);
        assert_eq!(claimed.attempts, 1);
        assert_eq!(claimed.lease_token.as_deref(), Some("lease-a"));
        assert!(claimed.lease_expires_at.is_some());
    }

    #[test]
    fn claim_skips_jobs_not_yet_eligible() {
        let store = store();
        let mut later = sample_job();
        later.next_eligible_at = Utc::now() + TimeDelta::seconds(60);
        let ready = sample_job();
        store.insert(&later).expect("insert");
        store.insert(&ready).expect("insert");

        let claimed = store.claim_next(Utc::now(), LEASE, "t").expect("claim").expect("job");
        assert_eq!(claimed.id, ready.id);
        assert!(store.claim_next(Utc::now(), LEASE, "t2").expect("claim").is_none());
    }

    #[test]
    fn compare_and_set_requires_matching_lease() {
        let store = store();
        let job = sample_job();
        store.insert(&job).expect("insert");
        store.claim_next(Utc::now(), LEASE, "mine").expect("claim");

        let change = JobChange::to(JobStatus::Succeeded).clear_error();
        let stale = store
            .compare_and_set(&job.id, &Expected::leased(JobStatus::InFlight, "theirs"), &change, Utc::now())
            .expect("cas");
        assert!(!stale);

        let applied = store
            .compare_and_set(&job.id, &Expected::leased(JobStatus::InFlight, "mine"), &change, Utc::now())
            .expect("cas");
        assert!(applied);

        let done = store.get(&job.id).expect("get").expect("found");
        assert_eq!(done.status, JobStatus::Succeeded);
        assert!(done.lease_token.is_none());
    }

    #[test]
    fn compare_and_set_rejects_expired_lease() {
        let store = store();
        let job = sample_job();
        store.insert(&job).expect("insert");
        let claimed_at = Utc::now();
        store.claim_next(claimed_at, LEASE, "mine").expect("claim");

        let late = claimed_at + TimeDelta::seconds(31);
        let applied = store
            .compare_and_set(
                &job.id,
                &Expected::leased(JobStatus::InFlight, "mine"),
                &JobChange::to(JobStatus::Succeeded),
                late,
            )
            .expect("cas");
        assert!(!applied);
    }

    #[test]
    fn illegal_transition_is_an_error() {
        let store = store();
        let job = sample_job();
        store.insert(&job).expect("insert");

        let result = store.compare_and_set(
            &job.id,
            &Expected::status(JobStatus::Pending),
            &JobChange::to(JobStatus::Succeeded),
            Utc::now(),
        );
        assert!(matches!(result, Err(TillprintError::InvalidTransition { .. })));
    }

    #[test]
    fn keep_lease_preserves_the_claim() {
        let store = store();
        let job = sample_job();
        store.insert(&job).expect("insert");
        store.claim_next(Utc::now(), LEASE, "mine").expect("claim");

        let failed = JobChange::to(JobStatus::Failed)
            .error(JobError::new(FailureKind::TransientDispatch, "timed out"))
            .keep_lease();
        assert!(
            store
                .compare_and_set(&job.id, &Expected::leased(JobStatus::InFlight, "mine"), &failed, Utc::now())
                .expect("cas")
        );

        let held = store.get(&job.id).expect("get").expect("found");
        assert_eq!(held.status, JobStatus::Failed);
        assert_eq!(held.lease_token.as_deref(), Some("mine"));
        assert_eq!(held.last_error.map(|e| e.kind), Some(FailureKind::TransientDispatch));
    }

    #[test]
    fn expired_leases_are_released_to_pending() {
        let store = store();
        let job = sample_job();
        store.insert(&job).expect("insert");
        let claimed_at = Utc::now();
        store.claim_next(claimed_at, LEASE, "crashed").expect("claim");

        assert!(store.release_expired_leases(claimed_at).expect("sweep").is_empty());

        let released = store
            .release_expired_leases(claimed_at + TimeDelta::seconds(31))
            .expect("sweep");
        assert_eq!(released, vec![job.id]);

        let recovered = store.get(&job.id).expect("get").expect("found");
        assert_eq!(recovered.status, JobStatus::Pending);
        assert_eq!(recovered.attempts, 1);
        assert!(recovered.lease_token.is_none());
        assert_eq!(recovered.last_error.map(|e| e.kind), Some(FailureKind::LeaseExpired));
    }

    #[test]
    fn list_and_counts_filter_by_status() {
        let store = store();
        for _ in 0..3 {
            store.insert(&sample_job()).expect("insert");
        }
        store.claim_next(Utc::now(), LEASE, "t").expect("claim");

        assert_eq!(store.count(None).expect("count"), 3);
        assert_eq!(store.count(Some(JobStatus::Pending)).expect("count"), 2);
        assert_eq!(store.list(Some(JobStatus::InFlight), 10).expect("list").len(), 1);
        assert_eq!(store.list(None, 2).expect("list").len(), 2);

        let counts = store.status_counts().expect("counts");
        assert_eq!(counts.len(), JobStatus::ALL.len());
        assert!(counts.contains(&(JobStatus::Pending, 2)));
        assert!(counts.contains(&(JobStatus::Dead, 0)));
    }

    #[test]
    fn attempts_are_returned_in_order() {
        let store = store();
        let job = sample_job();
        store.insert(&job).expect("insert");

        for (attempt, outcome) in [
            (1, AttemptOutcome::Failed { kind: FailureKind::TransientDispatch, reason: "timed out".into() }),
            (2, AttemptOutcome::Succeeded),
        ] {
            store
                .record_attempt(&AttemptRecord {
                    job_id: job.id,
                    attempt,
                    outcome,
                    duration_ms: 12,
                    recorded_at: Utc::now(),
                })
                .expect("record");
        }

        let history = store.attempts_for(&job.id).expect("history");
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].attempt, 1);
        assert!(history[1].outcome.is_success());
    }

    #[test]
    fn purge_removes_only_old_finished_jobs() {
        let store = store();
        let mut done = sample_job();
        done.status = JobStatus::Succeeded;
        let pending = sample_job();
        store.insert(&done).expect("insert");
        store.insert(&pending).expect("insert");

        let removed = store
            .purge_finished(Utc::now() + TimeDelta::seconds(1))
            .expect("purge");
        assert_eq!(removed, 1);
        assert!(store.get(&done.id).expect("get").is_none());
        assert!(store.get(&pending.id).expect("get").is_some());
    }

    #[test]
    fn idempotency_record_blocks_until_expiry() {
        let store = store();
        let now = Utc::now();
        let ttl = Duration::from_secs(120);

        assert!(store.insert_if_absent("k", now, ttl).expect("first"));
        assert!(!store.insert_if_absent("k", now, ttl).expect("second"));

        let later = now + TimeDelta::seconds(121);
        assert!(store.insert_if_absent("k", later, ttl).expect("after expiry"));
        assert_eq!(store.purge_expired(later).expect("purge"), 0);
        assert_eq!(
            store.purge_expired(later + TimeDelta::seconds(121)).expect("purge"),
            1
        );
    }

    #[test]
    fn printed_record_is_never_released() {
        let store = store();
        let now = Utc::now();
        let ttl = Duration::from_secs(120);

        assert!(store.insert_if_absent("k", now, ttl).expect("mark"));
        assert!(!store.is_printed("k", now).expect("lookup"));
        assert!(store.remove_unprinted("k").expect("release"));
        assert!(store.insert_if_absent("k", now, ttl).expect("mark again"));

        store.mark_printed("k", now, ttl).expect("printed");
        assert!(store.is_printed("k", now).expect("lookup"));
        assert!(!store.remove_unprinted("k").expect("release"));
        assert!(!store.insert_if_absent("k", now, ttl).expect("still live"));

        let later = now + TimeDelta::seconds(121);
        assert!(!store.is_printed("k", later).expect("expired"));
    }

    #[test]
    fn concurrent_claimants_on_one_file_never_share_a_job() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("jobs.db");
        let seed = SqliteStore::open(&path).expect("open");
        for _ in 0..20 {
            seed.insert(&sample_job()).expect("insert");
        }

        let stores: Vec<Arc<SqliteStore>> = (0..4)
            .map(|_| Arc::new(SqliteStore::open(&path).expect("open")))
            .collect();

        let handles: Vec<_> = stores
            .into_iter()
            .enumerate()
            .map(|(worker, store)| {
                std::thread::spawn(move || {
                    let mut claimed = Vec::new();
                    while let Some(job) = store
                        .claim_next(Utc::now(), LEASE, &format!("worker-{worker}"))
                        .expect("claim")
                    {
                        claimed.push(job.id);
                    }
                    claimed
                })
            })
            .collect();

        let mut all: Vec<JobId> = handles
            .into_iter()
            .flat_map(|h| h.join().expect("worker thread"))
            .collect();
        let total = all.len();
        all.sort_by_key(|id| id.0);
        all.dedup();
        assert_eq!(total, 20);
        assert_eq!(all.len(), 20);
    }
}
