// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Shared-store seam.
//
// The store is the single source of truth for job state and idempotency
// records.  Everything that mutates a job goes through an atomic operation
// here (claim or compare-and-set), so any number of dispatcher workers, in
// one process or several, can share it without an in-process lock.

pub mod sqlite;

use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};

use tillprint_core::error::Result;
use tillprint_core::types::{AttemptRecord, JobError, JobId, JobStatus, PrintJob};

pub use sqlite::SqliteStore;

/// What a compare-and-set expects to find before it writes.
#[derive(Debug, Clone, Copy)]
pub struct Expected<'a> {
    pub status: JobStatus,
    /// When set, the job's current lease token must match.
    pub lease_token: Option<&'a str>,
}

impl<'a> Expected<'a> {
    pub fn status(status: JobStatus) -> Self {
        Self {
            status,
            lease_token: None,
        }
    }

    pub fn leased(status: JobStatus, lease_token: &'a str) -> Self {
        Self {
            status,
            lease_token: Some(lease_token),
        }
    }
}

/// The write half of a compare-and-set.
#[derive(Debug, Clone)]
pub struct JobChange {
    pub status: JobStatus,
    /// `None` leaves the eligibility instant unchanged.
    pub next_eligible_at: Option<DateTime<Utc>>,
    /// `None` leaves the recorded error untouched; `Some(None)` clears it.
    pub last_error: Option<Option<JobError>>,
    /// Keep the lease token and expiry instead of clearing them.
    pub keep_lease: bool,
}

impl JobChange {
    pub fn to(status: JobStatus) -> Self {
        Self {
            status,
            next_eligible_at: None,
            last_error: None,
            keep_lease: false,
        }
    }

    pub fn eligible_at(mut self, at: DateTime<Utc>) -> Self {
        self.next_eligible_at = Some(at);
        self
    }

    pub fn error(mut self, error: JobError) -> Self {
        self.last_error = Some(Some(error));
        self
    }

    pub fn clear_error(mut self) -> Self {
        self.last_error = Some(None);
        self
    }

    pub fn keep_lease(mut self) -> Self {
        self.keep_lease = true;
        self
    }
}

/// Persistent job state with atomic claim and compare-and-set.
pub trait JobStore: Send + Sync {
    fn insert(&self, job: &PrintJob) -> Result<()>;

    fn get(&self, id: &JobId) -> Result<Option<PrintJob>>;

    /// Atomically take the oldest eligible `Pending` job: move it to
    /// `InFlight`, bump `attempts` and attach the lease.
    fn claim_next(
        &self,
        now: DateTime<Utc>,
        lease: Duration,
        lease_token: &str,
    ) -> Result<Option<PrintJob>>;

    /// Apply `change` only if the job still matches `expected`.
    ///
    /// Returns `Ok(false)` when the job moved on (or vanished) in the
    /// meantime, and `InvalidTransition` when the change itself is illegal.
    fn compare_and_set(
        &self,
        id: &JobId,
        expected: &Expected<'_>,
        change: &JobChange,
        now: DateTime<Utc>,
    ) -> Result<bool>;

    /// Return leased jobs whose lease ran out to `Pending`.
    fn release_expired_leases(&self, now: DateTime<Utc>) -> Result<Vec<JobId>>;

    fn count(&self, status: Option<JobStatus>) -> Result<u64>;

    fn status_counts(&self) -> Result<Vec<(JobStatus, u64)>>;

    /// Newest first.
    fn list(&self, status: Option<JobStatus>, limit: u32) -> Result<Vec<PrintJob>>;

    fn record_attempt(&self, record: &AttemptRecord) -> Result<()>;

    /// Oldest first.
    fn attempts_for(&self, id: &JobId) -> Result<Vec<AttemptRecord>>;

    /// Delete `Succeeded`/`Dead` jobs (and their history) last touched
    /// before `before`.
    fn purge_finished(&self, before: DateTime<Utc>) -> Result<u64>;
}

/// Set-if-absent records with expiry, the primitive behind the
/// idempotency guard.
pub trait IdempotencyStore: Send + Sync {
    /// Record `key` until `now + ttl`. Returns `false` if an unexpired
    /// record already exists.
    fn insert_if_absent(&self, key: &str, now: DateTime<Utc>, ttl: Duration) -> Result<bool>;

    /// Mark `key` as physically printed, live until `now + ttl`. Creates the
    /// record if it is missing.
    fn mark_printed(&self, key: &str, now: DateTime<Utc>, ttl: Duration) -> Result<()>;

    /// Whether a live record for `key` says the receipt was printed.
    fn is_printed(&self, key: &str, now: DateTime<Utc>) -> Result<bool>;

    /// Drop the record for `key` unless it is marked printed.
    fn remove_unprinted(&self, key: &str) -> Result<bool>;

    fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64>;
}

/// `now + duration`, saturating at the far future.
pub(crate) fn after(now: DateTime<Utc>, duration: Duration) -> DateTime<Utc> {
    TimeDelta::from_std(duration)
        .ok()
        .and_then(|delta| now.checked_add_signed(delta))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// `now - duration`, saturating at the far past.
pub(crate) fn before(now: DateTime<Utc>, duration: Duration) -> DateTime<Utc> {
    TimeDelta::from_std(duration)
        .ok()
        .and_then(|delta| now.checked_sub_signed(delta))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}
