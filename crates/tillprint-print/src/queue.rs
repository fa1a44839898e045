// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Persistent print job queue.
//
// The queue owns job state.  It admits validated jobs, hands out leases,
// and applies completions through compare-and-set on the lease token, so a
// dispatcher that lost its lease can never overwrite the work of whoever
// reclaimed the job.  Store calls are synchronous (rusqlite) and run on the
// blocking pool.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use tillprint_core::error::{Result, TillprintError};
use tillprint_core::types::{
    AttemptOutcome, AttemptRecord, JobError, JobId, JobStatus, PrintJob, PrinterTarget,
    ReceiptPayload,
};

use crate::retry::RetryScheduler;
use crate::store::{Expected, JobChange, JobStore, before};

/// Upper bound on a single listing.
pub const MAX_LIST_LIMIT: u32 = 500;

/// A request to print one receipt.
#[derive(Debug, Clone, Deserialize)]
pub struct EnqueueRequest {
    pub payload: ReceiptPayload,
    #[serde(default)]
    pub target: Option<PrinterTarget>,
}

/// A leased job, as handed to a dispatcher.
#[derive(Debug, Clone)]
pub struct Claim {
    /// Snapshot taken at claim time; `attempts` already counts this attempt.
    pub job: PrintJob,
    pub lease_token: String,
    pub lease_expires_at: DateTime<Utc>,
}

impl Claim {
    pub fn job_id(&self) -> JobId {
        self.job.id
    }

    pub fn attempt(&self) -> u32 {
        self.job.attempts
    }
}

/// How an attempt ended, as reported by the dispatcher.
#[derive(Debug, Clone)]
pub enum Outcome {
    Printed,
    Failed(JobError),
}

#[derive(Clone)]
pub struct JobQueue {
    store: Arc<dyn JobStore>,
    retry: RetryScheduler,
}

impl std::fmt::Debug for JobQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobQueue")
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

impl JobQueue {
    pub fn new(store: Arc<dyn JobStore>, retry: RetryScheduler) -> Self {
        Self { store, retry }
    }

    /// Run a store operation on the blocking pool.
    async fn with_store<T, F>(&self, op: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&dyn JobStore) -> Result<T> + Send + 'static,
    {
        let store = Arc::clone(&self.store);
        tokio::task::spawn_blocking(move || op(store.as_ref()))
            .await
            .map_err(|e| TillprintError::Store(format!("store task failed: {e}")))?
    }

    /// Validate and persist a new job. Returns its fresh id.
    #[instrument(skip_all, fields(order = %request.payload.order_reference))]
    pub async fn enqueue(&self, request: EnqueueRequest) -> Result<JobId> {
        request.payload.validate()?;
        let target = request
            .target
            .ok_or_else(|| TillprintError::Validation("print target is required".into()))?;
        target.validate()?;

        let job = PrintJob::new(request.payload, target);
        let id = job.id;
        let printer = job.target.key();
        self.with_store(move |store| store.insert(&job)).await?;

        info!(job_id = %id, printer = %printer, "job enqueued");
        Ok(id)
    }

    /// Lease the oldest eligible job for `lease`.
    pub async fn claim(&self, lease: Duration) -> Result<Option<Claim>> {
        let lease_token = Uuid::new_v4().to_string();
        let token = lease_token.clone();
        let job = self
            .with_store(move |store| store.claim_next(Utc::now(), lease, &token))
            .await?;

        Ok(job.and_then(|job| {
            let lease_expires_at = job.lease_expires_at?;
            Some(Claim {
                job,
                lease_token,
                lease_expires_at,
            })
        }))
    }

    /// Check that `claim` still holds a live lease on its job.
    pub async fn verify_lease(&self, claim: &Claim) -> Result<()> {
        let id = claim.job_id();
        let current = self.with_store(move |store| store.get(&id)).await?;
        let now = Utc::now();

        let held = current.is_some_and(|job| {
            job.status == JobStatus::InFlight
                && job.lease_token.as_deref() == Some(claim.lease_token.as_str())
                && job.lease_expires_at.is_some_and(|expiry| expiry > now)
        });
        if held {
            Ok(())
        } else {
            debug!(job_id = %id, "lease no longer held");
            Err(TillprintError::LeaseExpired { job_id: id })
        }
    }

    /// Apply the result of an attempt and append it to the job's history.
    ///
    /// Returns the status the job ends up in. If the lease was lost before
    /// the first write, nothing is written and `LeaseExpired` is returned.
    #[instrument(skip_all, fields(job_id = %claim.job_id(), attempt = claim.attempt()))]
    pub async fn complete(
        &self,
        claim: &Claim,
        outcome: Outcome,
        duration: Duration,
    ) -> Result<JobStatus> {
        let claim = claim.clone();
        let retry = self.retry.clone();

        self.with_store(move |store| {
            let now = Utc::now();
            let id = claim.job_id();
            let leased = Expected::leased(JobStatus::InFlight, &claim.lease_token);
            let duration_ms = u64::try_from(duration.as_millis()).unwrap_or(u64::MAX);

            match outcome {
                Outcome::Printed => {
                    if !store.compare_and_set(&id, &leased, &retry.on_success(), now)? {
                        return Err(TillprintError::LeaseExpired { job_id: id });
                    }
                    store.record_attempt(&AttemptRecord {
                        job_id: id,
                        attempt: claim.attempt(),
                        outcome: AttemptOutcome::Succeeded,
                        duration_ms,
                        recorded_at: now,
                    })?;
                    info!(job_id = %id, "job printed");
                    Ok(JobStatus::Succeeded)
                }
                Outcome::Failed(error) => {
                    // Hold the lease through the intermediate state, so a crash
                    // here leaves the job to the sweeper.
                    let failed = JobChange::to(JobStatus::Failed)
                        .error(error.clone())
                        .keep_lease();
                    if !store.compare_and_set(&id, &leased, &failed, now)? {
                        return Err(TillprintError::LeaseExpired { job_id: id });
                    }
                    store.record_attempt(&AttemptRecord {
                        job_id: id,
                        attempt: claim.attempt(),
                        outcome: AttemptOutcome::failure(&error),
                        duration_ms,
                        recorded_at: now,
                    })?;

                    let decision = retry.on_failure(&claim.job, &error, now);
                    let next = decision.change(error);
                    let status = next.status;
                    let held = Expected::leased(JobStatus::Failed, &claim.lease_token);
                    if !store.compare_and_set(&id, &held, &next, now)? {
                        warn!(job_id = %id, "lease expired before the retry decision was applied");
                        return Err(TillprintError::LeaseExpired { job_id: id });
                    }
                    Ok(status)
                }
            }
        })
        .await
    }

    /// Append an attempt to history without touching job state.
    pub async fn note_attempt(
        &self,
        claim: &Claim,
        outcome: AttemptOutcome,
        duration: Duration,
    ) -> Result<()> {
        let record = AttemptRecord {
            job_id: claim.job_id(),
            attempt: claim.attempt(),
            outcome,
            duration_ms: u64::try_from(duration.as_millis()).unwrap_or(u64::MAX),
            recorded_at: Utc::now(),
        };
        self.with_store(move |store| store.record_attempt(&record)).await
    }

    /// Return jobs held by expired leases to `Pending`.
    pub async fn release_expired_leases(&self) -> Result<Vec<JobId>> {
        self.with_store(|store| store.release_expired_leases(Utc::now()))
            .await
    }

    pub async fn get(&self, id: JobId) -> Result<PrintJob> {
        self.with_store(move |store| store.get(&id))
            .await?
            .ok_or(TillprintError::NotFound(id))
    }

    /// Newest first, at most `limit` (clamped to `1..=MAX_LIST_LIMIT`).
    pub async fn list(&self, status: Option<JobStatus>, limit: u32) -> Result<Vec<PrintJob>> {
        let limit = limit.clamp(1, MAX_LIST_LIMIT);
        self.with_store(move |store| store.list(status, limit)).await
    }

    /// Attempt history of a job, oldest first.
    pub async fn history(&self, id: JobId) -> Result<Vec<AttemptRecord>> {
        self.with_store(move |store| {
            if store.get(&id)?.is_none() {
                return Err(TillprintError::NotFound(id));
            }
            store.attempts_for(&id)
        })
        .await
    }

    pub async fn len(&self, status: Option<JobStatus>) -> Result<u64> {
        self.with_store(move |store| store.count(status)).await
    }

    pub async fn status_counts(&self) -> Result<Vec<(JobStatus, u64)>> {
        self.with_store(|store| store.status_counts()).await
    }

    /// Drop finished jobs not touched within `retention`.
    pub async fn purge_finished(&self, retention: Duration) -> Result<u64> {
        self.with_store(move |store| store.purge_finished(before(Utc::now(), retention)))
            .await
    }
}
