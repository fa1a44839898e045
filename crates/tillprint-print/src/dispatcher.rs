// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Print dispatcher.
//
// One claim loop leases jobs and hands them over a bounded channel to a
// fixed set of workers; a sweeper runs beside them.  A worker takes a claim
// through: lease check, render, idempotency check, connection acquire,
// transmission under a hard timeout, connection release, completion.  Every
// attempt ends in exactly one `AttemptOutcome`; nothing a single job does
// can take the loop down.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::JoinSet;
use tracing::{Instrument, debug, error, info, info_span, instrument, warn};

use tillprint_core::config::{PrinterSettings, ServiceConfig};
use tillprint_core::error::{Result, TillprintError};
use tillprint_core::types::{AttemptOutcome, DispatchAttempt, FailureKind, JobError};

use crate::idempotency::IdempotencyGuard;
use crate::pool::ConnectionPool;
use crate::queue::{Claim, JobQueue, Outcome};
use crate::render::{PrinterProfile, render};
use crate::retry::classify;

/// Loop and timing parameters.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub workers: usize,
    pub lease: Duration,
    /// Sleep between claims while the queue is empty.
    pub poll_interval: Duration,
    pub transmit_timeout: Duration,
    pub sweep_interval: Duration,
    /// How long finished jobs are kept.
    pub retention: Duration,
}

impl From<&ServiceConfig> for DispatcherConfig {
    fn from(config: &ServiceConfig) -> Self {
        let d = &config.dispatch;
        Self {
            workers: d.workers,
            lease: d.lease,
            poll_interval: d.poll_interval,
            transmit_timeout: d.transmit_timeout,
            sweep_interval: d.sweep_interval,
            retention: config.store.retention,
        }
    }
}

pub struct Dispatcher {
    queue: JobQueue,
    pool: Arc<ConnectionPool>,
    guard: Arc<IdempotencyGuard>,
    printer: PrinterSettings,
    config: DispatcherConfig,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Dispatcher {
    pub fn new(
        queue: JobQueue,
        pool: Arc<ConnectionPool>,
        guard: Arc<IdempotencyGuard>,
        printer: PrinterSettings,
        config: DispatcherConfig,
    ) -> Self {
        Self {
            queue,
            pool,
            guard,
            printer,
            config,
        }
    }

    /// Claim and dispatch the next eligible job, if any.
    pub async fn process_next(&self) -> Result<Option<DispatchAttempt>> {
        let Some(claim) = self.queue.claim(self.config.lease).await? else {
            return Ok(None);
        };
        Ok(Some(self.dispatch(claim).await))
    }

    /// Run one attempt for a claimed job and apply its result.
    #[instrument(
        skip_all,
        fields(job_id = %claim.job_id(), attempt = claim.attempt(), printer = %claim.job.target)
    )]
    pub async fn dispatch(&self, claim: Claim) -> DispatchAttempt {
        let started = Instant::now();
        let outcome = self.attempt(&claim, started).await;
        let duration = started.elapsed();

        debug!(outcome = ?outcome, elapsed_ms = duration.as_millis() as u64, "attempt finished");
        DispatchAttempt {
            job_id: claim.job_id(),
            attempt: claim.attempt(),
            outcome,
            duration,
        }
    }

    async fn attempt(&self, claim: &Claim, started: Instant) -> AttemptOutcome {
        if let Err(e) = self.queue.verify_lease(claim).await {
            warn!(error = %e, "claim is stale, discarding");
            return AttemptOutcome::Discarded;
        }

        let profile = PrinterProfile::for_target(&self.printer, &claim.job.target);
        let bytes = match render(&claim.job.payload, &profile) {
            Ok(bytes) => bytes,
            Err(e) => {
                let error = JobError::new(FailureKind::PermanentRender, e.to_string());
                return self.finish(claim, Outcome::Failed(error), started).await;
            }
        };

        let token = match IdempotencyGuard::token_for(&claim.job) {
            Ok(token) => token,
            Err(e) => return self.finish(claim, failed(&e), started).await,
        };
        match self.guard.mark_attempted(claim.job_id(), &token).await {
            Ok(true) => {}
            Ok(false) => return self.already_attempted(claim, &token, started).await,
            Err(e) => return self.finish(claim, failed(&e), started).await,
        }

        let mut conn = match self.pool.acquire(&claim.job.target).await {
            Ok(conn) => conn,
            Err(e) => {
                self.release_token(claim, &token).await;
                return self.finish(claim, failed(&e), started).await;
            }
        };

        let sent = tokio::time::timeout(self.config.transmit_timeout, conn.send(&bytes)).await;
        let outcome = match sent {
            Ok(Ok(())) => {
                conn.release(true);
                if let Err(e) = self.guard.mark_printed(claim.job_id(), &token).await {
                    error!(error = %e, "could not record the print");
                }
                Outcome::Printed
            }
            Ok(Err(e)) => {
                conn.release(false);
                self.release_token(claim, &token).await;
                failed(&e)
            }
            Err(_) => {
                conn.release(false);
                self.release_token(claim, &token).await;
                failed(&TillprintError::TransientDispatch(format!(
                    "send to {} timed out after {}ms",
                    claim.job.target.key(),
                    self.config.transmit_timeout.as_millis()
                )))
            }
        };

        self.finish(claim, outcome, started).await
    }

    /// Another claim already holds the print token. If that claim printed,
    /// settle the job without transmitting; otherwise leave it leased.
    async fn already_attempted(&self, claim: &Claim, token: &str, started: Instant) -> AttemptOutcome {
        match self.guard.already_printed(token).await {
            Ok(true) => {
                info!("receipt already printed by an earlier claim, completing");
                return self.finish(claim, Outcome::Printed, started).await;
            }
            Ok(false) => {}
            Err(e) => warn!(error = %e, "could not read print record"),
        }

        if let Err(e) = self
            .queue
            .note_attempt(claim, AttemptOutcome::Skipped, started.elapsed())
            .await
        {
            warn!(error = %e, "could not record skipped attempt");
        }
        AttemptOutcome::Skipped
    }

    async fn release_token(&self, claim: &Claim, token: &str) {
        if let Err(e) = self.guard.release(claim.job_id(), token).await {
            warn!(error = %e, "could not release print record");
        }
    }

    async fn finish(&self, claim: &Claim, outcome: Outcome, started: Instant) -> AttemptOutcome {
        let recorded = match &outcome {
            Outcome::Printed => AttemptOutcome::Succeeded,
            Outcome::Failed(error) => AttemptOutcome::failure(error),
        };

        match self.queue.complete(claim, outcome, started.elapsed()).await {
            Ok(status) => {
                debug!(status = %status, "completion applied");
                recorded
            }
            Err(TillprintError::LeaseExpired { .. }) => {
                warn!("lease lost before completion, discarding attempt");
                AttemptOutcome::Discarded
            }
            Err(e) => {
                // The lease will run out and the sweeper will return the job.
                error!(error = %e, "failed to record completion");
                AttemptOutcome::Discarded
            }
        }
    }

    /// Run until `shutdown` flips to `true` (or its sender goes away).
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let workers = self.config.workers.max(1);
        let (tx, rx) = mpsc::channel::<Claim>(workers);
        let rx = Arc::new(Mutex::new(rx));
        let mut tasks = JoinSet::new();

        for worker in 0..workers {
            let this = Arc::clone(&self);
            let rx = Arc::clone(&rx);
            tasks.spawn(
                async move { this.work(rx).await }.instrument(info_span!("worker", worker)),
            );
        }
        {
            let this = Arc::clone(&self);
            let shutdown = shutdown.clone();
            tasks.spawn(async move { this.sweep(shutdown).await }.instrument(info_span!("sweeper")));
        }
        info!(workers, "dispatcher started");

        loop {
            if *shutdown.borrow() {
                break;
            }
            // Reserve channel capacity first: a claim must never sit in a full
            // channel while its lease runs down.
            let permit = tokio::select! {
                permit = tx.reserve() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    continue;
                }
            };

            let stop = match self.queue.claim(self.config.lease).await {
                Ok(Some(claim)) => {
                    permit.send(claim);
                    false
                }
                Ok(None) => {
                    drop(permit);
                    self.idle(&mut shutdown).await
                }
                Err(e) => {
                    drop(permit);
                    error!(error = %e, "claim failed");
                    self.idle(&mut shutdown).await
                }
            };
            if stop {
                break;
            }
        }

        drop(tx);
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "dispatcher task panicked");
            }
        }
        info!("dispatcher stopped");
        Ok(())
    }

    /// Sleep for one poll interval, waking early on shutdown. Returns
    /// whether the loop should stop.
    async fn idle(&self, shutdown: &mut watch::Receiver<bool>) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(self.config.poll_interval) => false,
            changed = shutdown.changed() => changed.is_err() || *shutdown.borrow(),
        }
    }

    async fn work(&self, rx: Arc<Mutex<mpsc::Receiver<Claim>>>) {
        loop {
            let next = rx.lock().await.recv().await;
            let Some(claim) = next else {
                break;
            };
            self.dispatch(claim).await;
        }
    }

    async fn sweep(&self, mut shutdown: watch::Receiver<bool>) {
        // `interval` panics on a zero period.
        let period = self.config.sweep_interval.max(Duration::from_millis(1));
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
            }

            match self.queue.release_expired_leases().await {
                Ok(ids) if !ids.is_empty() => info!(count = ids.len(), "reclaimed expired leases"),
                Ok(_) => {}
                Err(e) => error!(error = %e, "lease sweep failed"),
            }
            if let Err(e) = self.guard.purge_expired().await {
                error!(error = %e, "idempotency purge failed");
            }
            if let Err(e) = self.queue.purge_finished(self.config.retention).await {
                error!(error = %e, "retention purge failed");
            }
        }
    }
}

fn failed(err: &TillprintError) -> Outcome {
    Outcome::Failed(JobError::new(classify(err), err.to_string()))
}
