// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Double-print guard.
//
// Before bytes go to a printer the dispatcher records the print token in
// the shared store.  The token covers the job and its receipt fingerprint,
// so every attempt of one job shares it.  A second dispatcher holding the
// job (a slow send outliving its lease, a duplicated claim) finds the record
// and does not transmit.  A transient failure releases the record so the
// retry goes through; a successful send marks it printed, which no release
// can undo.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, warn};

use tillprint_core::error::{Result, TillprintError};
use tillprint_core::types::{JobId, PrintJob};
use tillprint_security::integrity::{payload_fingerprint, print_token};

use crate::store::IdempotencyStore;

pub struct IdempotencyGuard {
    store: Arc<dyn IdempotencyStore>,
    window: Duration,
}

impl std::fmt::Debug for IdempotencyGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdempotencyGuard")
            .field("window", &self.window)
            .finish_non_exhaustive()
    }
}

impl IdempotencyGuard {
    /// `window` must be longer than the longest lease, otherwise a record
    /// could expire while its attempt is still legitimately in flight.
    pub fn new(store: Arc<dyn IdempotencyStore>, window: Duration, max_lease: Duration) -> Result<Self> {
        if window <= max_lease {
            return Err(TillprintError::Config(format!(
                "idempotency window {window:?} must exceed the lease {max_lease:?}"
            )));
        }
        Ok(Self { store, window })
    }

    /// Token identifying the logical print carried by `job`.
    pub fn token_for(job: &PrintJob) -> Result<String> {
        let fingerprint = payload_fingerprint(&job.payload)?;
        Ok(print_token(&job.id, &fingerprint))
    }

    /// Record that `token` is being transmitted for `job_id`.
    ///
    /// `false` means an unexpired record already exists and the caller must
    /// not transmit.
    pub async fn mark_attempted(&self, job_id: JobId, token: &str) -> Result<bool> {
        let window = self.window;
        let fresh = self
            .with_store(token, move |store, key| {
                store.insert_if_absent(key, Utc::now(), window)
            })
            .await?;

        if fresh {
            debug!(job_id = %job_id, "attempt recorded");
        } else {
            warn!(job_id = %job_id, "print already recorded, skipping transmission");
        }
        Ok(fresh)
    }

    /// Whether the receipt behind `token` reached a printer within the window.
    pub async fn already_printed(&self, token: &str) -> Result<bool> {
        self.with_store(token, |store, key| store.is_printed(key, Utc::now()))
            .await
    }

    /// Record a successful transmission. The record then lives a full window
    /// from now and is never released.
    pub async fn mark_printed(&self, job_id: JobId, token: &str) -> Result<()> {
        let window = self.window;
        self.with_store(token, move |store, key| {
            store.mark_printed(key, Utc::now(), window)
        })
        .await?;
        debug!(job_id = %job_id, "print recorded");
        Ok(())
    }

    /// Forget an attempt that did not print, so the next attempt may transmit.
    pub async fn release(&self, job_id: JobId, token: &str) -> Result<()> {
        let released = self
            .with_store(token, |store, key| store.remove_unprinted(key))
            .await?;
        if released {
            debug!(job_id = %job_id, "attempt released");
        }
        Ok(())
    }

    /// Drop expired records.
    pub async fn purge_expired(&self) -> Result<u64> {
        let store = Arc::clone(&self.store);
        tokio::task::spawn_blocking(move || store.purge_expired(Utc::now()))
            .await
            .map_err(|e| TillprintError::Store(format!("idempotency task failed: {e}")))?
    }

    async fn with_store<T, F>(&self, token: &str, op: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&dyn IdempotencyStore, &str) -> Result<T> + Send + 'static,
    {
        let store = Arc::clone(&self.store);
        let key = token.to_string();
        tokio::task::spawn_blocking(move || op(store.as_ref(), &key))
            .await
            .map_err(|e| TillprintError::Store(format!("idempotency task failed: {e}")))?
    }
}
