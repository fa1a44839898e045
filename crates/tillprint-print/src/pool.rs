// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Per-printer connection pool.
//
// Each target gets a semaphore sized to the per-target cap and a stack of
// idle connections.  A checked-out connection holds a permit, and new
// connections are only opened when no idle one survives the liveness probe,
// so idle plus checked-out never exceeds the cap.  Dropping a
// `PooledConnection` without releasing it discards the socket and frees the
// permit, which keeps a cancelled or panicking worker from leaking a slot.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, warn};

use tillprint_core::config::DispatchSettings;
use tillprint_core::error::{Result, TillprintError};
use tillprint_core::types::PrinterTarget;

use crate::transport::{PrinterConnection, Transport};

/// What `acquire` does when a target is at its cap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolMode {
    /// Wait up to `timeout` for a slot, then fail with `PoolExhausted`.
    Block { timeout: Duration },
    /// Fail with `PoolExhausted` immediately.
    FailFast,
}

#[derive(Debug, Clone, Copy)]
pub struct PoolConfig {
    pub max_per_target: usize,
    pub mode: PoolMode,
}

impl From<&DispatchSettings> for PoolConfig {
    fn from(settings: &DispatchSettings) -> Self {
        let mode = if settings.pool_fail_fast {
            PoolMode::FailFast
        } else {
            PoolMode::Block {
                timeout: settings.pool_acquire_timeout,
            }
        };
        Self {
            max_per_target: settings.pool_max_per_target,
            mode,
        }
    }
}

struct TargetSlot {
    permits: Arc<Semaphore>,
    idle: Mutex<Vec<Box<dyn PrinterConnection>>>,
}

impl TargetSlot {
    fn idle(&self) -> std::sync::MutexGuard<'_, Vec<Box<dyn PrinterConnection>>> {
        // The guarded Vec has no invariant a panic could break.
        self.idle.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

pub struct ConnectionPool {
    transport: Arc<dyn Transport>,
    config: PoolConfig,
    slots: Mutex<HashMap<String, Arc<TargetSlot>>>,
}

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl ConnectionPool {
    pub fn new(transport: Arc<dyn Transport>, config: PoolConfig) -> Self {
        Self {
            transport,
            config,
            slots: Mutex::new(HashMap::new()),
        }
    }

    fn slot(&self, key: &str) -> Arc<TargetSlot> {
        let mut slots = self
            .slots
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(slot) = slots.get(key) {
            return Arc::clone(slot);
        }

        // Targets come from job payloads, so forget slots nobody is using
        // before adding another. A checked-out connection or a waiter holds
        // a reference; idle connections keep their slot alive for reuse.
        let before = slots.len();
        slots.retain(|_, slot| Arc::strong_count(slot) > 1 || !slot.idle().is_empty());
        if slots.len() < before {
            debug!(pruned = before - slots.len(), "dropped unused printer slots");
        }

        let slot = Arc::new(TargetSlot {
            permits: Arc::new(Semaphore::new(self.config.max_per_target)),
            idle: Mutex::new(Vec::new()),
        });
        slots.insert(key.to_string(), Arc::clone(&slot));
        slot
    }

    /// Number of printers the pool currently tracks.
    pub fn targets(&self) -> usize {
        self.slots
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    /// Check out a live connection to `target`.
    pub async fn acquire(&self, target: &PrinterTarget) -> Result<PooledConnection> {
        let key = target.key();
        let slot = self.slot(&key);
        let exhausted = || TillprintError::PoolExhausted { target: key.clone() };

        let permit = match self.config.mode {
            PoolMode::FailFast => Arc::clone(&slot.permits)
                .try_acquire_owned()
                .map_err(|_| exhausted())?,
            PoolMode::Block { timeout } => {
                tokio::time::timeout(timeout, Arc::clone(&slot.permits).acquire_owned())
                    .await
                    .map_err(|_| exhausted())?
                    .map_err(|_| exhausted())?
            }
        };

        let reused = loop {
            let Some(mut conn) = slot.idle().pop() else {
                break None;
            };
            if conn.is_alive() {
                break Some(conn);
            }
            debug!(printer = %key, "discarding dead idle connection");
        };

        let conn = match reused {
            Some(conn) => {
                debug!(printer = %key, "reusing idle connection");
                conn
            }
            None => self.transport.connect(target).await?,
        };

        Ok(PooledConnection {
            conn: Some(conn),
            slot,
            key,
            _permit: permit,
        })
    }

    /// Return `conn` to the pool. Unhealthy connections are closed.
    pub fn release(&self, conn: PooledConnection, healthy: bool) {
        conn.release(healthy);
    }

    /// `(checked_out, idle)` for `target`.
    pub fn usage(&self, target: &PrinterTarget) -> (usize, usize) {
        let slot = self.slot(&target.key());
        let checked_out = self.config.max_per_target - slot.permits.available_permits();
        let idle = slot.idle().len();
        (checked_out, idle)
    }
}

/// A connection checked out of the pool.
pub struct PooledConnection {
    conn: Option<Box<dyn PrinterConnection>>,
    slot: Arc<TargetSlot>,
    key: String,
    _permit: OwnedSemaphorePermit,
}

impl std::fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection")
            .field("printer", &self.key)
            .field("conn", &self.conn)
            .finish()
    }
}

impl PooledConnection {
    pub async fn send(&mut self, bytes: &[u8]) -> Result<()> {
        match self.conn.as_mut() {
            Some(conn) => conn.send(bytes).await,
            None => Err(TillprintError::TransientDispatch(format!(
                "connection to {} already released",
                self.key
            ))),
        }
    }

    /// Give the connection back; `healthy == false` closes it.
    pub fn release(mut self, healthy: bool) {
        if let Some(conn) = self.conn.take() {
            if healthy {
                self.slot.idle().push(conn);
            } else {
                warn!(printer = %self.key, "closing unhealthy printer connection");
            }
        }
        // Dropping `self` returns the permit.
    }
}
