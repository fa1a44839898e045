// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Service wiring: opens the shared store and builds the queue, guard, pool
// and dispatcher from one `ServiceConfig`.  Every component gets its
// settings explicitly; nothing reads the environment after this point.

use std::path::Path;
use std::sync::Arc;

use tracing::info;

use tillprint_core::ServiceConfig;
use tillprint_core::error::Result;
use tillprint_print::{
    ConnectionPool, Dispatcher, DispatcherConfig, IdempotencyGuard, JobQueue, PoolConfig,
    RetryConfig, RetryScheduler, SqliteStore, TcpTransport,
};
use tillprint_security::Authenticator;

use crate::state::AppState;

/// Everything the binary runs.
pub struct Engine {
    pub state: Arc<AppState>,
    pub dispatcher: Arc<Dispatcher>,
}

impl Engine {
    /// Build all subsystems. Call once at startup.
    pub fn init(config: &ServiceConfig) -> Result<Self> {
        ensure_parent_dir(&config.store.path)?;
        info!(path = %config.store.path.display(), "opening job store");
        let store = Arc::new(SqliteStore::open(&config.store.path)?);

        let queue = JobQueue::new(
            store.clone(),
            RetryScheduler::new(RetryConfig::from(&config.dispatch)),
        );
        let guard = Arc::new(IdempotencyGuard::new(
            store,
            config.dispatch.idempotency_window,
            config.dispatch.lease,
        )?);
        let pool = Arc::new(ConnectionPool::new(
            Arc::new(TcpTransport::new(config.dispatch.transmit_timeout)),
            PoolConfig::from(&config.dispatch),
        ));
        let dispatcher = Arc::new(Dispatcher::new(
            queue.clone(),
            pool,
            guard,
            config.printer.clone(),
            DispatcherConfig::from(config),
        ));

        let auth = Authenticator::new(&config.auth)?;
        let state = Arc::new(AppState::new(
            queue,
            auth,
            config.printer.default_target.clone(),
        ));

        info!("services initialised");
        Ok(Self { state, dispatcher })
    }
}

fn ensure_parent_dir(path: &Path) -> Result<()> {
    match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => Ok(std::fs::create_dir_all(dir)?),
        _ => Ok(()),
    }
}
