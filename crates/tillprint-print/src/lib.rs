// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Tillprint Print: persistent job queue, retry scheduling, receipt rendering,
// pooled printer connections, and the dispatcher that drives them.  Domain
// types live in `tillprint-core`; this crate does the actual printing.

pub mod dispatcher;
pub mod idempotency;
pub mod pool;
pub mod queue;
pub mod render;
pub mod retry;
pub mod store;
pub mod transport;

#[cfg(test)]
mod test_support;

pub use dispatcher::{Dispatcher, DispatcherConfig};
pub use idempotency::IdempotencyGuard;
pub use pool::{ConnectionPool, PoolConfig, PoolMode};
pub use queue::{Claim, EnqueueRequest, JobQueue, Outcome};
pub use retry::{RetryConfig, RetryDecision, RetryScheduler};
pub use store::SqliteStore;
pub use transport::{TcpTransport, Transport};
