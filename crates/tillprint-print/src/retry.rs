// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Retry scheduler: exponential backoff with uniform jitter.
//
// The scheduler only decides.  It inspects a job that just failed and returns
// either a retry instant or `Dead`; the job queue applies the decision with a
// compare-and-set against the lease the failing dispatcher still holds.
// Exhaustion is never reported to the enqueuer, it shows up as a `Dead` job.

use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use tracing::{debug, warn};

use tillprint_core::config::DispatchSettings;
use tillprint_core::error::TillprintError;
use tillprint_core::types::{FailureKind, JobError, JobStatus, PrintJob};

use crate::store::{JobChange, after};

/// Backoff and attempt limits.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Attempts (including the first) before a job is declared dead.
    pub max_attempts: u32,
    pub base_delay: Duration,
    /// Cap on the exponential part of the delay.
    pub max_delay: Duration,
    /// Upper bound of the uniform random delay added on top.
    pub jitter: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::from(&DispatchSettings::default())
    }
}

impl From<&DispatchSettings> for RetryConfig {
    fn from(settings: &DispatchSettings) -> Self {
        Self {
            max_attempts: settings.max_attempts,
            base_delay: settings.base_delay,
            max_delay: settings.max_delay,
            jitter: settings.jitter,
        }
    }
}

/// What happens to a job after a failed attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Back to `Pending`, not claimable before `at`.
    RetryAfter { delay: Duration, at: DateTime<Utc> },
    /// Out of attempts, or the failure cannot be fixed by retrying.
    Dead,
}

impl RetryDecision {
    /// The store change that applies this decision to a `Failed` job.
    pub fn change(&self, error: JobError) -> JobChange {
        match self {
            Self::RetryAfter { at, .. } => JobChange::to(JobStatus::Pending)
                .eligible_at(*at)
                .error(error),
            Self::Dead => JobChange::to(JobStatus::Dead).error(error),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct RetryScheduler {
    config: RetryConfig,
}

impl RetryScheduler {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Decide the fate of `job`, whose attempt number `job.attempts` just
    /// failed with `error`.
    pub fn on_failure(&self, job: &PrintJob, error: &JobError, now: DateTime<Utc>) -> RetryDecision {
        if !error.kind.is_transient() {
            warn!(job_id = %job.id, kind = ?error.kind, "permanent failure, not retrying");
            return RetryDecision::Dead;
        }

        if job.attempts >= self.config.max_attempts {
            warn!(
                job_id = %job.id,
                attempts = job.attempts,
                max = self.config.max_attempts,
                "retry limit exhausted"
            );
            return RetryDecision::Dead;
        }

        let delay = self.delay_for(job.attempts);
        debug!(
            job_id = %job.id,
            attempt = job.attempts,
            delay_ms = delay.as_millis() as u64,
            "scheduling retry"
        );
        RetryDecision::RetryAfter {
            delay,
            at: after(now, delay),
        }
    }

    /// The change that marks a job printed.
    pub fn on_success(&self) -> JobChange {
        JobChange::to(JobStatus::Succeeded).clear_error()
    }

    /// Full delay before the retry following attempt `attempts`.
    pub fn delay_for(&self, attempts: u32) -> Duration {
        let jitter_ms = self.config.jitter.as_millis() as u64;
        let jitter = if jitter_ms == 0 {
            0
        } else {
            rand::rng().random_range(0..=jitter_ms)
        };
        self.base_delay_for(attempts) + Duration::from_millis(jitter)
    }

    /// `min(max_delay, base_delay * 2^(attempts - 1))`, without jitter.
    pub fn base_delay_for(&self, attempts: u32) -> Duration {
        let exponent = attempts.saturating_sub(1).min(31);
        let base_ms = self.config.base_delay.as_millis() as u64;
        let max_ms = self.config.max_delay.as_millis() as u64;
        Duration::from_millis(base_ms.saturating_mul(1u64 << exponent).min(max_ms))
    }
}

/// Map an error ending an attempt onto the recorded failure taxonomy.
///
/// Anything without a natural kind (config, auth, lookups) is treated as
/// transient so the job is retried rather than lost.
pub fn classify(err: &TillprintError) -> FailureKind {
    if let TillprintError::Io(io) = err {
        use std::io::ErrorKind;
        return match io.kind() {
            ErrorKind::InvalidInput | ErrorKind::InvalidData | ErrorKind::Unsupported => {
                FailureKind::PermanentRender
            }
            _ => FailureKind::TransientDispatch,
        };
    }
    err.failure_kind().unwrap_or(FailureKind::TransientDispatch)
}
