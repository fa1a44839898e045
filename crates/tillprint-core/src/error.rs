// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Unified error types for Tillprint.

use thiserror::Error;

use crate::types::{FailureKind, JobId, JobStatus};

/// Top-level error type for all Tillprint operations.
#[derive(Debug, Error)]
pub enum TillprintError {
    // -- Admission --
    #[error("invalid print request: {0}")]
    Validation(String),

    // -- Dispatch --
    #[error("transient dispatch failure: {0}")]
    TransientDispatch(String),

    #[error("receipt cannot be rendered: {0}")]
    PermanentRender(String),

    #[error("connection pool exhausted for {target}")]
    PoolExhausted { target: String },

    #[error("lease on job {job_id} expired or was taken over")]
    LeaseExpired { job_id: JobId },

    // -- Queue state --
    #[error("job {job_id} cannot move from {from} to {to}")]
    InvalidTransition {
        job_id: JobId,
        from: JobStatus,
        to: JobStatus,
    },

    #[error("job {0} not found")]
    NotFound(JobId),

    // -- Access --
    #[error("missing or invalid credentials")]
    Unauthorized,

    // -- Storage / persistence --
    #[error("store error: {0}")]
    Store(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl TillprintError {
    /// The failure kind recorded on a job when this error ends an attempt.
    ///
    /// Errors that never end an attempt (configuration, auth, lookups) map
    /// to `None`. Store hiccups and I/O count as transient.
    pub fn failure_kind(&self) -> Option<FailureKind> {
        match self {
            Self::Validation(_) => Some(FailureKind::Validation),
            Self::TransientDispatch(_) | Self::Io(_) | Self::Store(_) => {
                Some(FailureKind::TransientDispatch)
            }
            Self::PermanentRender(_) | Self::Serialization(_) => {
                Some(FailureKind::PermanentRender)
            }
            Self::PoolExhausted { .. } => Some(FailureKind::PoolExhausted),
            Self::LeaseExpired { .. } => Some(FailureKind::LeaseExpired),
            Self::InvalidTransition { .. }
            | Self::NotFound(_)
            | Self::Unauthorized
            | Self::Config(_) => None,
        }
    }
}

/// Alias used throughout the codebase.
pub type Result<T> = std::result::Result<T, TillprintError>;
