// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>

//! tillprint-security: access control and content fingerprints.
//!
//! Validates the bearer credentials presented by the upstream order system
//! before any queue access, and derives the SHA-256 fingerprints used as
//! idempotency tokens for physical print attempts.

pub mod auth;
pub mod integrity;

pub use auth::{Authenticator, CredentialKind, Principal};
pub use integrity::{hash_bytes, payload_fingerprint, print_token};
