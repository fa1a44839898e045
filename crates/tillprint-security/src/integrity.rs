// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Receipt fingerprints and idempotency tokens (SHA-256).

use sha2::{Digest, Sha256};

use tillprint_core::error::Result;
use tillprint_core::types::{JobId, ReceiptPayload};

/// Compute the SHA-256 hash of `data` and return it as a lowercase hex string.
pub fn hash_bytes(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Fingerprint of a receipt's content.
///
/// Two payloads with identical fields produce the same fingerprint, so it
/// identifies the logical receipt independently of the job carrying it.
pub fn payload_fingerprint(payload: &ReceiptPayload) -> Result<String> {
    let canonical = serde_json::to_vec(payload)?;
    Ok(hash_bytes(&canonical))
}

/// Idempotency token for one logical print: the job plus the receipt it
/// carries. Every attempt of the same job shares it.
pub fn print_token(job_id: &JobId, fingerprint: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(job_id.0.as_bytes());
    hasher.update(fingerprint.as_bytes());
    hex::encode(hasher.finalize())
}
