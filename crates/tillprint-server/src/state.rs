// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// State shared by every HTTP handler.

use std::time::Instant;

use tillprint_core::types::PrinterTarget;
use tillprint_print::JobQueue;
use tillprint_security::Authenticator;

pub struct AppState {
    pub queue: JobQueue,
    pub auth: Authenticator,
    /// Target used when an enqueue request names none.
    pub default_target: Option<PrinterTarget>,
    pub started_at: Instant,
}

impl AppState {
    pub fn new(queue: JobQueue, auth: Authenticator, default_target: Option<PrinterTarget>) -> Self {
        Self {
            queue,
            auth,
            default_target,
            started_at: Instant::now(),
        }
    }
}
