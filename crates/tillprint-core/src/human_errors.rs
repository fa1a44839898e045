// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Operator-facing descriptions of job failures.
//
// Dead and failed jobs surface to the upstream CMS, where staff decide on a
// compensating action (reprint, fix the printer, tell the customer). Every
// recorded failure maps to a plain sentence and a concrete next step.

use serde::Serialize;

use crate::types::{FailureKind, JobError, JobStatus};

/// Who has to act on a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    /// The engine retries on its own.
    Transient,
    /// Somebody at the till must do something (paper, power, cable).
    ActionRequired,
    /// Retrying cannot help; the receipt data must change.
    Permanent,
}

/// A failure explained for shop staff and monitoring.
#[derive(Debug, Clone, Serialize)]
pub struct OperatorNotice {
    pub message: String,
    pub suggestion: String,
    pub retriable: bool,
    pub severity: Severity,
}

/// Explain a recorded job failure for a job currently in `status`.
///
/// A dead job is never retried by the engine, whatever its last error was.
pub fn describe_failure(error: &JobError, status: JobStatus) -> OperatorNotice {
    let notice = describe_error(error);
    if status != JobStatus::Dead || !notice.retriable {
        return notice;
    }
    OperatorNotice {
        message: format!("{} The engine has stopped retrying.", notice.message),
        suggestion: "Fix the printer, then reprint this receipt from the order screen.".into(),
        retriable: false,
        severity: Severity::ActionRequired,
    }
}

fn describe_error(error: &JobError) -> OperatorNotice {
    match error.kind {
        FailureKind::Validation => OperatorNotice {
            message: "The receipt request was incomplete.".into(),
            suggestion: format!(
                "Check the order in the back office and send the receipt again. ({})",
                error.reason
            ),
            retriable: false,
            severity: Severity::Permanent,
        },
        FailureKind::TransientDispatch => describe_transport(&error.reason),
        FailureKind::PermanentRender => OperatorNotice {
            message: "This receipt can't be printed on the selected printer.".into(),
            suggestion: format!(
                "Reprint from the order screen after correcting the receipt, or choose a wider printer. ({})",
                error.reason
            ),
            retriable: false,
            severity: Severity::Permanent,
        },
        FailureKind::PoolExhausted => OperatorNotice {
            message: "The printer is busy with other receipts.".into(),
            suggestion: "Nothing to do yet: the receipt is queued and will print when the printer frees up.".into(),
            retriable: true,
            severity: Severity::Transient,
        },
        FailureKind::LeaseExpired => OperatorNotice {
            message: "A print worker stopped while handling this receipt.".into(),
            suggestion: "The receipt has been put back in the queue automatically.".into(),
            retriable: true,
            severity: Severity::Transient,
        },
    }
}

/// Refine a transport failure by looking at the socket error text.
fn describe_transport(reason: &str) -> OperatorNotice {
    let lower = reason.to_ascii_lowercase();

    if lower.contains("refused") {
        OperatorNotice {
            message: "The printer refused the connection.".into(),
            suggestion: "Check the printer is switched on and its network cable is plugged in.".into(),
            retriable: true,
            severity: Severity::ActionRequired,
        }
    } else if lower.contains("timed out") || lower.contains("timeout") {
        OperatorNotice {
            message: "The printer didn't respond in time.".into(),
            suggestion: "Check for a paper jam or an open cover. We'll keep trying.".into(),
            retriable: true,
            severity: Severity::Transient,
        }
    } else if lower.contains("reset") || lower.contains("broken pipe") || lower.contains("partial") {
        OperatorNotice {
            message: "The connection to the printer dropped mid-receipt.".into(),
            suggestion: "The receipt will be printed again in full; discard any partial slip.".into(),
            retriable: true,
            severity: Severity::Transient,
        }
    } else {
        OperatorNotice {
            message: "The printer couldn't be reached.".into(),
            suggestion: format!("We'll keep trying. If this persists, restart the printer. ({reason})"),
            retriable: true,
            severity: Severity::Transient,
        }
    }
}
