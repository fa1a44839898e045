// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Core domain types for the Tillprint dispatch engine.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Result, TillprintError};

/// Default raw TCP port for network receipt printers (JetDirect).
pub const DEFAULT_PRINTER_PORT: u16 = 9100;

/// Unique identifier for a print job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for JobId {
    type Err = TillprintError;

    fn from_str(s: &str) -> Result<Self> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|e| TillprintError::Validation(format!("invalid job id {s:?}: {e}")))
    }
}

/// Lifecycle states of a print job.
///
/// `Succeeded` and `Dead` are terminal. `Failed` is held only between a
/// failed attempt being recorded and the retry decision being applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting to be claimed (possibly not before `next_eligible_at`).
    Pending,
    /// Leased by a dispatcher.
    InFlight,
    /// Printed.
    Succeeded,
    /// Last attempt failed; awaiting the retry decision.
    Failed,
    /// Gave up. Needs external intervention.
    Dead,
}

impl JobStatus {
    pub const ALL: [JobStatus; 5] = [
        Self::Pending,
        Self::InFlight,
        Self::Succeeded,
        Self::Failed,
        Self::Dead,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InFlight => "in_flight",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Dead => "dead",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Dead)
    }

    /// Whether the lifecycle permits moving from `self` to `next`.
    ///
    /// `InFlight -> Pending` and `Failed -> Pending` happen on lease expiry
    /// or a retry decision; everything leaving a terminal state is refused.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, next),
            (Pending, InFlight)
                | (InFlight, Succeeded | Failed | Dead | Pending)
                | (Failed, Pending | Dead)
        )
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = TillprintError;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|status| status.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| TillprintError::Validation(format!("unknown job status {s:?}")))
    }
}

/// Printer command language spoken by a target.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrinterProtocol {
    /// Epson ESC/POS and the many clones that speak it.
    #[default]
    EscPos,
    /// Star Micronics StarPRNT.
    StarPrnt,
}

impl PrinterProtocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::EscPos => "escpos",
            Self::StarPrnt => "starprnt",
        }
    }
}

impl FromStr for PrinterProtocol {
    type Err = TillprintError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().replace(['-', '_'], "").as_str() {
            "escpos" => Ok(Self::EscPos),
            "starprnt" | "star" => Ok(Self::StarPrnt),
            other => Err(TillprintError::Validation(format!(
                "unknown printer protocol {other:?}"
            ))),
        }
    }
}

/// Network address and command language of a physical printer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PrinterTarget {
    pub host: String,
    #[serde(default = "default_printer_port")]
    pub port: u16,
    #[serde(default)]
    pub protocol: PrinterProtocol,
}

fn default_printer_port() -> u16 {
    DEFAULT_PRINTER_PORT
}

impl PrinterTarget {
    pub fn new(host: impl Into<String>, port: u16, protocol: PrinterProtocol) -> Self {
        Self {
            host: host.into(),
            port,
            protocol,
        }
    }

    /// Pool and log key: `host:port`.
    pub fn key(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn validate(&self) -> Result<()> {
        if self.host.trim().is_empty() {
            return Err(TillprintError::Validation("target host is empty".into()));
        }
        if self.host.chars().any(char::is_whitespace) {
            return Err(TillprintError::Validation(format!(
                "target host {:?} contains whitespace",
                self.host
            )));
        }
        if self.port == 0 {
            return Err(TillprintError::Validation("target port must be non-zero".into()));
        }
        Ok(())
    }
}

impl std::fmt::Display for PrinterTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{} ({})", self.host, self.port, self.protocol.as_str())
    }
}

/// Merchant block printed at the head of a receipt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Merchant {
    pub name: String,
    #[serde(default)]
    pub address: Vec<String>,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub tax_id: Option<String>,
}

/// One sold line. Amounts are in minor currency units (cents).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineItem {
    pub name: String,
    pub quantity: u32,
    pub unit_price: i64,
}

impl LineItem {
    /// `quantity * unit_price`, or `None` on overflow.
    pub fn line_total(&self) -> Option<i64> {
        self.unit_price.checked_mul(i64::from(self.quantity))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaxLine {
    pub label: String,
    pub amount: i64,
}

/// Structured receipt data as emitted by the upstream order system.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReceiptPayload {
    pub merchant: Merchant,
    pub order_reference: String,
    pub items: Vec<LineItem>,
    pub subtotal: i64,
    #[serde(default)]
    pub taxes: Vec<TaxLine>,
    pub total: i64,
    pub currency: String,
    #[serde(default)]
    pub payment_method: Option<String>,
    #[serde(default)]
    pub footer: Option<String>,
    #[serde(default)]
    pub issued_at: Option<DateTime<Utc>>,
}

impl ReceiptPayload {
    /// Structural validation performed before a job is admitted.
    ///
    /// Only checks that required fields are present and sane; whether the
    /// receipt fits a given printer is decided at render time.
    pub fn validate(&self) -> Result<()> {
        if self.merchant.name.trim().is_empty() {
            return Err(TillprintError::Validation("merchant name is required".into()));
        }
        if self.order_reference.trim().is_empty() {
            return Err(TillprintError::Validation("order reference is required".into()));
        }
        if self.items.is_empty() {
            return Err(TillprintError::Validation(
                "receipt must contain at least one line item".into(),
            ));
        }
        for (idx, item) in self.items.iter().enumerate() {
            if item.name.trim().is_empty() {
                return Err(TillprintError::Validation(format!("item {idx} has no name")));
            }
            if item.quantity == 0 {
                return Err(TillprintError::Validation(format!(
                    "item {idx} ({}) has zero quantity",
                    item.name
                )));
            }
            if item.unit_price < 0 {
                return Err(TillprintError::Validation(format!(
                    "item {idx} ({}) has a negative price",
                    item.name
                )));
            }
        }
        if self.subtotal < 0 || self.total < 0 {
            return Err(TillprintError::Validation("totals must not be negative".into()));
        }
        if let Some(tax) = self.taxes.iter().find(|t| t.label.trim().is_empty()) {
            return Err(TillprintError::Validation(format!(
                "tax line of {} has no label",
                tax.amount
            )));
        }
        if self.currency.trim().is_empty() {
            return Err(TillprintError::Validation("currency is required".into()));
        }
        Ok(())
    }
}

/// Failure taxonomy recorded on jobs and in attempt history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Malformed enqueue request. Never enters the queue.
    Validation,
    /// Connection refused, timeout, partial write.
    TransientDispatch,
    /// Payload cannot be turned into printer bytes.
    PermanentRender,
    /// No connection capacity for the target.
    PoolExhausted,
    /// The dispatcher lost its claim.
    LeaseExpired,
}

impl FailureKind {
    /// Whether the Retry Scheduler should reschedule a job failing this way.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::TransientDispatch | Self::PoolExhausted)
    }
}

/// The last failure seen by a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobError {
    pub kind: FailureKind,
    pub reason: String,
}

impl JobError {
    pub fn new(kind: FailureKind, reason: impl Into<String>) -> Self {
        Self {
            kind,
            reason: reason.into(),
        }
    }
}

/// A persisted print job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrintJob {
    pub id: JobId,
    pub payload: ReceiptPayload,
    pub target: PrinterTarget,
    pub status: JobStatus,
    /// Dispatch attempts so far. Only ever increases.
    pub attempts: u32,
    /// The job must not be claimed before this instant.
    pub next_eligible_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_attempt_at: Option<DateTime<Utc>>,
    /// Token of the claim currently holding the job, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lease_token: Option<String>,
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub last_error: Option<JobError>,
}

impl PrintJob {
    pub fn new(payload: ReceiptPayload, target: PrinterTarget) -> Self {
        let now = Utc::now();
        Self {
            id: JobId::new(),
            payload,
            target,
            status: JobStatus::Pending,
            attempts: 0,
            next_eligible_at: now,
            created_at: now,
            updated_at: now,
            last_attempt_at: None,
            lease_token: None,
            lease_expires_at: None,
            last_error: None,
        }
    }
}

/// How a single dispatch attempt ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum AttemptOutcome {
    Succeeded,
    Failed { kind: FailureKind, reason: String },
    /// Transmission suppressed by the idempotency guard.
    Skipped,
    /// The lease was lost; nothing was recorded against the job.
    Discarded,
}

impl AttemptOutcome {
    pub fn failure(error: &JobError) -> Self {
        Self::Failed {
            kind: error.kind,
            reason: error.reason.clone(),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Succeeded)
    }
}

/// One try at printing a job. Returned by the dispatcher, not persisted.
#[derive(Debug, Clone)]
pub struct DispatchAttempt {
    pub job_id: JobId,
    pub attempt: u32,
    pub outcome: AttemptOutcome,
    pub duration: std::time::Duration,
}

/// Persisted history entry for a completed attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttemptRecord {
    pub job_id: JobId,
    pub attempt: u32,
    #[serde(flatten)]
    pub outcome: AttemptOutcome,
    pub duration_ms: u64,
    pub recorded_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_payload() -> ReceiptPayload {
        ReceiptPayload {
            merchant: Merchant {
                name: "Corner Cafe".into(),
                address: vec!["12 High Street".into()],
                phone: None,
                tax_id: None,
            },
            order_reference: "ORD-1001".into(),
            items: vec![
                LineItem {
                    name: "Flat white".into(),
                    quantity: 1,
                    unit_price: 999,
                },
                LineItem {
                    name: "Croissant".into(),
                    quantity: 1,
                    unit_price: 999,
                },
            ],
            subtotal: 1998,
            taxes: vec![],
            total: 1998,
            currency: "USD".into(),
            payment_method: None,
            footer: None,
            issued_at: None,
        }
    }

    #[test]
    fn terminal_states_have_no_exits() {
        for next in JobStatus::ALL {
            assert!(!JobStatus::Succeeded.can_transition_to(next));
            assert!(!JobStatus::Dead.can_transition_to(next));
        }
    }

    #[test]
    fn pending_only_moves_to_in_flight() {
        for next in JobStatus::ALL {
            assert_eq!(
                JobStatus::Pending.can_transition_to(next),
                next == JobStatus::InFlight
            );
        }
    }

    #[test]
    fn status_parses_from_wire_names() {
        assert_eq!("in_flight".parse::<JobStatus>().unwrap(), JobStatus::InFlight);
        assert_eq!("DEAD".parse::<JobStatus>().unwrap(), JobStatus::Dead);
        assert!("lost".parse::<JobStatus>().is_err());
    }

    #[test]
    fn valid_payload_passes() {
        assert!(sample_payload().validate().is_ok());
    }

    #[test]
    fn payload_without_items_is_rejected() {
        let mut payload = sample_payload();
        payload.items.clear();
        assert!(matches!(
            payload.validate(),
            Err(TillprintError::Validation(_))
        ));
    }

    #[test]
    fn zero_quantity_is_rejected() {
        let mut payload = sample_payload();
        payload.items[1].quantity = 0;
        let err = payload.validate().unwrap_err();
        assert!(err.to_string().contains("Croissant"));
    }

    #[test]
    fn target_requires_host_and_port() {
        assert!(PrinterTarget::new("", 9100, PrinterProtocol::EscPos).validate().is_err());
        assert!(PrinterTarget::new("10.0.0.5", 0, PrinterProtocol::EscPos).validate().is_err());
        assert!(PrinterTarget::new("10.0.0.5", 9100, PrinterProtocol::EscPos).validate().is_ok());
    }

    #[test]
    fn target_deserializes_with_defaults() {
        let target: PrinterTarget = serde_json::from_str(r#"{"host":"printer.local"}"#).unwrap();
        assert_eq!(target.port, DEFAULT_PRINTER_PORT);
        assert_eq!(target.protocol, PrinterProtocol::EscPos);
    }

    #[test]
    fn attempt_record_flattens_outcome() {
        let record = AttemptRecord {
            job_id: JobId::new(),
            attempt: 2,
            outcome: AttemptOutcome::Failed {
                kind: FailureKind::TransientDispatch,
                reason: "timed out".into(),
            },
            duration_ms: 10,
            recorded_at: Utc::now(),
        };
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["outcome"], "failed");
        assert_eq!(json["kind"], "transient_dispatch");
    }
}
