//! Pending fiscal operation types.
//!
//! `PendingFiscalOperation` is the outbox row the coordinator drives through
//! the signing device and into the fiscal chain.  `FiscalRequest` is what a
//! business event hands to the coordinator; `Submission` is what the caller
//! gets back immediately.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    ids::{ActorId, LogId, OperationId, TransactionRef},
    ledger::EventType,
};

/// Lifecycle state of a pending fiscal operation.
///
/// ```text
/// PENDING ──sign ok──▶ DEVICE_SUCCESS ──append ok──▶ COMMITTED
///    ▲  └──sign err──▶ DEVICE_FAILED
///    └──── retry ─────────┘
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OperationStatus {
    Pending,
    DeviceSuccess,
    DeviceFailed,
    Committed,
}

impl OperationStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, OperationStatus::Committed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OperationStatus::Pending => "PENDING",
            OperationStatus::DeviceSuccess => "DEVICE_SUCCESS",
            OperationStatus::DeviceFailed => "DEVICE_FAILED",
            OperationStatus::Committed => "COMMITTED",
        }
    }
}

impl fmt::Display for OperationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Operator-facing resolution state of the owning business transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionState {
    #[default]
    None,
    /// The fiscal operation exhausted its retries and awaits an operator.
    Pending,
    /// The operator deferred the decision; no automatic retries.
    Postponed,
    /// The operator closed the case.
    Resolved,
}

impl ResolutionState {
    /// Whether the coordinator may still retry automatically.
    pub fn allows_automatic_retry(&self) -> bool {
        matches!(self, ResolutionState::None)
    }
}

/// A fiscal event the business layer wants signed and recorded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FiscalRequest {
    pub operation_id: OperationId,
    pub transaction_ref: TransactionRef,
    pub event_type: EventType,
    pub actor_id: Option<ActorId>,
    /// Request body for the signing device, fixed at creation.
    pub payload_for_device: serde_json::Value,
}

/// The persisted outbox row for one fiscal operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingFiscalOperation {
    pub operation_id: OperationId,
    pub transaction_ref: TransactionRef,
    pub event_type: EventType,
    pub actor_id: Option<ActorId>,
    pub status: OperationStatus,
    pub payload_for_device: serde_json::Value,
    /// Signed device response; present from `DEVICE_SUCCESS` on.
    pub device_response: Option<serde_json::Value>,
    pub transaction_number: Option<u64>,
    pub last_error: Option<String>,
    pub retry_count: u32,
    /// Handed to the resolution surface; no automatic attempts while set.
    pub escalated: bool,
    /// Fiscal chain entry that committed this operation.
    pub ledger_log_id: Option<LogId>,
    /// Compare-and-set token, bumped on every transition.
    pub revision: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PendingFiscalOperation {
    /// A fresh `PENDING` row for `request`.
    pub fn new(request: FiscalRequest) -> Self {
        let now = Utc::now();
        Self {
            operation_id: request.operation_id,
            transaction_ref: request.transaction_ref,
            event_type: request.event_type,
            actor_id: request.actor_id,
            status: OperationStatus::Pending,
            payload_for_device: request.payload_for_device,
            device_response: None,
            transaction_number: None,
            last_error: None,
            retry_count: 0,
            escalated: false,
            ledger_log_id: None,
            revision: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// Whether `request` describes the same operation as this row.
    pub fn matches_request(&self, request: &FiscalRequest) -> bool {
        self.transaction_ref == request.transaction_ref
            && self.event_type == request.event_type
            && self.payload_for_device == request.payload_for_device
    }
}

/// Immediate answer to a submission; completion is observed asynchronously.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Submission {
    pub operation_id: OperationId,
    pub status: OperationStatus,
    /// False when the id was already known and no new row was created.
    pub created: bool,
}
