//! Ledger entry, draft, and verification report types.
//!
//! A `LedgerEntry` is one immutable link in a hash chain.  Callers never
//! build entries directly: they hand an `EntryDraft` to the ledger store,
//! which assigns the position, the link, and the hash.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{ActorId, ChainId, LogId, OperationId};

/// Category of a ledger entry.
///
/// Fiscal events are signed by the device; operational events record what
/// happened around them.  The string form is part of the canonical hash
/// input and must never change for an existing variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EventType {
    TransactionClosed,
    TransactionVoided,
    TrainingModeToggled,
    DailyClosing,
    CashDeposit,
    CashWithdrawal,
    FiscalOperationEscalated,
    ResolutionPostponed,
    ResolutionResolved,
    OperatorRetry,
    UserLogin,
    UserLogout,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::TransactionClosed => "transaction-closed",
            EventType::TransactionVoided => "transaction-voided",
            EventType::TrainingModeToggled => "training-mode-toggled",
            EventType::DailyClosing => "daily-closing",
            EventType::CashDeposit => "cash-deposit",
            EventType::CashWithdrawal => "cash-withdrawal",
            EventType::FiscalOperationEscalated => "fiscal-operation-escalated",
            EventType::ResolutionPostponed => "resolution-postponed",
            EventType::ResolutionResolved => "resolution-resolved",
            EventType::OperatorRetry => "operator-retry",
            EventType::UserLogin => "user-login",
            EventType::UserLogout => "user-logout",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Everything the caller supplies for a new ledger entry.
///
/// The store fills in `log_id`, `sequence`, `previous_hash`, and
/// `current_hash`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntryDraft {
    pub event_type: EventType,
    pub timestamp_utc: DateTime<Utc>,
    pub actor_id: Option<ActorId>,
    /// Request sent to the device (fiscal) or the operational fact.
    pub payload: serde_json::Value,
    /// What the device or subsystem returned.
    pub device_response: serde_json::Value,
    /// Device transaction number; fiscal chain only.
    pub transaction_number: Option<u64>,
    /// Operation that produced this entry.  At most one entry per
    /// operation id exists on a chain.
    pub operation_id: Option<OperationId>,
}

impl EntryDraft {
    /// A draft for an operational fact with no device involvement.
    pub fn operational(
        event_type: EventType,
        actor_id: Option<ActorId>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            event_type,
            timestamp_utc: Utc::now(),
            actor_id,
            payload,
            device_response: serde_json::Value::Null,
            transaction_number: None,
            operation_id: None,
        }
    }
}

/// One immutable entry in a hash chain.
///
/// Modifying any hashed field invalidates `current_hash` and every later
/// `previous_hash`, which chain verification detects.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub log_id: LogId,
    pub chain: ChainId,
    /// Zero-based position in the chain.  Authoritative ordering.
    pub sequence: u64,
    pub timestamp_utc: DateTime<Utc>,
    pub event_type: EventType,
    pub transaction_number: Option<u64>,
    pub actor_id: Option<ActorId>,
    pub operation_id: Option<OperationId>,
    pub payload: serde_json::Value,
    pub device_response: serde_json::Value,
    /// Canonical serialization version used to compute `current_hash`.
    pub canonical_version: u16,
    /// Hash of the preceding entry, or the genesis sentinel.
    pub previous_hash: String,
    pub current_hash: String,
}

/// Optional sequence bounds for chain verification (both inclusive).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainRange {
    pub from: Option<u64>,
    pub to: Option<u64>,
}

impl ChainRange {
    /// The whole chain.
    pub fn all() -> Self {
        Self::default()
    }

    pub fn contains(&self, sequence: u64) -> bool {
        self.from.map_or(true, |from| sequence >= from) && self.to.map_or(true, |to| sequence <= to)
    }
}

/// What kind of integrity violation was found.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakKind {
    /// `previous_hash` does not equal the predecessor's `current_hash`.
    LinkMismatch,
    /// `current_hash` does not recompute from the entry's fields.
    HashMismatch,
    /// The entry's `sequence` is not its position in the chain.
    SequenceGap,
    /// The entry is older than its predecessor.
    TimestampRegression,
    /// The entry was written with a canonicalization this build cannot evaluate.
    UnsupportedCanonicalVersion,
    /// The entry claims to belong to another chain.
    ForeignChain,
}

/// The first broken entry found by a verification pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainBreak {
    pub log_id: LogId,
    pub sequence: u64,
    pub kind: BreakKind,
}

/// Result of walking a chain and recomputing every link.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainVerification {
    pub chain: ChainId,
    pub valid: bool,
    /// Number of entries examined before stopping.
    pub checked: u64,
    pub broken_at: Option<ChainBreak>,
}

impl ChainVerification {
    pub fn intact(chain: ChainId, checked: u64) -> Self {
        Self { chain, valid: true, checked, broken_at: None }
    }

    pub fn broken(chain: ChainId, checked: u64, at: ChainBreak) -> Self {
        Self { chain, valid: false, checked, broken_at: Some(at) }
    }
}
