//! Seam traits for the Kasse coordinator.
//!
//! These five traits define every boundary the coordinator crosses:
//!
//! - `LedgerStore`:     trusted sink (owns chain integrity, append-only)
//! - `OperationStore`:  the outbox table (per-row compare-and-set)
//! - `SigningGateway`:  untrusted external device (may hang, may fail)
//! - `TransactionBook`: resolution state of the owning business transactions
//! - `RetryPolicy`:     decides between backoff and escalation
//!
//! The coordinator wires them together.  Nothing but the ledger store
//! computes hashes, and nothing but the coordinator writes operation rows.

use std::time::Duration;

use async_trait::async_trait;

use kasse_contracts::{
    device::{DeviceFailure, SignOutcome},
    error::KasseResult,
    ids::{ChainId, OperationId, TransactionRef},
    ledger::{ChainRange, ChainVerification, EntryDraft, LedgerEntry},
    operation::{PendingFiscalOperation, ResolutionState},
};

/// Durable, append-only, hash-chained storage for every `ChainId`.
///
/// Implementations must serialize appends per chain: no two `append` calls
/// on the same chain may observe the same tail.
pub trait LedgerStore: Send + Sync {
    /// Link `draft` to the chain tail, hash it, persist it, and return it.
    ///
    /// All-or-nothing: on `Err` no partial entry exists.  If the draft
    /// carries an `operation_id` that already has an entry on `chain`, the
    /// existing entry is returned and nothing is written.
    fn append(&self, chain: ChainId, draft: EntryDraft) -> KasseResult<LedgerEntry>;

    /// Recompute every link within `range` and report the first break.
    ///
    /// Never mutates state and never repairs.
    fn verify_chain(&self, chain: ChainId, range: ChainRange) -> KasseResult<ChainVerification>;

    /// The latest entry on `chain`, if any.
    fn tail(&self, chain: ChainId) -> KasseResult<Option<LedgerEntry>>;

    /// Every entry on `chain` in sequence order.
    fn entries(&self, chain: ChainId) -> KasseResult<Vec<LedgerEntry>>;

    /// The entry committed for `operation_id` on `chain`, if any.
    fn find_by_operation(
        &self,
        chain: ChainId,
        operation_id: &OperationId,
    ) -> KasseResult<Option<LedgerEntry>>;
}

/// Result of inserting a new outbox row.
#[derive(Debug, Clone)]
pub enum InsertOutcome {
    Created(PendingFiscalOperation),
    /// A row with that id already existed; it is returned unchanged.
    Existing(PendingFiscalOperation),
}

/// Result of a compare-and-set on an outbox row.
#[derive(Debug, Clone)]
pub enum CasOutcome {
    /// The row was replaced; the stored value (with its new revision) is returned.
    Applied(PendingFiscalOperation),
    /// Someone else moved the row first; the current value is returned.
    Conflict(PendingFiscalOperation),
}

/// Persistence for `PendingFiscalOperation` rows.
pub trait OperationStore: Send + Sync {
    /// Insert `operation` unless a row with its id exists.
    fn insert_if_absent(&self, operation: PendingFiscalOperation) -> KasseResult<InsertOutcome>;

    fn get(&self, operation_id: &OperationId) -> KasseResult<Option<PendingFiscalOperation>>;

    /// Replace the row with `next` only if its stored revision equals
    /// `expected_revision`.  The store bumps `revision` and `updated_at`.
    fn compare_and_set(
        &self,
        expected_revision: u64,
        next: PendingFiscalOperation,
    ) -> KasseResult<CasOutcome>;

    /// Every row not yet `COMMITTED`, oldest first.
    fn list_unfinished(&self) -> KasseResult<Vec<PendingFiscalOperation>>;
}

/// The external signing device (TSE).
///
/// The coordinator bounds every call with a timeout; an implementation may
/// block for as long as the device does.
#[async_trait]
pub trait SigningGateway: Send + Sync {
    async fn sign(&self, operation_id: &OperationId, payload: &serde_json::Value) -> SignOutcome;
}

/// Resolution state of the business transactions that own fiscal operations.
pub trait TransactionBook: Send + Sync {
    /// Current state; unknown transactions are `ResolutionState::None`.
    fn resolution(&self, transaction: &TransactionRef) -> KasseResult<ResolutionState>;

    fn set_resolution(&self, transaction: &TransactionRef, state: ResolutionState)
        -> KasseResult<()>;
}

/// What to do after a failed signing attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Schedule another attempt after the delay.
    RetryAfter(Duration),
    /// Stop automatic attempts and hand the operation to an operator.
    Escalate { reason: String },
}

/// Backoff and escalation policy.
///
/// Implementations must be deterministic and fast; they are consulted
/// inline after every failed attempt.
pub trait RetryPolicy: Send + Sync {
    /// Decide for an operation whose `retry_count` is already incremented
    /// for this failure.
    fn decide(&self, retry_count: u32, failure: &DeviceFailure) -> RetryDecision;
}
