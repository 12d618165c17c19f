//! Identifier types shared by the ledger and the coordinator.
//!
//! Identifiers are thin newtypes so an `OperationId` can never be passed
//! where a `TransactionRef` is expected.  All of them serialize as plain
//! strings.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Caller-supplied idempotency key for one fiscal operation.
///
/// The same id always refers to the same operation for its whole lifecycle.
/// Example: OperationId("sale-2024-000117-close")
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OperationId(pub String);

impl OperationId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Reference to the business transaction (the sale, the void, ...) that owns
/// a fiscal operation.  Resolution states are tracked per transaction.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TransactionRef(pub String);

impl TransactionRef {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TransactionRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Reference to the acting user (cashier, manager, operator).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ActorId(pub String);

impl ActorId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ActorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Globally unique identifier of a single ledger entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LogId(pub uuid::Uuid);

impl LogId {
    /// Create a new, unique log id.
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl Default for LogId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for LogId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identity of one hash chain.
///
/// Both ledgers share the same entry shape and chaining discipline; they
/// differ only in which chain an entry is appended to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChainId {
    /// Signed fiscal events (sales, voids, training-mode toggles).
    Fiscal,
    /// Operational facts (escalations, operator decisions, drawer events).
    Operational,
}

impl ChainId {
    /// Every chain the store manages, in a stable order.
    pub const ALL: [ChainId; 2] = [ChainId::Fiscal, ChainId::Operational];

    pub fn as_str(&self) -> &'static str {
        match self {
            ChainId::Fiscal => "fiscal",
            ChainId::Operational => "operational",
        }
    }

    /// Only the fiscal chain carries device transaction numbers.
    pub fn carries_transaction_numbers(&self) -> bool {
        matches!(self, ChainId::Fiscal)
    }
}

impl fmt::Display for ChainId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
