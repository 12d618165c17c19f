//! Runtime error types for the Kasse fiscal ledger.
//!
//! All fallible operations return `KasseResult<T>`.  Device rejections are
//! not errors (see `device::SignOutcome`); only storage, integrity, and
//! caller mistakes propagate as `Err`.

use thiserror::Error;

/// The unified error type for the Kasse workspace.
#[derive(Debug, Error)]
pub enum KasseError {
    /// A chain failed verification.  Never auto-corrected.
    #[error("ledger integrity violation on chain '{chain}': {reason}")]
    Integrity { chain: String, reason: String },

    /// The ledger or operation store could not persist or read a row.
    #[error("storage fault: {reason}")]
    StorageFault { reason: String },

    /// A draft was refused before anything was written.
    #[error("invalid ledger entry for chain '{chain}': {reason}")]
    InvalidEntry { chain: String, reason: String },

    /// No operation with this id exists.
    #[error("fiscal operation '{operation_id}' not found")]
    OperationNotFound { operation_id: String },

    /// The id is already used by an operation with different content.
    #[error("operation id '{operation_id}' already used for a different request")]
    OperationConflict { operation_id: String },

    /// A row was asked to move along an edge the state machine does not have.
    #[error("invalid transition for operation '{operation_id}': {reason}")]
    InvalidTransition { operation_id: String, reason: String },

    /// An operator action was refused.
    #[error("resolution rejected: {reason}")]
    ResolutionRejected { reason: String },

    /// A required configuration value is missing or invalid.
    #[error("configuration error: {reason}")]
    ConfigError { reason: String },

    /// A value could not be (de)serialized.
    #[error("serialization error: {reason}")]
    Serialization { reason: String },
}

impl KasseError {
    pub fn storage(reason: impl Into<String>) -> Self {
        Self::StorageFault { reason: reason.into() }
    }
}

impl From<serde_json::Error> for KasseError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization { reason: e.to_string() }
    }
}

/// Convenience alias used throughout the Kasse crates.
pub type KasseResult<T> = Result<T, KasseError>;
