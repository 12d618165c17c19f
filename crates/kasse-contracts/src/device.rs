//! Signing device outcome types.
//!
//! The device is an external collaborator.  Its answers are data, not
//! errors: a rejection is a normal outcome the coordinator reacts to.

use serde::{Deserialize, Serialize};

/// What the signing device returned for one `sign` call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SignOutcome {
    /// The device accepted and signed the request.
    Accepted {
        /// The signed response, stored verbatim in the ledger.
        response: serde_json::Value,
        /// The device's own transaction counter, if it reports one.
        transaction_number: Option<u64>,
    },
    /// The device did not sign.
    Rejected(DeviceFailure),
}

impl SignOutcome {
    pub fn accepted(response: serde_json::Value, transaction_number: Option<u64>) -> Self {
        Self::Accepted { response, transaction_number }
    }

    pub fn transient(reason: impl Into<String>) -> Self {
        Self::Rejected(DeviceFailure { reason: reason.into(), transient: true })
    }

    pub fn permanent(reason: impl Into<String>) -> Self {
        Self::Rejected(DeviceFailure { reason: reason.into(), transient: false })
    }
}

/// A failed signing attempt.
///
/// `transient` failures (timeout, busy, connection refused) are retried
/// with backoff; permanent ones (payload rejected as invalid) escalate
/// immediately.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceFailure {
    pub reason: String,
    pub transient: bool,
}
