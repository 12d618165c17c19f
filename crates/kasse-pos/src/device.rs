//! Simulated technical security equipment (TSE).
//!
//! Stands in for the certified signing device a real terminal talks to.  It
//! keeps a transaction counter, produces a deterministic signature over the
//! request, and can be scripted to go offline, reject requests, or hang.
//! Every call is recorded so scenarios can prove that no operation was ever
//! signed twice.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use tracing::debug;

use kasse_contracts::{device::SignOutcome, ids::OperationId};
use kasse_core::traits::SigningGateway;

/// How the device answers one call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceBehavior {
    /// Sign and bump the transaction counter.
    Sign,
    /// Unreachable or busy; worth retrying.
    Offline(String),
    /// Refuses the request itself; retrying cannot help.
    Reject(String),
    /// Never answers.
    Hang,
}

#[derive(Debug, Default)]
struct DeviceState {
    script: VecDeque<DeviceBehavior>,
    /// Used once the script is exhausted.
    fallback: Option<DeviceBehavior>,
    counter: u64,
    calls: usize,
    signatures: HashMap<OperationId, usize>,
}

/// A scriptable in-process signing device.
pub struct SimulatedTse {
    serial: String,
    latency: Duration,
    state: Mutex<DeviceState>,
}

impl SimulatedTse {
    /// An online device that signs every request.
    pub fn new(serial: impl Into<String>) -> Self {
        Self {
            serial: serial.into(),
            latency: Duration::ZERO,
            state: Mutex::new(DeviceState::default()),
        }
    }

    /// Delay every answer by `latency`.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Answer the next calls with `behaviors`, in order.
    pub fn script(&self, behaviors: impl IntoIterator<Item = DeviceBehavior>) {
        self.with_state(|s| s.script.extend(behaviors));
    }

    /// Answer every unscripted call with `behavior`.
    pub fn set_fallback(&self, behavior: DeviceBehavior) {
        self.with_state(|s| s.fallback = Some(behavior));
    }

    /// Back online: drop the script and sign everything.
    pub fn restore(&self) {
        self.with_state(|s| {
            s.script.clear();
            s.fallback = None;
        });
    }

    pub fn serial(&self) -> &str {
        &self.serial
    }

    /// Number of `sign` calls received so far.
    pub fn call_count(&self) -> usize {
        self.with_state(|s| s.calls)
    }

    /// How many times `operation_id` was actually signed.
    pub fn signatures_for(&self, operation_id: &OperationId) -> usize {
        self.with_state(|s| s.signatures.get(operation_id).copied().unwrap_or(0))
    }

    /// Total signatures issued.
    pub fn transaction_counter(&self) -> u64 {
        self.with_state(|s| s.counter)
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut DeviceState) -> R) -> R {
        // A poisoned lock only means a test panicked mid-call; the counters
        // are still meaningful.
        let mut state = self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        f(&mut state)
    }

    fn signature(&self, operation_id: &OperationId, counter: u64, payload: &Value) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.serial.as_bytes());
        hasher.update(counter.to_be_bytes());
        hasher.update(operation_id.as_str().as_bytes());
        hasher.update(payload.to_string().as_bytes());
        hex::encode(hasher.finalize())
    }
}

#[async_trait]
impl SigningGateway for SimulatedTse {
    async fn sign(&self, operation_id: &OperationId, payload: &Value) -> SignOutcome {
        let behavior = self.with_state(|s| {
            s.calls += 1;
            s.script.pop_front().or_else(|| s.fallback.clone()).unwrap_or(DeviceBehavior::Sign)
        });
        debug!(operation_id = %operation_id, behavior = ?behavior, "device call");

        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        match behavior {
            DeviceBehavior::Sign => {
                let counter = self.with_state(|s| {
                    s.counter += 1;
                    *s.signatures.entry(operation_id.clone()).or_insert(0) += 1;
                    s.counter
                });
                SignOutcome::accepted(
                    json!({
                        "serial": self.serial,
                        "signature_counter": counter,
                        "signature": self.signature(operation_id, counter, payload),
                        "signed_at": Utc::now().to_rfc3339(),
                    }),
                    Some(counter),
                )
            }
            DeviceBehavior::Offline(reason) => SignOutcome::transient(reason),
            DeviceBehavior::Reject(reason) => SignOutcome::permanent(reason),
            DeviceBehavior::Hang => {
                std::future::pending::<()>().await;
                SignOutcome::transient("device never answered")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use kasse_contracts::{device::SignOutcome, ids::OperationId};
    use kasse_core::traits::SigningGateway;

    use super::{DeviceBehavior, SimulatedTse};

    #[tokio::test]
    async fn test_signs_with_increasing_counter() {
        let tse = SimulatedTse::new("TSE-TEST");
        let first = tse.sign(&OperationId::new("op-1"), &json!({ "total": 1 })).await;
        let second = tse.sign(&OperationId::new("op-2"), &json!({ "total": 2 })).await;

        match (first, second) {
            (
                SignOutcome::Accepted { transaction_number: Some(a), response },
                SignOutcome::Accepted { transaction_number: Some(b), .. },
            ) => {
                assert_eq!((a, b), (1, 2));
                assert_eq!(response["serial"], "TSE-TEST");
                assert_eq!(response["signature"].as_str().unwrap().len(), 64);
            }
            other => panic!("expected two signatures, got {:?}", other),
        }
        assert_eq!(tse.transaction_counter(), 2);
    }

    #[tokio::test]
    async fn test_script_then_fallback() {
        let tse = SimulatedTse::new("TSE-TEST");
        tse.script([DeviceBehavior::Offline("usb reset".into()), DeviceBehavior::Reject("bad vat".into())]);
        let id = OperationId::new("op-1");

        assert_eq!(tse.sign(&id, &json!({})).await, SignOutcome::transient("usb reset"));
        assert_eq!(tse.sign(&id, &json!({})).await, SignOutcome::permanent("bad vat"));
        assert!(matches!(tse.sign(&id, &json!({})).await, SignOutcome::Accepted { .. }));

        tse.set_fallback(DeviceBehavior::Offline("unplugged".into()));
        assert_eq!(tse.sign(&id, &json!({})).await, SignOutcome::transient("unplugged"));
        tse.restore();
        assert!(matches!(tse.sign(&id, &json!({})).await, SignOutcome::Accepted { .. }));

        assert_eq!(tse.call_count(), 5);
        assert_eq!(tse.signatures_for(&id), 2);
    }

    /// A hanging device never returns on its own.
    #[tokio::test]
    async fn test_hang_never_answers() {
        let tse = SimulatedTse::new("TSE-TEST");
        tse.script([DeviceBehavior::Hang]);
        let op_id = OperationId::new("op-1");
        let payload = json!({});
        let call = tse.sign(&op_id, &payload);
        let outcome = tokio::time::timeout(std::time::Duration::from_millis(20), call).await;
        assert!(outcome.is_err());
        assert_eq!(tse.transaction_counter(), 0);
    }
}
