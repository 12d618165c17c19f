//! Point-of-sale demo scenarios.
//!
//! Each scenario is a self-contained module that wires real Kasse components
//! (ledger stores, outbox, coordinator, retry policy) to a simulated signing
//! device and demonstrates one guarantee of the fiscal pipeline.

pub mod crash_recovery;
pub mod device_outage;
pub mod sale;
pub mod tamper_audit;
