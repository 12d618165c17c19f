//! # kasse-pos
//!
//! Point-of-sale reference runtime for the Kasse fiscal ledger.
//!
//! Demonstrates four scenarios against a simulated TSE (the certified
//! signing device every fiscal transaction must pass through):
//!
//! 1. **Everyday sales**: signing, commit, idempotent resubmission, and
//!    concurrent sales sharing one fiscal chain.
//! 2. **Device outage**: retry with backoff, escalation, and the operator
//!    resolution surface.
//! 3. **Crash and recovery**: a restart between signing and commit neither
//!    loses nor re-signs a sale.
//! 4. **Tamper audit**: an edited ledger file is detected and located.
//!
//! All sales are fictional. No real device is contacted.

pub mod book;
pub mod device;
pub mod faults;
pub mod runtime;
pub mod sales;
pub mod scenarios;
