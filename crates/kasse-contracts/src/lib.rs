//! # kasse-contracts
//!
//! Shared types, schemas, and contracts for the Kasse fiscal ledger.
//!
//! All crates in the workspace import from here. No business logic lives in
//! this crate, only data definitions and error types.

pub mod device;
pub mod error;
pub mod ids;
pub mod ledger;
pub mod operation;
