//! # kasse-core
//!
//! The fiscal operation coordinator for the Kasse point-of-sale backend.
//!
//! This crate provides:
//! - The seam traits (`LedgerStore`, `OperationStore`, `SigningGateway`,
//!   `TransactionBook`, `RetryPolicy`)
//! - The `Coordinator` that drives each fiscal operation through the signing
//!   device into the fiscal chain exactly once
//! - The `ResolutionSurface` operators use for escalated operations
//!
//! ## Usage
//!
//! ```rust,ignore
//! use kasse_core::{Coordinator, CoordinatorSettings};
//!
//! let coordinator = Coordinator::new(ledger, operations, gateway, book, policy, CoordinatorSettings::default());
//! coordinator.recover().await?;
//! let submission = coordinator.submit(request).await?;
//! ```

pub mod coordinator;
pub mod resolution;
pub mod settings;
pub mod traits;

#[cfg(test)]
pub(crate) mod test_support;

pub use coordinator::{Coordinator, RecoveryReport};
pub use resolution::ResolutionSurface;
pub use settings::CoordinatorSettings;
