//! # kasse-ledger
//!
//! Append-only, SHA-256 hash-chained ledgers and outbox storage for the
//! Kasse runtime.
//!
//! ## Overview
//!
//! Every fiscal and operational event is appended to its chain as a
//! `LedgerEntry` that links to its predecessor by hash.  Changing a single
//! byte of a stored entry breaks the chain at that entry, and
//! `LedgerStore::verify_chain` reports exactly where.
//!
//! Backends:
//! - `InMemoryLedgerStore` / `InMemoryOperationStore` for tests and demos
//! - `JsonlLedgerStore` / `FileOperationStore` for a data directory on disk
//!
//! ## Usage
//!
//! ```rust,ignore
//! use kasse_ledger::JsonlLedgerStore;
//! use kasse_core::traits::LedgerStore;
//!
//! let ledger = JsonlLedgerStore::open("./data")?;
//! let entry = ledger.append(ChainId::Fiscal, draft)?;
//! assert!(ledger.verify_chain(ChainId::Fiscal, ChainRange::all())?.valid);
//! ```

pub mod chain;
pub mod file;
pub mod memory;
pub mod outbox;
mod state;

pub use chain::{compute, verify, verify_entries, GENESIS_HASH};
pub use file::JsonlLedgerStore;
pub use memory::InMemoryLedgerStore;
pub use outbox::{FileOperationStore, InMemoryOperationStore};
