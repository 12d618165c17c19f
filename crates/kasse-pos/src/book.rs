//! In-memory transaction book.
//!
//! The business-transaction store a real POS keeps next to the fiscal
//! ledger.  Here it only tracks the resolution state the coordinator and the
//! operator surface read and write.

use std::collections::HashMap;
use std::sync::Mutex;

use kasse_contracts::{
    error::{KasseError, KasseResult},
    ids::TransactionRef,
    operation::ResolutionState,
};
use kasse_core::traits::TransactionBook;

#[derive(Debug, Default)]
pub struct InMemoryTransactionBook {
    states: Mutex<HashMap<TransactionRef, ResolutionState>>,
}

impl InMemoryTransactionBook {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every transaction with a non-default state, sorted by reference.
    pub fn open_cases(&self) -> KasseResult<Vec<(TransactionRef, ResolutionState)>> {
        let states = self.lock()?;
        let mut cases: Vec<_> = states
            .iter()
            .filter(|(_, state)| **state != ResolutionState::None)
            .map(|(tx, state)| (tx.clone(), *state))
            .collect();
        cases.sort_by(|a, b| a.0.as_str().cmp(b.0.as_str()));
        Ok(cases)
    }

    fn lock(&self) -> KasseResult<std::sync::MutexGuard<'_, HashMap<TransactionRef, ResolutionState>>> {
        self.states
            .lock()
            .map_err(|e| KasseError::storage(format!("transaction book lock poisoned: {}", e)))
    }
}

impl TransactionBook for InMemoryTransactionBook {
    fn resolution(&self, transaction: &TransactionRef) -> KasseResult<ResolutionState> {
        Ok(self.lock()?.get(transaction).copied().unwrap_or_default())
    }

    fn set_resolution(&self, transaction: &TransactionRef, state: ResolutionState) -> KasseResult<()> {
        self.lock()?.insert(transaction.clone(), state);
        Ok(())
    }
}
