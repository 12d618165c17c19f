//! Fault injection for the reference runtime.
//!
//! `InterruptibleLedger` wraps any `LedgerStore` and, while its plug is
//! pulled, fails every fiscal append with a storage fault, as if the
//! terminal lost power between the device signing and the ledger write.
//! Reads and operational appends pass straight through.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::warn;

use kasse_contracts::{
    error::{KasseError, KasseResult},
    ids::{ChainId, OperationId},
    ledger::{ChainRange, ChainVerification, EntryDraft, LedgerEntry},
};
use kasse_core::traits::LedgerStore;

pub struct InterruptibleLedger {
    inner: Arc<dyn LedgerStore>,
    unplugged: AtomicBool,
}

impl InterruptibleLedger {
    pub fn new(inner: Arc<dyn LedgerStore>) -> Self {
        Self { inner, unplugged: AtomicBool::new(false) }
    }

    pub fn pull_plug(&self) {
        self.unplugged.store(true, Ordering::SeqCst);
    }

    pub fn restore(&self) {
        self.unplugged.store(false, Ordering::SeqCst);
    }
}

impl LedgerStore for InterruptibleLedger {
    fn append(&self, chain: ChainId, draft: EntryDraft) -> KasseResult<LedgerEntry> {
        if chain == ChainId::Fiscal && self.unplugged.load(Ordering::SeqCst) {
            warn!(chain = %chain, operation_id = ?draft.operation_id, "fiscal append interrupted");
            return Err(KasseError::storage("power lost before the fiscal entry was written"));
        }
        self.inner.append(chain, draft)
    }

    fn verify_chain(&self, chain: ChainId, range: ChainRange) -> KasseResult<ChainVerification> {
        self.inner.verify_chain(chain, range)
    }

    fn tail(&self, chain: ChainId) -> KasseResult<Option<LedgerEntry>> {
        self.inner.tail(chain)
    }

    fn entries(&self, chain: ChainId) -> KasseResult<Vec<LedgerEntry>> {
        self.inner.entries(chain)
    }

    fn find_by_operation(
        &self,
        chain: ChainId,
        operation_id: &OperationId,
    ) -> KasseResult<Option<LedgerEntry>> {
        self.inner.find_by_operation(chain, operation_id)
    }
}
