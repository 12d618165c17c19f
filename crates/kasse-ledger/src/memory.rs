//! In-memory implementation of `LedgerStore`.
//!
//! `InMemoryLedgerStore` is the reference backend.  Each chain lives in its
//! own `Mutex<ChainState>`, so appends to one chain are strictly serialized
//! while the fiscal and operational chains never wait on each other.

use std::collections::HashMap;
use std::sync::Mutex;

use tracing::debug;

use kasse_contracts::{
    error::KasseResult,
    ids::{ChainId, OperationId},
    ledger::{ChainRange, ChainVerification, EntryDraft, LedgerEntry},
};
use kasse_core::traits::LedgerStore;

use crate::{
    chain::verify_entries,
    state::{lock_chain, ChainState, Prepared},
};

/// An in-memory, append-only ledger with one hash chain per `ChainId`.
pub struct InMemoryLedgerStore {
    pub(crate) chains: HashMap<ChainId, Mutex<ChainState>>,
}

impl InMemoryLedgerStore {
    pub fn new() -> Self {
        let chains = ChainId::ALL
            .iter()
            .map(|&chain| (chain, Mutex::new(ChainState::new(chain))))
            .collect();
        Self { chains }
    }
}

impl Default for InMemoryLedgerStore {
    fn default() -> Self {
        Self::new()
    }
}

impl LedgerStore for InMemoryLedgerStore {
    fn append(&self, chain: ChainId, draft: EntryDraft) -> KasseResult<LedgerEntry> {
        let mut state = lock_chain(&self.chains, chain)?;
        match state.prepare(draft)? {
            Prepared::Existing(entry) => Ok(entry),
            Prepared::New(entry) => {
                debug!(chain = %chain, sequence = entry.sequence, hash = %entry.current_hash, "ledger entry appended");
                state.push(entry.clone());
                Ok(entry)
            }
        }
    }

    fn verify_chain(&self, chain: ChainId, range: ChainRange) -> KasseResult<ChainVerification> {
        let state = lock_chain(&self.chains, chain)?;
        Ok(verify_entries(chain, &state.entries, range))
    }

    fn tail(&self, chain: ChainId) -> KasseResult<Option<LedgerEntry>> {
        Ok(lock_chain(&self.chains, chain)?.tail().cloned())
    }

    fn entries(&self, chain: ChainId) -> KasseResult<Vec<LedgerEntry>> {
        Ok(lock_chain(&self.chains, chain)?.entries.clone())
    }

    fn find_by_operation(
        &self,
        chain: ChainId,
        operation_id: &OperationId,
    ) -> KasseResult<Option<LedgerEntry>> {
        Ok(lock_chain(&self.chains, chain)?.find_by_operation(operation_id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;

    use chrono::{Duration, Utc};
    use serde_json::json;

    use kasse_contracts::{
        error::KasseError,
        ids::{ActorId, ChainId, OperationId},
        ledger::{BreakKind, ChainRange, EntryDraft, EventType},
    };
    use kasse_core::traits::LedgerStore;

    use super::InMemoryLedgerStore;
    use crate::chain::GENESIS_HASH;

    fn sale(op: &str, number: u64) -> EntryDraft {
        EntryDraft {
            event_type: EventType::TransactionClosed,
            timestamp_utc: Utc::now(),
            actor_id: Some(ActorId::new("cashier-1")),
            payload: json!({ "operation": op, "total_cents": 1990 }),
            device_response: json!({ "signature": format!("sig-{}", op) }),
            transaction_number: Some(number),
            operation_id: Some(OperationId::new(op)),
        }
    }

    #[test]
    fn test_appends_form_a_valid_chain() {
        let store = InMemoryLedgerStore::new();
        let first = store.append(ChainId::Fiscal, sale("op-1", 1)).unwrap();
        let second = store.append(ChainId::Fiscal, sale("op-2", 2)).unwrap();
        let third = store.append(ChainId::Fiscal, sale("op-3", 3)).unwrap();

        assert_eq!(first.previous_hash, GENESIS_HASH);
        assert_eq!(second.previous_hash, first.current_hash);
        assert_eq!(third.previous_hash, second.current_hash);
        assert_eq!([first.sequence, second.sequence, third.sequence], [0, 1, 2]);

        let report = store.verify_chain(ChainId::Fiscal, ChainRange::all()).unwrap();
        assert!(report.valid);
        assert_eq!(report.checked, 3);
    }

    /// Appending the same operation twice returns the first entry.
    #[test]
    fn test_append_is_idempotent_per_operation() {
        let store = InMemoryLedgerStore::new();
        let first = store.append(ChainId::Fiscal, sale("op-1", 1)).unwrap();
        let again = store.append(ChainId::Fiscal, sale("op-1", 1)).unwrap();

        assert_eq!(first, again);
        assert_eq!(store.entries(ChainId::Fiscal).unwrap().len(), 1);
        assert_eq!(
            store.find_by_operation(ChainId::Fiscal, &OperationId::new("op-1")).unwrap(),
            Some(first)
        );
    }

    #[test]
    fn test_earlier_timestamp_is_clamped_to_tail() {
        let store = InMemoryLedgerStore::new();
        let first = store.append(ChainId::Fiscal, sale("op-1", 1)).unwrap();

        let mut late = sale("op-2", 2);
        late.timestamp_utc = first.timestamp_utc - Duration::hours(1);
        let second = store.append(ChainId::Fiscal, late).unwrap();

        assert_eq!(second.timestamp_utc, first.timestamp_utc);
        assert!(store.verify_chain(ChainId::Fiscal, ChainRange::all()).unwrap().valid);
    }

    #[test]
    fn test_operational_chain_rejects_transaction_numbers() {
        let store = InMemoryLedgerStore::new();
        let mut draft = EntryDraft::operational(EventType::CashDeposit, None, json!({ "cents": 5000 }));
        draft.transaction_number = Some(7);

        assert!(matches!(
            store.append(ChainId::Operational, draft),
            Err(KasseError::InvalidEntry { .. })
        ));
        assert!(store.tail(ChainId::Operational).unwrap().is_none());
    }

    /// Both chains start at genesis and never share a sequence space.
    #[test]
    fn test_chains_are_independent() {
        let store = InMemoryLedgerStore::new();
        store.append(ChainId::Fiscal, sale("op-1", 1)).unwrap();
        let journal = store
            .append(
                ChainId::Operational,
                EntryDraft::operational(EventType::UserLogin, Some(ActorId::new("cashier-1")), json!({})),
            )
            .unwrap();

        assert_eq!(journal.sequence, 0);
        assert_eq!(journal.previous_hash, GENESIS_HASH);
        assert_eq!(journal.chain, ChainId::Operational);
    }

    /// Racing appends on an empty chain still yield one unbroken sequence.
    #[test]
    fn test_concurrent_appends_on_empty_chain() {
        let store = Arc::new(InMemoryLedgerStore::new());
        let handles: Vec<_> = (0..8)
            .map(|worker| {
                let store = Arc::clone(&store);
                thread::spawn(move || {
                    for i in 0..10 {
                        let op = format!("op-{}-{}", worker, i);
                        store.append(ChainId::Fiscal, sale(&op, worker * 100 + i)).unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let entries = store.entries(ChainId::Fiscal).unwrap();
        assert_eq!(entries.len(), 80);
        let genesis_links = entries.iter().filter(|e| e.previous_hash == GENESIS_HASH).count();
        assert_eq!(genesis_links, 1, "exactly one entry may link to genesis");
        for (idx, entry) in entries.iter().enumerate() {
            assert_eq!(entry.sequence, idx as u64);
        }
        assert!(store.verify_chain(ChainId::Fiscal, ChainRange::all()).unwrap().valid);
    }

    /// Mutating a stored entry is detected at that entry.
    #[test]
    fn test_tamper_detection() {
        let store = InMemoryLedgerStore::new();
        for (i, op) in ["op-a", "op-b", "op-c"].iter().enumerate() {
            store.append(ChainId::Fiscal, sale(op, i as u64)).unwrap();
        }

        let tampered_id = {
            let mut state = store.chains[&ChainId::Fiscal].lock().unwrap();
            state.entries[1].payload = json!({ "operation": "op-b", "total_cents": 1 });
            state.entries[1].log_id
        };

        let report = store.verify_chain(ChainId::Fiscal, ChainRange::all()).unwrap();
        assert!(!report.valid);
        let at = report.broken_at.unwrap();
        assert_eq!(at.log_id, tampered_id);
        assert_eq!(at.sequence, 1);
        assert_eq!(at.kind, BreakKind::HashMismatch);
    }

    #[test]
    fn test_tail_tracks_last_append() {
        let store = InMemoryLedgerStore::new();
        assert!(store.tail(ChainId::Fiscal).unwrap().is_none());
        store.append(ChainId::Fiscal, sale("op-1", 1)).unwrap();
        let last = store.append(ChainId::Fiscal, sale("op-2", 2)).unwrap();
        assert_eq!(store.tail(ChainId::Fiscal).unwrap(), Some(last));
    }
}
