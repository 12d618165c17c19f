//! Per-chain mutable state shared by every ledger backend.
//!
//! A backend holds one `ChainState` per `ChainId` behind its own mutex.
//! Appending is split in two so that durable backends can persist the new
//! entry between `prepare` and `push`: if persisting fails, nothing in
//! memory has changed.

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};

use kasse_contracts::{
    error::{KasseError, KasseResult},
    ids::{ChainId, LogId, OperationId},
    ledger::{EntryDraft, LedgerEntry},
};

use crate::chain::{self, EntryFields, CANONICAL_VERSION, GENESIS_HASH};

/// What `prepare` decided for a draft.
pub(crate) enum Prepared {
    /// The draft's operation already has this entry; write nothing.
    Existing(LedgerEntry),
    /// A fully linked and hashed entry ready to be persisted.
    New(LedgerEntry),
}

pub(crate) struct ChainState {
    pub(crate) chain: ChainId,
    /// All entries, in sequence order.
    pub(crate) entries: Vec<LedgerEntry>,
    by_operation: HashMap<OperationId, usize>,
    hashes: HashSet<String>,
}

impl ChainState {
    pub(crate) fn new(chain: ChainId) -> Self {
        Self { chain, entries: Vec::new(), by_operation: HashMap::new(), hashes: HashSet::new() }
    }

    /// Rebuild the indexes over entries loaded from storage.
    ///
    /// Loading never verifies; that is `verify_chain`'s job.
    pub(crate) fn from_entries(chain: ChainId, entries: Vec<LedgerEntry>) -> Self {
        let mut state = Self::new(chain);
        for entry in entries {
            state.push(entry);
        }
        state
    }

    pub(crate) fn tail(&self) -> Option<&LedgerEntry> {
        self.entries.last()
    }

    pub(crate) fn find_by_operation(&self, operation_id: &OperationId) -> Option<&LedgerEntry> {
        self.by_operation.get(operation_id).and_then(|&idx| self.entries.get(idx))
    }

    /// Link and hash `draft` against the current tail without storing it.
    pub(crate) fn prepare(&self, draft: EntryDraft) -> KasseResult<Prepared> {
        if draft.transaction_number.is_some() && !self.chain.carries_transaction_numbers() {
            return Err(KasseError::InvalidEntry {
                chain: self.chain.to_string(),
                reason: "only the fiscal chain carries transaction numbers".to_string(),
            });
        }

        if let Some(existing) = draft.operation_id.as_ref().and_then(|id| self.find_by_operation(id)) {
            return Ok(Prepared::Existing(existing.clone()));
        }

        let tail = self.tail();
        let sequence = self.entries.len() as u64;
        let previous_hash = tail.map_or(GENESIS_HASH, |t| t.current_hash.as_str()).to_string();

        // Wall clocks may step backwards; the chain never does.
        let mut timestamp_utc = chain::canonical_timestamp(draft.timestamp_utc);
        if let Some(tail) = tail {
            if timestamp_utc < tail.timestamp_utc {
                timestamp_utc = tail.timestamp_utc;
            }
        }

        let mut entry = LedgerEntry {
            log_id: LogId::new(),
            chain: self.chain,
            sequence,
            timestamp_utc,
            event_type: draft.event_type,
            transaction_number: draft.transaction_number,
            actor_id: draft.actor_id,
            operation_id: draft.operation_id,
            payload: draft.payload,
            device_response: draft.device_response,
            canonical_version: CANONICAL_VERSION,
            previous_hash,
            current_hash: String::new(),
        };
        entry.current_hash = chain::compute(&entry.previous_hash, &EntryFields::of(&entry))?;

        if self.hashes.contains(&entry.current_hash) {
            return Err(KasseError::Integrity {
                chain: self.chain.to_string(),
                reason: format!("hash collision at sequence {}", sequence),
            });
        }

        Ok(Prepared::New(entry))
    }

    pub(crate) fn push(&mut self, entry: LedgerEntry) {
        if let Some(id) = &entry.operation_id {
            self.by_operation.entry(id.clone()).or_insert(self.entries.len());
        }
        self.hashes.insert(entry.current_hash.clone());
        self.entries.push(entry);
    }
}

/// Lock one chain, mapping poisoning to a storage fault.
pub(crate) fn lock_chain<'a, T>(
    chains: &'a HashMap<ChainId, Mutex<T>>,
    chain: ChainId,
) -> KasseResult<MutexGuard<'a, T>> {
    chains
        .get(&chain)
        .ok_or_else(|| KasseError::storage(format!("chain '{}' is not managed by this store", chain)))?
        .lock()
        .map_err(|e| KasseError::storage(format!("chain '{}' lock poisoned: {}", chain, e)))
}
