//! JSON-lines implementation of `LedgerStore`.
//!
//! One `<chain>.jsonl` file per chain inside a data directory, one entry per
//! line.  Every append is written and `sync_data`'d before it becomes
//! visible; a failed write truncates the file back to where it was.
//!
//! On open every complete line is loaded.  A final line without a trailing
//! newline is a torn write from a crash: it is discarded with a warning and
//! cut from the file.  A complete line that does not parse is a storage
//! fault; the store never guesses.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tracing::{debug, error, info, warn};

use kasse_contracts::{
    error::{KasseError, KasseResult},
    ids::{ChainId, OperationId},
    ledger::{ChainRange, ChainVerification, EntryDraft, LedgerEntry},
};
use kasse_core::traits::LedgerStore;

use crate::{
    chain::verify_entries,
    state::{lock_chain, ChainState, Prepared},
};

struct FileChain {
    state: ChainState,
    file: File,
    /// Length of the file after the last successful append.
    len: u64,
    /// Set when a failed write could not be rolled back.  The file may end
    /// in a partial line, so no further appends are accepted until reopen.
    fenced: Option<String>,
}

impl FileChain {
    fn open(dir: &Path, chain: ChainId) -> KasseResult<Self> {
        let path = chain_path(dir, chain);
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&path)
            .map_err(|e| io_fault(&path, "open", e))?;

        let mut raw = String::new();
        file.read_to_string(&mut raw).map_err(|e| io_fault(&path, "read", e))?;

        let complete = match raw.rfind('\n') {
            Some(idx) => idx + 1,
            None => 0,
        };
        if complete < raw.len() {
            warn!(
                chain = %chain,
                path = %path.display(),
                discarded_bytes = raw.len() - complete,
                "discarding torn final ledger line"
            );
            file.set_len(complete as u64).map_err(|e| io_fault(&path, "truncate", e))?;
            file.sync_data().map_err(|e| io_fault(&path, "sync", e))?;
        }

        let mut entries = Vec::new();
        for (line_no, line) in raw[..complete].lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let entry: LedgerEntry = serde_json::from_str(line).map_err(|e| {
                KasseError::storage(format!(
                    "{}: line {} is not a ledger entry: {}",
                    path.display(),
                    line_no + 1,
                    e
                ))
            })?;
            entries.push(entry);
        }

        debug!(chain = %chain, entries = entries.len(), "ledger chain loaded");
        Ok(Self {
            state: ChainState::from_entries(chain, entries),
            file,
            len: complete as u64,
            fenced: None,
        })
    }

    fn write_line(&mut self, entry: &LedgerEntry) -> KasseResult<()> {
        if let Some(reason) = &self.fenced {
            return Err(KasseError::storage(format!(
                "chain '{}' refuses appends until reopened: {}",
                self.state.chain, reason
            )));
        }

        let mut line = serde_json::to_vec(entry)?;
        line.push(b'\n');

        let written = self.file.write_all(&line).and_then(|()| self.file.sync_data());
        if let Err(e) = written {
            // Leave no partial line behind for the next open to trip over.
            if let Err(truncate_err) = self.file.set_len(self.len) {
                error!(
                    chain = %self.state.chain,
                    error = %truncate_err,
                    "could not roll back failed ledger write; chain fenced"
                );
                self.fenced = Some(format!("rollback after failed write failed: {}", truncate_err));
            }
            return Err(KasseError::storage(format!(
                "append to chain '{}' failed: {}",
                self.state.chain, e
            )));
        }
        self.len += line.len() as u64;
        Ok(())
    }
}

fn chain_path(dir: &Path, chain: ChainId) -> PathBuf {
    dir.join(format!("{}.jsonl", chain.as_str()))
}

fn io_fault(path: &Path, action: &str, e: std::io::Error) -> KasseError {
    KasseError::storage(format!("{} {}: {}", action, path.display(), e))
}

/// A durable ledger backed by one JSON-lines file per chain.
pub struct JsonlLedgerStore {
    dir: PathBuf,
    chains: HashMap<ChainId, Mutex<FileChain>>,
}

impl JsonlLedgerStore {
    /// Open (or create) the ledger files under `dir`.
    pub fn open(dir: impl AsRef<Path>) -> KasseResult<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir).map_err(|e| io_fault(&dir, "create", e))?;

        let mut chains = HashMap::new();
        for chain in ChainId::ALL {
            chains.insert(chain, Mutex::new(FileChain::open(&dir, chain)?));
        }

        info!(dir = %dir.display(), "ledger opened");
        Ok(Self { dir, chains })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the file backing `chain`.
    pub fn chain_file(&self, chain: ChainId) -> PathBuf {
        chain_path(&self.dir, chain)
    }
}

impl LedgerStore for JsonlLedgerStore {
    fn append(&self, chain: ChainId, draft: EntryDraft) -> KasseResult<LedgerEntry> {
        let mut guard = lock_chain(&self.chains, chain)?;
        let entry = match guard.state.prepare(draft)? {
            Prepared::Existing(entry) => return Ok(entry),
            Prepared::New(entry) => entry,
        };

        guard.write_line(&entry)?;
        debug!(chain = %chain, sequence = entry.sequence, hash = %entry.current_hash, "ledger entry persisted");
        guard.state.push(entry.clone());
        Ok(entry)
    }

    fn verify_chain(&self, chain: ChainId, range: ChainRange) -> KasseResult<ChainVerification> {
        let guard = lock_chain(&self.chains, chain)?;
        Ok(verify_entries(chain, &guard.state.entries, range))
    }

    fn tail(&self, chain: ChainId) -> KasseResult<Option<LedgerEntry>> {
        Ok(lock_chain(&self.chains, chain)?.state.tail().cloned())
    }

    fn entries(&self, chain: ChainId) -> KasseResult<Vec<LedgerEntry>> {
        Ok(lock_chain(&self.chains, chain)?.state.entries.clone())
    }

    fn find_by_operation(
        &self,
        chain: ChainId,
        operation_id: &OperationId,
    ) -> KasseResult<Option<LedgerEntry>> {
        Ok(lock_chain(&self.chains, chain)?.state.find_by_operation(operation_id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use std::fs::{self, File, OpenOptions};
    use std::io::Write;

    use chrono::Utc;
    use serde_json::json;
    use tempfile::TempDir;

    use kasse_contracts::{
        error::KasseError,
        ids::{ChainId, OperationId},
        ledger::{BreakKind, ChainRange, EntryDraft, EventType},
    };
    use kasse_core::traits::LedgerStore;

    use super::JsonlLedgerStore;

    fn sale(op: &str, number: u64) -> EntryDraft {
        EntryDraft {
            event_type: EventType::TransactionClosed,
            timestamp_utc: Utc::now(),
            actor_id: None,
            payload: json!({ "operation": op, "total_cents": 250 }),
            device_response: json!({ "signature": format!("sig-{}", op) }),
            transaction_number: Some(number),
            operation_id: Some(OperationId::new(op)),
        }
    }

    #[test]
    fn test_reopen_preserves_chain() {
        let dir = TempDir::new().unwrap();
        let tail = {
            let store = JsonlLedgerStore::open(dir.path()).unwrap();
            store.append(ChainId::Fiscal, sale("op-1", 1)).unwrap();
            store.append(ChainId::Fiscal, sale("op-2", 2)).unwrap()
        };

        let store = JsonlLedgerStore::open(dir.path()).unwrap();
        assert_eq!(store.tail(ChainId::Fiscal).unwrap(), Some(tail.clone()));

        let next = store.append(ChainId::Fiscal, sale("op-3", 3)).unwrap();
        assert_eq!(next.sequence, 2);
        assert_eq!(next.previous_hash, tail.current_hash);
        assert!(store.verify_chain(ChainId::Fiscal, ChainRange::all()).unwrap().valid);

        // Idempotency survives a restart too.
        let again = store.append(ChainId::Fiscal, sale("op-1", 1)).unwrap();
        assert_eq!(again.sequence, 0);
        assert_eq!(store.entries(ChainId::Fiscal).unwrap().len(), 3);
    }

    #[test]
    fn test_one_file_per_chain() {
        let dir = TempDir::new().unwrap();
        let store = JsonlLedgerStore::open(dir.path()).unwrap();
        store.append(ChainId::Fiscal, sale("op-1", 1)).unwrap();
        store
            .append(
                ChainId::Operational,
                EntryDraft::operational(EventType::DailyClosing, None, json!({ "day": "2026-03-01" })),
            )
            .unwrap();

        let fiscal = fs::read_to_string(store.chain_file(ChainId::Fiscal)).unwrap();
        let operational = fs::read_to_string(store.chain_file(ChainId::Operational)).unwrap();
        assert_eq!(fiscal.lines().count(), 1);
        assert_eq!(operational.lines().count(), 1);
        assert!(store.chain_file(ChainId::Fiscal).ends_with("fiscal.jsonl"));
    }

    /// A half-written final line is dropped on open and the chain stays valid.
    #[test]
    fn test_torn_final_line_is_discarded() {
        let dir = TempDir::new().unwrap();
        let path = {
            let store = JsonlLedgerStore::open(dir.path()).unwrap();
            store.append(ChainId::Fiscal, sale("op-1", 1)).unwrap();
            store.chain_file(ChainId::Fiscal)
        };
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(br#"{"log_id":"5b1c"#).unwrap();
        drop(file);

        let store = JsonlLedgerStore::open(dir.path()).unwrap();
        assert_eq!(store.entries(ChainId::Fiscal).unwrap().len(), 1);
        let next = store.append(ChainId::Fiscal, sale("op-2", 2)).unwrap();
        assert_eq!(next.sequence, 1);

        let contents = fs::read_to_string(&path).unwrap();
        assert_eq!(contents.lines().count(), 2);
        assert!(store.verify_chain(ChainId::Fiscal, ChainRange::all()).unwrap().valid);
    }

    /// A write whose rollback also fails fences the chain until reopen.
    #[test]
    fn test_failed_rollback_fences_chain() {
        let dir = TempDir::new().unwrap();
        let store = JsonlLedgerStore::open(dir.path()).unwrap();
        store.append(ChainId::Fiscal, sale("op-1", 1)).unwrap();
        let path = store.chain_file(ChainId::Fiscal);

        // A read-only handle fails both the write and the truncate.
        store.chains[&ChainId::Fiscal].lock().unwrap().file = File::open(&path).unwrap();
        assert!(matches!(
            store.append(ChainId::Fiscal, sale("op-2", 2)),
            Err(KasseError::StorageFault { .. })
        ));

        store.chains[&ChainId::Fiscal].lock().unwrap().file =
            OpenOptions::new().read(true).append(true).open(&path).unwrap();
        match store.append(ChainId::Fiscal, sale("op-2", 2)) {
            Err(KasseError::StorageFault { reason }) => assert!(reason.contains("until reopened")),
            other => panic!("expected a fenced chain, got {:?}", other),
        }
        assert_eq!(store.entries(ChainId::Fiscal).unwrap().len(), 1);

        // Other chains keep working.
        store
            .append(ChainId::Operational, EntryDraft::operational(EventType::UserLogin, None, json!({})))
            .unwrap();

        drop(store);
        let store = JsonlLedgerStore::open(dir.path()).unwrap();
        let next = store.append(ChainId::Fiscal, sale("op-2", 2)).unwrap();
        assert_eq!(next.sequence, 1);
        assert!(store.verify_chain(ChainId::Fiscal, ChainRange::all()).unwrap().valid);
    }

    #[test]
    fn test_malformed_complete_line_is_a_storage_fault() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("fiscal.jsonl"), "not json\n").unwrap();
        assert!(matches!(JsonlLedgerStore::open(dir.path()), Err(KasseError::StorageFault { .. })));
    }

    /// Editing a line on disk is caught on the next verification.
    #[test]
    fn test_tampered_file_fails_verification() {
        let dir = TempDir::new().unwrap();
        let path = {
            let store = JsonlLedgerStore::open(dir.path()).unwrap();
            for n in 1..=3 {
                store.append(ChainId::Fiscal, sale(&format!("op-{}", n), n)).unwrap();
            }
            store.chain_file(ChainId::Fiscal)
        };

        let contents = fs::read_to_string(&path).unwrap();
        let tampered: Vec<String> = contents
            .lines()
            .enumerate()
            .map(|(i, line)| {
                if i == 1 {
                    line.replace("\"total_cents\":250", "\"total_cents\":25")
                } else {
                    line.to_string()
                }
            })
            .collect();
        fs::write(&path, tampered.join("\n") + "\n").unwrap();

        let store = JsonlLedgerStore::open(dir.path()).unwrap();
        let report = store.verify_chain(ChainId::Fiscal, ChainRange::all()).unwrap();
        assert!(!report.valid);
        let at = report.broken_at.unwrap();
        assert_eq!(at.sequence, 1);
        assert_eq!(at.kind, BreakKind::HashMismatch);
    }
}
