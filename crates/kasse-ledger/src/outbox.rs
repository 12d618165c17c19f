//! `OperationStore` backends: the outbox table of pending fiscal operations.
//!
//! Both backends share `OperationTable`, which implements insert-if-absent
//! and revision-checked compare-and-set.
//!
//! `FileOperationStore` keeps two files in its data directory:
//!
//! - `operations.jsonl`: one line per row transition, each the full row
//!   after the change, appended and `sync_data`'d before the change becomes
//!   visible in memory.
//! - `operations.json`: a snapshot of the whole table, written to a
//!   temporary file, fsynced, and renamed over the previous one.
//!
//! Once the journal holds more records than the table has rows (and at least
//! `COMPACT_MIN_RECORDS`), the table is snapshotted and the journal emptied.
//! On open the snapshot is loaded and the journal replayed over it; a record
//! older than the row it would replace is skipped, so a crash between the
//! snapshot and the journal truncation replays harmlessly.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use kasse_contracts::{
    error::{KasseError, KasseResult},
    ids::OperationId,
    operation::{OperationStatus, PendingFiscalOperation},
};
use kasse_core::traits::{CasOutcome, InsertOutcome, OperationStore};

/// Snapshot format version.
const SNAPSHOT_VERSION: u32 = 1;

#[derive(Debug, Clone, Default)]
struct OperationTable {
    rows: HashMap<OperationId, PendingFiscalOperation>,
}

impl OperationTable {
    fn insert_if_absent(&mut self, operation: PendingFiscalOperation) -> InsertOutcome {
        if let Some(existing) = self.rows.get(&operation.operation_id) {
            return InsertOutcome::Existing(existing.clone());
        }
        self.rows.insert(operation.operation_id.clone(), operation.clone());
        InsertOutcome::Created(operation)
    }

    fn compare_and_set(
        &mut self,
        expected_revision: u64,
        mut next: PendingFiscalOperation,
    ) -> KasseResult<CasOutcome> {
        let current = self.rows.get(&next.operation_id).ok_or_else(|| {
            KasseError::OperationNotFound { operation_id: next.operation_id.to_string() }
        })?;
        if current.revision != expected_revision {
            return Ok(CasOutcome::Conflict(current.clone()));
        }
        if current.status == OperationStatus::Committed && next.status != OperationStatus::Committed {
            return Err(KasseError::InvalidTransition {
                operation_id: next.operation_id.to_string(),
                reason: "a committed operation never leaves COMMITTED".to_string(),
            });
        }

        next.revision = expected_revision + 1;
        next.updated_at = Utc::now();
        self.rows.insert(next.operation_id.clone(), next.clone());
        Ok(CasOutcome::Applied(next))
    }

    fn unfinished(&self) -> Vec<PendingFiscalOperation> {
        let mut rows: Vec<_> = self
            .rows
            .values()
            .filter(|r| r.status != OperationStatus::Committed)
            .cloned()
            .collect();
        rows.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.operation_id.as_str().cmp(b.operation_id.as_str()))
        });
        rows
    }
}

fn lock_table<T>(table: &Mutex<T>) -> KasseResult<MutexGuard<'_, T>> {
    table.lock().map_err(|e| KasseError::storage(format!("operation table lock poisoned: {}", e)))
}

// ── In-memory ────────────────────────────────────────────────────────────────

/// The reference outbox: a `HashMap` behind a `Mutex`.
#[derive(Default)]
pub struct InMemoryOperationStore {
    table: Mutex<OperationTable>,
}

impl InMemoryOperationStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl OperationStore for InMemoryOperationStore {
    fn insert_if_absent(&self, operation: PendingFiscalOperation) -> KasseResult<InsertOutcome> {
        Ok(lock_table(&self.table)?.insert_if_absent(operation))
    }

    fn get(&self, operation_id: &OperationId) -> KasseResult<Option<PendingFiscalOperation>> {
        Ok(lock_table(&self.table)?.rows.get(operation_id).cloned())
    }

    fn compare_and_set(
        &self,
        expected_revision: u64,
        next: PendingFiscalOperation,
    ) -> KasseResult<CasOutcome> {
        lock_table(&self.table)?.compare_and_set(expected_revision, next)
    }

    fn list_unfinished(&self) -> KasseResult<Vec<PendingFiscalOperation>> {
        Ok(lock_table(&self.table)?.unfinished())
    }
}

// ── Journal and snapshot files ───────────────────────────────────────────────

#[derive(Serialize, Deserialize)]
struct Snapshot {
    version: u32,
    written_at: chrono::DateTime<Utc>,
    operations: Vec<PendingFiscalOperation>,
}

/// Journal records written before a compaction is considered.
pub const COMPACT_MIN_RECORDS: usize = 256;

/// A row change staged in memory, with what to restore if it cannot be
/// made durable.
struct Change {
    row: PendingFiscalOperation,
    previous: Option<PendingFiscalOperation>,
}

/// The append-only transition log.
struct Journal {
    path: PathBuf,
    file: File,
    /// Length after the last durable record.
    len: u64,
    /// Records since the last compaction.
    records: usize,
    /// Set when a failed append could not be rolled back.
    fenced: Option<String>,
}

impl Journal {
    /// Open the journal and return it with every complete record in order.
    fn open(path: PathBuf) -> KasseResult<(Self, Vec<PendingFiscalOperation>)> {
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&path)
            .map_err(|e| io_fault(&path, "open", e))?;

        let mut raw = String::new();
        file.read_to_string(&mut raw).map_err(|e| io_fault(&path, "read", e))?;

        let complete = raw.rfind('\n').map(|idx| idx + 1).unwrap_or(0);
        if complete < raw.len() {
            warn!(
                path = %path.display(),
                discarded_bytes = raw.len() - complete,
                "discarding torn final journal record"
            );
            file.set_len(complete as u64).map_err(|e| io_fault(&path, "truncate", e))?;
            file.sync_data().map_err(|e| io_fault(&path, "sync", e))?;
        }

        let mut rows = Vec::new();
        for (line_no, line) in raw[..complete].lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let row: PendingFiscalOperation = serde_json::from_str(line).map_err(|e| {
                KasseError::storage(format!(
                    "{}: line {} is not an operation record: {}",
                    path.display(),
                    line_no + 1,
                    e
                ))
            })?;
            rows.push(row);
        }

        let journal = Self { path, file, len: complete as u64, records: rows.len(), fenced: None };
        Ok((journal, rows))
    }

    fn append(&mut self, row: &PendingFiscalOperation) -> KasseResult<()> {
        if let Some(reason) = &self.fenced {
            return Err(KasseError::storage(format!(
                "{} refuses writes until reopened: {}",
                self.path.display(),
                reason
            )));
        }

        let mut line = serde_json::to_vec(row)?;
        line.push(b'\n');

        if let Err(e) = self.file.write_all(&line).and_then(|()| self.file.sync_data()) {
            if let Err(truncate_err) = self.file.set_len(self.len) {
                error!(
                    path = %self.path.display(),
                    error = %truncate_err,
                    "could not roll back failed journal write; journal fenced"
                );
                self.fenced = Some(format!("rollback after failed write failed: {}", truncate_err));
            }
            return Err(io_fault(&self.path, "append to", e));
        }
        self.len += line.len() as u64;
        self.records += 1;
        Ok(())
    }

    /// Drop every record; the caller has made them durable elsewhere.
    fn clear(&mut self) -> KasseResult<()> {
        self.file.set_len(0).map_err(|e| io_fault(&self.path, "truncate", e))?;
        self.file.sync_data().map_err(|e| io_fault(&self.path, "sync", e))?;
        self.len = 0;
        self.records = 0;
        Ok(())
    }
}

struct FileState {
    table: OperationTable,
    journal: Journal,
}

/// A durable outbox persisted under a data directory as a snapshot plus a
/// transition journal.
pub struct FileOperationStore {
    path: PathBuf,
    state: Mutex<FileState>,
}

impl FileOperationStore {
    pub const FILE_NAME: &'static str = "operations.json";
    pub const JOURNAL_NAME: &'static str = "operations.jsonl";

    /// Open (or create) the store under `dir`.
    ///
    /// A leftover temporary file from an interrupted snapshot is removed; the
    /// previous snapshot is still intact.
    pub fn open(dir: impl AsRef<Path>) -> KasseResult<Self> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir).map_err(|e| io_fault(dir, "create", e))?;
        let path = dir.join(Self::FILE_NAME);
        let _ = fs::remove_file(tmp_path(&path));

        let mut table = OperationTable::default();
        if path.exists() {
            let data = fs::read(&path).map_err(|e| io_fault(&path, "read", e))?;
            let snapshot: Snapshot = serde_json::from_slice(&data)?;
            if snapshot.version != SNAPSHOT_VERSION {
                return Err(KasseError::storage(format!(
                    "{}: snapshot version {} is not supported (expected {})",
                    path.display(),
                    snapshot.version,
                    SNAPSHOT_VERSION
                )));
            }
            for row in snapshot.operations {
                table.rows.insert(row.operation_id.clone(), row);
            }
        }

        let (journal, records) = Journal::open(dir.join(Self::JOURNAL_NAME))?;
        let replayed = records.len();
        for row in records {
            let stale = table
                .rows
                .get(&row.operation_id)
                .is_some_and(|current| current.revision > row.revision);
            if !stale {
                table.rows.insert(row.operation_id.clone(), row);
            }
        }

        info!(
            path = %path.display(),
            operations = table.rows.len(),
            replayed,
            "operation store opened"
        );
        Ok(Self { path, state: Mutex::new(FileState { table, journal }) })
    }

    /// Path of the snapshot file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Path of the transition journal.
    pub fn journal_path(&self) -> PathBuf {
        self.path.with_file_name(Self::JOURNAL_NAME)
    }

    /// Apply `mutate` to the table, journal the changed row, and roll the
    /// change back if the journal write fails.
    fn mutate<R>(
        &self,
        mutate: impl FnOnce(&mut OperationTable) -> KasseResult<(R, Option<Change>)>,
    ) -> KasseResult<R> {
        let mut guard = lock_table(&self.state)?;
        let state = &mut *guard;
        let (result, change) = mutate(&mut state.table)?;
        let Some(change) = change else {
            return Ok(result);
        };

        if let Err(e) = state.journal.append(&change.row) {
            match change.previous {
                Some(previous) => state.table.rows.insert(previous.operation_id.clone(), previous),
                None => state.table.rows.remove(&change.row.operation_id),
            };
            return Err(e);
        }

        if state.journal.records >= COMPACT_MIN_RECORDS.max(state.table.rows.len()) {
            // The journal stays authoritative until the snapshot is durable.
            if let Err(e) = self.compact(state) {
                warn!(path = %self.path.display(), error = %e, "operation journal compaction failed");
            }
        }
        Ok(result)
    }

    fn compact(&self, state: &mut FileState) -> KasseResult<()> {
        self.write_snapshot(&state.table)?;
        let records = state.journal.records;
        state.journal.clear()?;
        debug!(path = %self.path.display(), rows = state.table.rows.len(), records, "operation journal compacted");
        Ok(())
    }

    fn write_snapshot(&self, table: &OperationTable) -> KasseResult<()> {
        let mut operations: Vec<_> = table.rows.values().cloned().collect();
        operations.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        let snapshot = Snapshot { version: SNAPSHOT_VERSION, written_at: Utc::now(), operations };
        let data = serde_json::to_vec(&snapshot)?;

        let tmp = tmp_path(&self.path);
        let write = || -> std::io::Result<()> {
            let mut file = File::create(&tmp)?;
            file.write_all(&data)?;
            file.sync_all()?;
            fs::rename(&tmp, &self.path)?;
            #[cfg(unix)]
            {
                if let Some(dir) = self.path.parent() {
                    if let Ok(dir) = File::open(dir) {
                        let _ = dir.sync_all();
                    }
                }
            }
            Ok(())
        };
        write().map_err(|e| io_fault(&self.path, "write", e))
    }
}

fn tmp_path(path: &Path) -> PathBuf {
    path.with_extension("json.tmp")
}

fn io_fault(path: &Path, action: &str, e: std::io::Error) -> KasseError {
    KasseError::storage(format!("{} {}: {}", action, path.display(), e))
}

impl OperationStore for FileOperationStore {
    fn insert_if_absent(&self, operation: PendingFiscalOperation) -> KasseResult<InsertOutcome> {
        self.mutate(|table| {
            let outcome = table.insert_if_absent(operation);
            let change = match &outcome {
                InsertOutcome::Created(row) => Some(Change { row: row.clone(), previous: None }),
                InsertOutcome::Existing(_) => None,
            };
            Ok((outcome, change))
        })
    }

    fn get(&self, operation_id: &OperationId) -> KasseResult<Option<PendingFiscalOperation>> {
        Ok(lock_table(&self.state)?.table.rows.get(operation_id).cloned())
    }

    fn compare_and_set(
        &self,
        expected_revision: u64,
        next: PendingFiscalOperation,
    ) -> KasseResult<CasOutcome> {
        self.mutate(|table| {
            let previous = table.rows.get(&next.operation_id).cloned();
            let outcome = table.compare_and_set(expected_revision, next)?;
            let change = match &outcome {
                CasOutcome::Applied(row) => Some(Change { row: row.clone(), previous }),
                CasOutcome::Conflict(_) => None,
            };
            Ok((outcome, change))
        })
    }

    fn list_unfinished(&self) -> KasseResult<Vec<PendingFiscalOperation>> {
        Ok(lock_table(&self.state)?.table.unfinished())
    }
}
