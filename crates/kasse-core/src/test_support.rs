//! Hand-written mocks shared by the coordinator and resolution tests.

use std::{
    collections::{HashMap, VecDeque},
    sync::{
        atomic::{AtomicU32, AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use async_trait::async_trait;
use chrono::Utc;

use kasse_contracts::{
    device::{DeviceFailure, SignOutcome},
    error::{KasseError, KasseResult},
    ids::{ChainId, LogId, OperationId, TransactionRef},
    ledger::{ChainRange, ChainVerification, EntryDraft, EventType, LedgerEntry},
    operation::{FiscalRequest, OperationStatus, PendingFiscalOperation, ResolutionState},
};

use crate::{
    settings::CoordinatorSettings,
    traits::{
        CasOutcome, InsertOutcome, LedgerStore, OperationStore, RetryDecision, RetryPolicy,
        SigningGateway, TransactionBook,
    },
    Coordinator,
};

// ── Ledger ───────────────────────────────────────────────────────────────────

/// A ledger that records appends without hashing and can be told to fail.
#[derive(Default)]
pub struct MockLedger {
    pub chains: Mutex<HashMap<ChainId, Vec<LedgerEntry>>>,
    /// Number of upcoming fiscal appends that fail with a storage fault.
    pub fail_fiscal_appends: AtomicU32,
    pub append_calls: AtomicUsize,
}

impl MockLedger {
    pub fn entries_of(&self, chain: ChainId) -> Vec<LedgerEntry> {
        self.chains.lock().unwrap().get(&chain).cloned().unwrap_or_default()
    }
}

impl LedgerStore for MockLedger {
    fn append(&self, chain: ChainId, draft: EntryDraft) -> KasseResult<LedgerEntry> {
        self.append_calls.fetch_add(1, Ordering::SeqCst);
        if chain == ChainId::Fiscal
            && self
                .fail_fiscal_appends
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
        {
            return Err(KasseError::storage("simulated disk failure"));
        }

        let mut chains = self.chains.lock().unwrap();
        let entries = chains.entry(chain).or_default();
        if let Some(id) = &draft.operation_id {
            if let Some(existing) = entries.iter().find(|e| e.operation_id.as_ref() == Some(id)) {
                return Ok(existing.clone());
            }
        }
        let sequence = entries.len() as u64;
        let previous_hash = entries
            .last()
            .map(|e| e.current_hash.clone())
            .unwrap_or_else(|| "0".repeat(64));
        let entry = LedgerEntry {
            log_id: LogId::new(),
            chain,
            sequence,
            timestamp_utc: draft.timestamp_utc,
            event_type: draft.event_type,
            transaction_number: draft.transaction_number,
            actor_id: draft.actor_id,
            operation_id: draft.operation_id,
            payload: draft.payload,
            device_response: draft.device_response,
            canonical_version: 1,
            previous_hash,
            current_hash: format!("{:064x}", sequence + 1),
        };
        entries.push(entry.clone());
        Ok(entry)
    }

    fn verify_chain(&self, chain: ChainId, _range: ChainRange) -> KasseResult<ChainVerification> {
        Ok(ChainVerification::intact(chain, self.entries_of(chain).len() as u64))
    }

    fn tail(&self, chain: ChainId) -> KasseResult<Option<LedgerEntry>> {
        Ok(self.entries_of(chain).last().cloned())
    }

    fn entries(&self, chain: ChainId) -> KasseResult<Vec<LedgerEntry>> {
        Ok(self.entries_of(chain))
    }

    fn find_by_operation(
        &self,
        chain: ChainId,
        operation_id: &OperationId,
    ) -> KasseResult<Option<LedgerEntry>> {
        Ok(self
            .entries_of(chain)
            .into_iter()
            .find(|e| e.operation_id.as_ref() == Some(operation_id)))
    }
}

// ── Operations ───────────────────────────────────────────────────────────────

#[derive(Default)]
pub struct MockOperations {
    pub rows: Mutex<HashMap<OperationId, PendingFiscalOperation>>,
}

impl MockOperations {
    /// Seed a row directly, as if left behind by a crashed process.
    pub fn seed(&self, row: PendingFiscalOperation) {
        self.rows.lock().unwrap().insert(row.operation_id.clone(), row);
    }

    pub fn get_row(&self, id: &str) -> PendingFiscalOperation {
        self.rows.lock().unwrap()[&OperationId::new(id)].clone()
    }
}

impl OperationStore for MockOperations {
    fn insert_if_absent(&self, operation: PendingFiscalOperation) -> KasseResult<InsertOutcome> {
        let mut rows = self.rows.lock().unwrap();
        if let Some(existing) = rows.get(&operation.operation_id) {
            return Ok(InsertOutcome::Existing(existing.clone()));
        }
        rows.insert(operation.operation_id.clone(), operation.clone());
        Ok(InsertOutcome::Created(operation))
    }

    fn get(&self, operation_id: &OperationId) -> KasseResult<Option<PendingFiscalOperation>> {
        Ok(self.rows.lock().unwrap().get(operation_id).cloned())
    }

    fn compare_and_set(
        &self,
        expected_revision: u64,
        mut next: PendingFiscalOperation,
    ) -> KasseResult<CasOutcome> {
        let mut rows = self.rows.lock().unwrap();
        let current = rows.get(&next.operation_id).cloned().ok_or_else(|| {
            KasseError::OperationNotFound { operation_id: next.operation_id.to_string() }
        })?;
        if current.revision != expected_revision {
            return Ok(CasOutcome::Conflict(current));
        }
        next.revision = expected_revision + 1;
        next.updated_at = Utc::now();
        rows.insert(next.operation_id.clone(), next.clone());
        Ok(CasOutcome::Applied(next))
    }

    fn list_unfinished(&self) -> KasseResult<Vec<PendingFiscalOperation>> {
        let mut rows: Vec<_> = self
            .rows
            .lock()
            .unwrap()
            .values()
            .filter(|r| r.status != OperationStatus::Committed)
            .cloned()
            .collect();
        rows.sort_by_key(|r| r.created_at);
        Ok(rows)
    }
}

// ── Gateway ──────────────────────────────────────────────────────────────────

/// A gateway that replays scripted outcomes and counts calls.
///
/// When the script runs dry every further call is accepted.
pub struct ScriptedGateway {
    pub script: Mutex<VecDeque<SignOutcome>>,
    pub calls: AtomicUsize,
    pub delay: Duration,
}

impl ScriptedGateway {
    pub fn new(script: Vec<SignOutcome>) -> Self {
        Self { script: Mutex::new(script.into()), calls: AtomicUsize::new(0), delay: Duration::ZERO }
    }

    pub fn slow(script: Vec<SignOutcome>, delay: Duration) -> Self {
        Self { delay, ..Self::new(script) }
    }

    pub fn push(&self, outcome: SignOutcome) {
        self.script.lock().unwrap().push_back(outcome);
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SigningGateway for ScriptedGateway {
    async fn sign(&self, operation_id: &OperationId, _payload: &serde_json::Value) -> SignOutcome {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let scripted = self.script.lock().unwrap().pop_front();
        scripted.unwrap_or_else(|| {
            SignOutcome::accepted(
                serde_json::json!({ "signature": format!("sig-{}-{}", operation_id, call) }),
                Some(call as u64),
            )
        })
    }
}

// ── Book and policy ──────────────────────────────────────────────────────────

#[derive(Default)]
pub struct MockBook {
    pub states: Mutex<HashMap<TransactionRef, ResolutionState>>,
}

impl TransactionBook for MockBook {
    fn resolution(&self, transaction: &TransactionRef) -> KasseResult<ResolutionState> {
        Ok(self.states.lock().unwrap().get(transaction).copied().unwrap_or_default())
    }

    fn set_resolution(
        &self,
        transaction: &TransactionRef,
        state: ResolutionState,
    ) -> KasseResult<()> {
        self.states.lock().unwrap().insert(transaction.clone(), state);
        Ok(())
    }
}

/// Escalates once `max_retries` failures have been recorded.
pub struct FixedPolicy {
    pub max_retries: u32,
    pub delay: Duration,
}

impl RetryPolicy for FixedPolicy {
    fn decide(&self, retry_count: u32, failure: &DeviceFailure) -> RetryDecision {
        if retry_count >= self.max_retries {
            RetryDecision::Escalate {
                reason: format!("retries exhausted after {}: {}", retry_count, failure.reason),
            }
        } else {
            RetryDecision::RetryAfter(self.delay)
        }
    }
}

// ── Harness ──────────────────────────────────────────────────────────────────

/// All mocks plus a coordinator wired over them.
pub struct Harness {
    pub ledger: Arc<MockLedger>,
    pub operations: Arc<MockOperations>,
    pub gateway: Arc<ScriptedGateway>,
    pub book: Arc<MockBook>,
    pub coordinator: Coordinator,
}

impl Harness {
    pub fn new(gateway: ScriptedGateway) -> Self {
        Self::with(Arc::new(MockLedger::default()), Arc::new(MockOperations::default()), gateway)
    }

    /// A fresh coordinator over existing stores: a process restart.
    pub fn with(
        ledger: Arc<MockLedger>,
        operations: Arc<MockOperations>,
        gateway: ScriptedGateway,
    ) -> Self {
        let gateway = Arc::new(gateway);
        let book = Arc::new(MockBook::default());
        let settings = CoordinatorSettings {
            device_timeout: Duration::from_millis(100),
            ..CoordinatorSettings::default()
        };
        let coordinator = Coordinator::new(
            ledger.clone(),
            operations.clone(),
            gateway.clone(),
            book.clone(),
            Arc::new(FixedPolicy { max_retries: 3, delay: Duration::from_millis(1) }),
            settings,
        );
        Self { ledger, operations, gateway, book, coordinator }
    }
}

pub fn sale(id: &str) -> FiscalRequest {
    FiscalRequest {
        operation_id: OperationId::new(id),
        transaction_ref: TransactionRef::new(format!("tx-{}", id)),
        event_type: EventType::TransactionClosed,
        actor_id: None,
        payload_for_device: serde_json::json!({ "operation": id, "total_cents": 1990 }),
    }
}
