//! Wiring of a single POS terminal: ledger, outbox, device, book, policy.

use std::path::Path;
use std::sync::Arc;

use serde_json::Value;
use tracing::info;

use kasse_contracts::{
    error::KasseResult,
    ids::{ActorId, ChainId, OperationId},
    ledger::{ChainRange, ChainVerification, EntryDraft, EventType, LedgerEntry},
    operation::{PendingFiscalOperation, Submission},
};
use kasse_core::{
    traits::{LedgerStore, OperationStore},
    Coordinator, RecoveryReport, ResolutionSurface,
};
use kasse_ledger::{FileOperationStore, InMemoryLedgerStore, InMemoryOperationStore, JsonlLedgerStore};
use kasse_policy::TomlRetryPolicy;

use crate::{book::InMemoryTransactionBook, device::SimulatedTse, sales::Sale};

/// Production defaults shipped with the terminal.
pub const DEFAULT_POLICY: &str = include_str!("../policies/default.toml");

/// Short timings used by the scenarios.
pub const DEMO_POLICY: &str = include_str!("../policies/demo.toml");

pub fn demo_policy() -> KasseResult<TomlRetryPolicy> {
    TomlRetryPolicy::from_toml_str(DEMO_POLICY)
}

/// One terminal's fiscal stack.
///
/// The device and the book are held by concrete type so scenarios can
/// script outages and inspect cases; stores are held behind the traits.
pub struct PosRuntime {
    ledger: Arc<dyn LedgerStore>,
    device: Arc<SimulatedTse>,
    book: Arc<InMemoryTransactionBook>,
    coordinator: Coordinator,
    resolution: ResolutionSurface,
}

impl PosRuntime {
    pub fn new(
        ledger: Arc<dyn LedgerStore>,
        operations: Arc<dyn OperationStore>,
        device: Arc<SimulatedTse>,
        book: Arc<InMemoryTransactionBook>,
        policy: &TomlRetryPolicy,
    ) -> Self {
        let coordinator = Coordinator::new(
            Arc::clone(&ledger),
            operations,
            device.clone(),
            book.clone(),
            Arc::new(policy.clone()),
            policy.coordinator_settings(),
        );
        let resolution = ResolutionSurface::new(coordinator.clone());
        Self { ledger, device, book, coordinator, resolution }
    }

    /// A terminal whose state lives only as long as the process.
    pub fn in_memory(device: Arc<SimulatedTse>, policy: &TomlRetryPolicy) -> Self {
        Self::new(
            Arc::new(InMemoryLedgerStore::new()),
            Arc::new(InMemoryOperationStore::new()),
            device,
            Arc::new(InMemoryTransactionBook::new()),
            policy,
        )
    }

    /// A terminal persisted under `data_dir`.
    ///
    /// The directory holds the ledger chains (`fiscal.jsonl`,
    /// `operational.jsonl`) and the outbox (`operations.jsonl`,
    /// `operations.json`).
    pub fn open(
        data_dir: &Path,
        device: Arc<SimulatedTse>,
        book: Arc<InMemoryTransactionBook>,
        policy: &TomlRetryPolicy,
    ) -> KasseResult<Self> {
        let ledger = Arc::new(JsonlLedgerStore::open(data_dir)?);
        let operations = Arc::new(FileOperationStore::open(data_dir)?);
        info!(data_dir = %data_dir.display(), device = %device.serial(), "terminal opened");
        Ok(Self::new(ledger, operations, device, book, policy))
    }

    pub fn coordinator(&self) -> &Coordinator {
        &self.coordinator
    }

    pub fn resolution(&self) -> &ResolutionSurface {
        &self.resolution
    }

    pub fn device(&self) -> &SimulatedTse {
        &self.device
    }

    pub fn book(&self) -> &InMemoryTransactionBook {
        &self.book
    }

    pub fn ledger(&self) -> &dyn LedgerStore {
        self.ledger.as_ref()
    }

    /// Hand a closed sale to the coordinator; returns before it is signed.
    pub async fn close_sale(&self, sale: &Sale) -> KasseResult<Submission> {
        self.coordinator.submit(sale.to_request()).await
    }

    /// Wait for the operation's current attempt cycle and return its row.
    pub async fn settle(&self, operation_id: &OperationId) -> KasseResult<PendingFiscalOperation> {
        self.coordinator.drive(operation_id).await
    }

    /// Journal an operational fact (login, drawer movement, daily closing).
    pub fn log_event(
        &self,
        event_type: EventType,
        actor: Option<ActorId>,
        payload: Value,
    ) -> KasseResult<LedgerEntry> {
        self.coordinator.record_operational(EntryDraft::operational(event_type, actor, payload))
    }

    /// Startup recovery over everything a previous run left unfinished.
    pub async fn recover(&self) -> KasseResult<RecoveryReport> {
        self.coordinator.recover().await
    }

    /// Verify every chain end to end.
    pub fn audit(&self) -> KasseResult<Vec<ChainVerification>> {
        ChainId::ALL
            .iter()
            .map(|&chain| self.coordinator.verify_chain(chain, ChainRange::all()))
            .collect()
    }
}
