//! Scenario 3: Crash and recovery
//!
//! Demonstrates that a terminal restart neither loses nor double-signs a
//! fiscal operation.
//!
//! Walk-through for the demo run:
//!   1. A terminal backed by files under a data directory commits op-7
//!   2. Power is lost between the device signing op-8 and the fiscal write;
//!      op-8 is left DEVICE_SUCCESS
//!   3. op-9 is recorded but the terminal dies before calling the device;
//!      it is left PENDING
//!   4. The terminal restarts with a fresh device handle and runs recovery:
//!      op-8 is written without touching the device, op-9 is signed once
//!   5. The cashier resubmits op-8: nothing happens

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tempfile::TempDir;

use kasse_contracts::{
    error::{KasseError, KasseResult},
    ids::{ChainId, OperationId},
    ledger::LedgerEntry,
    operation::{OperationStatus, PendingFiscalOperation, Submission},
};
use kasse_core::{traits::OperationStore, RecoveryReport};
use kasse_ledger::{FileOperationStore, JsonlLedgerStore};
use kasse_policy::TomlRetryPolicy;

use crate::{
    book::InMemoryTransactionBook,
    device::SimulatedTse,
    faults::InterruptibleLedger,
    runtime::PosRuntime,
    sales::sample_sale,
};

#[derive(Debug)]
pub struct CrashOutcome {
    pub data_dir: PathBuf,
    /// op-8 as the crashed terminal left it.
    pub stranded_signed: PendingFiscalOperation,
    /// op-9 as the crashed terminal left it.
    pub stranded_pending: PendingFiscalOperation,
    pub recovery: RecoveryReport,
    pub resubmission: Submission,
    /// Signatures for op-8 issued before and after the restart.
    pub op8_signatures: (usize, usize),
    /// Signatures for op-9 issued before and after the restart.
    pub op9_signatures: (usize, usize),
    pub fiscal_entries: Vec<LedgerEntry>,
    pub chains_valid: bool,
}

impl CrashOutcome {
    /// Both stranded operations were found in the expected state and all
    /// three sales ended up in the fiscal chain.
    pub fn committed_everything(&self) -> bool {
        self.fiscal_entries.len() == 3
            && self.stranded_signed.status == OperationStatus::DeviceSuccess
            && self.stranded_pending.status == OperationStatus::Pending
    }
}

pub async fn execute(policy: &TomlRetryPolicy, data_dir: &Path) -> KasseResult<CrashOutcome> {
    // The transaction book belongs to the back office and survives the restart.
    let book = Arc::new(InMemoryTransactionBook::new());
    let op8 = sample_sale(8);
    let op9 = sample_sale(9);

    // ── First run ─────────────────────────────────────────────────────────────
    let first_device = Arc::new(SimulatedTse::new("TSE-SIM-0001"));
    let (stranded_signed, stranded_pending) = {
        let ledger = Arc::new(InterruptibleLedger::new(Arc::new(JsonlLedgerStore::open(data_dir)?)));
        let operations = Arc::new(FileOperationStore::open(data_dir)?);
        let runtime = PosRuntime::new(
            ledger.clone(),
            operations.clone(),
            Arc::clone(&first_device),
            Arc::clone(&book),
            policy,
        );

        let op7 = sample_sale(7);
        runtime.close_sale(&op7).await?;
        runtime.settle(&op7.operation_id).await?;

        ledger.pull_plug();
        runtime.close_sale(&op8).await?;
        let signed = runtime.settle(&op8.operation_id).await?;

        // Written to the outbox, then the process dies before any device call.
        operations.insert_if_absent(PendingFiscalOperation::new(op9.to_request()))?;
        let pending = load(operations.as_ref(), &op9.operation_id)?;
        (signed, pending)
    };

    // ── Restart ───────────────────────────────────────────────────────────────
    let second_device = Arc::new(SimulatedTse::new("TSE-SIM-0001"));
    let runtime = PosRuntime::open(data_dir, Arc::clone(&second_device), book, policy)?;
    let recovery = runtime.recover().await?;
    let resubmission = runtime.close_sale(&op8).await?;

    Ok(CrashOutcome {
        data_dir: data_dir.to_path_buf(),
        stranded_signed,
        stranded_pending,
        recovery,
        resubmission,
        op8_signatures: (
            first_device.signatures_for(&op8.operation_id),
            second_device.signatures_for(&op8.operation_id),
        ),
        op9_signatures: (
            first_device.signatures_for(&op9.operation_id),
            second_device.signatures_for(&op9.operation_id),
        ),
        fiscal_entries: runtime.ledger().entries(ChainId::Fiscal)?,
        chains_valid: runtime.audit()?.iter().all(|v| v.valid),
    })
}

fn load(operations: &dyn OperationStore, id: &OperationId) -> KasseResult<PendingFiscalOperation> {
    operations
        .get(id)?
        .ok_or_else(|| KasseError::OperationNotFound { operation_id: id.to_string() })
}

/// Run Scenario 3 and print each step.
///
/// With `data_dir` the files are kept for `demo verify`; otherwise a
/// temporary directory is used and removed afterwards.
pub async fn run_scenario(policy: &TomlRetryPolicy, data_dir: Option<&Path>) -> KasseResult<()> {
    println!("=== Scenario 3: Crash and recovery ===");
    println!();

    let scratch;
    let dir = match data_dir {
        Some(dir) => dir,
        None => {
            scratch = TempDir::new().map_err(|e| KasseError::storage(format!("temp dir: {}", e)))?;
            scratch.path()
        }
    };
    let o = execute(policy, dir).await?;

    println!("  Data directory:               {}", o.data_dir.display());
    println!("  [1] op-7 committed before the crash");
    println!("  [2] op-8 left behind as:      {}", o.stranded_signed.status);
    println!("  [3] op-9 left behind as:      {}", o.stranded_pending.status);
    println!(
        "  [4] Recovery: scanned {}, committed {}, escalated {}",
        o.recovery.scanned, o.recovery.committed, o.recovery.escalated
    );
    println!(
        "      op-8 signatures before/after restart: {}/{}",
        o.op8_signatures.0, o.op8_signatures.1
    );
    println!(
        "      op-9 signatures before/after restart: {}/{}",
        o.op9_signatures.0, o.op9_signatures.1
    );
    println!(
        "  [5] op-8 resubmitted:          {} ({})",
        o.resubmission.status,
        if o.resubmission.created { "new row" } else { "no-op" }
    );
    println!();
    println!("  Fiscal entries:               {}", o.fiscal_entries.len());
    println!(
        "  Ledger integrity:             {}",
        if o.chains_valid { "VERIFIED" } else { "FAILED" }
    );
    println!();
    println!("  Scenario 3 complete.");
    println!();
    Ok(())
}

/// Whether `entries` holds exactly one entry per operation id.
pub fn one_entry_per_operation(entries: &[LedgerEntry]) -> bool {
    let mut seen = std::collections::HashSet::new();
    entries
        .iter()
        .filter_map(|e| e.operation_id.as_ref())
        .all(|id| seen.insert(id.clone()))
}
