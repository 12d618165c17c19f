//! Scenario 1: Everyday sales
//!
//! Demonstrates the happy path and the two guarantees a busy till relies on.
//!
//! Walk-through for the demo run:
//!   1. Cashier logs in; the login is journaled on the operational chain
//!   2. Sale op-2 is submitted, signed, and committed to the fiscal chain
//!   3. The same sale is submitted again: no new row, no second signature
//!   4. Sales op-3 and op-4 are signed concurrently; their fiscal entries
//!      still form one unbroken chain
//!   5. Both chains are verified

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use kasse_contracts::{
    error::KasseResult,
    ids::{ActorId, ChainId},
    ledger::{ChainVerification, EventType, LedgerEntry},
    operation::PendingFiscalOperation,
};
use kasse_policy::TomlRetryPolicy;

use crate::{device::SimulatedTse, runtime::PosRuntime, sales::sample_sale};

/// Everything the scenario observed, for printing and for tests.
#[derive(Debug)]
pub struct SaleOutcome {
    pub single: PendingFiscalOperation,
    /// Whether the repeated submission created a new row.
    pub duplicate_created: bool,
    pub concurrent: Vec<PendingFiscalOperation>,
    pub device_calls: usize,
    pub fiscal_entries: Vec<LedgerEntry>,
    pub verification: Vec<ChainVerification>,
}

pub async fn execute(policy: &TomlRetryPolicy) -> KasseResult<SaleOutcome> {
    let device = Arc::new(SimulatedTse::new("TSE-SIM-0001").with_latency(Duration::from_millis(5)));
    let runtime = PosRuntime::in_memory(device, policy);

    runtime.log_event(
        EventType::UserLogin,
        Some(ActorId::new("cashier-anna")),
        json!({ "terminal": "till-1" }),
    )?;

    let sale = sample_sale(2);
    runtime.close_sale(&sale).await?;
    let single = runtime.settle(&sale.operation_id).await?;

    let duplicate = runtime.close_sale(&sale).await?;
    runtime.settle(&sale.operation_id).await?;

    let (a, b) = (sample_sale(3), sample_sale(4));
    runtime.close_sale(&a).await?;
    runtime.close_sale(&b).await?;
    let (row_a, row_b) = tokio::join!(runtime.settle(&a.operation_id), runtime.settle(&b.operation_id));

    Ok(SaleOutcome {
        single,
        duplicate_created: duplicate.created,
        concurrent: vec![row_a?, row_b?],
        device_calls: runtime.device().call_count(),
        fiscal_entries: runtime.ledger().entries(ChainId::Fiscal)?,
        verification: runtime.audit()?,
    })
}

/// Run Scenario 1 and print each step.
pub async fn run_scenario(policy: &TomlRetryPolicy) -> KasseResult<()> {
    println!("=== Scenario 1: Everyday sales ===");
    println!();

    let outcome = execute(policy).await?;

    println!(
        "  Sale op-2:              {} (device tx #{})",
        outcome.single.status,
        outcome.single.transaction_number.unwrap_or_default()
    );
    println!(
        "  Resubmitted op-2:       {}",
        if outcome.duplicate_created { "NEW ROW (unexpected)" } else { "deduplicated" }
    );
    for row in &outcome.concurrent {
        println!("  Concurrent {}:        {}", row.operation_id, row.status);
    }
    println!("  Device calls:           {}", outcome.device_calls);
    println!();
    println!("  Fiscal chain:");
    for entry in &outcome.fiscal_entries {
        println!(
            "    #{} {} {}  {}…",
            entry.sequence,
            entry.operation_id.as_ref().map(|id| id.as_str()).unwrap_or("-"),
            entry.event_type,
            &entry.current_hash[..16]
        );
    }
    println!();
    for v in &outcome.verification {
        println!(
            "  Chain {:<12} {} ({} entr{})",
            v.chain.as_str(),
            if v.valid { "VERIFIED" } else { "BROKEN" },
            v.checked,
            if v.checked == 1 { "y" } else { "ies" }
        );
    }
    println!();
    println!("  Scenario 1 complete.");
    println!();
    Ok(())
}
