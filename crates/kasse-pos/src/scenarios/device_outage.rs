//! Scenario 2: Signing device outage
//!
//! Demonstrates retry, escalation, and the operator resolution surface.
//!
//! Walk-through for the demo run:
//!   1. The TSE goes offline; sale op-1 fails three times and is escalated,
//!      its transaction flagged as pending resolution
//!   2. The shift manager postpones the case; recovery leaves it alone
//!   3. The TSE comes back; the manager retries op-1, which commits and
//!      closes the case
//!   4. Sale op-5 is rejected outright by the device (permanent failure),
//!      escalates at once, and the manager marks it resolved
//!   5. Sale op-6 hits a hung device once; the timeout turns the hang into
//!      a transient failure and the retry commits

use std::sync::Arc;

use kasse_contracts::{
    error::KasseResult,
    ids::{ActorId, ChainId},
    ledger::EventType,
    operation::{PendingFiscalOperation, ResolutionState},
};
use kasse_core::{traits::TransactionBook, RecoveryReport};
use kasse_policy::TomlRetryPolicy;

use crate::{
    device::{DeviceBehavior, SimulatedTse},
    runtime::PosRuntime,
    sales::sample_sale,
};

#[derive(Debug)]
pub struct OutageOutcome {
    /// op-1 right after its automatic attempts ran out.
    pub escalated: PendingFiscalOperation,
    pub listed_while_offline: usize,
    pub recovery_while_postponed: RecoveryReport,
    /// op-1 after the operator retry.
    pub retried: PendingFiscalOperation,
    pub op1_resolution: ResolutionState,
    pub rejected: PendingFiscalOperation,
    pub op5_resolution: ResolutionState,
    pub hung_then_signed: PendingFiscalOperation,
    pub listed_at_end: usize,
    pub journal: Vec<EventType>,
    pub chains_valid: bool,
}

pub async fn execute(policy: &TomlRetryPolicy) -> KasseResult<OutageOutcome> {
    let device = Arc::new(SimulatedTse::new("TSE-SIM-0001"));
    let runtime = PosRuntime::in_memory(Arc::clone(&device), policy);
    let manager = Some(ActorId::new("manager-carla"));

    // ── 1. Outage ─────────────────────────────────────────────────────────────
    device.set_fallback(DeviceBehavior::Offline("TSE unreachable (USB reset)".to_string()));
    let op1 = sample_sale(1);
    runtime.close_sale(&op1).await?;
    let escalated = runtime.settle(&op1.operation_id).await?;
    let listed_while_offline = runtime.resolution().list_escalated()?.len();

    // ── 2. Postpone ───────────────────────────────────────────────────────────
    runtime.resolution().mark_postponed(&op1.transaction_ref, manager.clone())?;
    let recovery_while_postponed = runtime.recover().await?;

    // ── 3. Device back, operator retry ────────────────────────────────────────
    device.restore();
    let retried = runtime.resolution().retry_now(&op1.operation_id).await?;
    let op1_resolution = runtime.book().resolution(&op1.transaction_ref)?;

    // ── 4. Permanent rejection ────────────────────────────────────────────────
    device.script([DeviceBehavior::Reject("VAT rate 21 % not configured".to_string())]);
    let op5 = sample_sale(5);
    runtime.close_sale(&op5).await?;
    let rejected = runtime.settle(&op5.operation_id).await?;
    runtime.resolution().mark_resolved(&op5.transaction_ref, manager)?;
    let op5_resolution = runtime.book().resolution(&op5.transaction_ref)?;

    // ── 5. Hung device ────────────────────────────────────────────────────────
    device.script([DeviceBehavior::Hang]);
    let op6 = sample_sale(6);
    runtime.close_sale(&op6).await?;
    let hung_then_signed = runtime.settle(&op6.operation_id).await?;

    let journal = runtime
        .ledger()
        .entries(ChainId::Operational)?
        .into_iter()
        .map(|e| e.event_type)
        .collect();

    Ok(OutageOutcome {
        escalated,
        listed_while_offline,
        recovery_while_postponed,
        retried,
        op1_resolution,
        rejected,
        op5_resolution,
        hung_then_signed,
        listed_at_end: runtime.resolution().list_escalated()?.len(),
        journal,
        chains_valid: runtime.audit()?.iter().all(|v| v.valid),
    })
}

fn describe(row: &PendingFiscalOperation) -> String {
    let mut s = format!("{} (retries: {}", row.status, row.retry_count);
    if row.escalated {
        s.push_str(", escalated");
    }
    if let Some(err) = &row.last_error {
        s.push_str(&format!(", last error: {}", err));
    }
    s.push(')');
    s
}

/// Run Scenario 2 and print each step.
pub async fn run_scenario(policy: &TomlRetryPolicy) -> KasseResult<()> {
    println!("=== Scenario 2: Signing device outage ===");
    println!();

    let o = execute(policy).await?;

    println!("  [1] op-1 while TSE offline:   {}", describe(&o.escalated));
    println!("      Escalated operations:     {}", o.listed_while_offline);
    println!(
        "  [2] Case postponed; recovery skipped {} of {} unfinished",
        o.recovery_while_postponed.skipped, o.recovery_while_postponed.scanned
    );
    println!("  [3] Operator retry of op-1:   {}", describe(&o.retried));
    println!("      Transaction tx-0001:      {:?}", o.op1_resolution);
    println!("  [4] op-5 rejected by TSE:     {}", describe(&o.rejected));
    println!("      Transaction tx-0005:      {:?}", o.op5_resolution);
    println!("  [5] op-6 after a hung call:   {}", describe(&o.hung_then_signed));
    println!();
    println!("  Operational journal:");
    for event in &o.journal {
        println!("    - {}", event);
    }
    println!();
    println!("  Open escalations:             {}", o.listed_at_end);
    println!(
        "  Ledger integrity:             {}",
        if o.chains_valid { "VERIFIED" } else { "FAILED" }
    );
    println!();
    println!("  Scenario 2 complete.");
    println!();
    Ok(())
}

#[cfg(test)]
mod tests {
    use kasse_contracts::{
        ledger::EventType,
        operation::{OperationStatus, ResolutionState},
    };

    use super::execute;
    use crate::runtime::demo_policy;

    /// op-1: three transient failures escalate with retry_count 3.
    #[tokio::test]
    async fn test_outage_escalates_after_three_failures() {
        let o = execute(&demo_policy().unwrap()).await.unwrap();

        assert_eq!(o.escalated.status, OperationStatus::DeviceFailed);
        assert!(o.escalated.escalated);
        assert_eq!(o.escalated.retry_count, 3);
        assert_eq!(o.listed_while_offline, 1);
        assert_eq!(o.recovery_while_postponed.skipped, 1);
        assert_eq!(o.recovery_while_postponed.committed, 0);
    }

    #[tokio::test]
    async fn test_operator_retry_commits_and_resolves() {
        let o = execute(&demo_policy().unwrap()).await.unwrap();

        assert_eq!(o.retried.status, OperationStatus::Committed);
        assert_eq!(o.op1_resolution, ResolutionState::Resolved);
        assert_eq!(o.listed_at_end, 0);
    }

    /// A permanent rejection escalates after a single attempt.
    #[tokio::test]
    async fn test_permanent_rejection_escalates_immediately() {
        let o = execute(&demo_policy().unwrap()).await.unwrap();

        assert_eq!(o.rejected.status, OperationStatus::DeviceFailed);
        assert!(o.rejected.escalated);
        assert_eq!(o.rejected.retry_count, 1);
        assert_eq!(o.op5_resolution, ResolutionState::Resolved);
    }

    /// A device that never answers times out and is retried.
    #[tokio::test]
    async fn test_hung_device_times_out_and_retries() {
        let o = execute(&demo_policy().unwrap()).await.unwrap();

        assert_eq!(o.hung_then_signed.status, OperationStatus::Committed);
        assert_eq!(o.hung_then_signed.retry_count, 1);
    }

    #[tokio::test]
    async fn test_journal_records_every_decision() {
        let o = execute(&demo_policy().unwrap()).await.unwrap();

        assert_eq!(
            o.journal,
            vec![
                EventType::FiscalOperationEscalated,
                EventType::ResolutionPostponed,
                EventType::OperatorRetry,
                EventType::FiscalOperationEscalated,
                EventType::ResolutionResolved,
            ]
        );
        assert!(o.chains_valid);
    }
}
