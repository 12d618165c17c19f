//! Operator-facing surface for operations the coordinator gave up on.
//!
//! Escalated operations stay `DEVICE_FAILED` with their retry count frozen
//! until an operator retries them or closes the owning transaction.  Every
//! operator decision is journaled on the operational chain.

use serde_json::json;
use tracing::info;

use kasse_contracts::{
    error::{KasseError, KasseResult},
    ids::{ActorId, OperationId, TransactionRef},
    ledger::{EntryDraft, EventType},
    operation::{OperationStatus, PendingFiscalOperation, ResolutionState},
};

use crate::coordinator::Coordinator;

/// The transaction resolution surface.
#[derive(Clone)]
pub struct ResolutionSurface {
    coordinator: Coordinator,
}

impl ResolutionSurface {
    pub fn new(coordinator: Coordinator) -> Self {
        Self { coordinator }
    }

    /// Escalated operations that still need an operator, oldest first.
    ///
    /// Operations whose transaction was marked resolved are excluded.
    pub fn list_escalated(&self) -> KasseResult<Vec<PendingFiscalOperation>> {
        let mut escalated = Vec::new();
        for row in self.coordinator.operations().list_unfinished()? {
            if !row.escalated || row.status != OperationStatus::DeviceFailed {
                continue;
            }
            if self.coordinator.book().resolution(&row.transaction_ref)? == ResolutionState::Resolved {
                continue;
            }
            escalated.push(row);
        }
        Ok(escalated)
    }

    /// Run one operator-driven attempt cycle for an escalated operation.
    ///
    /// # Errors
    ///
    /// `ResolutionRejected` if the operation is not escalated or its
    /// transaction is already resolved; `OperationNotFound` for unknown ids.
    pub async fn retry_now(&self, operation_id: &OperationId) -> KasseResult<PendingFiscalOperation> {
        self.coordinator.operator_retry(operation_id).await
    }

    /// Defer the decision on `transaction`; no automatic retries meanwhile.
    pub fn mark_postponed(
        &self,
        transaction: &TransactionRef,
        actor: Option<ActorId>,
    ) -> KasseResult<()> {
        self.decide(transaction, actor, ResolutionState::Postponed, EventType::ResolutionPostponed)
    }

    /// Close the case for `transaction`.  Its escalated operations leave the
    /// escalation list but are never deleted.
    pub fn mark_resolved(
        &self,
        transaction: &TransactionRef,
        actor: Option<ActorId>,
    ) -> KasseResult<()> {
        self.decide(transaction, actor, ResolutionState::Resolved, EventType::ResolutionResolved)
    }

    fn decide(
        &self,
        transaction: &TransactionRef,
        actor: Option<ActorId>,
        state: ResolutionState,
        event_type: EventType,
    ) -> KasseResult<()> {
        let book = self.coordinator.book();
        let current = book.resolution(transaction)?;
        if !matches!(current, ResolutionState::Pending | ResolutionState::Postponed) {
            return Err(KasseError::ResolutionRejected {
                reason: format!(
                    "transaction '{}' has no open case (state {:?})",
                    transaction, current
                ),
            });
        }

        book.set_resolution(transaction, state)?;
        info!(transaction_ref = %transaction, from = ?current, to = ?state, "operator decision recorded");

        self.coordinator.record_operational(EntryDraft::operational(
            event_type,
            actor,
            json!({ "transaction_ref": transaction, "previous_state": current }),
        ))?;
        Ok(())
    }
}
