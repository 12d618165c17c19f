//! The Kasse coordinator: drives fiscal operations from submission to the ledger.
//!
//! Every operation follows the same pipeline:
//!
//!   Submit → [SigningGateway::sign] → DEVICE_SUCCESS → [LedgerStore::append] → COMMITTED
//!                    └─ failure ─▶ DEVICE_FAILED ─▶ backoff ─▶ PENDING ─▶ sign …
//!                                               └─▶ escalate
//!
//! The device invariant is absolute: once a row is `DEVICE_SUCCESS`, the only
//! code path left for it is the ledger append.  `sign()` is reachable only
//! from `attempt()`, and `attempt()` only runs for `PENDING` rows held by the
//! single in-flight driver for that operation id.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use chrono::Utc;
use serde_json::json;
use tokio::{
    sync::{broadcast, watch},
    task::{JoinHandle, JoinSet},
};
use tracing::{debug, error, info, warn};

use kasse_contracts::{
    device::SignOutcome,
    error::{KasseError, KasseResult},
    ids::{ChainId, OperationId},
    ledger::{ChainRange, ChainVerification, EntryDraft, EventType, LedgerEntry},
    operation::{
        FiscalRequest, OperationStatus, PendingFiscalOperation, ResolutionState, Submission,
    },
};

use crate::{
    settings::CoordinatorSettings,
    traits::{
        CasOutcome, InsertOutcome, LedgerStore, OperationStore, RetryDecision, RetryPolicy,
        SigningGateway, TransactionBook,
    },
};

/// Counts produced by one recovery pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Unfinished rows found by the scan.
    pub scanned: usize,
    /// Rows skipped because they are escalated or held by an operator decision.
    pub skipped: usize,
    pub committed: usize,
    /// Rows that ended the pass escalated.
    pub escalated: usize,
    /// Rows still waiting (e.g. signed but the ledger append failed again).
    pub unfinished: usize,
    /// Rows whose drive returned an error.
    pub errors: usize,
}

/// What the drive loop should do after one step.
enum Step {
    /// Re-read the row and dispatch on its current status.
    Reload,
    /// Sleep, then re-read.
    Backoff(std::time::Duration),
    /// The cycle is over for now.
    Stop(PendingFiscalOperation),
}

/// Outcome of claiming the in-flight slot for an operation id.
enum Slot {
    Leader(InflightGuard),
    Follower(watch::Receiver<bool>),
}

/// Releases the in-flight slot and wakes followers, even if the leader's
/// future is dropped mid-flight.
struct InflightGuard {
    inner: Arc<Inner>,
    operation_id: OperationId,
}

impl Drop for InflightGuard {
    fn drop(&mut self) {
        let sender = match self.inner.inflight.lock() {
            Ok(mut map) => map.remove(&self.operation_id),
            Err(poisoned) => poisoned.into_inner().remove(&self.operation_id),
        };
        if let Some(sender) = sender {
            let _ = sender.send(true);
        }
    }
}

struct Inner {
    ledger: Arc<dyn LedgerStore>,
    operations: Arc<dyn OperationStore>,
    gateway: Arc<dyn SigningGateway>,
    book: Arc<dyn TransactionBook>,
    policy: Arc<dyn RetryPolicy>,
    settings: CoordinatorSettings,
    inflight: Mutex<HashMap<OperationId, watch::Sender<bool>>>,
    updates: broadcast::Sender<PendingFiscalOperation>,
}

/// Drives pending fiscal operations through the signing device into the
/// fiscal chain.
///
/// Cheap to clone; all clones share the same stores and the same in-flight
/// map, so coalescing holds across clones.  Run one coordinator per store.
#[derive(Clone)]
pub struct Coordinator {
    inner: Arc<Inner>,
}

impl Coordinator {
    /// Wire a coordinator over the given components.
    pub fn new(
        ledger: Arc<dyn LedgerStore>,
        operations: Arc<dyn OperationStore>,
        gateway: Arc<dyn SigningGateway>,
        book: Arc<dyn TransactionBook>,
        policy: Arc<dyn RetryPolicy>,
        settings: CoordinatorSettings,
    ) -> Self {
        let (updates, _) = broadcast::channel(settings.update_channel_capacity.max(1));
        Self {
            inner: Arc::new(Inner {
                ledger,
                operations,
                gateway,
                book,
                policy,
                settings,
                inflight: Mutex::new(HashMap::new()),
                updates,
            }),
        }
    }

    pub fn settings(&self) -> &CoordinatorSettings {
        &self.inner.settings
    }

    pub(crate) fn operations(&self) -> &Arc<dyn OperationStore> {
        &self.inner.operations
    }

    pub(crate) fn book(&self) -> &Arc<dyn TransactionBook> {
        &self.inner.book
    }

    // ── Public entry points ──────────────────────────────────────────────────

    /// Record a fiscal request and start driving it in the background.
    ///
    /// Returns immediately with the tracking id.  Resubmitting a known id is
    /// an idempotent no-op: no new row, and no second device call while the
    /// first is in flight or after it committed.
    ///
    /// # Errors
    ///
    /// `OperationConflict` if the id is already used for a different
    /// request; storage faults from the operation store.
    pub async fn submit(&self, request: FiscalRequest) -> KasseResult<Submission> {
        let operation_id = request.operation_id.clone();
        let (row, created) = match self
            .inner
            .operations
            .insert_if_absent(PendingFiscalOperation::new(request.clone()))?
        {
            InsertOutcome::Created(row) => {
                self.publish(&row);
                (row, true)
            }
            InsertOutcome::Existing(row) => {
                if !row.matches_request(&request) {
                    warn!(operation_id = %operation_id, "operation id reused with a different request");
                    return Err(KasseError::OperationConflict {
                        operation_id: operation_id.to_string(),
                    });
                }
                debug!(
                    operation_id = %operation_id,
                    status = %row.status,
                    "duplicate submission, returning existing state"
                );
                (row, false)
            }
        };

        if !row.status.is_terminal() && !row.escalated {
            let coordinator = self.clone();
            let id = operation_id.clone();
            tokio::spawn(async move {
                if let Err(e) = coordinator.drive(&id).await {
                    error!(operation_id = %id, error = %e, "background drive failed");
                }
            });
        }

        Ok(Submission { operation_id, status: row.status, created })
    }

    /// Run the attempt cycle for `operation_id` and return the resulting row.
    ///
    /// If another task is already driving the same id, waits for it to
    /// finish and returns the row it left behind instead of starting a
    /// second cycle.
    pub async fn drive(&self, operation_id: &OperationId) -> KasseResult<PendingFiscalOperation> {
        match self.claim_slot(operation_id) {
            Slot::Leader(guard) => {
                let result = self.drive_cycle(operation_id).await;
                drop(guard);
                result
            }
            Slot::Follower(mut done) => {
                debug!(operation_id = %operation_id, "joining in-flight drive");
                let _ = done.wait_for(|finished| *finished).await;
                self.load(operation_id)
            }
        }
    }

    /// Current row for `operation_id`, if known.
    pub fn status(&self, operation_id: &OperationId) -> KasseResult<Option<PendingFiscalOperation>> {
        self.inner.operations.get(operation_id)
    }

    /// Subscribe to every row change the coordinator makes.
    pub fn subscribe(&self) -> broadcast::Receiver<PendingFiscalOperation> {
        self.inner.updates.subscribe()
    }

    /// Crash-recovery scan over every unfinished operation.
    ///
    /// `PENDING` and `DEVICE_FAILED` rows resume at the device call,
    /// `DEVICE_SUCCESS` rows resume at the ledger append.  Escalated rows and
    /// rows whose transaction is postponed or resolved are left alone; an
    /// escalated row whose transaction has no case gets one.  Safe
    /// to run repeatedly and concurrently with live traffic.
    pub async fn recover(&self) -> KasseResult<RecoveryReport> {
        let rows = self.inner.operations.list_unfinished()?;
        let mut report = RecoveryReport { scanned: rows.len(), ..RecoveryReport::default() };
        let mut drives = JoinSet::new();

        for row in rows {
            if row.escalated {
                // Escalated without a case means the flag never reached the book.
                if self.inner.book.resolution(&row.transaction_ref)? == ResolutionState::None {
                    warn!(
                        operation_id = %row.operation_id,
                        transaction_ref = %row.transaction_ref,
                        "escalated operation has no open case; flagging transaction"
                    );
                    self.flag_pending(&row);
                }
                report.skipped += 1;
                continue;
            }
            if row.status == OperationStatus::DeviceFailed
                && !self.inner.book.resolution(&row.transaction_ref)?.allows_automatic_retry()
            {
                report.skipped += 1;
                continue;
            }
            debug!(
                operation_id = %row.operation_id,
                status = %row.status,
                "recovering operation"
            );
            let coordinator = self.clone();
            drives.spawn(async move { coordinator.drive(&row.operation_id).await });
        }

        while let Some(joined) = drives.join_next().await {
            match joined {
                Ok(Ok(row)) if row.status == OperationStatus::Committed => report.committed += 1,
                Ok(Ok(row)) if row.escalated => report.escalated += 1,
                Ok(Ok(_)) => report.unfinished += 1,
                Ok(Err(e)) => {
                    error!(error = %e, "recovery drive failed");
                    report.errors += 1;
                }
                Err(e) => {
                    error!(error = %e, "recovery task aborted");
                    report.errors += 1;
                }
            }
        }

        info!(
            scanned = report.scanned,
            committed = report.committed,
            escalated = report.escalated,
            unfinished = report.unfinished,
            skipped = report.skipped,
            errors = report.errors,
            "recovery pass finished"
        );
        Ok(report)
    }

    /// Run `recover()` every `settings.sweep_interval` until the task is aborted.
    pub fn spawn_sweeper(&self) -> JoinHandle<()> {
        let coordinator = self.clone();
        let period = self.inner.settings.sweep_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if let Err(e) = coordinator.recover().await {
                    error!(error = %e, "recovery sweep failed");
                }
            }
        })
    }

    /// Append an operational fact to the operational chain.
    pub fn record_operational(&self, draft: EntryDraft) -> KasseResult<LedgerEntry> {
        self.inner.ledger.append(ChainId::Operational, draft)
    }

    /// Verify `chain` and report any break on the audit target.
    pub fn verify_chain(&self, chain: ChainId, range: ChainRange) -> KasseResult<ChainVerification> {
        let verification = self.inner.ledger.verify_chain(chain, range)?;
        match &verification.broken_at {
            Some(at) => error!(
                target: "kasse::audit",
                chain = %chain,
                log_id = %at.log_id,
                sequence = at.sequence,
                kind = ?at.kind,
                "ledger integrity violation detected"
            ),
            None => debug!(chain = %chain, checked = verification.checked, "chain verified"),
        }
        Ok(verification)
    }

    /// Operator-driven retry of an escalated operation.
    ///
    /// Clears the escalation, moves the row back to `PENDING`, and runs one
    /// attempt cycle.  A failure re-escalates under the normal policy.
    pub(crate) async fn operator_retry(
        &self,
        operation_id: &OperationId,
    ) -> KasseResult<PendingFiscalOperation> {
        let guard = match self.claim_slot(operation_id) {
            Slot::Leader(guard) => guard,
            Slot::Follower(mut done) => {
                // Already moving; the operator sees its outcome.
                let _ = done.wait_for(|finished| *finished).await;
                return self.load(operation_id);
            }
        };

        let row = self.load(operation_id)?;
        if row.status != OperationStatus::DeviceFailed || !row.escalated {
            return Err(KasseError::ResolutionRejected {
                reason: format!(
                    "operation '{}' is {} and not escalated; nothing to retry",
                    operation_id, row.status
                ),
            });
        }
        if self.inner.book.resolution(&row.transaction_ref)? == ResolutionState::Resolved {
            return Err(KasseError::ResolutionRejected {
                reason: format!("transaction '{}' is already resolved", row.transaction_ref),
            });
        }

        let mut next = row.clone();
        next.status = OperationStatus::Pending;
        next.escalated = false;
        next.last_error = None;
        match self.transition(row.revision, next)? {
            CasOutcome::Applied(row) => {
                info!(operation_id = %operation_id, retry_count = row.retry_count, "operator retry started");
                self.journal(
                    EventType::OperatorRetry,
                    json!({
                        "operation_id": operation_id,
                        "transaction_ref": row.transaction_ref,
                        "retry_count": row.retry_count,
                    }),
                );
            }
            CasOutcome::Conflict(current) => return Ok(current),
        }

        let result = self.drive_cycle(operation_id).await;
        drop(guard);
        result
    }

    // ── Drive loop ───────────────────────────────────────────────────────────

    async fn drive_cycle(&self, operation_id: &OperationId) -> KasseResult<PendingFiscalOperation> {
        loop {
            let row = self.load(operation_id)?;
            let step = match row.status {
                OperationStatus::Committed => Step::Stop(row),
                OperationStatus::DeviceSuccess => self.commit(row)?,
                OperationStatus::DeviceFailed => self.resume_failed(row)?,
                OperationStatus::Pending => self.attempt(row).await?,
            };
            match step {
                Step::Reload => continue,
                Step::Backoff(delay) => {
                    debug!(
                        operation_id = %operation_id,
                        delay_ms = delay.as_millis() as u64,
                        "backing off before next attempt"
                    );
                    tokio::time::sleep(delay).await;
                }
                Step::Stop(row) => return Ok(row),
            }
        }
    }

    /// Move a failed, non-escalated row back into an attempt cycle.
    fn resume_failed(&self, row: PendingFiscalOperation) -> KasseResult<Step> {
        if row.escalated {
            return Ok(Step::Stop(row));
        }
        if !self.inner.book.resolution(&row.transaction_ref)?.allows_automatic_retry() {
            debug!(operation_id = %row.operation_id, "transaction held by operator; not retrying");
            return Ok(Step::Stop(row));
        }
        let mut next = row.clone();
        next.status = OperationStatus::Pending;
        next.last_error = None;
        self.transition(row.revision, next)?;
        Ok(Step::Reload)
    }

    /// One device call for a `PENDING` row.
    async fn attempt(&self, row: PendingFiscalOperation) -> KasseResult<Step> {
        let operation_id = row.operation_id.clone();
        debug!(operation_id = %operation_id, retry_count = row.retry_count, "calling signing device");

        let timeout = self.inner.settings.device_timeout;
        let outcome = match tokio::time::timeout(
            timeout,
            self.inner.gateway.sign(&operation_id, &row.payload_for_device),
        )
        .await
        {
            Ok(outcome) => outcome,
            Err(_) => SignOutcome::transient(format!(
                "device did not answer within {} ms",
                timeout.as_millis()
            )),
        };

        match outcome {
            SignOutcome::Accepted { response, transaction_number } => {
                let mut next = row.clone();
                next.status = OperationStatus::DeviceSuccess;
                next.device_response = Some(response);
                next.transaction_number = transaction_number;
                next.last_error = None;
                match self.transition(row.revision, next)? {
                    CasOutcome::Applied(_) => {
                        info!(
                            operation_id = %operation_id,
                            transaction_number = ?transaction_number,
                            "device signed operation"
                        );
                    }
                    CasOutcome::Conflict(current) => {
                        error!(
                            operation_id = %operation_id,
                            status = %current.status,
                            "row moved while the device was signing; signed response discarded"
                        );
                    }
                }
                Ok(Step::Reload)
            }

            SignOutcome::Rejected(failure) => {
                let retry_count = row.retry_count.saturating_add(1);
                let decision = if failure.transient {
                    match self.inner.policy.decide(retry_count, &failure) {
                        // A transaction with an open case is never retried
                        // automatically; a backoff would strand the row.
                        RetryDecision::RetryAfter(_)
                            if !self
                                .inner
                                .book
                                .resolution(&row.transaction_ref)?
                                .allows_automatic_retry() =>
                        {
                            RetryDecision::Escalate {
                                reason: format!(
                                    "transaction awaits an operator decision: {}",
                                    failure.reason
                                ),
                            }
                        }
                        decision => decision,
                    }
                } else {
                    RetryDecision::Escalate {
                        reason: format!("device rejected the request: {}", failure.reason),
                    }
                };

                warn!(
                    operation_id = %operation_id,
                    retry_count,
                    transient = failure.transient,
                    reason = %failure.reason,
                    "signing attempt failed"
                );

                let mut next = row.clone();
                next.status = OperationStatus::DeviceFailed;
                next.retry_count = retry_count;
                next.last_error = Some(failure.reason.clone());
                next.escalated = matches!(decision, RetryDecision::Escalate { .. });

                match (self.transition(row.revision, next)?, decision) {
                    (CasOutcome::Applied(row), RetryDecision::Escalate { reason }) => {
                        self.escalate(&row, &reason);
                        Ok(Step::Stop(row))
                    }
                    (CasOutcome::Applied(_), RetryDecision::RetryAfter(delay)) => {
                        Ok(Step::Backoff(delay))
                    }
                    (CasOutcome::Conflict(_), _) => Ok(Step::Reload),
                }
            }
        }
    }

    /// Chain a signed row into the fiscal ledger.  Never calls the device.
    fn commit(&self, row: PendingFiscalOperation) -> KasseResult<Step> {
        let operation_id = row.operation_id.clone();
        let response = row.device_response.clone().ok_or_else(|| KasseError::InvalidTransition {
            operation_id: operation_id.to_string(),
            reason: "DEVICE_SUCCESS row has no device response".to_string(),
        })?;

        let draft = EntryDraft {
            event_type: row.event_type,
            timestamp_utc: Utc::now(),
            actor_id: row.actor_id.clone(),
            payload: row.payload_for_device.clone(),
            device_response: response,
            transaction_number: row.transaction_number,
            operation_id: Some(operation_id.clone()),
        };

        let entry = match self.inner.ledger.append(ChainId::Fiscal, draft) {
            Ok(entry) => entry,
            Err(e) => {
                error!(
                    operation_id = %operation_id,
                    error = %e,
                    "ledger append failed; operation stays DEVICE_SUCCESS until the next recovery pass"
                );
                return Ok(Step::Stop(row));
            }
        };

        let mut next = row.clone();
        next.status = OperationStatus::Committed;
        next.ledger_log_id = Some(entry.log_id);
        match self.transition(row.revision, next)? {
            CasOutcome::Applied(committed) => {
                info!(
                    operation_id = %operation_id,
                    sequence = entry.sequence,
                    hash = %entry.current_hash,
                    "operation committed to fiscal chain"
                );
                self.close_resolution(&committed);
                Ok(Step::Stop(committed))
            }
            CasOutcome::Conflict(_) => Ok(Step::Reload),
        }
    }

    // ── Helpers ──────────────────────────────────────────────────────────────

    fn escalate(&self, row: &PendingFiscalOperation, reason: &str) {
        warn!(
            operation_id = %row.operation_id,
            transaction_ref = %row.transaction_ref,
            retry_count = row.retry_count,
            reason = %reason,
            "operation escalated for manual resolution"
        );
        // A postponed case stays postponed; anything else needs an open case
        // or the operator could not decide on it.
        let open = matches!(
            self.inner.book.resolution(&row.transaction_ref),
            Ok(ResolutionState::Pending | ResolutionState::Postponed)
        );
        if !open {
            self.flag_pending(row);
        }
        self.journal(
            EventType::FiscalOperationEscalated,
            json!({
                "operation_id": row.operation_id,
                "transaction_ref": row.transaction_ref,
                "retry_count": row.retry_count,
                "reason": reason,
            }),
        );
    }

    /// Open an operator case for an escalated row.  A failure is logged; the
    /// next recovery pass flags the transaction again.
    fn flag_pending(&self, row: &PendingFiscalOperation) {
        if let Err(e) = self
            .inner
            .book
            .set_resolution(&row.transaction_ref, ResolutionState::Pending)
        {
            error!(transaction_ref = %row.transaction_ref, error = %e, "failed to flag transaction");
        }
    }

    /// A commit settles any open operator case for the transaction.
    fn close_resolution(&self, row: &PendingFiscalOperation) {
        let state = match self.inner.book.resolution(&row.transaction_ref) {
            Ok(state) => state,
            Err(e) => {
                error!(transaction_ref = %row.transaction_ref, error = %e, "failed to read resolution");
                return;
            }
        };
        if matches!(state, ResolutionState::Pending | ResolutionState::Postponed) {
            if let Err(e) = self
                .inner
                .book
                .set_resolution(&row.transaction_ref, ResolutionState::Resolved)
            {
                error!(transaction_ref = %row.transaction_ref, error = %e, "failed to resolve transaction");
            }
        }
    }

    /// Best-effort operational journal entry; failures are logged, not raised.
    pub(crate) fn journal(&self, event_type: EventType, payload: serde_json::Value) {
        let draft = EntryDraft::operational(event_type, None, payload);
        if let Err(e) = self.inner.ledger.append(ChainId::Operational, draft) {
            error!(event_type = %event_type, error = %e, "operational journal append failed");
        }
    }

    fn transition(&self, expected_revision: u64, next: PendingFiscalOperation) -> KasseResult<CasOutcome> {
        let outcome = self.inner.operations.compare_and_set(expected_revision, next)?;
        match &outcome {
            CasOutcome::Applied(row) => self.publish(row),
            CasOutcome::Conflict(current) => debug!(
                operation_id = %current.operation_id,
                expected_revision,
                actual_revision = current.revision,
                "compare-and-set conflict"
            ),
        }
        Ok(outcome)
    }

    fn publish(&self, row: &PendingFiscalOperation) {
        // No subscribers is fine.
        let _ = self.inner.updates.send(row.clone());
    }

    fn load(&self, operation_id: &OperationId) -> KasseResult<PendingFiscalOperation> {
        self.inner.operations.get(operation_id)?.ok_or_else(|| KasseError::OperationNotFound {
            operation_id: operation_id.to_string(),
        })
    }

    fn claim_slot(&self, operation_id: &OperationId) -> Slot {
        let mut map = match self.inner.inflight.lock() {
            Ok(map) => map,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(sender) = map.get(operation_id) {
            return Slot::Follower(sender.subscribe());
        }
        let (sender, _) = watch::channel(false);
        map.insert(operation_id.clone(), sender);
        Slot::Leader(InflightGuard {
            inner: Arc::clone(&self.inner),
            operation_id: operation_id.clone(),
        })
    }
}

// ── Tests ────────────────────────────────────────────────────────────────────
