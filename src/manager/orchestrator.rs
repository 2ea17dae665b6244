//! Serialized transaction event processing.
//!
//! A single task consumes the provider event intake, one event at a time,
//! which totally orders observations per transaction identifier without any
//! per-transaction locking. The durable receipt write always precedes the
//! acknowledgment: a crash in between leaves a pending record for the next
//! launch to re-verify. The reverse ordering would acknowledge a purchase
//! the process has no memory of.

use crate::event::{PurchaseEvent, PurchaseEventsSender};
use crate::queue::{
    PaymentQueue, QueueEvent, TransactionError, TransactionState, TransactionUpdate,
};
use crate::receipt::{PendingReceipt, ReceiptStore};
use bytes::Bytes;
use lru::LruCache;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::num::NonZeroUsize;
use std::sync::Arc;
use tokio::sync::{mpsc, watch, Notify};
use tracing::{debug, info, warn};

use super::{PurchaseOutcome, RestoreOutcome};

/// Default capacity of the acknowledged-transaction set.
pub(super) const DEFAULT_ACKED_CAPACITY: usize = 100_000;

/// Bounded set of transaction identifiers that were already acknowledged.
///
/// Guards against provider redelivery: an acknowledged transaction observed
/// again is dropped without touching the store. Eviction is safe because an
/// acknowledged transaction has left the provider's pending queue; the
/// durable record remains the authoritative guard until the grant resolves.
pub(super) struct AckedSet {
    inner: Mutex<LruCache<String, ()>>,
}

impl AckedSet {
    pub(super) fn with_capacity(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner: Mutex::new(LruCache::new(capacity)),
        }
    }

    pub(super) fn contains(&self, transaction_id: &str) -> bool {
        self.inner.lock().get(transaction_id).is_some()
    }

    pub(super) fn insert(&self, transaction_id: String) {
        self.inner.lock().put(transaction_id, ());
    }

    #[cfg(test)]
    pub(super) fn len(&self) -> usize {
        self.inner.lock().len()
    }
}

/// Messages consumed by the orchestrator task.
pub(super) enum IntakeEvent {
    /// A provider event forwarded through the public sink.
    Queue(QueueEvent),

    /// A restoration pass claimed its slot. The marker travels through the
    /// intake behind any provider events already queued there, so signals
    /// enqueued before it belong to earlier passes.
    RestoreArmed {
        generation: u64,
    },
}

/// Caller-facing requests currently in flight.
///
/// One purchase and one restoration may be active at a time; everything in
/// here is touched only under the mutex and never across an await.
#[derive(Default)]
pub(super) struct FlightState {
    pub(super) buy: Option<ActiveBuy>,
    pub(super) restore: Option<ActiveRestore>,
    /// Distinguishes arming markers across successive restoration passes.
    pub(super) restore_generation: u64,
}

/// An accepted purchase waiting for terminal outcomes.
pub(super) struct ActiveBuy {
    /// Product identifiers still without a terminal outcome.
    pub(super) outstanding: HashSet<String>,
    pub(super) outcomes: mpsc::UnboundedSender<PurchaseOutcome>,
}

/// An accepted restoration waiting for the provider's completion signal.
pub(super) struct ActiveRestore {
    pub(super) outcomes: mpsc::UnboundedSender<RestoreOutcome>,
    /// Restored transactions observed so far in this pass.
    pub(super) restored: usize,
    /// Which arming marker belongs to this pass.
    pub(super) generation: u64,
    /// Completion signals observed before the pass's own marker are stray
    /// redeliveries from an earlier pass and must not resolve this one.
    pub(super) armed: bool,
}

/// Consumes provider events and applies the record-then-acknowledge
/// protocol.
pub(super) struct Orchestrator {
    pub(super) store: Arc<dyn ReceiptStore>,
    pub(super) queue: Arc<dyn PaymentQueue>,
    pub(super) events_tx: PurchaseEventsSender,
    pub(super) state: Arc<Mutex<FlightState>>,
    pub(super) acked: AckedSet,
    pub(super) sweep_nudge: Arc<Notify>,
    pub(super) local_verify: bool,
}

impl Orchestrator {
    /// Process events until shutdown or until the intake closes.
    pub(super) async fn run(
        self,
        mut intake: mpsc::Receiver<IntakeEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                event = intake.recv() => {
                    let Some(event) = event else { break };
                    match event {
                        IntakeEvent::Queue(event) => self.handle_event(event).await,
                        IntakeEvent::RestoreArmed { generation } => self.arm_restore(generation),
                    }
                }
            }
        }
        debug!("Transaction orchestrator stopped");
    }

    async fn handle_event(&self, event: QueueEvent) {
        match event {
            QueueEvent::TransactionUpdated(update) => self.handle_update(update).await,
            QueueEvent::RestoreCompleted => self.finish_restore(None),
            QueueEvent::RestoreFailed { message } => self.finish_restore(Some(message)),
        }
    }

    /// Arm the restoration pass whose marker just cleared the intake.
    fn arm_restore(&self, generation: u64) {
        let mut state = self.state.lock();
        if let Some(active) = state.restore.as_mut() {
            if active.generation == generation {
                active.armed = true;
            }
        }
    }

    async fn handle_update(&self, update: TransactionUpdate) {
        let TransactionUpdate {
            transaction_id,
            product_id,
            state,
        } = update;
        match state {
            TransactionState::Purchasing => {
                debug!("Transaction {transaction_id} is purchasing (product {product_id})");
            }
            TransactionState::Purchased { receipt } => {
                self.handle_purchased(&transaction_id, &product_id, &receipt, false)
                    .await;
            }
            TransactionState::Restored { receipt } => {
                self.handle_purchased(&transaction_id, &product_id, &receipt, true)
                    .await;
            }
            TransactionState::Failed { error } => {
                self.handle_failed(&transaction_id, &product_id, &error).await;
            }
            TransactionState::Deferred => self.handle_deferred(&transaction_id, &product_id),
        }
    }

    /// Record, acknowledge, then hand off to verification.
    async fn handle_purchased(
        &self,
        transaction_id: &str,
        product_id: &str,
        receipt: &Bytes,
        restored: bool,
    ) {
        if self.acked.contains(transaction_id) {
            debug!("Transaction {transaction_id} already acknowledged, ignoring redelivery");
            return;
        }

        // An existing record means an earlier attempt got at least as far as
        // the durable write; redelivery resumes from wherever it stopped.
        let existing = match self.store.get(transaction_id).await {
            Ok(existing) => existing,
            Err(e) => {
                warn!("Receipt lookup failed for {transaction_id}: {e}");
                None
            }
        };
        let mut record = match existing {
            Some(record) => record,
            None => {
                let record = PendingReceipt::new(transaction_id, product_id, receipt.to_vec());
                if let Err(e) = self.store.put(&record).await {
                    // Not acknowledged, so the provider redelivers and the
                    // write is retried. A store failure is never a purchase
                    // failure.
                    warn!("Failed to record receipt for {transaction_id}: {e}");
                    return;
                }
                record
            }
        };

        if let Err(e) = self.queue.finish_transaction(transaction_id).await {
            // The record is durable but stays unacknowledged, which keeps it
            // out of the verification sweep; redelivery retries this step.
            warn!("Failed to finish transaction {transaction_id}: {e}");
            return;
        }

        // The durable acknowledgment mark is what admits the record to the
        // sweep. Granting an unacknowledged record would race the provider's
        // redelivery of the still-queued transaction into a second grant.
        if !record.acknowledged {
            record.acknowledged = true;
            if let Err(e) = self.store.put(&record).await {
                // Finished at the provider but the mark did not land; the
                // sweep leaves the record alone, so resolution waits for a
                // redelivery or a restoration pass to retry the mark.
                warn!("Failed to mark receipt {transaction_id} acknowledged: {e}");
                return;
            }
        }
        self.acked.insert(transaction_id.to_string());

        info!(
            "Transaction {transaction_id} recorded and acknowledged (product {product_id}, restored: {restored})"
        );
        let _ = self.events_tx.send(PurchaseEvent::PurchaseRecorded {
            transaction_id: transaction_id.to_string(),
            product_id: product_id.to_string(),
            restored,
        });
        self.notify_recorded(transaction_id, product_id, restored);

        if self.local_verify {
            // Local verification: the durable record is the grant. The grant
            // event follows a successful purge, so a purge failure defers to
            // the sweep instead of granting twice.
            match self.store.delete(transaction_id).await {
                Ok(()) => {
                    let _ = self.events_tx.send(PurchaseEvent::EntitlementGranted {
                        transaction_id: transaction_id.to_string(),
                        product_id: product_id.to_string(),
                    });
                }
                Err(e) => {
                    warn!("Failed to purge locally verified receipt {transaction_id}: {e}");
                    self.sweep_nudge.notify_one();
                }
            }
        } else {
            self.sweep_nudge.notify_one();
        }
    }

    /// Acknowledge and report a failed transaction. No entitlement, no
    /// record.
    async fn handle_failed(
        &self,
        transaction_id: &str,
        product_id: &str,
        error: &TransactionError,
    ) {
        if self.acked.contains(transaction_id) {
            debug!("Transaction {transaction_id} already acknowledged, ignoring redelivery");
            return;
        }

        let kind = error.classify();
        let message = error.message();

        // A failed transaction must still leave the provider's queue.
        match self.queue.finish_transaction(transaction_id).await {
            Ok(()) => self.acked.insert(transaction_id.to_string()),
            Err(e) => warn!("Failed to finish failed transaction {transaction_id}: {e}"),
        }

        info!("Transaction {transaction_id} failed (product {product_id}): {message}");
        let _ = self.events_tx.send(PurchaseEvent::PurchaseFailed {
            product_id: product_id.to_string(),
            kind,
            message: message.clone(),
        });

        let mut state = self.state.lock();
        if let Some(active) = state.buy.as_mut() {
            if active.outstanding.remove(product_id) {
                let _ = active.outcomes.send(PurchaseOutcome::Failed {
                    product_id: product_id.to_string(),
                    kind,
                    message,
                });
                if active.outstanding.is_empty() {
                    state.buy = None;
                    debug!("Purchase request resolved");
                }
            }
        }
    }

    /// Report a deferred transaction. Stable non-terminal state: nothing is
    /// persisted or acknowledged, and the product stays outstanding.
    fn handle_deferred(&self, transaction_id: &str, product_id: &str) {
        info!("Transaction {transaction_id} deferred (product {product_id})");
        let _ = self.events_tx.send(PurchaseEvent::TransactionDeferred {
            transaction_id: transaction_id.to_string(),
            product_id: product_id.to_string(),
        });

        let state = self.state.lock();
        if let Some(active) = state.buy.as_ref() {
            if active.outstanding.contains(product_id) {
                let _ = active.outcomes.send(PurchaseOutcome::Deferred {
                    transaction_id: transaction_id.to_string(),
                    product_id: product_id.to_string(),
                });
            }
        }
    }

    /// Resolve the waiter for a recorded transaction, if any.
    fn notify_recorded(&self, transaction_id: &str, product_id: &str, restored: bool) {
        let mut state = self.state.lock();
        if restored {
            if let Some(active) = state.restore.as_mut() {
                if active.armed {
                    active.restored += 1;
                    let _ = active.outcomes.send(RestoreOutcome::Restored {
                        transaction_id: transaction_id.to_string(),
                        product_id: product_id.to_string(),
                    });
                }
            }
            return;
        }
        if let Some(active) = state.buy.as_mut() {
            if active.outstanding.remove(product_id) {
                let _ = active.outcomes.send(PurchaseOutcome::Completed {
                    transaction_id: transaction_id.to_string(),
                    product_id: product_id.to_string(),
                });
                if active.outstanding.is_empty() {
                    state.buy = None;
                    debug!("Purchase request resolved");
                }
            }
        }
    }

    /// Resolve the active restoration on the provider's completion signal.
    /// A signal observed before the pass's own arming marker is a stray
    /// redelivery from an earlier pass and is dropped.
    fn finish_restore(&self, failure: Option<String>) {
        let mut state = self.state.lock();
        let armed = state.restore.as_ref().is_some_and(|active| active.armed);
        if !armed {
            debug!("Restore signal without an armed restoration, ignoring");
            return;
        }
        let Some(active) = state.restore.take() else {
            return;
        };
        drop(state);

        match failure {
            None => {
                info!("Restoration completed ({} transactions)", active.restored);
                let _ = self.events_tx.send(PurchaseEvent::RestoreCompleted {
                    restored: active.restored,
                });
                let _ = active.outcomes.send(RestoreOutcome::Finished {
                    restored: active.restored,
                });
            }
            Some(message) => {
                warn!("Restoration failed: {message}");
                let _ = self.events_tx.send(PurchaseEvent::RestoreFailed {
                    message: message.clone(),
                });
                let _ = active.outcomes.send(RestoreOutcome::Failed { message });
            }
        }
    }
}
