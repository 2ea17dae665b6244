//! Background verification sweep.
//!
//! Pending receipts are driven to a terminal outcome from here, off the
//! transaction event path: once at manager start (crash recovery), whenever
//! a new record lands, and on an exponential-backoff schedule while any
//! record remains unresolved. A pending receipt is never abandoned.

use crate::event::{PurchaseEvent, PurchaseEventsSender};
use crate::receipt::{PendingReceipt, ReceiptStore};
use crate::verify::{RetryPolicy, Verifier, VerifyOutcome};
use std::sync::Arc;
use tokio::sync::{watch, Notify};
use tracing::{debug, info, warn};

/// Result of one pass over the pending records.
enum SweepRound {
    /// No records remain unresolved.
    Clear,
    /// At least one record must be retried.
    Retry,
}

/// Drives pending receipts to grant or denial.
pub(super) struct Sweeper {
    pub(super) store: Arc<dyn ReceiptStore>,
    /// Absent in local-verification mode, where leftover acknowledged
    /// records are grants whose purge was interrupted.
    pub(super) verifier: Option<Arc<dyn Verifier>>,
    pub(super) events_tx: PurchaseEventsSender,
    pub(super) policy: RetryPolicy,
    pub(super) nudge: Arc<Notify>,
}

impl Sweeper {
    /// Sweep until shutdown. The first pass runs immediately so records left
    /// by a previous process do not wait for new activity.
    pub(super) async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut attempt: u32 = 0;
        loop {
            match self.sweep_once().await {
                SweepRound::Clear => {
                    attempt = 0;
                    tokio::select! {
                        changed = shutdown.changed() => {
                            if changed.is_err() || *shutdown.borrow() {
                                break;
                            }
                        }
                        () = self.nudge.notified() => {}
                    }
                }
                SweepRound::Retry => {
                    let delay = self.policy.delay_for_attempt(attempt);
                    attempt = attempt.saturating_add(1);
                    debug!("Verification sweep backing off for {delay:?}");
                    tokio::select! {
                        changed = shutdown.changed() => {
                            if changed.is_err() || *shutdown.borrow() {
                                break;
                            }
                        }
                        // A fresh record should not wait out an old record's
                        // backoff.
                        () = self.nudge.notified() => {
                            attempt = 0;
                        }
                        () = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
        debug!("Verification sweep stopped");
    }

    async fn sweep_once(&self) -> SweepRound {
        let listed = match self.store.list_pending().await {
            Ok(listed) => listed,
            Err(e) => {
                warn!("Could not list pending receipts: {e}");
                return SweepRound::Retry;
            }
        };
        // An unacknowledged record belongs to a transaction still queued at
        // the provider; verifying it here could grant, purge, and then meet
        // the provider's redelivery as a brand-new purchase. Those records
        // are completed by redelivery, not by the sweep.
        let total = listed.len();
        let pending: Vec<_> = listed.into_iter().filter(|r| r.acknowledged).collect();
        if pending.len() < total {
            debug!(
                "Leaving {} unacknowledged receipt(s) for provider redelivery",
                total - pending.len()
            );
        }
        if pending.is_empty() {
            return SweepRound::Clear;
        }
        debug!("Verifying {} pending receipt(s)", pending.len());

        let Some(verifier) = self.verifier.as_ref() else {
            let mut unresolved = false;
            for record in &pending {
                unresolved |= !self.grant(record).await;
            }
            return if unresolved {
                SweepRound::Retry
            } else {
                SweepRound::Clear
            };
        };

        // Receipts are independent, so verification runs in parallel;
        // outcomes are applied in order afterwards.
        let outcomes =
            futures::future::join_all(pending.iter().map(|record| verifier.verify(record))).await;

        let mut unresolved = false;
        for (record, outcome) in pending.iter().zip(outcomes) {
            match outcome {
                Ok(VerifyOutcome::Granted) => {
                    unresolved |= !self.grant(record).await;
                }
                Ok(VerifyOutcome::Denied(reason)) => {
                    unresolved |= !self.deny(record, &reason).await;
                }
                Ok(VerifyOutcome::RetryLater) => {
                    debug!(
                        "Verification postponed for transaction {}",
                        record.transaction_id
                    );
                    unresolved = true;
                }
                Err(e) => {
                    warn!(
                        "Verification attempt failed for transaction {}: {e}",
                        record.transaction_id
                    );
                    unresolved = true;
                }
            }
        }
        if unresolved {
            SweepRound::Retry
        } else {
            SweepRound::Clear
        }
    }

    /// Purge a confirmed record and announce the grant. The purge comes
    /// first so a failure keeps the record pending instead of granting
    /// twice. Returns false when the record must be retried.
    async fn grant(&self, record: &PendingReceipt) -> bool {
        match self.store.delete(&record.transaction_id).await {
            Ok(()) => {
                info!(
                    "Entitlement granted for transaction {} (product {})",
                    record.transaction_id, record.product_id
                );
                let _ = self.events_tx.send(PurchaseEvent::EntitlementGranted {
                    transaction_id: record.transaction_id.clone(),
                    product_id: record.product_id.clone(),
                });
                true
            }
            Err(e) => {
                warn!(
                    "Could not purge granted receipt {}: {e}",
                    record.transaction_id
                );
                false
            }
        }
    }

    /// Purge a refused record and announce the denial. Returns false when
    /// the record must be retried.
    async fn deny(&self, record: &PendingReceipt, reason: &str) -> bool {
        match self.store.delete(&record.transaction_id).await {
            Ok(()) => {
                warn!(
                    "Verification denied for transaction {}: {reason}",
                    record.transaction_id
                );
                let _ = self.events_tx.send(PurchaseEvent::VerificationDenied {
                    transaction_id: record.transaction_id.clone(),
                    product_id: record.product_id.clone(),
                    reason: reason.to_string(),
                });
                true
            }
            Err(e) => {
                warn!(
                    "Could not purge denied receipt {}: {e}",
                    record.transaction_id
                );
                false
            }
        }
    }
}
