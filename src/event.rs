//! Purchase lifecycle event system.

use crate::error::FailureKind;
use tokio::sync::broadcast;

/// Events emitted by the purchase manager.
///
/// Observed events (grants, denials, failures) may recur across launches for
/// transactions the provider redelivers; subscribers that apply entitlements
/// should key on the transaction identifier.
#[derive(Debug, Clone)]
pub enum PurchaseEvent {
    /// The product catalog was reloaded.
    CatalogLoaded {
        /// Number of products now cached.
        count: usize,
    },

    /// A transaction is parked awaiting approval outside the device.
    TransactionDeferred {
        /// Provider transaction identifier.
        transaction_id: String,
        /// Product identifier.
        product_id: String,
    },

    /// A purchase was durably recorded and acknowledged to the provider.
    PurchaseRecorded {
        /// Provider transaction identifier.
        transaction_id: String,
        /// Product identifier.
        product_id: String,
        /// Whether the transaction came from the restoration flow.
        restored: bool,
    },

    /// An entitlement was confirmed; the pending record has been purged.
    EntitlementGranted {
        /// Provider transaction identifier.
        transaction_id: String,
        /// Product identifier.
        product_id: String,
    },

    /// The trust authority refused a receipt; the pending record has been
    /// dropped.
    VerificationDenied {
        /// Provider transaction identifier.
        transaction_id: String,
        /// Product identifier.
        product_id: String,
        /// Authority-supplied refusal reason.
        reason: String,
    },

    /// A purchase failed in the provider.
    PurchaseFailed {
        /// Product identifier.
        product_id: String,
        /// Failure classification.
        kind: FailureKind,
        /// Human-readable failure description.
        message: String,
    },

    /// A restoration pass finished.
    RestoreCompleted {
        /// Number of transactions replayed in this pass.
        restored: usize,
    },

    /// A restoration pass failed in the provider.
    RestoreFailed {
        /// Provider-supplied failure description.
        message: String,
    },
}

/// Channel for receiving purchase events.
pub type PurchaseEventsChannel = broadcast::Receiver<PurchaseEvent>;

/// Sender for purchase events.
pub type PurchaseEventsSender = broadcast::Sender<PurchaseEvent>;

/// Create a new event channel pair.
#[must_use]
pub fn create_event_channel() -> (PurchaseEventsSender, PurchaseEventsChannel) {
    broadcast::channel(256)
}
