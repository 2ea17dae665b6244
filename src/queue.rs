//! Payment provider boundary.
//!
//! The platform payment queue is an external system: the manager submits
//! payments and acknowledgments through [`PaymentQueue`] and consumes the
//! transaction event stream the provider delivers. Delivery is unordered and
//! at-least-once; duplicate suppression happens in the manager, not here.

use crate::catalog::Product;
use crate::error::{FailureKind, Result};
use async_trait::async_trait;
use bytes::Bytes;

/// Transaction states observed from the payment provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransactionState {
    /// The payment is being processed by the provider.
    Purchasing,

    /// The payment succeeded.
    Purchased {
        /// Raw proof-of-purchase blob, exactly as the provider supplied it.
        receipt: Bytes,
    },

    /// A previously purchased transaction was replayed by the restoration
    /// flow.
    Restored {
        /// Raw proof-of-purchase blob, exactly as the provider supplied it.
        receipt: Bytes,
    },

    /// The payment failed or was cancelled.
    Failed {
        /// Provider-supplied failure cause.
        error: TransactionError,
    },

    /// The payment awaits approval outside the device and may stay here
    /// indefinitely. Not a failure; never acknowledged.
    Deferred,
}

/// A transaction state change delivered by the provider.
#[derive(Debug, Clone)]
pub struct TransactionUpdate {
    /// Provider-assigned transaction identifier.
    pub transaction_id: String,

    /// Product the transaction pays for.
    pub product_id: String,

    /// New state of the transaction.
    pub state: TransactionState,
}

/// Events delivered by the payment provider.
#[derive(Debug, Clone)]
pub enum QueueEvent {
    /// A transaction changed state.
    TransactionUpdated(TransactionUpdate),

    /// The provider finished replaying restorable transactions.
    RestoreCompleted,

    /// The provider could not run the restoration flow.
    RestoreFailed {
        /// Provider-supplied failure description.
        message: String,
    },
}

/// Failure causes reported by the payment provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransactionError {
    /// The user cancelled the payment sheet.
    PaymentCancelled,

    /// Payments are not allowed for this device or account.
    PaymentNotAllowed,

    /// The client is not eligible to perform the request.
    ClientInvalid,

    /// The product is not available in the current storefront.
    ProductNotAvailable,

    /// The provider's backing service refused the request.
    CloudServiceDenied,

    /// Any other provider failure.
    Other(String),
}

impl TransactionError {
    /// Classify the provider failure for callers.
    #[must_use]
    pub fn classify(&self) -> FailureKind {
        match self {
            Self::PaymentCancelled => FailureKind::UserCancelled,
            Self::PaymentNotAllowed | Self::ClientInvalid => FailureKind::DeviceRestricted,
            Self::ProductNotAvailable | Self::CloudServiceDenied => FailureKind::StoreUnavailable,
            Self::Other(_) => FailureKind::Unknown,
        }
    }

    /// Human-readable description of the failure.
    #[must_use]
    pub fn message(&self) -> String {
        match self {
            Self::Other(message) => message.clone(),
            other => other.classify().message().to_string(),
        }
    }
}

/// Boundary to the platform payment queue.
///
/// Implementations wrap the platform's native payment service. Submissions
/// are fire-and-forget; every outcome arrives later as a [`QueueEvent`] on
/// the manager's intake channel.
#[async_trait]
pub trait PaymentQueue: Send + Sync {
    /// Whether this device is allowed to make payments at all.
    fn can_make_payments(&self) -> bool;

    /// Submit a payment for one product.
    ///
    /// # Errors
    ///
    /// Returns an error only if the provider refuses to accept the
    /// submission; payment outcomes are delivered as events.
    async fn add_payment(&self, product: &Product) -> Result<()>;

    /// Acknowledge a transaction, removing it from the provider's pending
    /// queue. Must only be called once the receipt is durably recorded, or
    /// for failed transactions, which carry no entitlement.
    ///
    /// # Errors
    ///
    /// Returns an error if the provider rejects the acknowledgment; the
    /// transaction stays queued and will be redelivered.
    async fn finish_transaction(&self, transaction_id: &str) -> Result<()>;

    /// Ask the provider to replay previously purchased, unconsumed
    /// transactions as [`TransactionState::Restored`] updates, terminated by
    /// a [`QueueEvent::RestoreCompleted`] or [`QueueEvent::RestoreFailed`].
    ///
    /// # Errors
    ///
    /// Returns an error if the provider refuses to start the replay.
    async fn restore_completed_transactions(&self) -> Result<()>;
}
