//! Durable storage for pending proof-of-purchase records.
//!
//! A [`PendingReceipt`] is written the moment a transaction reaches the
//! purchased or restored state, strictly before the transaction is
//! acknowledged to the payment provider. The record is removed only once the
//! entitlement is confirmed. A crash between acknowledgment and removal
//! leaves the record behind for the next launch to re-verify; the reverse
//! ordering would lose the purchase.

mod fs;
mod memory;

pub use fs::FsReceiptStore;
pub use memory::MemoryReceiptStore;

use crate::error::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A durably stored proof of purchase awaiting grant confirmation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingReceipt {
    /// Provider-assigned transaction identifier. Primary key.
    pub transaction_id: String,

    /// Product the transaction pays for.
    pub product_id: String,

    /// Raw proof-of-purchase blob, exactly as the provider supplied it.
    pub receipt: Vec<u8>,

    /// Whether the transaction has been acknowledged to the payment
    /// provider. Only acknowledged records are eligible for verification;
    /// an unacknowledged record belongs to a transaction still queued at
    /// the provider, and is completed by the provider's redelivery.
    #[serde(default)]
    pub acknowledged: bool,

    /// When the record was first written.
    pub created_at: DateTime<Utc>,
}

impl PendingReceipt {
    /// Create a record timestamped now.
    #[must_use]
    pub fn new(
        transaction_id: impl Into<String>,
        product_id: impl Into<String>,
        receipt: Vec<u8>,
    ) -> Self {
        Self {
            transaction_id: transaction_id.into(),
            product_id: product_id.into(),
            receipt,
            acknowledged: false,
            created_at: Utc::now(),
        }
    }
}

/// Durable key-value persistence for pending receipts.
///
/// Store failures are always retryable from the manager's point of view and
/// never surface as purchase failures.
#[async_trait]
pub trait ReceiptStore: Send + Sync {
    /// Persist a record, replacing any record with the same transaction
    /// identifier.
    ///
    /// # Errors
    ///
    /// Returns an error if the record could not be made durable.
    async fn put(&self, receipt: &PendingReceipt) -> Result<()>;

    /// Fetch the record for a transaction identifier.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read.
    async fn get(&self, transaction_id: &str) -> Result<Option<PendingReceipt>>;

    /// Remove the record for a transaction identifier. Removing a missing
    /// record is not an error.
    ///
    /// # Errors
    ///
    /// Returns an error if an existing record could not be removed.
    async fn delete(&self, transaction_id: &str) -> Result<()>;

    /// List every pending record, in no particular order.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be enumerated.
    async fn list_pending(&self) -> Result<Vec<PendingReceipt>>;
}
