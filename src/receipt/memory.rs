//! In-memory receipt store.

use super::{PendingReceipt, ReceiptStore};
use crate::error::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;

/// Process-local receipt store.
///
/// Provides none of the durability the purchase lifecycle depends on in
/// production; intended for tests and prototyping.
#[derive(Default)]
pub struct MemoryReceiptStore {
    records: Mutex<HashMap<String, PendingReceipt>>,
}

impl MemoryReceiptStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of pending records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    /// Whether the store holds no records.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }
}

#[async_trait]
impl ReceiptStore for MemoryReceiptStore {
    async fn put(&self, receipt: &PendingReceipt) -> Result<()> {
        self.records
            .lock()
            .insert(receipt.transaction_id.clone(), receipt.clone());
        Ok(())
    }

    async fn get(&self, transaction_id: &str) -> Result<Option<PendingReceipt>> {
        Ok(self.records.lock().get(transaction_id).cloned())
    }

    async fn delete(&self, transaction_id: &str) -> Result<()> {
        self.records.lock().remove(transaction_id);
        Ok(())
    }

    async fn list_pending(&self) -> Result<Vec<PendingReceipt>> {
        Ok(self.records.lock().values().cloned().collect())
    }
}
