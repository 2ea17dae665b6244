//! File-backed receipt store.
//!
//! One file per pending transaction under a configured directory. Records
//! are MessagePack-encoded and written through a temp file and rename, so a
//! crash mid-write never leaves a half-written record that would later parse
//! as garbage. File names are the hex-encoded transaction identifier, which
//! keeps provider-chosen identifiers filesystem-safe.

use super::{PendingReceipt, ReceiptStore};
use crate::error::{Error, Result};
use async_trait::async_trait;
use std::io::Write;
use std::path::PathBuf;
use tracing::{debug, warn};

const RECEIPT_EXT: &str = "receipt";

/// Durable receipt store rooted at a directory.
pub struct FsReceiptStore {
    dir: PathBuf,
}

impl FsReceiptStore {
    /// Open a store rooted at `dir`, creating the directory if needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        // Temp files are leftovers from a crash mid-write; the rename never
        // happened, so they are not records.
        if let Ok(entries) = std::fs::read_dir(&dir) {
            for entry in entries.flatten() {
                let path = entry.path();
                if path.extension().and_then(|ext| ext.to_str()) == Some("tmp") {
                    let _ = std::fs::remove_file(&path);
                }
            }
        }
        Ok(Self { dir })
    }

    /// Directory the store writes under.
    #[must_use]
    pub fn dir(&self) -> &std::path::Path {
        &self.dir
    }

    fn path_for(&self, transaction_id: &str) -> PathBuf {
        self.dir
            .join(format!("{}.{RECEIPT_EXT}", hex::encode(transaction_id)))
    }
}

#[async_trait]
impl ReceiptStore for FsReceiptStore {
    async fn put(&self, receipt: &PendingReceipt) -> Result<()> {
        let encoded = rmp_serde::to_vec(receipt)
            .map_err(|e| Error::Store(format!("encode receipt: {e}")))?;

        let path = self.path_for(&receipt.transaction_id);
        let tmp = path.with_extension("tmp");

        // The record must be fully on disk before the rename makes it
        // visible; the acknowledgment that follows cannot be taken back.
        let mut file = std::fs::File::create(&tmp)
            .map_err(|e| Error::Store(format!("create {}: {e}", tmp.display())))?;
        file.write_all(&encoded)
            .map_err(|e| Error::Store(format!("write {}: {e}", tmp.display())))?;
        file.sync_all()
            .map_err(|e| Error::Store(format!("sync {}: {e}", tmp.display())))?;
        std::fs::rename(&tmp, &path)
            .map_err(|e| Error::Store(format!("rename {}: {e}", path.display())))?;

        debug!(
            "Recorded pending receipt for transaction {}",
            receipt.transaction_id
        );
        Ok(())
    }

    async fn get(&self, transaction_id: &str) -> Result<Option<PendingReceipt>> {
        let path = self.path_for(transaction_id);
        match std::fs::read(&path) {
            Ok(bytes) => {
                let record = rmp_serde::from_slice(&bytes)
                    .map_err(|e| Error::Store(format!("decode {}: {e}", path.display())))?;
                Ok(Some(record))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::Store(format!("read {}: {e}", path.display()))),
        }
    }

    async fn delete(&self, transaction_id: &str) -> Result<()> {
        let path = self.path_for(transaction_id);
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::Store(format!("remove {}: {e}", path.display()))),
        }
    }

    async fn list_pending(&self) -> Result<Vec<PendingReceipt>> {
        let entries = std::fs::read_dir(&self.dir)
            .map_err(|e| Error::Store(format!("read {}: {e}", self.dir.display())))?;

        let mut pending = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| Error::Store(format!("read dir entry: {e}")))?;
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some(RECEIPT_EXT) {
                continue;
            }
            // An unreadable record is skipped but left on disk for operator
            // inspection; deleting it here would silently drop a purchase.
            match std::fs::read(&path) {
                Ok(bytes) => match rmp_serde::from_slice(&bytes) {
                    Ok(record) => pending.push(record),
                    Err(e) => warn!("Skipping undecodable receipt {}: {e}", path.display()),
                },
                Err(e) => warn!("Skipping unreadable receipt {}: {e}", path.display()),
            }
        }
        Ok(pending)
    }
}
