//! Receipt verification against the trust authority.
//!
//! ```text
//! pending receipt ──► Verifier::verify ──┬─► Granted    ─► purge + grant event
//!                                        ├─► Denied     ─► purge + denial event
//!                                        └─► RetryLater ─► record kept, next sweep
//! ```
//!
//! Verification never runs on the transaction event path; the background
//! sweep drives it from the durable store.

mod http;
mod retry;

pub use http::HttpVerifier;
pub use retry::RetryPolicy;

use crate::error::Result;
use crate::receipt::PendingReceipt;
use async_trait::async_trait;

/// Outcome of a single verification attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerifyOutcome {
    /// The entitlement is confirmed; the pending record may be purged.
    Granted,

    /// The trust authority refused the receipt. The record is purged and the
    /// refusal surfaced; retrying would not change the answer.
    Denied(String),

    /// The authority could not answer right now; the record stays pending.
    RetryLater,
}

impl VerifyOutcome {
    /// Whether this outcome resolves the pending record.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::RetryLater)
    }
}

/// Boundary to the trust authority that confirms entitlements.
#[async_trait]
pub trait Verifier: Send + Sync {
    /// Verify one receipt.
    ///
    /// # Errors
    ///
    /// Transport failures may be returned as errors; the sweep treats them
    /// exactly like [`VerifyOutcome::RetryLater`].
    async fn verify(&self, receipt: &PendingReceipt) -> Result<VerifyOutcome>;
}
