//! HTTP verification client.
//!
//! Posts the base64-encoded receipt blob to the trust authority and maps the
//! JSON status reply onto a [`VerifyOutcome`]. The production or sandbox
//! endpoint is chosen at construction, mirroring the platform's sandbox
//! switch.

use super::{Verifier, VerifyOutcome};
use crate::config::VerifyConfig;
use crate::error::{Error, Result};
use crate::receipt::PendingReceipt;
use async_trait::async_trait;
use base64::Engine as _;
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, warn};

/// Authority statuses that indicate a transient server-side condition.
const RETRYABLE_STATUSES: &[u64] = &[21005, 21009];

/// Verifies receipts over HTTPS against a configured endpoint.
pub struct HttpVerifier {
    endpoint: String,
    client: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct VerifyReply {
    status: u64,
}

impl HttpVerifier {
    /// Create a verifier against the endpoint selected by `sandbox`.
    ///
    /// # Errors
    ///
    /// Returns an error if the selected endpoint is empty or the HTTP client
    /// cannot be constructed.
    pub fn new(config: &VerifyConfig, sandbox: bool) -> Result<Self> {
        let endpoint = config.endpoint_for(sandbox);
        if endpoint.is_empty() {
            return Err(Error::Config(
                "verification endpoint is not configured".to_string(),
            ));
        }
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| Error::Config(format!("build verification client: {e}")))?;
        Ok(Self {
            endpoint: endpoint.to_string(),
            client,
        })
    }

    /// Endpoint this verifier posts to.
    #[must_use]
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn outcome_for_status(status: u64) -> VerifyOutcome {
        match status {
            0 => VerifyOutcome::Granted,
            s if RETRYABLE_STATUSES.contains(&s) => VerifyOutcome::RetryLater,
            s => VerifyOutcome::Denied(format!("verification status {s}")),
        }
    }
}

#[async_trait]
impl Verifier for HttpVerifier {
    async fn verify(&self, receipt: &PendingReceipt) -> Result<VerifyOutcome> {
        let body = serde_json::json!({
            "receipt-data": base64::engine::general_purpose::STANDARD.encode(&receipt.receipt),
            "transaction-id": receipt.transaction_id,
            "product-id": receipt.product_id,
        });

        debug!(
            "Verifying receipt for transaction {} against {}",
            receipt.transaction_id, self.endpoint
        );

        let response = self
            .client
            .post(&self.endpoint)
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::Verify(format!("verification request failed: {e}")))?;

        // An HTTP-level failure says nothing about the receipt itself.
        if !response.status().is_success() {
            warn!(
                "Verification endpoint returned HTTP {} for transaction {}",
                response.status(),
                receipt.transaction_id
            );
            return Ok(VerifyOutcome::RetryLater);
        }

        let reply: VerifyReply = response
            .json()
            .await
            .map_err(|e| Error::Verify(format!("malformed verification reply: {e}")))?;

        Ok(Self::outcome_for_status(reply.status))
    }
}
