//! Error types for paydesk.

use thiserror::Error;

/// Result type alias for paydesk operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the purchase manager and its collaborators.
#[derive(Debug, Error)]
pub enum Error {
    /// The device-eligibility gate is closed; purchases are disabled on this
    /// device. Reported before any catalog or provider call.
    #[error("purchases are not allowed on this device")]
    DeviceNotEligible,

    /// `buy` was called with no product identifiers.
    #[error("purchase request contains no product identifiers")]
    EmptyRequest,

    /// The product catalog could not be fetched.
    #[error("product catalog unavailable: {0}")]
    CatalogUnavailable(String),

    /// The catalog rejected one or more requested identifiers. A purchase
    /// never proceeds against an unknown price, so nothing was cached.
    #[error("unknown product identifiers: {0:?}")]
    InvalidIdentifiers(Vec<String>),

    /// Another request of the same kind is already in flight.
    #[error("another request is already in progress")]
    RequestInProgress,

    /// Local receipt persistence failed. Always retryable; never surfaced as
    /// a purchase failure.
    #[error("receipt store error: {0}")]
    Store(String),

    /// The trust authority refused a receipt.
    #[error("receipt verification denied: {0}")]
    VerificationDenied(String),

    /// A verification attempt could not reach a conclusion (transport
    /// failure, malformed reply). Treated like a retry-later outcome.
    #[error("receipt verification failed: {0}")]
    Verify(String),

    /// The payment provider rejected a request.
    #[error("payment provider error: {0}")]
    Provider(String),

    /// Invalid configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Classification of a failed provider transaction, surfaced to callers
/// alongside a human-readable message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// The user backed out of the payment flow.
    UserCancelled,
    /// This device or account is not permitted to pay.
    DeviceRestricted,
    /// The store could not complete the purchase right now.
    StoreUnavailable,
    /// Anything the provider did not explain.
    Unknown,
}

impl FailureKind {
    /// Default human-readable description for this kind of failure.
    #[must_use]
    pub fn message(&self) -> &'static str {
        match self {
            Self::UserCancelled => "the purchase was cancelled",
            Self::DeviceRestricted => "this device is not allowed to make purchases",
            Self::StoreUnavailable => "the store is temporarily unavailable, try again later",
            Self::Unknown => "the purchase failed in the store",
        }
    }
}
