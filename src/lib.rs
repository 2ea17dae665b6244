//! Reliable purchase lifecycle management for platform in-app purchases.
//!
//! paydesk mediates purchases of digital goods (virtual currency,
//! subscription tiers) sold through a platform payment service. Its job is a
//! durability contract: every purchase is recorded on disk before it is
//! acknowledged to the payment provider, and entitlement verification is
//! retried until it succeeds, across process restarts. A crash at any point
//! either leaves the transaction queued at the provider or leaves a durable
//! record here; a paid purchase is never lost.
//!
//! ```text
//!  buy(ids) ──► eligibility ──► catalog load ──► add_payment per product
//!                                                        │
//!              provider transaction events ◄─────────────┘
//!                           │
//!                           ▼
//!              orchestrator (one event at a time)
//!              record receipt ─► acknowledge ─► outcome to caller
//!                           │
//!                           ▼
//!              verification sweep (backoff, never abandoned)
//!              Granted ─► purge record + grant event
//! ```
//!
//! The payment queue, product catalog and trust authority are collaborator
//! traits injected through [`PurchaseManagerBuilder`]; the crate ships a
//! durable file store, an in-memory store and an HTTP verifier.
//!
//! # Example
//!
//! ```no_run
//! use paydesk::{ManagerConfig, PurchaseManagerBuilder};
//! # use std::sync::Arc;
//! # async fn example(
//! #     catalog: Arc<dyn paydesk::CatalogClient>,
//! #     queue: Arc<dyn paydesk::PaymentQueue>,
//! # ) -> paydesk::Result<()> {
//! let manager = PurchaseManagerBuilder::new(ManagerConfig::default())
//!     .with_catalog_client(catalog)
//!     .with_payment_queue(queue)
//!     .build()
//!     .await?;
//!
//! let mut purchase = manager.buy(&["coin_100".to_string()]).await?;
//! while let Some(outcome) = purchase.outcomes.recv().await {
//!     println!("{outcome:?}");
//! }
//! # Ok(())
//! # }
//! ```

pub mod catalog;
pub mod config;
pub mod error;
pub mod event;
pub mod manager;
pub mod queue;
pub mod receipt;
pub mod verify;

pub use catalog::{CatalogClient, CatalogResponse, Product, ProductCatalog, ProductKind};
pub use config::{ManagerConfig, SweepConfig, VerifyConfig};
pub use error::{Error, FailureKind, Result};
pub use event::{
    create_event_channel, PurchaseEvent, PurchaseEventsChannel, PurchaseEventsSender,
};
pub use manager::{
    PendingPurchase, PendingRestore, PurchaseManager, PurchaseManagerBuilder, PurchaseOutcome,
    QueueSink, RestoreOutcome,
};
pub use queue::{
    PaymentQueue, QueueEvent, TransactionError, TransactionState, TransactionUpdate,
};
pub use receipt::{FsReceiptStore, MemoryReceiptStore, PendingReceipt, ReceiptStore};
pub use verify::{HttpVerifier, RetryPolicy, Verifier, VerifyOutcome};
