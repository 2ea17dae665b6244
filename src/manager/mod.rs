//! Purchase manager construction and the public request surface.

mod orchestrator;
mod sweep;

use crate::catalog::{CatalogClient, Product, ProductCatalog};
use crate::config::ManagerConfig;
use crate::error::{Error, FailureKind, Result};
use crate::event::{
    create_event_channel, PurchaseEvent, PurchaseEventsChannel, PurchaseEventsSender,
};
use crate::queue::{PaymentQueue, QueueEvent};
use crate::receipt::{FsReceiptStore, PendingReceipt, ReceiptStore};
use crate::verify::{HttpVerifier, RetryPolicy, Verifier};
use orchestrator::{
    AckedSet, ActiveBuy, ActiveRestore, FlightState, IntakeEvent, Orchestrator,
    DEFAULT_ACKED_CAPACITY,
};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use sweep::Sweeper;
use tokio::sync::{mpsc, watch, Notify};
use tracing::{info, warn};

/// Capacity of the provider event intake channel.
const INTAKE_CAPACITY: usize = 256;

/// Outcomes delivered for an accepted purchase.
///
/// Each submitted product receives exactly one terminal outcome
/// ([`Completed`](Self::Completed) or [`Failed`](Self::Failed)), possibly
/// preceded by a [`Deferred`](Self::Deferred) notice.
#[derive(Debug, Clone)]
pub enum PurchaseOutcome {
    /// The provider parked the transaction pending approval outside the
    /// device. Not terminal; a later outcome follows for the same product.
    Deferred {
        /// Provider transaction identifier.
        transaction_id: String,
        /// Product identifier.
        product_id: String,
    },

    /// The purchase was durably recorded and acknowledged. Grant or denial
    /// arrives later on the event channel once verification resolves.
    Completed {
        /// Provider transaction identifier.
        transaction_id: String,
        /// Product identifier.
        product_id: String,
    },

    /// The purchase failed in the provider.
    Failed {
        /// Product identifier.
        product_id: String,
        /// Failure classification.
        kind: FailureKind,
        /// Human-readable failure description.
        message: String,
    },
}

/// Outcomes delivered for an accepted restoration pass.
#[derive(Debug, Clone)]
pub enum RestoreOutcome {
    /// A previously purchased transaction was replayed and recorded.
    Restored {
        /// Provider transaction identifier.
        transaction_id: String,
        /// Product identifier.
        product_id: String,
    },

    /// The provider finished replaying.
    Finished {
        /// Number of transactions replayed in this pass.
        restored: usize,
    },

    /// The provider could not restore.
    Failed {
        /// Provider-supplied failure description.
        message: String,
    },
}

/// A purchase accepted by the manager.
///
/// Dropping the handle abandons interest in the outcomes without cancelling
/// anything: the underlying transactions still complete, persist and
/// acknowledge, and their grants still arrive on the event channel.
#[derive(Debug)]
pub struct PendingPurchase {
    /// The validated catalog subset the purchase was submitted against.
    pub products: Vec<Product>,

    /// Stream of [`PurchaseOutcome`]s; closes once every product has
    /// resolved.
    pub outcomes: mpsc::UnboundedReceiver<PurchaseOutcome>,
}

/// A restoration pass accepted by the manager.
#[derive(Debug)]
pub struct PendingRestore {
    /// One [`RestoreOutcome::Restored`] per replayed transaction, terminated
    /// by [`RestoreOutcome::Finished`] or [`RestoreOutcome::Failed`].
    pub outcomes: mpsc::UnboundedReceiver<RestoreOutcome>,
}

/// Sender half of the manager's provider event intake.
///
/// Platform glue (or a test double) pushes every transaction observation
/// through this handle; the manager consumes them one at a time, in arrival
/// order.
#[derive(Clone, Debug)]
pub struct QueueSink {
    tx: mpsc::Sender<IntakeEvent>,
}

impl QueueSink {
    /// Deliver one provider event to the manager.
    ///
    /// # Errors
    ///
    /// Returns an error if the manager has shut down.
    pub async fn send(&self, event: QueueEvent) -> Result<()> {
        self.tx
            .send(IntakeEvent::Queue(event))
            .await
            .map_err(|_| Error::Provider("event intake is closed".to_string()))
    }
}

/// Builder for constructing a purchase manager.
pub struct PurchaseManagerBuilder {
    config: ManagerConfig,
    catalog_client: Option<Arc<dyn CatalogClient>>,
    store: Option<Arc<dyn ReceiptStore>>,
    verifier: Option<Arc<dyn Verifier>>,
    queue: Option<Arc<dyn PaymentQueue>>,
}

impl PurchaseManagerBuilder {
    /// Create a new builder with the given configuration.
    #[must_use]
    pub fn new(config: ManagerConfig) -> Self {
        Self {
            config,
            catalog_client: None,
            store: None,
            verifier: None,
            queue: None,
        }
    }

    /// Set the catalog service client. Required.
    #[must_use]
    pub fn with_catalog_client(mut self, client: Arc<dyn CatalogClient>) -> Self {
        self.catalog_client = Some(client);
        self
    }

    /// Set the receipt store. Defaults to an [`FsReceiptStore`] under the
    /// configured receipt directory.
    #[must_use]
    pub fn with_receipt_store(mut self, store: Arc<dyn ReceiptStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Set the receipt verifier. Defaults to an [`HttpVerifier`] against the
    /// configured endpoint; ignored in local-verification mode.
    #[must_use]
    pub fn with_verifier(mut self, verifier: Arc<dyn Verifier>) -> Self {
        self.verifier = Some(verifier);
        self
    }

    /// Set the payment queue. Required.
    #[must_use]
    pub fn with_payment_queue(mut self, queue: Arc<dyn PaymentQueue>) -> Self {
        self.queue = Some(queue);
        self
    }

    /// Build the manager and start its background tasks.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid, a required
    /// collaborator is missing, or a default collaborator cannot be
    /// constructed.
    pub async fn build(self) -> Result<PurchaseManager> {
        self.config.validate()?;

        let catalog_client = self
            .catalog_client
            .ok_or_else(|| Error::Config("a catalog client is required".to_string()))?;
        let queue = self
            .queue
            .ok_or_else(|| Error::Config("a payment queue is required".to_string()))?;

        let store: Arc<dyn ReceiptStore> = match self.store {
            Some(store) => store,
            None => Arc::new(FsReceiptStore::open(&self.config.receipt_dir)?),
        };

        let verifier: Option<Arc<dyn Verifier>> = if self.config.in_app_verify {
            if self.verifier.is_some() {
                warn!("Local verification configured; injected verifier will not be used");
            }
            None
        } else {
            match self.verifier {
                Some(verifier) => Some(verifier),
                None => Some(Arc::new(HttpVerifier::new(
                    &self.config.verify,
                    self.config.sandbox,
                )?)),
            }
        };

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (events_tx, events_rx) = create_event_channel();
        let (intake_tx, intake_rx) = mpsc::channel(INTAKE_CAPACITY);

        let catalog = Arc::new(ProductCatalog::new());
        let state = Arc::new(Mutex::new(FlightState::default()));
        let sweep_nudge = Arc::new(Notify::new());

        let orchestrator = Orchestrator {
            store: Arc::clone(&store),
            queue: Arc::clone(&queue),
            events_tx: events_tx.clone(),
            state: Arc::clone(&state),
            acked: AckedSet::with_capacity(DEFAULT_ACKED_CAPACITY),
            sweep_nudge: Arc::clone(&sweep_nudge),
            local_verify: self.config.in_app_verify,
        };
        tokio::spawn(orchestrator.run(intake_rx, shutdown_rx.clone()));

        let sweeper = Sweeper {
            store: Arc::clone(&store),
            verifier,
            events_tx: events_tx.clone(),
            policy: RetryPolicy::from(&self.config.sweep),
            nudge: Arc::clone(&sweep_nudge),
        };
        tokio::spawn(sweeper.run(shutdown_rx));

        info!(
            "Purchase manager started (local verify: {}, sandbox: {})",
            self.config.in_app_verify, self.config.sandbox
        );

        Ok(PurchaseManager {
            config: self.config,
            catalog,
            catalog_client,
            queue,
            store,
            state,
            events_tx,
            events_rx: Some(events_rx),
            intake_tx,
            shutdown_tx,
        })
    }
}

/// The purchase transaction lifecycle manager.
///
/// Owns the product cache, the durable receipt store and the background
/// tasks that drive transactions from submission to granted entitlement.
/// Dropping the manager stops the background tasks; durable records survive
/// for the next instance to resolve.
pub struct PurchaseManager {
    config: ManagerConfig,
    catalog: Arc<ProductCatalog>,
    catalog_client: Arc<dyn CatalogClient>,
    queue: Arc<dyn PaymentQueue>,
    store: Arc<dyn ReceiptStore>,
    state: Arc<Mutex<FlightState>>,
    events_tx: PurchaseEventsSender,
    events_rx: Option<PurchaseEventsChannel>,
    intake_tx: mpsc::Sender<IntakeEvent>,
    shutdown_tx: watch::Sender<bool>,
}

impl std::fmt::Debug for PurchaseManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PurchaseManager")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl PurchaseManager {
    /// Start a purchase for the given product identifiers.
    ///
    /// Validates eligibility and the catalog, submits one payment per
    /// product and returns without waiting for the payment flow. Terminal
    /// outcomes arrive on the returned handle; grants and denials arrive on
    /// the event channel once verification resolves.
    ///
    /// # Errors
    ///
    /// - [`Error::DeviceNotEligible`] if the device cannot make payments.
    /// - [`Error::EmptyRequest`] if `product_ids` is empty.
    /// - [`Error::RequestInProgress`] if another purchase is in flight.
    /// - [`Error::CatalogUnavailable`] or [`Error::InvalidIdentifiers`] if
    ///   catalog validation fails; nothing was submitted.
    pub async fn buy(&self, product_ids: &[String]) -> Result<PendingPurchase> {
        // Eligibility is checked before any network traffic.
        if !self.queue.can_make_payments() {
            return Err(Error::DeviceNotEligible);
        }
        if product_ids.is_empty() {
            return Err(Error::EmptyRequest);
        }

        // One payment per product; duplicates collapse.
        let mut unique: Vec<String> = Vec::with_capacity(product_ids.len());
        for id in product_ids {
            if !unique.contains(id) {
                unique.push(id.clone());
            }
        }

        let (outcomes_tx, outcomes_rx) = mpsc::unbounded_channel();
        {
            let mut state = self.state.lock();
            if state.buy.is_some() {
                return Err(Error::RequestInProgress);
            }
            state.buy = Some(ActiveBuy {
                outstanding: HashSet::new(),
                outcomes: outcomes_tx,
            });
        }

        // Catalog validation; failure releases the claim with nothing
        // submitted.
        let products = match self.catalog.load(self.catalog_client.as_ref(), &unique).await {
            Ok(products) => products,
            Err(e) => {
                self.state.lock().buy = None;
                return Err(e);
            }
        };
        let _ = self.events_tx.send(PurchaseEvent::CatalogLoaded {
            count: products.len(),
        });

        // Outcomes for these products can only arrive after the payments
        // below are submitted, so the claim is armed before submission.
        {
            let mut state = self.state.lock();
            if let Some(active) = state.buy.as_mut() {
                active.outstanding = products.iter().map(|p| p.id.clone()).collect();
            }
        }

        for product in &products {
            if let Err(e) = self.queue.add_payment(product).await {
                // A rejected submission gets a terminal outcome like any
                // other failure; the remaining products proceed.
                warn!("Payment submission failed for {}: {e}", product.id);
                let kind = FailureKind::StoreUnavailable;
                let message = e.to_string();
                let _ = self.events_tx.send(PurchaseEvent::PurchaseFailed {
                    product_id: product.id.clone(),
                    kind,
                    message: message.clone(),
                });
                let mut state = self.state.lock();
                if let Some(active) = state.buy.as_mut() {
                    if active.outstanding.remove(&product.id) {
                        let _ = active.outcomes.send(PurchaseOutcome::Failed {
                            product_id: product.id.clone(),
                            kind,
                            message,
                        });
                        if active.outstanding.is_empty() {
                            state.buy = None;
                        }
                    }
                }
            }
        }

        info!("Purchase submitted for {} product(s)", products.len());
        Ok(PendingPurchase {
            products,
            outcomes: outcomes_rx,
        })
    }

    /// Ask the provider to replay previously purchased, unconsumed
    /// transactions. Each replayed transaction is recorded and verified
    /// exactly like a fresh purchase.
    ///
    /// # Errors
    ///
    /// Returns [`Error::RequestInProgress`] if a restoration is already in
    /// flight, or [`Error::Provider`] if the provider refuses the request.
    pub async fn restore(&self) -> Result<PendingRestore> {
        let (outcomes_tx, outcomes_rx) = mpsc::unbounded_channel();
        let generation = {
            let mut state = self.state.lock();
            if state.restore.is_some() {
                return Err(Error::RequestInProgress);
            }
            state.restore_generation += 1;
            let generation = state.restore_generation;
            state.restore = Some(ActiveRestore {
                outcomes: outcomes_tx,
                restored: 0,
                generation,
                armed: false,
            });
            generation
        };

        // The arming marker travels through the intake behind any provider
        // events already queued there, so a stale completion signal from an
        // earlier pass cannot resolve this one.
        if self
            .intake_tx
            .send(IntakeEvent::RestoreArmed { generation })
            .await
            .is_err()
        {
            self.state.lock().restore = None;
            return Err(Error::Provider("event intake is closed".to_string()));
        }

        if let Err(e) = self.queue.restore_completed_transactions().await {
            self.state.lock().restore = None;
            return Err(Error::Provider(format!("restoration request failed: {e}")));
        }

        info!("Restoration requested");
        Ok(PendingRestore {
            outcomes: outcomes_rx,
        })
    }

    /// Whether this device is allowed to make payments.
    #[must_use]
    pub fn can_make_payments(&self) -> bool {
        self.queue.can_make_payments()
    }

    /// Look up a product from the last successful catalog load.
    #[must_use]
    pub fn lookup(&self, product_id: &str) -> Option<Product> {
        self.catalog.lookup(product_id)
    }

    /// Whether a product is in the catalog cache.
    #[must_use]
    pub fn contains(&self, product_id: &str) -> bool {
        self.catalog.contains(product_id)
    }

    /// Durable records still awaiting grant confirmation.
    ///
    /// # Errors
    ///
    /// Returns an error if the receipt store cannot be read.
    pub async fn pending_receipts(&self) -> Result<Vec<PendingReceipt>> {
        self.store.list_pending().await
    }

    /// Get a receiver for purchase events.
    ///
    /// Note: Can only be called once. Subsequent calls return None.
    pub fn events(&mut self) -> Option<PurchaseEventsChannel> {
        self.events_rx.take()
    }

    /// Subscribe to purchase events.
    #[must_use]
    pub fn subscribe_events(&self) -> PurchaseEventsChannel {
        self.events_tx.subscribe()
    }

    /// Handle for delivering provider queue events. Platform glue pushes
    /// every transaction observation through it.
    #[must_use]
    pub fn queue_sink(&self) -> QueueSink {
        QueueSink {
            tx: self.intake_tx.clone(),
        }
    }

    /// The configuration the manager was built with.
    #[must_use]
    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    /// Request the background tasks to shut down.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }
}
