//! Product catalog cache and the catalog service boundary.
//!
//! Product metadata is fetched from the platform catalog service and cached
//! in memory. The cache is replaced wholesale on every successful load; a
//! partial response never becomes a partial cache, because a purchase must
//! not be submitted against an unknown price.

use crate::error::{Error, Result};
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{info, warn};

/// Kind of purchasable product.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProductKind {
    /// Consumable virtual currency.
    Currency,
    /// A subscription tier.
    Subscription,
    /// Anything else the catalog offers.
    #[default]
    Other,
}

/// Product metadata as reported by the catalog service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Product {
    /// Product identifier.
    pub id: String,

    /// Kind of product.
    pub kind: ProductKind,

    /// Price as a decimal string, exactly as the catalog reports it.
    /// Kept as a string so no floating-point rounding ever touches a price.
    pub price: String,

    /// ISO 4217 currency code for the price.
    pub currency: String,
}

/// Response from the catalog service.
#[derive(Debug, Clone, Default)]
pub struct CatalogResponse {
    /// Products the catalog recognized.
    pub products: Vec<Product>,

    /// Requested identifiers the catalog did not recognize.
    pub invalid_ids: Vec<String>,
}

/// Boundary to the platform product-catalog service.
#[async_trait]
pub trait CatalogClient: Send + Sync {
    /// Fetch metadata for exactly the given product identifiers.
    ///
    /// # Errors
    ///
    /// Returns an error if the catalog service cannot be reached.
    async fn fetch_products(&self, ids: &[String]) -> Result<CatalogResponse>;
}

/// In-memory product cache.
///
/// Populated by [`ProductCatalog::load`] and consulted synchronously by the
/// purchase manager. Lookups return snapshots, so a concurrent reload never
/// hands out a half-replaced view.
#[derive(Default)]
pub struct ProductCatalog {
    products: RwLock<HashMap<String, Product>>,
}

impl ProductCatalog {
    /// Create an empty catalog cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Fetch the given identifiers through `client` and replace the cache.
    ///
    /// Returns the validated products in request order.
    ///
    /// # Errors
    ///
    /// Returns [`Error::CatalogUnavailable`] if the fetch fails or comes back
    /// empty, and [`Error::InvalidIdentifiers`] if the service rejects or
    /// omits any requested identifier. The cache is left untouched on error.
    pub async fn load(&self, client: &dyn CatalogClient, ids: &[String]) -> Result<Vec<Product>> {
        let response = client
            .fetch_products(ids)
            .await
            .map_err(|e| Error::CatalogUnavailable(e.to_string()))?;

        // Identifiers the service rejected outright, plus any it silently
        // dropped from the response.
        let mut invalid = response.invalid_ids.clone();
        for id in ids {
            let returned = response.products.iter().any(|p| &p.id == id);
            if !returned && !invalid.contains(id) {
                invalid.push(id.clone());
            }
        }
        if !invalid.is_empty() {
            warn!("Catalog rejected {} product identifier(s)", invalid.len());
            return Err(Error::InvalidIdentifiers(invalid));
        }
        if response.products.is_empty() {
            return Err(Error::CatalogUnavailable(
                "catalog returned no products".to_string(),
            ));
        }

        let mut cache = HashMap::with_capacity(response.products.len());
        for product in &response.products {
            cache.insert(product.id.clone(), product.clone());
        }
        *self.products.write() = cache;

        info!("Product catalog loaded ({} products)", response.products.len());
        Ok(response.products)
    }

    /// Look up a cached product.
    #[must_use]
    pub fn lookup(&self, product_id: &str) -> Option<Product> {
        self.products.read().get(product_id).cloned()
    }

    /// Whether a product is cached.
    #[must_use]
    pub fn contains(&self, product_id: &str) -> bool {
        self.products.read().contains_key(product_id)
    }

    /// Number of cached products.
    #[must_use]
    pub fn len(&self) -> usize {
        self.products.read().len()
    }

    /// Whether the cache is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.products.read().is_empty()
    }
}
