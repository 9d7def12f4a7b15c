//! Catalog collaborator seams: the read-only product store and the record
//! builder that materializes outbound payloads.

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Map;

use crate::model::{MediaEntry, OutboundRecord, ProductStatus, StockSnapshot};

/// A product as loaded at one store scope. Values reflect that store's
/// localized data; `store_ids`/`website_ids` describe the product's current
/// assignment across the whole catalog.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProductSnapshot {
    pub id: i64,
    pub sku: String,
    /// Scope this snapshot was loaded at.
    pub store_id: i64,
    pub status: ProductStatus,
    pub name: String,
    pub price: f64,
    /// Explicit final-price calculation, when one applies.
    #[serde(default)]
    pub special_price: Option<f64>,
    #[serde(default)]
    pub qty: f64,
    #[serde(default)]
    pub is_in_stock: bool,
    #[serde(default)]
    pub store_ids: Vec<i64>,
    #[serde(default)]
    pub website_ids: Vec<i64>,
    #[serde(default)]
    pub category_ids: Vec<i64>,
    #[serde(default)]
    pub media: Vec<MediaEntry>,
}

impl ProductSnapshot {
    /// Final price prefers the explicit special price, falling back to the
    /// regular price when unset or not lower.
    pub fn final_price(&self) -> f64 {
        match self.special_price {
            Some(special) if special > 0.0 && special < self.price => special,
            _ => self.price,
        }
    }
}

/// Read-only access to the authoritative catalog store. `force_reload`
/// bypasses any read cache; consumers always set it so a batch never ships
/// stale data.
#[async_trait]
pub trait CatalogStore: Send + Sync {
    async fn get_by_id(
        &self,
        id: i64,
        force_reload: bool,
        store_id: Option<i64>,
    ) -> Result<Option<ProductSnapshot>>;

    async fn get_by_sku(
        &self,
        sku: &str,
        force_reload: bool,
        store_id: Option<i64>,
    ) -> Result<Option<ProductSnapshot>>;
}

/// Builds the outbound record for one product snapshot. Pricing, stock,
/// media, and relation enrichment live behind this seam.
pub trait RecordBuilder: Send + Sync {
    fn build_record(&self, product: &ProductSnapshot) -> OutboundRecord;
}

/// Default builder: a direct mapping of the snapshot. Third-party
/// enrichments hook in by wrapping this and filling `extension`.
#[derive(Debug, Clone, Default)]
pub struct DefaultRecordBuilder;

impl RecordBuilder for DefaultRecordBuilder {
    fn build_record(&self, product: &ProductSnapshot) -> OutboundRecord {
        OutboundRecord {
            product_id: product.id,
            sku: product.sku.clone(),
            store_id: product.store_id,
            status: product.status,
            name: product.name.clone(),
            price: product.price,
            final_price: product.final_price(),
            stock: StockSnapshot {
                qty: product.qty,
                is_in_stock: product.is_in_stock,
            },
            category_ids: product.category_ids.clone(),
            media: product.media.clone(),
            // Always present, even when empty, so the external schema is
            // stable.
            extension: Map::new(),
        }
    }
}
