//! Stock push: consumes stock-change messages and pushes per-website stock
//! snapshots to the connector. Stock is website-wide, so each website
//! resolves to its first store.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, warn};

use crate::catalog::CatalogStore;
use crate::config;
use crate::delivery::Delivery;
use crate::model::{ProductStatus, StockRecord, ADMIN_STORE_ID};
use crate::queue::{QueueError, QueueSource, STOCK_PUSH_TOPIC};
use crate::topology::StoreTopology;

#[derive(Debug, Clone)]
pub struct StockSettings {
    pub enabled: bool,
    pub batch_size: usize,
}

impl From<&config::Push> for StockSettings {
    fn from(push: &config::Push) -> Self {
        Self {
            enabled: push.stock_push_enabled,
            batch_size: push.stock_batch_size,
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawStockMessage {
    id: Option<i64>,
    qty: Option<f64>,
    website_ids: Option<Value>,
}

pub struct StockPusher {
    catalog: Arc<dyn CatalogStore>,
    topology: Arc<StoreTopology>,
    delivery: Arc<dyn Delivery>,
    settings: StockSettings,
}

impl StockPusher {
    pub fn new(
        catalog: Arc<dyn CatalogStore>,
        topology: Arc<StoreTopology>,
        delivery: Arc<dyn Delivery>,
        settings: StockSettings,
    ) -> Self {
        Self {
            catalog,
            topology,
            delivery,
            settings,
        }
    }

    /// Fetch and process one message from the stock push topic. Returns
    /// false when the topic is empty.
    pub async fn drain_once(&self, source: &dyn QueueSource) -> Result<bool, QueueError> {
        let Some(message) = source.next(STOCK_PUSH_TOPIC).await? else {
            return Ok(false);
        };
        self.process_message(&message.payload).await;
        source.ack(&message.id).await?;
        Ok(true)
    }

    /// Process one stock message: `{"id": 42, "qty": 0, "website_ids": [1]}`.
    /// `qty` defaults to 0, a scalar `website_ids` is accepted, and a
    /// missing `website_ids` means the default scope.
    pub async fn process_message(&self, payload: &str) {
        if !self.settings.enabled {
            debug!("stock push disabled, dropping message");
            return;
        }

        let raw: RawStockMessage = match serde_json::from_str(payload) {
            Ok(raw) => raw,
            Err(err) => {
                warn!(%err, payload, "invalid message for stock push queue");
                return;
            }
        };
        let Some(product_id) = raw.id else {
            warn!(payload, "invalid message for stock push queue");
            return;
        };
        let qty = raw.qty.unwrap_or(0.0);

        let websites = match normalize_websites(raw.website_ids) {
            Some(websites) => websites,
            None => {
                warn!(payload, "unexpected website_ids form in stock message");
                return;
            }
        };

        let mut by_store: BTreeMap<i64, Vec<StockRecord>> = BTreeMap::new();
        for website_id in websites {
            let Some(store_id) = self.topology.first_store_of_website(website_id) else {
                debug!(?website_id, "website has no stores, skipping stock push");
                continue;
            };
            if store_id == ADMIN_STORE_ID {
                debug!(?website_id, "stock resolved to the admin store, dropping");
                continue;
            }

            let product = match self.catalog.get_by_id(product_id, true, Some(store_id)).await {
                Ok(Some(product)) => product,
                Ok(None) => continue,
                Err(err) => {
                    warn!(%err, product_id, store_id, "failed to load product for stock push");
                    continue;
                }
            };
            // Stock for disabled products is noise downstream.
            if product.status == ProductStatus::Disabled {
                continue;
            }

            by_store.entry(store_id).or_default().push(StockRecord {
                qty,
                is_in_stock: qty > 0.0,
                sku: product.sku,
                product_id,
                website_id,
                store_id,
            });
        }

        for (store_id, records) in by_store {
            for chunk in records.chunks(self.settings.batch_size) {
                if let Err(err) = self.delivery.push_stock(store_id, chunk).await {
                    warn!(%err, store_id, product_id, "failed to push stock records");
                }
            }
        }
    }
}

/// `website_ids` arrives as a list, a scalar, or not at all (default scope).
fn normalize_websites(value: Option<Value>) -> Option<Vec<Option<i64>>> {
    match value {
        None | Some(Value::Null) => Some(vec![None]),
        Some(Value::Number(n)) => Some(vec![Some(n.as_i64()?)]),
        Some(Value::Array(items)) => items
            .into_iter()
            .map(|item| item.as_i64().map(Some))
            .collect(),
        Some(_) => None,
    }
}
