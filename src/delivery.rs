//! Delivery client for the external commerce connector.
//!
//! One HTTP call carries all records for one store; the external system
//! never accepts multi-store batches. No retries here: the queue transport's
//! redelivery is the retry mechanism, failures surface upward for the
//! consumer to log and move on.

use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use futures::future::join_all;
use reqwest::{Client, Url};
use serde::Serialize;
use tracing::{debug, warn};

use crate::model::{OutboundRecord, StockRecord, ADMIN_STORE_ID};

/// Connector product update endpoint.
pub const ENDPOINT_PRODUCT_UPDATE: &str = "ingest/product";
/// Connector stock update endpoint.
pub const ENDPOINT_STOCK_UPDATE: &str = "ingest/product-stock";

#[async_trait]
pub trait Delivery: Send + Sync {
    /// Push all product records for one store in one request body.
    async fn push_products(&self, store_id: i64, records: &[OutboundRecord]) -> Result<()>;

    /// Push stock records for one store.
    async fn push_stock(&self, store_id: i64, records: &[StockRecord]) -> Result<()>;
}

pub struct ConnectorClient {
    http: Client,
    base_url: Url,
    api_key: String,
}

impl ConnectorClient {
    pub fn new(base_url: &str, api_key: &str, timeout: Duration) -> Result<Self> {
        let base_url = Url::parse(base_url).context("invalid connector base URL")?;
        // Per-call timeout so one slow store cannot stall a whole batch.
        let http = Client::builder()
            .user_agent("commerce-sync/0.1")
            .timeout(timeout)
            .build()
            .context("failed to build connector HTTP client")?;
        Ok(Self {
            http,
            base_url,
            api_key: api_key.to_string(),
        })
    }

    async fn post_json<T: Serialize + ?Sized>(
        &self,
        endpoint: &str,
        store_id: i64,
        body: &T,
    ) -> Result<()> {
        let url = self
            .base_url
            .join(endpoint)
            .context("invalid connector endpoint")?;
        let res = self
            .http
            .post(url)
            .header("X-API-Key", &self.api_key)
            .header("X-Store-Id", store_id.to_string())
            .json(body)
            .send()
            .await
            .context("failed to reach commerce connector")?;

        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            return Err(anyhow!("connector error {status} for store {store_id}: {body}"));
        }
        Ok(())
    }
}

#[async_trait]
impl Delivery for ConnectorClient {
    async fn push_products(&self, store_id: i64, records: &[OutboundRecord]) -> Result<()> {
        // Final backstop: admin-scope records are never delivered, even if a
        // resolver edge case let one through.
        if store_id == ADMIN_STORE_ID {
            warn!(count = records.len(), "dropping records addressed to the admin store");
            return Ok(());
        }
        if records.is_empty() {
            return Ok(());
        }
        debug!(store_id, count = records.len(), "pushing product records");
        self.post_json(ENDPOINT_PRODUCT_UPDATE, store_id, records).await
    }

    async fn push_stock(&self, store_id: i64, records: &[StockRecord]) -> Result<()> {
        if store_id == ADMIN_STORE_ID {
            warn!(count = records.len(), "dropping stock records addressed to the admin store");
            return Ok(());
        }
        if records.is_empty() {
            return Ok(());
        }
        debug!(store_id, count = records.len(), "pushing stock records");
        self.post_json(ENDPOINT_STOCK_UPDATE, store_id, records).await
    }
}

/// Dispatch store groups in parallel, one call per store. Per-store
/// failures are logged with context and do not affect the other stores.
/// Returns the number of stores delivered successfully.
pub async fn push_store_groups(
    delivery: &dyn Delivery,
    groups: BTreeMap<i64, Vec<OutboundRecord>>,
) -> usize {
    let pushes = groups.into_iter().map(|(store_id, records)| async move {
        let skus: Vec<&str> = records.iter().map(|r| r.sku.as_str()).collect();
        match delivery.push_products(store_id, &records).await {
            Ok(()) => true,
            Err(err) => {
                // Not re-queued: the update is picked up by the next change
                // or the reconciliation job.
                warn!(%err, store_id, skus = ?skus, "failed to push product records");
                false
            }
        }
    });
    join_all(pushes).await.into_iter().filter(|ok| *ok).count()
}
