//! Push queue consumer: drains batches, reloads authoritative product state
//! per store, builds outbound records, and hands store groups to delivery.

use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use tracing::{debug, error, info, warn};

use crate::catalog::{CatalogStore, RecordBuilder};
use crate::config;
use crate::dedup::{DedupLocks, LockCache};
use crate::delivery::{push_store_groups, Delivery};
use crate::model::{group_by_store, EntityRef, OutboundRecord, ProductStatus, PushRequest, ADMIN_STORE_ID};
use crate::queue::{QueueError, QueueSource, PRODUCT_PUSH_TOPIC};

#[derive(Debug, Clone)]
pub struct ConsumerSettings {
    /// Requests processed and delivered per chunk.
    pub push_batch_size: usize,
    pub reduce_duplicates: bool,
}

impl From<&config::Push> for ConsumerSettings {
    fn from(push: &config::Push) -> Self {
        Self {
            push_batch_size: push.product_batch_size,
            reduce_duplicates: push.reduce_duplicates,
        }
    }
}

pub struct PushConsumer {
    catalog: Arc<dyn CatalogStore>,
    builder: Arc<dyn RecordBuilder>,
    delivery: Arc<dyn Delivery>,
    locks: DedupLocks<dyn LockCache>,
    settings: ConsumerSettings,
}

impl PushConsumer {
    pub fn new(
        catalog: Arc<dyn CatalogStore>,
        builder: Arc<dyn RecordBuilder>,
        delivery: Arc<dyn Delivery>,
        locks: DedupLocks<dyn LockCache>,
        settings: ConsumerSettings,
    ) -> Self {
        Self {
            catalog,
            builder,
            delivery,
            locks,
            settings,
        }
    }

    /// Fetch and process one message from the product push topic. Returns
    /// false when the topic is empty.
    ///
    /// The message is acked regardless of per-item outcomes: malformed
    /// payloads and delivery failures are absorbed (logged), never retried
    /// through the queue.
    pub async fn drain_once(&self, source: &dyn QueueSource) -> Result<bool, QueueError> {
        let Some(message) = source.next(PRODUCT_PUSH_TOPIC).await? else {
            return Ok(false);
        };
        self.process_message(&message.payload).await;
        source.ack(&message.id).await?;
        Ok(true)
    }

    /// Process one queue message: a JSON batch of push requests.
    pub async fn process_message(&self, payload: &str) {
        let requests = match PushRequest::parse_batch(payload) {
            Ok(requests) => requests,
            Err(err) => {
                // Unrecoverable; drop the whole batch rather than poison the
                // queue with endless redelivery.
                error!(%err, payload, "invalid data received in push consumer");
                return;
            }
        };
        if requests.is_empty() {
            return;
        }

        for chunk in requests.chunks(self.settings.push_batch_size) {
            self.process_chunk(chunk).await;
        }
    }

    async fn process_chunk(&self, chunk: &[PushRequest]) {
        let started = Instant::now();
        let mut records: Vec<OutboundRecord> = Vec::new();

        for request in chunk {
            // Release the dedup lock before the product is loaded so a new
            // change arriving during delivery can queue up instead of being
            // swallowed.
            if self.settings.reduce_duplicates {
                self.locks.release(request).await;
            }

            match self.build_records(request).await {
                Ok(built) => records.extend(built),
                Err(err) => {
                    // A single bad product must not abort the chunk.
                    warn!(%err, entity = %request.entity.describe(), store_id = ?request.store_id,
                        "failed to push product from queue");
                }
            }
        }

        let pushed: Vec<(i64, String)> = records
            .iter()
            .map(|r| (r.store_id, r.sku.clone()))
            .collect();
        let delivered_stores = push_store_groups(&*self.delivery, group_by_store(records)).await;

        info!(
            chunk_size = chunk.len(),
            delivered_stores,
            elapsed_ms = started.elapsed().as_millis() as u64,
            pushed = ?pushed,
            "pushed products in background"
        );
    }

    /// Resolve one request into records, one per concrete target store.
    async fn build_records(&self, request: &PushRequest) -> Result<Vec<OutboundRecord>> {
        // Always reload fresh: the queue may be minutes behind the write.
        let product = match &request.entity {
            EntityRef::Id(id) => self.catalog.get_by_id(*id, true, request.store_id).await?,
            EntityRef::Sku(sku) => self.catalog.get_by_sku(sku, true, request.store_id).await?,
        };
        let Some(product) = product else {
            // Deleted since it was queued.
            debug!(entity = %request.entity.describe(), "product no longer exists, skipping");
            return Ok(Vec::new());
        };

        let assigned = product.store_ids.clone();
        let stores: Vec<i64> = match request.store_id {
            Some(store_id) => vec![store_id],
            None => assigned.clone(),
        };

        let mut records = Vec::new();
        for store_id in stores {
            if store_id == ADMIN_STORE_ID {
                continue;
            }

            // The requested-store load already covers its own store; every
            // other store needs its own fresh localized load.
            let snapshot = if request.store_id == Some(store_id) {
                product.clone()
            } else {
                match self.catalog.get_by_id(product.id, true, Some(store_id)).await? {
                    Some(snapshot) => snapshot,
                    None => continue,
                }
            };

            let mut record = self.builder.build_record(&snapshot);
            record.store_id = store_id;
            // A store the product is no longer assigned to still gets an
            // update, marked disabled, so the removal is surfaced instead of
            // silently omitted.
            if !assigned.contains(&store_id) {
                record.status = ProductStatus::Disabled;
            }
            records.push(record);
        }
        Ok(records)
    }
}
