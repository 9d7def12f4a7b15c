//! Change triggers: the host platform calls these with typed change
//! descriptors (product save, category reassignment, attribute mass update,
//! import bunch) and they hand push requests to the batcher.
//!
//! A trigger failure never fails the host operation: sync is best-effort,
//! problems are logged and the primary write goes through.

use std::collections::HashSet;
use std::sync::Arc;

use anyhow::Result;
use tracing::{error, info};

use crate::batcher::ChangeBatcher;
use crate::catalog::CatalogStore;
use crate::config;
use crate::model::PushRequest;
use crate::topology::{
    AttributeScopes, AttributesMassUpdated, CategoryReassigned, ImportRow, ProductSaved,
    StoreTopology,
};

/// Deferred enqueue for the product save path. The save trigger registers
/// its batch here; the host drains the hooks after the storage transaction
/// has committed, so pre-commit data is never pushed.
#[derive(Default)]
pub struct PostCommitHooks {
    deferred: Vec<PushRequest>,
}

impl PostCommitHooks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn defer(&mut self, requests: Vec<PushRequest>) {
        self.deferred.extend(requests);
    }

    pub fn is_empty(&self) -> bool {
        self.deferred.is_empty()
    }

    /// Enqueue and flush everything registered since the last run. Called by
    /// the host once the transaction is known to have committed; on
    /// rollback, simply drop the hooks instead.
    pub async fn run(&mut self, batcher: &mut ChangeBatcher) {
        let deferred = std::mem::take(&mut self.deferred);
        if deferred.is_empty() {
            return;
        }
        if let Err(err) = batcher.enqueue(deferred).await {
            error!(%err, "failed to enqueue post-commit push batch");
            return;
        }
        if let Err(err) = batcher.flush().await {
            error!(%err, "failed to flush post-commit push batch");
        }
    }
}

pub struct Triggers {
    catalog: Arc<dyn CatalogStore>,
    topology: Arc<StoreTopology>,
    scopes: AttributeScopes,
    push_on_attribute_update: bool,
    push_batch_size: usize,
}

impl Triggers {
    pub fn new(
        catalog: Arc<dyn CatalogStore>,
        topology: Arc<StoreTopology>,
        scopes: AttributeScopes,
        push: &config::Push,
    ) -> Self {
        Self {
            catalog,
            topology,
            scopes,
            push_on_attribute_update: push.push_on_attribute_update,
            push_batch_size: push.product_batch_size,
        }
    }

    /// Single product save. The computed batch is deferred through the
    /// post-commit hooks rather than enqueued inline.
    pub async fn product_saved(&self, change: &ProductSaved, hooks: &mut PostCommitHooks) {
        match self.plan_product_save(change).await {
            Ok(batch) if !batch.is_empty() => {
                info!(product_id = change.product_id, count = batch.len(),
                    "queuing product save for push after commit");
                hooks.defer(batch);
            }
            Ok(_) => {}
            Err(err) => {
                error!(%err, product_id = change.product_id,
                    "failed to plan product save push");
            }
        }
    }

    async fn plan_product_save(&self, change: &ProductSaved) -> Result<Vec<PushRequest>> {
        let Some(product) = self
            .catalog
            .get_by_id(change.product_id, false, None)
            .await?
        else {
            return Ok(Vec::new());
        };

        let targets = self
            .topology
            .saved_targets(change, &product.store_ids, &self.scopes);

        let mut batch = Vec::new();
        let mut seen: HashSet<i64> = HashSet::new();

        for store_id in targets {
            let Some(store_product) = self
                .catalog
                .get_by_id(change.product_id, false, Some(store_id))
                .await?
            else {
                continue;
            };
            if !change.should_push(store_product.status) {
                info!(sku = %store_product.sku, store_id,
                    "not pushing disabled product");
                continue;
            }
            seen.insert(store_id);
            batch.push(PushRequest::by_sku(store_product.sku, Some(store_id)));
        }

        // Stores of websites the product was removed from always get an
        // update; the consumer marks them disabled when it notices the
        // product is no longer assigned there.
        for store_id in self.topology.removal_targets(&change.removed_website_ids) {
            if !seen.insert(store_id) {
                continue;
            }
            let Some(store_product) = self
                .catalog
                .get_by_id(change.product_id, false, Some(store_id))
                .await?
            else {
                continue;
            };
            batch.push(PushRequest::by_sku(store_product.sku, Some(store_id)));
        }

        Ok(batch)
    }

    /// Category (re)assignment: push every affected product for all its
    /// stores.
    pub async fn category_reassigned(
        &self,
        change: &CategoryReassigned,
        batcher: &mut ChangeBatcher,
    ) {
        let product_ids = dedup_ids(&change.product_ids);
        if product_ids.is_empty() {
            return;
        }

        for chunk in product_ids.chunks(self.push_batch_size) {
            let batch: Vec<PushRequest> =
                chunk.iter().map(|id| PushRequest::by_id(*id, None)).collect();
            if let Err(err) = batcher.enqueue(batch).await {
                error!(%err, category_id = change.category_id,
                    "failed to enqueue category reassignment push");
                return;
            }
        }
        if let Err(err) = batcher.flush().await {
            error!(%err, category_id = change.category_id,
                "failed to flush category reassignment push");
            return;
        }
        info!(category_id = change.category_id, count = product_ids.len(),
            "queued products for push after category reassignment");
    }

    /// Attribute mass-update: gated on configuration, widened per attribute
    /// scope.
    pub async fn attributes_mass_updated(
        &self,
        change: &AttributesMassUpdated,
        batcher: &mut ChangeBatcher,
    ) {
        if !self.push_on_attribute_update {
            return;
        }
        let product_ids = dedup_ids(&change.product_ids);
        if product_ids.is_empty() {
            return;
        }

        let targets =
            self.topology
                .mass_update_targets(change.store_id, &change.changed_attributes, &self.scopes);

        for chunk in product_ids.chunks(self.push_batch_size) {
            let mut batch = Vec::new();
            for id in chunk {
                for store_id in &targets {
                    batch.push(PushRequest::by_id(*id, *store_id));
                }
            }
            if let Err(err) = batcher.enqueue(batch).await {
                error!(%err, "failed to enqueue mass attribute update push");
                return;
            }
        }
        if let Err(err) = batcher.flush().await {
            error!(%err, "failed to flush mass attribute update push");
            return;
        }
        info!(count = product_ids.len(), "queued products for push after attribute update");
    }

    /// One import bunch. Rows without a SKU are skipped; the batch is
    /// always flushed at the end of the bunch so imports never leave
    /// requests sitting in the batcher.
    pub async fn import_bunch(&self, rows: &[ImportRow], batcher: &mut ChangeBatcher) {
        let mut seen: HashSet<(String, Option<i64>)> = HashSet::new();
        let mut skus: Vec<String> = Vec::new();

        for row in rows {
            if row.sku.trim().is_empty() {
                continue;
            }
            for store_id in self.topology.import_targets(row) {
                if !seen.insert((row.sku.clone(), store_id)) {
                    continue;
                }
                let request = PushRequest::by_sku(row.sku.clone(), store_id);
                if let Err(err) = batcher.enqueue(vec![request]).await {
                    error!(%err, sku = %row.sku, "failed to enqueue imported product push");
                    return;
                }
            }
            skus.push(row.sku.clone());
        }

        if let Err(err) = batcher.flush().await {
            error!(%err, "failed to flush import bunch push");
            return;
        }
        if !skus.is_empty() {
            info!(skus = %skus.join(","), "added imported products to push queue");
        }
    }
}

/// Dedup while preserving first-seen order.
fn dedup_ids(ids: &[i64]) -> Vec<i64> {
    let mut seen = HashSet::new();
    ids.iter().copied().filter(|id| seen.insert(*id)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batcher::{BatcherSettings, ChangeBatcher};
    use crate::catalog::ProductSnapshot;
    use crate::dedup::{DedupLocks, LockCache, MemoryLockCache};
    use crate::model::ProductStatus;
    use crate::queue::{QueueError, QueuePublisher};
    use crate::topology::{StoreDef, WebsiteDef};
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::time::Duration;

    #[derive(Default)]
    struct RecordingQueue {
        published: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl QueuePublisher for RecordingQueue {
        async fn publish(&self, _topic: &str, payload: &str) -> Result<(), QueueError> {
            self.published.lock().unwrap().push(payload.to_string());
            Ok(())
        }
    }

    struct FakeCatalog {
        products: HashMap<i64, ProductSnapshot>,
        /// Per-store status overrides: (product_id, store_id) -> status.
        statuses: HashMap<(i64, i64), ProductStatus>,
    }

    #[async_trait]
    impl CatalogStore for FakeCatalog {
        async fn get_by_id(
            &self,
            id: i64,
            _force_reload: bool,
            store_id: Option<i64>,
        ) -> Result<Option<ProductSnapshot>> {
            Ok(self.products.get(&id).map(|p| {
                let mut p = p.clone();
                if let Some(store_id) = store_id {
                    p.store_id = store_id;
                    if let Some(status) = self.statuses.get(&(id, store_id)) {
                        p.status = *status;
                    }
                }
                p
            }))
        }

        async fn get_by_sku(
            &self,
            _sku: &str,
            _force_reload: bool,
            _store_id: Option<i64>,
        ) -> Result<Option<ProductSnapshot>> {
            Ok(None)
        }
    }

    /// Website 1: stores {5,6,7}; website 2 ("us"): store 10 (en_us).
    fn topology() -> Arc<StoreTopology> {
        Arc::new(StoreTopology::new(vec![
            WebsiteDef {
                id: 1,
                code: "base".into(),
                stores: vec![
                    StoreDef {
                        id: 5,
                        code: "s5".into(),
                        active: true,
                    },
                    StoreDef {
                        id: 6,
                        code: "s6".into(),
                        active: true,
                    },
                    StoreDef {
                        id: 7,
                        code: "s7".into(),
                        active: true,
                    },
                ],
            },
            WebsiteDef {
                id: 2,
                code: "us".into(),
                stores: vec![StoreDef {
                    id: 10,
                    code: "en_us".into(),
                    active: true,
                }],
            },
        ]))
    }

    fn product(id: i64, sku: &str, store_ids: Vec<i64>) -> ProductSnapshot {
        ProductSnapshot {
            id,
            sku: sku.into(),
            store_id: 0,
            status: ProductStatus::Enabled,
            name: format!("Product {id}"),
            price: 10.0,
            special_price: None,
            qty: 1.0,
            is_in_stock: true,
            store_ids,
            website_ids: vec![1],
            category_ids: vec![],
            media: vec![],
        }
    }

    fn push_config(queue_batch_size: usize) -> config::Push {
        config::Push {
            product_batch_size: 5,
            queue_batch_size,
            push_on_attribute_update: true,
            reduce_duplicates: true,
            lock_ttl_seconds: 600,
            stock_push_enabled: true,
            stock_batch_size: 50,
        }
    }

    fn batcher(queue: Arc<RecordingQueue>, queue_batch_size: usize) -> ChangeBatcher {
        let cache: Arc<dyn LockCache> = Arc::new(MemoryLockCache::new());
        ChangeBatcher::new(
            queue,
            DedupLocks::new(cache),
            BatcherSettings {
                queue_batch_size,
                reduce_duplicates: true,
                lock_ttl: Duration::from_secs(60),
            },
        )
    }

    fn triggers(catalog: FakeCatalog, queue_batch_size: usize) -> Triggers {
        Triggers::new(
            Arc::new(catalog),
            topology(),
            AttributeScopes::new(["price"]),
            &push_config(queue_batch_size),
        )
    }

    fn published_batches(queue: &RecordingQueue) -> Vec<Vec<PushRequest>> {
        queue
            .published
            .lock()
            .unwrap()
            .iter()
            .map(|p| PushRequest::parse_batch(p).unwrap())
            .collect()
    }

    fn saved(product_id: i64, store_id: i64) -> ProductSaved {
        ProductSaved {
            product_id,
            store_id,
            changed_attributes: vec![],
            category_membership_changed: false,
            removed_website_ids: vec![],
            old_status: Some(ProductStatus::Enabled),
            new_status: ProductStatus::Enabled,
        }
    }

    #[tokio::test]
    async fn global_save_defers_all_assigned_stores_until_commit() {
        let mut products = HashMap::new();
        products.insert(1, product(1, "A", vec![0, 5, 6]));
        let t = triggers(
            FakeCatalog {
                products,
                statuses: HashMap::new(),
            },
            20,
        );
        let queue = Arc::new(RecordingQueue::default());
        let mut batcher = batcher(queue.clone(), 20);
        let mut hooks = PostCommitHooks::new();

        t.product_saved(&saved(1, 0), &mut hooks).await;
        // Nothing on the queue before the commit hook runs.
        assert!(published_batches(&queue).is_empty());
        assert!(!hooks.is_empty());

        hooks.run(&mut batcher).await;
        let batches = published_batches(&queue);
        assert_eq!(batches.len(), 1);
        assert_eq!(
            batches[0],
            vec![
                PushRequest::by_sku("A", Some(5)),
                PushRequest::by_sku("A", Some(6)),
            ]
        );
    }

    #[tokio::test]
    async fn disabled_store_without_transition_is_suppressed() {
        let mut products = HashMap::new();
        products.insert(1, product(1, "A", vec![5, 7]));
        let mut statuses = HashMap::new();
        statuses.insert((1, 7), ProductStatus::Disabled);
        let t = triggers(FakeCatalog { products, statuses }, 20);
        let queue = Arc::new(RecordingQueue::default());
        let mut batcher = batcher(queue.clone(), 20);
        let mut hooks = PostCommitHooks::new();

        t.product_saved(&saved(1, 0), &mut hooks).await;
        hooks.run(&mut batcher).await;

        let batches = published_batches(&queue);
        assert_eq!(batches, vec![vec![PushRequest::by_sku("A", Some(5))]]);
    }

    #[tokio::test]
    async fn disable_transition_is_pushed() {
        let mut products = HashMap::new();
        products.insert(1, product(1, "A", vec![7]));
        let mut statuses = HashMap::new();
        statuses.insert((1, 7), ProductStatus::Disabled);
        let t = triggers(FakeCatalog { products, statuses }, 20);
        let queue = Arc::new(RecordingQueue::default());
        let mut batcher = batcher(queue.clone(), 20);
        let mut hooks = PostCommitHooks::new();

        let mut change = saved(1, 0);
        change.new_status = ProductStatus::Disabled;
        t.product_saved(&change, &mut hooks).await;
        hooks.run(&mut batcher).await;

        let batches = published_batches(&queue);
        assert_eq!(batches, vec![vec![PushRequest::by_sku("A", Some(7))]]);
    }

    #[tokio::test]
    async fn website_removal_pushes_removed_stores() {
        let mut products = HashMap::new();
        products.insert(1, product(1, "A", vec![5]));
        let t = triggers(
            FakeCatalog {
                products,
                statuses: HashMap::new(),
            },
            20,
        );
        let queue = Arc::new(RecordingQueue::default());
        let mut batcher = batcher(queue.clone(), 20);
        let mut hooks = PostCommitHooks::new();

        let mut change = saved(1, 0);
        change.removed_website_ids = vec![2];
        t.product_saved(&change, &mut hooks).await;
        hooks.run(&mut batcher).await;

        let batches = published_batches(&queue);
        assert_eq!(
            batches,
            vec![vec![
                PushRequest::by_sku("A", Some(5)),
                PushRequest::by_sku("A", Some(10)),
            ]]
        );
    }

    #[tokio::test]
    async fn category_reassignment_pushes_unscoped() {
        let t = triggers(
            FakeCatalog {
                products: HashMap::new(),
                statuses: HashMap::new(),
            },
            20,
        );
        let queue = Arc::new(RecordingQueue::default());
        let mut batcher = batcher(queue.clone(), 20);

        t.category_reassigned(
            &CategoryReassigned {
                category_id: 3,
                product_ids: vec![11, 12, 11],
            },
            &mut batcher,
        )
        .await;

        let batches = published_batches(&queue);
        assert_eq!(
            batches,
            vec![vec![PushRequest::by_id(11, None), PushRequest::by_id(12, None)]]
        );
    }

    #[tokio::test]
    async fn mass_update_is_gated_on_config() {
        let mut push = push_config(20);
        push.push_on_attribute_update = false;
        let t = Triggers::new(
            Arc::new(FakeCatalog {
                products: HashMap::new(),
                statuses: HashMap::new(),
            }),
            topology(),
            AttributeScopes::default(),
            &push,
        );
        let queue = Arc::new(RecordingQueue::default());
        let mut batcher = batcher(queue.clone(), 20);

        t.attributes_mass_updated(
            &AttributesMassUpdated {
                product_ids: vec![1, 2],
                store_id: Some(5),
                changed_attributes: vec!["name".into()],
            },
            &mut batcher,
        )
        .await;
        assert!(published_batches(&queue).is_empty());
    }

    #[tokio::test]
    async fn mass_update_widens_website_scoped_attributes() {
        let t = triggers(
            FakeCatalog {
                products: HashMap::new(),
                statuses: HashMap::new(),
            },
            20,
        );
        let queue = Arc::new(RecordingQueue::default());
        let mut batcher = batcher(queue.clone(), 20);

        t.attributes_mass_updated(
            &AttributesMassUpdated {
                product_ids: vec![1],
                store_id: Some(5),
                changed_attributes: vec!["price".into()],
            },
            &mut batcher,
        )
        .await;

        let batches = published_batches(&queue);
        assert_eq!(
            batches,
            vec![vec![
                PushRequest::by_id(1, Some(5)),
                PushRequest::by_id(1, Some(6)),
                PushRequest::by_id(1, Some(7)),
            ]]
        );
    }

    #[tokio::test]
    async fn import_bunch_flushes_in_queue_batches() {
        let t = triggers(
            FakeCatalog {
                products: HashMap::new(),
                statuses: HashMap::new(),
            },
            2,
        );
        let queue = Arc::new(RecordingQueue::default());
        let mut batcher = batcher(queue.clone(), 2);

        let rows: Vec<ImportRow> = ["R1", "R2", "R3"]
            .iter()
            .map(|sku| ImportRow {
                sku: sku.to_string(),
                store_view_code: Some("en_us".into()),
                ..Default::default()
            })
            .collect();
        t.import_bunch(&rows, &mut batcher).await;

        // Three rows at batch size 2: [R1,R2] then [R3].
        let batches = published_batches(&queue);
        assert_eq!(
            batches,
            vec![
                vec![
                    PushRequest::by_sku("R1", Some(10)),
                    PushRequest::by_sku("R2", Some(10)),
                ],
                vec![PushRequest::by_sku("R3", Some(10))],
            ]
        );
    }

    #[tokio::test]
    async fn import_rows_without_sku_are_skipped() {
        let t = triggers(
            FakeCatalog {
                products: HashMap::new(),
                statuses: HashMap::new(),
            },
            20,
        );
        let queue = Arc::new(RecordingQueue::default());
        let mut batcher = batcher(queue.clone(), 20);

        let rows = vec![
            ImportRow {
                sku: "".into(),
                ..Default::default()
            },
            ImportRow {
                sku: "GOOD".into(),
                ..Default::default()
            },
        ];
        t.import_bunch(&rows, &mut batcher).await;

        let batches = published_batches(&queue);
        assert_eq!(batches, vec![vec![PushRequest::by_sku("GOOD", None)]]);
    }

    #[tokio::test]
    async fn import_bunch_dedups_repeated_skus() {
        let t = triggers(
            FakeCatalog {
                products: HashMap::new(),
                statuses: HashMap::new(),
            },
            20,
        );
        let queue = Arc::new(RecordingQueue::default());
        let mut batcher = batcher(queue.clone(), 20);

        let rows = vec![
            ImportRow {
                sku: "DUP".into(),
                ..Default::default()
            },
            ImportRow {
                sku: "DUP".into(),
                ..Default::default()
            },
        ];
        t.import_bunch(&rows, &mut batcher).await;

        let batches = published_batches(&queue);
        assert_eq!(batches, vec![vec![PushRequest::by_sku("DUP", None)]]);
    }
}
