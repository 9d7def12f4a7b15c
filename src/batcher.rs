//! Change batcher: accumulates push requests, deduplicates them against the
//! lock store, and publishes bounded batches onto the product push topic.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error};

use crate::config;
use crate::dedup::{DedupLocks, LockCache};
use crate::model::PushRequest;
use crate::queue::{QueueError, QueuePublisher, PRODUCT_PUSH_TOPIC};

#[derive(Debug, Clone)]
pub struct BatcherSettings {
    /// How many requests go into one queue message.
    pub queue_batch_size: usize,
    /// Dedup toggle.
    pub reduce_duplicates: bool,
    pub lock_ttl: Duration,
}

impl From<&config::Push> for BatcherSettings {
    fn from(push: &config::Push) -> Self {
        Self {
            queue_batch_size: push.queue_batch_size,
            reduce_duplicates: push.reduce_duplicates,
            lock_ttl: Duration::from_secs(push.lock_ttl_seconds),
        }
    }
}

pub struct ChangeBatcher {
    queue: Arc<dyn QueuePublisher>,
    locks: DedupLocks<dyn LockCache>,
    settings: BatcherSettings,
    pending: Vec<PushRequest>,
}

impl ChangeBatcher {
    pub fn new(
        queue: Arc<dyn QueuePublisher>,
        locks: DedupLocks<dyn LockCache>,
        settings: BatcherSettings,
    ) -> Self {
        Self {
            queue,
            locks,
            settings,
            pending: Vec::new(),
        }
    }

    /// Add requests to the current batch. Requests already in flight (dedup
    /// lock held) are dropped silently; this is expected and frequent, not
    /// an error condition. The batch auto-flushes whenever it reaches the
    /// configured size.
    pub async fn enqueue(&mut self, requests: Vec<PushRequest>) -> Result<(), QueueError> {
        for request in requests {
            if self.settings.reduce_duplicates
                && !self.locks.try_acquire(&request, self.settings.lock_ttl).await
            {
                debug!(entity = %request.entity.describe(), store_id = ?request.store_id,
                    "push request already in flight, dropping");
                continue;
            }
            self.pending.push(request);
            if self.pending.len() >= self.settings.queue_batch_size {
                self.flush().await?;
            }
        }
        Ok(())
    }

    /// Publish the accumulated batch as one queue message and clear it.
    /// Called automatically at the size threshold and explicitly at trigger
    /// boundaries so partial batches are not held back.
    ///
    /// On publish failure the acquired locks are released (a later change
    /// can re-enqueue) and the error surfaces to the caller; the host
    /// operation is expected to log it and carry on, falling back to the
    /// periodic reconciliation job.
    pub async fn flush(&mut self) -> Result<(), QueueError> {
        if self.pending.is_empty() {
            return Ok(());
        }

        let batch = std::mem::take(&mut self.pending);
        let payload = serde_json::to_string(&batch)
            .map_err(|e| QueueError::Backend(e.to_string()))?;

        if let Err(err) = self.queue.publish(PRODUCT_PUSH_TOPIC, &payload).await {
            error!(%err, batch_size = batch.len(),
                "failed to publish push batch; dropping batch, operator reconciliation required");
            if self.settings.reduce_duplicates {
                for request in &batch {
                    self.locks.release(request).await;
                }
            }
            return Err(err);
        }

        debug!(batch_size = batch.len(), "published push batch");
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dedup::MemoryLockCache;
    use async_trait::async_trait;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingQueue {
        published: Mutex<Vec<String>>,
        fail: bool,
    }

    #[async_trait]
    impl QueuePublisher for RecordingQueue {
        async fn publish(&self, _topic: &str, payload: &str) -> Result<(), QueueError> {
            if self.fail {
                return Err(QueueError::Backend("transport down".into()));
            }
            self.published.lock().unwrap().push(payload.to_string());
            Ok(())
        }
    }

    fn batcher(queue: Arc<RecordingQueue>, batch_size: usize) -> ChangeBatcher {
        let cache: Arc<dyn LockCache> = Arc::new(MemoryLockCache::new());
        ChangeBatcher::new(
            queue,
            DedupLocks::new(cache),
            BatcherSettings {
                queue_batch_size: batch_size,
                reduce_duplicates: true,
                lock_ttl: Duration::from_secs(60),
            },
        )
    }

    fn requests(n: i64) -> Vec<PushRequest> {
        (1..=n).map(|i| PushRequest::by_id(i, None)).collect()
    }

    fn published_sizes(queue: &RecordingQueue) -> Vec<usize> {
        queue
            .published
            .lock()
            .unwrap()
            .iter()
            .map(|p| PushRequest::parse_batch(p).unwrap().len())
            .collect()
    }

    #[tokio::test]
    async fn batches_are_ceil_n_over_b() {
        let queue = Arc::new(RecordingQueue::default());
        let mut batcher = batcher(queue.clone(), 2);
        batcher.enqueue(requests(5)).await.unwrap();
        batcher.flush().await.unwrap();
        // 5 requests at batch size 2: [1,2], [3,4], [5].
        assert_eq!(published_sizes(&queue), vec![2, 2, 1]);
    }

    #[tokio::test]
    async fn partial_batch_flushes_at_boundary() {
        let queue = Arc::new(RecordingQueue::default());
        let mut batcher = batcher(queue.clone(), 10);
        batcher.enqueue(requests(3)).await.unwrap();
        assert_eq!(batcher.len(), 3);
        batcher.flush().await.unwrap();
        assert!(batcher.is_empty());
        assert_eq!(published_sizes(&queue), vec![3]);
    }

    #[tokio::test]
    async fn duplicate_requests_are_dropped() {
        let queue = Arc::new(RecordingQueue::default());
        let mut batcher = batcher(queue.clone(), 10);
        batcher
            .enqueue(vec![
                PushRequest::by_id(1, None),
                PushRequest::by_id(1, None),
                PushRequest::by_id(1, Some(5)),
            ])
            .await
            .unwrap();
        batcher.flush().await.unwrap();
        // The blanket request locks out both the repeat and the
        // store-specific form.
        assert_eq!(published_sizes(&queue), vec![1]);
    }

    #[tokio::test]
    async fn dedup_disabled_keeps_everything() {
        let queue = Arc::new(RecordingQueue::default());
        let cache: Arc<dyn LockCache> = Arc::new(MemoryLockCache::new());
        let mut batcher = ChangeBatcher::new(
            queue.clone(),
            DedupLocks::new(cache),
            BatcherSettings {
                queue_batch_size: 10,
                reduce_duplicates: false,
                lock_ttl: Duration::from_secs(60),
            },
        );
        batcher
            .enqueue(vec![PushRequest::by_id(1, None), PushRequest::by_id(1, None)])
            .await
            .unwrap();
        batcher.flush().await.unwrap();
        assert_eq!(published_sizes(&queue), vec![2]);
    }

    #[tokio::test]
    async fn publish_failure_releases_locks() {
        let cache: Arc<dyn LockCache> = Arc::new(MemoryLockCache::new());
        let failing = Arc::new(RecordingQueue {
            fail: true,
            ..Default::default()
        });
        let mut batcher = ChangeBatcher::new(
            failing,
            DedupLocks::new(cache.clone()),
            BatcherSettings {
                queue_batch_size: 10,
                reduce_duplicates: true,
                lock_ttl: Duration::from_secs(60),
            },
        );
        batcher.enqueue(requests(2)).await.unwrap();
        assert!(batcher.flush().await.is_err());
        assert!(batcher.is_empty());

        // The same requests can be enqueued again once the transport is back.
        let queue = Arc::new(RecordingQueue::default());
        let mut retry = ChangeBatcher::new(
            queue.clone(),
            DedupLocks::new(cache),
            BatcherSettings {
                queue_batch_size: 10,
                reduce_duplicates: true,
                lock_ttl: Duration::from_secs(60),
            },
        );
        retry.enqueue(requests(2)).await.unwrap();
        retry.flush().await.unwrap();
        assert_eq!(published_sizes(&queue), vec![2]);
    }
}
