//! Dedup lock store: at-most-one-in-flight per (product, store scope).
//!
//! Wraps a TTL-capable key/value cache. A lock is written when a push
//! request is queued and deleted by the consumer once the product has been
//! reloaded; the TTL is a safety net against consumer crashes. Cache trouble
//! must never fail the caller: acquire treats backend errors as "not
//! locked", release is best-effort.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use thiserror::Error;
use tracing::warn;

use crate::model::{EntityRef, PushRequest};

#[derive(Debug, Error)]
pub enum LockCacheError {
    #[error("lock cache backend error: {0}")]
    Backend(String),
}

/// The only primitives a lock backend must supply. Each call must be atomic
/// at the backend; the wrapper never does read-modify-write on a single key.
#[async_trait]
pub trait LockCache: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, LockCacheError>;
    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), LockCacheError>;
    async fn delete(&self, key: &str) -> Result<(), LockCacheError>;
}

/// Process-local lock cache for tests and single-node deployments.
#[derive(Default)]
pub struct MemoryLockCache {
    entries: Mutex<HashMap<String, (String, Instant)>>,
}

impl MemoryLockCache {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LockCache for MemoryLockCache {
    async fn get(&self, key: &str) -> Result<Option<String>, LockCacheError> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|e| LockCacheError::Backend(e.to_string()))?;
        match entries.get(key) {
            Some((_, expires_at)) if *expires_at <= Instant::now() => {
                entries.remove(key);
                Ok(None)
            }
            Some((value, _)) => Ok(Some(value.clone())),
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), LockCacheError> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|e| LockCacheError::Backend(e.to_string()))?;
        entries.insert(key.to_string(), (value.to_string(), Instant::now() + ttl));
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), LockCacheError> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|e| LockCacheError::Backend(e.to_string()))?;
        entries.remove(key);
        Ok(())
    }
}

/// Cache key for a push request: ref kind, ref value, store scope.
pub fn lock_key(entity: &EntityRef, store_id: Option<i64>) -> String {
    let (kind, value) = entity_parts(entity);
    let scope = match store_id {
        Some(store_id) => store_id.to_string(),
        None => "all".to_string(),
    };
    format!("push:{kind}|store_id:{value}|{scope}")
}

/// Marker key set alongside any store-specific lock so a blanket (all
/// stores) acquire can see that some store-scoped push is in flight without
/// enumerating store ids.
fn marker_key(entity: &EntityRef) -> String {
    let (kind, value) = entity_parts(entity);
    format!("push:{kind}|any:{value}")
}

fn entity_parts(entity: &EntityRef) -> (&'static str, String) {
    match entity {
        EntityRef::Id(id) => ("product_id", id.to_string()),
        EntityRef::Sku(sku) => ("sku", sku.clone()),
    }
}

/// Dedup lock operations over an arbitrary [`LockCache`] backend.
///
/// The all-stores form of a product and any specific-store form block each
/// other. This is best-effort, not transactional: under extreme races two
/// requests can both get through, which is acceptable because delivery is
/// idempotent downstream.
pub struct DedupLocks<C: LockCache + ?Sized> {
    cache: Arc<C>,
}

impl<C: LockCache + ?Sized> Clone for DedupLocks<C> {
    fn clone(&self) -> Self {
        Self {
            cache: self.cache.clone(),
        }
    }
}

impl<C: LockCache + ?Sized> DedupLocks<C> {
    pub fn new(cache: Arc<C>) -> Self {
        Self { cache }
    }

    /// Try to mark the request as queued. Returns false when the request is
    /// already covered by an in-flight lock.
    pub async fn try_acquire(&self, request: &PushRequest, ttl: Duration) -> bool {
        let all_stores_key = lock_key(&request.entity, None);
        if self.is_locked(&all_stores_key).await {
            return false;
        }

        match request.store_id {
            Some(_) => {
                let key = lock_key(&request.entity, request.store_id);
                if self.is_locked(&key).await {
                    return false;
                }
                self.set_best_effort(&key, ttl).await;
                self.set_best_effort(&marker_key(&request.entity), ttl).await;
            }
            None => {
                if self.is_locked(&marker_key(&request.entity)).await {
                    return false;
                }
                self.set_best_effort(&all_stores_key, ttl).await;
            }
        }
        true
    }

    /// Remove the request's lock. Idempotent; failures are logged and
    /// swallowed (the TTL will clean up eventually).
    pub async fn release(&self, request: &PushRequest) {
        let key = lock_key(&request.entity, request.store_id);
        self.delete_best_effort(&key).await;
        if request.store_id.is_some() {
            self.delete_best_effort(&marker_key(&request.entity)).await;
        }
    }

    async fn is_locked(&self, key: &str) -> bool {
        match self.cache.get(key).await {
            Ok(entry) => entry.is_some(),
            Err(err) => {
                // Assume not locked: a broken cache must not block pushes.
                warn!(%err, key, "dedup lock lookup failed, assuming unlocked");
                false
            }
        }
    }

    async fn set_best_effort(&self, key: &str, ttl: Duration) {
        if let Err(err) = self.cache.set(key, key, ttl).await {
            // Proceed without the lock; duplicate delivery is idempotent.
            warn!(%err, key, "failed to write dedup lock");
        }
    }

    async fn delete_best_effort(&self, key: &str) {
        if let Err(err) = self.cache.delete(key).await {
            warn!(%err, key, "failed to release dedup lock");
        }
    }
}
