//! SQLite persistence: the durable push queue and the dedup lock cache.
//!
//! Both live in one small database under `app.data_dir`. The queue is an
//! outbox-style table drained by the worker; the lock table backs
//! [`crate::dedup::DedupLocks`] with TTL semantics via an `expires_at`
//! column (expired rows are treated as absent and lazily purged).

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};
use tracing::instrument;
use uuid::Uuid;

use crate::catalog::{CatalogStore, ProductSnapshot};
use crate::dedup::{LockCache, LockCacheError};
use crate::model::ADMIN_STORE_ID;
use crate::queue::{QueueError, QueuePublisher, QueueSource, QueuedMessage};
use crate::topology::{StoreDef, StoreTopology, WebsiteDef};

pub type Pool = SqlitePool;

/// How long a fetched message stays invisible before it is considered
/// abandoned and handed out again.
const VISIBILITY_WINDOW_SECS: i64 = 120;

pub async fn init_pool(database_url: &str) -> Result<Pool> {
    let normalized = prepare_sqlite_url(database_url);
    let pool = SqlitePool::connect(&normalized).await?;
    // Enable WAL and stricter durability.
    sqlx::query("PRAGMA journal_mode=WAL;").execute(&pool).await?;
    sqlx::query("PRAGMA synchronous=FULL;").execute(&pool).await?;
    Ok(pool)
}

/// If using a file-backed SQLite URL, expand a leading `~/` and ensure the
/// parent directory exists. Leaves in-memory URLs and other schemes alone.
fn prepare_sqlite_url(url: &str) -> String {
    if !url.starts_with("sqlite:") || url.starts_with("sqlite::memory") {
        return url.to_string();
    }

    let rest = url["sqlite:".len()..].trim_start_matches("//");
    let (path_part, query_part) = match rest.split_once('?') {
        Some((p, q)) => (p, Some(q)),
        None => (rest, None),
    };
    if path_part.is_empty() {
        return url.to_string();
    }

    let expanded = match (path_part.strip_prefix("~/"), std::env::var("HOME")) {
        (Some(tail), Ok(home)) => format!("{}/{}", home.trim_end_matches('/'), tail),
        _ => path_part.to_string(),
    };

    if let Some(parent) = std::path::Path::new(&expanded).parent() {
        if !parent.as_os_str().is_empty() {
            let _ = std::fs::create_dir_all(parent);
        }
    }

    let mut rebuilt = format!("sqlite://{expanded}");
    if let Some(q) = query_part {
        rebuilt.push('?');
        rebuilt.push_str(q);
    }
    rebuilt
}

pub async fn run_migrations(pool: &Pool) -> Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

/// Durable queue over the `push_queue` table.
#[derive(Clone)]
pub struct SqliteQueue {
    pool: Pool,
}

impl SqliteQueue {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    /// Messages currently on the topic, due or not. Used by tests and the
    /// operator status log line.
    pub async fn depth(&self, topic: &str) -> Result<i64, QueueError> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM push_queue WHERE topic = ?")
                .bind(topic)
                .fetch_one(&self.pool)
                .await?;
        Ok(count)
    }
}

#[async_trait]
impl QueuePublisher for SqliteQueue {
    #[instrument(skip_all, fields(topic))]
    async fn publish(&self, topic: &str, payload: &str) -> Result<(), QueueError> {
        sqlx::query(
            "INSERT INTO push_queue (id, topic, payload, attempt, due_at, enqueued_at)
             VALUES (?, ?, ?, 0, ?, ?)",
        )
        .bind(Uuid::new_v4().to_string())
        .bind(topic)
        .bind(payload)
        .bind(Utc::now())
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl QueueSource for SqliteQueue {
    async fn next(&self, topic: &str) -> Result<Option<QueuedMessage>, QueueError> {
        let now = Utc::now();
        let invisible_until = now + chrono::Duration::seconds(VISIBILITY_WINDOW_SECS);
        // Claim the oldest due message and push its due_at forward so a
        // concurrent worker does not pick it up while we process it.
        let row = sqlx::query(
            "UPDATE push_queue SET due_at = ?, attempt = attempt + 1
             WHERE id = (
                 SELECT id FROM push_queue
                 WHERE topic = ? AND due_at <= ?
                 ORDER BY enqueued_at LIMIT 1
             )
             RETURNING id, topic, payload, attempt, enqueued_at",
        )
        .bind(invisible_until)
        .bind(topic)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|row| QueuedMessage {
            id: row.get("id"),
            topic: row.get("topic"),
            payload: row.get("payload"),
            attempt: row.get("attempt"),
            enqueued_at: row.get::<DateTime<Utc>, _>("enqueued_at"),
        }))
    }

    async fn ack(&self, id: &str) -> Result<(), QueueError> {
        sqlx::query("DELETE FROM push_queue WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn nack(&self, id: &str, max_backoff_secs: i64) -> Result<(), QueueError> {
        let attempt: Option<i64> =
            sqlx::query_scalar("SELECT attempt FROM push_queue WHERE id = ?")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;
        let Some(attempt) = attempt else {
            return Ok(());
        };
        let backoff = (1i64 << attempt.clamp(0, 16)).min(max_backoff_secs.max(1));
        sqlx::query("UPDATE push_queue SET due_at = ? WHERE id = ?")
            .bind(Utc::now() + chrono::Duration::seconds(backoff))
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

/// Dedup lock cache over the `push_locks` table.
#[derive(Clone)]
pub struct SqliteLockCache {
    pool: Pool,
}

impl SqliteLockCache {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }
}

impl From<sqlx::Error> for LockCacheError {
    fn from(err: sqlx::Error) -> Self {
        LockCacheError::Backend(err.to_string())
    }
}

/// Catalog read model over the `catalog_products` table. Rows are full
/// snapshots mirrored from the host platform; a store-specific row wins over
/// the default-scope (store 0) row. Reads always hit the table, so
/// `force_reload` has nothing extra to do here.
#[derive(Clone)]
pub struct SqliteCatalog {
    pool: Pool,
}

impl SqliteCatalog {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    fn decode(raw: &str, store_id: Option<i64>) -> Result<ProductSnapshot> {
        let mut snapshot: ProductSnapshot = serde_json::from_str(raw)?;
        if let Some(store_id) = store_id {
            snapshot.store_id = store_id;
        }
        Ok(snapshot)
    }

    /// Store-specific row first, default-scope (store 0) row as fallback.
    async fn fetch_by_id(&self, id: i64, store_id: Option<i64>) -> Result<Option<String>> {
        let scope = store_id.unwrap_or(ADMIN_STORE_ID);
        let raw: Option<String> = sqlx::query_scalar(
            "SELECT snapshot FROM catalog_products
             WHERE product_id = ? AND store_id IN (?, ?)
             ORDER BY store_id DESC LIMIT 1",
        )
        .bind(id)
        .bind(scope)
        .bind(ADMIN_STORE_ID)
        .fetch_optional(&self.pool)
        .await?;
        Ok(raw)
    }

    async fn fetch_by_sku(&self, sku: &str, store_id: Option<i64>) -> Result<Option<String>> {
        let scope = store_id.unwrap_or(ADMIN_STORE_ID);
        let raw: Option<String> = sqlx::query_scalar(
            "SELECT snapshot FROM catalog_products
             WHERE sku = ? AND store_id IN (?, ?)
             ORDER BY store_id DESC LIMIT 1",
        )
        .bind(sku)
        .bind(scope)
        .bind(ADMIN_STORE_ID)
        .fetch_optional(&self.pool)
        .await?;
        Ok(raw)
    }
}

#[async_trait]
impl CatalogStore for SqliteCatalog {
    async fn get_by_id(
        &self,
        id: i64,
        _force_reload: bool,
        store_id: Option<i64>,
    ) -> Result<Option<ProductSnapshot>> {
        let raw = self.fetch_by_id(id, store_id).await?;
        raw.map(|raw| Self::decode(&raw, store_id)).transpose()
    }

    async fn get_by_sku(
        &self,
        sku: &str,
        _force_reload: bool,
        store_id: Option<i64>,
    ) -> Result<Option<ProductSnapshot>> {
        let raw = self.fetch_by_sku(sku, store_id).await?;
        raw.map(|raw| Self::decode(&raw, store_id)).transpose()
    }
}

/// Load the store topology mirrored into `sync_websites`/`sync_stores`.
/// Store order within a website follows the `position` column, which decides
/// the "first store of website" used for stock pushes.
pub async fn load_topology(pool: &Pool) -> Result<StoreTopology> {
    let websites = sqlx::query("SELECT id, code FROM sync_websites ORDER BY id")
        .fetch_all(pool)
        .await?;

    let mut defs = Vec::with_capacity(websites.len());
    for website in websites {
        let website_id: i64 = website.get("id");
        let stores = sqlx::query(
            "SELECT id, code, active FROM sync_stores
             WHERE website_id = ? ORDER BY position, id",
        )
        .bind(website_id)
        .fetch_all(pool)
        .await?;

        defs.push(WebsiteDef {
            id: website_id,
            code: website.get("code"),
            stores: stores
                .into_iter()
                .map(|row| StoreDef {
                    id: row.get("id"),
                    code: row.get("code"),
                    active: row.get::<i64, _>("active") != 0,
                })
                .collect(),
        });
    }
    Ok(StoreTopology::new(defs))
}

#[async_trait]
impl LockCache for SqliteLockCache {
    async fn get(&self, key: &str) -> Result<Option<String>, LockCacheError> {
        // Lazy purge keeps the table from accumulating dead locks.
        sqlx::query("DELETE FROM push_locks WHERE lock_key = ? AND expires_at <= ?")
            .bind(key)
            .bind(Utc::now())
            .execute(&self.pool)
            .await?;

        let value: Option<String> = sqlx::query_scalar(
            "SELECT lock_value FROM push_locks WHERE lock_key = ? AND expires_at > ?",
        )
        .bind(key)
        .bind(Utc::now())
        .fetch_optional(&self.pool)
        .await?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), LockCacheError> {
        let expires_at = Utc::now()
            + chrono::Duration::from_std(ttl)
                .map_err(|e| LockCacheError::Backend(e.to_string()))?;
        sqlx::query(
            "INSERT INTO push_locks (lock_key, lock_value, expires_at) VALUES (?, ?, ?)
             ON CONFLICT(lock_key) DO UPDATE SET lock_value = excluded.lock_value,
                                                 expires_at = excluded.expires_at",
        )
        .bind(key)
        .bind(value)
        .bind(expires_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), LockCacheError> {
        sqlx::query("DELETE FROM push_locks WHERE lock_key = ?")
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
