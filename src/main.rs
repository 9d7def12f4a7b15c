use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

use commerce_sync::catalog::DefaultRecordBuilder;
use commerce_sync::config;
use commerce_sync::consumer::{ConsumerSettings, PushConsumer};
use commerce_sync::db::{self, SqliteCatalog, SqliteLockCache, SqliteQueue};
use commerce_sync::dedup::{DedupLocks, LockCache};
use commerce_sync::delivery::ConnectorClient;
use commerce_sync::stock::{StockPusher, StockSettings};

#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    let cfg = config::load(Some(&args.config))?;
    cfg.ensure_dirs()?;

    let database_url = std::env::var("DATABASE_URL")
        .unwrap_or_else(|_| format!("sqlite://{}/commerce-sync.db", cfg.app.data_dir));

    let pool = db::init_pool(&database_url).await?;
    db::run_migrations(&pool).await?;

    let topology = Arc::new(db::load_topology(&pool).await?);
    let catalog = Arc::new(SqliteCatalog::new(pool.clone()));
    let delivery = Arc::new(ConnectorClient::new(
        &cfg.connector.base_url,
        &cfg.connector.api_key,
        Duration::from_millis(cfg.app.request_timeout_ms),
    )?);
    let lock_cache: Arc<dyn LockCache> = Arc::new(SqliteLockCache::new(pool.clone()));

    let consumer = PushConsumer::new(
        catalog.clone(),
        Arc::new(DefaultRecordBuilder),
        delivery.clone(),
        DedupLocks::new(lock_cache),
        ConsumerSettings::from(&cfg.push),
    );
    let stock = StockPusher::new(
        catalog,
        topology,
        delivery,
        StockSettings::from(&cfg.push),
    );

    let queue = SqliteQueue::new(pool);
    let poll_sleep = Duration::from_millis(cfg.app.poll_interval_ms);

    info!("starting commerce sync worker");
    loop {
        let mut processed = false;
        match consumer.drain_once(&queue).await {
            Ok(did) => processed |= did,
            Err(err) => {
                error!(?err, "push consumer error");
                tokio::time::sleep(Duration::from_secs(1)).await;
                continue;
            }
        }
        match stock.drain_once(&queue).await {
            Ok(did) => processed |= did,
            Err(err) => {
                error!(?err, "stock push error");
                tokio::time::sleep(Duration::from_secs(1)).await;
                continue;
            }
        }
        if !processed {
            tokio::time::sleep(poll_sleep).await;
        }
    }
}
