//! Configuration loader and validator for the commerce connector sync worker.
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML parse error: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(&'static str),
}

/// Root configuration struct mirroring the YAML schema exactly.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Config {
    pub app: App,
    pub connector: Connector,
    pub push: Push,
    #[serde(default)]
    pub attributes: Attributes,
}

/// App-level settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct App {
    pub data_dir: String,
    pub poll_interval_ms: u64,
    pub request_timeout_ms: u64,
    pub max_backoff_seconds: u64,
}

/// External commerce connector endpoint settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Connector {
    pub base_url: String,
    pub api_key: String,
}

/// Push pipeline tuning knobs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Push {
    /// Outbound chunk size: products serialized and delivered per store call.
    pub product_batch_size: usize,
    /// How many push requests go into one queue message.
    pub queue_batch_size: usize,
    /// Whether attribute mass-updates trigger a push at all.
    pub push_on_attribute_update: bool,
    /// Dedup toggle: skip enqueueing items already in flight.
    pub reduce_duplicates: bool,
    /// Safety-net expiry for dedup locks, in case a consumer dies before
    /// releasing them.
    pub lock_ttl_seconds: u64,
    pub stock_push_enabled: bool,
    pub stock_batch_size: usize,
}

/// Attribute metadata the resolver needs: which attribute codes are scoped
/// per website rather than per store view.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Attributes {
    #[serde(default)]
    pub website_scoped: Vec<String>,
}

impl Config {
    /// Ensure required directories exist (creates `app.data_dir` if missing).
    pub fn ensure_dirs(&self) -> Result<(), std::io::Error> {
        if self.app.data_dir.trim().is_empty() {
            return Ok(());
        }
        fs::create_dir_all(&self.app.data_dir)
    }
}

/// Load configuration from a YAML file and validate it.
/// - If `path` is None, uses `config.yaml` in the current working directory.
pub fn load(path: Option<&Path>) -> Result<Config, ConfigError> {
    let path = path.unwrap_or_else(|| Path::new("config.yaml"));
    let content = fs::read_to_string(path)?;
    let cfg: Config = serde_yaml::from_str(&content)?;
    validate(&cfg)?;
    Ok(cfg)
}

/// Validate a configuration instance.
fn validate(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.app.data_dir.trim().is_empty() {
        return Err(ConfigError::Invalid("app.data_dir must be non-empty"));
    }
    if cfg.app.poll_interval_ms == 0 {
        return Err(ConfigError::Invalid("app.poll_interval_ms must be > 0"));
    }
    if cfg.app.request_timeout_ms == 0 {
        return Err(ConfigError::Invalid("app.request_timeout_ms must be > 0"));
    }

    if cfg.connector.base_url.trim().is_empty() {
        return Err(ConfigError::Invalid("connector.base_url must be non-empty"));
    }
    if cfg.connector.api_key.trim().is_empty() {
        return Err(ConfigError::Invalid("connector.api_key must be non-empty"));
    }

    if cfg.push.product_batch_size == 0 {
        return Err(ConfigError::Invalid("push.product_batch_size must be > 0"));
    }
    if cfg.push.queue_batch_size == 0 {
        return Err(ConfigError::Invalid("push.queue_batch_size must be > 0"));
    }
    if cfg.push.lock_ttl_seconds == 0 {
        return Err(ConfigError::Invalid("push.lock_ttl_seconds must be > 0"));
    }
    if cfg.push.stock_batch_size == 0 {
        return Err(ConfigError::Invalid("push.stock_batch_size must be > 0"));
    }

    Ok(())
}

/// Example configuration document, also used as a fixture by tests.
pub fn example() -> &'static str {
    r#"app:
  data_dir: "./data"
  poll_interval_ms: 500
  request_timeout_ms: 10000
  max_backoff_seconds: 60

connector:
  base_url: "https://connector.example.com/"
  api_key: "YOUR_CONNECTOR_API_KEY"

push:
  product_batch_size: 5
  queue_batch_size: 20
  push_on_attribute_update: true
  reduce_duplicates: true
  lock_ttl_seconds: 600
  stock_push_enabled: true
  stock_batch_size: 50

attributes:
  website_scoped:
    - price
    - special_price
    - status
"#
}
