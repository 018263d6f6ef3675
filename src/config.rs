//! Store connection configuration.
//!
//! A [`StoreConfig`] describes how to reach the backing Redis instance. A
//! live queue can subscribe to a `tokio::sync::watch` channel of configs and
//! hot-swap its client when the value changes; see
//! [`ReliableQueue::watch_config`](crate::queue::ReliableQueue::watch_config).

use serde::{Deserialize, Serialize};

use crate::error::QueueError;
use crate::store::RedisListStore;

/// Environment variable consulted by [`StoreConfig::from_env`].
pub const REDIS_URL_ENV: &str = "RELQ_REDIS_URL";

/// Connection parameters for the backing store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Redis connection URL.
    pub url: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            url: "redis://localhost:6379".to_string(),
        }
    }
}

impl StoreConfig {
    /// Creates a config pointing at `url`.
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }

    /// Builds a config from `RELQ_REDIS_URL`, falling back to the default
    /// connection profile when the variable is unset.
    pub fn from_env() -> Self {
        match std::env::var(REDIS_URL_ENV) {
            Ok(url) if !url.is_empty() => Self::new(url),
            _ => Self::default(),
        }
    }

    /// Connects a [`RedisListStore`] with this configuration.
    pub async fn connect(&self) -> Result<RedisListStore, QueueError> {
        RedisListStore::connect(&self.url).await
    }
}
