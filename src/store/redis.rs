//! Redis-backed [`ListStore`] implementation.
//!
//! Uses a [`ConnectionManager`] which handles reconnection automatically and
//! is cheaply cloneable, so every operation works on its own clone and the
//! store is safe for concurrent use from any number of tasks.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;

use super::ListStore;
use crate::error::QueueError;

/// Redis list store over a managed async connection.
#[derive(Clone)]
pub struct RedisListStore {
    redis: ConnectionManager,
}

impl RedisListStore {
    /// Connects to Redis at `redis_url` (e.g. `redis://localhost:6379`).
    ///
    /// # Errors
    ///
    /// Returns `QueueError::ConnectionFailed` if the connection fails.
    pub async fn connect(redis_url: &str) -> Result<Self, QueueError> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| QueueError::ConnectionFailed(e.to_string()))?;

        let redis = ConnectionManager::new(client)
            .await
            .map_err(|e| QueueError::ConnectionFailed(e.to_string()))?;

        Ok(Self { redis })
    }

    /// Wraps an existing connection manager.
    ///
    /// Useful when sharing a connection pool across multiple components.
    pub fn from_connection(redis: ConnectionManager) -> Self {
        Self { redis }
    }
}

#[async_trait]
impl ListStore for RedisListStore {
    async fn push_head(&self, key: &str, value: &str) -> Result<(), QueueError> {
        let mut conn = self.redis.clone();
        conn.lpush::<_, _, ()>(key, value).await?;
        Ok(())
    }

    async fn move_tail_to_head(
        &self,
        src: &str,
        dst: &str,
        timeout: Duration,
    ) -> Result<Option<String>, QueueError> {
        let mut conn = self.redis.clone();

        if timeout.is_zero() {
            // Non-blocking variant for sweep traffic.
            let moved: Option<String> = redis::cmd("RPOPLPUSH")
                .arg(src)
                .arg(dst)
                .query_async(&mut conn)
                .await?;
            return Ok(moved);
        }

        // BRPOPLPUSH takes whole seconds; round sub-second waits up to 1.
        let timeout_secs = timeout.as_secs().max(1) as usize;
        let moved: Option<String> = redis::cmd("BRPOPLPUSH")
            .arg(src)
            .arg(dst)
            .arg(timeout_secs)
            .query_async(&mut conn)
            .await?;
        Ok(moved)
    }

    async fn remove_matching(
        &self,
        key: &str,
        count: i64,
        value: &str,
    ) -> Result<usize, QueueError> {
        let mut conn = self.redis.clone();
        let removed: usize = conn.lrem(key, count as isize, value).await?;
        Ok(removed)
    }

    async fn length(&self, key: &str) -> Result<usize, QueueError> {
        let mut conn = self.redis.clone();
        let len: usize = conn.llen(key).await?;
        Ok(len)
    }

    async fn scan_keys(
        &self,
        cursor: u64,
        pattern: &str,
        page_size: usize,
    ) -> Result<(u64, Vec<String>), QueueError> {
        let mut conn = self.redis.clone();
        let (next_cursor, keys): (u64, Vec<String>) = redis::cmd("SCAN")
            .arg(cursor)
            .arg("MATCH")
            .arg(pattern)
            .arg("COUNT")
            .arg(page_size)
            .query_async(&mut conn)
            .await?;
        Ok((next_cursor, keys))
    }

    async fn range(&self, key: &str, start: i64, stop: i64) -> Result<Vec<String>, QueueError> {
        let mut conn = self.redis.clone();
        let values: Vec<String> = conn.lrange(key, start as isize, stop as isize).await?;
        Ok(values)
    }
}
