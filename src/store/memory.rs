//! In-process [`ListStore`] implementation.
//!
//! Mirrors the Redis list semantics the queue relies on (atomic
//! tail-to-head move, tail-scanned removal, empty lists disappear from the
//! key space) without a server. Intended for tests and local development;
//! downstream crates can use it to exercise their assistants end to end.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio::time::Instant;

use super::ListStore;
use crate::error::QueueError;

/// Shared in-memory list store.
///
/// Lists are `VecDeque`s where the front is the Redis list head. All
/// mutation happens under one mutex, which makes the tail-to-head move
/// trivially atomic.
#[derive(Default)]
pub struct MemoryStore {
    lists: Mutex<HashMap<String, VecDeque<String>>>,
    data_pushed: Notify,
}

impl MemoryStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Tries one atomic move without waiting.
    fn try_move(&self, src: &str, dst: &str) -> Option<String> {
        let mut lists = self.lists.lock().expect("store mutex poisoned");
        let value = {
            let list = lists.get_mut(src)?;
            let value = list.pop_back()?;
            if list.is_empty() {
                lists.remove(src);
            }
            value
        };
        lists
            .entry(dst.to_string())
            .or_default()
            .push_front(value.clone());
        Some(value)
    }

    /// Matches the glob subset the queue uses (`prefix*` or a literal key).
    fn matches(pattern: &str, key: &str) -> bool {
        match pattern.strip_suffix('*') {
            Some(prefix) => key.starts_with(prefix),
            None => key == pattern,
        }
    }
}

#[async_trait]
impl ListStore for MemoryStore {
    async fn push_head(&self, key: &str, value: &str) -> Result<(), QueueError> {
        {
            let mut lists = self.lists.lock().expect("store mutex poisoned");
            lists
                .entry(key.to_string())
                .or_default()
                .push_front(value.to_string());
        }
        self.data_pushed.notify_waiters();
        Ok(())
    }

    async fn move_tail_to_head(
        &self,
        src: &str,
        dst: &str,
        timeout: Duration,
    ) -> Result<Option<String>, QueueError> {
        let deadline = Instant::now() + timeout;

        loop {
            // Enter the waiter set before checking; a Notified future only
            // observes notify_waiters once enabled, so enabling after the
            // check would let a concurrent push slip through unseen.
            let pushed = self.data_pushed.notified();
            tokio::pin!(pushed);
            pushed.as_mut().enable();

            if let Some(value) = self.try_move(src, dst) {
                self.data_pushed.notify_waiters();
                return Ok(Some(value));
            }

            if timeout.is_zero() {
                return Ok(None);
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(None);
            }

            if tokio::time::timeout(remaining, pushed).await.is_err() {
                return Ok(None);
            }
        }
    }

    async fn remove_matching(
        &self,
        key: &str,
        count: i64,
        value: &str,
    ) -> Result<usize, QueueError> {
        let mut lists = self.lists.lock().expect("store mutex poisoned");
        let Some(list) = lists.get_mut(key) else {
            return Ok(0);
        };

        // count == 0 removes all occurrences; the sign picks the scan
        // direction, Redis LREM-style.
        let budget = if count == 0 {
            usize::MAX
        } else {
            count.unsigned_abs() as usize
        };

        let mut removed = 0;
        if count < 0 {
            let mut index = list.len();
            while index > 0 && removed < budget {
                index -= 1;
                if list[index] == value {
                    let _ = list.remove(index);
                    removed += 1;
                }
            }
        } else {
            let mut index = 0;
            while index < list.len() && removed < budget {
                if list[index] == value {
                    let _ = list.remove(index);
                    removed += 1;
                } else {
                    index += 1;
                }
            }
        }

        if list.is_empty() {
            lists.remove(key);
        }
        Ok(removed)
    }

    async fn length(&self, key: &str) -> Result<usize, QueueError> {
        let lists = self.lists.lock().expect("store mutex poisoned");
        Ok(lists.get(key).map_or(0, VecDeque::len))
    }

    async fn scan_keys(
        &self,
        _cursor: u64,
        pattern: &str,
        _page_size: usize,
    ) -> Result<(u64, Vec<String>), QueueError> {
        let lists = self.lists.lock().expect("store mutex poisoned");
        let keys = lists
            .keys()
            .filter(|key| Self::matches(pattern, key))
            .cloned()
            .collect();
        // The whole key space fits in one page; a zero cursor ends the scan.
        Ok((0, keys))
    }

    async fn range(&self, key: &str, start: i64, stop: i64) -> Result<Vec<String>, QueueError> {
        let lists = self.lists.lock().expect("store mutex poisoned");
        let Some(list) = lists.get(key) else {
            return Ok(Vec::new());
        };

        let len = list.len() as i64;
        let start = if start < 0 { len + start } else { start }.max(0);
        let stop = if stop < 0 { len + stop } else { stop }.min(len - 1);
        if start > stop || len == 0 {
            return Ok(Vec::new());
        }

        Ok(list
            .iter()
            .skip(start as usize)
            .take((stop - start + 1) as usize)
            .cloned()
            .collect())
    }
}
