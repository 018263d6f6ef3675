//! Store capability behind the queue.
//!
//! The queue protocol only needs a handful of list primitives from its
//! backing store: head push, a blocking atomic tail-to-head move, matched
//! removal, length, a paginated key scan, and a range read. [`ListStore`]
//! captures exactly that boundary so the same protocol runs against Redis
//! in production and an in-process store in tests.

mod memory;
mod redis;

pub use self::redis::RedisListStore;
pub use memory::MemoryStore;

use std::time::Duration;

use async_trait::async_trait;

use crate::error::QueueError;

/// List primitives required by the reliable queue protocol.
///
/// Implementations must make `move_tail_to_head` atomic: an element is
/// observable in the source list or the destination list, never both and
/// never neither. That single guarantee is what multi-worker correctness
/// rests on.
#[async_trait]
pub trait ListStore: Send + Sync {
    /// Inserts `value` at the head of the list at `key`.
    async fn push_head(&self, key: &str, value: &str) -> Result<(), QueueError>;

    /// Atomically pops the tail of `src` and pushes it onto the head of
    /// `dst`, blocking up to `timeout` for an element to appear.
    ///
    /// Returns `None` when the wait expires with no data. A zero timeout
    /// means "do not wait": return immediately if `src` is empty.
    async fn move_tail_to_head(
        &self,
        src: &str,
        dst: &str,
        timeout: Duration,
    ) -> Result<Option<String>, QueueError>;

    /// Removes up to `count.abs()` occurrences of `value` from the list at
    /// `key`; a negative `count` scans from the tail. Returns the number of
    /// elements removed.
    async fn remove_matching(&self, key: &str, count: i64, value: &str)
        -> Result<usize, QueueError>;

    /// Returns the length of the list at `key` (0 for a missing key).
    async fn length(&self, key: &str) -> Result<usize, QueueError>;

    /// One page of a cursor-based key-space scan matching a glob `pattern`.
    ///
    /// Returns the next cursor and the keys found on this page; a returned
    /// cursor of 0 means the iteration is complete.
    async fn scan_keys(
        &self,
        cursor: u64,
        pattern: &str,
        page_size: usize,
    ) -> Result<(u64, Vec<String>), QueueError>;

    /// Reads elements `start..=stop` of the list at `key` without removing
    /// them. Negative indices count from the tail, Redis-style.
    async fn range(&self, key: &str, start: i64, stop: i64) -> Result<Vec<String>, QueueError>;
}
