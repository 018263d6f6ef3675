//! Reliable list queue with crash recovery.
//!
//! The queue owns two Redis lists: the shared list (`key`) that every
//! producer pushes into, and a worker-private list (`key:@<start-ts>`) that
//! holds elements this worker has popped but not yet acknowledged. A pop is
//! an atomic tail-to-head move between the two, so ownership of an element
//! is implicit in which list it currently sits in; no lock or lease manager
//! is needed. If a worker dies, its private list goes stale and
//! [`ReliableQueue::return_elements`] folds the contents back into the
//! shared list once the key's embedded timestamp looks old enough.
//!
//! Consumers must call [`ReliableQueue::remove`] after durably finishing a
//! popped element, or it stays in-flight and will eventually be reclaimed
//! and redelivered. Delivery is therefore at-least-once.

use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::StoreConfig;
use crate::error::QueueError;
use crate::store::ListStore;

/// Separator between the queue key and the worker start timestamp in a
/// private-list key.
pub const TIMESTAMP_SEPARATOR: &str = ":@";

/// Page size for the reclamation key scan.
const SCAN_PAGE: usize = 100;

/// Options for a single [`ReliableQueue::pop`] call.
///
/// Defaults to a one second wait with no hook.
pub struct PopOptions {
    /// How long to block waiting for an element.
    pub wait_timeout: Duration,
    /// Invoked synchronously exactly once before the store operation,
    /// regardless of the pop outcome. An instrumentation seam for tests.
    pub before_pop: Option<Box<dyn Fn() + Send + Sync>>,
}

impl Default for PopOptions {
    fn default() -> Self {
        Self {
            wait_timeout: Duration::from_secs(1),
            before_pop: None,
        }
    }
}

impl PopOptions {
    /// Sets the wait timeout.
    pub fn with_wait_timeout(mut self, timeout: Duration) -> Self {
        self.wait_timeout = timeout;
        self
    }

    /// Sets the pre-pop hook.
    pub fn with_before_pop(mut self, hook: impl Fn() + Send + Sync + 'static) -> Self {
        self.before_pop = Some(Box::new(hook));
        self
    }
}

/// At-least-once work queue over a pair of store lists.
///
/// Safe for concurrent use; the store handle can be hot-swapped at runtime
/// and in-flight calls holding the old handle complete normally.
pub struct ReliableQueue {
    /// Shared backlog list key.
    key: String,
    /// Worker-private in-flight list key, `key:@<start unix ts>`.
    private_key: String,
    /// Swappable store client.
    store: RwLock<Arc<dyn ListStore>>,
}

impl ReliableQueue {
    /// Creates a queue over `key` using an existing store client.
    ///
    /// The private key embeds this worker's start time, which is what makes
    /// stale in-flight lists discoverable by age.
    pub fn new(key: impl Into<String>, store: Arc<dyn ListStore>) -> Self {
        let key = key.into();
        let private_key = format!("{key}{TIMESTAMP_SEPARATOR}{}", Utc::now().timestamp());
        Self {
            key,
            private_key,
            store: RwLock::new(store),
        }
    }

    /// Creates a queue with an explicit start timestamp.
    ///
    /// The default constructor stamps the private key with the current
    /// second, so two workers created inside the same second in one
    /// process would share an in-flight list. Use this when hosting
    /// multiple workers per process to give each a distinct identity.
    pub fn new_with_timestamp(
        key: impl Into<String>,
        store: Arc<dyn ListStore>,
        start_timestamp: i64,
    ) -> Self {
        let key = key.into();
        let private_key = format!("{key}{TIMESTAMP_SEPARATOR}{start_timestamp}");
        Self {
            key,
            private_key,
            store: RwLock::new(store),
        }
    }

    /// Connects a Redis-backed queue from a [`StoreConfig`].
    pub async fn connect(key: impl Into<String>, config: &StoreConfig) -> Result<Self, QueueError> {
        let store = config.connect().await?;
        Ok(Self::new(key, Arc::new(store)))
    }

    /// Prepares the queue for use.
    ///
    /// Runs an unconditional reclamation sweep so anything left in private
    /// lists under this key prefix (orphans from dead workers, leftovers
    /// from a previous run of this process) is folded back into the shared
    /// list before the first pop. A failure here is fatal to startup.
    pub async fn init(&self) -> Result<(), QueueError> {
        self.return_elements(0).await
    }

    /// Inserts `value` at the head of the shared list.
    ///
    /// No dedup: pushing the same value twice queues it twice.
    pub async fn push(&self, value: &str) -> Result<(), QueueError> {
        self.store().push_head(&self.key, value).await
    }

    /// Pops one element, atomically moving it from the tail of the shared
    /// list to the head of this worker's private list.
    ///
    /// Blocks up to `opts.wait_timeout`; when the wait expires with no data
    /// the distinguished [`QueueError::Empty`] is returned. Transport errors
    /// propagate unchanged.
    pub async fn pop(&self, opts: &PopOptions) -> Result<String, QueueError> {
        if let Some(hook) = &opts.before_pop {
            hook();
        }

        let moved = self
            .store()
            .move_tail_to_head(&self.key, &self.private_key, opts.wait_timeout)
            .await?;

        moved.ok_or(QueueError::Empty)
    }

    /// Acknowledges a popped element by deleting it from the private list.
    ///
    /// Removes the occurrence nearest the tail when duplicates exist. A
    /// value that is no longer present is not an error; it may already have
    /// been reclaimed.
    pub async fn remove(&self, value: &str) -> Result<(), QueueError> {
        self.store()
            .remove_matching(&self.private_key, -1, value)
            .await?;
        Ok(())
    }

    /// Returns the backlog depth of the shared list.
    pub async fn size(&self) -> Result<usize, QueueError> {
        self.store().length(&self.key).await
    }

    /// Reads the current shared-list backlog without consuming it.
    pub async fn snapshot(&self) -> Result<Vec<String>, QueueError> {
        self.store().range(&self.key, 0, -1).await
    }

    /// Returns private-list elements older than `interval_secs` to the
    /// shared list.
    ///
    /// Scans the key space for every private list under this queue's
    /// prefix, parses the start timestamp out of each key, and drains keys
    /// whose age is at least `interval_secs` (every key when
    /// `interval_secs` is 0). Errors moving an individual key are swallowed
    /// so one stuck key cannot block reclamation of the rest; a scan error
    /// aborts the sweep and is returned.
    pub async fn return_elements(&self, interval_secs: i64) -> Result<(), QueueError> {
        let store = self.store();
        let pattern = format!("{}{TIMESTAMP_SEPARATOR}*", self.key);
        let now = Utc::now().timestamp();

        let mut cursor = 0;
        loop {
            let (next_cursor, keys) = store.scan_keys(cursor, &pattern, SCAN_PAGE).await?;

            for found in &keys {
                let timestamp = found
                    .rsplit(TIMESTAMP_SEPARATOR)
                    .next()
                    .and_then(|raw| raw.parse::<i64>().ok());
                let Some(timestamp) = timestamp else {
                    debug!(key = %found, "Skipping key without parsable timestamp");
                    continue;
                };

                if interval_secs > 0 && now - timestamp < interval_secs {
                    continue;
                }

                let mut returned = 0usize;
                loop {
                    match store
                        .move_tail_to_head(found, &self.key, Duration::ZERO)
                        .await
                    {
                        Ok(Some(_)) => returned += 1,
                        Ok(None) => break,
                        Err(e) => {
                            // Best effort per key; keep draining the others.
                            warn!(key = %found, error = %e, "Failed to return element");
                            break;
                        }
                    }
                }

                if returned > 0 {
                    info!(key = %found, returned, "Returned in-flight elements to queue");
                }
            }

            if next_cursor == 0 {
                break;
            }
            cursor = next_cursor;
        }

        Ok(())
    }

    /// Atomically replaces the store client.
    ///
    /// In-flight operations keep the handle they already cloned and finish
    /// against the old client.
    pub fn replace_store(&self, store: Arc<dyn ListStore>) {
        *self.store.write().expect("store lock poisoned") = store;
    }

    /// Spawns a task that reconnects and swaps the store client whenever
    /// the watched [`StoreConfig`] changes. The task ends when the sender
    /// side of the channel is dropped.
    pub fn watch_config(self: &Arc<Self>, mut rx: watch::Receiver<StoreConfig>) -> JoinHandle<()> {
        let queue = Arc::clone(self);
        tokio::spawn(async move {
            while rx.changed().await.is_ok() {
                let config = rx.borrow_and_update().clone();
                match config.connect().await {
                    Ok(store) => {
                        queue.replace_store(Arc::new(store));
                        info!(url = %config.url, "Swapped queue store client");
                    }
                    Err(e) => {
                        warn!(url = %config.url, error = %e, "Failed to connect updated store config");
                    }
                }
            }
        })
    }

    /// Returns the shared-list key.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Returns this worker's private-list key.
    pub fn private_key(&self) -> &str {
        &self.private_key
    }

    fn store(&self) -> Arc<dyn ListStore> {
        Arc::clone(&self.store.read().expect("store lock poisoned"))
    }
}
