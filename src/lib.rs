//! relq: reliable at-least-once work queue over Redis lists.
//!
//! Producers push type-tagged envelopes onto a shared list; workers pop
//! them with an atomic move into a worker-private in-flight list, so a
//! crash never loses a job. A periodic reclamation sweep folds stale
//! private lists back into the shared backlog, and a [`Dispatcher`] routes
//! decoded payloads to registered [`Assistant`]s under a bounded
//! concurrency cap.

pub mod assistant;
pub mod config;
pub mod dispatch;
pub mod envelope;
pub mod error;
pub mod queue;
pub mod store;

// Re-export the types most callers need
pub use assistant::{Assistant, JobData};
pub use config::StoreConfig;
pub use dispatch::{Dispatcher, DispatcherConfig};
pub use error::QueueError;
pub use queue::{PopOptions, ReliableQueue};
pub use store::{ListStore, MemoryStore, RedisListStore};
