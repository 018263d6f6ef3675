//! Pluggable per-job-kind capabilities.
//!
//! An [`Assistant`] owns one job kind: it builds fresh decode targets and
//! handles decoded payloads. A [`JobData`] carries the type tag the kind
//! registers under and its own wire marshalling, so the queue core never
//! depends on any concrete payload format.

use async_trait::async_trait;

/// A typed job payload.
pub trait JobData: Send {
    /// Type tag this payload registers and dispatches under. Must not
    /// contain the envelope separator.
    fn name(&self) -> &str;

    /// Serializes the payload for the wire.
    fn marshal(&self) -> anyhow::Result<Vec<u8>>;

    /// Fills this payload in from wire bytes.
    fn unmarshal(&mut self, raw: &[u8]) -> anyhow::Result<()>;
}

/// Handler capability for one job kind.
///
/// `on_decoded` is solely responsible for acknowledging the job: call
/// [`ReliableQueue::remove`](crate::queue::ReliableQueue::remove) once the
/// work is durably finished, or the element stays in-flight and will be
/// redelivered by a later reclamation sweep. The dispatcher never acks.
#[async_trait]
pub trait Assistant: Send + Sync {
    /// Builds a fresh, empty decode target for this kind.
    fn new_data(&self) -> Box<dyn JobData>;

    /// Handles one decoded payload.
    async fn on_decoded(&self, data: Box<dyn JobData>) -> anyhow::Result<()>;
}
