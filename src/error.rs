//! Error types for queue and dispatch operations.
//!
//! The important distinction for callers is between real failures and the
//! [`QueueError::Empty`] signal: a blocking pop that times out with no data
//! returns `Empty`, which is an expected outcome and not worth logging loudly.

use thiserror::Error;

/// Errors that can occur during queue operations.
#[derive(Debug, Error)]
pub enum QueueError {
    /// Failed to connect to Redis.
    #[error("Redis connection failed: {0}")]
    ConnectionFailed(String),

    /// Redis operation failed.
    #[error("Redis operation failed: {0}")]
    Redis(#[from] redis::RedisError),

    /// The queue held no data within the pop wait window.
    ///
    /// This is the normal idle outcome; callers loop on it.
    #[error("Queue is empty")]
    Empty,

    /// A wire value did not split into exactly `tag` + separator + `payload`.
    #[error("Malformed envelope: {0}")]
    Envelope(String),

    /// A payload failed to unmarshal into its registered data type.
    #[error("Payload decode failed for '{tag}': {message}")]
    Decode { tag: String, message: String },

    /// A payload failed to marshal at push time.
    #[error("Payload marshal failed: {0}")]
    Marshal(String),

    /// No assistant is registered for the envelope's type tag.
    #[error("No assistant registered for tag '{0}'")]
    UnknownTag(String),

    /// An assistant's completion callback returned an error.
    #[error("Assistant failed: {0}")]
    Handler(String),

    /// An assistant's completion callback panicked.
    #[error("Assistant panicked: {0}")]
    HandlerPanic(String),
}

impl QueueError {
    /// Returns whether this is the non-fatal empty-queue signal.
    pub fn is_empty_signal(&self) -> bool {
        matches!(self, QueueError::Empty)
    }
}
