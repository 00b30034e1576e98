//! Broker error types.

use thiserror::Error;

/// Errors raised by broker transports, the handler registry and message
/// encoding.
#[derive(Debug, Error)]
pub enum BrokerError {
    /// Could not connect to the broker.
    #[error("broker connection error: {0}")]
    Connection(String),

    /// Stream or durable consumer could not be created or looked up.
    #[error("broker setup error: {0}")]
    Setup(String),

    /// A message could not be handed to the broker.
    #[error("publish to '{topic}' failed: {reason}")]
    Publish {
        /// Topic the message was meant for.
        topic: String,
        /// Underlying cause.
        reason: String,
    },

    /// The broker reported an error while receiving.
    #[error("receive error: {0}")]
    Receive(String),

    /// The subscription is gone and will deliver nothing more.
    #[error("subscription closed: {0}")]
    StreamClosed(String),

    /// Benign end-of-partition signal; carries no message.
    #[error("end of partition on '{0}'")]
    EndOfPartition(String),

    /// Acknowledging a processed message failed.
    #[error("commit failed: {0}")]
    Commit(String),

    /// A message body could not be encoded or decoded.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Two different payload types claimed the same event kind.
    #[error("event kind '{0}' is already registered with a different payload type")]
    KindConflict(&'static str),

    /// Invalid broker configuration.
    #[error("broker configuration error: {0}")]
    Config(String),
}

impl BrokerError {
    /// Returns `true` for signals the consumer loop ignores silently.
    #[must_use]
    pub fn is_benign(&self) -> bool {
        matches!(self, Self::EndOfPartition(_))
    }

    /// Returns `true` when polling again cannot succeed.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::StreamClosed(_))
    }
}
