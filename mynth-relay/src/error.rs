//! Error types for queue operations.

use thiserror::Error;

/// Failure reported by a broker backend.
#[derive(Debug, Error)]
pub enum TransportError {
    /// AMQP client error
    #[error("AMQP error: {0}")]
    Amqp(#[from] lapin::Error),

    /// In-process broker error
    #[error("{0}")]
    Memory(String),
}

/// Errors surfaced by `connect`, `publish` and `subscribe`.
#[derive(Debug, Error)]
pub enum QueueError {
    /// Broker endpoint is missing or malformed
    #[error("{0}")]
    Configuration(String),

    /// Connection or channel could not be established
    #[error("failed to connect to RabbitMQ: {0}")]
    Connection(#[source] TransportError),

    /// Publish or subscribe was called before `connect()`
    #[error("RabbitMQ channel not initialized")]
    NotInitialized,

    /// Queue names must be non-empty
    #[error("queue name must not be empty")]
    InvalidQueueName,

    /// Broker rejected the queue declaration
    #[error("failed to declare queue `{queue}`: {source}")]
    QueueDeclaration {
        queue: String,
        #[source]
        source: TransportError,
    },

    /// Payload could not be encoded as JSON
    #[error("failed to serialize message: {0}")]
    Serialization(#[source] serde_json::Error),

    /// Delivered payload was not valid JSON for the expected type
    #[error("failed to deserialize message: {0}")]
    Deserialization(#[source] serde_json::Error),

    /// Send, consume or acknowledge failed on an open channel
    #[error("broker operation failed: {0}")]
    Broker(#[source] TransportError),
}

/// Result type alias for queue operations
pub type Result<T> = std::result::Result<T, QueueError>;
