//! Error types for the JetStream adapter.

use messaging::ErrorCategory;
use thiserror::Error;

/// Error that can occur while publishing, subscribing or coding messages.
#[derive(Debug, Error)]
pub enum JetStreamError {
    /// NATS connection error
    #[error("NATS connection error: {0}")]
    Connection(#[from] async_nats::ConnectError),

    /// Invalid publisher or subscriber configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// Envelope could not be turned into a wire message
    #[error("Encode error: {0}")]
    Encode(String),

    /// Wire message could not be turned into an envelope
    #[error("Decode error: {0}")]
    Decode(String),

    /// Stream lookup or creation failed
    #[error("Provisioning error for topic {topic}: {message}")]
    Provision { topic: String, message: String },

    /// Publish error
    #[error("Publish error: {0}")]
    Publish(String),

    /// Consumer error
    #[error("Consumer error: {0}")]
    Consumer(String),

    /// Consumer was removed from the server while pulling
    #[error("Consumer deleted: {0}")]
    ConsumerDeleted(String),

    /// Acknowledgment error
    #[error("Ack error: {0}")]
    Ack(String),

    /// JetStream error
    #[error("JetStream error: {0}")]
    JetStream(String),

    /// Stream not found
    #[error("Stream not found: {0}")]
    StreamNotFound(String),

    /// Publisher or subscriber already closed
    #[error("{0} is closed")]
    Closed(&'static str),
}

impl JetStreamError {
    /// Get the error category for retry decisions.
    pub fn category(&self) -> ErrorCategory {
        match self {
            // Permanent errors - retrying the same call can't help
            JetStreamError::Config(_) => ErrorCategory::Permanent,
            JetStreamError::Encode(_) => ErrorCategory::Permanent,
            JetStreamError::Decode(_) => ErrorCategory::Permanent,
            JetStreamError::Closed(_) => ErrorCategory::Permanent,
            JetStreamError::ConsumerDeleted(_) => ErrorCategory::Permanent,

            // Broker-side trouble
            _ => ErrorCategory::Transient,
        }
    }

    /// Create a JetStream error from an async_nats error.
    pub fn from_jetstream_error(error: impl std::fmt::Display) -> Self {
        Self::JetStream(error.to_string())
    }

    /// Create a configuration error.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create an encode error.
    pub fn encode(msg: impl std::fmt::Display) -> Self {
        Self::Encode(msg.to_string())
    }

    /// Create a decode error.
    pub fn decode(msg: impl std::fmt::Display) -> Self {
        Self::Decode(msg.to_string())
    }

    /// Create a provisioning error.
    pub fn provision(topic: &str, msg: impl std::fmt::Display) -> Self {
        Self::Provision {
            topic: topic.to_string(),
            message: msg.to_string(),
        }
    }

    /// Create a publish error.
    pub fn publish_error(msg: impl std::fmt::Display) -> Self {
        Self::Publish(msg.to_string())
    }

    /// Create a consumer error.
    pub fn consumer_error(msg: impl std::fmt::Display) -> Self {
        Self::Consumer(msg.to_string())
    }

    /// Create an ack error.
    pub fn ack_error(msg: impl std::fmt::Display) -> Self {
        Self::Ack(msg.to_string())
    }
}

/// Result alias used throughout the crate.
pub type Result<T, E = JetStreamError> = std::result::Result<T, E>;
