// src/errors.rs

use lapin::Error as LapinError;
use serde_json::Error as SerdeError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BusError {
    /// A required argument was missing or empty. Raised before any broker interaction.
    #[error("{0} required")]
    MissingField(&'static str),

    #[error("Bus must be started before getting {0} channel.")]
    NotStarted(&'static str),

    #[error("RabbitMQ connection error: {0}")]
    ConnectionError(String),

    #[error("RabbitMQ channel error: {0}")]
    ChannelError(String),

    /// Exchange/queue assertion or binding rejected by the broker.
    #[error("RabbitMQ topology error on {resource}: {reason}")]
    TopologyError { resource: String, reason: String },

    #[error("RabbitMQ publish error: {0}")]
    PublishError(String),

    #[error("RabbitMQ consume error: {0}")]
    ConsumeError(String),

    #[error("RabbitMQ acknowledge error: {0}")]
    AckError(String),

    #[error("Message serialization error: {0}")]
    SerializationError(#[from] SerdeError),

    #[error("Timed out waiting for response to {message_type} ({timeout_ms} ms).")]
    Timeout { message_type: String, timeout_ms: u64 },

    /// The responder answered with an `{"error": ...}` envelope.
    #[error("{message_type} handler failed: {message}")]
    HandlerError { message_type: String, message: String },

    #[error("Reply consumer for {0} stopped before a response arrived")]
    ReplyChannelClosed(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),
}

// Custom Result type for bus operations
pub type Result<T> = std::result::Result<T, BusError>;

impl BusError {
    pub fn topology(resource: impl Into<String>, reason: impl ToString) -> Self {
        BusError::TopologyError {
            resource: resource.into(),
            reason: reason.to_string(),
        }
    }

    /// True for faults that take the whole connection down rather than one channel.
    pub fn is_connection_level(&self) -> bool {
        matches!(self, BusError::ConnectionError(_))
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, BusError::Timeout { .. })
    }

    pub fn is_handler_error(&self) -> bool {
        matches!(self, BusError::HandlerError { .. })
    }
}

// Converting from lapin errors
impl From<LapinError> for BusError {
    fn from(error: LapinError) -> Self {
        match error {
            LapinError::IOError(_) | LapinError::InvalidConnectionState(_) => {
                BusError::ConnectionError(error.to_string())
            }
            other => BusError::ChannelError(other.to_string()),
        }
    }
}
