//! Error taxonomy for the events pipeline
//!
//! Nothing in here ever reaches the purchase flow: tracker operations swallow
//! and log these. They travel only across the internal seams (flush callback,
//! transport, key/value store) so the scheduler can decide whether to back off.

use thiserror::Error;

/// Events pipeline errors
#[derive(Debug, Clone, Error, PartialEq)]
pub enum EventsError {
    /// Request never got a response (DNS, connect, reset, timeout)
    #[error("Transport error: {message} (endpoint: {endpoint})")]
    Transport { endpoint: String, message: String },

    /// Collector answered with something other than 200/201
    #[error("Unexpected status {status} from collector (endpoint: {endpoint})")]
    UnexpectedStatus { endpoint: String, status: u16 },

    /// Event could not be turned into its wire form
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Event name, property key or value the wire format cannot carry
    #[error("Invalid property {key}: {reason}")]
    InvalidProperty { key: String, reason: String },

    /// Persistent key/value store failure
    #[error("Storage error: {0}")]
    Storage(String),

    /// Invalid configuration
    #[error("Configuration error: {0}")]
    Configuration(String),
}

impl EventsError {
    /// Check if this error is a transient delivery failure worth retrying
    pub fn is_retryable(&self) -> bool {
        match self {
            EventsError::Transport { .. } => true,
            EventsError::UnexpectedStatus { .. } => true,

            EventsError::Serialization(_) => false,
            EventsError::InvalidProperty { .. } => false,
            EventsError::Storage(_) => false,
            EventsError::Configuration(_) => false,
        }
    }
}

impl From<serde_json::Error> for EventsError {
    fn from(err: serde_json::Error) -> Self {
        EventsError::Serialization(err.to_string())
    }
}

/// Result alias for the events pipeline
pub type EventsResult<T> = Result<T, EventsError>;
