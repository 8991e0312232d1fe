//! Error types for the execsentry event bus

use thiserror::Error;

/// Result type alias for event bus operations
pub type Result<T> = std::result::Result<T, EventBusError>;

/// Errors that can occur in event bus operations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EventBusError {
    /// Shutdown has begun; no further publishes or subscriptions are accepted
    #[error("Event bus is closed")]
    Closed,

    /// The configured subscriber limit has been reached
    #[error("Subscriber limit reached ({limit})")]
    SubscriberLimit { limit: usize },

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Configuration(String),
}

impl EventBusError {
    /// Create a configuration error
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    /// True if the error is [`EventBusError::Closed`].
    pub fn is_closed(&self) -> bool {
        matches!(self, Self::Closed)
    }
}
