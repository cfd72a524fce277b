//! Error types for notify-core

use thiserror::Error;

use crate::sip::StatusCode;

/// Result type alias for agent operations
pub type Result<T> = std::result::Result<T, NotifyError>;

/// Main error type for subscription and event-state operations
#[derive(Error, Debug, Clone)]
pub enum NotifyError {
    /// Malformed or unsupported inbound request, answered with `status`
    #[error("Validation failed ({status}): {reason}")]
    Validation { status: StatusCode, reason: String },

    /// Failure establishing a dialog or sending a request on it
    #[error("Transport error: {0}")]
    Transport(String),

    /// Connection or command failure against the key-value store
    #[error("Store error: {0}")]
    Store(String),

    /// A record that the caller expected to exist is missing
    #[error("Not found: {0}")]
    NotFound(String),

    /// Subscription descriptor is incomplete for the requested operation
    #[error("Invalid subscription: {0}")]
    InvalidSubscription(String),

    /// A URI could not be parsed into an address of record
    #[error("Invalid URI: {0}")]
    InvalidUri(String),

    /// dialog-info document could not be rendered
    #[error("XML error: {0}")]
    Xml(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl NotifyError {
    /// Shorthand for a validation failure
    pub fn validation(status: StatusCode, reason: impl Into<String>) -> Self {
        NotifyError::Validation {
            status,
            reason: reason.into(),
        }
    }

    /// SIP status used when this error ends a SUBSCRIBE transaction
    pub fn status_code(&self) -> StatusCode {
        match self {
            NotifyError::Validation { status, .. } => *status,
            NotifyError::InvalidUri(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::TEMPORARILY_UNAVAILABLE,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, NotifyError::NotFound(_))
    }
}

impl From<std::io::Error> for NotifyError {
    fn from(err: std::io::Error) -> Self {
        NotifyError::Internal(err.to_string())
    }
}

impl From<toml::de::Error> for NotifyError {
    fn from(err: toml::de::Error) -> Self {
        NotifyError::Config(err.to_string())
    }
}

#[cfg(feature = "redis")]
impl From<redis::RedisError> for NotifyError {
    fn from(err: redis::RedisError) -> Self {
        NotifyError::Store(err.to_string())
    }
}
