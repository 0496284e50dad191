//! Error types for webhook formatting and delivery.
//!
//! Separates transient delivery failures, which feed the retry policy, from
//! contract violations such as formatting an event type a destination has no
//! builder for, which indicate a caller or configuration bug.

use std::fmt;

use herald_core::{CoreError, DestinationKind, EventType};
use thiserror::Error;

/// Result type alias for delivery operations.
pub type Result<T> = std::result::Result<T, DeliveryError>;

/// Errors raised while formatting, delivering or recording a webhook.
#[derive(Debug, Clone, Error)]
pub enum DeliveryError {
    /// Connection could not be established or broke mid-request.
    #[error("network connection failed: {message}")]
    NetworkError {
        /// Error message describing the network failure
        message: String,
    },

    /// The per-call timeout elapsed.
    #[error("request timeout after {timeout_ms}ms")]
    Timeout {
        /// Configured per-call timeout in milliseconds
        timeout_ms: u64,
    },

    /// Destination answered 4xx.
    #[error("client error: HTTP {status_code}")]
    ClientError {
        /// HTTP status code (4xx)
        status_code: u16,
        /// Truncated response body
        body: String,
    },

    /// Destination answered 5xx.
    #[error("server error: HTTP {status_code}")]
    ServerError {
        /// HTTP status code (5xx)
        status_code: u16,
        /// Truncated response body
        body: String,
    },

    /// Destination answered with a non-2xx status outside 4xx/5xx.
    #[error("unexpected response: HTTP {status_code}")]
    UnexpectedStatus {
        /// HTTP status code
        status_code: u16,
    },

    /// No payload builder exists for this event type and destination.
    #[error("unsupported event type {event_type} for {destination} destination")]
    UnsupportedEventType {
        /// Event type that could not be formatted
        event_type: EventType,
        /// Destination kind that lacks a builder
        destination: DestinationKind,
    },

    /// A payload could not be serialized.
    #[error("payload serialization failed: {message}")]
    Serialization {
        /// Serializer error message
        message: String,
    },

    /// Retry store operation failed.
    #[error("storage error: {message}")]
    StorageError {
        /// Storage error message
        message: String,
    },

    /// Invalid client or engine configuration.
    #[error("invalid configuration: {message}")]
    ConfigurationError {
        /// Configuration error message
        message: String,
    },

    /// The task running an attempt panicked before reporting an outcome.
    #[error("delivery attempt panicked: {message}")]
    AttemptPanicked {
        /// Panic payload, when it was a string
        message: String,
    },

    /// Unexpected internal error.
    #[error("internal delivery error: {message}")]
    InternalError {
        /// Internal error message
        message: String,
    },
}

impl DeliveryError {
    /// Creates a network error from a message.
    pub fn network(message: impl Into<String>) -> Self {
        Self::NetworkError { message: message.into() }
    }

    /// Creates a timeout error.
    pub fn timeout(timeout_ms: u64) -> Self {
        Self::Timeout { timeout_ms }
    }

    /// Creates the error matching a non-2xx response status.
    pub fn from_status(status_code: u16, body: impl Into<String>) -> Self {
        match status_code {
            400..=499 => Self::ClientError { status_code, body: body.into() },
            500..=599 => Self::ServerError { status_code, body: body.into() },
            _ => Self::UnexpectedStatus { status_code },
        }
    }

    /// Creates an unsupported event type error.
    pub fn unsupported_event_type(event_type: EventType, destination: DestinationKind) -> Self {
        Self::UnsupportedEventType { event_type, destination }
    }

    /// Creates a storage error.
    pub fn storage(message: impl Into<String>) -> Self {
        Self::StorageError { message: message.into() }
    }

    /// Creates a configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::ConfigurationError { message: message.into() }
    }

    /// Creates the error recorded when an attempt task panicked.
    pub fn attempt_panicked(message: impl Into<String>) -> Self {
        Self::AttemptPanicked { message: message.into() }
    }

    /// Creates an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::InternalError { message: message.into() }
    }

    /// Whether the failure is transient and should go through backoff.
    ///
    /// Every network outcome and every non-2xx status is retried. Contract
    /// and configuration errors are not: retrying cannot fix them.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::NetworkError { .. }
            | Self::Timeout { .. }
            | Self::ClientError { .. }
            | Self::ServerError { .. }
            | Self::UnexpectedStatus { .. }
            | Self::StorageError { .. }
            | Self::AttemptPanicked { .. } => true,

            Self::UnsupportedEventType { .. }
            | Self::Serialization { .. }
            | Self::ConfigurationError { .. }
            | Self::InternalError { .. } => false,
        }
    }

    /// HTTP status returned by the destination, if it answered.
    pub fn status_code(&self) -> Option<u16> {
        match self {
            Self::ClientError { status_code, .. }
            | Self::ServerError { status_code, .. }
            | Self::UnexpectedStatus { status_code } => Some(*status_code),
            _ => None,
        }
    }
}

impl From<CoreError> for DeliveryError {
    fn from(err: CoreError) -> Self {
        Self::storage(err.to_string())
    }
}

impl From<serde_json::Error> for DeliveryError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization { message: err.to_string() }
    }
}

/// Category of delivery error for logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Network connectivity or timeouts.
    Network,
    /// HTTP 4xx.
    Client,
    /// HTTP 5xx or other unexpected statuses.
    Server,
    /// Caller or configuration bug.
    Contract,
    /// Retry store.
    Storage,
    /// Everything else.
    Internal,
}

impl From<&DeliveryError> for ErrorCategory {
    fn from(error: &DeliveryError) -> Self {
        match error {
            DeliveryError::NetworkError { .. } | DeliveryError::Timeout { .. } => Self::Network,
            DeliveryError::ClientError { .. } => Self::Client,
            DeliveryError::ServerError { .. } | DeliveryError::UnexpectedStatus { .. } => {
                Self::Server
            },
            DeliveryError::UnsupportedEventType { .. }
            | DeliveryError::Serialization { .. }
            | DeliveryError::ConfigurationError { .. } => Self::Contract,
            DeliveryError::StorageError { .. } => Self::Storage,
            DeliveryError::AttemptPanicked { .. } | DeliveryError::InternalError { .. } => {
                Self::Internal
            },
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Network => write!(f, "network"),
            Self::Client => write!(f, "client"),
            Self::Server => write!(f, "server"),
            Self::Contract => write!(f, "contract"),
            Self::Storage => write!(f, "storage"),
            Self::Internal => write!(f, "internal"),
        }
    }
}
