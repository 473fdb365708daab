//! Error types for rate limiting operations.
//!
//! Being over the limit is not an error: limiters report it as `Ok(false)`.
//! Everything here is either a storage failure, a configuration mistake, or
//! the "no data yet" condition returned by the windowed limiters' `stats`.

use std::time::Duration;
use thiserror::Error;

/// Result type for rate limiting operations.
pub type Result<T> = std::result::Result<T, RateLimitError>;

/// Main error type for rate limiting operations.
#[derive(Debug, Error)]
pub enum RateLimitError {
    /// Storage backend error.
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Connection error (e.g., Redis connection failed).
    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),

    /// No rate limit state has been recorded for the key yet.
    #[error("No rate limit data for key: {0}")]
    NotFound(String),
}

impl RateLimitError {
    /// Check if this error is the "no data yet" condition.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

/// Storage-related errors.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Generic storage operation failed.
    #[error("{message}")]
    OperationFailed {
        /// Error message.
        message: String,
        /// Whether the operation can be retried.
        retryable: bool,
    },

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// The stored payload has a different shape than the caller expects.
    #[error("Key {key} holds a {found} value, expected a {expected}")]
    TypeMismatch {
        /// Storage key.
        key: String,
        /// Payload kind the caller needed.
        expected: &'static str,
        /// Payload kind actually stored.
        found: &'static str,
    },

    /// Connection pool exhausted.
    #[error("Connection pool exhausted")]
    PoolExhausted,
}

impl StorageError {
    /// Create a new operation failed error.
    pub fn operation_failed(message: impl Into<String>, retryable: bool) -> Self {
        Self::OperationFailed {
            message: message.into(),
            retryable,
        }
    }

    /// Create a type mismatch error.
    pub fn type_mismatch(key: &str, expected: &'static str, found: &'static str) -> Self {
        Self::TypeMismatch {
            key: key.to_string(),
            expected,
            found,
        }
    }

    /// Check if this error is retryable.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::OperationFailed { retryable, .. } => *retryable,
            Self::PoolExhausted => true,
            _ => false,
        }
    }
}

/// Configuration-related errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Invalid limiter configuration.
    #[error("Invalid config: {0}")]
    InvalidConfig(String),

    /// Invalid storage configuration.
    #[error("Invalid storage configuration: {0}")]
    InvalidStorage(String),

    /// Missing required configuration.
    #[error("Missing required configuration: {0}")]
    MissingRequired(String),
}

/// Connection-related errors.
#[derive(Debug, Error)]
pub enum ConnectionError {
    /// Failed to connect.
    #[error("Failed to connect: {0}")]
    ConnectionFailed(String),

    /// Connection timeout.
    #[error("Connection timeout after {0:?}")]
    Timeout(Duration),
}
