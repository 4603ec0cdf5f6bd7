//! Error types for the Gatekeeper service.

use thiserror::Error;

use crate::ratelimit::StoreError;
use crate::upstream::ThrottleError;

/// Main error type for Gatekeeper operations.
#[derive(Error, Debug)]
pub enum AdmissionError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Counter store errors
    #[error("Counter store error: {0}")]
    Store(#[from] StoreError),

    /// Upstream throttle errors
    #[error("Throttle error: {0}")]
    Throttle(#[from] ThrottleError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<config::ConfigError> for AdmissionError {
    fn from(err: config::ConfigError) -> Self {
        AdmissionError::Config(err.to_string())
    }
}

/// Result type alias for Gatekeeper operations.
pub type Result<T> = std::result::Result<T, AdmissionError>;
