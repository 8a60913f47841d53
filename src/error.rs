//! Error types for the channel link
//!
//! Bus-level failures keep their own [`BusError`] classification so the
//! lifecycle core can react to them; everything surfaced to callers is
//! wrapped in [`LinkError`].

use crate::transport::BusError;
use thiserror::Error;

/// Main error type for channel link operations
#[derive(Debug, Error)]
pub enum LinkError {
    #[error("Bus error: {0}")]
    Bus(#[from] BusError),

    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    #[error("Envelope encoding failed: {0}")]
    Envelope(#[from] serde_json::Error),

    #[error("Invalid input: {message}")]
    InvalidInput { message: String },

    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl LinkError {
    /// Create invalid input error
    pub fn invalid_input<S: Into<String>>(message: S) -> Self {
        Self::InvalidInput {
            message: message.into(),
        }
    }

    /// Create internal error
    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }
}

/// Result type for channel link operations
pub type LinkResult<T> = Result<T, LinkError>;
