//! Error types shared across feedline crates

use thiserror::Error;

/// Result type alias for shared helpers
pub type Result<T> = std::result::Result<T, CommonError>;

/// Errors raised by shared helpers
#[derive(Error, Debug)]
pub enum CommonError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid timestamp '{value}': {reason}")]
    InvalidTimestamp { value: String, reason: String },
}

impl CommonError {
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }
}
