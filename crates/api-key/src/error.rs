//! Error types for API key operations.

use thiserror::Error;

/// Errors that can occur during API key operations.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ApiKeyError {
    /// Token is empty or whitespace only
    #[error("Empty token")]
    Empty,

    /// Token format is invalid (too few parts, empty part)
    #[error("Invalid token format")]
    InvalidFormat,

    /// Token prefix doesn't match expected value
    #[error("Invalid prefix: expected '{expected}', got '{got}'")]
    InvalidPrefix { expected: String, got: String },

    /// Key id is outside `[A-Za-z0-9-]{6,64}`
    #[error("Invalid key id")]
    InvalidKeyId,

    /// Secret is empty after trimming
    #[error("Invalid secret")]
    InvalidSecret,
}

/// Result type alias for API key operations.
pub type Result<T> = std::result::Result<T, ApiKeyError>;
