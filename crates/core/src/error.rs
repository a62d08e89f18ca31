//! Core error types for playop.
//!
//! All errors are explicit, typed, and recoverable - no panics allowed.

use thiserror::Error;

/// Result type alias for core operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    /// A parameter value outside the closed set of supported kinds.
    #[error("invalid parameter '{key}': {reason}")]
    InvalidParam { key: String, reason: String },

    /// A resource identity that cannot be parsed.
    #[error("invalid resource identity '{input}': {reason}")]
    InvalidResourceId { input: String, reason: String },
}

impl Error {
    /// Create an invalid parameter error.
    pub fn invalid_param(key: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidParam {
            key: key.into(),
            reason: reason.into(),
        }
    }

    /// Create an invalid resource identity error.
    pub fn invalid_resource_id(input: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidResourceId {
            input: input.into(),
            reason: reason.into(),
        }
    }
}
