//! Error types for the events crate.

use thiserror::Error;

/// Result type alias for store and channel operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Store and channel errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum Error {
    /// The resource record does not exist.
    #[error("resource '{id}' not found")]
    ResourceNotFound { id: String },

    /// The backing store could not be reached. Retrying may succeed.
    #[error("resource store operation '{operation}' failed: {reason}")]
    StoreUnavailable { operation: String, reason: String },

    /// The channel has no more senders.
    #[error("log channel closed")]
    ChannelClosed,
}

impl Error {
    /// Create a resource not found error.
    pub fn resource_not_found(id: impl ToString) -> Self {
        Self::ResourceNotFound { id: id.to_string() }
    }

    /// Create a store unavailable error.
    pub fn store_unavailable(operation: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::StoreUnavailable {
            operation: operation.into(),
            reason: reason.into(),
        }
    }

    /// Whether retrying the operation may succeed.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::StoreUnavailable { .. })
    }
}
