//! Error types for the reconciler crate.
//!
//! Every variant that can end a reconciliation maps onto a status `reason`
//! through [`Error::status_reason`].

use std::fmt;
use std::time::Duration;

/// Result type alias for reconciler operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Reconciler error types.
#[derive(Debug, Clone)]
pub enum Error {
    /// Missing required parameter, unresolved secret, schema mismatch.
    Configuration { reason: String },
    /// Another workflow holds the resource's execution gate.
    Busy { resource: String },
    /// The workflow exceeded its ceiling and was killed.
    Timeout { resource: String, after: Duration },
    /// The workflow exited unsuccessfully.
    WorkflowFailure {
        exit_code: Option<i32>,
        excerpt: String,
    },
    /// Status persistence or secret lookup failed; retrying may help.
    TransientIo { operation: String, reason: String },
    /// Loop was stopped.
    LoopStopped,
    /// Invalid controller configuration.
    InvalidConfig { reason: String },
    /// Resource store failure that retrying will not fix.
    Store { reason: String },
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Configuration { reason } => {
                write!(f, "configuration error: {reason}")
            }
            Self::Busy { resource } => {
                write!(f, "resource '{resource}' is busy")
            }
            Self::Timeout { resource, after } => {
                write!(
                    f,
                    "workflow for '{resource}' timed out after {}s",
                    after.as_secs()
                )
            }
            Self::WorkflowFailure { exit_code, excerpt } => match exit_code {
                Some(code) => write!(f, "workflow exited with code {code}: {excerpt}"),
                None => write!(f, "workflow terminated by signal: {excerpt}"),
            },
            Self::TransientIo { operation, reason } => {
                write!(f, "transient I/O error during {operation}: {reason}")
            }
            Self::LoopStopped => {
                write!(f, "reconciliation loop stopped")
            }
            Self::InvalidConfig { reason } => {
                write!(f, "invalid configuration: {reason}")
            }
            Self::Store { reason } => {
                write!(f, "resource store error: {reason}")
            }
        }
    }
}

impl std::error::Error for Error {}

impl Error {
    /// Create a configuration error.
    pub fn configuration(reason: impl Into<String>) -> Self {
        Self::Configuration {
            reason: reason.into(),
        }
    }

    /// Create a busy error.
    pub fn busy(resource: impl ToString) -> Self {
        Self::Busy {
            resource: resource.to_string(),
        }
    }

    /// Create a timeout error.
    pub fn timeout(resource: impl ToString, after: Duration) -> Self {
        Self::Timeout {
            resource: resource.to_string(),
            after,
        }
    }

    /// Create a workflow failure error.
    pub fn workflow_failure(exit_code: Option<i32>, excerpt: impl Into<String>) -> Self {
        Self::WorkflowFailure {
            exit_code,
            excerpt: excerpt.into(),
        }
    }

    /// Create a transient I/O error.
    pub fn transient_io(operation: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::TransientIo {
            operation: operation.into(),
            reason: reason.into(),
        }
    }

    /// Create an invalid config error.
    pub fn invalid_config(reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            reason: reason.into(),
        }
    }

    /// Whether the operation should be retried automatically.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Busy { .. } | Self::TransientIo { .. })
    }

    /// The `reason` string written onto a resource's status.
    #[must_use]
    pub const fn status_reason(&self) -> &'static str {
        match self {
            Self::Configuration { .. } | Self::InvalidConfig { .. } => "ConfigurationError",
            Self::Busy { .. } => "Busy",
            Self::Timeout { .. } => "Timeout",
            Self::WorkflowFailure { .. } => "WorkflowFailure",
            Self::TransientIo { .. } => "TransientIOError",
            Self::LoopStopped | Self::Store { .. } => "InternalError",
        }
    }
}

impl From<playop_core::Error> for Error {
    fn from(err: playop_core::Error) -> Self {
        Self::configuration(err.to_string())
    }
}

impl From<playop_events::Error> for Error {
    fn from(err: playop_events::Error) -> Self {
        if err.is_transient() {
            Self::transient_io("resource store", err.to_string())
        } else {
            Self::Store {
                reason: err.to_string(),
            }
        }
    }
}
