//! Error types for the toolgate domain.
//!
//! Uses `thiserror` for ergonomic error definitions. `GateError` is the
//! cross-cutting taxonomy every rejected or failed operation ends up in;
//! guard crates define their own narrower errors and convert into it.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Result type alias using [`GateError`].
pub type Result<T> = std::result::Result<T, GateError>;

/// Every way an operation can fail to produce output.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum GateError {
    /// Malformed request (empty path, unbalanced quotes, missing argument).
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// The request failed a path, URL, or command policy.
    #[error("Access denied: {0}")]
    AccessDenied(String),

    #[error("Rate limited on '{resource}', retry after {}ms", retry_after.as_millis())]
    RateLimited {
        resource: String,
        retry_after: Duration,
    },

    /// A file, command output, or response body was larger than allowed.
    #[error("Size limit exceeded: {actual} bytes > {limit} bytes")]
    SizeExceeded { limit: u64, actual: u64 },

    #[error("Operation timed out after {}ms", after.as_millis())]
    Timeout { after: Duration },

    /// The operation ran but the OS or network reported failure.
    #[error("Execution failed: {reason}")]
    Execution {
        reason: String,
        /// Scrubbed stdout/stderr or response body, when there is any.
        output: Option<String>,
    },

    /// No handler is registered for the requested kind.
    #[error("No handler registered for '{0}'")]
    Unsupported(String),
}

/// Flat tag for [`GateError`], used in audit details and serialized outcomes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    InvalidInput,
    AccessDenied,
    RateLimited,
    SizeExceeded,
    Timeout,
    ExecutionError,
    Unsupported,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::InvalidInput => "invalid_input",
            ErrorKind::AccessDenied => "access_denied",
            ErrorKind::RateLimited => "rate_limited",
            ErrorKind::SizeExceeded => "size_exceeded",
            ErrorKind::Timeout => "timeout",
            ErrorKind::ExecutionError => "execution_error",
            ErrorKind::Unsupported => "unsupported",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl GateError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            GateError::InvalidInput(_) => ErrorKind::InvalidInput,
            GateError::AccessDenied(_) => ErrorKind::AccessDenied,
            GateError::RateLimited { .. } => ErrorKind::RateLimited,
            GateError::SizeExceeded { .. } => ErrorKind::SizeExceeded,
            GateError::Timeout { .. } => ErrorKind::Timeout,
            GateError::Execution { .. } => ErrorKind::ExecutionError,
            GateError::Unsupported(_) => ErrorKind::Unsupported,
        }
    }

    /// Policy failures are decided before anything runs.
    pub fn is_policy_violation(&self) -> bool {
        matches!(
            self,
            GateError::InvalidInput(_) | GateError::AccessDenied(_) | GateError::Unsupported(_)
        )
    }

    pub fn execution(reason: impl Into<String>) -> Self {
        GateError::Execution {
            reason: reason.into(),
            output: None,
        }
    }
}
