//! Error types shared across the workspace.

use thiserror::Error;

/// Workspace-wide error. Backend errors (SQLite, HTTP, SMTP) are flattened
/// into the string-carrying variant for their concern.
#[derive(Debug, Error)]
pub enum GreeterError {
    #[error("Config error: {0}")]
    Config(String),

    #[error("Store error: {0}")]
    Store(String),

    #[error("Queue error: {0}")]
    Queue(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Invalid status transition for record {id}: {from} -> {to}")]
    InvalidTransition {
        id: String,
        from: String,
        to: String,
    },

    #[error("User not found: {0}")]
    UserNotFound(String),

    #[error("Sender error: {0}")]
    Sender(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, GreeterError>;

/// Outcome of a failed `Sender::send` call.
///
/// Everything except `Permanent` feeds the retry path.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SendError {
    /// Timeouts, connection errors, 429 and 5xx responses.
    #[error("transient send failure: {0}")]
    Transient(String),

    /// 4xx responses and rejected payloads. Never retried.
    #[error("permanent send failure: {0}")]
    Permanent(String),

    #[error("send timed out after {0}s")]
    Timeout(u64),

    /// Rejected locally without a network call.
    #[error("circuit breaker open")]
    CircuitOpen,
}

impl SendError {
    pub fn is_retryable(&self) -> bool {
        !matches!(self, SendError::Permanent(_))
    }
}
