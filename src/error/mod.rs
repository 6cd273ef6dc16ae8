//! Error types for the taskforge orchestrator.
//!
//! Gate refusals are deliberately *not* errors: a refused submission is a
//! normal outcome reported through [`Submission`](crate::manager::Submission).
//! Likewise a failing subprocess is recorded on its
//! [`TaskRun`](crate::manager::TaskRun) and surfaced to observers rather
//! than propagated. The variants here cover the failures that callers can
//! actually act on.

use thiserror::Error;

/// Result type alias using the taskforge error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors produced by the orchestrator.
#[derive(Debug, Error)]
pub enum Error {
    /// Invalid or unloadable configuration. Fatal at startup.
    #[error("configuration error: {0}")]
    Config(String),

    /// A constant-expression field could not be evaluated, or the input
    /// was not a constant expression.
    #[error("expression error: {0}")]
    Expression(String),

    /// A task could not be invoked (unsupported type, empty or
    /// unspawnable command).
    #[error("task error: {0}")]
    Task(String),

    /// The worker executing a run panicked or was aborted before
    /// reaching its terminal state.
    #[error("worker failure: {0}")]
    Worker(String),

    /// Chat transport failure (network or protocol level).
    #[error("chat transport error: {0}")]
    ChatTransport(String),

    /// Stored credential could not be decoded.
    #[error("credential decode error: {0}")]
    Decode(String),

    /// I/O failure (config files, console streams).
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// JSON parse or serialize failure.
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Create a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Create an expression error.
    pub fn expression(message: impl Into<String>) -> Self {
        Self::Expression(message.into())
    }

    /// Create a task invocation error.
    pub fn task(message: impl Into<String>) -> Self {
        Self::Task(message.into())
    }

    /// Create a chat transport error.
    pub fn chat(message: impl Into<String>) -> Self {
        Self::ChatTransport(message.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::config("missing 'name' field");
        assert_eq!(
            err.to_string(),
            "configuration error: missing 'name' field"
        );

        let err = Error::expression("identifier 'os' is not a constant");
        assert!(err.to_string().starts_with("expression error:"));
    }

    #[test]
    fn test_io_error_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err: Error = io.into();
        assert!(matches!(err, Error::Io(_)));
    }
}
