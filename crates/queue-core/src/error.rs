//! Error types for the queue contract and its runtime.
//!
//! Splits framework-level failure (surfaced directly to the caller) from
//! retry classification (can this error be retried?). Storage backends
//! return [`QueueError`]; run functions return `anyhow::Error` and are
//! classified into [`ErrorCategory`] by the runtime via [`Categorizable`].

use thiserror::Error;

/// Errors a [`crate::storage::QueueStorage`] implementation can return.
/// Configuration-kind failures surface through these variants to the
/// caller of `add`/`get`/`peek`; they never reach a job's
/// `error`/`error_code` fields.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("job {0} not found")]
    NotFound(String),

    #[error("illegal status transition: {from} -> {to}")]
    IllegalTransition { from: String, to: String },

    #[error("prefix column mismatch: expected {expected:?}, got {actual:?}")]
    PrefixMismatch {
        expected: Vec<String>,
        actual: Vec<String>,
    },

    #[error("storage backend error: {0}")]
    Backend(#[source] anyhow::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("invalid configuration: {0}")]
    Configuration(String),
}

pub type QueueResult<T> = Result<T, QueueError>;

/// How the runtime should treat an error raised by a run function.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Fail the job immediately; no retry is attempted.
    Permanent,
    /// Retry with backoff, unless attempts are exhausted.
    Retryable,
}

/// Implemented by run-function errors so the runtime can decide retry
/// policy without string-matching on messages. A plain `anyhow::Error`
/// defaults to `Retryable`, treating unknown errors as safe-to-retry
/// rather than silently dropping work.
pub trait Categorizable {
    fn category(&self) -> ErrorCategory;

    /// An error can optionally demand a minimum backoff before its next
    /// attempt, overriding the runtime's own backoff schedule when larger.
    fn retry_after_ms(&self) -> Option<i64> {
        None
    }

    /// Stable error code to store in `Job::error_code`. Defaults to the
    /// category's reserved code string.
    fn error_code(&self) -> &'static str {
        match self.category() {
            ErrorCategory::Permanent => crate::job::error_codes::PERMANENT,
            ErrorCategory::Retryable => crate::job::error_codes::RETRYABLE,
        }
    }
}

/// A simple, explicit categorization a run function can return directly
/// instead of implementing [`Categorizable`] on a custom error type.
#[derive(Debug, Error)]
pub enum RunError {
    #[error("{message}")]
    Permanent { message: String },

    #[error("{message}")]
    Retryable {
        message: String,
        retry_after_ms: Option<i64>,
    },
}

impl RunError {
    pub fn permanent(message: impl Into<String>) -> Self {
        RunError::Permanent {
            message: message.into(),
        }
    }

    pub fn retryable(message: impl Into<String>) -> Self {
        RunError::Retryable {
            message: message.into(),
            retry_after_ms: None,
        }
    }

    pub fn retryable_after(message: impl Into<String>, retry_after_ms: i64) -> Self {
        RunError::Retryable {
            message: message.into(),
            retry_after_ms: Some(retry_after_ms),
        }
    }
}

impl Categorizable for RunError {
    fn category(&self) -> ErrorCategory {
        match self {
            RunError::Permanent { .. } => ErrorCategory::Permanent,
            RunError::Retryable { .. } => ErrorCategory::Retryable,
        }
    }

    fn retry_after_ms(&self) -> Option<i64> {
        match self {
            RunError::Permanent { .. } => None,
            RunError::Retryable { retry_after_ms, .. } => *retry_after_ms,
        }
    }
}

/// Classifies an opaque `anyhow::Error` raised by a run function. Looks for
/// a [`Categorizable`] `RunError` downcast first; anything else is treated
/// as a transient error and defaults to retryable.
pub fn classify(err: &anyhow::Error) -> (ErrorCategory, Option<i64>, &'static str) {
    if let Some(run_err) = err.downcast_ref::<RunError>() {
        (
            run_err.category(),
            run_err.retry_after_ms(),
            run_err.error_code(),
        )
    } else {
        (
            ErrorCategory::Retryable,
            None,
            crate::job::error_codes::RETRYABLE,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_error_permanent_classifies() {
        let err = anyhow::Error::new(RunError::permanent("bad input"));
        let (cat, retry_after, code) = classify(&err);
        assert_eq!(cat, ErrorCategory::Permanent);
        assert_eq!(retry_after, None);
        assert_eq!(code, "PERMANENT");
    }

    #[test]
    fn run_error_retryable_classifies_with_override() {
        let err = anyhow::Error::new(RunError::retryable_after("rate limited", 5_000));
        let (cat, retry_after, code) = classify(&err);
        assert_eq!(cat, ErrorCategory::Retryable);
        assert_eq!(retry_after, Some(5_000));
        assert_eq!(code, "RETRYABLE");
    }

    #[test]
    fn unclassified_error_defaults_to_retryable() {
        let err = anyhow::anyhow!("network blip");
        let (cat, retry_after, code) = classify(&err);
        assert_eq!(cat, ErrorCategory::Retryable);
        assert_eq!(retry_after, None);
        assert_eq!(code, "RETRYABLE");
    }
}
