//! REST dispatcher error types.

use crate::RetryableError;
use std::time::Duration;

/// Which quota a 429 response exhausted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, derive_more::Display)]
pub enum QuotaScope {
    /// The account-wide request budget.
    #[display("global")]
    Global,
    /// A single route bucket.
    #[display("route")]
    Route,
    /// A resource-wide limit shared with other accounts.
    #[display("shared")]
    Shared,
}

/// REST error conditions.
#[derive(Debug, Clone, PartialEq, Eq, Hash, derive_more::Display)]
pub enum RestErrorKind {
    /// The caller's deadline elapsed before a response arrived.
    #[display("Deadline exceeded")]
    DeadlineExceeded,
    /// The server kept answering 429 past the configured bound.
    #[display("Quota exceeded ({scope}), retry after {retry_after:?}")]
    QuotaExceeded {
        /// Which quota was exhausted
        scope: QuotaScope,
        /// Last retry-after the server signalled
        retry_after: Duration,
    },
    /// The server rejected the request with a non-429 4xx status.
    #[display("HTTP {status} rejected: {message}")]
    RemoteRejected {
        /// HTTP status code
        status: u16,
        /// Platform error code from the JSON body, if any
        code: Option<u64>,
        /// Error message from the JSON body, or the raw body
        message: String,
        /// Field-level validation errors from the JSON body, rendered as JSON
        errors: Option<String>,
    },
    /// Network/connection error or 5xx, after exhausting retries.
    #[display("Transport failure: {_0}")]
    TransportFailure(String),
    /// A 2xx body that did not match the expected response shape.
    #[display("Response decode failed: {_0}")]
    Decode(String),
    /// The request could not be built (bad path parameters, body serialisation).
    #[display("Invalid request: {_0}")]
    InvalidRequest(String),
}

impl RestErrorKind {
    /// Check if this error type should be retried by the caller.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RestErrorKind::DeadlineExceeded
                | RestErrorKind::QuotaExceeded { .. }
                | RestErrorKind::TransportFailure(_)
        )
    }
}

/// REST error with source location tracking.
///
/// # Examples
///
/// ```
/// use conduit_error::{RestError, RestErrorKind};
///
/// let err = RestError::new(RestErrorKind::DeadlineExceeded);
/// assert!(format!("{}", err).contains("Deadline exceeded"));
/// ```
#[derive(Debug, Clone, derive_more::Display, derive_more::Error)]
#[display("REST Error: {} at line {} in {}", kind, line, file)]
pub struct RestError {
    /// The kind of error that occurred
    pub kind: RestErrorKind,
    /// Line number where error was created
    pub line: u32,
    /// File where error was created
    pub file: &'static str,
}

impl RestError {
    /// Create a new RestError with automatic location tracking.
    #[track_caller]
    pub fn new(kind: RestErrorKind) -> Self {
        let location = std::panic::Location::caller();
        Self {
            kind,
            line: location.line(),
            file: location.file(),
        }
    }

    /// Get the error kind.
    pub fn kind(&self) -> &RestErrorKind {
        &self.kind
    }
}

impl RetryableError for RestError {
    fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }

    fn retry_strategy_params(&self) -> (u64, usize, u64) {
        match &self.kind {
            RestErrorKind::QuotaExceeded { retry_after, .. } => {
                (retry_after.as_millis() as u64, 1, retry_after.as_secs().max(1))
            }
            RestErrorKind::DeadlineExceeded => (500, 3, 10),
            _ => (1000, 3, 30),
        }
    }
}

/// Result type for REST operations.
pub type RestResult<T> = Result<T, RestError>;
