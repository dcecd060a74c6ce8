//! Retry classification shared by REST and gateway errors.

/// Trait for errors that support retry logic.
///
/// This trait allows error types to specify whether they should trigger a retry
/// and what retry strategy parameters to use.
///
/// # Examples
///
/// ```
/// use conduit_error::{RestError, RestErrorKind, RetryableError};
///
/// let err = RestError::new(RestErrorKind::TransportFailure("connection reset".into()));
/// assert!(err.is_retryable());
///
/// let err = RestError::new(RestErrorKind::RemoteRejected {
///     status: 403,
///     code: Some(50013),
///     message: "Missing Permissions".into(),
///     errors: None,
/// });
/// assert!(!err.is_retryable());
/// ```
pub trait RetryableError {
    /// Returns true if this error should trigger a retry.
    ///
    /// Transient errors (transport failures, 5xx, local timeouts) return true.
    /// Authoritative rejections from the server return false.
    fn is_retryable(&self) -> bool;

    /// Get retry strategy parameters for this error.
    ///
    /// Returns `(initial_backoff_ms, max_retries, max_delay_secs)`.
    fn retry_strategy_params(&self) -> (u64, usize, u64) {
        (1000, 3, 60)
    }
}
