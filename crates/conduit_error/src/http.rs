//! HTTP transport error types.

/// Transport-level HTTP failure (connection refused, TLS, body read) with source location.
///
/// This never carries a server response; anything the server answered is a
/// [`RestError`](crate::RestError) instead.
#[derive(Debug, Clone, PartialEq, Eq, derive_more::Display, derive_more::Error)]
#[display("HTTP Error: {} at line {} in {}", message, line, file)]
pub struct HttpError {
    /// The underlying error message
    pub message: String,
    /// Whether the transport gave up because its own timeout elapsed
    pub timed_out: bool,
    /// Line number where the error occurred
    pub line: u32,
    /// File where the error occurred
    pub file: &'static str,
}

impl HttpError {
    /// Create a new HttpError with the given message at the current location.
    ///
    /// # Examples
    ///
    /// ```
    /// use conduit_error::HttpError;
    ///
    /// let err = HttpError::new("Connection refused");
    /// assert!(err.message.contains("Connection refused"));
    /// assert!(!err.timed_out);
    /// ```
    #[track_caller]
    pub fn new(message: impl Into<String>) -> Self {
        let location = std::panic::Location::caller();
        Self {
            message: message.into(),
            timed_out: false,
            line: location.line(),
            file: location.file(),
        }
    }

    /// Create an HttpError for a transport-side timeout.
    #[track_caller]
    pub fn timeout(message: impl Into<String>) -> Self {
        let location = std::panic::Location::caller();
        Self {
            message: message.into(),
            timed_out: true,
            line: location.line(),
            file: location.file(),
        }
    }
}
