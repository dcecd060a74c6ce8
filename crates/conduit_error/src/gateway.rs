//! Gateway (streaming session) error types.

use crate::RetryableError;

/// Gateway error conditions.
#[derive(Debug, Clone, PartialEq, Eq, Hash, derive_more::Display)]
pub enum GatewayErrorKind {
    /// `connect` was called on a session that is already running.
    #[display("Session is already connected")]
    AlreadyConnected,
    /// The operation needs a live session and there is none.
    #[display("Session is not connected")]
    NotConnected,
    /// A lifecycle operation did not finish before its deadline.
    #[display("Deadline exceeded")]
    DeadlineExceeded,
    /// WebSocket read/write or connect failure.
    #[display("Transport failure: {_0}")]
    Transport(String),
    /// A frame could not be decompressed or decoded.
    #[display("Frame decode failed: {_0}")]
    Decode(String),
    /// The server closed the connection with a recoverable close code.
    #[display("Connection closed ({code}): {reason}")]
    Closed {
        /// WebSocket close code
        code: u16,
        /// Close reason sent by the server
        reason: String,
    },
    /// The server closed the connection with a code that forbids reconnecting.
    #[display("Fatal close ({code}): {reason}")]
    Fatal {
        /// WebSocket close code
        code: u16,
        /// Close reason sent by the server
        reason: String,
    },
    /// The server invalidated the session.
    #[display("Session invalidated (resumable: {resumable})")]
    SessionInvalidated {
        /// Whether the server allows resuming
        resumable: bool,
    },
    /// The session is shutting down at the caller's request.
    #[display("Session shut down")]
    Shutdown,
    /// A shard manager was asked for zero shards.
    #[display("Shard count must be at least 1, got {_0}")]
    InvalidShardCount(u32),
}

impl GatewayErrorKind {
    /// Check if reconnecting after this error can succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            GatewayErrorKind::DeadlineExceeded
                | GatewayErrorKind::Transport(_)
                | GatewayErrorKind::Decode(_)
                | GatewayErrorKind::Closed { .. }
                | GatewayErrorKind::SessionInvalidated { .. }
        )
    }
}

/// Gateway error with source location tracking.
///
/// # Examples
///
/// ```
/// use conduit_error::{GatewayError, GatewayErrorKind};
///
/// let err = GatewayError::new(GatewayErrorKind::AlreadyConnected);
/// assert!(format!("{}", err).contains("already connected"));
/// ```
#[derive(Debug, Clone, derive_more::Display, derive_more::Error)]
#[display("Gateway Error: {} at line {} in {}", kind, line, file)]
pub struct GatewayError {
    /// The kind of error that occurred
    pub kind: GatewayErrorKind,
    /// Line number where error was created
    pub line: u32,
    /// File where error was created
    pub file: &'static str,
}

impl GatewayError {
    /// Create a new GatewayError with automatic location tracking.
    #[track_caller]
    pub fn new(kind: GatewayErrorKind) -> Self {
        let location = std::panic::Location::caller();
        Self {
            kind,
            line: location.line(),
            file: location.file(),
        }
    }

    /// Get the error kind.
    pub fn kind(&self) -> &GatewayErrorKind {
        &self.kind
    }
}

impl RetryableError for GatewayError {
    fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }

    fn retry_strategy_params(&self) -> (u64, usize, u64) {
        match self.kind {
            GatewayErrorKind::SessionInvalidated { .. } => (1000, 5, 5),
            GatewayErrorKind::Transport(_) | GatewayErrorKind::Closed { .. } => (1000, 10, 60),
            _ => (2000, 5, 60),
        }
    }
}

/// Result type for gateway operations.
pub type GatewayResult<T> = Result<T, GatewayError>;
