//! Error types for the conduit client.
//!
//! Every layer gets a kind enum wrapped in a struct that records where the
//! error was raised. [`ConduitError`] unifies them so callers that drive both
//! the REST dispatcher and the gateway can use a single `?`.

#![warn(missing_docs)]

mod config;
mod gateway;
mod http;
mod rest;
mod retry;

pub use config::ConfigError;
pub use gateway::{GatewayError, GatewayErrorKind, GatewayResult};
pub use http::HttpError;
pub use rest::{QuotaScope, RestError, RestErrorKind, RestResult};
pub use retry::RetryableError;

/// Crate-level error variants.
#[derive(Debug, derive_more::From)]
pub enum ConduitErrorKind {
    /// Configuration error
    Config(ConfigError),
    /// HTTP transport error
    Http(HttpError),
    /// REST dispatcher error
    Rest(RestError),
    /// Gateway session error
    Gateway(GatewayError),
}

impl std::fmt::Display for ConduitErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConduitErrorKind::Config(e) => write!(f, "{}", e),
            ConduitErrorKind::Http(e) => write!(f, "{}", e),
            ConduitErrorKind::Rest(e) => write!(f, "{}", e),
            ConduitErrorKind::Gateway(e) => write!(f, "{}", e),
        }
    }
}

/// Conduit error with kind discrimination.
///
/// # Examples
///
/// ```
/// use conduit_error::{ConduitError, ConduitErrorKind, ConfigError};
///
/// let err: ConduitError = ConfigError::new("missing token").into();
/// assert!(matches!(err.kind(), ConduitErrorKind::Config(_)));
/// ```
#[derive(Debug)]
pub struct ConduitError(Box<ConduitErrorKind>);

impl ConduitError {
    /// Create a new error from a kind.
    pub fn new(kind: ConduitErrorKind) -> Self {
        Self(Box::new(kind))
    }

    /// Get the error kind.
    pub fn kind(&self) -> &ConduitErrorKind {
        &self.0
    }
}

impl std::fmt::Display for ConduitError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Conduit Error: {}", self.0)
    }
}

impl std::error::Error for ConduitError {}

// Generic From implementation for any type that converts to ConduitErrorKind
impl<T> From<T> for ConduitError
where
    T: Into<ConduitErrorKind>,
{
    fn from(err: T) -> Self {
        Self::new(err.into())
    }
}

/// Result type for conduit operations.
pub type ConduitResult<T> = std::result::Result<T, ConduitError>;
