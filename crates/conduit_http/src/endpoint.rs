//! Typed request descriptions consumed by the dispatcher.

use conduit_error::{RestError, RestErrorKind, RestResult};
use conduit_rate_limit::Route;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::marker::PhantomData;

/// A typed REST call.
///
/// Implementors describe where the request goes and how its response decodes;
/// the dispatcher handles authentication, rate limits and retries.
pub trait Endpoint: Send + Sync {
    /// Shape of a successful response body. Use `()` for empty responses.
    type Response: DeserializeOwned + Send;

    /// Method, path template and bound parameters.
    fn route(&self) -> Route;

    /// Serialised JSON body, if any.
    fn body(&self) -> RestResult<Option<Vec<u8>>> {
        Ok(None)
    }

    /// Reason recorded in the guild audit log.
    fn audit_log_reason(&self) -> Option<&str> {
        None
    }
}

/// Serialise a value as a JSON request body.
///
/// # Errors
///
/// Returns `InvalidRequest` if serialisation fails.
pub fn json_body<T: Serialize + ?Sized>(value: &T) -> RestResult<Option<Vec<u8>>> {
    serde_json::to_vec(value)
        .map(Some)
        .map_err(|e| RestError::new(RestErrorKind::InvalidRequest(format!("Body serialisation failed: {}", e))))
}

/// Ad hoc endpoint for routes without a dedicated type.
///
/// # Examples
///
/// ```
/// use conduit_http::{Endpoint, Request};
/// use conduit_rate_limit::{Method, Route};
///
/// let request: Request<serde_json::Value> = Request::new(
///     Route::new(Method::Post, "/channels/{channel_id}/messages").param("channel_id", 1),
/// )
/// .json(serde_json::json!({ "content": "hello" }))
/// .reason("greeting");
///
/// assert!(request.body().unwrap().is_some());
/// assert_eq!(request.audit_log_reason(), Some("greeting"));
/// ```
#[derive(Debug, Clone)]
pub struct Request<R> {
    route: Route,
    body: Option<serde_json::Value>,
    reason: Option<String>,
    response: PhantomData<fn() -> R>,
}

impl<R> Request<R> {
    /// A request with no body.
    pub fn new(route: Route) -> Self {
        Self {
            route,
            body: None,
            reason: None,
            response: PhantomData,
        }
    }

    /// Attach a JSON body.
    pub fn json(mut self, body: serde_json::Value) -> Self {
        self.body = Some(body);
        self
    }

    /// Attach an audit log reason.
    pub fn reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }
}

impl<R> Endpoint for Request<R>
where
    R: DeserializeOwned + Send,
{
    type Response = R;

    fn route(&self) -> Route {
        self.route.clone()
    }

    fn body(&self) -> RestResult<Option<Vec<u8>>> {
        match &self.body {
            Some(body) => json_body(body),
            None => Ok(None),
        }
    }

    fn audit_log_reason(&self) -> Option<&str> {
        self.reason.as_deref()
    }
}
