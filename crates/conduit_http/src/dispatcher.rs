//! The rate-limited dispatcher every REST call passes through.
//!
//! Each attempt takes the Global Bucket, then the route's bucket, performs the
//! exchange, and feeds the response headers back into the registry. 429s are
//! absorbed by waiting out the server's retry-after; 5xx and transport
//! failures are retried with backoff; other 4xx are returned as-is.

use crate::{Endpoint, HttpRequest, HttpResponse, HttpTransport, ReqwestTransport};
use conduit_core::{Credentials, RestConfig, record_rate_limited, record_rest_response};
use conduit_error::{QuotaScope, RestError, RestErrorKind, RestResult};
use conduit_rate_limit::{
    Backoff, BucketPermit, BucketRegistry, RateLimitSignal, Route, RouteIdentity,
};
use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, utf8_percent_encode};
use serde::Deserialize;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, instrument, warn};

/// Error body returned with non-2xx responses.
#[derive(Debug, Default, Deserialize)]
struct ApiErrorBody {
    #[serde(default)]
    code: Option<u64>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    errors: Option<serde_json::Value>,
}

#[derive(Debug)]
struct DispatcherInner {
    transport: Arc<dyn HttpTransport>,
    registry: BucketRegistry,
    config: RestConfig,
    authorization: String,
}

/// Concurrency-safe REST gate. Cheap to clone; clones share buckets.
#[derive(Debug, Clone)]
pub struct Dispatcher {
    inner: Arc<DispatcherInner>,
}

impl Dispatcher {
    /// Create a dispatcher backed by reqwest.
    ///
    /// # Errors
    ///
    /// Returns `TransportFailure` if the HTTP client cannot be built.
    pub fn new(config: RestConfig, credentials: &Credentials) -> RestResult<Self> {
        let transport = ReqwestTransport::new(config.request_timeout())
            .map_err(|e| RestError::new(RestErrorKind::TransportFailure(e.message)))?;
        Ok(Self::with_transport(config, credentials, Arc::new(transport)))
    }

    /// Create a dispatcher over any transport.
    pub fn with_transport(
        config: RestConfig,
        credentials: &Credentials,
        transport: Arc<dyn HttpTransport>,
    ) -> Self {
        Self {
            inner: Arc::new(DispatcherInner {
                transport,
                registry: BucketRegistry::from_config(&config),
                authorization: credentials.authorization(),
                config,
            }),
        }
    }

    /// The bucket registry shared by all clones.
    pub fn registry(&self) -> &BucketRegistry {
        &self.inner.registry
    }

    /// Dispatcher configuration.
    pub fn config(&self) -> &RestConfig {
        &self.inner.config
    }

    /// Send with the configured request timeout as the deadline.
    ///
    /// # Errors
    ///
    /// See [`send_with_deadline`](Self::send_with_deadline).
    pub async fn send<E: Endpoint>(&self, endpoint: &E) -> RestResult<E::Response> {
        let deadline = Instant::now() + self.inner.config.request_timeout();
        self.send_with_deadline(endpoint, deadline).await
    }

    /// Send, giving up at `deadline`.
    ///
    /// Waiting on buckets, retry-after and backoff all count against the
    /// deadline. Dropping the future cancels the call.
    ///
    /// # Errors
    ///
    /// - `DeadlineExceeded` if the deadline passes first
    /// - `QuotaExceeded` after more than `max_rate_limit_retries` 429s
    /// - `TransportFailure` after more than `max_retries` 5xx/transport failures
    /// - `RemoteRejected` on any other 4xx
    /// - `Decode` if a 2xx body does not match `E::Response`
    /// - `InvalidRequest` if the route or body cannot be built
    pub async fn send_with_deadline<E: Endpoint>(
        &self,
        endpoint: &E,
        deadline: Instant,
    ) -> RestResult<E::Response> {
        match tokio::time::timeout_at(deadline, self.execute(endpoint)).await {
            Ok(result) => result,
            Err(_) => Err(RestError::new(RestErrorKind::DeadlineExceeded)),
        }
    }

    fn build_request<E: Endpoint>(&self, endpoint: &E, route: &Route) -> RestResult<HttpRequest> {
        let config = &self.inner.config;
        let url = format!("{}{}", config.api_base.trim_end_matches('/'), route.path()?);
        let body = endpoint.body()?;

        let mut headers = vec![
            ("Authorization".to_string(), self.inner.authorization.clone()),
            ("User-Agent".to_string(), config.user_agent.clone()),
        ];
        if body.is_some() {
            headers.push(("Content-Type".to_string(), "application/json".to_string()));
        }
        if let Some(reason) = endpoint.audit_log_reason() {
            headers.push(("X-Audit-Log-Reason".to_string(), percent_encode(reason)));
        }

        HttpRequest::builder()
            .method(*route.method())
            .url(url)
            .headers(headers)
            .body(body)
            .build()
            .map_err(|e| RestError::new(RestErrorKind::InvalidRequest(e.to_string())))
    }

    /// Take the route's bucket, re-resolving if the route migrated while we waited.
    async fn reserve_route(&self, route: &RouteIdentity) -> BucketPermit {
        let registry = &self.inner.registry;
        loop {
            let permit = registry.resolve(route).acquire().await;
            if registry.is_current(route, permit.bucket()) {
                return permit;
            }
            debug!(route = %route.route_template(), "Bucket changed while waiting, re-resolving");
            permit.refund();
        }
    }

    #[instrument(skip(self, endpoint), fields(route = tracing::field::Empty))]
    async fn execute<E: Endpoint>(&self, endpoint: &E) -> RestResult<E::Response> {
        let route = endpoint.route();
        let identity = route.identity();
        tracing::Span::current().record("route", identity.route_template().as_str());
        let request = self.build_request(endpoint, &route)?;

        let config = &self.inner.config;
        let registry = &self.inner.registry;
        let mut backoff = Backoff::new(config.retry_base_delay(), config.retry_max_delay())
            .with_jitter(true);
        let mut failures = 0u32;
        let mut rate_limited = 0u32;

        loop {
            registry.global().acquire().await.settle();
            let permit = self.reserve_route(&identity).await;
            debug!(bucket = %permit.bucket().id(), "Dispatching request");

            let result = self.inner.transport.execute(request.clone()).await;
            let now = Instant::now();

            let response = match result {
                Ok(response) => response,
                Err(e) => {
                    drop(permit);
                    failures += 1;
                    if failures > config.max_retries {
                        return Err(RestError::new(RestErrorKind::TransportFailure(e.message)));
                    }
                    let delay = backoff.next_delay();
                    warn!(attempt = failures, ?delay, error = %e.message, "Transport failure, retrying");
                    tokio::time::sleep(delay).await;
                    continue;
                }
            };

            let status = *response.status();
            record_rest_response(identity.route_template(), status);
            let headers = response.rate_limit_headers();
            if status < 500 && (status != 429 || !headers.is_empty()) {
                registry.observe(&identity, &headers, now);
            }
            permit.settle();

            match status {
                200..=299 => return decode_success::<E::Response>(&response),
                429 => {
                    let signal = RateLimitSignal::from_response(&headers, response.body());
                    rate_limited += 1;
                    record_rate_limited(identity.route_template(), &signal.scope().to_string());
                    if rate_limited > config.max_rate_limit_retries {
                        return Err(RestError::new(RestErrorKind::QuotaExceeded {
                            scope: *signal.scope(),
                            retry_after: *signal.retry_after(),
                        }));
                    }
                    warn!(
                        scope = %signal.scope(),
                        retry_after = ?signal.retry_after(),
                        attempt = rate_limited,
                        "Rate limited, waiting before retry"
                    );
                    let until = now + *signal.retry_after();
                    match signal.scope() {
                        QuotaScope::Global => registry.global().block_until(until),
                        QuotaScope::Route => registry.resolve(&identity).block_until(until),
                        QuotaScope::Shared => tokio::time::sleep_until(until).await,
                    }
                }
                500..=599 => {
                    failures += 1;
                    if failures > config.max_retries {
                        return Err(RestError::new(RestErrorKind::TransportFailure(format!(
                            "Server error {} after {} attempts",
                            status, failures
                        ))));
                    }
                    let delay = backoff.next_delay();
                    warn!(status, attempt = failures, ?delay, "Server error, retrying");
                    tokio::time::sleep(delay).await;
                }
                _ => return Err(rejected(&response)),
            }
        }
    }
}

fn decode_success<T: serde::de::DeserializeOwned>(response: &HttpResponse) -> RestResult<T> {
    let body: &[u8] = if response.body().iter().all(u8::is_ascii_whitespace) {
        b"null"
    } else {
        response.body()
    };
    serde_json::from_slice(body).map_err(|e| RestError::new(RestErrorKind::Decode(e.to_string())))
}

fn rejected(response: &HttpResponse) -> RestError {
    let status = *response.status();
    let parsed: ApiErrorBody = serde_json::from_slice(response.body()).unwrap_or_default();
    let message = parsed.message.unwrap_or_else(|| {
        let raw = String::from_utf8_lossy(response.body()).trim().to_string();
        if raw.is_empty() {
            format!("HTTP {}", status)
        } else {
            raw
        }
    });
    warn!(status, code = ?parsed.code, %message, "Request rejected");
    RestError::new(RestErrorKind::RemoteRejected {
        status,
        code: parsed.code,
        message,
        errors: parsed.errors.map(|e| e.to_string()),
    })
}

/// Everything outside the RFC 3986 unreserved set.
const AUDIT_REASON: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

fn percent_encode(value: &str) -> String {
    utf8_percent_encode(value, AUDIT_REASON).to_string()
}
