//! HTTP transport seam.

use async_trait::async_trait;
use conduit_error::HttpError;
use conduit_rate_limit::{Method, RateLimitHeaders};
use derive_getters::Getters;
use std::time::Duration;
use tracing::instrument;

/// A fully built outbound request.
#[derive(Debug, Clone, PartialEq, Eq, Getters, derive_builder::Builder)]
#[builder(setter(into))]
pub struct HttpRequest {
    /// HTTP method
    method: Method,
    /// Absolute URL
    url: String,
    /// Header pairs
    #[builder(default)]
    headers: Vec<(String, String)>,
    /// Serialised body
    #[builder(default)]
    body: Option<Vec<u8>>,
}

impl HttpRequest {
    /// Creates a builder for HttpRequest.
    pub fn builder() -> HttpRequestBuilder {
        HttpRequestBuilder::default()
    }

    /// Look up a header case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        find_header(&self.headers, name)
    }
}

/// A response as seen by the dispatcher.
#[derive(Debug, Clone, PartialEq, Eq, Getters)]
pub struct HttpResponse {
    /// Status code
    status: u16,
    /// Header pairs
    headers: Vec<(String, String)>,
    /// Raw body
    body: Vec<u8>,
}

impl HttpResponse {
    /// Assemble a response.
    pub fn new(status: u16, headers: Vec<(String, String)>, body: impl Into<Vec<u8>>) -> Self {
        Self {
            status,
            headers,
            body: body.into(),
        }
    }

    /// Look up a header case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        find_header(&self.headers, name)
    }

    /// Parse the rate-limit headers.
    pub fn rate_limit_headers(&self) -> RateLimitHeaders {
        RateLimitHeaders::parse(self.headers.iter().map(|(k, v)| (k.as_str(), v.as_str())))
    }
}

fn find_header<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}

/// Performs one HTTP exchange. Implementations never retry.
#[async_trait]
pub trait HttpTransport: Send + Sync + std::fmt::Debug {
    /// Send the request and return whatever the server answered.
    ///
    /// # Errors
    ///
    /// Returns error only when no response was received.
    async fn execute(&self, request: HttpRequest) -> Result<HttpResponse, HttpError>;
}

/// [`HttpTransport`] backed by reqwest.
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    /// Build a client with a per-exchange timeout.
    ///
    /// # Errors
    ///
    /// Returns error if the TLS backend cannot be initialised.
    pub fn new(timeout: Duration) -> Result<Self, HttpError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| HttpError::new(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self { client })
    }

    /// Wrap an existing client.
    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

fn reqwest_method(method: Method) -> reqwest::Method {
    match method {
        Method::Get => reqwest::Method::GET,
        Method::Post => reqwest::Method::POST,
        Method::Put => reqwest::Method::PUT,
        Method::Patch => reqwest::Method::PATCH,
        Method::Delete => reqwest::Method::DELETE,
    }
}

fn transport_error(e: reqwest::Error) -> HttpError {
    if e.is_timeout() {
        HttpError::timeout(format!("Request timed out: {}", e))
    } else {
        HttpError::new(format!("Request failed: {}", e))
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    #[instrument(skip(self, request), fields(method = %request.method, url = %request.url))]
    async fn execute(&self, request: HttpRequest) -> Result<HttpResponse, HttpError> {
        let HttpRequest {
            method,
            url,
            headers,
            body,
        } = request;

        let mut builder = self.client.request(reqwest_method(method), &url);
        for (name, value) in &headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(body) = body {
            builder = builder.body(body);
        }

        let response = builder.send().await.map_err(transport_error)?;
        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect();
        let body = response.bytes().await.map_err(transport_error)?;

        Ok(HttpResponse::new(status, headers, body.to_vec()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_requires_method_and_url() {
        assert!(HttpRequest::builder().url("https://example.invalid").build().is_err());
        let request = HttpRequest::builder()
            .method(Method::Get)
            .url("https://example.invalid/gateway/bot")
            .headers(vec![("User-Agent".to_string(), "test".to_string())])
            .build()
            .expect("complete request");
        assert_eq!(request.header("user-agent"), Some("test"));
        assert_eq!(*request.body(), None);
    }

    #[test]
    fn test_response_exposes_rate_limit_headers() {
        let response = HttpResponse::new(
            200,
            vec![
                ("X-RateLimit-Limit".to_string(), "5".to_string()),
                ("X-RateLimit-Remaining".to_string(), "1".to_string()),
            ],
            b"{}".to_vec(),
        );
        let headers = response.rate_limit_headers();
        assert_eq!(*headers.limit(), Some(5));
        assert_eq!(*headers.remaining(), Some(1));
    }
}
