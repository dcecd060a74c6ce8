//! Scripted in-memory HTTP transport.

#![allow(dead_code)]

use async_trait::async_trait;
use conduit_core::{Credentials, RestConfig};
use conduit_error::HttpError;
use conduit_http::{Dispatcher, HttpRequest, HttpResponse, HttpTransport};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

type Responder = Box<dyn Fn(&HttpRequest) -> Result<HttpResponse, HttpError> + Send + Sync>;

/// Transport that answers from a script, or from a responder once the script runs out.
pub struct MockTransport {
    script: Mutex<VecDeque<Result<HttpResponse, HttpError>>>,
    fallback: Responder,
    latency: Duration,
    requests: Mutex<Vec<HttpRequest>>,
    in_flight: AtomicU32,
    peak_in_flight: AtomicU32,
}

impl std::fmt::Debug for MockTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockTransport")
            .field("remaining_script", &self.script.lock().len())
            .finish()
    }
}

impl MockTransport {
    pub fn scripted(responses: Vec<Result<HttpResponse, HttpError>>) -> Self {
        Self::with_responder(|_| Ok(json(200, "{}")))
            .script(responses)
    }

    pub fn with_responder<F>(responder: F) -> Self
    where
        F: Fn(&HttpRequest) -> Result<HttpResponse, HttpError> + Send + Sync + 'static,
    {
        Self {
            script: Mutex::new(VecDeque::new()),
            fallback: Box::new(responder),
            latency: Duration::ZERO,
            requests: Mutex::new(Vec::new()),
            in_flight: AtomicU32::new(0),
            peak_in_flight: AtomicU32::new(0),
        }
    }

    pub fn script(self, responses: Vec<Result<HttpResponse, HttpError>>) -> Self {
        *self.script.lock() = responses.into();
        self
    }

    pub fn latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn requests(&self) -> Vec<HttpRequest> {
        self.requests.lock().clone()
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().len()
    }

    pub fn peak_in_flight(&self) -> u32 {
        self.peak_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl HttpTransport for MockTransport {
    async fn execute(&self, request: HttpRequest) -> Result<HttpResponse, HttpError> {
        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(current, Ordering::SeqCst);
        self.requests.lock().push(request.clone());

        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        let scripted = self.script.lock().pop_front();
        let result = match scripted {
            Some(result) => result,
            None => (self.fallback)(&request),
        };
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

pub fn json(status: u16, body: &str) -> HttpResponse {
    HttpResponse::new(status, Vec::new(), body.as_bytes().to_vec())
}

pub fn with_headers(status: u16, headers: &[(&str, &str)], body: &str) -> HttpResponse {
    HttpResponse::new(
        status,
        headers
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect(),
        body.as_bytes().to_vec(),
    )
}

pub fn bucket_headers<'a>(
    hash: &'a str,
    limit: &'a str,
    remaining: &'a str,
    reset_after: &'a str,
) -> Vec<(&'a str, &'a str)> {
    vec![
        ("X-RateLimit-Bucket", hash),
        ("X-RateLimit-Limit", limit),
        ("X-RateLimit-Remaining", remaining),
        ("X-RateLimit-Reset-After", reset_after),
    ]
}

pub fn test_config() -> RestConfig {
    RestConfig {
        api_base: "https://api.test/v10".to_string(),
        max_retries: 2,
        retry_base_delay_ms: 100,
        retry_max_delay_ms: 1_000,
        max_rate_limit_retries: 2,
        ..RestConfig::default()
    }
}

pub fn dispatcher(config: RestConfig, transport: Arc<MockTransport>) -> Dispatcher {
    Dispatcher::with_transport(config, &Credentials::new("test-token", 0), transport)
}
