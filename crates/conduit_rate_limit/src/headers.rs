//! Rate-limit response headers and 429 bodies.

use conduit_error::QuotaScope;
use derive_getters::Getters;
use serde::Deserialize;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// `X-RateLimit-Limit`
pub const LIMIT: &str = "x-ratelimit-limit";
/// `X-RateLimit-Remaining`
pub const REMAINING: &str = "x-ratelimit-remaining";
/// `X-RateLimit-Reset` (epoch seconds, fractional)
pub const RESET: &str = "x-ratelimit-reset";
/// `X-RateLimit-Reset-After` (seconds, fractional)
pub const RESET_AFTER: &str = "x-ratelimit-reset-after";
/// `X-RateLimit-Bucket`
pub const BUCKET: &str = "x-ratelimit-bucket";
/// `X-RateLimit-Global`
pub const GLOBAL: &str = "x-ratelimit-global";
/// `X-RateLimit-Scope`
pub const SCOPE: &str = "x-ratelimit-scope";
/// `Retry-After` (seconds)
pub const RETRY_AFTER: &str = "retry-after";

/// Scope reported by `X-RateLimit-Scope`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display, strum::EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum RateLimitScope {
    /// Per-route limit of this account
    User,
    /// Account-wide limit
    Global,
    /// Per-resource limit shared with other accounts
    Shared,
}

/// Rate-limit metadata parsed from one response.
#[derive(Debug, Clone, Default, PartialEq, Getters)]
pub struct RateLimitHeaders {
    /// Requests allowed per window
    limit: Option<u32>,
    /// Requests left in the window
    remaining: Option<u32>,
    /// Window end as fractional epoch seconds
    reset: Option<f64>,
    /// Time until the window ends
    reset_after: Option<Duration>,
    /// Server bucket hash
    bucket: Option<String>,
    /// Whether the response concerns the global limit
    global: bool,
    /// Limit scope, sent with 429s
    scope: Option<RateLimitScope>,
    /// `Retry-After` value
    retry_after: Option<Duration>,
}

impl RateLimitHeaders {
    /// Parse from `(name, value)` header pairs. Names are matched case-insensitively
    /// and malformed values are ignored.
    pub fn parse<'a, I>(headers: I) -> Self
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let mut parsed = Self::default();
        for (name, value) in headers {
            let value = value.trim();
            match name.to_ascii_lowercase().as_str() {
                LIMIT => parsed.limit = value.parse().ok(),
                REMAINING => parsed.remaining = value.parse().ok(),
                RESET => parsed.reset = value.parse().ok().filter(|v: &f64| v.is_finite()),
                RESET_AFTER => parsed.reset_after = parse_seconds(value),
                BUCKET if !value.is_empty() => parsed.bucket = Some(value.to_string()),
                GLOBAL => parsed.global = value.eq_ignore_ascii_case("true"),
                SCOPE => parsed.scope = value.parse().ok(),
                RETRY_AFTER => parsed.retry_after = parse_seconds(value),
                _ => {}
            }
        }
        parsed
    }

    /// Whether the response carried enough to describe a bucket window.
    pub fn has_limits(&self) -> bool {
        self.limit.is_some()
            && self.remaining.is_some()
            && (self.reset_after.is_some() || self.reset.is_some())
    }

    /// Whether the response carried no rate-limit metadata at all.
    pub fn is_empty(&self) -> bool {
        self.limit.is_none()
            && self.remaining.is_none()
            && self.reset.is_none()
            && self.reset_after.is_none()
            && self.bucket.is_none()
    }

    /// Time until the window ends, preferring `Reset-After` over the
    /// clock-dependent `Reset`.
    pub fn window_remaining(&self) -> Option<Duration> {
        if let Some(after) = self.reset_after {
            return Some(after);
        }
        let reset = self.reset?;
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs_f64())
            .unwrap_or(0.0);
        Duration::try_from_secs_f64((reset - now).max(0.0)).ok()
    }
}

fn parse_seconds(value: &str) -> Option<Duration> {
    let secs: f64 = value.parse().ok()?;
    if secs.is_finite() && secs >= 0.0 {
        Duration::try_from_secs_f64(secs).ok()
    } else {
        None
    }
}

/// JSON body of a 429 response.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RateLimitedBody {
    /// Human-readable message
    #[serde(default)]
    pub message: String,
    /// Seconds to wait
    pub retry_after: f64,
    /// Whether the global limit was hit
    #[serde(default)]
    pub global: bool,
    /// Platform error code, if any
    #[serde(default)]
    pub code: Option<u64>,
}

/// What a 429 asks the client to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Getters)]
pub struct RateLimitSignal {
    /// Which quota was exhausted
    scope: QuotaScope,
    /// How long to wait before retrying
    retry_after: Duration,
}

/// Fallback when a 429 carries no usable wait time.
pub const DEFAULT_RETRY_AFTER: Duration = Duration::from_secs(1);

impl RateLimitSignal {
    /// Classify a 429 response from its headers and body.
    ///
    /// The body's `retry_after` wins over `Retry-After`, which wins over the
    /// bucket window.
    pub fn from_response(headers: &RateLimitHeaders, body: &[u8]) -> Self {
        let body: Option<RateLimitedBody> = serde_json::from_slice(body).ok();

        let global = headers.global
            || headers.scope == Some(RateLimitScope::Global)
            || body.as_ref().is_some_and(|b| b.global);
        let scope = if global {
            QuotaScope::Global
        } else if headers.scope == Some(RateLimitScope::Shared) {
            QuotaScope::Shared
        } else {
            QuotaScope::Route
        };

        let retry_after = body
            .as_ref()
            .and_then(|b| {
                (b.retry_after.is_finite() && b.retry_after >= 0.0)
                    .then(|| Duration::try_from_secs_f64(b.retry_after).ok())
                    .flatten()
            })
            .or(headers.retry_after)
            .or(headers.reset_after)
            .unwrap_or(DEFAULT_RETRY_AFTER);

        Self { scope, retry_after }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_is_case_insensitive() {
        let headers = RateLimitHeaders::parse([
            ("X-RateLimit-Limit", "5"),
            ("X-RateLimit-Remaining", "4"),
            ("X-RateLimit-Reset-After", "1.250"),
            ("X-RateLimit-Bucket", "abcd1234"),
            ("Content-Type", "application/json"),
        ]);
        assert_eq!(*headers.limit(), Some(5));
        assert_eq!(*headers.remaining(), Some(4));
        assert_eq!(*headers.reset_after(), Some(Duration::from_millis(1250)));
        assert_eq!(headers.bucket().as_deref(), Some("abcd1234"));
        assert!(headers.has_limits());
        assert!(!headers.is_empty());
    }

    #[test]
    fn test_malformed_values_are_ignored() {
        let headers = RateLimitHeaders::parse([
            ("x-ratelimit-limit", "lots"),
            ("x-ratelimit-reset-after", "-3"),
            ("retry-after", "NaN"),
        ]);
        assert_eq!(*headers.limit(), None);
        assert_eq!(*headers.reset_after(), None);
        assert_eq!(*headers.retry_after(), None);
        assert!(headers.is_empty());
    }

    #[test]
    fn test_global_429_from_body() {
        let headers = RateLimitHeaders::parse([("retry-after", "3")]);
        let body = br#"{"message":"You are being rate limited.","retry_after":0.5,"global":true}"#;
        let signal = RateLimitSignal::from_response(&headers, body);
        assert_eq!(*signal.scope(), QuotaScope::Global);
        assert_eq!(*signal.retry_after(), Duration::from_millis(500));
    }

    #[test]
    fn test_shared_scope_from_header() {
        let headers = RateLimitHeaders::parse([
            ("x-ratelimit-scope", "shared"),
            ("retry-after", "2"),
        ]);
        let signal = RateLimitSignal::from_response(&headers, b"not json");
        assert_eq!(*signal.scope(), QuotaScope::Shared);
        assert_eq!(*signal.retry_after(), Duration::from_secs(2));
    }

    #[test]
    fn test_missing_wait_time_falls_back() {
        let signal = RateLimitSignal::from_response(&RateLimitHeaders::default(), b"");
        assert_eq!(*signal.scope(), QuotaScope::Route);
        assert_eq!(*signal.retry_after(), DEFAULT_RETRY_AFTER);
    }
}
