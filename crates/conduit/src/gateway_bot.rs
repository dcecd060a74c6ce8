//! `GET /gateway/bot`: shard count and identify budget for the account.

use conduit_http::Endpoint;
use conduit_rate_limit::{Method, Route};
use serde::Deserialize;

/// Identify budget reported by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct SessionStartLimit {
    /// Session starts allowed per reset period
    pub total: u32,
    /// Session starts left
    pub remaining: u32,
    /// Milliseconds until `remaining` resets
    pub reset_after: u64,
    /// Identifies allowed per 5 seconds
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: u32,
}

fn default_max_concurrency() -> u32 {
    1
}

/// Response of `GET /gateway/bot`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct GatewayBot {
    /// Gateway URL to connect to
    pub url: String,
    /// Recommended shard count
    pub shards: u32,
    /// Identify budget
    pub session_start_limit: SessionStartLimit,
}

/// Request for [`GatewayBot`].
#[derive(Debug, Clone, Copy, Default)]
pub struct GetGatewayBot;

impl Endpoint for GetGatewayBot {
    type Response = GatewayBot;

    fn route(&self) -> Route {
        Route::new(Method::Get, "/gateway/bot")
    }
}
