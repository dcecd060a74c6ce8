//! Discord-style bot client: a rate-limited REST dispatcher plus sharded,
//! resumable gateway sessions.
//!
//! ```no_run
//! use conduit::{Client, ConduitConfig, Credentials, intents};
//!
//! # async fn run() -> conduit::ConduitResult<()> {
//! conduit::init_tracing(conduit::LogFormat::Pretty)?;
//! let config = ConduitConfig::load()?;
//! let credentials = Credentials::from_env("DISCORD_TOKEN", intents::GUILD_MESSAGES)?;
//! let client = Client::new(config, credentials).await?;
//!
//! client.on_event("MESSAGE_CREATE", |event| async move {
//!     tracing::info!(shard = *event.shard(), "message");
//! });
//! client.start().await?;
//! tokio::signal::ctrl_c().await.ok();
//! client.shutdown().await?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]

mod client;
mod gateway_bot;

pub use client::Client;
pub use gateway_bot::{GatewayBot, GetGatewayBot, SessionStartLimit};

pub use conduit_core::{
    Compression, ConduitConfig, Credentials, GatewayConfig, LogFormat, RestConfig, init_metrics,
    init_tracing, intents,
};
pub use conduit_error::{
    ConduitError, ConduitErrorKind, ConduitResult, GatewayError, GatewayErrorKind, RestError,
    RestErrorKind,
};
pub use conduit_gateway::{
    Command, EventRegistry, GatewayEvent, HandlerId, LifecycleEvent, SessionPhase, ShardInfo,
    ShardManager, StreamingSession,
};
pub use conduit_http::{Dispatcher, Endpoint, Request};
pub use conduit_rate_limit::{Method, Route};

pub use conduit_gateway as gateway;
pub use conduit_http as http;
pub use conduit_rate_limit as rate_limit;
