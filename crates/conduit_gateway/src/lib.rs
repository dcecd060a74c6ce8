//! Gateway sessions for the conduit client.
//!
//! A [`StreamingSession`] holds one WebSocket connection to the gateway:
//! it identifies or resumes, keeps the heartbeat going, reconnects on
//! failure and publishes dispatched events to an [`EventRegistry`].
//! [`ShardManager`] runs one session per shard.
//!
//! # Example
//!
//! ```no_run
//! use conduit_core::{Credentials, GatewayConfig, intents};
//! use conduit_gateway::{StreamingSession, TungsteniteConnector};
//! use std::sync::Arc;
//!
//! # async fn run() -> conduit_error::GatewayResult<()> {
//! let session = StreamingSession::new(GatewayConfig::default(), Arc::new(TungsteniteConnector));
//! session.on_event("MESSAGE_CREATE", |event| async move {
//!     println!("{:?}", event.data());
//! });
//! session
//!     .connect(&Credentials::new("token", intents::GUILD_MESSAGES))
//!     .await?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]

pub mod close_code;
mod codec;
mod events;
mod heartbeat;
mod payload;
mod ratelimit;
mod session;
mod shard;
mod transport;

pub use close_code::CloseAction;
pub use codec::{FrameCodec, ZLIB_SUFFIX};
pub use events::{EventRegistry, GatewayEvent, HandlerId};
pub use heartbeat::{Beat, HeartbeatMonitor};
pub use payload::{
    ClientPayload, Command, ConnectionProperties, Dispatch, Hello, Identify, OpCode, PayloadError,
    Ready, Resume, ServerPayload,
};
pub use ratelimit::CommandLimiter;
pub use session::{LifecycleEvent, SessionPhase, ShardInfo, StreamingSession};
pub use shard::{ShardManager, shard_for_guild};
pub use transport::{
    Connection, Connector, GatewaySink, GatewayStream, TungsteniteConnector, WireMessage,
};
