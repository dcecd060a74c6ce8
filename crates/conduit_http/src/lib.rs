//! Rate-limited REST dispatcher for conduit.
//!
//! Describe a call with an [`Endpoint`], then hand it to a [`Dispatcher`]:
//!
//! ```no_run
//! use conduit_core::{ConduitConfig, Credentials};
//! use conduit_http::{Dispatcher, Request};
//! use conduit_rate_limit::{Method, Route};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let config = ConduitConfig::load()?;
//! let credentials = Credentials::from_env("DISCORD_TOKEN", 0)?;
//! let dispatcher = Dispatcher::new(config.rest, &credentials)?;
//!
//! let channel: serde_json::Value = dispatcher
//!     .send(&Request::new(
//!         Route::new(Method::Get, "/channels/{channel_id}").param("channel_id", 1234),
//!     ))
//!     .await?;
//! println!("{}", channel);
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]

mod dispatcher;
mod endpoint;
mod transport;

pub use dispatcher::Dispatcher;
pub use endpoint::{Endpoint, Request, json_body};
pub use transport::{HttpRequest, HttpRequestBuilder, HttpResponse, HttpTransport, ReqwestTransport};
