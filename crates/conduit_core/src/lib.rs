//! Configuration, credentials and observability shared by the conduit crates.

#![warn(missing_docs)]

mod config;
mod credentials;
mod observability;

pub use config::{Compression, ConduitConfig, GatewayConfig, RestConfig};
pub use credentials::{Credentials, intents};
pub use observability::{
    LogFormat, init_metrics, init_tracing, record_gateway_event, record_gateway_lifecycle,
    record_rate_limited, record_rest_response,
};
