//! Rate-limit admission control for the conduit REST dispatcher and gateway.
//!
//! A request is identified by its [`RouteIdentity`]; the [`BucketRegistry`]
//! maps identities to [`Bucket`]s and learns server bucket hashes from
//! [`RateLimitHeaders`]. [`IdentifyLimiter`] paces gateway identifies across
//! shards, and [`Backoff`] drives retry delays.

#![warn(missing_docs)]

mod backoff;
mod bucket;
pub mod headers;
mod identify;
mod registry;
mod route;

pub use backoff::Backoff;
pub use bucket::{Admission, Bucket, BucketId, BucketPermit, BucketSnapshot};
pub use headers::{RateLimitHeaders, RateLimitScope, RateLimitSignal, RateLimitedBody};
pub use identify::IdentifyLimiter;
pub use registry::BucketRegistry;
pub use route::{MAJOR_PARAMETERS, Method, Route, RouteIdentity};
