//! Route-to-bucket mapping with bucket migration.

use crate::{Bucket, BucketId, RateLimitHeaders, RouteIdentity};
use conduit_core::RestConfig;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, instrument};

#[derive(Debug, Default)]
struct RegistryState {
    /// Bucket currently gating each known route
    routes: HashMap<RouteIdentity, Arc<Bucket>>,
    /// Canonical buckets keyed by (server hash, major parameters)
    by_key: HashMap<(String, String), Arc<Bucket>>,
}

/// Owns every bucket: the Global Bucket, the optional Default Bucket, and one
/// bucket per known route.
///
/// The route map has its own lock, separate from each bucket's lock, and is
/// only held for lookups and inserts.
#[derive(Debug)]
pub struct BucketRegistry {
    state: Mutex<RegistryState>,
    global: Arc<Bucket>,
    default: Option<Arc<Bucket>>,
}

impl BucketRegistry {
    /// Create a registry with a global budget of `global_per_second` requests.
    pub fn new(global_per_second: u32, default_bucket_enabled: bool) -> Self {
        let default = default_bucket_enabled
            .then(|| Arc::new(Bucket::placeholder(BucketId::Local("default".to_string()))));
        Self {
            state: Mutex::new(RegistryState::default()),
            global: Arc::new(Bucket::fixed_window(
                BucketId::Local("global".to_string()),
                global_per_second,
                Duration::from_secs(1),
            )),
            default,
        }
    }

    /// Create a registry from REST configuration.
    pub fn from_config(config: &RestConfig) -> Self {
        Self::new(config.global_requests_per_second, config.default_bucket_enabled)
    }

    /// The account-wide bucket every request passes first.
    pub fn global(&self) -> &Arc<Bucket> {
        &self.global
    }

    /// The shared fallback for unlearned routes, if enabled.
    pub fn default_bucket(&self) -> Option<&Arc<Bucket>> {
        self.default.as_ref()
    }

    /// Bucket that gates `route` right now.
    ///
    /// Unlearned routes get the Default Bucket when enabled, otherwise a fresh
    /// placeholder that is remembered for the route.
    pub fn resolve(&self, route: &RouteIdentity) -> Arc<Bucket> {
        let mut state = self.state.lock();
        if let Some(bucket) = state.routes.get(route) {
            return Arc::clone(bucket);
        }
        if let Some(default) = &self.default {
            return Arc::clone(default);
        }
        let bucket = Arc::new(Bucket::placeholder(BucketId::Local(
            route.resource_key().clone(),
        )));
        state.routes.insert(route.clone(), Arc::clone(&bucket));
        bucket
    }

    /// Whether `bucket` is still the one [`resolve`](Self::resolve) would return.
    pub fn is_current(&self, route: &RouteIdentity, bucket: &Arc<Bucket>) -> bool {
        let state = self.state.lock();
        match state.routes.get(route) {
            Some(current) => Arc::ptr_eq(current, bucket),
            None => self
                .default
                .as_ref()
                .is_some_and(|default| Arc::ptr_eq(default, bucket)),
        }
    }

    /// Learn from a response to `route`, returning the bucket now gating it.
    ///
    /// A bucket hash moves the route onto the canonical bucket for
    /// (hash, major parameters), adopting the route's placeholder when there
    /// is no canonical bucket yet. A response with no rate-limit headers marks
    /// the route unlimited.
    #[instrument(skip(self, headers), fields(route = %route.route_template()))]
    pub fn observe(
        &self,
        route: &RouteIdentity,
        headers: &RateLimitHeaders,
        now: Instant,
    ) -> Arc<Bucket> {
        let mut state = self.state.lock();
        let current = state.routes.get(route).cloned();

        if headers.is_empty() {
            if let Some(bucket) = current.as_ref().filter(|b| b.is_unlimited()) {
                return Arc::clone(bucket);
            }
            debug!("No rate-limit headers, route is unlimited");
            let bucket = Arc::new(Bucket::unlimited(BucketId::Local(
                route.resource_key().clone(),
            )));
            self.replace(&mut state, route, current, &bucket);
            return bucket;
        }

        let Some(hash) = headers.bucket().clone() else {
            // Limits without a hash: refine whatever the route already has.
            return match current {
                Some(bucket) => {
                    bucket.reconcile(headers, now);
                    bucket
                }
                None => {
                    let bucket = Arc::new(Bucket::placeholder(BucketId::Local(
                        route.resource_key().clone(),
                    )));
                    bucket.reconcile(headers, now);
                    state.routes.insert(route.clone(), Arc::clone(&bucket));
                    self.wake_default();
                    bucket
                }
            };
        };

        let key = (hash.clone(), route.major_key().clone());
        let bucket = match state.by_key.get(&key) {
            Some(canonical) => Arc::clone(canonical),
            None => {
                let bucket = match current.as_ref() {
                    Some(existing) if existing.is_local() && !existing.is_unlimited() => {
                        existing.set_id(BucketId::Server(hash.clone()));
                        Arc::clone(existing)
                    }
                    _ => Arc::new(Bucket::placeholder(BucketId::Server(hash.clone()))),
                };
                state.by_key.insert(key, Arc::clone(&bucket));
                bucket
            }
        };

        bucket.reconcile(headers, now);
        self.replace(&mut state, route, current, &bucket);
        bucket
    }

    fn replace(
        &self,
        state: &mut RegistryState,
        route: &RouteIdentity,
        previous: Option<Arc<Bucket>>,
        bucket: &Arc<Bucket>,
    ) {
        match previous {
            Some(previous) if Arc::ptr_eq(&previous, bucket) => {}
            Some(previous) => {
                info!(
                    from = %previous.id(),
                    to = %bucket.id(),
                    "Bucket migrated"
                );
                state.routes.insert(route.clone(), Arc::clone(bucket));
                previous.wake_all();
            }
            None => {
                state.routes.insert(route.clone(), Arc::clone(bucket));
                self.wake_default();
            }
        }
    }

    fn wake_default(&self) {
        if let Some(default) = &self.default {
            default.wake_all();
        }
    }

    /// Number of routes with a learned or placeholder bucket.
    pub fn route_count(&self) -> usize {
        self.state.lock().routes.len()
    }

    /// Number of server-named buckets.
    pub fn bucket_count(&self) -> usize {
        self.state.lock().by_key.len()
    }
}
