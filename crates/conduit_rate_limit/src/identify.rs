//! Account-wide pacing of gateway identifies.

use crate::{Bucket, BucketId};
use conduit_core::GatewayConfig;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, instrument};

/// Spaces identifies across every shard of one account.
///
/// Waiters are served strictly in arrival order: the queue is a fair mutex
/// and only its holder may reserve from the underlying window.
#[derive(Debug)]
pub struct IdentifyLimiter {
    queue: Mutex<()>,
    window: Arc<Bucket>,
}

impl IdentifyLimiter {
    /// Allow `max_concurrency` identifies per `interval`.
    pub fn new(max_concurrency: u32, interval: Duration) -> Self {
        Self {
            queue: Mutex::new(()),
            window: Arc::new(Bucket::fixed_window(
                BucketId::Local("identify".to_string()),
                max_concurrency,
                interval,
            )),
        }
    }

    /// Create a limiter from gateway configuration.
    pub fn from_config(config: &GatewayConfig) -> Self {
        Self::new(config.identify_max_concurrency, config.identify_interval())
    }

    /// Wait for this shard's turn to identify.
    #[instrument(skip(self))]
    pub async fn acquire(&self, shard: u32) {
        let _turn = self.queue.lock().await;
        self.window.acquire().await.settle();
        debug!(shard, "Identify slot granted");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::Instant;

    #[tokio::test(start_paused = true)]
    async fn test_identifies_are_spaced_by_interval() {
        let limiter = IdentifyLimiter::new(1, Duration::from_secs(5));
        let start = Instant::now();
        limiter.acquire(0).await;
        limiter.acquire(1).await;
        limiter.acquire(2).await;
        assert!(Instant::now() - start >= Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrency_allows_burst() {
        let limiter = IdentifyLimiter::new(2, Duration::from_secs(5));
        let start = Instant::now();
        limiter.acquire(0).await;
        limiter.acquire(1).await;
        assert_eq!(Instant::now(), start);
    }

    #[tokio::test(start_paused = true)]
    async fn test_waiters_are_served_in_arrival_order() {
        let limiter = Arc::new(IdentifyLimiter::new(1, Duration::from_secs(1)));
        let order = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let mut handles = Vec::new();
        for shard in 0..4u32 {
            let limiter = Arc::clone(&limiter);
            let order = Arc::clone(&order);
            handles.push(tokio::spawn(async move {
                limiter.acquire(shard).await;
                order.lock().push(shard);
            }));
            // Let each task enqueue before the next one spawns.
            tokio::task::yield_now().await;
        }
        for handle in handles {
            handle.await.expect("task");
        }
        assert_eq!(*order.lock(), vec![0, 1, 2, 3]);
    }
}
