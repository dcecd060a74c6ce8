//! Outbound command budget for one connection.

use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter as GovernorRateLimiter};
use std::num::NonZeroU32;
use tracing::debug;

type DirectLimiter = GovernorRateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// GCRA limiter for caller commands (presence, voice state, member requests).
///
/// Heartbeats, identify and resume are not counted here; the budget should
/// leave room for them below the server's per-connection limit.
pub struct CommandLimiter {
    limiter: DirectLimiter,
    per_minute: u32,
}

impl std::fmt::Debug for CommandLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandLimiter")
            .field("per_minute", &self.per_minute)
            .finish()
    }
}

impl CommandLimiter {
    /// Allow `per_minute` commands per minute, all of them as a burst.
    /// Zero is treated as one.
    pub fn new(per_minute: u32) -> Self {
        let per_minute = per_minute.max(1);
        let quota = Quota::per_minute(NonZeroU32::new(per_minute).unwrap_or(NonZeroU32::MIN));
        Self {
            limiter: GovernorRateLimiter::direct(quota),
            per_minute,
        }
    }

    /// Configured budget.
    pub fn per_minute(&self) -> u32 {
        self.per_minute
    }

    /// Take a slot without waiting.
    pub fn try_acquire(&self) -> bool {
        self.limiter.check().is_ok()
    }

    /// Wait for a slot.
    pub async fn acquire(&self) {
        if self.limiter.check().is_err() {
            debug!(per_minute = self.per_minute, "Command budget spent, waiting");
            self.limiter.until_ready().await;
        }
    }
}
