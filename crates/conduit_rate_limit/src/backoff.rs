//! Exponential backoff with optional jitter.

use std::time::Duration;
use tokio_retry2::strategy::jitter;

/// Exponential backoff state for one retry sequence.
///
/// # Examples
///
/// ```
/// use conduit_rate_limit::Backoff;
/// use std::time::Duration;
///
/// let mut backoff = Backoff::new(Duration::from_millis(100), Duration::from_millis(250));
/// assert_eq!(backoff.next_delay(), Duration::from_millis(100));
/// assert_eq!(backoff.next_delay(), Duration::from_millis(200));
/// assert_eq!(backoff.next_delay(), Duration::from_millis(250));
/// ```
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    jitter: bool,
    attempt: u32,
}

impl Backoff {
    /// Doubling backoff from `base` capped at `max`, without jitter.
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max: max.max(base),
            jitter: false,
            attempt: 0,
        }
    }

    /// Randomise each delay into `[delay / 2, delay)`.
    pub fn with_jitter(mut self, enabled: bool) -> Self {
        self.jitter = enabled;
        self
    }

    /// Delay before the next attempt.
    pub fn next_delay(&mut self) -> Duration {
        let factor = 1u32 << self.attempt.min(31);
        let delay = self.base.saturating_mul(factor).min(self.max);
        self.attempt = self.attempt.saturating_add(1);
        if self.jitter {
            let half = delay / 2;
            half + jitter(delay - half)
        } else {
            delay
        }
    }

    /// Number of delays handed out since the last reset.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Start over from `base`.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}
