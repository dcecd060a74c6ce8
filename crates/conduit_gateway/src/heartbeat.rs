//! Heartbeat bookkeeping for one connection.

use std::time::Duration;
use tokio::time::Instant;
use tokio_retry2::strategy::jitter;

/// What the heartbeat timer should do on this tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Beat {
    /// Send a heartbeat
    Send,
    /// Too many acks went missing; the connection is dead
    Zombie {
        /// Consecutive ticks that found an ack still pending
        missed: u32,
    },
}

/// Tracks heartbeats sent and acknowledged on one connection.
///
/// A tick that finds the previous heartbeat unacknowledged counts as a miss.
/// The connection is a zombie once misses exceed the tolerance, so a
/// tolerance of 1 allows one late ack and gives up on the second.
#[derive(Debug, Clone)]
pub struct HeartbeatMonitor {
    interval: Duration,
    tolerance: u32,
    ack_pending: bool,
    missed: u32,
    last_sent_at: Option<Instant>,
    last_ack_at: Option<Instant>,
    latency: Option<Duration>,
}

impl HeartbeatMonitor {
    /// Monitor for a connection whose Hello announced `interval`.
    pub fn new(interval: Duration, tolerance: u32) -> Self {
        Self {
            interval,
            tolerance,
            ack_pending: false,
            missed: 0,
            last_sent_at: None,
            last_ack_at: None,
            latency: None,
        }
    }

    /// Heartbeat interval.
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Delay before the first heartbeat: a random fraction of the interval
    /// when `jittered`, otherwise the full interval.
    pub fn first_delay(&self, jittered: bool) -> Duration {
        if jittered {
            jitter(self.interval)
        } else {
            self.interval
        }
    }

    /// Decide what the timer does now.
    pub fn on_tick(&mut self) -> Beat {
        if self.ack_pending {
            self.missed += 1;
            if self.missed > self.tolerance {
                return Beat::Zombie {
                    missed: self.missed,
                };
            }
        }
        Beat::Send
    }

    /// A heartbeat went out at `now`.
    pub fn record_sent(&mut self, now: Instant) {
        self.last_sent_at = Some(now);
        self.ack_pending = true;
    }

    /// An ack arrived at `now`.
    pub fn record_ack(&mut self, now: Instant) {
        self.ack_pending = false;
        self.missed = 0;
        self.last_ack_at = Some(now);
        if let Some(sent) = self.last_sent_at {
            self.latency = Some(now.saturating_duration_since(sent));
        }
    }

    /// Whether the last heartbeat is still unacknowledged.
    pub fn ack_pending(&self) -> bool {
        self.ack_pending
    }

    /// Consecutive misses so far.
    pub fn missed(&self) -> u32 {
        self.missed
    }

    /// Round trip of the last acknowledged heartbeat.
    pub fn latency(&self) -> Option<Duration> {
        self.latency
    }

    /// When the last ack arrived.
    pub fn last_ack_at(&self) -> Option<Instant> {
        self.last_ack_at
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_acked_heartbeats_never_miss() {
        let mut monitor = HeartbeatMonitor::new(Duration::from_secs(1), 1);
        for _ in 0..5 {
            assert_eq!(monitor.on_tick(), Beat::Send);
            monitor.record_sent(Instant::now());
            tokio::time::advance(Duration::from_millis(40)).await;
            monitor.record_ack(Instant::now());
        }
        assert_eq!(monitor.missed(), 0);
        assert_eq!(monitor.latency(), Some(Duration::from_millis(40)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_two_missed_acks_with_tolerance_one_is_zombie() {
        let mut monitor = HeartbeatMonitor::new(Duration::from_secs(1), 1);
        assert_eq!(monitor.on_tick(), Beat::Send);
        monitor.record_sent(Instant::now());
        assert_eq!(monitor.on_tick(), Beat::Send);
        monitor.record_sent(Instant::now());
        assert_eq!(monitor.on_tick(), Beat::Zombie { missed: 2 });
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_ack_resets_misses() {
        let mut monitor = HeartbeatMonitor::new(Duration::from_secs(1), 1);
        monitor.on_tick();
        monitor.record_sent(Instant::now());
        assert_eq!(monitor.on_tick(), Beat::Send);
        assert_eq!(monitor.missed(), 1);
        monitor.record_ack(Instant::now());
        assert!(!monitor.ack_pending());
        assert_eq!(monitor.missed(), 0);
        assert_eq!(monitor.on_tick(), Beat::Send);
    }

    #[test]
    fn test_first_delay_within_interval() {
        let monitor = HeartbeatMonitor::new(Duration::from_millis(41_250), 1);
        assert_eq!(monitor.first_delay(false), Duration::from_millis(41_250));
        assert!(monitor.first_delay(true) <= Duration::from_millis(41_250));
    }
}
