//! A single rate-limit counter with its own lock.
//!
//! Reservations are taken under the bucket's mutex and released before any
//! I/O happens. Callers that cannot be admitted park on a [`Notify`] and are
//! woken when the window resets, a reservation settles, or the server
//! updates the bucket.

use crate::RateLimitHeaders;
use derive_getters::Getters;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, trace};

/// Bucket identifier: assigned locally until the server names it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, derive_more::Display)]
pub enum BucketId {
    /// Placeholder or reserved bucket
    #[display("local:{_0}")]
    Local(String),
    /// Server-assigned bucket hash
    #[display("{_0}")]
    Server(String),
}

/// Outcome of one reservation attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Capacity was taken
    Granted,
    /// No capacity until the given instant
    WaitUntil(Instant),
    /// No capacity until a reservation settles or the server responds
    WaitForUpdate,
}

#[derive(Debug)]
struct BucketState {
    id: BucketId,
    limit: u32,
    remaining: u32,
    reset_at: Option<Instant>,
    reset_after: Duration,
    confirmed: bool,
    unlimited: bool,
    in_flight: u32,
    blocked_until: Option<Instant>,
}

/// Point-in-time copy of a bucket's counters.
#[derive(Debug, Clone, PartialEq, Eq, Getters)]
pub struct BucketSnapshot {
    /// Bucket identifier
    id: BucketId,
    /// Requests per window
    limit: u32,
    /// Requests left in the window
    remaining: u32,
    /// When the window ends
    reset_at: Option<Instant>,
    /// Whether the server has described this bucket
    confirmed: bool,
    /// Whether the route is known to have no per-route limit
    unlimited: bool,
    /// Reservations taken but not settled
    in_flight: u32,
    /// Hard block set by a 429
    blocked_until: Option<Instant>,
}

/// A rate-limit bucket.
#[derive(Debug)]
pub struct Bucket {
    state: Mutex<BucketState>,
    notify: Notify,
}

impl Bucket {
    fn with_state(state: BucketState) -> Self {
        Self {
            state: Mutex::new(state),
            notify: Notify::new(),
        }
    }

    /// Conservative bucket for a route the server has not described yet:
    /// one request at a time until the first response arrives.
    pub fn placeholder(id: BucketId) -> Self {
        Self::with_state(BucketState {
            id,
            limit: 1,
            remaining: 1,
            reset_at: None,
            reset_after: Duration::ZERO,
            confirmed: false,
            unlimited: false,
            in_flight: 0,
            blocked_until: None,
        })
    }

    /// Locally enforced window of `limit` reservations per `window`.
    ///
    /// The window opens on the first reservation after a reset.
    pub fn fixed_window(id: BucketId, limit: u32, window: Duration) -> Self {
        let limit = limit.max(1);
        Self::with_state(BucketState {
            id,
            limit,
            remaining: limit,
            reset_at: None,
            reset_after: window,
            confirmed: true,
            unlimited: false,
            in_flight: 0,
            blocked_until: None,
        })
    }

    /// Bucket for a route that returned no rate-limit headers.
    pub fn unlimited(id: BucketId) -> Self {
        let bucket = Self::placeholder(id);
        {
            let mut state = bucket.state.lock();
            state.unlimited = true;
            state.confirmed = true;
        }
        bucket
    }

    /// Try to take one unit of capacity at `now`.
    pub fn try_reserve(&self, now: Instant) -> Admission {
        let mut state = self.state.lock();

        if let Some(until) = state.blocked_until {
            if now < until {
                return Admission::WaitUntil(until);
            }
            state.blocked_until = None;
        }

        if state.unlimited {
            state.in_flight += 1;
            return Admission::Granted;
        }

        if state.reset_at.is_some_and(|reset_at| now >= reset_at) {
            state.remaining = state.limit;
            state.reset_at = None;
        }

        if !state.confirmed {
            // One optimistic request until the server describes the bucket.
            if state.in_flight == 0 && state.remaining > 0 {
                state.remaining -= 1;
                state.in_flight += 1;
                return Admission::Granted;
            }
            return Admission::WaitForUpdate;
        }

        if state.remaining > 0 {
            state.remaining -= 1;
            state.in_flight += 1;
            if state.reset_at.is_none() {
                state.reset_at = Some(now + state.reset_after);
            }
            trace!(bucket = %state.id, remaining = state.remaining, "Reserved capacity");
            return Admission::Granted;
        }

        match state.reset_at {
            Some(reset_at) => Admission::WaitUntil(reset_at),
            None => Admission::WaitForUpdate,
        }
    }

    /// Wait until a reservation is granted.
    ///
    /// Cancel-safe: dropping the future before it resolves takes nothing.
    pub async fn acquire(self: &Arc<Self>) -> BucketPermit {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);

            match self.try_reserve(Instant::now()) {
                Admission::Granted => {
                    return BucketPermit {
                        bucket: Arc::clone(self),
                        released: false,
                    };
                }
                Admission::WaitUntil(until) => {
                    debug!(bucket = %self.id(), "Bucket exhausted, waiting for reset");
                    tokio::select! {
                        _ = tokio::time::sleep_until(until) => {}
                        _ = &mut notified => {}
                    }
                }
                Admission::WaitForUpdate => {
                    debug!(bucket = %self.id(), "Bucket unconfirmed, waiting for first response");
                    notified.await;
                }
            }
        }
    }

    /// Merge rate-limit headers observed at `now`.
    ///
    /// Within one window `remaining` only goes down and `reset_at` only goes
    /// later, so responses that race each other cannot roll the bucket back.
    /// Applying the same headers twice at the same instant is a no-op.
    pub fn reconcile(&self, headers: &RateLimitHeaders, now: Instant) {
        let mut state = self.state.lock();
        if state.unlimited {
            return;
        }

        if let Some(limit) = *headers.limit() {
            state.limit = limit.max(1);
        }

        let incoming_reset = headers.window_remaining().map(|after| {
            state.reset_after = after;
            now + after
        });

        let window_open = state.confirmed && state.reset_at.is_some_and(|reset| reset > now);

        if let Some(incoming) = *headers.remaining() {
            state.remaining = if window_open {
                state.remaining.min(incoming)
            } else {
                incoming
            };
        }

        state.reset_at = match (state.reset_at, incoming_reset) {
            (Some(stored), Some(incoming)) if window_open => Some(stored.max(incoming)),
            (_, Some(incoming)) => Some(incoming),
            (stored, None) => stored,
        };

        state.remaining = state.remaining.min(state.limit);
        if state.remaining == 0 && state.reset_at.is_none() {
            state.reset_at = Some(now + state.reset_after);
        }
        state.confirmed = true;

        trace!(
            bucket = %state.id,
            limit = state.limit,
            remaining = state.remaining,
            "Reconciled bucket"
        );
        drop(state);
        self.notify.notify_waiters();
    }

    /// Refuse all reservations until `until` (429 handling).
    pub fn block_until(&self, until: Instant) {
        let mut state = self.state.lock();
        state.blocked_until = Some(state.blocked_until.map_or(until, |b| b.max(until)));
        if !state.unlimited {
            state.remaining = 0;
            state.reset_at = Some(state.reset_at.map_or(until, |r| r.max(until)));
        }
        debug!(bucket = %state.id, "Bucket blocked by server");
        drop(state);
        self.notify.notify_waiters();
    }

    /// Rename the bucket.
    pub fn set_id(&self, id: BucketId) {
        self.state.lock().id = id;
    }

    /// Current identifier.
    pub fn id(&self) -> BucketId {
        self.state.lock().id.clone()
    }

    /// Whether the bucket still carries a local placeholder id.
    pub fn is_local(&self) -> bool {
        matches!(self.state.lock().id, BucketId::Local(_))
    }

    /// Whether this bucket gates nothing.
    pub fn is_unlimited(&self) -> bool {
        self.state.lock().unlimited
    }

    /// Copy the current counters.
    pub fn snapshot(&self) -> BucketSnapshot {
        let state = self.state.lock();
        BucketSnapshot {
            id: state.id.clone(),
            limit: state.limit,
            remaining: state.remaining,
            reset_at: state.reset_at,
            confirmed: state.confirmed,
            unlimited: state.unlimited,
            in_flight: state.in_flight,
            blocked_until: state.blocked_until,
        }
    }

    /// Wake every parked caller so it re-evaluates.
    pub fn wake_all(&self) {
        self.notify.notify_waiters();
    }

    fn release(&self, refund: bool) {
        let mut state = self.state.lock();
        state.in_flight = state.in_flight.saturating_sub(1);
        if !state.unlimited && (refund || !state.confirmed) {
            state.remaining = (state.remaining + 1).min(state.limit);
        }
        drop(state);
        self.notify.notify_waiters();
    }
}

/// A granted reservation. Dropping it settles the reservation.
#[derive(Debug)]
pub struct BucketPermit {
    bucket: Arc<Bucket>,
    released: bool,
}

impl BucketPermit {
    /// The bucket this permit was taken from.
    pub fn bucket(&self) -> &Arc<Bucket> {
        &self.bucket
    }

    /// Mark the request as finished; the capacity stays spent.
    pub fn settle(mut self) {
        self.released = true;
        self.bucket.release(false);
    }

    /// Give the capacity back because no request was sent.
    pub fn refund(mut self) {
        self.released = true;
        self.bucket.release(true);
    }
}

impl Drop for BucketPermit {
    fn drop(&mut self) {
        if !self.released {
            self.bucket.release(false);
        }
    }
}
