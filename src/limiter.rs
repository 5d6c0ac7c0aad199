//! Token-bucket rate limiter with an optional FIFO wait queue.
//!
//! Semantics:
//! - The bucket starts full at `capacity` and refills at `refill_per_minute` tokens per
//!   60 real seconds. Refill is computed lazily on every acquisition, so no timer has to
//!   fire for `acquire` to observe newly earned tokens.
//! - [`TokenBucketLimiter::acquire`] is synchronous in effect: it grants a token or
//!   denies immediately with a suggested `retry_after`. It never queues and never errors;
//!   retry scheduling belongs to the caller (the request executor).
//! - [`TokenBucketLimiter::wait_for_token`] is the explicit queued-wait mode. Waiters are
//!   parked FIFO and drained by a ~1 s background tick while tokens remain. A waiter
//!   always settles: on grant, on `queue_timeout` expiry, or when the limiter is
//!   destroyed.
//!
//! Invariants:
//! - `0 <= available <= capacity` at every observation point.
//! - Refill advances `last_refill` only by the time actually converted into whole
//!   tokens, carrying fractional progress instead of discarding it.
//! - `destroy` settles every queued waiter; none is left dangling.
//!
//! All bucket state lives behind one mutex and no lock is held across an await point.

use crate::clock::{Clock, MonotonicClock};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::MissedTickBehavior;

const MILLIS_PER_MINUTE: f64 = 60_000.0;

/// Outcome of a single [`TokenBucketLimiter::acquire`] call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Acquisition {
    /// Whether a token was granted.
    pub allowed: bool,
    /// Tokens left in the bucket after this call.
    pub remaining: u32,
    /// Suggested wait before the next attempt; present only on denial.
    pub retry_after: Option<Duration>,
}

/// Read-only snapshot of limiter state. Never mutates the bucket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LimiterStats {
    pub capacity: u32,
    pub refill_per_minute: u32,
    pub available: u32,
    pub queue_length: usize,
    /// Monotonic millisecond timestamp of the last refill computation.
    pub last_refill_millis: u64,
}

/// Why a queued wait did not end in a token.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum WaitError {
    /// The waiter sat in the queue past `queue_timeout`.
    #[error("timed out waiting for a rate limit token")]
    TimedOut,
    /// The limiter was destroyed while the waiter was queued.
    #[error("rate limiter destroyed")]
    Destroyed,
}

#[derive(Debug)]
enum WaitOutcome {
    Granted,
    Destroyed,
}

struct Waiter {
    /// Diagnostics only; queue precedence is strictly FIFO.
    #[allow(dead_code)]
    enqueued_at: u64,
    settle: oneshot::Sender<WaitOutcome>,
}

struct Bucket {
    available: u32,
    /// Fractional monotonic millis; advanced by consumed time, not snapped to "now".
    last_refill_millis: f64,
    waiters: VecDeque<Waiter>,
}

/// Token-bucket admission control shared by all request paths of one API client.
pub struct TokenBucketLimiter {
    capacity: u32,
    refill_per_minute: u32,
    queue_timeout: Duration,
    clock: Arc<dyn Clock>,
    bucket: Mutex<Bucket>,
    destroyed: AtomicBool,
    tick: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl std::fmt::Debug for TokenBucketLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenBucketLimiter")
            .field("capacity", &self.capacity)
            .field("refill_per_minute", &self.refill_per_minute)
            .field("queue_timeout", &self.queue_timeout)
            .finish()
    }
}

impl TokenBucketLimiter {
    /// Create a limiter starting with a full bucket and spawn its background drain tick.
    ///
    /// Panics if `capacity` or `refill_per_minute` is zero. Must be called from within
    /// a tokio runtime.
    pub fn new(capacity: u32, refill_per_minute: u32, queue_timeout: Duration) -> Arc<Self> {
        Self::with_clock(capacity, refill_per_minute, queue_timeout, Arc::new(MonotonicClock::default()))
    }

    /// Same as [`TokenBucketLimiter::new`] with an injected clock, for tests.
    pub fn with_clock(
        capacity: u32,
        refill_per_minute: u32,
        queue_timeout: Duration,
        clock: Arc<dyn Clock>,
    ) -> Arc<Self> {
        assert!(capacity >= 1, "capacity must be >= 1");
        assert!(refill_per_minute >= 1, "refill_per_minute must be >= 1");

        let now = clock.now_millis() as f64;
        let limiter = Arc::new(Self {
            capacity,
            refill_per_minute,
            queue_timeout,
            clock,
            bucket: Mutex::new(Bucket {
                available: capacity,
                last_refill_millis: now,
                waiters: VecDeque::new(),
            }),
            destroyed: AtomicBool::new(false),
            tick: Mutex::new(None),
        });
        Self::spawn_tick(&limiter);
        limiter
    }

    /// Try to take one token. Grants or denies immediately; never queues, never errors.
    pub fn acquire(&self) -> Acquisition {
        let mut bucket = self.bucket.lock().unwrap();
        self.refill_locked(&mut bucket);

        if bucket.available > 0 {
            bucket.available -= 1;
            Acquisition { allowed: true, remaining: bucket.available, retry_after: None }
        } else {
            let retry_after = self.refill_interval();
            tracing::debug!(
                retry_after_ms = retry_after.as_millis() as u64,
                queue_length = bucket.waiters.len(),
                "rate limit token denied"
            );
            Acquisition { allowed: false, remaining: 0, retry_after: Some(retry_after) }
        }
    }

    /// Park until a token is granted by the background drain.
    ///
    /// Settles with `Ok(())` on grant, `WaitError::TimedOut` after `queue_timeout`, or
    /// `WaitError::Destroyed` if the limiter shuts down first.
    pub async fn wait_for_token(&self) -> Result<(), WaitError> {
        let rx = {
            let mut bucket = self.bucket.lock().unwrap();
            // Checked under the lock: destroy() raises the flag before draining, so a
            // waiter can never slip into the queue after the final drain.
            if self.destroyed.load(Ordering::SeqCst) {
                return Err(WaitError::Destroyed);
            }
            self.refill_locked(&mut bucket);
            if bucket.available > 0 {
                bucket.available -= 1;
                return Ok(());
            }
            let (tx, rx) = oneshot::channel();
            bucket
                .waiters
                .push_back(Waiter { enqueued_at: self.clock.now_millis(), settle: tx });
            rx
        };

        match tokio::time::timeout(self.queue_timeout, rx).await {
            Ok(Ok(WaitOutcome::Granted)) => Ok(()),
            Ok(Ok(WaitOutcome::Destroyed)) => Err(WaitError::Destroyed),
            // Sender dropped without settling; only happens when the limiter is gone.
            Ok(Err(_)) => Err(WaitError::Destroyed),
            // Dropping the receiver marks the queue entry dead; the drain discards it
            // without spending a token.
            Err(_) => Err(WaitError::TimedOut),
        }
    }

    /// Read-only snapshot; does not trigger a refill.
    pub fn stats(&self) -> LimiterStats {
        let bucket = self.bucket.lock().unwrap();
        LimiterStats {
            capacity: self.capacity,
            refill_per_minute: self.refill_per_minute,
            available: bucket.available,
            queue_length: bucket.waiters.len(),
            last_refill_millis: bucket.last_refill_millis as u64,
        }
    }

    /// Stop the background tick and settle every queued waiter with
    /// [`WaitError::Destroyed`]. Idempotent; required for clean teardown.
    pub fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(handle) = self.tick.lock().unwrap().take() {
            handle.abort();
        }
        let waiters: Vec<Waiter> = {
            let mut bucket = self.bucket.lock().unwrap();
            bucket.waiters.drain(..).collect()
        };
        let settled = waiters.len();
        for waiter in waiters {
            let _ = waiter.settle.send(WaitOutcome::Destroyed);
        }
        tracing::debug!(settled, "rate limiter destroyed");
    }

    /// Minimum interval between earned tokens: `ceil(60000 / refill_per_minute)` ms.
    fn refill_interval(&self) -> Duration {
        let rate = u64::from(self.refill_per_minute);
        Duration::from_millis((60_000 + rate - 1) / rate)
    }

    /// Convert elapsed time into whole tokens, carrying the fractional remainder by
    /// advancing `last_refill_millis` only by the time those tokens cost.
    fn refill_locked(&self, bucket: &mut Bucket) {
        let now = self.clock.now_millis() as f64;
        let elapsed = (now - bucket.last_refill_millis).max(0.0);
        let rate = f64::from(self.refill_per_minute);
        let earned = (elapsed * rate / MILLIS_PER_MINUTE).floor();
        if earned >= 1.0 {
            let added = if earned >= f64::from(self.capacity) {
                self.capacity
            } else {
                earned as u32
            };
            bucket.available = bucket.available.saturating_add(added).min(self.capacity);
            bucket.last_refill_millis += earned * MILLIS_PER_MINUTE / rate;
        }
    }

    fn drain_waiters(&self) {
        let mut bucket = self.bucket.lock().unwrap();
        self.refill_locked(&mut bucket);
        while bucket.available > 0 {
            let Some(waiter) = bucket.waiters.pop_front() else { break };
            if waiter.settle.is_closed() {
                // Waiter timed out and went away; no token spent.
                continue;
            }
            bucket.available -= 1;
            if waiter.settle.send(WaitOutcome::Granted).is_err() {
                // Receiver vanished between the check and the send; refund.
                bucket.available += 1;
            }
        }
    }

    fn spawn_tick(limiter: &Arc<Self>) {
        let weak = Arc::downgrade(limiter);
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(1));
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                let Some(limiter) = weak.upgrade() else { break };
                if limiter.destroyed.load(Ordering::SeqCst) {
                    break;
                }
                limiter.drain_waiters();
            }
        });
        *limiter.tick.lock().unwrap() = Some(handle);
    }
}

impl Drop for TokenBucketLimiter {
    fn drop(&mut self) {
        if let Some(handle) = self.tick.lock().unwrap().take() {
            handle.abort();
        }
    }
}
