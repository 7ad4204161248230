//! Token bucket limiting how fast jobs are sent to the generation service.
//!
//! Tokens refill continuously at `rate_per_minute / 60` per second up to
//! `burst_capacity`. Refill is computed lazily on each call, so there is no
//! background timer. The bucket starts full.

use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use tokio::time::{Instant, sleep};

/// Shared token accounting, mutated only under the limiter's mutex.
#[derive(Debug)]
struct RateLimiterState {
    tokens: f64,
    last_refill: Instant,
}

#[derive(Debug)]
pub struct RateLimiter {
    rate_per_minute: u32,
    burst_capacity: u32,
    tokens_per_second: f64,
    state: Mutex<RateLimiterState>,
}

impl RateLimiter {
    /// Creates a limiter with the default burst of `rate_per_minute / 10`.
    pub fn new(rate_per_minute: u32) -> Self {
        Self::with_burst(rate_per_minute, default_burst(rate_per_minute))
    }

    pub fn with_burst(rate_per_minute: u32, burst_capacity: u32) -> Self {
        let rate_per_minute = rate_per_minute.max(1);
        let burst_capacity = burst_capacity.max(1);
        Self {
            rate_per_minute,
            burst_capacity,
            tokens_per_second: f64::from(rate_per_minute) / 60.0,
            state: Mutex::new(RateLimiterState {
                tokens: f64::from(burst_capacity),
                last_refill: Instant::now(),
            }),
        }
    }

    pub fn rate_per_minute(&self) -> u32 {
        self.rate_per_minute
    }

    pub fn burst_capacity(&self) -> u32 {
        self.burst_capacity
    }

    /// Waits until a token is available and consumes it.
    ///
    /// Waiters are not served in FIFO order. After sleeping, each waiter
    /// re-checks the bucket because another acquirer may have taken the
    /// token it was waiting for.
    pub async fn acquire(&self) {
        loop {
            let wait = match self.take_or_wait() {
                None => return,
                Some(wait) => wait,
            };
            sleep(wait).await;
        }
    }

    /// Consumes a token if one is available right now.
    pub fn try_acquire(&self) -> bool {
        self.take_or_wait().is_none()
    }

    /// Number of whole tokens currently in the bucket.
    pub fn available(&self) -> u32 {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        self.refill(&mut state);
        state.tokens.floor() as u32
    }

    // Returns `None` when a token was consumed, otherwise the time needed
    // for the bucket to hold one whole token.
    fn take_or_wait(&self) -> Option<Duration> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        self.refill(&mut state);
        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            return None;
        }
        let deficit = 1.0 - state.tokens;
        let micros = (deficit / self.tokens_per_second * 1_000_000.0).ceil();
        Some(Duration::from_micros(micros as u64))
    }

    fn refill(&self, state: &mut RateLimiterState) {
        let now = Instant::now();
        let elapsed = now.duration_since(state.last_refill).as_secs_f64();
        state.tokens =
            (state.tokens + elapsed * self.tokens_per_second).min(f64::from(self.burst_capacity));
        state.last_refill = now;
    }
}

/// One tenth of the per-minute rate, never below one token.
pub fn default_burst(rate_per_minute: u32) -> u32 {
    (rate_per_minute / 10).max(1)
}
