//! Global token-bucket rate limiter.
//!
//! The single outbound throttle for the whole pipeline: every remote call,
//! whether CLI subprocess, embedder, or vector index, acquires exactly one token
//! before dispatch. No component bypasses it.
//!
//! The bucket holds at most `burst` tokens (default 20) and refills at the
//! steady-state rate (default 200 tokens/minute, clamped to [50, 300]).
//! An adaptive window re-evaluates the rate every 60 seconds from recorded
//! outcomes: a clean window (>95 % success, zero quota errors) raises the
//! rate ×1.2; any quota error or a success ratio below 80 % halves it.
//! Adjustments happen under the internal mutex and are visible to all tasks.
//!
//! The limiter also tracks consecutive quota errors for the orchestrator's
//! quota wall.

use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info};

use crate::bridge::RemoteError;
use crate::config::RateConfig;

/// Length of the adaptive adjustment window.
const ADJUST_WINDOW: Duration = Duration::from_secs(60);

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    capacity: f64,
    rate_per_min: f64,
    min_rate: f64,
    max_rate: f64,
    last_refill: Instant,
    window_start: Instant,
    window_success: u64,
    window_failure: u64,
    window_quota: u64,
    consecutive_quota: u32,
}

impl BucketState {
    fn refill(&mut self, now: Instant) {
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.rate_per_min / 60.0).min(self.capacity);
        self.last_refill = now;
    }

    /// Re-evaluate the rate if the window has elapsed.
    fn maybe_adjust(&mut self, now: Instant) {
        if now.duration_since(self.window_start) < ADJUST_WINDOW {
            return;
        }
        let total = self.window_success + self.window_failure + self.window_quota;
        if total > 0 {
            let ratio = self.window_success as f64 / total as f64;
            let old = self.rate_per_min;
            if self.window_quota > 0 || ratio < 0.8 {
                self.rate_per_min = (self.rate_per_min * 0.5).max(self.min_rate);
            } else if ratio > 0.95 {
                self.rate_per_min = (self.rate_per_min * 1.2).min(self.max_rate);
            }
            if (self.rate_per_min - old).abs() > f64::EPSILON {
                info!(
                    old_rate = old,
                    new_rate = self.rate_per_min,
                    success = self.window_success,
                    failure = self.window_failure,
                    quota = self.window_quota,
                    "adjusted remote call rate"
                );
            }
        }
        self.window_start = now;
        self.window_success = 0;
        self.window_failure = 0;
        self.window_quota = 0;
    }
}

/// Shared token bucket. Cheap to share via `Arc`.
#[derive(Debug)]
pub struct RateLimiter {
    state: Mutex<BucketState>,
    quota_wall_threshold: u32,
}

impl RateLimiter {
    pub fn new(config: &RateConfig) -> Self {
        let now = Instant::now();
        Self {
            state: Mutex::new(BucketState {
                tokens: config.burst as f64,
                capacity: config.burst as f64,
                rate_per_min: config.per_minute as f64,
                min_rate: config.min_per_minute as f64,
                max_rate: config.max_per_minute as f64,
                last_refill: now,
                window_start: now,
                window_success: 0,
                window_failure: 0,
                window_quota: 0,
                consecutive_quota: 0,
            }),
            quota_wall_threshold: config.quota_wall_threshold,
        }
    }

    /// Acquire one token, blocking until one is available or `deadline`
    /// elapses. Deadline expiry is a retryable [`RemoteError::Timeout`].
    pub async fn acquire(&self, deadline: Duration) -> Result<(), RemoteError> {
        let started = Instant::now();
        loop {
            let wait = {
                let mut state = self.state.lock().expect("limiter mutex poisoned");
                let now = Instant::now();
                state.refill(now);
                if state.tokens >= 1.0 {
                    state.tokens -= 1.0;
                    return Ok(());
                }
                // Seconds until the next whole token accrues.
                Duration::from_secs_f64((1.0 - state.tokens) * 60.0 / state.rate_per_min)
            };
            let elapsed = started.elapsed();
            if elapsed + wait > deadline {
                debug!(?deadline, "token acquisition deadline exceeded");
                return Err(RemoteError::Timeout(deadline));
            }
            tokio::time::sleep(wait).await;
        }
    }

    /// Record a successful remote call.
    pub fn record_success(&self) {
        let mut state = self.state.lock().expect("limiter mutex poisoned");
        state.window_success += 1;
        state.consecutive_quota = 0;
        state.maybe_adjust(Instant::now());
    }

    /// Record a failed remote call, feeding the adaptive window. Quota
    /// errors count separately and extend the consecutive-quota streak.
    pub fn record_failure(&self, error: &RemoteError) {
        let mut state = self.state.lock().expect("limiter mutex poisoned");
        if error.is_quota() {
            state.window_quota += 1;
            state.consecutive_quota += 1;
        } else {
            state.window_failure += 1;
            state.consecutive_quota = 0;
        }
        state.maybe_adjust(Instant::now());
    }

    /// True once the consecutive-quota streak has reached the wall threshold.
    pub fn quota_walled(&self) -> bool {
        let state = self.state.lock().expect("limiter mutex poisoned");
        self.quota_wall_threshold > 0 && state.consecutive_quota >= self.quota_wall_threshold
    }

    /// Current steady-state rate in tokens/minute.
    pub fn current_rate(&self) -> f64 {
        self.state.lock().expect("limiter mutex poisoned").rate_per_min
    }

    #[cfg(test)]
    fn force_window_elapsed(&self) {
        let mut state = self.state.lock().expect("limiter mutex poisoned");
        state.window_start = Instant::now() - ADJUST_WINDOW;
        state.maybe_adjust(Instant::now());
    }
}
