//! Classified retry around remote calls.
//!
//! Wraps any operation producing a [`RemoteError`] classification. The
//! policy follows the error taxonomy: transport and timeout failures retry
//! with exponential backoff and ±25 % jitter, quota failures retry with the
//! backoff floored at 30 s and doubled jitter, syntactic and consistency
//! failures surface immediately. Every attempt acquires a token from the
//! shared [`RateLimiter`] first and reports its outcome back to it, so the
//! adaptive window sees everything.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::{debug, warn};

use crate::bridge::RemoteError;
use crate::config::RetryConfig;
use crate::limiter::RateLimiter;

/// Ceiling on any single backoff delay.
const MAX_DELAY: Duration = Duration::from_secs(300);

/// How long an attempt may block waiting for a rate-limiter token.
const ACQUIRE_DEADLINE: Duration = Duration::from_secs(600);

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base: Duration,
    pub quota_floor: Duration,
    pub timeout_base: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            base: Duration::from_millis(config.base_ms),
            quota_floor: Duration::from_secs(config.quota_floor_secs),
            timeout_base: Duration::from_millis(config.timeout_base_ms),
        }
    }

    /// Backoff before retrying `attempt` (0-based), jittered.
    pub fn backoff(&self, attempt: u32, error: &RemoteError) -> Duration {
        let exp = 2u64.saturating_pow(attempt.min(16));
        let (base, jitter_span) = match error {
            RemoteError::Quota(_) => {
                let raw = self.base.saturating_mul(exp as u32);
                (raw.max(self.quota_floor), 0.5)
            }
            RemoteError::Timeout(_) => (self.timeout_base.saturating_mul(exp as u32), 0.25),
            _ => (self.base.saturating_mul(exp as u32), 0.25),
        };
        let base = base.min(MAX_DELAY);
        let factor = rand::thread_rng().gen_range(1.0 - jitter_span..=1.0 + jitter_span);
        base.mul_f64(factor).min(MAX_DELAY)
    }
}

/// Run `op` through the retry policy, acquiring one limiter token per
/// attempt and recording every outcome. `what` labels log lines.
pub async fn call_remote<T, F, Fut>(
    policy: &RetryPolicy,
    limiter: &RateLimiter,
    what: &str,
    mut op: F,
) -> Result<T, RemoteError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, RemoteError>>,
{
    let mut last_err = None;
    for attempt in 0..policy.max_attempts {
        if let Err(e) = limiter.acquire(ACQUIRE_DEADLINE).await {
            warn!(what, attempt, "no rate-limiter token within deadline");
            last_err = Some(e);
            continue;
        }
        match op().await {
            Ok(value) => {
                limiter.record_success();
                return Ok(value);
            }
            Err(e) => {
                limiter.record_failure(&e);
                if !e.is_retryable() {
                    debug!(what, attempt, error = %e, "non-retryable failure");
                    return Err(e);
                }
                if attempt + 1 < policy.max_attempts {
                    let delay = policy.backoff(attempt, &e);
                    warn!(what, attempt, error = %e, ?delay, "retrying after backoff");
                    tokio::time::sleep(delay).await;
                }
                last_err = Some(e);
            }
        }
    }
    Err(last_err.unwrap_or_else(|| RemoteError::Transport("retries exhausted".into())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    use crate::config::RateConfig;

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 5,
            base: Duration::from_millis(10),
            quota_floor: Duration::from_secs(30),
            timeout_base: Duration::from_millis(20),
        }
    }

    fn limiter() -> RateLimiter {
        RateLimiter::new(&RateConfig::default())
    }

    #[tokio::test(start_paused = true)]
    async fn transient_blip_recovers() {
        let limiter = limiter();
        let attempts = AtomicU32::new(0);
        let result = call_remote(&policy(), &limiter, "describe", || {
            let n = attempts.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(RemoteError::Transport("connection reset".into()))
                } else {
                    Ok("described")
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), "described");
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn syntactic_fails_fast() {
        let limiter = limiter();
        let attempts = AtomicU32::new(0);
        let result: Result<(), _> = call_remote(&policy(), &limiter, "query", || {
            attempts.fetch_add(1, Ordering::SeqCst);
            async { Err(RemoteError::Syntactic("MALFORMED_QUERY".into())) }
        })
        .await;
        assert!(result.unwrap_err().is_syntactic());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn exhaustion_returns_last_error() {
        let limiter = limiter();
        let attempts = AtomicU32::new(0);
        let result: Result<(), _> = call_remote(&policy(), &limiter, "query", || {
            attempts.fetch_add(1, Ordering::SeqCst);
            async { Err(RemoteError::Transport("unreachable".into())) }
        })
        .await;
        assert!(matches!(result.unwrap_err(), RemoteError::Transport(_)));
        assert_eq!(attempts.load(Ordering::SeqCst), 5);
    }

    #[test]
    fn quota_backoff_floored() {
        let p = policy();
        for attempt in 0..3 {
            let delay = p.backoff(attempt, &RemoteError::Quota("limit".into()));
            // Floor 30 s, jitter ±50 %.
            assert!(delay >= Duration::from_secs(15), "delay {:?}", delay);
        }
    }

    #[test]
    fn timeout_backoff_larger_than_transport() {
        let p = RetryPolicy {
            max_attempts: 5,
            base: Duration::from_millis(100),
            quota_floor: Duration::from_secs(30),
            timeout_base: Duration::from_millis(400),
        };
        // Jitter is ±25 %, so the bounds below cannot overlap.
        let transport = p.backoff(0, &RemoteError::Transport("x".into()));
        let timeout = p.backoff(0, &RemoteError::Timeout(Duration::from_secs(1)));
        assert!(transport <= Duration::from_millis(125));
        assert!(timeout >= Duration::from_millis(300));
    }

    #[test]
    fn backoff_capped() {
        let p = policy();
        let delay = p.backoff(16, &RemoteError::Transport("x".into()));
        assert!(delay <= MAX_DELAY);
    }
}
