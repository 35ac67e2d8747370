//! Retry with exponential backoff for LM calls.
//!
//! Network, API, and parse failures all share one policy: up to two
//! extra attempts, 500 ms base delay doubling per attempt, ±20%
//! jitter. Retries never alter the request (in particular, never the
//! temperature).

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::warn;

use crate::error::LmResult;

/// Backoff policy for LM calls.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Extra attempts after the first failure
    pub max_retries: u32,

    /// Delay before the first retry
    pub base_delay: Duration,

    /// Multiplier applied per subsequent retry
    pub factor: u32,

    /// Jitter fraction; 0.2 means a uniform ±20%
    pub jitter: f32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay: Duration::from_millis(500),
            factor: 2,
            jitter: 0.2,
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries (for tests).
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Default::default()
        }
    }

    /// Jittered delay before retry number `attempt` (0-based).
    fn delay_for(&self, attempt: u32) -> Duration {
        let base = self.base_delay * self.factor.saturating_pow(attempt);
        let spread = rand::rng().random_range(1.0 - self.jitter..=1.0 + self.jitter);
        base.mul_f32(spread.max(0.0))
    }
}

/// Run `op` until it succeeds or the policy is exhausted.
pub async fn with_backoff<T, F, Fut>(policy: &RetryPolicy, label: &str, mut op: F) -> LmResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = LmResult<T>>,
{
    let mut attempt = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if attempt < policy.max_retries => {
                let delay = policy.delay_for(attempt);
                warn!(
                    stage = label,
                    attempt = attempt + 1,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "LM call failed, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::LmError;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test(start_paused = true)]
    async fn test_retries_then_succeeds() {
        let attempts = AtomicU32::new(0);
        let policy = RetryPolicy::default();

        let result = with_backoff(&policy, "test", || {
            let n = attempts.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(LmError::Network("boom".into()))
                } else {
                    Ok(42)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhaustion_returns_last_error() {
        let attempts = AtomicU32::new(0);
        let policy = RetryPolicy::default();

        let result: LmResult<()> = with_backoff(&policy, "test", || {
            attempts.fetch_add(1, Ordering::SeqCst);
            async { Err(LmError::Api("500".into())) }
        })
        .await;

        assert!(matches!(result, Err(LmError::Api(_))));
        // First attempt plus two retries.
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_delay_grows_with_jitter_bounds() {
        let policy = RetryPolicy::default();
        for attempt in 0..3 {
            let expected = 500u64 * 2u64.pow(attempt);
            let delay = policy.delay_for(attempt).as_millis() as u64;
            assert!(delay >= expected * 8 / 10, "attempt {attempt}: {delay}");
            assert!(delay <= expected * 12 / 10 + 1, "attempt {attempt}: {delay}");
        }
    }
}
