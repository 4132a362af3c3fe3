//! Bounded exponential backoff for deliveries that must not be dropped silently.

use std::future::Future;
use std::time::Duration;

use kdash_core::{KdashError, KdashResult};
use metrics::counter;
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub attempts: u32,
    pub base: Duration,
    pub factor: u32,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { attempts: 5, base: Duration::from_millis(250), factor: 2, max_delay: Duration::from_secs(2) }
    }
}

impl RetryPolicy {
    pub fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoff { current: self.base, base: self.base, factor: self.factor, max_delay: self.max_delay }
    }
}

/// Delay sequence `base, base*factor, base*factor^2, ...` capped at `max_delay`.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    current: Duration,
    base: Duration,
    factor: u32,
    max_delay: Duration,
}

impl ExponentialBackoff {
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current.min(self.max_delay);
        self.current = self.current.checked_mul(self.factor).unwrap_or(self.max_delay);
        delay
    }

    pub async fn wait(&mut self) {
        let delay = self.next_delay();
        tokio::time::sleep(delay).await
    }

    pub fn reset(&mut self) {
        self.current = self.base;
    }
}

/// Run `op` until it succeeds, fails with a non-retryable error, or `policy.attempts` is
/// exhausted. The last error is returned.
pub async fn retry<T, F, Fut>(policy: &RetryPolicy, what: &str, mut op: F) -> KdashResult<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = KdashResult<T>>,
{
    let attempts = policy.attempts.max(1);
    let mut backoff = policy.backoff();
    let mut last = KdashError::Internal(format!("{}: no attempt made", what));
    for attempt in 1..=attempts {
        match op(attempt).await {
            Ok(v) => return Ok(v),
            Err(e) if !e.is_retryable() => {
                warn!(what, attempt, error = %e, "attempt failed, not retrying");
                return Err(e);
            }
            Err(e) => {
                warn!(what, attempt, attempts, error = %e, "attempt failed");
                last = e;
            }
        }
        if attempt < attempts {
            counter!("kdash_bus_retries_total", 1, "what" => what.to_string());
            backoff.wait().await;
        }
    }
    Err(last)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn delays_grow_then_saturate() {
        let policy = RetryPolicy {
            attempts: 5,
            base: Duration::from_millis(100),
            factor: 2,
            max_delay: Duration::from_millis(350),
        };
        let mut b = policy.backoff();
        assert_eq!(b.next_delay(), Duration::from_millis(100));
        assert_eq!(b.next_delay(), Duration::from_millis(200));
        assert_eq!(b.next_delay(), Duration::from_millis(350));
        assert_eq!(b.next_delay(), Duration::from_millis(350));
        b.reset();
        assert_eq!(b.next_delay(), Duration::from_millis(100));
    }

    #[tokio::test]
    async fn retry_stops_at_first_success() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy { base: Duration::from_millis(1), ..Default::default() };
        let out = retry(&policy, "test", |attempt| {
            calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if attempt < 3 {
                    Err(KdashError::TransportUnavailable("down".into()))
                } else {
                    Ok(attempt)
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(out, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn retry_exhausts_attempts() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy { base: Duration::from_millis(1), ..Default::default() };
        let err = retry::<(), _, _>(&policy, "test", |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(KdashError::TransportUnavailable("down".into())) }
        })
        .await
        .unwrap_err();
        assert!(matches!(err, KdashError::TransportUnavailable(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn retry_gives_up_on_permanent_errors() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy { base: Duration::from_millis(1), ..Default::default() };
        let err = retry::<(), _, _>(&policy, "test", |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(KdashError::Validation("bad announcement".into())) }
        })
        .await
        .unwrap_err();
        assert!(matches!(err, KdashError::Validation(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
