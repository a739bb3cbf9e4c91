//! Bounded retry with jittered backoff around transient storage errors.
//!
//! The Registry's Postgres/Redis backends surface transient failures
//! (connection resets, pool exhaustion under load) as `Error::severity()
//! == Hard`, but not every `Hard` error is worth retrying — a poisoned
//! consistency check should abort the tick, not be retried into a worse
//! state. Callers opt a specific call site in by wrapping it with
//! [`with_retry`]; everything else fails fast as before.

use std::future::Future;
use std::time::Duration;

use crate::types::{Error, Result};

/// Backoff schedule for a retried operation.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(50),
            max_delay: Duration::from_secs(2),
        }
    }
}

impl RetryPolicy {
    /// Delay before the given attempt (0-indexed), doubling each attempt
    /// and capped at `max_delay`, with up to 25% jitter so that a batch of
    /// callers retrying the same backend don't all wake up in lockstep.
    fn delay_for(&self, attempt: u32) -> Duration {
        let exp = self.base_delay.saturating_mul(1u32.checked_shl(attempt).unwrap_or(u32::MAX));
        let capped = exp.min(self.max_delay);
        let jitter_fraction = jitter_fraction(attempt);
        capped.mul_f64(1.0 - 0.25 * jitter_fraction)
    }
}

/// Deterministic pseudo-jitter in `[0, 1)` derived from the attempt number,
/// avoiding a dependency on `rand` for a single call site.
fn jitter_fraction(attempt: u32) -> f64 {
    let x = attempt.wrapping_mul(2654435761).wrapping_add(1);
    (x % 1000) as f64 / 1000.0
}

/// Whether a storage-layer error is worth retrying at all. Only the
/// backend-connectivity variants are transient; consistency, lock and
/// internal errors reflect a state the retry loop can't fix by waiting.
fn is_retryable(err: &Error) -> bool {
    matches!(err, Error::StorageBackend(_) | Error::Database(_) | Error::Redis(_))
}

/// Runs `op` up to `policy.max_attempts` times, sleeping a jittered
/// backoff between attempts, and logging each retried attempt at `warn`.
/// Returns the last error if every attempt is exhausted or the error
/// isn't retryable.
pub async fn with_retry<T, F, Fut>(policy: &RetryPolicy, label: &str, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if attempt + 1 < policy.max_attempts && is_retryable(&err) => {
                let delay = policy.delay_for(attempt);
                tracing::warn!(
                    operation = label,
                    attempt = attempt + 1,
                    max_attempts = policy.max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "retrying after transient storage error"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn succeeds_without_retry_when_first_attempt_works() {
        let policy = RetryPolicy::default();
        let calls = AtomicU32::new(0);

        let result = with_retry(&policy, "test-op", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Ok::<_, Error>(42) }
        })
        .await
        .unwrap();

        assert_eq!(result, 42);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn retries_transient_error_then_succeeds() {
        let policy = RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(10),
        };
        let calls = AtomicU32::new(0);

        let result = with_retry(&policy, "test-op", || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(Error::storage_backend("connection reset"))
                } else {
                    Ok(7)
                }
            }
        })
        .await
        .unwrap();

        assert_eq!(result, 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn gives_up_after_max_attempts() {
        let policy = RetryPolicy {
            max_attempts: 2,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
        };
        let calls = AtomicU32::new(0);

        let result: Result<()> = with_retry(&policy, "test-op", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(Error::storage_backend("still down")) }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn does_not_retry_non_transient_errors() {
        let policy = RetryPolicy::default();
        let calls = AtomicU32::new(0);

        let result: Result<()> = with_retry(&policy, "test-op", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(Error::consistency("stale version")) }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
