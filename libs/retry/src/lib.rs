//! Bounded retry and polling primitives.
//!
//! Every long-running remote interaction in the harness (provisioning jobs,
//! bootstrap sentinels, cancellation convergence, health checks, transport
//! reconnects) is bounded by an explicit number of attempts separated by a
//! fixed delay. There are no wall-clock deadlines.
//!
//! # Invariants
//!
//! - An operation is attempted at most `max_attempts` times
//! - No sleep happens after the final attempt
//! - Errors the caller marks as non-retryable are returned immediately

use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, warn};

/// Attempt bound and fixed delay for a retry or poll loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Maximum number of attempts (values below 1 are treated as 1).
    pub max_attempts: u32,

    /// Delay between consecutive attempts.
    pub delay: Duration,
}

impl RetryPolicy {
    /// Create a policy with a fixed delay between attempts.
    pub const fn new(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            delay,
        }
    }

    /// Upper bound on the time spent sleeping between attempts.
    pub fn max_wait(&self) -> Duration {
        self.delay * self.attempts().saturating_sub(1)
    }

    fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }
}

/// Outcome of a single poll check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Poll<T> {
    /// The awaited condition holds.
    Ready(T),

    /// Not there yet; check again after the policy delay.
    Pending,
}

/// Errors from [`poll_until`].
#[derive(Debug, Error)]
pub enum PollError<E> {
    /// The condition did not hold within the attempt bound.
    #[error("{operation} did not complete after {attempts} attempts")]
    Exhausted { operation: String, attempts: u32 },

    /// The check itself reported a terminal failure.
    #[error("{0}")]
    Failed(E),
}

/// Run `operation` until it succeeds, the error is not retryable, or the
/// policy is exhausted. Returns the last error on exhaustion.
pub async fn retry<F, Fut, T, E, P>(
    policy: &RetryPolicy,
    operation_name: &str,
    should_retry: P,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    P: Fn(&E) -> bool,
    E: std::fmt::Display,
{
    let max_attempts = policy.attempts();
    let mut attempt = 0u32;

    loop {
        attempt += 1;

        match operation().await {
            Ok(value) => return Ok(value),
            Err(e) if !should_retry(&e) => {
                debug!(
                    operation = %operation_name,
                    attempt,
                    error = %e,
                    "Operation failed with non-retryable error"
                );
                return Err(e);
            }
            Err(e) if attempt >= max_attempts => {
                warn!(
                    operation = %operation_name,
                    attempt,
                    error = %e,
                    "Operation failed after max attempts"
                );
                return Err(e);
            }
            Err(e) => {
                warn!(
                    operation = %operation_name,
                    attempt,
                    max_attempts,
                    error = %e,
                    delay_ms = policy.delay.as_millis() as u64,
                    "Operation failed, retrying"
                );
                tokio::time::sleep(policy.delay).await;
            }
        }
    }
}

/// Poll `check` until it reports [`Poll::Ready`], fails, or the policy is
/// exhausted.
pub async fn poll_until<F, Fut, T, E>(
    policy: &RetryPolicy,
    operation_name: &str,
    mut check: F,
) -> Result<T, PollError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Poll<T>, E>>,
{
    let max_attempts = policy.attempts();

    for attempt in 1..=max_attempts {
        match check().await {
            Ok(Poll::Ready(value)) => return Ok(value),
            Ok(Poll::Pending) => {
                debug!(
                    operation = %operation_name,
                    attempt,
                    max_attempts,
                    "Condition not met yet"
                );
            }
            Err(e) => return Err(PollError::Failed(e)),
        }

        if attempt < max_attempts {
            tokio::time::sleep(policy.delay).await;
        }
    }

    warn!(
        operation = %operation_name,
        attempts = max_attempts,
        "Polling bound exhausted"
    );

    Err(PollError::Exhausted {
        operation: operation_name.to_string(),
        attempts: max_attempts,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn fast(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::new(max_attempts, Duration::from_millis(1))
    }

    #[tokio::test]
    async fn test_retry_succeeds_immediately() {
        let result: Result<i32, &str> = retry(&fast(3), "op", |_| true, || async { Ok(7) }).await;
        assert_eq!(result, Ok(7));
    }

    #[tokio::test]
    async fn test_retry_succeeds_after_failures() {
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();

        let result: Result<i32, &str> = retry(
            &fast(5),
            "op",
            |_| true,
            || {
                let c = c.clone();
                async move {
                    if c.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err("transient")
                    } else {
                        Ok(42)
                    }
                }
            },
        )
        .await;

        assert_eq!(result, Ok(42));
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_exhausts_and_returns_last_error() {
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();

        let result: Result<(), String> = retry(
            &fast(3),
            "op",
            |_| true,
            || {
                let c = c.clone();
                async move {
                    let n = c.fetch_add(1, Ordering::SeqCst);
                    Err(format!("failure {n}"))
                }
            },
        )
        .await;

        assert_eq!(result, Err("failure 2".to_string()));
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_stops_on_non_retryable() {
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();

        let result: Result<(), &str> = retry(
            &fast(10),
            "op",
            |e: &&str| *e != "fatal",
            || {
                let c = c.clone();
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Err("fatal")
                }
            },
        )
        .await;

        assert_eq!(result, Err("fatal"));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_zero_attempts_still_runs_once() {
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();

        let _: Result<(), &str> = retry(&fast(0), "op", |_| true, || {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Err("nope")
            }
        })
        .await;

        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_poll_until_ready() {
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();

        let result: Result<&str, PollError<()>> = poll_until(&fast(5), "poll", || {
            let c = c.clone();
            async move {
                if c.fetch_add(1, Ordering::SeqCst) < 3 {
                    Ok(Poll::Pending)
                } else {
                    Ok(Poll::Ready("done"))
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), "done");
        assert_eq!(count.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_poll_until_exhausted() {
        let result: Result<(), PollError<()>> =
            poll_until(&fast(4), "never", || async { Ok(Poll::Pending) }).await;

        match result {
            Err(PollError::Exhausted {
                operation,
                attempts,
            }) => {
                assert_eq!(operation, "never");
                assert_eq!(attempts, 4);
            }
            other => panic!("expected exhaustion, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_poll_until_failure_propagates_immediately() {
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();

        let result: Result<(), PollError<&str>> = poll_until(&fast(10), "poll", || {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Err("broken")
            }
        })
        .await;

        assert!(matches!(result, Err(PollError::Failed("broken"))));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_sleeps_only_between_attempts() {
        let start = tokio::time::Instant::now();
        let policy = RetryPolicy::new(3, Duration::from_secs(10));

        let _: Result<(), PollError<()>> =
            poll_until(&policy, "paused", || async { Ok(Poll::Pending) }).await;

        assert_eq!(start.elapsed(), Duration::from_secs(20));
        assert_eq!(policy.max_wait(), Duration::from_secs(20));
    }
}
