//! Retry with exponential backoff.

use backon::{BackoffBuilder, ExponentialBuilder, Retryable};
use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

/// How many times, and how patiently, to retry a failing operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first one. `0` is treated as `1`.
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    /// Run exactly once.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Delays double from `initial_backoff` up to `max_backoff`, one per retry.
    pub fn builder(&self) -> ExponentialBuilder {
        let retries = self.max_attempts.max(1) - 1;
        ExponentialBuilder::default()
            .with_min_delay(self.initial_backoff)
            .with_max_delay(self.max_backoff)
            .with_factor(2.0)
            .with_max_times(retries as usize)
    }

    /// The delays between attempts, in order.
    pub fn delays(&self) -> impl Iterator<Item = Duration> {
        self.builder().build()
    }
}

/// Run `op` until it succeeds, returns an error for which `is_retryable` is
/// false, or the policy runs out of attempts. The last error is returned
/// unchanged.
///
/// The operation receives the 1-based attempt number.
pub async fn retry<T, E, F, Fut, R>(policy: &RetryPolicy, is_retryable: R, mut op: F) -> Result<T, E>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    R: Fn(&E) -> bool,
{
    let max_attempts = policy.max_attempts.max(1);
    let attempt = AtomicU32::new(0);
    (|| op(attempt.fetch_add(1, Ordering::Relaxed) + 1))
        .retry(policy.builder())
        .when(|err: &E| is_retryable(err))
        .notify(|_: &E, delay: Duration| {
            tracing::warn!(
                attempt = attempt.load(Ordering::Relaxed),
                max_attempts,
                "Transient failure. Retrying in {:.1}s",
                delay.as_secs_f32()
            );
        })
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use std::cell::Cell;

    #[derive(Debug, PartialEq)]
    enum Failure {
        Flaky,
        Broken,
    }

    #[rstest]
    #[case::default(RetryPolicy::default(), &[100, 200])]
    #[case::capped(RetryPolicy { max_attempts: 8, ..RetryPolicy::default() }, &[100, 200, 400, 800, 1600, 3200, 5000])]
    #[case::none(RetryPolicy::none(), &[])]
    #[case::zero_attempts(RetryPolicy { max_attempts: 0, ..RetryPolicy::default() }, &[])]
    fn test_delays_double_and_cap(#[case] policy: RetryPolicy, #[case] expected_ms: &[u64]) {
        let delays: Vec<Duration> = policy.delays().collect();
        let expected: Vec<Duration> = expected_ms.iter().copied().map(Duration::from_millis).collect();
        assert_eq!(delays, expected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_until_success() {
        let calls = Cell::new(0);
        let result = retry(&RetryPolicy::default(), |e| *e == Failure::Flaky, |attempt| {
            calls.set(calls.get() + 1);
            async move { if attempt < 3 { Err(Failure::Flaky) } else { Ok(attempt) } }
        })
        .await;
        assert_eq!(result, Ok(3));
        assert_eq!(calls.get(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_after_max_attempts() {
        let calls = Cell::new(0);
        let result: Result<(), _> = retry(&RetryPolicy::default(), |_| true, |_| {
            calls.set(calls.get() + 1);
            async { Err(Failure::Flaky) }
        })
        .await;
        assert_eq!(result, Err(Failure::Flaky));
        assert_eq!(calls.get(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_retryable_error_is_returned_immediately() {
        let calls = Cell::new(0);
        let result: Result<(), _> = retry(&RetryPolicy::default(), |e| *e == Failure::Flaky, |_| {
            calls.set(calls.get() + 1);
            async { Err(Failure::Broken) }
        })
        .await;
        assert_eq!(result, Err(Failure::Broken));
        assert_eq!(calls.get(), 1);
    }

    #[tokio::test]
    async fn test_none_policy_runs_once() {
        let calls = Cell::new(0);
        let result: Result<(), _> = retry(&RetryPolicy::none(), |_| true, |_| {
            calls.set(calls.get() + 1);
            async { Err(Failure::Flaky) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.get(), 1);
    }
}
