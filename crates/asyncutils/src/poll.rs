//! Bounded polling of asynchronously completing work.

use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollOptions {
    /// Delay after the first unsuccessful check.
    pub interval: Duration,
    /// Upper bound for the delay, which grows by 1.5x after every check.
    pub max_interval: Duration,
    /// Give up once this much time has passed since the first check.
    pub timeout: Duration,
}

impl Default for PollOptions {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
            max_interval: Duration::from_secs(10),
            timeout: Duration::from_secs(600),
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum PollError<E> {
    /// The check never yielded a value before the deadline.
    TimedOut(Duration),
    /// The check itself failed.
    Failed(E),
}

/// Call `check` until it returns `Ok(Some(_))`.
///
/// `Ok(None)` means "not done yet". Probe errors end polling immediately.
pub async fn poll<T, E, F, Fut>(options: &PollOptions, mut check: F) -> Result<T, PollError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Option<T>, E>>,
{
    let started = Instant::now();
    let mut interval = options.interval;
    loop {
        if let Some(value) = check().await.map_err(PollError::Failed)? {
            return Ok(value);
        }
        let elapsed = started.elapsed();
        if elapsed >= options.timeout {
            tracing::warn!(elapsed_ms = elapsed.as_millis() as u64, "Polling timed out");
            return Err(PollError::TimedOut(elapsed));
        }
        tokio::time::sleep(interval.min(options.timeout - elapsed)).await;
        interval = (interval * 3 / 2).min(options.max_interval);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::{Cell, RefCell};

    fn options() -> PollOptions {
        PollOptions {
            interval: Duration::from_millis(100),
            max_interval: Duration::from_millis(300),
            timeout: Duration::from_secs(2),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_returns_once_check_is_ready() {
        let calls = Cell::new(0);
        let result: Result<_, PollError<()>> = poll(&options(), || {
            calls.set(calls.get() + 1);
            let ready = calls.get() == 4;
            async move { Ok(ready.then_some("unloaded")) }
        })
        .await;
        assert_eq!(result, Ok("unloaded"));
        assert_eq!(calls.get(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_interval_grows_and_is_capped() {
        let seen = RefCell::new(Vec::new());
        let started = Instant::now();
        let _: Result<(), PollError<()>> = poll(&options(), || {
            seen.borrow_mut().push(started.elapsed());
            let done = seen.borrow().len() == 5;
            async move { Ok(done.then_some(())) }
        })
        .await;
        let seen = seen.into_inner();
        let gaps: Vec<_> = seen.windows(2).map(|w| w[1] - w[0]).collect();
        assert_eq!(gaps, vec![
            Duration::from_millis(100),
            Duration::from_millis(150),
            Duration::from_millis(225),
            Duration::from_millis(300),
        ]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_times_out_instead_of_hanging() {
        let result: Result<(), PollError<()>> = poll(&options(), || async { Ok(None) }).await;
        assert!(matches!(result, Err(PollError::TimedOut(elapsed)) if elapsed >= Duration::from_secs(2)));
    }

    #[tokio::test]
    async fn test_check_failure_stops_polling() {
        let calls = Cell::new(0);
        let result: Result<(), _> = poll(&options(), || {
            calls.set(calls.get() + 1);
            async { Err("job failed") }
        })
        .await;
        assert_eq!(result, Err(PollError::Failed("job failed")));
        assert_eq!(calls.get(), 1);
    }
}
