//! Cancellation combinator.
//!
//! A [`CancelToken`] is created per build and cloned into every step of it.
//! Each step that talks to a driver may [`register`](CancelToken::register)
//! a hook (e.g. "kill the running query on the server") and keeps the
//! returned [`HookGuard`] alive for as long as the step is in flight. Once the
//! step completes the guard is dropped and its hook will never run.
//!
//! Cancelling the token runs every hook that is still registered, all at
//! once, and wakes every future wrapped with [`run()`](CancelToken::run).

use derive_more::{Display, Error};
use futures::future::{BoxFuture, join_all};
use pin_project_lite::pin_project;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};

type CancelHook = Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send>;

/// The operation was interrupted because its [`CancelToken`] fired.
#[derive(Debug, Display, Error, Clone, Copy, PartialEq, Eq)]
#[display("operation was canceled")]
pub struct Canceled;

#[derive(Default)]
struct Hooks {
    next_id: u64,
    pending: Vec<(u64, CancelHook)>,
    /// Set once [`CancelToken::cancel`] has taken the pending hooks.
    fired: bool,
}

#[derive(Default)]
struct Inner {
    token: CancellationToken,
    hooks: Mutex<Hooks>,
}
impl Inner {
    fn hooks(&self) -> MutexGuard<'_, Hooks> {
        // Hooks are plain data; a panic while holding the lock can't leave
        // them half-updated in a way that matters.
        self.hooks.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Cancellation context for one logical operation (usually one build).
///
/// Cloning is cheap and every clone observes the same cancellation.
///
/// # Examples
///
/// ```
/// use preagg_asyncutils::{CancelToken, Canceled};
/// use std::sync::Arc;
/// use std::sync::atomic::{AtomicBool, Ordering};
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let token = CancelToken::new();
/// let killed = Arc::new(AtomicBool::new(false));
///
/// let flag = killed.clone();
/// let _guard = token.register(move || async move { flag.store(true, Ordering::SeqCst) });
///
/// token.cancel().await;
/// assert!(killed.load(Ordering::SeqCst));
/// assert_eq!(token.run(async { 42 }).await, Err(Canceled));
/// # }
/// ```
#[derive(Clone, Default)]
pub struct CancelToken {
    inner: Arc<Inner>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a hook to run if this token is cancelled while the returned
    /// guard is alive.
    ///
    /// If cancellation has already started the hook is discarded; the
    /// operation it belongs to will be interrupted by [`run()`](Self::run)
    /// before it gets anywhere.
    pub fn register<F, Fut>(&self, hook: F) -> HookGuard
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut hooks = self.inner.hooks();
        if hooks.fired {
            return HookGuard { id: None, inner: self.inner.clone() };
        }
        let id = hooks.next_id;
        hooks.next_id += 1;
        hooks.pending.push((id, Box::new(move || Box::pin(hook()))));
        HookGuard { id: Some(id), inner: self.inner.clone() }
    }

    /// Cancel the operation.
    ///
    /// The first call wakes every future wrapped in [`run()`](Self::run), then
    /// runs all registered hooks concurrently and waits for them. Later calls
    /// return immediately.
    pub async fn cancel(&self) {
        let hooks = {
            let mut hooks = self.inner.hooks();
            if hooks.fired {
                return;
            }
            hooks.fired = true;
            std::mem::take(&mut hooks.pending)
        };
        self.inner.token.cancel();
        if !hooks.is_empty() {
            tracing::debug!(hooks = hooks.len(), "Running cancel hooks");
            join_all(hooks.into_iter().map(|(_, hook)| hook())).await;
        }
    }

    pub fn is_canceled(&self) -> bool {
        self.inner.token.is_cancelled()
    }

    /// Resolves once the token has been cancelled.
    pub fn cancelled(&self) -> WaitForCancellationFuture<'_> {
        self.inner.token.cancelled()
    }

    /// Race `future` against cancellation of this token.
    ///
    /// Cancellation wins ties: an already-cancelled token never polls the
    /// wrapped future.
    pub fn run<F: Future>(&self, future: F) -> Cancelable<'_, F> {
        Cancelable {
            future,
            cancelled: self.inner.token.cancelled(),
        }
    }

    /// [`register()`](Self::register) a hook for the lifetime of `future`
    /// and [`run()`](Self::run) it.
    pub async fn save<F, H, HF>(&self, future: F, hook: H) -> Result<F::Output, Canceled>
    where
        F: Future,
        H: FnOnce() -> HF + Send + 'static,
        HF: Future<Output = ()> + Send + 'static,
    {
        let _guard = self.register(hook);
        self.run(future).await
    }

    /// Sleep for `duration` unless cancelled first.
    pub async fn sleep(&self, duration: Duration) -> Result<(), Canceled> {
        self.run(tokio::time::sleep(duration)).await
    }
}

impl fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancelToken")
            .field("canceled", &self.is_canceled())
            .field("hooks", &self.inner.hooks().pending.len())
            .finish()
    }
}

/// Keeps a cancel hook registered. Dropping it deregisters the hook.
#[must_use = "the hook is deregistered as soon as the guard is dropped"]
pub struct HookGuard {
    id: Option<u64>,
    inner: Arc<Inner>,
}

impl Drop for HookGuard {
    fn drop(&mut self) {
        if let Some(id) = self.id {
            self.inner.hooks().pending.retain(|(pending, _)| *pending != id);
        }
    }
}

pin_project! {
    /// Future returned by [`CancelToken::run`].
    #[must_use = "futures do nothing unless polled"]
    pub struct Cancelable<'a, F> {
        #[pin]
        future: F,
        #[pin]
        cancelled: WaitForCancellationFuture<'a>,
    }
}

impl<F: Future> Future for Cancelable<'_, F> {
    type Output = Result<F::Output, Canceled>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.project();
        if this.cancelled.poll(cx).is_ready() {
            return Poll::Ready(Err(Canceled));
        }
        this.future.poll(cx).map(Ok)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting_hook(counter: &Arc<AtomicUsize>) -> impl FnOnce() -> BoxFuture<'static, ()> + Send + 'static {
        let counter = counter.clone();
        move || {
            Box::pin(async move {
                counter.fetch_add(1, Ordering::SeqCst);
            })
        }
    }

    #[tokio::test]
    async fn test_cancel_runs_every_registered_hook() {
        let token = CancelToken::new();
        let counter = Arc::new(AtomicUsize::new(0));
        let _a = token.register(counting_hook(&counter));
        let _b = token.register(counting_hook(&counter));
        let _c = token.register(counting_hook(&counter));
        token.cancel().await;
        assert_eq!(counter.load(Ordering::SeqCst), 3);
        assert!(token.is_canceled());
    }

    #[tokio::test]
    async fn test_dropped_guard_makes_cancel_a_no_op_for_that_hook() {
        let token = CancelToken::new();
        let counter = Arc::new(AtomicUsize::new(0));
        let finished = token.register(counting_hook(&counter));
        let _running = token.register(counting_hook(&counter));
        drop(finished);
        token.cancel().await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cancel_is_idempotent() {
        let token = CancelToken::new();
        let counter = Arc::new(AtomicUsize::new(0));
        let _guard = token.register(counting_hook(&counter));
        token.cancel().await;
        token.cancel().await;
        token.clone().cancel().await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_hooks_registered_after_cancel_never_run() {
        let token = CancelToken::new();
        token.cancel().await;
        let counter = Arc::new(AtomicUsize::new(0));
        let guard = token.register(counting_hook(&counter));
        drop(guard);
        token.cancel().await;
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_run_completes_when_not_cancelled() {
        let token = CancelToken::new();
        assert_eq!(token.run(async { "done" }).await, Ok("done"));
    }

    #[tokio::test]
    async fn test_run_is_interrupted_by_cancel_from_another_task() {
        let token = CancelToken::new();
        let remote = token.clone();
        let pending = tokio::spawn(async move { remote.run(futures::future::pending::<()>()).await });
        tokio::task::yield_now().await;
        token.cancel().await;
        assert_eq!(pending.await.unwrap(), Err(Canceled));
    }

    #[tokio::test]
    async fn test_save_deregisters_after_completion() {
        let token = CancelToken::new();
        let counter = Arc::new(AtomicUsize::new(0));
        let result = token.save(async { 7 }, counting_hook(&counter)).await;
        assert_eq!(result, Ok(7));
        token.cancel().await;
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_save_runs_hook_for_in_flight_step() {
        let token = CancelToken::new();
        let counter = Arc::new(AtomicUsize::new(0));
        let remote = token.clone();
        let hook = counting_hook(&counter);
        let step = tokio::spawn(async move { remote.save(futures::future::pending::<()>(), hook).await });
        tokio::task::yield_now().await;
        token.cancel().await;
        assert_eq!(step.await.unwrap(), Err(Canceled));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sleep_returns_early_on_cancel() {
        let token = CancelToken::new();
        let remote = token.clone();
        let sleeper = tokio::spawn(async move { remote.sleep(Duration::from_secs(3600)).await });
        tokio::task::yield_now().await;
        token.cancel().await;
        assert_eq!(sleeper.await.unwrap(), Err(Canceled));
    }
}
