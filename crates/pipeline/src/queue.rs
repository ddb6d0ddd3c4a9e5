//! Build queue: at most one build per fingerprint, a bounded number of
//! builds per data source.
//!
//! Callers enqueue a job under a key (the physical table name). A caller
//! asking for a key that is already queued or running joins that job and
//! receives its result; nothing is built twice. Jobs acquire one of
//! `concurrency` permits in submission order before they run.
//!
//! Waiting is bounded by `continue_wait_timeout`. A caller that runs out of
//! patience gets [`ErrorKind::ContinueWait`] while the build carries on; the
//! next caller for the same key joins it again.

use crate::error::{CorrelationId, Error, ErrorKind, Result, TimeoutKind};
use async_trait::async_trait;
use exn::ResultExt;
use futures::FutureExt;
use preagg_asyncutils::CancelToken;
use preagg_config::{Config, QueueConfig};
use std::collections::HashMap;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::pin::pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{Semaphore, watch};
use tokio_util::task::TaskTracker;

/// Runs the jobs of a [`BuildQueue`].
#[async_trait]
pub trait BuildHandler: Send + Sync + 'static {
    type Job: Send + Sync + 'static;
    /// Delivered to every caller waiting on the job.
    type Output: Clone + Send + Sync + 'static;

    /// Build `job`. Long-running steps must observe `ctx`; it fires when the
    /// job is canceled or runs into the execution timeout.
    async fn build(&self, job: &Self::Job, ctx: &CancelToken) -> Result<Self::Output>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueOptions {
    pub concurrency: usize,
    pub continue_wait_timeout: Duration,
    pub execution_timeout: Duration,
}
impl Default for QueueOptions {
    fn default() -> Self {
        Self::from(&QueueConfig::default())
    }
}
impl From<&QueueConfig> for QueueOptions {
    fn from(config: &QueueConfig) -> Self {
        Self {
            concurrency: config.concurrency,
            continue_wait_timeout: config.continue_wait_timeout.get(),
            execution_timeout: config.execution_timeout.get(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Waiting for a permit.
    Queued,
    Running,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobStatus {
    pub key: String,
    pub phase: Phase,
    /// Callers currently waiting on the result.
    pub waiters: usize,
}

enum JobState<T> {
    Queued,
    Running,
    Done(std::result::Result<T, ErrorKind>),
}
impl<T> JobState<T> {
    fn is_done(&self) -> bool {
        matches!(self, Self::Done(_))
    }
}

struct Job<T> {
    state: watch::Sender<JobState<T>>,
    ctx: CancelToken,
}

struct Inner<H: BuildHandler> {
    name: String,
    handler: Arc<H>,
    options: QueueOptions,
    permits: Arc<Semaphore>,
    jobs: Mutex<HashMap<String, Arc<Job<H::Output>>>>,
    tracker: TaskTracker,
}
impl<H: BuildHandler> Inner<H> {
    fn jobs(&self) -> MutexGuard<'_, HashMap<String, Arc<Job<H::Output>>>> {
        self.jobs.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

pub struct BuildQueue<H: BuildHandler> {
    inner: Arc<Inner<H>>,
}
impl<H: BuildHandler> Clone for BuildQueue<H> {
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone() }
    }
}
impl<H: BuildHandler> fmt::Debug for BuildQueue<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BuildQueue")
            .field("name", &self.inner.name)
            .field("options", &self.inner.options)
            .field("jobs", &self.inner.jobs().len())
            .finish()
    }
}

impl<H: BuildHandler> BuildQueue<H> {
    pub fn new(name: impl Into<String>, handler: Arc<H>, options: QueueOptions) -> Self {
        Self {
            inner: Arc::new(Inner {
                name: name.into(),
                handler,
                permits: Arc::new(Semaphore::new(options.concurrency.max(1))),
                options,
                jobs: Mutex::default(),
                tracker: TaskTracker::new(),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Enqueue `job` under `key`, or join the job already there, and wait
    /// for its result.
    ///
    /// Returns [`ErrorKind::ContinueWait`] if the job didn't finish within
    /// the continue-wait timeout.
    pub async fn enqueue(&self, key: &str, job: H::Job) -> Result<H::Output> {
        let mut rx = self.submit(key, job)?;
        let waited = tokio::time::timeout(self.inner.options.continue_wait_timeout, rx.wait_for(JobState::is_done)).await;
        let Ok(state) = waited else {
            tracing::debug!(queue = %self.inner.name, key, "Build still running");
            exn::bail!(ErrorKind::ContinueWait);
        };
        let state = state.or_raise(|| ErrorKind::Canceled)?;
        match &*state {
            JobState::Done(Ok(output)) => Ok(output.clone()),
            JobState::Done(Err(kind)) => Err(Error::from(kind.clone())),
            JobState::Queued | JobState::Running => exn::bail!(ErrorKind::Canceled),
        }
    }

    /// Enqueue `job` (or join the job already under `key`) without waiting.
    pub fn enqueue_detached(&self, key: &str, job: H::Job) -> Result<()> {
        self.submit(key, job).map(drop)
    }

    fn submit(&self, key: &str, job: H::Job) -> Result<watch::Receiver<JobState<H::Output>>> {
        let mut jobs = self.inner.jobs();
        if let Some(existing) = jobs.get(key) {
            tracing::debug!(queue = %self.inner.name, key, "Joined queued build");
            return Ok(existing.state.subscribe());
        }
        if self.inner.tracker.is_closed() {
            exn::bail!(ErrorKind::Canceled);
        }
        let (state, rx) = watch::channel(JobState::Queued);
        let entry = Arc::new(Job { state, ctx: CancelToken::new() });
        jobs.insert(key.to_string(), entry.clone());
        tracing::info!(queue = %self.inner.name, key, queued = jobs.len(), "Build job added");
        self.inner.tracker.spawn(run(self.inner.clone(), key.to_string(), entry, job));
        Ok(rx)
    }

    /// Cancel the job under `key`. Every waiter receives
    /// [`ErrorKind::Canceled`] once the build has cleaned up.
    ///
    /// Returns `false` if there was no such job.
    pub async fn cancel(&self, key: &str) -> bool {
        let ctx = self.inner.jobs().get(key).map(|job| job.ctx.clone());
        match ctx {
            Some(ctx) => {
                tracing::info!(queue = %self.inner.name, key, "Canceling build");
                ctx.cancel().await;
                true
            },
            None => false,
        }
    }

    /// Refuse new jobs, cancel every job and wait until all of them have
    /// finished cleaning up.
    pub async fn shutdown(&self) {
        self.inner.tracker.close();
        let running: Vec<CancelToken> = self.inner.jobs().values().map(|job| job.ctx.clone()).collect();
        tracing::info!(queue = %self.inner.name, jobs = running.len(), "Shutting down build queue");
        futures::future::join_all(running.iter().map(CancelToken::cancel)).await;
        self.inner.tracker.wait().await;
    }

    /// Snapshot of the queued and running jobs, ordered by key.
    pub fn status(&self) -> Vec<JobStatus> {
        let mut status: Vec<JobStatus> = self
            .inner
            .jobs()
            .iter()
            .filter_map(|(key, job)| {
                let phase = match &*job.state.borrow() {
                    JobState::Queued => Phase::Queued,
                    JobState::Running => Phase::Running,
                    JobState::Done(_) => return None,
                };
                Some(JobStatus {
                    key: key.clone(),
                    phase,
                    waiters: job.state.receiver_count(),
                })
            })
            .collect();
        status.sort_by(|a, b| a.key.cmp(&b.key));
        status
    }
}

async fn run<H: BuildHandler>(inner: Arc<Inner<H>>, key: String, entry: Arc<Job<H::Output>>, job: H::Job) {
    let result = execute(&inner, &entry, &job).await;
    match &result {
        Ok(_) => tracing::info!(queue = %inner.name, key = %key, "Build job finished"),
        Err(ErrorKind::User(message)) => tracing::info!(queue = %inner.name, key = %key, %message, "Build job rejected"),
        Err(kind) => tracing::warn!(queue = %inner.name, key = %key, error = %kind, "Build job failed"),
    }
    // Done is published before the job leaves the map.
    entry.state.send_replace(JobState::Done(result));
    let mut jobs = inner.jobs();
    if jobs.get(&key).is_some_and(|current| Arc::ptr_eq(current, &entry)) {
        jobs.remove(&key);
    }
}

async fn execute<H: BuildHandler>(
    inner: &Inner<H>,
    entry: &Job<H::Output>,
    job: &H::Job,
) -> std::result::Result<H::Output, ErrorKind> {
    let ctx = &entry.ctx;
    let Ok(Ok(_permit)) = ctx.run(inner.permits.clone().acquire_owned()).await else {
        return Err(ErrorKind::Canceled);
    };
    entry.state.send_replace(JobState::Running);

    let mut build = pin!(AssertUnwindSafe(inner.handler.build(job, ctx)).catch_unwind());
    let outcome = tokio::select! {
        outcome = &mut build => outcome,
        () = tokio::time::sleep(inner.options.execution_timeout) => {
            tracing::warn!(queue = %inner.name, timeout = ?inner.options.execution_timeout, "Build exceeded execution timeout");
            ctx.cancel().await;
            // Let the build release what it holds.
            let _ = build.await;
            return Err(ErrorKind::Timeout(TimeoutKind::Execution));
        },
    };
    match outcome {
        Ok(Ok(output)) => Ok(output),
        Ok(Err(_)) if ctx.is_canceled() => Err(ErrorKind::Canceled),
        Ok(Err(err)) => Err((*err).clone()),
        Err(panic) => {
            let id = CorrelationId::generate();
            let message = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_default();
            tracing::error!(queue = %inner.name, correlation_id = %id, panic = %message, "Build panicked");
            Err(ErrorKind::Unexpected(id))
        },
    }
}

/// One [`BuildQueue`] per data source, created on first use with that data
/// source's options.
pub struct QueueSet<H: BuildHandler> {
    handler: Arc<H>,
    config: Config,
    queues: Mutex<HashMap<String, BuildQueue<H>>>,
}

impl<H: BuildHandler> QueueSet<H> {
    pub fn new(handler: Arc<H>, config: Config) -> Self {
        Self {
            handler,
            config,
            queues: Mutex::default(),
        }
    }

    fn queues(&self) -> MutexGuard<'_, HashMap<String, BuildQueue<H>>> {
        self.queues.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn queue(&self, data_source: &str) -> BuildQueue<H> {
        self.queues()
            .entry(data_source.to_string())
            .or_insert_with(|| {
                let options = QueueOptions::from(&self.config.queue_for(data_source));
                tracing::debug!(data_source, ?options, "Created build queue");
                BuildQueue::new(data_source, self.handler.clone(), options)
            })
            .clone()
    }

    pub async fn shutdown(&self) {
        let queues: Vec<BuildQueue<H>> = self.queues().values().cloned().collect();
        futures::future::join_all(queues.iter().map(BuildQueue::shutdown)).await;
    }

    /// Status of every queue, keyed by data source.
    pub fn status(&self) -> Vec<(String, Vec<JobStatus>)> {
        let mut status: Vec<_> = self.queues().iter().map(|(name, queue)| (name.clone(), queue.status())).collect();
        status.sort_by(|a, b| a.0.cmp(&b.0));
        status
    }
}
