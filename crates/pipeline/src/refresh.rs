//! Refresh scheduling: deciding whether a pre-aggregation needs a build, and
//! handing the build to the queue of its data source.

use crate::MAX_REFRESH_CONCURRENCY;
use crate::descriptor::BuildDescriptor;
use crate::error::{CorrelationId, ErrorKind, Result};
use crate::mover::{BuildJob, BuildOutcome, DataMover, Drivers, MoverOptions};
use crate::queue::{BuildHandler, JobStatus, QueueSet};
use async_stream::stream;
use async_trait::async_trait;
use exn::OptionExt;
use futures::stream::FuturesUnordered;
use futures::{Stream, StreamExt};
use preagg_asyncutils::{CancelToken, RetryPolicy, retry};
use preagg_cache::{Database, Registry};
use preagg_config::{Config, InvalidationFailure, RefreshConfig};
use preagg_driver::error::Error as DriverError;
use preagg_driver::{DriverHandle, ReadOnlyDriver};
use preagg_version::{VersionEntry, content_version, structure_version, tables_to_version_entries};
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::Arc;
use time::OffsetDateTime;
use tracing::instrument;

/// Drivers by data source name, plus the external storage tier.
#[derive(Clone, Default)]
pub struct DataSources {
    sources: HashMap<String, DriverHandle>,
    external: Option<DriverHandle>,
}

impl DataSources {
    pub fn with_source(mut self, name: impl Into<String>, driver: DriverHandle) -> Self {
        self.sources.insert(name.into(), driver);
        self
    }

    pub fn with_external(mut self, driver: DriverHandle) -> Self {
        self.external = Some(driver);
        self
    }

    /// The drivers a build of `descriptor` reads from and writes into.
    pub fn drivers_for(&self, descriptor: &BuildDescriptor) -> Result<Drivers> {
        let source = self
            .sources
            .get(&descriptor.data_source)
            .cloned()
            .ok_or_raise(|| ErrorKind::Config(format!("unknown data source {:?}", descriptor.data_source)))?;
        let source: DriverHandle = match descriptor.read_only {
            true => Arc::new(ReadOnlyDriver::new(source)),
            false => source,
        };
        if !descriptor.external {
            return Ok(Drivers::local(source));
        }
        let target = self.external.clone().ok_or_raise(|| {
            ErrorKind::Config(format!("{} is external but no external driver is configured", descriptor.table_name))
        })?;
        Ok(Drivers::external(source, target))
    }

    /// Every distinct driver, the external one included.
    fn distinct(&self) -> Vec<DriverHandle> {
        let mut drivers: Vec<DriverHandle> = Vec::new();
        for driver in self.sources.values().chain(&self.external) {
            if !drivers.iter().any(|known| Arc::ptr_eq(known, driver)) {
                drivers.push(driver.clone());
            }
        }
        drivers
    }

    /// Release every driver once. Failures are logged, not returned.
    pub async fn release(&self) {
        let drivers = self.distinct();
        let released = futures::future::join_all(drivers.iter().map(|driver| driver.release())).await;
        for (driver, result) in drivers.iter().zip(released) {
            match result {
                Ok(()) => tracing::debug!(driver = driver.name(), "Released driver"),
                Err(err) => tracing::warn!(driver = driver.name(), error = ?err, "Unable to release driver"),
            }
        }
    }
}

/// Runs queued builds through the [`DataMover`].
pub struct BuildRunner {
    mover: DataMover,
}

#[async_trait]
impl BuildHandler for BuildRunner {
    type Job = BuildJob;
    type Output = BuildOutcome;

    async fn build(&self, job: &BuildJob, ctx: &CancelToken) -> Result<BuildOutcome> {
        self.mover.build(job, ctx).await
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RefreshOptions {
    /// Rebuild even if a table for the current fingerprint exists.
    pub force_build: bool,
    /// Wait for the rebuild instead of serving an older generation of the
    /// same structure.
    pub wait_for_renew: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RefreshOutcome {
    /// A table for the current fingerprint already exists.
    CacheHit { table: String },
    /// An older generation is served while `refreshing` builds in the
    /// background.
    Stale { served: String, refreshing: String },
    Built(BuildOutcome),
    /// The build is still running; nothing can be served yet.
    StillBuilding { target: String },
}
impl RefreshOutcome {
    /// The table readers should query, if any.
    pub fn table(&self) -> Option<&str> {
        match self {
            Self::CacheHit { table } => Some(table),
            Self::Stale { served, .. } => Some(served),
            Self::Built(outcome) => Some(&outcome.table),
            Self::StillBuilding { .. } => None,
        }
    }
}

/// Progress of [`RefreshScheduler::refresh_all()`].
///
/// `Started` comes first, then `Expanded` with the number of tables (every
/// partition counts), one `Refreshed` per table in completion order, and
/// `Complete` last. Failures of single tables are yielded as `Err` items
/// and don't end the stream.
#[derive(Debug)]
pub enum RefreshEvent {
    Started,
    Expanded(u64),
    Refreshed { table: String, outcome: RefreshOutcome },
    Complete,
}

pub struct RefreshScheduler {
    sources: DataSources,
    queues: QueueSet<BuildRunner>,
    registry: Registry,
    config: RefreshConfig,
    retry: RetryPolicy,
}

impl RefreshScheduler {
    pub fn new(config: &Config, sources: DataSources, registry: Registry) -> Self {
        let mover = DataMover::new(registry.clone(), MoverOptions::from(config));
        Self {
            sources,
            queues: QueueSet::new(Arc::new(BuildRunner { mover }), config.clone()),
            registry,
            config: config.refresh.clone(),
            retry: RetryPolicy::from(&config.mover.retry),
        }
    }

    /// Scheduler backed by the registry at [`Config::registry_path()`], or
    /// by an in-memory one when there is no data directory to put it in.
    pub async fn open(config: &Config, sources: DataSources) -> Result<Self> {
        let database = match config.registry_path() {
            Some(path) => Database::connect(&path).await,
            None => {
                tracing::warn!("No registry location; build history will not survive a restart");
                Database::connect_in_memory().await
            },
        };
        let database = database.map_err(ErrorKind::registry)?;
        Ok(Self::new(config, sources, Registry::from(&database)))
    }

    /// Bring the table of `descriptor` up to date.
    ///
    /// Partitioned descriptors are refreshed one partition at a time; see
    /// [`BuildDescriptor::partitions()`] and [`refresh_all()`](Self::refresh_all).
    #[instrument(name = "refresh", skip_all, fields(table = %descriptor.table_name, data_source = %descriptor.data_source))]
    pub async fn refresh(&self, descriptor: &BuildDescriptor, options: RefreshOptions) -> Result<RefreshOutcome> {
        descriptor.validate()?;
        if descriptor.partitioning.is_some() && descriptor.partition_range.is_none() {
            exn::bail!(ErrorKind::User(format!(
                "{} is partitioned; refresh its partitions instead",
                descriptor.table_name
            )));
        }
        let schema = descriptor
            .schema()
            .ok_or_raise(|| ErrorKind::User(format!("{} is not schema-qualified", descriptor.table_name)))?;
        let drivers = self.sources.drivers_for(descriptor)?;
        let ctx = CancelToken::new();

        let keys = self.invalidation_keys(descriptor, &drivers.source, &ctx).await?;
        let structure = structure_version(&descriptor.structure_key()).map_err(ErrorKind::version)?;
        let content = content_version(&descriptor.content_key(), &keys).map_err(ErrorKind::version)?;
        let now = drivers.target.now().await.map_err(ErrorKind::driver)?;
        let mut entry = VersionEntry::new(&descriptor.table_name, structure, content, now);
        entry.build_range_end = descriptor.build_range_end();
        let target = entry.target_table_name();
        tracing::debug!(physical = %target, "Computed fingerprint");

        let listing = self.retried(|_| drivers.target.get_tables_query(schema, &ctx)).await?;
        let known = self.registry.entries_for(&descriptor.table_name).await.map_err(ErrorKind::registry)?;
        let existing = tables_to_version_entries(&descriptor.table_name, &listing, &known);

        if !options.force_build && existing.iter().any(|e| e.fingerprint() == entry.fingerprint()) {
            tracing::debug!(physical = %target, "Pre-aggregation is up to date");
            self.lease(&target, Some(&target), now).await;
            return Ok(RefreshOutcome::CacheHit { table: target });
        }

        let queue = self.queues.queue(&descriptor.data_source);
        let job = BuildJob {
            descriptor: descriptor.clone(),
            entry,
            force: options.force_build,
            drivers,
        };
        let stale = existing
            .iter()
            .find(|e| e.structure_version == job.entry.structure_version)
            .filter(|_| !options.wait_for_renew && !options.force_build);
        if let Some(stale) = stale {
            let served = stale.target_table_name();
            tracing::warn!(%served, physical = %target, "Serving stale pre-aggregation while it refreshes");
            // Leased before the build starts, so its orphan collection keeps it.
            self.lease(&target, Some(&served), now).await;
            queue.enqueue_detached(&target, job)?;
            return Ok(RefreshOutcome::Stale { served, refreshing: target });
        }

        self.lease(&target, None, now).await;
        match queue.enqueue(&target, job).await {
            Ok(built) => {
                self.lease(&built.table, Some(&built.table), now).await;
                Ok(RefreshOutcome::Built(built))
            },
            Err(err) if matches!(&*err, ErrorKind::ContinueWait) => Ok(RefreshOutcome::StillBuilding { target }),
            Err(err) => Err(err),
        }
    }

    /// Refresh every descriptor (and every partition of the partitioned
    /// ones), up to [`MAX_REFRESH_CONCURRENCY`] at a time.
    pub fn refresh_all<'a>(
        &'a self,
        descriptors: &'a [BuildDescriptor],
        options: RefreshOptions,
    ) -> impl Stream<Item = Result<RefreshEvent>> + 'a {
        // `rustfmt` does not format macros that use braces. Wrap in parentheses!
        stream!({
            yield Ok(RefreshEvent::Started);

            let mut tables = Vec::new();
            for descriptor in descriptors {
                match descriptor.partitions() {
                    Ok(partitions) => tables.extend(partitions),
                    Err(err) => {
                        yield Err(err);
                    },
                }
            }
            yield Ok(RefreshEvent::Expanded(u64::try_from(tables.len()).unwrap_or(u64::MAX)));

            let mut futures: Vec<_> = tables.into_iter().map(|descriptor| self.refresh_owned(descriptor, options)).collect();
            let mut processing = FuturesUnordered::new();
            processing.extend(futures.drain(..MAX_REFRESH_CONCURRENCY.min(futures.len())));
            while let Some(result) = processing.next().await {
                yield result.map(|(table, outcome)| RefreshEvent::Refreshed { table, outcome });
                // FIFO refill.
                if !futures.is_empty() {
                    processing.push(futures.remove(0));
                }
            }

            yield Ok(RefreshEvent::Complete);
        })
    }

    async fn refresh_owned(&self, descriptor: BuildDescriptor, options: RefreshOptions) -> Result<(String, RefreshOutcome)> {
        let outcome = self.refresh(&descriptor, options).await?;
        Ok((descriptor.table_name, outcome))
    }

    /// Build queue status per data source.
    pub fn status(&self) -> Vec<(String, Vec<JobStatus>)> {
        self.queues.status()
    }

    /// Cancel every build, wait for their cleanup, then release the drivers.
    pub async fn shutdown(&self) {
        self.queues.shutdown().await;
        self.sources.release().await;
    }

    async fn retried<T, F, Fut>(&self, op: F) -> Result<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = preagg_driver::error::Result<T>>,
    {
        retry(&self.retry, |err: &DriverError| err.is_retryable(), op)
            .await
            .map_err(ErrorKind::driver)
    }

    /// Results of the refresh key queries, hashed into the content version.
    async fn invalidation_keys(&self, descriptor: &BuildDescriptor, source: &DriverHandle, ctx: &CancelToken) -> Result<Value> {
        let mut keys = Vec::new();
        for query in descriptor.invalidation_queries() {
            let rows = retry(&self.retry, |err: &DriverError| err.is_retryable(), |_| source.query(&query, ctx)).await;
            match rows {
                Ok(rows) => keys.push(json!(rows)),
                Err(err) => {
                    let id = CorrelationId::generate();
                    match self.config.invalidation_failure {
                        InvalidationFailure::Fail => {
                            tracing::error!(correlation_id = %id, error = ?err, sql = %query.sql, "Refresh key query failed");
                            return Err(err.raise(ErrorKind::Invalidation(id)));
                        },
                        InvalidationFailure::AssumeStale => {
                            tracing::warn!(correlation_id = %id, error = ?err, sql = %query.sql, "Refresh key query failed, assuming stale");
                            keys.push(json!({ "unavailable": id.to_string() }));
                        },
                    }
                },
            }
        }
        Ok(Value::Array(keys))
    }

    /// Touch `target` and mark `served` as used. Lease bookkeeping never
    /// fails a refresh.
    async fn lease(&self, target: &str, served: Option<&str>, now: OffsetDateTime) {
        let touched = self.registry.touch(target, now + self.config.touch_table_ttl.get()).await;
        let used = match served {
            Some(served) => self.registry.mark_used(served, now + self.config.used_table_ttl.get()).await,
            None => Ok(()),
        };
        if let Err(err) = touched.and(used) {
            tracing::warn!(error = ?err, physical = target, "Unable to record table lease");
        }
    }
}
