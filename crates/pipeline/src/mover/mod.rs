//! Moving data from a source driver into the table a build produces.
//!
//! A build picks one [`Strategy`] from the capabilities of its drivers, runs
//! it, records the result in the registry, then collects orphaned
//! generations of the same table.
//!
//! Intermediate artifacts are released on every exit path:
//! - temp tables built on the source are dropped exactly once, after the
//!   copy finished or failed (unless the strategy is a streaming source the
//!   target reads lazily),
//! - downloaded data (spill files, open streams) is released exactly once,
//!   right after the upload,
//! - a partially created target table is dropped when the upload fails.
//!
//! Cleanup after cancellation runs with a fresh token, so it isn't
//! interrupted by the very cancellation it's cleaning up after.

mod orphans;
mod strategy;

pub use self::orphans::RetentionOptions;
pub use self::strategy::{Situation, Strategy, Transfer, select};
use crate::descriptor::BuildDescriptor;
use crate::error::{ErrorKind, Result};
use exn::OptionExt;
use preagg_asyncutils::{CancelToken, RetryPolicy, retry};
use preagg_cache::Registry;
use preagg_config::Config;
use preagg_driver::error::{Error as DriverError, Result as DriverResult};
use preagg_driver::{
    DownloadOptions, DriverHandle, QueryWithParams, StreamOptions, StreamingSource, TableData, UnloadOptions,
    UnloadSource, spill_to_csv, split_table_name,
};
use preagg_version::VersionEntry;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::instrument;

#[derive(Debug, Clone, Default)]
pub struct MoverOptions {
    pub retry: RetryPolicy,
    pub unload: UnloadOptions,
    pub stream: StreamOptions,
    pub retention: RetentionOptions,
}
impl From<&Config> for MoverOptions {
    fn from(config: &Config) -> Self {
        Self {
            retry: RetryPolicy::from(&config.mover.retry),
            unload: UnloadOptions { max_file_size_mb: config.mover.max_file_size_mb },
            stream: StreamOptions { high_water_mark: config.mover.high_water_mark },
            retention: RetentionOptions::from(&config.refresh),
        }
    }
}

/// The drivers one build reads from and writes into.
#[derive(Clone)]
pub struct Drivers {
    pub source: DriverHandle,
    /// Where the table ends up: the external storage tier, or the source
    /// itself.
    pub target: DriverHandle,
}
impl Drivers {
    pub fn local(source: DriverHandle) -> Self {
        Self { target: source.clone(), source }
    }

    pub fn external(source: DriverHandle, target: DriverHandle) -> Self {
        Self { source, target }
    }
}
impl fmt::Debug for Drivers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Drivers")
            .field("source", &self.source.name())
            .field("target", &self.target.name())
            .finish()
    }
}

/// One unit of work for the build queue.
#[derive(Debug, Clone)]
pub struct BuildJob {
    pub descriptor: BuildDescriptor,
    /// Fingerprint of the table to build.
    pub entry: VersionEntry,
    /// Rebuild even if the table already exists.
    pub force: bool,
    pub drivers: Drivers,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BuildOutcome {
    /// The recorded entry, stamped with the build time.
    pub entry: VersionEntry,
    /// Physical table name.
    pub table: String,
    /// `None` when the table already existed and nothing was built.
    pub strategy: Option<Strategy>,
    /// Orphaned generations dropped after the build.
    pub dropped: Vec<String>,
}

pub struct DataMover {
    registry: Registry,
    options: MoverOptions,
    /// Serializes orphan collection per target and logical table.
    gc_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    /// `(target driver, physical table)` of every build still running.
    building: Mutex<HashSet<(String, String)>>,
}

/// Marks a physical table as being built until dropped.
struct Building<'a> {
    set: &'a Mutex<HashSet<(String, String)>>,
    key: (String, String),
}
impl Drop for Building<'_> {
    fn drop(&mut self) {
        self.set.lock().unwrap_or_else(PoisonError::into_inner).remove(&self.key);
    }
}

impl DataMover {
    pub fn new(registry: Registry, options: MoverOptions) -> Self {
        Self {
            registry,
            options,
            gc_locks: Mutex::default(),
            building: Mutex::default(),
        }
    }

    fn start_building(&self, target: &DriverHandle, physical: &str) -> Building<'_> {
        let key = (target.name().to_string(), physical.to_string());
        self.building.lock().unwrap_or_else(PoisonError::into_inner).insert(key.clone());
        Building { set: &self.building, key }
    }

    /// Physical tables still being built into `target`.
    fn building_into(&self, target: &DriverHandle) -> Vec<String> {
        let building = self.building.lock().unwrap_or_else(PoisonError::into_inner);
        building
            .iter()
            .filter(|(driver, _)| driver == target.name())
            .map(|(_, physical)| physical.clone())
            .collect()
    }

    pub fn options(&self) -> &MoverOptions {
        &self.options
    }

    /// Run a driver call, retrying transient failures.
    async fn retried<T, F, Fut>(&self, op: F) -> Result<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = DriverResult<T>>,
    {
        retry(&self.options.retry, |err: &DriverError| err.is_retryable(), op)
            .await
            .map_err(ErrorKind::driver)
    }

    /// Build the table of `job` (unless it already exists) and record it.
    #[instrument(name = "build", skip_all, fields(table = %job.entry.target_table_name(), data_source = %job.descriptor.data_source))]
    pub async fn build(&self, job: &BuildJob, ctx: &CancelToken) -> Result<BuildOutcome> {
        let BuildJob { descriptor, entry, force, drivers } = job;
        let physical = entry.target_table_name();
        let schema = descriptor
            .schema()
            .ok_or_raise(|| ErrorKind::User(format!("{} is not schema-qualified", descriptor.table_name)))?;
        let _building = self.start_building(&drivers.target, &physical);

        let listing = self.retried(|_| drivers.target.get_tables_query(schema, ctx)).await?;
        let (_, name) = split_table_name(&physical);
        let mut strategy = None;
        if listing.iter().any(|table| table == name) && !force {
            tracing::info!("Table already built");
        } else {
            if listing.iter().any(|table| table == name) {
                tracing::info!("Dropping existing table for forced rebuild");
                self.retried(|_| drivers.target.drop_table(&physical, ctx)).await?;
            }
            let unload_supported = self.retried(|_| drivers.source.is_unload_supported(&self.options.unload)).await?;
            let selected = select(&Situation::new(descriptor, &*drivers.source, &*drivers.target, unload_supported));
            tracing::info!(strategy = %selected, "Build started");
            match selected {
                Strategy::InPlace => self.build_in_place(job, schema, &physical, ctx).await?,
                Strategy::Transfer { via, temp_table } => {
                    self.transfer(job, Some(via), temp_table, schema, &physical, ctx).await?
                },
                Strategy::StreamingSource { temp_table } => {
                    self.transfer(job, None, temp_table, schema, &physical, ctx).await?
                },
            }
            strategy = Some(selected);
        }

        let mut built = entry.clone();
        built.last_updated_at = drivers.target.now().await.map_err(ErrorKind::driver)?;
        if built.build_range_end.is_none() {
            built.build_range_end = descriptor.build_range_end();
        }
        self.registry.record(&built).await.map_err(ErrorKind::registry)?;
        if strategy.is_some() {
            tracing::info!("Build completed");
        }

        let dropped = self.collect_orphans(&drivers.target, &built, ctx).await;
        Ok(BuildOutcome {
            entry: built,
            table: physical,
            strategy,
            dropped,
        })
    }

    async fn build_in_place(&self, job: &BuildJob, schema: &str, physical: &str, ctx: &CancelToken) -> Result<()> {
        let source = &job.drivers.source;
        self.retried(|_| source.create_schema_if_not_exists(schema, ctx)).await?;
        let load = job.descriptor.load_query(physical);
        let built: Result<()> = async {
            self.retried(|_| source.load_pre_aggregation_into_table(physical, &load, ctx)).await?;
            for index in job.descriptor.index_queries(physical) {
                source.query(&index, ctx).await.map_err(ErrorKind::driver)?;
            }
            Ok(())
        }
        .await;
        if built.is_err() {
            self.drop_if_listed(source, schema, physical, ctx).await;
        }
        built
    }

    /// Copy the rows into the target, building a temp table first if asked.
    ///
    /// `via` is `None` for the streaming source strategy.
    async fn transfer(
        &self,
        job: &BuildJob,
        via: Option<Transfer>,
        temp_table: bool,
        schema: &str,
        physical: &str,
        ctx: &CancelToken,
    ) -> Result<()> {
        let source = &job.drivers.source;
        let copied: Result<()> = async {
            if temp_table {
                self.retried(|_| source.create_schema_if_not_exists(schema, ctx)).await?;
                let load = job.descriptor.load_query(physical);
                self.retried(|_| source.load_pre_aggregation_into_table(physical, &load, ctx)).await?;
            }
            let data = self.extract(job, via, temp_table, physical, ctx).await?;
            self.upload(job, data, schema, physical, ctx).await
        }
        .await;
        // A streaming source target keeps reading from the temp table.
        if temp_table && via.is_some() {
            self.drop_if_listed(source, schema, physical, ctx).await;
        }
        copied
    }

    /// Get the rows out of the source.
    async fn extract(
        &self,
        job: &BuildJob,
        via: Option<Transfer>,
        temp_table: bool,
        physical: &str,
        ctx: &CancelToken,
    ) -> Result<TableData> {
        let Drivers { source, target } = &job.drivers;
        let query = match temp_table {
            true => QueryWithParams::new(format!("SELECT * FROM {physical}")),
            false => job.descriptor.select_query(),
        };
        let data = match via {
            Some(Transfer::Unload) => {
                let unload = match temp_table {
                    true => UnloadSource::Table(physical.to_string()),
                    false => UnloadSource::Query(query),
                };
                self.retried(|_| source.unload(&unload, &self.options.unload, ctx)).await?
            },
            Some(Transfer::Stream) => self.retried(|_| source.stream(&query, &self.options.stream, ctx)).await?,
            Some(Transfer::Download) if temp_table => {
                let data = self.retried(|_| source.download_table(physical, ctx)).await?;
                match target.capabilities().csv_import {
                    true => spill_to_csv(data).await.map_err(ErrorKind::driver)?,
                    false => data,
                }
            },
            Some(Transfer::Download) => {
                let options = DownloadOptions {
                    csv_import: target.capabilities().csv_import,
                    stream: self.options.stream,
                };
                self.retried(|_| source.download_query_results(&query, &options, ctx)).await?
            },
            None => {
                let types = match temp_table {
                    true => self.retried(|_| source.table_column_types(physical, ctx)).await?,
                    false => self.retried(|_| source.query_column_types(&query, ctx)).await?,
                };
                let streaming = StreamingSource {
                    name: physical.to_string(),
                    driver: source.clone(),
                    query,
                };
                TableData::source(streaming, types)
            },
        };
        tracing::debug!(payload = data.payload().kind(), "Extracted source data");
        Ok(data)
    }

    async fn upload(&self, job: &BuildJob, mut data: TableData, schema: &str, physical: &str, ctx: &CancelToken) -> Result<()> {
        let target = &job.drivers.target;
        let prepared = self.retried(|_| target.create_schema_if_not_exists(schema, ctx)).await;
        let uploaded = match prepared {
            Ok(()) => {
                let columns = data.types.clone();
                let indexes = job.descriptor.index_queries(physical);
                let unique = job.descriptor.unique_key_columns.as_deref();
                target
                    .upload_table_with_indexes(physical, &columns, &mut data, &indexes, unique, ctx)
                    .await
                    .map_err(ErrorKind::driver)
            },
            Err(err) => Err(err),
        };
        data.release();
        if uploaded.is_err() {
            self.drop_if_listed(target, schema, physical, ctx).await;
        }
        uploaded
    }

    /// Best-effort cleanup: drop `table` if the driver lists it. Failures are
    /// logged, never returned.
    async fn drop_if_listed(&self, driver: &DriverHandle, schema: &str, table: &str, ctx: &CancelToken) {
        let fresh;
        let ctx = if ctx.is_canceled() {
            fresh = CancelToken::new();
            &fresh
        } else {
            ctx
        };
        let (_, name) = split_table_name(table);
        let dropped: Result<bool> = async {
            let listing = self.retried(|_| driver.get_tables_query(schema, ctx)).await?;
            if !listing.iter().any(|listed| listed == name) {
                return Ok(false);
            }
            self.retried(|_| driver.drop_table(table, ctx)).await?;
            Ok(true)
        }
        .await;
        match dropped {
            Ok(true) => tracing::info!(driver = driver.name(), table, "Dropped intermediate table"),
            Ok(false) => {},
            Err(err) => tracing::warn!(driver = driver.name(), table, error = ?err, "Unable to drop intermediate table"),
        }
    }

    /// Drop orphaned generations of `built.table_name`. Never fails the build.
    async fn collect_orphans(&self, target: &DriverHandle, built: &VersionEntry, ctx: &CancelToken) -> Vec<String> {
        let lock = {
            let mut locks = self.gc_locks.lock().unwrap_or_else(PoisonError::into_inner);
            locks.entry(format!("{}/{}", target.name(), built.table_name)).or_default().clone()
        };
        let _held = lock.lock().await;
        let building = self.building_into(target);
        match orphans::collect(target, &self.registry, &self.options.retention, built, building, ctx).await {
            Ok(dropped) => dropped,
            Err(err) => {
                tracing::warn!(error = ?err, "Orphan collection failed");
                Vec::new()
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use preagg_cache::Database;
    use preagg_driver::driver::{Call, MemoryDriver, Op};
    use preagg_driver::error::ErrorKind as DriverErrorKind;
    use preagg_driver::{Capabilities, Driver, ReadOnlyDriver};
    use rstest::rstest;
    use serde_json::json;
    use std::time::Duration;
    use time::OffsetDateTime;

    const PHYSICAL: &str = "preagg.orders_daily_s1_c1";

    async fn mover() -> DataMover {
        let registry = Registry::from(&Database::connect_in_memory().await.unwrap());
        let options = MoverOptions {
            retry: RetryPolicy {
                max_attempts: 3,
                initial_backoff: Duration::from_millis(1),
                max_backoff: Duration::from_millis(5),
            },
            ..MoverOptions::default()
        };
        DataMover::new(registry, options)
    }

    fn orders(capabilities: Capabilities) -> MemoryDriver {
        MemoryDriver::new("warehouse")
            .with_capabilities(capabilities)
            .with_table("public.orders", [json!({"id": 1, "amount": 10}), json!({"id": 2, "amount": 15})])
    }

    fn warehouse(capabilities: Capabilities) -> Arc<MemoryDriver> {
        Arc::new(orders(capabilities))
    }

    fn cubestore(capabilities: Capabilities) -> Arc<MemoryDriver> {
        Arc::new(MemoryDriver::new("cubestore").with_capabilities(capabilities))
    }

    fn descriptor() -> BuildDescriptor {
        BuildDescriptor::new(
            "preagg.orders_daily",
            QueryWithParams::new("SELECT * FROM public.orders"),
            QueryWithParams::new("CREATE TABLE preagg.orders_daily AS SELECT * FROM public.orders"),
        )
        .with_indexes([QueryWithParams::new("CREATE INDEX by_id ON preagg.orders_daily (id)")])
    }

    fn job(descriptor: BuildDescriptor, drivers: Drivers) -> BuildJob {
        BuildJob {
            descriptor,
            entry: VersionEntry::new("preagg.orders_daily", "s1", "c1", OffsetDateTime::UNIX_EPOCH),
            force: false,
            drivers,
        }
    }

    fn external_job(source: &Arc<MemoryDriver>, target: &Arc<MemoryDriver>) -> BuildJob {
        job(descriptor().external(true), Drivers::external(source.clone(), target.clone()))
    }

    fn count(calls: &[Call], call: &Call) -> usize {
        calls.iter().filter(|c| *c == call).count()
    }

    async fn row_count(driver: &MemoryDriver, table: &str) -> usize {
        let query = QueryWithParams::new(format!("SELECT * FROM {table}"));
        driver.query(&query, &CancelToken::new()).await.map(|rows| rows.len()).unwrap_or(0)
    }

    #[tokio::test]
    async fn test_in_place_build() {
        let mover = mover().await;
        let source = warehouse(Capabilities::default());
        let outcome = mover.build(&job(descriptor(), Drivers::local(source.clone())), &CancelToken::new()).await.unwrap();

        assert_eq!(outcome.table, PHYSICAL);
        assert_eq!(outcome.strategy, Some(Strategy::InPlace));
        assert_eq!(source.rows(PHYSICAL).unwrap().len(), 2);
        assert_eq!(source.indexes(PHYSICAL).unwrap(), vec!["by_id".to_string()]);
        assert!(outcome.entry.last_updated_at > OffsetDateTime::UNIX_EPOCH);
        let recorded = mover.registry.entries_for("preagg.orders_daily").await.unwrap();
        assert_eq!(recorded.len(), 1);
        assert_eq!(recorded[0].target_table_name(), PHYSICAL);
    }

    /// Every combination of external, read-only, the four capability flags
    /// and unload support ends with the same populated table, through the
    /// calls the selected strategy prescribes.
    #[tokio::test]
    async fn test_strategy_matrix() {
        let mover = mover().await;
        for bits in 0u8..128 {
            let flag = |n: u8| bits & (1 << n) != 0;
            let (external, read_only, unload_supported) = (flag(0), flag(1), flag(6));
            let capabilities = Capabilities {
                csv_import: flag(2),
                stream_import: flag(3),
                unload_without_temp_table: flag(4),
                streaming_source: flag(5),
            };
            let memory = Arc::new(orders(capabilities).with_unload_rows_per_file(1));
            memory.set_unload_supported(unload_supported);
            let source: DriverHandle = match read_only {
                true => Arc::new(ReadOnlyDriver::new(memory.clone())),
                false => memory.clone(),
            };
            let target = match external {
                true => cubestore(capabilities),
                false => memory.clone(),
            };
            let drivers = Drivers::external(source.clone(), target.clone());
            let job = job(descriptor().external(external), drivers);

            let expected = select(&Situation::new(&job.descriptor, &*source, &*target, unload_supported));
            let outcome = mover.build(&job, &CancelToken::new()).await;
            let outcome = outcome.unwrap_or_else(|err| panic!("bits {bits:07b}: {err:?}"));
            assert_eq!(outcome.strategy, Some(expected), "bits {bits:07b}");
            assert_eq!(row_count(&target, PHYSICAL).await, 2, "bits {bits:07b}: {expected}");

            let source_calls = memory.calls();
            let target_calls = target.calls();
            let loads = count(&source_calls, &Call::Load(PHYSICAL.into()));
            assert_eq!(loads, usize::from(expected.temp_table() || expected == Strategy::InPlace), "bits {bits:07b}");
            if expected.temp_table() {
                let dropped = count(&source_calls, &Call::DropTable(PHYSICAL.into()));
                let lazily_read = matches!(expected, Strategy::StreamingSource { .. });
                assert_eq!(dropped, usize::from(!lazily_read), "bits {bits:07b}: {expected}");
                assert_eq!(memory.has_table(PHYSICAL), lazily_read, "bits {bits:07b}: {expected}");
            }
            let upload_payload = target_calls.iter().find_map(|call| match call {
                Call::Upload { table, payload } if table == PHYSICAL => Some(*payload),
                _ => None,
            });
            let from = |temp: bool| match temp {
                true => format!("SELECT * FROM {PHYSICAL}"),
                false => "SELECT * FROM public.orders".to_string(),
            };
            match expected {
                Strategy::InPlace => assert_eq!(upload_payload, None),
                Strategy::Transfer { via: Transfer::Unload, temp_table } => {
                    let unloaded = match temp_table {
                        true => format!("table {PHYSICAL}"),
                        false => "query SELECT * FROM public.orders".to_string(),
                    };
                    assert!(source_calls.contains(&Call::Unload(unloaded)), "bits {bits:07b}");
                    assert_eq!(upload_payload, Some("csv"));
                },
                Strategy::Transfer { via: Transfer::Stream, temp_table } => {
                    assert!(source_calls.contains(&Call::Stream(from(temp_table))), "bits {bits:07b}");
                    assert_eq!(upload_payload, Some("stream"));
                    assert_eq!(count(&source_calls, &Call::ReleaseStream(from(temp_table))), 1);
                },
                Strategy::Transfer { via: Transfer::Download, temp_table } => {
                    assert!(source_calls.contains(&Call::Query(from(temp_table))), "bits {bits:07b}");
                    let kind = if target.capabilities().csv_import { "csv" } else { "rows" };
                    assert_eq!(upload_payload, Some(kind), "bits {bits:07b}");
                },
                Strategy::StreamingSource { .. } => {
                    assert_eq!(upload_payload, Some("streaming-source"));
                    assert!(target.is_streaming_source_table(PHYSICAL));
                },
            }
            assert_eq!(target.indexes(PHYSICAL).unwrap(), vec!["by_id".to_string()], "bits {bits:07b}");
        }
    }

    #[tokio::test]
    async fn test_temp_table_dropped_once_when_upload_fails() {
        let mover = mover().await;
        let source = warehouse(Capabilities::default());
        source.set_unload_supported(true);
        let target = cubestore(Capabilities { csv_import: true, ..Capabilities::default() });
        target.fail_always(Op::Upload, || DriverErrorKind::Backend("disk full".into()));

        let err = mover.build(&external_job(&source, &target), &CancelToken::new()).await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::Unexpected(_)));
        assert_eq!(count(&source.calls(), &Call::DropTable(PHYSICAL.into())), 1);
        assert!(!source.has_table(PHYSICAL));
        assert!(!target.has_table(PHYSICAL));
        assert!(mover.registry.entries_for("preagg.orders_daily").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_temp_table_dropped_when_source_could_stream() {
        let mover = mover().await;
        let source = warehouse(Capabilities { streaming_source: true, ..Capabilities::default() });
        source.set_unload_supported(true);
        let target = cubestore(Capabilities { csv_import: true, ..Capabilities::default() });

        let outcome = mover.build(&external_job(&source, &target), &CancelToken::new()).await.unwrap();
        assert_eq!(outcome.strategy, Some(Strategy::Transfer { via: Transfer::Unload, temp_table: true }));
        assert_eq!(count(&source.calls(), &Call::DropTable(PHYSICAL.into())), 1);
        assert!(!source.has_table(PHYSICAL));
        assert_eq!(row_count(&target, PHYSICAL).await, 2);
    }

    #[tokio::test]
    async fn test_stream_released_once_when_upload_fails() {
        let mover = mover().await;
        let source = warehouse(Capabilities { unload_without_temp_table: true, ..Capabilities::default() });
        let target = cubestore(Capabilities { stream_import: true, ..Capabilities::default() });
        target.fail_always(Op::Upload, || DriverErrorKind::Backend("rejected".into()));

        mover.build(&external_job(&source, &target), &CancelToken::new()).await.unwrap_err();
        let released = source.calls().into_iter().filter(|c| matches!(c, Call::ReleaseStream(_))).count();
        assert_eq!(released, 1);
    }

    /// Creates the table, then reports the upload as failed.
    struct HalfUpload(Arc<MemoryDriver>);

    #[async_trait::async_trait]
    impl Driver for HalfUpload {
        fn name(&self) -> &str {
            "half-upload"
        }

        async fn query(&self, query: &QueryWithParams, ctx: &CancelToken) -> DriverResult<Vec<preagg_driver::Row>> {
            self.0.query(query, ctx).await
        }

        async fn upload_table_with_indexes(
            &self,
            table: &str,
            columns: &[preagg_driver::Column],
            data: &mut TableData,
            indexes: &[QueryWithParams],
            unique_key_columns: Option<&[String]>,
            ctx: &CancelToken,
        ) -> DriverResult<()> {
            self.0.upload_table_with_indexes(table, columns, data, indexes, unique_key_columns, ctx).await?;
            exn::bail!(DriverErrorKind::Connection("lost while committing".into()))
        }

        async fn create_schema_if_not_exists(&self, schema: &str, ctx: &CancelToken) -> DriverResult<()> {
            self.0.create_schema_if_not_exists(schema, ctx).await
        }

        async fn drop_table(&self, table: &str, ctx: &CancelToken) -> DriverResult<()> {
            self.0.drop_table(table, ctx).await
        }

        async fn get_tables_query(&self, schema: &str, ctx: &CancelToken) -> DriverResult<Vec<String>> {
            self.0.get_tables_query(schema, ctx).await
        }
    }

    #[tokio::test]
    async fn test_partial_target_dropped_when_upload_fails() {
        let mover = mover().await;
        let source = warehouse(Capabilities { unload_without_temp_table: true, ..Capabilities::default() });
        let target = cubestore(Capabilities::default());
        let drivers = Drivers::external(source.clone(), Arc::new(HalfUpload(target.clone())));

        let err = mover.build(&job(descriptor().external(true), drivers), &CancelToken::new()).await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::Transient(_)));
        assert_eq!(count(&target.calls(), &Call::DropTable(PHYSICAL.into())), 1);
        assert!(!target.has_table(PHYSICAL));
    }

    /// Remembers the CSV files it was handed, then rejects them.
    struct RejectCsv {
        inner: Arc<MemoryDriver>,
        seen: Mutex<Vec<std::path::PathBuf>>,
    }

    #[async_trait::async_trait]
    impl Driver for RejectCsv {
        fn name(&self) -> &str {
            "reject-csv"
        }

        fn capabilities(&self) -> Capabilities {
            self.inner.capabilities()
        }

        async fn query(&self, query: &QueryWithParams, ctx: &CancelToken) -> DriverResult<Vec<preagg_driver::Row>> {
            self.inner.query(query, ctx).await
        }

        async fn upload_table_with_indexes(
            &self,
            _table: &str,
            _columns: &[preagg_driver::Column],
            data: &mut TableData,
            _indexes: &[QueryWithParams],
            _unique_key_columns: Option<&[String]>,
            _ctx: &CancelToken,
        ) -> DriverResult<()> {
            if let preagg_driver::Payload::Csv { files, .. } = data.payload() {
                let paths = files.iter().filter_map(|file| file.path().map(|path| path.to_path_buf()));
                self.seen.lock().unwrap().extend(paths);
            }
            exn::bail!(DriverErrorKind::Backend("malformed CSV".into()))
        }

        async fn get_tables_query(&self, schema: &str, ctx: &CancelToken) -> DriverResult<Vec<String>> {
            self.inner.get_tables_query(schema, ctx).await
        }
    }

    #[rstest]
    #[case::unload(true)]
    #[case::spilled_download(false)]
    #[tokio::test]
    async fn test_csv_files_deleted_when_upload_fails(#[case] unload_supported: bool) {
        let mover = mover().await;
        let source = warehouse(Capabilities::default());
        source.set_unload_supported(unload_supported);
        let target = Arc::new(RejectCsv {
            inner: cubestore(Capabilities { csv_import: true, ..Capabilities::default() }),
            seen: Mutex::default(),
        });
        let drivers = Drivers::external(source.clone(), target.clone());

        mover.build(&job(descriptor().external(true), drivers), &CancelToken::new()).await.unwrap_err();
        let seen = target.seen.lock().unwrap().clone();
        assert!(!seen.is_empty());
        for path in seen {
            assert!(!path.exists(), "{} left behind", path.display());
        }
        assert_eq!(count(&source.calls(), &Call::DropTable(PHYSICAL.into())), 1);
    }

    #[tokio::test]
    async fn test_cancel_mid_unload() {
        let mover = Arc::new(mover().await);
        let source = warehouse(Capabilities::default());
        source.set_unload_supported(true);
        source.delay(Op::Unload, Duration::from_secs(60));
        let target = cubestore(Capabilities { csv_import: true, ..Capabilities::default() });
        let ctx = CancelToken::new();

        let running = {
            let (mover, job, ctx) = (mover.clone(), external_job(&source, &target), ctx.clone());
            tokio::spawn(async move { mover.build(&job, &ctx).await })
        };
        while !source.calls().iter().any(|c| matches!(c, Call::Unload(_))) {
            tokio::task::yield_now().await;
        }
        ctx.cancel().await;

        let err = running.await.unwrap().unwrap_err();
        assert!(matches!(&*err, ErrorKind::Canceled));
        let calls = source.calls();
        assert!(calls.contains(&Call::Cancel(Op::Unload)));
        assert_eq!(count(&calls, &Call::DropTable(PHYSICAL.into())), 1);
        assert!(!target.has_table(PHYSICAL));
        assert!(!target.calls().iter().any(|c| matches!(c, Call::Upload { .. })));
    }

    #[tokio::test]
    async fn test_finished_build_keeps_overlapping_generation() {
        let mover = Arc::new(mover().await);
        let source = warehouse(Capabilities::default());
        // Only the slow build has an index step.
        source.delay(Op::Query, Duration::from_millis(200));
        let generation = |content: &str| VersionEntry::new("preagg.orders_daily", "s1", content, OffsetDateTime::UNIX_EPOCH);

        let slow = BuildJob { entry: generation("c3"), ..job(descriptor(), Drivers::local(source.clone())) };
        let slow_table = slow.entry.target_table_name();
        let running = {
            let mover = mover.clone();
            tokio::spawn(async move { mover.build(&slow, &CancelToken::new()).await })
        };
        while !source.has_table(&slow_table) {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }

        let unindexed = BuildDescriptor { indexes: Vec::new(), ..descriptor() };
        let fast = BuildJob { entry: generation("c2"), ..job(unindexed, Drivers::local(source.clone())) };
        let outcome = mover.build(&fast, &CancelToken::new()).await.unwrap();
        assert!(outcome.dropped.is_empty(), "{:?}", outcome.dropped);
        assert!(source.has_table(&slow_table));

        // Finished last, so it is the newest generation now.
        let slow = running.await.unwrap().unwrap();
        assert_eq!(slow.table, slow_table);
        assert_eq!(slow.dropped, vec![outcome.table]);
        let source: DriverHandle = source;
        assert!(mover.building_into(&source).is_empty());
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried() {
        let mover = mover().await;
        let source = warehouse(Capabilities::default());
        source.fail(Op::Load, 2, || DriverErrorKind::Connection("reset by peer".into()));
        mover.build(&job(descriptor(), Drivers::local(source.clone())), &CancelToken::new()).await.unwrap();
        assert_eq!(count(&source.calls(), &Call::Load(PHYSICAL.into())), 3);
    }

    #[rstest]
    #[case::user_error(false, 1, 1)]
    #[case::pool_exhausted(true, 5, 3)]
    #[tokio::test]
    async fn test_failures_surface(#[case] retryable: bool, #[case] times: usize, #[case] attempts: usize) {
        let mover = mover().await;
        let source = warehouse(Capabilities::default());
        source.fail(Op::Load, times, move || match retryable {
            true => DriverErrorKind::PoolExhausted,
            false => DriverErrorKind::User("syntax error".into()),
        });
        let err = mover.build(&job(descriptor(), Drivers::local(source.clone())), &CancelToken::new()).await.unwrap_err();
        assert_eq!(err.is_retryable(), retryable);
        assert_eq!(count(&source.calls(), &Call::Load(PHYSICAL.into())), attempts);
        assert!(!source.has_table(PHYSICAL));
    }

    #[tokio::test]
    async fn test_existing_table_is_reused() {
        let mover = mover().await;
        let source = warehouse(Capabilities::default());
        let ctx = CancelToken::new();
        mover.build(&job(descriptor(), Drivers::local(source.clone())), &ctx).await.unwrap();
        source.clear_calls();

        let outcome = mover.build(&job(descriptor(), Drivers::local(source.clone())), &ctx).await.unwrap();
        assert_eq!(outcome.strategy, None);
        assert_eq!(count(&source.calls(), &Call::Load(PHYSICAL.into())), 0);
    }

    #[tokio::test]
    async fn test_force_rebuild_drops_first() {
        let mover = mover().await;
        let source = warehouse(Capabilities::default());
        let ctx = CancelToken::new();
        mover.build(&job(descriptor(), Drivers::local(source.clone())), &ctx).await.unwrap();
        source.clear_calls();

        let forced = BuildJob { force: true, ..job(descriptor(), Drivers::local(source.clone())) };
        let outcome = mover.build(&forced, &ctx).await.unwrap();
        assert_eq!(outcome.strategy, Some(Strategy::InPlace));
        let calls = source.calls();
        let dropped = calls.iter().position(|c| *c == Call::DropTable(PHYSICAL.into())).unwrap();
        let loaded = calls.iter().position(|c| *c == Call::Load(PHYSICAL.into())).unwrap();
        assert!(dropped < loaded);
        assert!(source.has_table(PHYSICAL));
    }

    #[tokio::test]
    async fn test_rejects_unqualified_table() {
        let mover = mover().await;
        let source = warehouse(Capabilities::default());
        let descriptor = BuildDescriptor::new(
            "orders_daily",
            QueryWithParams::new("SELECT * FROM public.orders"),
            QueryWithParams::new("CREATE TABLE orders_daily AS SELECT * FROM public.orders"),
        );
        let mut job = job(descriptor, Drivers::local(source.clone()));
        job.entry.table_name = "orders_daily".into();
        let err = mover.build(&job, &CancelToken::new()).await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::User(_)));
        assert!(source.calls().is_empty());
    }
}
