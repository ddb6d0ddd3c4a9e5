//! In-memory driver for testing.

use crate::csv::CsvFile;
use crate::data::{Payload, StreamingSource, TableData};
use crate::error::{ErrorKind, Result};
use crate::models::{
    Capabilities, Column, QueryWithParams, Row, StreamOptions, UnloadOptions, UnloadSource, infer_column_types,
    split_table_name,
};
use crate::Driver;
use async_stream::stream;
use async_trait::async_trait;
use futures::TryStreamExt;
use preagg_asyncutils::{CancelToken, PollError, PollOptions, poll};
use regex::Regex;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, LazyLock, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

// The panics here are DELIBERATE. MemoryDriver is intended to be used in
// tests; a broken pattern should fail the test run loudly.
fn pattern(re: &str) -> Regex {
    match Regex::new(re) {
        Ok(re) => re,
        Err(err) => panic!("MemoryDriver: invalid statement pattern {re}: {err}"),
    }
}
static SELECT_ALL: LazyLock<Regex> = LazyLock::new(|| pattern(r"(?is)^\s*SELECT\s+\*\s+FROM\s+([\w.]+)\s*;?\s*$"));
static CREATE_AS: LazyLock<Regex> = LazyLock::new(|| pattern(r"(?is)^\s*CREATE\s+TABLE\s+([\w.]+)\s+AS\s+(.+)$"));
static DROP_TABLE: LazyLock<Regex> = LazyLock::new(|| pattern(r"(?is)^\s*DROP\s+TABLE\s+(IF\s+EXISTS\s+)?([\w.]+)\s*;?\s*$"));
static CREATE_SCHEMA: LazyLock<Regex> =
    LazyLock::new(|| pattern(r"(?is)^\s*CREATE\s+SCHEMA\s+(IF\s+NOT\s+EXISTS\s+)?([\w.]+)\s*;?\s*$"));
static CREATE_INDEX: LazyLock<Regex> =
    LazyLock::new(|| pattern(r"(?is)^\s*CREATE\s+(UNIQUE\s+)?INDEX\s+([\w.]+)\s+ON\s+([\w.]+)"));

/// Driver operations failures and delays can be injected into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    Query,
    Stream,
    Unload,
    Upload,
    Load,
    CreateSchema,
    DropTable,
    TableColumnTypes,
    GetTables,
}

/// One recorded contract call, in the order they were made.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Query(String),
    Stream(String),
    /// Source of the unload, as displayed by [`UnloadSource`].
    Unload(String),
    Upload { table: String, payload: &'static str },
    Load(String),
    CreateSchema(String),
    DropTable(String),
    TableColumnTypes(String),
    GetTables(String),
    /// A row stream handed out by [`stream()`](Driver::stream) was released.
    ReleaseStream(String),
    /// The cancel hook of an in-flight operation ran.
    Cancel(Op),
    Release,
}

type FailureFn = Arc<dyn Fn() -> ErrorKind + Send + Sync>;

struct Failure {
    remaining: Option<usize>,
    make: FailureFn,
}

#[derive(Clone, Default)]
struct Table {
    columns: Vec<Column>,
    rows: Vec<Row>,
    indexes: Vec<String>,
    /// Tables registered from a streaming source read through to it.
    source: Option<StreamingSource>,
}

#[derive(Default)]
struct State {
    tables: BTreeMap<String, Table>,
    schemas: BTreeSet<String>,
    results: HashMap<String, Vec<Row>>,
    failures: HashMap<Op, Failure>,
    delays: HashMap<Op, Duration>,
    calls: Vec<Call>,
}
impl State {
    fn take_failure(&mut self, op: Op) -> Option<ErrorKind> {
        let failure = self.failures.get_mut(&op)?;
        let kind = (failure.make)();
        match &mut failure.remaining {
            Some(1) => {
                self.failures.remove(&op);
            },
            Some(remaining) => *remaining -= 1,
            None => {},
        }
        Some(kind)
    }
}

fn to_rows(values: impl IntoIterator<Item = Value>) -> Vec<Row> {
    values
        .into_iter()
        .map(|value| match value {
            Value::Object(row) => row,
            // DELIBERATE: see above.
            other => panic!("MemoryDriver: rows must be JSON objects, got {other}"),
        })
        .collect()
}

/// Select result: the columns are known when reading a table.
struct Selected {
    columns: Option<Vec<Column>>,
    rows: Vec<Row>,
}
impl Selected {
    fn columns(&self) -> Vec<Column> {
        self.columns
            .clone()
            .or_else(|| infer_column_types(&self.rows))
            .unwrap_or_default()
    }
}

/// In-memory driver for testing.
///
/// Tables live in a map behind a [`Mutex`] that is never held across an
/// await point. The driver understands just enough SQL for pre-aggregation
/// builds (`SELECT * FROM t`, `CREATE TABLE t AS ...`, `DROP TABLE`,
/// `CREATE SCHEMA`, `CREATE INDEX`); anything else must be scripted with
/// [`with_result()`](Self::with_result).
///
/// Every contract call is recorded, failures and delays can be injected per
/// [`Op`], and delayed or polling operations register a cancel hook that
/// records [`Call::Cancel`].
///
/// # Examples
///
/// ```
/// use preagg_driver::driver::{Call, MemoryDriver};
/// use preagg_driver::{CancelToken, Driver, QueryWithParams};
/// use serde_json::json;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let driver = MemoryDriver::new("warehouse")
///     .with_table("public.orders", [json!({"id": 1, "amount": 10})]);
///
/// let ctx = CancelToken::new();
/// driver.create_schema_if_not_exists("preagg", &ctx).await?;
/// let load = QueryWithParams::new("CREATE TABLE preagg.orders_daily AS SELECT * FROM public.orders");
/// driver.load_pre_aggregation_into_table("preagg.orders_daily", &load, &ctx).await?;
///
/// assert_eq!(driver.rows("preagg.orders_daily").map(|rows| rows.len()), Some(1));
/// assert!(driver.calls().contains(&Call::Load("preagg.orders_daily".into())));
/// # Ok(())
/// # }
/// ```
pub struct MemoryDriver {
    name: String,
    capabilities: Capabilities,
    unload_supported: AtomicBool,
    unload_polls: usize,
    unload_rows_per_file: usize,
    state: Arc<Mutex<State>>,
}

impl MemoryDriver {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            capabilities: Capabilities::default(),
            unload_supported: AtomicBool::new(false),
            unload_polls: 1,
            unload_rows_per_file: 10_000,
            state: Arc::default(),
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn with_capabilities(mut self, capabilities: Capabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    /// Seed a table. Columns are inferred from the rows.
    pub fn with_table(self, table: impl Into<String>, rows: impl IntoIterator<Item = Value>) -> Self {
        let rows = to_rows(rows);
        let table = table.into();
        if let (Some(schema), _) = split_table_name(&table) {
            self.state().schemas.insert(schema.to_string());
        }
        let columns = infer_column_types(&rows).unwrap_or_default();
        self.state().tables.insert(table, Table { columns, rows, ..Table::default() });
        self
    }

    /// Script the result of a query the driver can't interpret itself.
    pub fn with_result(self, sql: impl Into<String>, rows: impl IntoIterator<Item = Value>) -> Self {
        self.set_result(sql, rows);
        self
    }

    /// Number of status checks before an unload job completes.
    pub fn with_unload_polls(mut self, polls: usize) -> Self {
        self.unload_polls = polls.max(1);
        self
    }

    pub fn with_unload_rows_per_file(mut self, rows: usize) -> Self {
        self.unload_rows_per_file = rows.max(1);
        self
    }

    pub fn set_result(&self, sql: impl Into<String>, rows: impl IntoIterator<Item = Value>) {
        self.state().results.insert(sql.into(), to_rows(rows));
    }

    pub fn set_unload_supported(&self, supported: bool) {
        self.unload_supported.store(supported, Ordering::SeqCst);
    }

    /// Fail the next `times` calls of `op`.
    pub fn fail(&self, op: Op, times: usize, make: impl Fn() -> ErrorKind + Send + Sync + 'static) {
        if times == 0 {
            return;
        }
        let failure = Failure { remaining: Some(times), make: Arc::new(make) };
        self.state().failures.insert(op, failure);
    }

    /// Fail every call of `op` from now on.
    pub fn fail_always(&self, op: Op, make: impl Fn() -> ErrorKind + Send + Sync + 'static) {
        let failure = Failure { remaining: None, make: Arc::new(make) };
        self.state().failures.insert(op, failure);
    }

    /// Make every call of `op` take `delay` before doing anything.
    pub fn delay(&self, op: Op, delay: Duration) {
        self.state().delays.insert(op, delay);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.state().calls.clear();
    }

    pub fn has_table(&self, table: &str) -> bool {
        self.state().tables.contains_key(table)
    }

    pub fn tables(&self) -> Vec<String> {
        self.state().tables.keys().cloned().collect()
    }

    /// Rows stored in `table`. Tables registered from a streaming source
    /// report no rows here; query them to read through.
    pub fn rows(&self, table: &str) -> Option<Vec<Row>> {
        self.state().tables.get(table).map(|t| t.rows.clone())
    }

    pub fn indexes(&self, table: &str) -> Option<Vec<String>> {
        self.state().tables.get(table).map(|t| t.indexes.clone())
    }

    pub fn is_streaming_source_table(&self, table: &str) -> bool {
        self.state().tables.get(table).is_some_and(|t| t.source.is_some())
    }

    /// Record `call`, then apply any delay and injected failure for `op`.
    async fn enter(&self, op: Op, call: Call, ctx: &CancelToken) -> Result<()> {
        let (failure, delay) = {
            let mut state = self.state();
            state.calls.push(call);
            (state.take_failure(op), state.delays.get(&op).copied())
        };
        if ctx.is_canceled() {
            exn::bail!(ErrorKind::Canceled);
        }
        if let Some(delay) = delay {
            let _guard = self.cancel_hook(op, ctx);
            ctx.run(tokio::time::sleep(delay)).await.map_err(ErrorKind::from)?;
        }
        match failure {
            Some(kind) => exn::bail!(kind),
            None => Ok(()),
        }
    }

    fn cancel_hook(&self, op: Op, ctx: &CancelToken) -> preagg_asyncutils::HookGuard {
        let state = self.state.clone();
        ctx.register(move || async move {
            state.lock().unwrap_or_else(PoisonError::into_inner).calls.push(Call::Cancel(op));
        })
    }

    async fn select(&self, sql: &str, ctx: &CancelToken) -> Result<Selected> {
        let source = {
            let state = self.state();
            if let Some(rows) = state.results.get(sql) {
                return Ok(Selected { columns: None, rows: rows.clone() });
            }
            let Some(captures) = SELECT_ALL.captures(sql) else {
                exn::bail!(ErrorKind::User(format!("MemoryDriver can't interpret statement: {sql}")));
            };
            let name = &captures[1];
            let Some(table) = state.tables.get(name) else {
                exn::bail!(ErrorKind::TableNotFound(name.to_string()));
            };
            match &table.source {
                None => {
                    return Ok(Selected {
                        columns: Some(table.columns.clone()),
                        rows: table.rows.clone(),
                    });
                },
                Some(source) => (source.clone(), table.columns.clone()),
            }
        };
        let (source, columns) = source;
        let rows = source.driver.query(&source.query, ctx).await?;
        Ok(Selected { columns: Some(columns), rows })
    }

    fn create_table(&self, name: &str, table: Table) -> Result<()> {
        let mut state = self.state();
        if state.tables.contains_key(name) {
            exn::bail!(ErrorKind::User(format!("table {name} already exists")));
        }
        if let (Some(schema), _) = split_table_name(name)
            && !state.schemas.contains(schema)
        {
            exn::bail!(ErrorKind::User(format!("schema {schema} does not exist")));
        }
        state.tables.insert(name.to_string(), table);
        Ok(())
    }

    fn remove_table(&self, name: &str, if_exists: bool) -> Result<()> {
        match self.state().tables.remove(name) {
            Some(_) => Ok(()),
            None if if_exists => Ok(()),
            None => exn::bail!(ErrorKind::TableNotFound(name.to_string())),
        }
    }

    /// Interpret one statement.
    async fn execute(&self, query: &QueryWithParams, ctx: &CancelToken) -> Result<Vec<Row>> {
        let sql = query.sql.as_str();
        if let Some(captures) = CREATE_AS.captures(sql) {
            let selected = self.select(captures[2].trim(), ctx).await?;
            let table = Table { columns: selected.columns(), rows: selected.rows, ..Table::default() };
            self.create_table(&captures[1], table)?;
            return Ok(Vec::new());
        }
        if let Some(captures) = DROP_TABLE.captures(sql) {
            self.remove_table(&captures[2], captures.get(1).is_some())?;
            return Ok(Vec::new());
        }
        if let Some(captures) = CREATE_SCHEMA.captures(sql) {
            let created = self.state().schemas.insert(captures[2].to_string());
            if !created && captures.get(1).is_none() {
                exn::bail!(ErrorKind::User(format!("schema {} already exists", &captures[2])));
            }
            return Ok(Vec::new());
        }
        if let Some(captures) = CREATE_INDEX.captures(sql) {
            let mut state = self.state();
            let Some(table) = state.tables.get_mut(&captures[3]) else {
                exn::bail!(ErrorKind::TableNotFound(captures[3].to_string()));
            };
            table.indexes.push(captures[2].to_string());
            return Ok(Vec::new());
        }
        Ok(self.select(sql, ctx).await?.rows)
    }
}

fn dedup_by_keys(rows: Vec<Row>, keys: &[String]) -> Vec<Row> {
    let mut positions: HashMap<Vec<String>, usize> = HashMap::new();
    let mut unique: Vec<Row> = Vec::with_capacity(rows.len());
    for row in rows {
        let key: Vec<String> = keys.iter().map(|k| row.get(k).map(Value::to_string).unwrap_or_default()).collect();
        match positions.get(&key) {
            Some(&position) => unique[position] = row,
            None => {
                positions.insert(key, unique.len());
                unique.push(row);
            },
        }
    }
    unique
}

#[async_trait]
impl Driver for MemoryDriver {
    fn name(&self) -> &str {
        &self.name
    }

    fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    async fn query(&self, query: &QueryWithParams, ctx: &CancelToken) -> Result<Vec<Row>> {
        self.enter(Op::Query, Call::Query(query.sql.clone()), ctx).await?;
        self.execute(query, ctx).await
    }

    async fn stream(&self, query: &QueryWithParams, _options: &StreamOptions, ctx: &CancelToken) -> Result<TableData> {
        self.enter(Op::Stream, Call::Stream(query.sql.clone()), ctx).await?;
        let selected = self.select(&query.sql, ctx).await?;
        let columns = selected.columns();
        let rows = selected.rows;
        let state = self.state.clone();
        let sql = query.sql.clone();
        let stream = stream! {
            for row in rows {
                yield Ok(row);
            }
        };
        Ok(TableData::stream(Box::pin(stream), columns).on_release(move || {
            state.lock().unwrap_or_else(PoisonError::into_inner).calls.push(Call::ReleaseStream(sql));
        }))
    }

    async fn is_unload_supported(&self, _options: &UnloadOptions) -> Result<bool> {
        Ok(self.unload_supported.load(Ordering::SeqCst))
    }

    /// Unloads run as jobs that finish after a number of status polls.
    async fn unload(&self, source: &UnloadSource, _options: &UnloadOptions, ctx: &CancelToken) -> Result<TableData> {
        self.enter(Op::Unload, Call::Unload(source.to_string()), ctx).await?;
        if !self.unload_supported.load(Ordering::SeqCst) {
            exn::bail!(ErrorKind::Unsupported("unload"));
        }
        let selected = match source {
            UnloadSource::Table(table) => self.select(&format!("SELECT * FROM {table}"), ctx).await?,
            UnloadSource::Query(query) => self.select(&query.sql, ctx).await?,
        };

        let _guard = self.cancel_hook(Op::Unload, ctx);
        let mut checks = 0;
        let target = self.unload_polls;
        let poll_options = PollOptions {
            interval: Duration::from_millis(1),
            max_interval: Duration::from_millis(10),
            timeout: Duration::from_secs(5),
        };
        let job = poll(&poll_options, || {
            checks += 1;
            let done = checks >= target;
            async move { Ok::<_, ErrorKind>(done.then_some(())) }
        });
        match ctx.run(job).await.map_err(ErrorKind::from)? {
            Ok(()) => {},
            Err(PollError::TimedOut(_)) => exn::bail!(ErrorKind::Timeout("unload job".into())),
            Err(PollError::Failed(kind)) => exn::bail!(kind),
        }

        let columns = selected.columns();
        let files = selected
            .rows
            .chunks(self.unload_rows_per_file)
            .map(|rows| CsvFile::write(&columns, rows, false))
            .collect::<Result<Vec<_>>>()?;
        Ok(TableData::csv(files, false, columns))
    }

    async fn upload_table_with_indexes(
        &self,
        table: &str,
        columns: &[Column],
        data: &mut TableData,
        indexes: &[QueryWithParams],
        unique_key_columns: Option<&[String]>,
        ctx: &CancelToken,
    ) -> Result<()> {
        let payload = data.payload().kind();
        self.enter(Op::Upload, Call::Upload { table: table.to_string(), payload }, ctx).await?;
        let mut new_table = Table { columns: columns.to_vec(), ..Table::default() };
        match data.payload() {
            Payload::Rows(rows) => new_table.rows = rows.clone(),
            Payload::Csv { files, header } => {
                for file in files {
                    new_table.rows.extend(file.read(columns, *header)?);
                }
            },
            Payload::Source(source) => new_table.source = Some(source.clone()),
            Payload::Stream(_) => {
                let Payload::Stream(stream) = data.take_payload() else {
                    unreachable!("payload was just matched as a stream");
                };
                new_table.rows = ctx.run(stream.try_collect::<Vec<_>>()).await.map_err(ErrorKind::from)??;
            },
        }
        if let Some(keys) = unique_key_columns {
            new_table.rows = dedup_by_keys(std::mem::take(&mut new_table.rows), keys);
        }
        self.create_table(table, new_table)?;
        for index in indexes {
            if let Err(err) = self.query(index, ctx).await {
                self.remove_table(table, true)?;
                return Err(err);
            }
        }
        Ok(())
    }

    async fn load_pre_aggregation_into_table(
        &self,
        table: &str,
        load_sql: &QueryWithParams,
        ctx: &CancelToken,
    ) -> Result<()> {
        self.enter(Op::Load, Call::Load(table.to_string()), ctx).await?;
        self.execute(load_sql, ctx).await?;
        Ok(())
    }

    async fn create_schema_if_not_exists(&self, schema: &str, ctx: &CancelToken) -> Result<()> {
        self.enter(Op::CreateSchema, Call::CreateSchema(schema.to_string()), ctx).await?;
        self.state().schemas.insert(schema.to_string());
        Ok(())
    }

    async fn drop_table(&self, table: &str, ctx: &CancelToken) -> Result<()> {
        self.enter(Op::DropTable, Call::DropTable(table.to_string()), ctx).await?;
        self.remove_table(table, false)
    }

    async fn table_column_types(&self, table: &str, ctx: &CancelToken) -> Result<Vec<Column>> {
        self.enter(Op::TableColumnTypes, Call::TableColumnTypes(table.to_string()), ctx).await?;
        let state = self.state();
        let found = state.tables.get(table).map(|t| t.columns.clone());
        found.ok_or_else(|| exn::Exn::from(ErrorKind::TableNotFound(table.to_string())))
    }

    async fn get_tables_query(&self, schema: &str, ctx: &CancelToken) -> Result<Vec<String>> {
        self.enter(Op::GetTables, Call::GetTables(schema.to_string()), ctx).await?;
        Ok(self
            .state()
            .tables
            .keys()
            .filter_map(|name| match split_table_name(name) {
                (Some(s), table) if s == schema => Some(table.to_string()),
                _ => None,
            })
            .collect())
    }

    async fn release(&self) -> Result<()> {
        self.state().calls.push(Call::Release);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn orders() -> MemoryDriver {
        MemoryDriver::new("warehouse").with_table(
            "public.orders",
            [json!({"id": 1, "amount": 10}), json!({"id": 2, "amount": 15})],
        )
    }

    fn q(sql: &str) -> QueryWithParams {
        QueryWithParams::new(sql)
    }

    #[tokio::test]
    async fn test_create_table_as_select() {
        let driver = orders();
        let ctx = CancelToken::new();
        driver.create_schema_if_not_exists("preagg", &ctx).await.unwrap();
        driver
            .load_pre_aggregation_into_table("preagg.t", &q("CREATE TABLE preagg.t AS SELECT * FROM public.orders"), &ctx)
            .await
            .unwrap();
        assert_eq!(driver.rows("preagg.t").unwrap().len(), 2);
        assert_eq!(driver.get_tables_query("preagg", &ctx).await.unwrap(), vec!["t".to_string()]);
    }

    #[tokio::test]
    async fn test_create_table_requires_schema() {
        let driver = orders();
        let ctx = CancelToken::new();
        let err = driver.query(&q("CREATE TABLE missing.t AS SELECT * FROM public.orders"), &ctx).await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::User(_)));
    }

    #[tokio::test]
    async fn test_scripted_results_take_precedence() {
        let driver = orders().with_result("SELECT max(id) FROM public.orders", [json!({"max": 2})]);
        let rows = driver.query(&q("SELECT max(id) FROM public.orders"), &CancelToken::new()).await.unwrap();
        assert_eq!(rows[0]["max"], json!(2));
    }

    #[tokio::test]
    async fn test_unknown_statement_is_a_user_error() {
        let err = orders().query(&q("VACUUM"), &CancelToken::new()).await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::User(_)));
    }

    #[tokio::test]
    async fn test_drop_missing_table() {
        let err = orders().drop_table("public.nope", &CancelToken::new()).await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::TableNotFound(_)));
    }

    #[tokio::test]
    async fn test_injected_failures_run_out() {
        let driver = orders();
        let ctx = CancelToken::new();
        driver.fail(Op::Query, 2, || ErrorKind::Connection("reset".into()));
        assert!(driver.query(&q("SELECT * FROM public.orders"), &ctx).await.is_err());
        assert!(driver.query(&q("SELECT * FROM public.orders"), &ctx).await.is_err());
        assert!(driver.query(&q("SELECT * FROM public.orders"), &ctx).await.is_ok());
        assert_eq!(driver.calls().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_delay_runs_hook() {
        let driver = Arc::new(orders());
        driver.delay(Op::Query, Duration::from_secs(60));
        let ctx = CancelToken::new();
        let running = {
            let (driver, ctx) = (driver.clone(), ctx.clone());
            tokio::spawn(async move { driver.query(&q("SELECT * FROM public.orders"), &ctx).await })
        };
        while driver.calls().is_empty() {
            tokio::task::yield_now().await;
        }
        ctx.cancel().await;
        let err = running.await.unwrap().unwrap_err();
        assert!(matches!(&*err, ErrorKind::Canceled));
        assert_eq!(driver.calls().last(), Some(&Call::Cancel(Op::Query)));
    }

    #[tokio::test]
    async fn test_unload_writes_csv_files() {
        let driver = orders().with_unload_polls(3).with_unload_rows_per_file(1);
        driver.set_unload_supported(true);
        let source = UnloadSource::Table("public.orders".into());
        let data = driver.unload(&source, &UnloadOptions::default(), &CancelToken::new()).await.unwrap();
        let Payload::Csv { files, header } = data.payload() else {
            panic!("expected CSV payload");
        };
        assert!(!header);
        assert_eq!(files.len(), 2);
        assert_eq!(driver.calls(), vec![Call::Unload("table public.orders".into())]);
    }

    #[tokio::test]
    async fn test_unload_unsupported() {
        let source = UnloadSource::Table("public.orders".into());
        let err = orders().unload(&source, &UnloadOptions::default(), &CancelToken::new()).await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::Unsupported(_)));
    }

    #[tokio::test]
    async fn test_stream_release_is_recorded() {
        let driver = orders();
        let ctx = CancelToken::new();
        let mut data = driver.stream(&q("SELECT * FROM public.orders"), &StreamOptions::default(), &ctx).await.unwrap();
        driver.create_schema_if_not_exists("preagg", &ctx).await.unwrap();
        let columns = data.types.clone();
        driver.upload_table_with_indexes("preagg.copy", &columns, &mut data, &[], None, &ctx).await.unwrap();
        data.release();
        drop(data);
        assert_eq!(driver.rows("preagg.copy").unwrap().len(), 2);
        let releases = driver.calls().into_iter().filter(|c| matches!(c, Call::ReleaseStream(_))).count();
        assert_eq!(releases, 1);
    }

    #[tokio::test]
    async fn test_upload_with_indexes_and_unique_keys() {
        let driver = MemoryDriver::new("cubestore");
        let ctx = CancelToken::new();
        driver.create_schema_if_not_exists("preagg", &ctx).await.unwrap();
        let columns = vec![Column::new("id", crate::models::ColumnType::Int)];
        let rows = to_rows([json!({"id": 1}), json!({"id": 1}), json!({"id": 2})]);
        let mut data = TableData::rows(rows, columns.clone());
        let indexes = [q("CREATE INDEX by_id ON preagg.t (id)")];
        let keys = ["id".to_string()];
        driver.upload_table_with_indexes("preagg.t", &columns, &mut data, &indexes, Some(&keys), &ctx).await.unwrap();
        assert_eq!(driver.rows("preagg.t").unwrap().len(), 2);
        assert_eq!(driver.indexes("preagg.t").unwrap(), vec!["by_id".to_string()]);
    }

    #[tokio::test]
    async fn test_failed_index_drops_uploaded_table() {
        let driver = MemoryDriver::new("cubestore");
        let ctx = CancelToken::new();
        driver.create_schema_if_not_exists("preagg", &ctx).await.unwrap();
        let columns = vec![Column::new("id", crate::models::ColumnType::Int)];
        let mut data = TableData::rows(to_rows([json!({"id": 1})]), columns.clone());
        let indexes = [q("CREATE INDEX by_id ON preagg.other (id)")];
        assert!(driver.upload_table_with_indexes("preagg.t", &columns, &mut data, &indexes, None, &ctx).await.is_err());
        assert!(!driver.has_table("preagg.t"));
    }

    #[tokio::test]
    async fn test_streaming_source_reads_through() {
        let source: crate::DriverHandle = Arc::new(orders());
        let target = MemoryDriver::new("cubestore");
        let ctx = CancelToken::new();
        target.create_schema_if_not_exists("preagg", &ctx).await.unwrap();
        let streaming = StreamingSource {
            name: "orders".into(),
            driver: source,
            query: q("SELECT * FROM public.orders"),
        };
        let columns = vec![Column::new("id", crate::models::ColumnType::Int)];
        let mut data = TableData::source(streaming, columns.clone());
        target.upload_table_with_indexes("preagg.t", &columns, &mut data, &[], None, &ctx).await.unwrap();
        assert!(target.is_streaming_source_table("preagg.t"));
        let rows = target.query(&q("SELECT * FROM preagg.t"), &ctx).await.unwrap();
        assert_eq!(rows.len(), 2);
    }
}
