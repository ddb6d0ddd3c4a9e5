//! The driver contract and its implementations.
//!
//! A [`Driver`] is the pipeline's only view of a storage backend, whether it's
//! the source the data comes from or the (external) target it is loaded into.
//! Backends implement the required methods; the provided ones express the
//! contract in terms of plain queries and can be overridden when a backend has
//! something better (a native bulk export, a server-side cursor).
//!
//! Every call takes the [`CancelToken`] of the build it belongs to. Long
//! running calls register a cancel hook on it that kills the work on the
//! backend, and must return [`Canceled`](crate::error::ErrorKind::Canceled)
//! promptly once the token fires.

#[cfg(feature = "mock")]
mod memory;
mod ro;

#[cfg(feature = "mock")]
pub use self::memory::{Call, MemoryDriver, Op};
pub use self::ro::ReadOnlyDriver;
use crate::csv::CsvFile;
use crate::data::{Payload, TableData};
use crate::error::{ErrorKind, Result};
use crate::models::{
    Capabilities, Column, ColumnType, DownloadOptions, QueryWithParams, Row, StreamOptions, UnloadOptions,
    UnloadSource, infer_column_types, split_table_name,
};
use async_trait::async_trait;
use exn::{OptionExt, ResultExt};
use preagg_asyncutils::CancelToken;
use serde_json::Value;
use time::OffsetDateTime;

/// Unified interface for pre-aggregation storage backends.
///
/// # Examples
///
/// ```
/// use preagg_driver::{CancelToken, Driver, QueryWithParams, error::Result};
///
/// async fn row_count(driver: &dyn Driver, table: &str) -> Result<usize> {
///     let ctx = CancelToken::new();
///     let rows = driver.query(&QueryWithParams::new(format!("SELECT * FROM {table}")), &ctx).await?;
///     Ok(rows.len())
/// }
/// ```
#[async_trait]
pub trait Driver: Send + Sync {
    /// Name of the configured data source (used for logging only).
    fn name(&self) -> &str;

    fn capabilities(&self) -> Capabilities {
        Capabilities::default()
    }

    /// Read-only drivers can't create tables from a load query; the pipeline
    /// downloads the data instead.
    fn read_only(&self) -> bool {
        false
    }

    /// Run a query and collect every row.
    async fn query(&self, query: &QueryWithParams, ctx: &CancelToken) -> Result<Vec<Row>>;

    /// Run a query, returning rows as they arrive.
    async fn stream(&self, _query: &QueryWithParams, _options: &StreamOptions, _ctx: &CancelToken) -> Result<TableData> {
        exn::bail!(ErrorKind::Unsupported("stream"))
    }

    /// Download the result of a query for uploading elsewhere.
    ///
    /// The provided implementation buffers all rows and infers their column
    /// types from the values, failing with
    /// [`EmptyResult`](ErrorKind::EmptyResult) when there is nothing to infer
    /// from. With [`DownloadOptions::csv_import`] the rows are spilled into a
    /// CSV file.
    async fn download_query_results(
        &self,
        query: &QueryWithParams,
        options: &DownloadOptions,
        ctx: &CancelToken,
    ) -> Result<TableData> {
        let rows = self.query(query, ctx).await?;
        let types = infer_column_types(&rows).ok_or_raise(|| ErrorKind::EmptyResult)?;
        let data = TableData::rows(rows, types);
        if options.csv_import { spill_to_csv(data).await } else { Ok(data) }
    }

    /// Download a whole table, usually a temp table built on the source.
    async fn download_table(&self, table: &str, ctx: &CancelToken) -> Result<TableData> {
        let rows = self.query(&QueryWithParams::new(format!("SELECT * FROM {table}")), ctx).await?;
        let types = self.table_column_types(table, ctx).await?;
        Ok(TableData::rows(rows, types))
    }

    /// Column types a query would produce.
    async fn query_column_types(&self, query: &QueryWithParams, ctx: &CancelToken) -> Result<Vec<Column>> {
        let rows = self.query(query, ctx).await?;
        infer_column_types(&rows).ok_or_raise(|| ErrorKind::EmptyResult)
    }

    async fn is_unload_supported(&self, _options: &UnloadOptions) -> Result<bool> {
        Ok(false)
    }

    /// Bulk export a table or query into CSV files.
    async fn unload(&self, _source: &UnloadSource, _options: &UnloadOptions, _ctx: &CancelToken) -> Result<TableData> {
        exn::bail!(ErrorKind::Unsupported("unload"))
    }

    /// Create `table` with `columns`, fill it from `data`, then run the index
    /// statements. The payload of `data` is consumed; releasing it stays the
    /// caller's responsibility.
    async fn upload_table_with_indexes(
        &self,
        table: &str,
        columns: &[Column],
        data: &mut TableData,
        indexes: &[QueryWithParams],
        unique_key_columns: Option<&[String]>,
        ctx: &CancelToken,
    ) -> Result<()>;

    /// Build `table` natively from the load query (`CREATE TABLE ... AS`).
    async fn load_pre_aggregation_into_table(
        &self,
        _table: &str,
        load_sql: &QueryWithParams,
        ctx: &CancelToken,
    ) -> Result<()> {
        self.query(load_sql, ctx).await?;
        Ok(())
    }

    async fn create_schema_if_not_exists(&self, schema: &str, ctx: &CancelToken) -> Result<()> {
        self.query(&QueryWithParams::new(format!("CREATE SCHEMA IF NOT EXISTS {schema}")), ctx).await?;
        Ok(())
    }

    async fn drop_table(&self, table: &str, ctx: &CancelToken) -> Result<()> {
        self.query(&QueryWithParams::new(format!("DROP TABLE {table}")), ctx).await?;
        Ok(())
    }

    async fn table_column_types(&self, table: &str, ctx: &CancelToken) -> Result<Vec<Column>> {
        let (schema, name) = split_table_name(table);
        let query = QueryWithParams::with_params(
            "SELECT column_name, data_type FROM information_schema.columns \
             WHERE table_name = ? AND table_schema = ? ORDER BY ordinal_position",
            [Value::from(name), Value::from(schema.unwrap_or("public"))],
        );
        self.query(&query, ctx)
            .await?
            .into_iter()
            .map(|row| {
                let name = row.get("column_name").and_then(Value::as_str);
                let kind = row.get("data_type").and_then(Value::as_str);
                match (name, kind) {
                    (Some(name), Some(kind)) => Ok(Column::new(name, ColumnType::from_db_type(kind))),
                    _ => exn::bail!(ErrorKind::Backend(format!("malformed column listing for {table}"))),
                }
            })
            .collect()
    }

    /// Names (without schema) of the tables in `schema`.
    async fn get_tables_query(&self, schema: &str, ctx: &CancelToken) -> Result<Vec<String>> {
        let query = QueryWithParams::with_params(
            "SELECT table_name FROM information_schema.tables WHERE table_schema = ?",
            [Value::from(schema)],
        );
        self.query(&query, ctx)
            .await?
            .into_iter()
            .map(|row| {
                row.get("table_name")
                    .or_else(|| row.get("TABLE_NAME"))
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .ok_or_raise(|| ErrorKind::Backend(format!("malformed table listing for schema {schema}")))
            })
            .collect()
    }

    /// Current time according to the backend.
    async fn now(&self) -> Result<OffsetDateTime> {
        Ok(OffsetDateTime::now_utc())
    }

    /// Return pooled connections; the driver is not used afterwards.
    async fn release(&self) -> Result<()> {
        Ok(())
    }
}

/// Move buffered rows into a CSV spill file, keeping types and release hooks.
pub async fn spill_to_csv(mut data: TableData) -> Result<TableData> {
    let Payload::Rows(rows) = data.take_payload() else {
        exn::bail!(ErrorKind::Unsupported("spilling non-row payloads"));
    };
    let columns = data.types.clone();
    let file = tokio::task::spawn_blocking(move || CsvFile::write(&columns, &rows, true))
        .await
        .or_raise(|| ErrorKind::Backend("CSV spill task failed".into()))??;
    data.replace_payload(Payload::Csv { files: vec![file], header: true });
    Ok(data)
}

impl ColumnType {
    /// Map a backend's native column type onto the generic types.
    pub fn from_db_type(db_type: &str) -> Self {
        let lower = db_type.to_ascii_lowercase();
        let base = lower.split('(').next().unwrap_or(&lower).trim();
        match base {
            "timestamp" | "timestamptz" | "datetime" | "timestamp without time zone" | "timestamp with time zone" => {
                Self::Timestamp
            },
            "date" => Self::Date,
            "int" | "int2" | "int4" | "integer" | "smallint" => Self::Int,
            "int8" | "bigint" => Self::Bigint,
            "numeric" | "decimal" | "float" | "float4" | "float8" | "real" | "double" | "double precision" => {
                Self::Decimal
            },
            "bool" | "boolean" => Self::Boolean,
            "varchar" | "character varying" | "char" | "character" => Self::String,
            _ => Self::Text,
        }
    }
}
