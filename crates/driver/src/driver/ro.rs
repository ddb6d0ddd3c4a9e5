//! Read-only driver wrapper.
//!
//! Wraps another driver for data sources where the pipeline only has read
//! permissions. Native table creation is refused, which steers the pipeline
//! into downloading the data and uploading it wherever the pre-aggregation
//! lives. Reads and uploads are delegated unchanged.

use crate::data::TableData;
use crate::error::{ErrorKind, Result};
use crate::models::{Capabilities, Column, DownloadOptions, QueryWithParams, Row, StreamOptions, UnloadOptions, UnloadSource};
use crate::{Driver, DriverHandle};
use async_trait::async_trait;
use preagg_asyncutils::CancelToken;
use time::OffsetDateTime;

#[derive(Clone)]
pub struct ReadOnlyDriver {
    inner: DriverHandle,
}
impl ReadOnlyDriver {
    pub fn new(inner: DriverHandle) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl Driver for ReadOnlyDriver {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn capabilities(&self) -> Capabilities {
        self.inner.capabilities()
    }

    fn read_only(&self) -> bool {
        true
    }

    async fn query(&self, query: &QueryWithParams, ctx: &CancelToken) -> Result<Vec<Row>> {
        self.inner.query(query, ctx).await
    }

    async fn stream(&self, query: &QueryWithParams, options: &StreamOptions, ctx: &CancelToken) -> Result<TableData> {
        self.inner.stream(query, options, ctx).await
    }

    async fn download_query_results(
        &self,
        query: &QueryWithParams,
        options: &DownloadOptions,
        ctx: &CancelToken,
    ) -> Result<TableData> {
        self.inner.download_query_results(query, options, ctx).await
    }

    async fn download_table(&self, table: &str, ctx: &CancelToken) -> Result<TableData> {
        self.inner.download_table(table, ctx).await
    }

    async fn query_column_types(&self, query: &QueryWithParams, ctx: &CancelToken) -> Result<Vec<Column>> {
        self.inner.query_column_types(query, ctx).await
    }

    async fn is_unload_supported(&self, options: &UnloadOptions) -> Result<bool> {
        self.inner.is_unload_supported(options).await
    }

    async fn unload(&self, source: &UnloadSource, options: &UnloadOptions, ctx: &CancelToken) -> Result<TableData> {
        // Unloading a table means that table had to be built here first.
        if let UnloadSource::Table(table) = source {
            tracing::info!(driver = self.name(), table = %table, "Refusing table unload on read-only driver");
            exn::bail!(ErrorKind::ReadOnly("unload from table"));
        }
        self.inner.unload(source, options, ctx).await
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
        self.inner
            .upload_table_with_indexes(table, columns, data, indexes, unique_key_columns, ctx)
            .await
    }

    async fn load_pre_aggregation_into_table(
        &self,
        table: &str,
        _load_sql: &QueryWithParams,
        _ctx: &CancelToken,
    ) -> Result<()> {
        tracing::info!(driver = self.name(), table, "Refusing native table build on read-only driver");
        exn::bail!(ErrorKind::ReadOnly("load_pre_aggregation_into_table"))
    }

    async fn create_schema_if_not_exists(&self, schema: &str, ctx: &CancelToken) -> Result<()> {
        self.inner.create_schema_if_not_exists(schema, ctx).await
    }

    async fn drop_table(&self, table: &str, ctx: &CancelToken) -> Result<()> {
        self.inner.drop_table(table, ctx).await
    }

    async fn table_column_types(&self, table: &str, ctx: &CancelToken) -> Result<Vec<Column>> {
        self.inner.table_column_types(table, ctx).await
    }

    async fn get_tables_query(&self, schema: &str, ctx: &CancelToken) -> Result<Vec<String>> {
        self.inner.get_tables_query(schema, ctx).await
    }

    async fn now(&self) -> Result<OffsetDateTime> {
        self.inner.now().await
    }

    async fn release(&self) -> Result<()> {
        self.inner.release().await
    }
}
