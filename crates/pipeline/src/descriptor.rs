//! What one build needs to know.

use crate::error::{ErrorKind, Result};
use crate::partition::{DateRange, PartitionGranularity, format_timestamp, partition_ranges, partition_table_name};
use preagg_driver::{QueryWithParams, split_table_name};
use serde_json::{Value, json};

/// Parameter replaced by the start of a partition's load range.
pub const FROM_PARTITION_RANGE: &str = "__FROM_PARTITION_RANGE";
/// Parameter replaced by the end of a partition's load range.
pub const TO_PARTITION_RANGE: &str = "__TO_PARTITION_RANGE";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Partitioning {
    pub granularity: PartitionGranularity,
    /// Data available for building. Partitions past its end are not built;
    /// the last one is loaded only up to it.
    pub build_range: DateRange,
}

/// Everything needed to execute one build.
///
/// Created per refresh from the compiled model and consumed by the build
/// queue. The SQL is opaque: `load_sql` must create `table_name` (e.g.
/// `CREATE TABLE preagg.orders_daily AS SELECT ...`), `sql` is the bare
/// `SELECT` producing the same rows, and index statements refer to
/// `table_name` too. The first occurrence of `table_name` in each statement
/// is replaced by the physical name at build time.
#[derive(Debug, Clone, PartialEq)]
pub struct BuildDescriptor {
    /// Logical, usually schema-qualified, table name.
    pub table_name: String,
    /// Data source the source driver and build queue are picked by.
    pub data_source: String,
    pub sql: QueryWithParams,
    pub load_sql: QueryWithParams,
    pub invalidate_key_queries: Vec<QueryWithParams>,
    pub indexes: Vec<QueryWithParams>,
    pub unique_key_columns: Option<Vec<String>>,
    /// The table lives in the external storage tier, not in the source.
    pub external: bool,
    /// The source may only be read from.
    pub read_only: bool,
    pub partitioning: Option<Partitioning>,
    /// Load range of one partition, set by [`partitions()`](Self::partitions).
    pub partition_range: Option<DateRange>,
}

impl BuildDescriptor {
    pub fn new(table_name: impl Into<String>, sql: QueryWithParams, load_sql: QueryWithParams) -> Self {
        Self {
            table_name: table_name.into(),
            data_source: "default".to_string(),
            sql,
            load_sql,
            invalidate_key_queries: Vec::new(),
            indexes: Vec::new(),
            unique_key_columns: None,
            external: false,
            read_only: false,
            partitioning: None,
            partition_range: None,
        }
    }

    pub fn with_data_source(mut self, data_source: impl Into<String>) -> Self {
        self.data_source = data_source.into();
        self
    }

    pub fn with_invalidate_key_queries(mut self, queries: impl IntoIterator<Item = QueryWithParams>) -> Self {
        self.invalidate_key_queries = queries.into_iter().collect();
        self
    }

    pub fn with_indexes(mut self, indexes: impl IntoIterator<Item = QueryWithParams>) -> Self {
        self.indexes = indexes.into_iter().collect();
        self
    }

    pub fn with_unique_key_columns(mut self, columns: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.unique_key_columns = Some(columns.into_iter().map(Into::into).collect());
        self
    }

    pub fn external(mut self, external: bool) -> Self {
        self.external = external;
        self
    }

    pub fn read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }

    pub fn partitioned(mut self, granularity: PartitionGranularity, build_range: DateRange) -> Self {
        self.partitioning = Some(Partitioning { granularity, build_range });
        self
    }

    /// Schema of the logical table (and of every physical generation).
    pub fn schema(&self) -> Option<&str> {
        split_table_name(&self.table_name).0
    }

    pub fn validate(&self) -> Result<()> {
        if self.table_name.trim().is_empty() {
            exn::bail!(ErrorKind::User("pre-aggregation table name is empty".into()));
        }
        if self.schema().is_none() {
            exn::bail!(ErrorKind::User(format!("pre-aggregation table {} is not schema-qualified", self.table_name)));
        }
        if !self.load_sql.sql.contains(&self.table_name) {
            exn::bail!(ErrorKind::User(format!(
                "load SQL of {} does not create the table it is named after",
                self.table_name
            )));
        }
        Ok(())
    }

    /// Expand into one descriptor per partition.
    ///
    /// Unpartitioned descriptors, and descriptors that already are a single
    /// partition, expand into themselves.
    pub fn partitions(&self) -> Result<Vec<BuildDescriptor>> {
        let Some(partitioning) = self.partitioning.as_ref().filter(|_| self.partition_range.is_none()) else {
            return Ok(vec![self.clone()]);
        };
        let ranges = partition_ranges(&partitioning.build_range, partitioning.granularity)?;
        Ok(ranges
            .into_iter()
            .map(|range| {
                let table_name = partition_table_name(&self.table_name, partitioning.granularity, &range);
                let rename = |query: &QueryWithParams| QueryWithParams {
                    sql: query.sql.replacen(&self.table_name, &table_name, 1),
                    params: query.params.clone(),
                };
                BuildDescriptor {
                    load_sql: rename(&self.load_sql),
                    indexes: self.indexes.iter().map(rename).collect(),
                    partition_range: Some(DateRange {
                        start: range.start,
                        end: range.end.min(partitioning.build_range.end),
                    }),
                    table_name,
                    ..self.clone()
                }
            })
            .collect())
    }

    /// Formatted end of the build range, recorded with partition builds.
    pub fn build_range_end(&self) -> Option<String> {
        self.partitioning.as_ref().map(|p| format_timestamp(p.build_range.end))
    }

    /// What the table looks like: hashed into the structure version.
    ///
    /// Partition parameters stay unsubstituted, so it covers the whole
    /// partition range rather than one load range.
    pub fn structure_key(&self) -> Value {
        json!({
            "sql": self.sql,
            "load_sql": self.load_sql,
            "indexes": self.indexes,
            "unique_key_columns": self.unique_key_columns,
        })
    }

    /// What the data is: hashed with the refresh key results into the content
    /// version.
    pub fn content_key(&self) -> Value {
        json!({
            "structure": self.structure_key(),
            "partition_range": self.partition_range.map(|r| [format_timestamp(r.start), format_timestamp(r.end)]),
        })
    }

    fn substitute(&self, query: &QueryWithParams) -> QueryWithParams {
        let Some(range) = self.partition_range else {
            return query.clone();
        };
        let params = query
            .params
            .iter()
            .map(|param| match param.as_str() {
                Some(FROM_PARTITION_RANGE) => Value::from(format_timestamp(range.start)),
                Some(TO_PARTITION_RANGE) => Value::from(format_timestamp(range.end)),
                _ => param.clone(),
            })
            .collect();
        QueryWithParams { sql: query.sql.clone(), params }
    }

    fn retarget(&self, query: &QueryWithParams, physical: &str) -> QueryWithParams {
        let query = self.substitute(query);
        QueryWithParams {
            sql: query.sql.replacen(&self.table_name, physical, 1),
            params: query.params,
        }
    }

    /// The load statement creating `physical` instead of the logical table.
    pub fn load_query(&self, physical: &str) -> QueryWithParams {
        self.retarget(&self.load_sql, physical)
    }

    /// The bare `SELECT`, for paths that don't create a table on the source.
    pub fn select_query(&self) -> QueryWithParams {
        self.substitute(&self.sql)
    }

    pub fn index_queries(&self, physical: &str) -> Vec<QueryWithParams> {
        self.indexes.iter().map(|index| self.retarget(index, physical)).collect()
    }

    pub fn invalidation_queries(&self) -> Vec<QueryWithParams> {
        self.invalidate_key_queries.iter().map(|query| self.substitute(query)).collect()
    }
}
