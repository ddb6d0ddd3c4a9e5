//! Types exchanged across the driver contract.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// One result row, keyed by column name.
pub type Row = serde_json::Map<String, Value>;

/// A SQL statement together with its positional parameters.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct QueryWithParams {
    pub sql: String,
    #[serde(default)]
    pub params: Vec<Value>,
}
impl QueryWithParams {
    pub fn new(sql: impl Into<String>) -> Self {
        Self { sql: sql.into(), params: Vec::new() }
    }

    pub fn with_params(sql: impl Into<String>, params: impl IntoIterator<Item = Value>) -> Self {
        Self {
            sql: sql.into(),
            params: params.into_iter().collect(),
        }
    }
}
impl fmt::Display for QueryWithParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.sql)
    }
}

/// Generic column types understood by every driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColumnType {
    Timestamp,
    Date,
    Int,
    Bigint,
    Decimal,
    Boolean,
    /// Short text (under 256 characters).
    String,
    Text,
}

/// Candidates in inference order: from more specific to less specific.
const INFERENCE_ORDER: [ColumnType; 8] = [
    ColumnType::Timestamp,
    ColumnType::Date,
    ColumnType::Int,
    ColumnType::Bigint,
    ColumnType::Decimal,
    ColumnType::Boolean,
    ColumnType::String,
    ColumnType::Text,
];

/// `YYYY-MM-DDTHH:MM:SS` prefix, as produced by most drivers for timestamps.
fn is_timestamp(text: &str) -> bool {
    const PATTERN: &[u8; 19] = b"dddd-dd-ddTdd:dd:dd";
    text.len() >= PATTERN.len()
        && text.bytes().zip(PATTERN).all(|(byte, expected)| match expected {
            b'd' => byte.is_ascii_digit(),
            literal => byte == *literal,
        })
}

fn is_date(text: &str) -> bool {
    text.len() == 10 && is_timestamp(&format!("{text}T00:00:00"))
}

fn integer(value: &Value) -> Option<i128> {
    match value {
        Value::Number(n) => n.as_i64().map(i128::from).or_else(|| n.as_u64().map(i128::from)),
        Value::String(s) => {
            let digits = s.strip_prefix('-').unwrap_or(s);
            if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
                return None;
            }
            s.parse::<i128>().ok()
        },
        _ => None,
    }
}

fn is_decimal(text: &str) -> bool {
    let unsigned = text.strip_prefix('-').unwrap_or(text);
    let (whole, fraction) = match unsigned.split_once('.') {
        Some((whole, fraction)) => (whole, Some(fraction)),
        None => (unsigned, None),
    };
    let digits = |s: &str| !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit());
    digits(whole) && fraction.is_none_or(digits)
}

impl ColumnType {
    /// Does `value` fit this type?
    ///
    /// `null` values are skipped by inference and never reach here.
    pub fn matches(&self, value: &Value) -> bool {
        let text = match value {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        match self {
            Self::Timestamp => is_timestamp(&text),
            Self::Date => is_date(&text),
            Self::Int => integer(value).is_some_and(|v| i32::try_from(v).is_ok()),
            Self::Bigint => integer(value).is_some_and(|v| i64::try_from(v).is_ok()),
            Self::Decimal => value.is_number() || is_decimal(&text),
            Self::Boolean => value.is_boolean() || text.eq_ignore_ascii_case("true") || text.eq_ignore_ascii_case("false"),
            Self::String => text.chars().count() < 256,
            Self::Text => true,
        }
    }

    /// Pick the most specific type every non-null value fits. Columns with no
    /// values at all fall back to [`Text`](Self::Text).
    pub fn infer<'a>(values: impl Iterator<Item = &'a Value> + Clone) -> Self {
        let mut present = values.filter(|v| !v.is_null()).peekable();
        if present.peek().is_none() {
            return Self::Text;
        }
        INFERENCE_ORDER
            .into_iter()
            .find(|kind| present.clone().all(|v| kind.matches(v)))
            .unwrap_or(Self::Text)
    }

    /// Convert a CSV cell back into a JSON value of this type. Empty cells are
    /// `null`.
    pub fn parse(&self, cell: &str) -> Value {
        if cell.is_empty() {
            return Value::Null;
        }
        match self {
            Self::Int | Self::Bigint => cell.parse::<i64>().map(Value::from).unwrap_or_else(|_| cell.into()),
            Self::Decimal => cell
                .parse::<f64>()
                .ok()
                .and_then(serde_json::Number::from_f64)
                .map(Value::Number)
                .unwrap_or_else(|| cell.into()),
            Self::Boolean => match cell.to_ascii_lowercase().as_str() {
                "true" | "t" | "1" => Value::Bool(true),
                "false" | "f" | "0" => Value::Bool(false),
                _ => cell.into(),
            },
            Self::Timestamp | Self::Date | Self::String | Self::Text => cell.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: ColumnType,
}
impl Column {
    pub fn new(name: impl Into<String>, kind: ColumnType) -> Self {
        Self { name: name.into(), kind }
    }
}

/// Infer column types from downloaded rows. Column order follows the first row.
///
/// Returns `None` when there are no rows to infer from.
pub fn infer_column_types(rows: &[Row]) -> Option<Vec<Column>> {
    let first = rows.first()?;
    Some(
        first
            .keys()
            .map(|name| {
                let values = rows.iter().filter_map(|row| row.get(name));
                Column::new(name, ColumnType::infer(values))
            })
            .collect(),
    )
}

/// Optional parts of the driver contract a backend implements.
///
/// These are always queried, never assumed, before a transfer strategy is
/// chosen.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Capabilities {
    /// Target can bulk-load CSV files produced by an unload.
    pub csv_import: bool,
    /// Target can ingest a row stream.
    pub stream_import: bool,
    /// Source can unload straight from a query, without building a temp table first.
    pub unload_without_temp_table: bool,
    /// Source can be registered as a lazily-ingested streaming source.
    pub streaming_source: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamOptions {
    /// Rows buffered ahead of the consumer.
    pub high_water_mark: usize,
}
impl Default for StreamOptions {
    fn default() -> Self {
        Self { high_water_mark: 10_000 }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnloadOptions {
    /// Maximum size of each exported file, in megabytes.
    pub max_file_size_mb: u64,
}
impl Default for UnloadOptions {
    fn default() -> Self {
        Self { max_file_size_mb: 64 }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DownloadOptions {
    /// Spill the downloaded rows into CSV files, for targets that import CSV.
    pub csv_import: bool,
    pub stream: StreamOptions,
}

/// What an unload exports.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnloadSource {
    /// An existing (usually temporary) table.
    Table(String),
    /// A query, for drivers that can unload without a temp table.
    Query(QueryWithParams),
}
impl fmt::Display for UnloadSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Table(table) => write!(f, "table {table}"),
            Self::Query(query) => write!(f, "query {}", query.sql),
        }
    }
}

/// Split `schema.table` into its parts. Unqualified names have no schema.
pub fn split_table_name(table: &str) -> (Option<&str>, &str) {
    match table.rsplit_once('.') {
        Some((schema, name)) => (Some(schema), name),
        None => (None, table),
    }
}
