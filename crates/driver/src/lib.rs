pub mod csv;
pub mod data;
pub mod driver;
pub mod error;
mod models;

pub use crate::data::{Payload, RowStream, StreamingSource, TableData};
pub use crate::driver::{Driver, ReadOnlyDriver, spill_to_csv};
pub use crate::models::{
    Capabilities, Column, ColumnType, DownloadOptions, QueryWithParams, Row, StreamOptions, UnloadOptions,
    UnloadSource, infer_column_types, split_table_name,
};
pub use preagg_asyncutils::CancelToken;
use std::sync::Arc;

pub type DriverHandle = Arc<dyn Driver + Send + Sync>;
