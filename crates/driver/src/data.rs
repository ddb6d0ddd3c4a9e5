//! Table payloads moved between drivers.

use crate::DriverHandle;
use crate::csv::CsvFile;
use crate::error::Result;
use crate::models::{Column, QueryWithParams, Row};
use futures::Stream;
use std::fmt;
use std::pin::Pin;

/// Rows produced lazily by a source driver.
pub type RowStream = Pin<Box<dyn Stream<Item = Result<Row>> + Send>>;

type ReleaseHook = Box<dyn FnOnce() + Send>;

/// A source the target driver reads from lazily instead of receiving a copy
/// of the rows up front.
#[derive(Clone)]
pub struct StreamingSource {
    /// Name the target registers the source under.
    pub name: String,
    pub driver: DriverHandle,
    pub query: QueryWithParams,
}
impl fmt::Debug for StreamingSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamingSource")
            .field("name", &self.name)
            .field("driver", &self.driver.name())
            .field("query", &self.query.sql)
            .finish()
    }
}

pub enum Payload {
    Rows(Vec<Row>),
    Csv { files: Vec<CsvFile>, header: bool },
    Stream(RowStream),
    Source(StreamingSource),
}
impl Payload {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Rows(_) => "rows",
            Self::Csv { .. } => "csv",
            Self::Stream(_) => "stream",
            Self::Source(_) => "streaming-source",
        }
    }
}
impl fmt::Debug for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Rows(rows) => f.debug_tuple("Rows").field(&rows.len()).finish(),
            Self::Csv { files, header } => {
                f.debug_struct("Csv").field("files", files).field("header", header).finish()
            },
            Self::Stream(_) => f.write_str("Stream"),
            Self::Source(source) => f.debug_tuple("Source").field(source).finish(),
        }
    }
}

/// Data downloaded from a source driver, ready to be uploaded to a target.
///
/// A `TableData` may hold resources: spill files on disk, an open cursor on
/// the source. They are released exactly once, either explicitly through
/// [`release()`](Self::release) or when the value is dropped.
pub struct TableData {
    payload: Payload,
    pub types: Vec<Column>,
    on_release: Vec<ReleaseHook>,
    released: bool,
}

impl fmt::Debug for TableData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TableData")
            .field("payload", &self.payload)
            .field("types", &self.types)
            .field("released", &self.released)
            .finish_non_exhaustive()
    }
}

impl TableData {
    pub fn new(payload: Payload, types: Vec<Column>) -> Self {
        Self {
            payload,
            types,
            on_release: Vec::new(),
            released: false,
        }
    }

    pub fn rows(rows: Vec<Row>, types: Vec<Column>) -> Self {
        Self::new(Payload::Rows(rows), types)
    }

    pub fn csv(files: Vec<CsvFile>, header: bool, types: Vec<Column>) -> Self {
        Self::new(Payload::Csv { files, header }, types)
    }

    pub fn stream(stream: RowStream, types: Vec<Column>) -> Self {
        Self::new(Payload::Stream(stream), types)
    }

    pub fn source(source: StreamingSource, types: Vec<Column>) -> Self {
        Self::new(Payload::Source(source), types)
    }

    /// Run `hook` when this data is released (e.g. close a cursor).
    pub fn on_release(mut self, hook: impl FnOnce() + Send + 'static) -> Self {
        self.on_release.push(Box::new(hook));
        self
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    /// Take the payload out for consumption, leaving an empty row set behind.
    ///
    /// Spill files taken this way are owned by the caller; release hooks stay
    /// with the `TableData`.
    pub fn take_payload(&mut self) -> Payload {
        std::mem::replace(&mut self.payload, Payload::Rows(Vec::new()))
    }

    pub fn replace_payload(&mut self, payload: Payload) {
        self.payload = payload;
    }

    pub fn is_released(&self) -> bool {
        self.released
    }

    /// Free everything this data holds. Only the first call does anything;
    /// it returns `true`.
    pub fn release(&mut self) -> bool {
        if self.released {
            return false;
        }
        self.released = true;
        if let Payload::Csv { files, .. } = &mut self.payload {
            for file in files {
                if let Err(err) = file.delete() {
                    tracing::warn!(error = %err, "Unable to delete CSV spill file");
                }
            }
        }
        self.payload = Payload::Rows(Vec::new());
        for hook in self.on_release.drain(..) {
            hook();
        }
        true
    }
}

impl Drop for TableData {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ColumnType;
    use serde_json::json;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counted(counter: &Arc<AtomicUsize>) -> impl FnOnce() + Send + 'static {
        let counter = counter.clone();
        move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_release_runs_hooks_once() {
        let released = Arc::new(AtomicUsize::new(0));
        let mut data = TableData::rows(Vec::new(), Vec::new()).on_release(counted(&released));
        assert!(data.release());
        assert!(!data.release());
        drop(data);
        assert_eq!(released.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_drop_releases() {
        let released = Arc::new(AtomicUsize::new(0));
        drop(TableData::rows(Vec::new(), Vec::new()).on_release(counted(&released)));
        assert_eq!(released.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_release_deletes_spill_files() {
        let columns = vec![Column::new("n", ColumnType::Int)];
        let rows: Vec<Row> = json!([{"n": 1}])
            .as_array()
            .into_iter()
            .flatten()
            .filter_map(|v| v.as_object().cloned())
            .collect();
        let file = CsvFile::write(&columns, &rows, true).unwrap();
        let path = file.path().unwrap().to_path_buf();
        let mut data = TableData::csv(vec![file], true, columns);
        assert!(path.exists());
        data.release();
        assert!(!path.exists());
    }
}
