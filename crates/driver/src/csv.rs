//! Gzip-compressed CSV spill files.
//!
//! Downloads and unloads that don't fit comfortably in memory are written to
//! temporary `*.csv.gz` files. A [`CsvFile`] owns its file: it is removed when
//! [`delete()`](CsvFile::delete) is called or, failing that, when the value is
//! dropped. Everything here is blocking I/O; async callers wrap it in
//! [`spawn_blocking`](tokio::task::spawn_blocking).

use crate::error::{ErrorKind, Result};
use crate::models::{Column, Row};
use exn::{OptionExt, ResultExt};
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use serde_json::Value;
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;
use tempfile::TempPath;

#[derive(Debug)]
pub struct CsvFile {
    path: Option<TempPath>,
    rows: usize,
}

fn cell(value: Option<&Value>) -> String {
    match value {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
    }
}

impl CsvFile {
    /// Write `rows` as a new temporary CSV file, with columns in the order of
    /// `columns`.
    pub fn write(columns: &[Column], rows: &[Row], header: bool) -> Result<Self> {
        let file = tempfile::Builder::new()
            .prefix("preagg-")
            .suffix(".csv.gz")
            .tempfile()
            .or_raise(|| ErrorKind::Csv("unable to create temporary CSV file".into()))?;
        let (file, path) = file.into_parts();
        let encoder = GzEncoder::new(BufWriter::new(file), Compression::fast());
        let mut writer = csv::Writer::from_writer(encoder);
        if header {
            writer.write_record(columns.iter().map(|c| c.name.as_str())).map_err(ErrorKind::from)?;
        }
        for row in rows {
            writer
                .write_record(columns.iter().map(|c| cell(row.get(&c.name))))
                .map_err(ErrorKind::from)?;
        }
        let encoder = writer
            .into_inner()
            .map_err(|err| ErrorKind::Io(err.into_error()))?;
        encoder.finish().map_err(ErrorKind::from)?;
        tracing::debug!(path = %path.display(), rows = rows.len(), "Wrote CSV spill file");
        Ok(Self { path: Some(path), rows: rows.len() })
    }

    /// Read the file back into rows, converting cells with the column types.
    pub fn read(&self, columns: &[Column], header: bool) -> Result<Vec<Row>> {
        let path = self
            .path
            .as_deref()
            .ok_or_raise(|| ErrorKind::Csv("CSV file has already been deleted".into()))?;
        let file = File::open(path).map_err(ErrorKind::from)?;
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(header)
            .from_reader(GzDecoder::new(BufReader::new(file)));
        let mut rows = Vec::with_capacity(self.rows);
        for record in reader.records() {
            let record = record.map_err(ErrorKind::from)?;
            if record.len() != columns.len() {
                exn::bail!(ErrorKind::Csv(format!(
                    "expected {} columns, found {}",
                    columns.len(),
                    record.len()
                )));
            }
            rows.push(
                columns
                    .iter()
                    .zip(record.iter())
                    .map(|(column, value)| (column.name.clone(), column.kind.parse(value)))
                    .collect(),
            );
        }
        Ok(rows)
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    /// Remove the file from disk. Returns `false` if it was already deleted.
    pub fn delete(&mut self) -> Result<bool> {
        match self.path.take() {
            Some(path) => {
                path.close().map_err(ErrorKind::from)?;
                Ok(true)
            },
            None => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ColumnType;
    use serde_json::json;

    fn columns() -> Vec<Column> {
        vec![Column::new("day", ColumnType::Date), Column::new("orders", ColumnType::Int)]
    }

    fn rows() -> Vec<Row> {
        [json!({"day": "2024-01-01", "orders": 3}), json!({"day": "2024-01-02", "orders": null})]
            .into_iter()
            .filter_map(|v| v.as_object().cloned())
            .collect()
    }

    #[test]
    fn test_written_file_reads_back_typed_rows() {
        let file = CsvFile::write(&columns(), &rows(), true).unwrap();
        assert_eq!(file.rows(), 2);
        assert!(file.path().unwrap().to_string_lossy().ends_with(".csv.gz"));
        assert_eq!(file.read(&columns(), true).unwrap(), rows());
    }

    #[test]
    fn test_headerless_file() {
        let file = CsvFile::write(&columns(), &rows(), false).unwrap();
        assert_eq!(file.read(&columns(), false).unwrap(), rows());
    }

    #[test]
    fn test_delete_happens_once() {
        let mut file = CsvFile::write(&columns(), &rows(), true).unwrap();
        let path = file.path().unwrap().to_path_buf();
        assert!(path.exists());
        assert!(file.delete().unwrap());
        assert!(!path.exists());
        assert!(!file.delete().unwrap());
        assert!(file.read(&columns(), true).is_err());
    }

    #[test]
    fn test_drop_removes_file() {
        let file = CsvFile::write(&columns(), &rows(), true).unwrap();
        let path = file.path().unwrap().to_path_buf();
        drop(file);
        assert!(!path.exists());
    }
}
