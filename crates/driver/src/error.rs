//! Driver Error Types
//!
//! Driver errors use `exn` for automatic location tracking and error tree
//! construction. Kinds describe what the caller should *do* about the failure:
//! the pipeline classifies them into its own taxonomy, retrying the transient
//! ones and surfacing user errors verbatim.

use derive_more::{Display, Error};
use preagg_asyncutils::Canceled;
use std::io::Error as IoError;

/// A driver error with automatic location tracking.
pub type Error = exn::Exn<ErrorKind>;
/// Result type alias for driver operations.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Display, Error)]
pub enum ErrorKind {
    /// Malformed input: bad SQL, disallowed statement, wrong column type.
    #[display("{_0}")]
    User(#[error(not(source))] String),
    /// Connection to the backend was lost or could not be established.
    #[display("connection error: {_0}")]
    Connection(#[error(not(source))] String),
    /// No connection could be checked out of the pool in time.
    #[display("connection pool exhausted")]
    PoolExhausted,
    /// The backend gave up on an operation (query timeout, unload job timeout).
    #[display("timed out: {_0}")]
    Timeout(#[error(not(source))] String),
    /// The operation was interrupted by its cancellation token.
    #[display("operation canceled")]
    Canceled,
    /// A write was attempted through a read-only driver.
    #[display("{_0} is not permitted on a read-only driver")]
    ReadOnly(#[error(not(source))] &'static str),
    /// The driver does not implement this part of the contract.
    #[display("{_0} is not supported by this driver")]
    Unsupported(#[error(not(source))] &'static str),
    #[display("table not found: {_0}")]
    TableNotFound(#[error(not(source))] String),
    /// Column types can't be inferred from a result without rows.
    #[display("unable to detect column types for pre-aggregation on empty values in read-only mode")]
    EmptyResult,
    #[display("CSV error: {_0}")]
    Csv(#[error(not(source))] String),
    #[display("I/O error: {_0}")]
    Io(IoError),
    /// Anything backend-specific that doesn't fit the kinds above.
    #[display("backend error: {_0}")]
    Backend(#[error(not(source))] String),
}
impl From<IoError> for ErrorKind {
    fn from(err: IoError) -> Self {
        Self::Io(err)
    }
}
impl From<csv::Error> for ErrorKind {
    fn from(err: csv::Error) -> Self {
        match err.into_kind() {
            csv::ErrorKind::Io(err) => Self::Io(err),
            other => Self::Csv(format!("{other:?}")),
        }
    }
}
impl From<Canceled> for ErrorKind {
    fn from(_: Canceled) -> Self {
        Self::Canceled
    }
}

impl ErrorKind {
    /// Returns `true` if retrying might succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Connection(_) | Self::PoolExhausted | Self::Io(_))
    }
}
