//! Version Error Types

use derive_more::{Display, Error};

/// A version error with automatic location tracking.
pub type Error = exn::Exn<ErrorKind>;
/// Result type alias for version operations.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Display, Error)]
pub enum ErrorKind {
    /// The key could not be serialized into canonical JSON.
    #[display("unable to serialize version key")]
    InvalidKey,
    /// Not a physical pre-aggregation table name.
    #[display("invalid physical table name: {_0}")]
    InvalidName(#[error(not(source))] String),
}

impl ErrorKind {
    /// Returns `true` if retrying might succeed.
    pub fn is_retryable(&self) -> bool {
        false
    }
}
