//! Pipeline Error Types
//!
//! Every failure that leaves the pipeline is classified into one of the kinds
//! below. The kind decides whether the build is retried, whether the caller
//! may see the message, and whether it is logged with a correlation id.
//!
//! Kinds are `Clone`: a Build Queue job delivers one classification to every
//! caller waiting on it.

use derive_more::{Display, Error};
use preagg_cache::error::{Error as CacheError, ErrorKind as CacheErrorKind};
use preagg_driver::error::{Error as DriverError, ErrorKind as DriverErrorKind};
use preagg_version::error::Error as VersionError;
use std::sync::atomic::{AtomicU64, Ordering};
use time::OffsetDateTime;

/// A pipeline error with automatic location tracking.
pub type Error = exn::Exn<ErrorKind>;
/// Result type alias for pipeline operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Ties an opaque error shown to a caller to the log entry with the details.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[display("{_0:016x}")]
pub struct CorrelationId(u64);
impl CorrelationId {
    pub fn generate() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        let mut hasher = blake3::Hasher::new();
        hasher.update(&OffsetDateTime::now_utc().unix_timestamp_nanos().to_le_bytes());
        hasher.update(&COUNTER.fetch_add(1, Ordering::Relaxed).to_le_bytes());
        hasher.update(&std::process::id().to_le_bytes());
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&hasher.finalize().as_bytes()[..8]);
        Self(u64::from_le_bytes(bytes))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum TimeoutKind {
    /// The build ran longer than the queue's execution timeout.
    #[display("execution")]
    Execution,
    /// A driver gave up waiting on an asynchronous backend job.
    #[display("poll")]
    Poll,
}

#[derive(Debug, Clone, Display, Error)]
pub enum ErrorKind {
    /// Malformed input. The only kind whose message reaches end users as is.
    #[display("{_0}")]
    User(#[error(not(source))] String),
    /// Connection loss or pool exhaustion that outlived the retries.
    #[display("transient driver failure (correlation id {_0})")]
    Transient(#[error(not(source))] CorrelationId),
    #[display("{_0} timeout")]
    Timeout(#[error(not(source))] TimeoutKind),
    /// The build is still running; ask again later. Not a failure.
    #[display("pre-aggregation is still being built")]
    ContinueWait,
    #[display("build canceled")]
    Canceled,
    /// A refresh key query failed, so freshness is unknown.
    #[display("unable to evaluate refresh keys (correlation id {_0})")]
    Invalidation(#[error(not(source))] CorrelationId),
    #[display("configuration error: {_0}")]
    Config(#[error(not(source))] String),
    #[display("internal error (correlation id {_0})")]
    Unexpected(#[error(not(source))] CorrelationId),
}

impl ErrorKind {
    /// Returns `true` if retrying might succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_))
    }

    /// Text that is safe to show whoever asked for the pre-aggregation.
    pub fn public_message(&self) -> String {
        match self {
            Self::User(message) => message.clone(),
            Self::Timeout(_) | Self::ContinueWait | Self::Canceled => self.to_string(),
            Self::Transient(id) | Self::Invalidation(id) | Self::Unexpected(id) => {
                format!("Internal error (correlation id {id})")
            },
            Self::Config(_) => "Internal error".to_string(),
        }
    }

    /// Classify a driver failure and wrap it.
    #[track_caller]
    pub fn driver(err: DriverError) -> Error {
        let kind = classify(&err);
        err.raise(kind)
    }

    /// Registry failures: lock contention is transient, anything else is
    /// unexpected.
    #[track_caller]
    pub(crate) fn registry(err: CacheError) -> Error {
        let id = CorrelationId::generate();
        let kind = match &*err {
            CacheErrorKind::Database => {
                tracing::warn!(correlation_id = %id, error = ?err, "Registry unavailable");
                Self::Transient(id)
            },
            CacheErrorKind::Migration | CacheErrorKind::InvalidData(_) => {
                tracing::error!(correlation_id = %id, error = ?err, "Registry failure");
                Self::Unexpected(id)
            },
        };
        err.raise(kind)
    }

    #[track_caller]
    pub(crate) fn version(err: VersionError) -> Error {
        let id = CorrelationId::generate();
        tracing::error!(correlation_id = %id, error = ?err, "Unable to compute pre-aggregation version");
        err.raise(Self::Unexpected(id))
    }
}

/// Map a driver error onto the pipeline taxonomy.
///
/// Non-user failures get a fresh correlation id and are logged here, once,
/// with the full error tree.
pub fn classify(err: &DriverError) -> ErrorKind {
    match &**err {
        DriverErrorKind::User(message) => ErrorKind::User(message.clone()),
        DriverErrorKind::EmptyResult => ErrorKind::User(err.to_string()),
        DriverErrorKind::Timeout(_) => ErrorKind::Timeout(TimeoutKind::Poll),
        DriverErrorKind::Canceled => ErrorKind::Canceled,
        DriverErrorKind::Connection(_) | DriverErrorKind::PoolExhausted | DriverErrorKind::Io(_) => {
            let id = CorrelationId::generate();
            tracing::warn!(correlation_id = %id, error = ?err, "Transient driver failure");
            ErrorKind::Transient(id)
        },
        DriverErrorKind::ReadOnly(_)
        | DriverErrorKind::Unsupported(_)
        | DriverErrorKind::TableNotFound(_)
        | DriverErrorKind::Csv(_)
        | DriverErrorKind::Backend(_) => {
            let id = CorrelationId::generate();
            tracing::error!(correlation_id = %id, error = ?err, "Unexpected driver failure");
            ErrorKind::Unexpected(id)
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use std::io::Error as IoError;

    fn classified(kind: DriverErrorKind) -> ErrorKind {
        classify(&exn::Exn::from(kind))
    }

    #[test]
    fn test_user_errors_pass_through_verbatim() {
        let kind = classified(DriverErrorKind::User("syntax error at or near \"FORM\"".into()));
        assert!(matches!(&kind, ErrorKind::User(_)));
        assert_eq!(kind.public_message(), "syntax error at or near \"FORM\"");
    }

    #[rstest]
    #[case(DriverErrorKind::Connection("reset".into()))]
    #[case(DriverErrorKind::PoolExhausted)]
    #[case(DriverErrorKind::Io(IoError::other("broken pipe")))]
    fn test_transient(#[case] kind: DriverErrorKind) {
        let kind = classified(kind);
        assert!(matches!(kind, ErrorKind::Transient(_)));
        assert!(kind.is_retryable());
    }

    #[rstest]
    #[case(DriverErrorKind::Backend("segfault in storage engine".into()))]
    #[case(DriverErrorKind::TableNotFound("preagg.t".into()))]
    #[case(DriverErrorKind::Unsupported("unload"))]
    fn test_unexpected_is_opaque(#[case] kind: DriverErrorKind) {
        let kind = classified(kind);
        let ErrorKind::Unexpected(id) = &kind else {
            panic!("expected unexpected, got {kind:?}");
        };
        assert!(!kind.is_retryable());
        let message = kind.public_message();
        assert!(message.contains(&id.to_string()));
        assert!(!message.contains("segfault"));
    }

    #[test]
    fn test_timeouts_and_cancel() {
        assert!(matches!(
            classified(DriverErrorKind::Timeout("unload job".into())),
            ErrorKind::Timeout(TimeoutKind::Poll)
        ));
        assert!(matches!(classified(DriverErrorKind::Canceled), ErrorKind::Canceled));
        assert!(matches!(classified(DriverErrorKind::EmptyResult), ErrorKind::User(_)));
    }

    #[test]
    fn test_correlation_ids_differ() {
        let a = CorrelationId::generate();
        let b = CorrelationId::generate();
        assert_ne!(a, b);
        assert_eq!(a.to_string().len(), 16);
    }

    #[test]
    fn test_driver_keeps_the_tree() {
        let err = ErrorKind::driver(exn::Exn::from(DriverErrorKind::User("bad".into())));
        assert!(matches!(&*err, ErrorKind::User(message) if message == "bad"));
    }
}
