//! Error types for the query core

use thiserror::Error;

/// Stable error codes carried in result metadata and surfaced to callers.
///
/// These names are part of the external contract and must not change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// `start >= end`, or duration exceeds the configured maximum
    InvalidTimeRange,
    /// Unknown sensor, empty sensor set, non-positive point budget, unknown
    /// aggregation
    InvalidParameter,
    /// All backends transient-failing after retries
    BackendUnavailable,
    /// Permanent read error on a partition (schema, corruption)
    ReadFailed,
    /// Query deadline elapsed
    DeadlineExceeded,
    /// Admission wait exceeded the deadline
    CapacityExceeded,
}

impl ErrorKind {
    /// The stable wire name of this error kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::InvalidTimeRange => "INVALID_TIME_RANGE",
            ErrorKind::InvalidParameter => "INVALID_PARAMETER",
            ErrorKind::BackendUnavailable => "BACKEND_UNAVAILABLE",
            ErrorKind::ReadFailed => "READ_FAILED",
            ErrorKind::DeadlineExceeded => "DEADLINE_EXCEEDED",
            ErrorKind::CapacityExceeded => "CAPACITY_EXCEEDED",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Main error type for the query core
#[derive(Error, Debug)]
pub enum Error {
    /// Invalid query time range
    #[error("invalid time range: {message}")]
    InvalidTimeRange {
        /// Human-readable description of the violation
        message: String,
    },

    /// Invalid query parameter
    #[error("invalid parameter '{parameter}': {message}")]
    InvalidParameter {
        /// Name of the offending parameter
        parameter: String,
        /// Human-readable description of the violation
        message: String,
    },

    /// All backends failed transiently after retries
    #[error("no backend available: {message}")]
    BackendUnavailable {
        /// Description of the last failures observed
        message: String,
    },

    /// Permanent read failure on a partition
    #[error("read failed: {0}")]
    ReadFailed(#[from] StorageError),

    /// Query deadline elapsed
    #[error("query deadline of {deadline_ms} ms exceeded")]
    DeadlineExceeded {
        /// The deadline that elapsed, in milliseconds
        deadline_ms: u64,
    },

    /// Admission semaphore wait exceeded the deadline
    #[error("query admission timed out: {waiting} queries at the concurrency cap")]
    CapacityExceeded {
        /// Number of queries already admitted when the wait gave up
        waiting: usize,
    },

    /// Configuration error (construction-time, not query-time)
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Error relayed from a shared single-flight computation
    #[error("{message}")]
    Shared {
        /// Kind of the original error
        kind: ErrorKind,
        /// Message of the original error
        message: String,
    },
}

impl Error {
    /// The stable error code for this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::InvalidTimeRange { .. } => ErrorKind::InvalidTimeRange,
            Error::InvalidParameter { .. } => ErrorKind::InvalidParameter,
            Error::BackendUnavailable { .. } => ErrorKind::BackendUnavailable,
            Error::ReadFailed(_) => ErrorKind::ReadFailed,
            Error::DeadlineExceeded { .. } => ErrorKind::DeadlineExceeded,
            Error::CapacityExceeded { .. } => ErrorKind::CapacityExceeded,
            Error::Configuration(_) => ErrorKind::InvalidParameter,
            Error::Shared { kind, .. } => *kind,
        }
    }

    /// The offending parameter name, when applicable.
    pub fn parameter(&self) -> Option<&str> {
        match self {
            Error::InvalidParameter { parameter, .. } => Some(parameter),
            _ => None,
        }
    }

    /// Rebuild an error from a shared single-flight slot.
    ///
    /// Single-flight waiters receive the leader's error by kind and message;
    /// the original error value stays with the leader.
    pub fn from_shared(kind: ErrorKind, message: impl Into<String>) -> Self {
        Error::Shared {
            kind,
            message: message.into(),
        }
    }
}

/// Storage-layer errors
///
/// Transient variants are retried by the backend registry; permanent variants
/// surface as `READ_FAILED`. `object_store`, `parquet`, and `arrow` errors are
/// boxed to keep the enum small on the stack.
#[derive(Error, Debug)]
pub enum StorageError {
    /// IO operation failed
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Object store operation failed
    #[error("object store error: {0}")]
    ObjectStore(Box<object_store::Error>),

    /// Parquet decode failed
    #[error("parquet error in '{path}': {source}")]
    Parquet {
        /// Partition path being decoded
        path: String,
        /// Underlying parquet error
        source: Box<parquet::errors::ParquetError>,
    },

    /// Arrow error while materializing columns
    #[error("arrow error in '{path}': {source}")]
    Arrow {
        /// Partition path being decoded
        path: String,
        /// Underlying arrow error
        source: Box<arrow::error::ArrowError>,
    },

    /// Partition schema does not match the storage contract
    #[error("schema mismatch in '{path}': {message}")]
    SchemaMismatch {
        /// Partition path with the offending schema
        path: String,
        /// What was expected and what was found
        message: String,
    },
}

impl From<object_store::Error> for StorageError {
    fn from(err: object_store::Error) -> Self {
        Self::ObjectStore(Box::new(err))
    }
}

impl StorageError {
    /// Whether this error denotes a missing object rather than a failure.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            StorageError::ObjectStore(e) if matches!(**e, object_store::Error::NotFound { .. })
        )
    }

    /// Whether the operation is worth retrying on the same backend.
    ///
    /// Network errors, 5xx responses, and timeouts surface through
    /// `object_store` as non-NotFound variants; decode and schema errors
    /// never become valid by retrying.
    pub fn is_transient(&self) -> bool {
        match self {
            StorageError::ObjectStore(e) => {
                !matches!(**e, object_store::Error::NotFound { .. })
            }
            StorageError::Io(_) => true,
            StorageError::Parquet { .. }
            | StorageError::Arrow { .. }
            | StorageError::SchemaMismatch { .. } => false,
        }
    }
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kind_names_are_stable() {
        assert_eq!(ErrorKind::InvalidTimeRange.as_str(), "INVALID_TIME_RANGE");
        assert_eq!(ErrorKind::InvalidParameter.as_str(), "INVALID_PARAMETER");
        assert_eq!(
            ErrorKind::BackendUnavailable.as_str(),
            "BACKEND_UNAVAILABLE"
        );
        assert_eq!(ErrorKind::ReadFailed.as_str(), "READ_FAILED");
        assert_eq!(ErrorKind::DeadlineExceeded.as_str(), "DEADLINE_EXCEEDED");
        assert_eq!(ErrorKind::CapacityExceeded.as_str(), "CAPACITY_EXCEEDED");
    }

    #[test]
    fn test_parameter_is_carried() {
        let err = Error::InvalidParameter {
            parameter: "max_points".to_string(),
            message: "must be positive".to_string(),
        };
        assert_eq!(err.parameter(), Some("max_points"));
        assert_eq!(err.kind(), ErrorKind::InvalidParameter);
    }

    #[test]
    fn test_shared_error_preserves_kind() {
        let err = Error::from_shared(ErrorKind::ReadFailed, "corrupt partition");
        assert_eq!(err.kind(), ErrorKind::ReadFailed);
        assert!(err.to_string().contains("corrupt partition"));
    }

    #[test]
    fn test_not_found_classification() {
        let err: StorageError = object_store::Error::NotFound {
            path: "a/b".to_string(),
            source: "gone".into(),
        }
        .into();
        assert!(err.is_not_found());
        assert!(!err.is_transient());
    }

    #[test]
    fn test_schema_mismatch_is_permanent() {
        let err = StorageError::SchemaMismatch {
            path: "a/2024/01/01/00/s1.parquet".to_string(),
            message: "timestamp column missing".to_string(),
        };
        assert!(!err.is_transient());
        assert!(!err.is_not_found());
    }
}
