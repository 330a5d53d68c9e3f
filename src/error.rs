//! Error types for bulk-reindex
//!
//! This module defines the error hierarchy for the reindex engine:
//! - Scroll cursor errors (open, fetch, keep-alive expiry)
//! - Bulk write errors (whole-request failures, rejections)
//! - Script and transform errors
//! - Job configuration errors
//! - Storage errors for the SQLite-backed index and task store
//! - Slice worker errors
//!
//! Per-item write failures are NOT errors here: they are data, carried as
//! [`crate::doc::BulkItemOutcome`] and surfaced in the job status.

use thiserror::Error;

/// Top-level error type for the reindex engine
#[derive(Error, Debug)]
pub enum ReindexError {
    /// Scroll cursor errors
    #[error("Cursor error: {0}")]
    Cursor(#[from] CursorError),

    /// Bulk write errors
    #[error("Write error: {0}")]
    Write(#[from] WriteError),

    /// Record transformation errors (including script failures)
    #[error("Transform error: {0}")]
    Transform(#[from] TransformError),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Storage errors
    #[error("Storage error: {0}")]
    Store(#[from] StoreError),

    /// Worker/concurrency errors
    #[error("Worker error: {0}")]
    Worker(#[from] WorkerError),

    /// No running or persisted task with this id
    #[error("Task not found: {0}")]
    TaskNotFound(String),

    /// Waiting for a task timed out
    #[error("Timed out waiting for task {0}")]
    WaitTimedOut(String),
}

impl ReindexError {
    /// Errors that end the slice they happen in
    pub fn is_fatal_for_slice(&self) -> bool {
        matches!(
            self,
            ReindexError::Cursor(_)
                | ReindexError::Write(_)
                | ReindexError::Transform(_)
                | ReindexError::Worker(_)
        )
    }
}

/// Scroll cursor errors
#[derive(Error, Debug, Clone)]
pub enum CursorError {
    /// The initial search failed
    #[error("Failed to open scroll over {indices}: {reason}")]
    OpenFailed { indices: String, reason: String },

    /// The cursor is gone: its keep-alive lapsed or it was never opened
    #[error("Scroll '{scroll_id}' expired or does not exist")]
    Expired { scroll_id: String },

    /// Fetching the next page failed
    #[error("Failed to fetch next page of scroll '{scroll_id}': {reason}")]
    FetchFailed { scroll_id: String, reason: String },

    /// Clearing the scroll failed
    #[error("Failed to clear scroll '{scroll_id}': {reason}")]
    CloseFailed { scroll_id: String, reason: String },
}

/// Bulk write errors (whole request, not per item)
#[derive(Error, Debug, Clone)]
pub enum WriteError {
    /// The destination rejected the request because it is overloaded
    #[error("Bulk request rejected: {reason}")]
    Rejected { reason: String },

    /// The bulk request failed as a whole
    #[error("Bulk request failed: {reason}")]
    Failed { reason: String },

    /// The destination returned a different number of item outcomes than
    /// directives submitted
    #[error("Bulk response has {actual} items for {expected} directives")]
    Misaligned { expected: usize, actual: usize },
}

impl WriteError {
    /// Check if the request can be resubmitted after a backoff
    pub fn is_retryable(&self) -> bool {
        matches!(self, WriteError::Rejected { .. })
    }
}

/// Errors raised by a script while processing one record
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ScriptError {
    /// A required script parameter is missing
    #[error("Script '{script}' requires parameter '{param}'")]
    MissingParam { script: String, param: String },

    /// A script parameter has the wrong shape
    #[error("Script '{script}' parameter '{param}' is invalid: {reason}")]
    InvalidParam {
        script: String,
        param: String,
        reason: String,
    },

    /// The script set an operation the engine does not understand
    #[error("Unsupported operation [{op}] set by script; expected one of [index, noop, delete]")]
    UnsupportedOp { op: String },

    /// The script itself failed
    #[error("Script '{script}' failed: {message}")]
    Failed { script: String, message: String },
}

/// Errors converting a source record into a write directive
#[derive(Error, Debug, Clone)]
pub enum TransformError {
    /// Script failure for a specific record
    #[error("Script failed on document '{id}': {source}")]
    Script { id: String, source: ScriptError },

    /// The record's source is not a JSON object
    #[error("Source of document '{id}' is not a JSON object: {reason}")]
    InvalidSource { id: String, reason: String },

    /// A preserved metadata field could not be coerced
    #[error("Metadata field '{field}' of document '{id}' is invalid: {reason}")]
    InvalidMetadata {
        id: String,
        field: String,
        reason: String,
    },
}

/// Job configuration and validation errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    /// `size` below -1
    #[error("size should be greater than 0 if the request is limited to some number of documents or -1 if it isn't but it was [{size}]")]
    InvalidSize { size: i64 },

    /// Slice count out of range
    #[error("Invalid slice count {slices}: must be between 1 and {max}")]
    InvalidSlices { slices: u32, max: u32 },

    /// Batch size out of range
    #[error("Invalid batch size {size}: must be between {min} and {max}")]
    InvalidBatchSize { size: usize, min: usize, max: usize },

    /// Unparseable or non-positive requests per second
    #[error("requests_per_second must be more than 0 or -1 for unlimited but was [{value}]")]
    InvalidRequestsPerSecond { value: String },

    /// Unknown conflicts mode
    #[error("conflicts may only be \"proceed\" or \"abort\" but was [{value}]")]
    InvalidConflicts { value: String },

    /// Unknown version type
    #[error("Invalid version type [{value}]: expected internal, external, external_gte, force or reindex")]
    InvalidVersionType { value: String },

    /// An explicit pagination offset on the source search
    #[error("from is not supported in this context")]
    FromNotSupported,

    /// Source search names no index
    #[error("use _all if you really want to copy from all existing indexes")]
    MissingSource,

    /// Destination index not set
    #[error("index must be specified")]
    MissingDestination,

    /// Destination is also a source
    #[error("reindex cannot write into an index its reading from [{index}]")]
    SelfReindex { index: String },

    /// Index name fails validation
    #[error("Invalid index name [{name}]: {reason}")]
    InvalidIndexName { name: String, reason: String },

    /// Script name not present in the registry
    #[error("Unknown script [{name}]")]
    UnknownScript { name: String },

    /// Malformed `key=value` argument
    #[error("Invalid parameter '{value}': expected key=value")]
    InvalidParam { value: String },

    /// Scroll keep-alive of zero or beyond the limit
    #[error("Scroll keep-alive of {secs}s is out of range (must be > 0 and at most {max}s)")]
    InvalidKeepAlive { secs: u64, max: u64 },
}

/// Storage errors for the SQLite index and task store
#[derive(Error, Debug)]
pub enum StoreError {
    /// SQLite error
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// JSON (de)serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Stored data could not be interpreted
    #[error("Corrupt record: {0}")]
    Corrupt(String),
}

/// Slice worker errors
#[derive(Error, Debug)]
pub enum WorkerError {
    /// Worker panicked
    #[error("Slice {slice} panicked: {message}")]
    Panicked { slice: u32, message: String },

    /// Worker thread could not be started
    #[error("Failed to start slice {slice}: {reason}")]
    SpawnFailed { slice: u32, reason: String },
}

/// Result type alias for ReindexError
pub type Result<T> = std::result::Result<T, ReindexError>;

/// Result type alias for StoreError
pub type StoreResult<T> = std::result::Result<T, StoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_error_retryable() {
        let rejected = WriteError::Rejected {
            reason: "queue full".into(),
        };
        assert!(rejected.is_retryable());

        let failed = WriteError::Failed {
            reason: "disk full".into(),
        };
        assert!(!failed.is_retryable());
        assert!(!WriteError::Misaligned {
            expected: 2,
            actual: 1
        }
        .is_retryable());
    }

    #[test]
    fn test_fatal_for_slice() {
        let cursor: ReindexError = CursorError::Expired {
            scroll_id: "s".into(),
        }
        .into();
        assert!(cursor.is_fatal_for_slice());

        let config: ReindexError = ConfigError::MissingSource.into();
        assert!(!config.is_fatal_for_slice());
        assert!(!ReindexError::TaskNotFound("t".into()).is_fatal_for_slice());
    }

    #[test]
    fn test_error_conversion() {
        let cursor_err = CursorError::Expired {
            scroll_id: "scroll-1".into(),
        };
        let err: ReindexError = cursor_err.into();
        assert!(matches!(err, ReindexError::Cursor(_)));
    }

    #[test]
    fn test_config_error_messages() {
        assert_eq!(
            ConfigError::FromNotSupported.to_string(),
            "from is not supported in this context"
        );
        assert_eq!(
            ConfigError::InvalidConflicts {
                value: "skip".into()
            }
            .to_string(),
            "conflicts may only be \"proceed\" or \"abort\" but was [skip]"
        );
    }
}
