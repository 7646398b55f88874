// ⚠️ Error taxonomy for the pipeline
// Run-level errors abort a stage; row-level issues are counted and never escalate.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use crate::aggregate::AggregateKey;

// ============================================================================
// RUN-LEVEL (fatal)
// ============================================================================

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("fetch failed: {0}")]
    Fetch(#[from] FetchError),

    #[error("parse failed: {0}")]
    Parse(#[from] ParseError),

    #[error("could not connect to store: {0}")]
    Connect(#[source] StoreError),

    #[error("store error: {0}")]
    Store(#[source] StoreError),

    #[error("commit failed, no rows from this run were persisted: {0}")]
    Commit(#[source] StoreError),

    #[error("{stage} stage timed out after {after:?}")]
    Timeout { stage: &'static str, after: Duration },

    #[error("run cancelled before commit")]
    Cancelled,

    #[error("total for {key} overflowed")]
    Overflow { key: AggregateKey },

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl PipelineError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        PipelineError::Io {
            path: path.into(),
            source,
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("blob {bucket}/{key} not found")]
    NotFound { bucket: String, key: String },

    #[error("blob {bucket}/{key} unreadable: {source}")]
    Unreadable {
        bucket: String,
        key: String,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot stage blob at {path}: {source}")]
    Staging {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("fetching {bucket}/{key} exceeded {after:?}")]
    TimedOut {
        bucket: String,
        key: String,
        after: Duration,
    },
}

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("input has no header row")]
    EmptyInput,

    #[error("required column '{0}' missing from header")]
    MissingColumn(&'static str),

    #[error("malformed CSV: {0}")]
    Csv(#[from] csv::Error),

    #[error("line {line}: invalid {field} value '{value}'")]
    InvalidValue {
        line: usize,
        field: &'static str,
        value: String,
    },

    #[error("cannot read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),

    #[error("{0}")]
    Rejected(String),
}

impl StoreError {
    /// True when the failure concerns one row's values (constraint, type)
    /// rather than the connection or the transaction as a whole.
    pub fn is_row_level(&self) -> bool {
        match self {
            StoreError::Sqlite(rusqlite::Error::SqliteFailure(err, _)) => matches!(
                err.code,
                rusqlite::ErrorCode::ConstraintViolation
                    | rusqlite::ErrorCode::TypeMismatch
                    | rusqlite::ErrorCode::TooBig
            ),
            StoreError::Sqlite(rusqlite::Error::ToSqlConversionFailure(_)) => true,
            StoreError::Rejected(_) => true,
            _ => false,
        }
    }
}

// ============================================================================
// ROW-LEVEL (recoverable)
// ============================================================================

/// Why a raw row did not become a cleaned record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RowCoercionIssue {
    Missing(&'static str),
    InvalidAmount,
    InvalidBankId,
    InvalidTimestamp,
    Encoding,
}

impl std::fmt::Display for RowCoercionIssue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RowCoercionIssue::Missing(field) => write!(f, "missing {}", field),
            RowCoercionIssue::InvalidAmount => write!(f, "non-numeric amount"),
            RowCoercionIssue::InvalidBankId => write!(f, "non-integer bank_id"),
            RowCoercionIssue::InvalidTimestamp => write!(f, "unparseable timestamp"),
            RowCoercionIssue::Encoding => write!(f, "invalid UTF-8"),
        }
    }
}

/// One aggregate row that failed to stage
#[derive(Debug, Clone, PartialEq)]
pub struct UpsertIssue {
    pub key: AggregateKey,
    pub reason: String,
}

impl std::fmt::Display for UpsertIssue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.key, self.reason)
    }
}
