//! Engine error types
//!
//! Map-stage failures (`Source`, `TransactionOpen`, `Row`, `Cancelled`, ...) are fatal
//! to the worker or dispatcher that hit them and turn the run into a rollback at the
//! barrier. Finalization failures (`Commit`, `Rollback`) are collected per transaction
//! without stopping the finalization of the others.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for engine operations
pub type IngestResult<T> = std::result::Result<T, IngestError>;

/// Errors reported by a [`Store`](crate::store::Store) or its transactions
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Null value in column \"{column}\" of table \"{table}\" violates not-null constraint")]
    NotNull { table: String, column: String },

    #[error("Table \"{0}\" does not exist")]
    UnknownTable(String),

    #[error("Column \"{column}\" does not exist in table \"{table}\"")]
    UnknownColumn { table: String, column: String },

    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

/// Errors building an INSERT statement
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SqlError {
    #[error("Cannot build an INSERT from zero rows")]
    NoRows,

    #[error("Cannot build an INSERT for a row without columns")]
    EmptyRow,

    #[error("Row {index} has columns {found:?}, expected {expected:?}")]
    ColumnMismatch {
        index: usize,
        expected: Vec<String>,
        found: Vec<String>,
    },

    #[error("Column \"{0}\" is not allowed by the schema")]
    ColumnNotAllowed(String),
}

/// Errors producing records
#[derive(Error, Debug)]
pub enum SourceError {
    #[error("Failed to read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid XML: {0}")]
    Xml(String),

    #[error("Unsupported input format: {0}")]
    UnsupportedFormat(String),

    #[error("Invalid record: {0}")]
    InvalidRecord(String),

    #[error("Record source stopped unexpectedly: {0}")]
    Aborted(String),
}

impl SourceError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// Errors stopping the dispatcher
#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("Record source failed: {0}")]
    Source(#[from] SourceError),

    #[error("Dispatch queue closed with batch {batch_id} undelivered")]
    QueueClosed { batch_id: usize },

    #[error("Dispatch cancelled")]
    Cancelled,
}

/// Why a single row could not be inserted
#[derive(Error, Debug)]
pub enum RowError {
    #[error(transparent)]
    Statement(#[from] SqlError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Error taxonomy of an ingestion run
#[derive(Error, Debug)]
pub enum IngestError {
    #[error("Record source failed: {0}")]
    Source(#[source] SourceError),

    #[error("Dispatcher failed: {0}")]
    Dispatch(#[source] DispatchError),

    #[error("Worker {worker_id} could not open a transaction: {source}")]
    TransactionOpen {
        worker_id: usize,
        #[source]
        source: StoreError,
    },

    #[error("Worker {worker_id} failed on batch {batch_id}, record {record_index}: {source}")]
    Row {
        worker_id: usize,
        batch_id: usize,
        record_index: usize,
        #[source]
        source: RowError,
    },

    #[error("Worker {worker_id} stopped: run cancelled")]
    Cancelled { worker_id: usize },

    #[error("Worker {worker_id} panicked: {message}")]
    WorkerPanicked { worker_id: usize, message: String },

    #[error("Commit failed for worker {worker_id}: {source}")]
    Commit {
        worker_id: usize,
        #[source]
        source: StoreError,
    },

    #[error("Rollback failed for worker {worker_id}: {source}")]
    Rollback {
        worker_id: usize,
        #[source]
        source: StoreError,
    },

    #[error("Configuration error: {0}")]
    Config(#[from] ingestor_common::IngestorError),
}

impl From<DispatchError> for IngestError {
    fn from(err: DispatchError) -> Self {
        match err {
            DispatchError::Source(source) => IngestError::Source(source),
            other => IngestError::Dispatch(other),
        }
    }
}

impl IngestError {
    /// Whether the error happened while finalizing a transaction
    pub fn is_finalization(&self) -> bool {
        matches!(self, IngestError::Commit { .. } | IngestError::Rollback { .. })
    }

    /// Whether the error only follows from another failure: a cancellation, or a
    /// dispatcher that found every worker gone
    pub fn is_consequence(&self) -> bool {
        matches!(
            self,
            IngestError::Cancelled { .. }
                | IngestError::Dispatch(DispatchError::Cancelled)
                | IngestError::Dispatch(DispatchError::QueueClosed { .. })
        )
    }

    /// Worker the error is attributed to, if any
    pub fn worker_id(&self) -> Option<usize> {
        match self {
            IngestError::TransactionOpen { worker_id, .. }
            | IngestError::Row { worker_id, .. }
            | IngestError::Cancelled { worker_id }
            | IngestError::WorkerPanicked { worker_id, .. }
            | IngestError::Commit { worker_id, .. }
            | IngestError::Rollback { worker_id, .. } => Some(*worker_id),
            IngestError::Source(_) | IngestError::Dispatch(_) | IngestError::Config(_) => None,
        }
    }
}
