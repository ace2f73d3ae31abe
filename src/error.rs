use crate::record::Record;
use thiserror::Error;

/// A raw device value that could not be turned into a [`Record`].
///
/// Per-record and non-fatal: the ingest loop logs and drops the value.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("raw record is not valid JSON: {0}")]
    Malformed(String),
    #[error("raw record must be a JSON object, got {kind}")]
    NotAnObject { kind: &'static str },
    #[error("timestamp field has unsupported type {kind}")]
    InvalidTimestamp { kind: &'static str },
}

/// The sink rejected or could not complete a batch write.
#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("failed to serialize record payload: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("database write failed: {0}")]
    Database(#[from] sqlx::Error),
    #[error("failed to prepare database at {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("sink rejected batch: {0}")]
    Rejected(String),
    #[error("sink is closed")]
    Closed,
}

/// The final drain at shutdown did not complete cleanly.
#[derive(Debug, Error)]
pub enum ShutdownError {
    #[error("final flush failed with {pending} records still buffered: {source}")]
    FinalFlush {
        pending: usize,
        #[source]
        source: PersistenceError,
    },
    #[error("failed to release persistence sink: {0}")]
    Release(#[source] PersistenceError),
}

#[derive(Debug, Error)]
pub enum AppendError {
    #[error("flush engine is shut down; record not buffered")]
    Closed(Box<Record>),
}
