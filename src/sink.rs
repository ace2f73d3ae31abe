mod sqlite;

pub use sqlite::{SqliteSink, StoredRow};

use crate::error::PersistenceError;
use crate::record::Record;
use async_trait::async_trait;
use std::sync::Arc;

/// One `brainwaves_raw` row with its payload already serialized.
#[derive(Debug, Clone, PartialEq)]
pub struct RawRow {
    pub timestamp: String,
    pub data: String,
    pub user_name: Arc<str>,
}

impl RawRow {
    pub fn from_record(record: &Record) -> Result<Self, serde_json::Error> {
        Ok(Self {
            timestamp: record.timestamp.clone(),
            data: serde_json::to_string(&record.payload)?,
            user_name: record.owner.clone(),
        })
    }
}

/// Durable storage for flushed batches.
///
/// `write_batch` is one logical write: either every row lands or the call fails.
#[async_trait]
pub trait PersistenceSink: Send + Sync + 'static {
    async fn write_batch(&self, rows: &[RawRow]) -> Result<usize, PersistenceError>;

    async fn close(&self) -> Result<(), PersistenceError> {
        Ok(())
    }
}
