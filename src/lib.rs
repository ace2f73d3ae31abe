//! Records a headset's raw brainwave stream into SQLite.
//!
//! Device payloads are normalized into [`Record`]s, buffered by the
//! [`FlushEngine`], and written in batches through a [`PersistenceSink`].

pub mod config;
pub mod device;
pub mod engine;
pub mod error;
pub mod ingest;
pub mod record;
pub mod sink;

pub use engine::{FlushEngine, FlushPolicy, FlushResult, FlushStats, FlushTrigger};
pub use error::{AppendError, PersistenceError, ShutdownError, ValidationError};
pub use record::{Normalizer, Record};
pub use sink::{PersistenceSink, RawRow, SqliteSink};
