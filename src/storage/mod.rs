//! Persistent storage for finished analysis cycles.
//!
//! Bundles go to a [`HistoryRecorder`] (sled on disk, or an in-memory ring)
//! and optionally to a daily Markdown journal, which also logs direct
//! single-backend queries.

pub mod history;
pub mod journal;

use std::sync::Arc;

pub use history::{HistoryRecorder, InMemoryHistory, SledHistory, StorageError};
pub use journal::{DirectEntry, MarkdownJournal};

use crate::config::HistoryConfig;

/// Open the recorder described by `[history]`.
pub fn open_history(config: &HistoryConfig) -> Result<Arc<dyn HistoryRecorder>, StorageError> {
    if config.in_memory {
        tracing::info!(capacity = config.memory_capacity, "Using in-memory analysis history");
        return Ok(Arc::new(InMemoryHistory::new(config.memory_capacity)));
    }
    Ok(Arc::new(SledHistory::open(&config.db_path)?))
}
