//! # Workflow History
//!
//! The ordered, durable record of one workflow instance and the persistence
//! boundary the runtime writes it through. History is the sole source of truth
//! for recovery: an instance is rebuilt by replaying its coordination function
//! against these events.

pub mod event;
pub mod file;
pub mod memory;
pub mod store;

pub use event::{
    EventKind, HistoryEvent, HistoryView, OutstandingActivity, OutstandingChild,
    OutstandingTimer, OutstandingWork, ParentRef, StartedInfo,
};
pub use file::FileHistoryStore;
pub use memory::InMemoryHistoryStore;
pub use store::{validate_instance_id, HistoryError, HistoryResult, HistoryStore};

use crate::config::{HistoryBackend, HistoryConfig};
use std::sync::Arc;

/// Build the store selected by configuration
pub async fn store_from_config(config: &HistoryConfig) -> HistoryResult<Arc<dyn HistoryStore>> {
    match config.backend {
        HistoryBackend::Memory => Ok(Arc::new(InMemoryHistoryStore::new())),
        HistoryBackend::File => Ok(Arc::new(FileHistoryStore::open(&config.directory).await?)),
    }
}
