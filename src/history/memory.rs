//! In-memory history backend.
//!
//! ```rust
//! use storage_workflows::history::{EventKind, HistoryEvent, HistoryStore, InMemoryHistoryStore};
//!
//! # tokio_test::block_on(async {
//! let store = InMemoryHistoryStore::new();
//! let event = HistoryEvent::new(
//!     1,
//!     EventKind::SignalReceived {
//!         signal_name: "approve".to_string(),
//!         payload: serde_json::Value::Null,
//!     },
//! );
//! store.append("wf-1", &event).await.unwrap();
//! assert_eq!(store.read_all("wf-1").await.unwrap().len(), 1);
//! # });
//! ```

use super::event::HistoryEvent;
use super::store::{check_order, validate_instance_id, HistoryError, HistoryResult, HistoryStore};
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;

/// Process-local history store. Does not survive restarts.
#[derive(Debug, Clone, Default)]
pub struct InMemoryHistoryStore {
    histories: Arc<DashMap<String, Vec<HistoryEvent>>>,
    /// Archived runs per instance, oldest first
    archived: Arc<DashMap<String, Vec<Vec<HistoryEvent>>>>,
}

impl InMemoryHistoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn event_count(&self, workflow_id: &str) -> usize {
        self.histories
            .get(workflow_id)
            .map(|events| events.len())
            .unwrap_or(0)
    }
}

#[async_trait]
impl HistoryStore for InMemoryHistoryStore {
    async fn append(&self, workflow_id: &str, event: &HistoryEvent) -> HistoryResult<()> {
        validate_instance_id(workflow_id)?;
        let mut events = self.histories.entry(workflow_id.to_string()).or_default();
        check_order(workflow_id, events.len() as u64, event)?;
        events.push(event.clone());
        Ok(())
    }

    async fn read_all(&self, workflow_id: &str) -> HistoryResult<Vec<HistoryEvent>> {
        Ok(self
            .histories
            .get(workflow_id)
            .map(|events| events.clone())
            .unwrap_or_default())
    }

    async fn list_instances(&self) -> HistoryResult<Vec<String>> {
        let mut ids: Vec<String> = self
            .histories
            .iter()
            .filter(|entry| !entry.value().is_empty())
            .map(|entry| entry.key().clone())
            .collect();
        ids.sort();
        Ok(ids)
    }

    async fn archive(&self, workflow_id: &str) -> HistoryResult<u32> {
        let events = self
            .histories
            .remove(workflow_id)
            .map(|(_, events)| events)
            .unwrap_or_default();
        if events.is_empty() {
            return Err(HistoryError::NoHistory(workflow_id.to_string()));
        }
        let mut runs = self.archived.entry(workflow_id.to_string()).or_default();
        runs.push(events);
        Ok(runs.len() as u32)
    }

    async fn read_archived(&self, workflow_id: &str, run: u32) -> HistoryResult<Vec<HistoryEvent>> {
        let index = (run as usize).checked_sub(1);
        Ok(self
            .archived
            .get(workflow_id)
            .and_then(|runs| index.and_then(|index| runs.get(index).cloned()))
            .unwrap_or_default())
    }
}
