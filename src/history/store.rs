use super::event::HistoryEvent;
use async_trait::async_trait;
use thiserror::Error;

/// History persistence failures
#[derive(Debug, Error)]
pub enum HistoryError {
    #[error("I/O error during {operation} for {workflow_id}: {source}")]
    Io {
        operation: &'static str,
        workflow_id: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to serialize event {event_id} for {workflow_id}: {message}")]
    Serialization {
        workflow_id: String,
        event_id: u64,
        message: String,
    },

    #[error("Out-of-order append for {workflow_id}: expected event {expected}, got {actual}")]
    OutOfOrder {
        workflow_id: String,
        expected: u64,
        actual: u64,
    },

    #[error("Corrupted history for {workflow_id} at line {line}: {message}")]
    Corrupted {
        workflow_id: String,
        line: usize,
        message: String,
    },

    #[error("Invalid workflow instance id '{0}'")]
    InvalidInstanceId(String),

    #[error("No history recorded for {0}")]
    NoHistory(String),
}

pub type HistoryResult<T> = Result<T, HistoryError>;

/// Append-only, durable event log keyed by workflow instance id.
///
/// An event passed to `append` must be visible to `read_all` once the call
/// returns. Events are appended strictly in `event_id` order starting at 1.
#[async_trait]
pub trait HistoryStore: Send + Sync + std::fmt::Debug {
    async fn append(&self, workflow_id: &str, event: &HistoryEvent) -> HistoryResult<()>;

    async fn read_all(&self, workflow_id: &str) -> HistoryResult<Vec<HistoryEvent>>;

    /// Every instance with at least one recorded event. Archived runs are
    /// not listed.
    async fn list_instances(&self) -> HistoryResult<Vec<String>>;

    /// Move the current history of `workflow_id` aside so the id can be
    /// started again. Returns the run number it was archived under, counting
    /// from 1.
    async fn archive(&self, workflow_id: &str) -> HistoryResult<u32>;

    /// History of an archived run; empty if there is no such run
    async fn read_archived(&self, workflow_id: &str, run: u32) -> HistoryResult<Vec<HistoryEvent>>;
}

/// Check the next expected id for an instance
pub(crate) fn check_order(workflow_id: &str, current_len: u64, event: &HistoryEvent) -> HistoryResult<()> {
    let expected = current_len + 1;
    if event.event_id != expected {
        return Err(HistoryError::OutOfOrder {
            workflow_id: workflow_id.to_string(),
            expected,
            actual: event.event_id,
        });
    }
    Ok(())
}

/// Instance ids become file names, so they are restricted to a safe alphabet
pub fn validate_instance_id(workflow_id: &str) -> HistoryResult<()> {
    let valid = !workflow_id.is_empty()
        && workflow_id.len() <= 200
        && !workflow_id.starts_with('.')
        && workflow_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if valid {
        Ok(())
    } else {
        Err(HistoryError::InvalidInstanceId(workflow_id.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_instance_id_validation() {
        assert!(validate_instance_id("svm-creation-svm-1").is_ok());
        assert!(validate_instance_id("nfs-share-svm_1.data").is_ok());
        assert!(validate_instance_id("").is_err());
        assert!(validate_instance_id("../etc/passwd").is_err());
        assert!(validate_instance_id(".hidden").is_err());
        assert!(validate_instance_id("a/b").is_err());
        assert!(validate_instance_id("with space").is_err());
    }
}
