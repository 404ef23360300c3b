use crate::error::WorkflowError;
use crate::state_machine::WorkflowStatus;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Lifecycle notification emitted by the runtime
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowNotification {
    pub workflow_id: String,
    pub workflow_type: String,
    pub kind: NotificationKind,
    pub published_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NotificationKind {
    Started,
    Closed {
        status: WorkflowStatus,
        error: Option<WorkflowError>,
    },
}

impl WorkflowNotification {
    /// Terminal status carried by a close notification
    pub fn terminal_status(&self) -> Option<WorkflowStatus> {
        match &self.kind {
            NotificationKind::Closed { status, .. } => Some(*status),
            NotificationKind::Started => None,
        }
    }
}

/// Broadcast publisher for workflow lifecycle notifications
#[derive(Debug, Clone)]
pub struct EventPublisher {
    sender: broadcast::Sender<WorkflowNotification>,
}

impl EventPublisher {
    /// Create a new event publisher with the specified channel capacity
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publish a notification. Having no subscribers is not an error.
    pub async fn publish(&self, notification: WorkflowNotification) -> Result<(), PublishError> {
        match self.sender.send(notification) {
            Ok(_) => Ok(()),
            Err(broadcast::error::SendError(_)) => Ok(()),
        }
    }

    pub async fn publish_started(
        &self,
        workflow_id: &str,
        workflow_type: &str,
    ) -> Result<(), PublishError> {
        self.publish(WorkflowNotification {
            workflow_id: workflow_id.to_string(),
            workflow_type: workflow_type.to_string(),
            kind: NotificationKind::Started,
            published_at: Utc::now(),
        })
        .await
    }

    pub async fn publish_closed(
        &self,
        workflow_id: &str,
        workflow_type: &str,
        status: WorkflowStatus,
        error: Option<WorkflowError>,
    ) -> Result<(), PublishError> {
        self.publish(WorkflowNotification {
            workflow_id: workflow_id.to_string(),
            workflow_type: workflow_type.to_string(),
            kind: NotificationKind::Closed { status, error },
            published_at: Utc::now(),
        })
        .await
    }

    /// Subscribe to notifications
    pub fn subscribe(&self) -> broadcast::Receiver<WorkflowNotification> {
        self.sender.subscribe()
    }

    /// Get the number of active subscribers
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

/// Error types for event publishing
#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    #[error("Event channel is closed")]
    ChannelClosed,
}

impl Default for EventPublisher {
    fn default() -> Self {
        Self::new(crate::constants::defaults::EVENT_CHANNEL_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_without_subscribers_is_ok() {
        let publisher = EventPublisher::new(8);
        assert_eq!(publisher.subscriber_count(), 0);
        assert!(publisher.publish_started("wf-1", "SVMCreation").await.is_ok());
    }

    #[tokio::test]
    async fn test_subscribers_receive_close_notifications() {
        let publisher = EventPublisher::default();
        let mut rx = publisher.subscribe();
        publisher
            .publish_closed("wf-1", "SVMCreation", WorkflowStatus::Completed, None)
            .await
            .unwrap();

        let received = rx.recv().await.unwrap();
        assert_eq!(received.workflow_id, "wf-1");
        assert_eq!(received.terminal_status(), Some(WorkflowStatus::Completed));
    }
}
