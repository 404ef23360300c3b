use crate::constants::workflow_types;
use crate::error::WorkflowResult;
use crate::orchestration::{ActivityOptions, RetryPolicy, Workflow, WorkflowContext};
use crate::storage::activities::{AcknowledgeEvent, GetSystemEvents, SendNotification};
use crate::storage::types::{EventProcessingResult, Notification, ProcessedEvent};
use async_trait::async_trait;
use std::time::Duration;

/// Notify about and acknowledge every new error-severity event.
///
/// The input is the list of notification channels.
#[derive(Debug, Clone, Default)]
pub struct EventProcessingWorkflow;

impl EventProcessingWorkflow {
    pub const SEVERITY: &'static str = "error";

    fn options(timeout: Duration) -> ActivityOptions {
        ActivityOptions::new(timeout).with_retry_policy(RetryPolicy::new(
            Duration::from_secs(2),
            Duration::from_secs(30),
            3,
        ))
    }
}

#[async_trait]
impl Workflow for EventProcessingWorkflow {
    const WORKFLOW_TYPE: &'static str = workflow_types::EVENT_PROCESSING;
    type Input = Vec<String>;
    type Output = EventProcessingResult;

    async fn run(&self, ctx: WorkflowContext, channels: Vec<String>) -> WorkflowResult<EventProcessingResult> {
        workflow_info!(ctx, channels = channels.len(), "Starting event processing");

        let events = ctx
            .execute_activity::<GetSystemEvents>(
                &Self::SEVERITY.to_string(),
                Self::options(Duration::from_secs(30)),
            )
            .await?;

        let mut processed = Vec::new();
        for event in events.into_iter().filter(|event| event.is_new()) {
            ctx.execute_activity::<SendNotification>(
                &Notification {
                    message: format!("CRITICAL EVENT: {} (Key: {})", event.message, event.key),
                    channels: channels.clone(),
                },
                Self::options(Duration::from_secs(15)),
            )
            .await?;

            ctx.execute_activity::<AcknowledgeEvent>(&event.key, Self::options(Duration::from_secs(10)))
                .await?;

            processed.push(ProcessedEvent {
                event_key: event.key,
                action: "notified_and_acknowledged".to_string(),
                message: event.message,
            });
        }

        Ok(EventProcessingResult {
            total_events_processed: processed.len(),
            events: processed,
            status: "completed".to_string(),
        })
    }
}
