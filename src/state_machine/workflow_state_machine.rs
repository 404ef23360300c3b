use super::errors::{StateMachineError, StateMachineResult};
use super::events::WorkflowEvent;
use super::states::WorkflowStatus;
use tracing::debug;

/// Lifecycle state machine for one workflow instance.
///
/// `Scheduled → Running → {Completed, Failed, TimedOut, Canceled}`. A start
/// request can be canceled or timed out before its first turn runs.
#[derive(Debug, Clone)]
pub struct WorkflowStateMachine {
    workflow_id: String,
    current: WorkflowStatus,
}

impl WorkflowStateMachine {
    pub fn new(workflow_id: impl Into<String>) -> Self {
        Self {
            workflow_id: workflow_id.into(),
            current: WorkflowStatus::Scheduled,
        }
    }

    /// Rebuild a machine at a status derived from recorded history
    pub fn restore(workflow_id: impl Into<String>, status: WorkflowStatus) -> Self {
        Self {
            workflow_id: workflow_id.into(),
            current: status,
        }
    }

    pub fn current_state(&self) -> WorkflowStatus {
        self.current
    }

    /// Apply an event, returning the new status
    pub fn transition(&mut self, event: &WorkflowEvent) -> StateMachineResult<WorkflowStatus> {
        let target = Self::determine_target_state(self.current, event).map_err(|e| {
            if self.current.is_terminal() {
                StateMachineError::AlreadyTerminal {
                    entity: "workflow",
                    id: self.workflow_id.clone(),
                    state: self.current.to_string(),
                }
            } else {
                e
            }
        })?;

        debug!(
            workflow_id = %self.workflow_id,
            from = %self.current,
            to = %target,
            event = event.event_type(),
            "Workflow state transition"
        );
        self.current = target;
        Ok(target)
    }

    fn determine_target_state(
        current_state: WorkflowStatus,
        event: &WorkflowEvent,
    ) -> StateMachineResult<WorkflowStatus> {
        let target = match (current_state, event) {
            (WorkflowStatus::Scheduled, WorkflowEvent::Start) => WorkflowStatus::Running,

            (WorkflowStatus::Running, WorkflowEvent::Complete) => WorkflowStatus::Completed,
            (WorkflowStatus::Running, WorkflowEvent::Fail(_)) => WorkflowStatus::Failed,

            (WorkflowStatus::Scheduled | WorkflowStatus::Running, WorkflowEvent::TimeOut) => {
                WorkflowStatus::TimedOut
            }
            (WorkflowStatus::Scheduled | WorkflowStatus::Running, WorkflowEvent::Cancel) => {
                WorkflowStatus::Canceled
            }

            (from_state, _) => {
                return Err(StateMachineError::InvalidTransition {
                    from: from_state.to_string(),
                    event: event.event_type().to_string(),
                })
            }
        };

        Ok(target)
    }
}
