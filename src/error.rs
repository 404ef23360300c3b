//! Error types for the workflow engine.
//!
//! Three layers of failure are kept apart:
//!
//! - [`ActivityError`] is what an activity implementation returns for a single attempt.
//! - [`WorkflowError`] is what a coordination function observes. It is serializable
//!   because it is recorded in history and replayed.
//! - [`EngineError`] covers the runtime itself (dispatch, persistence, lifecycle).

use crate::config::ConfigurationError;
use crate::history::HistoryError;
use crate::state_machine::{StateMachineError, WorkflowStatus};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Failure taxonomy surfaced to callers and recorded with terminal instances
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// A single attempt failed and will be retried per policy
    ActivityAttemptFailure,
    /// Retries exhausted or a non-retryable activity error
    ActivityTerminalFailure,
    /// The polled external job reported FAILED or CANCELLED
    ExternalJobFailed,
    /// The polled external job did not reach a terminal state in time
    ExternalJobTimedOut,
    /// A child workflow ended in a non-completed state
    ChildWorkflowFailure,
    /// Unhandled error raised by coordination logic
    WorkflowFailure,
    /// Explicit cancellation
    WorkflowCanceled,
    /// Workflow execution timeout elapsed
    WorkflowTimedOut,
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::ActivityAttemptFailure => "activity_attempt_failure",
            Self::ActivityTerminalFailure => "activity_terminal_failure",
            Self::ExternalJobFailed => "external_job_failed",
            Self::ExternalJobTimedOut => "external_job_timed_out",
            Self::ChildWorkflowFailure => "child_workflow_failure",
            Self::WorkflowFailure => "workflow_failure",
            Self::WorkflowCanceled => "workflow_canceled",
            Self::WorkflowTimedOut => "workflow_timed_out",
        };
        f.write_str(name)
    }
}

/// Workflow-visible failure. Catchable by coordination logic; recorded in history.
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkflowError {
    #[error("Activity {activity_type} ({step_id}) failed after {attempts} attempt(s): {message}")]
    ActivityFailed {
        step_id: String,
        activity_type: String,
        attempts: u32,
        message: String,
        timed_out: bool,
    },

    #[error("External job {job_key} ended in state {state} ({step_id}): {message}")]
    ExternalJobFailed {
        step_id: String,
        job_key: String,
        state: String,
        message: String,
    },

    #[error("External job {job_key} did not finish within {timeout_secs}s ({step_id})")]
    ExternalJobTimedOut {
        step_id: String,
        job_key: String,
        timeout_secs: u64,
    },

    #[error("Child workflow {child_id} ({workflow_type}) failed")]
    ChildWorkflowFailed {
        child_id: String,
        workflow_type: String,
        #[source]
        cause: Box<WorkflowError>,
    },

    #[error("Child workflow {child_id} ({workflow_type}) could not be started: {reason}")]
    ChildWorkflowStartFailed {
        child_id: String,
        workflow_type: String,
        reason: String,
    },

    #[error("Workflow canceled: {reason}")]
    Canceled { reason: String },

    #[error("Workflow timed out after {timeout_secs}s")]
    TimedOut { timeout_secs: u64 },

    #[error("{message}")]
    Application { message: String },

    #[error("Payload error: {message}")]
    Payload { message: String },

    #[error("Nondeterministic replay at suspension point {seq}: code requested {requested}, history recorded {recorded}")]
    NonDeterminism {
        seq: u64,
        requested: String,
        recorded: String,
    },
}

impl WorkflowError {
    /// Create an application error raised by coordination logic
    pub fn application(message: impl Into<String>) -> Self {
        Self::Application {
            message: message.into(),
        }
    }

    /// Create a payload (de)serialization error
    pub fn payload(context: &str, error: impl std::fmt::Display) -> Self {
        Self::Payload {
            message: format!("{context}: {error}"),
        }
    }

    /// Failure kind per the engine taxonomy
    pub fn kind(&self) -> FailureKind {
        match self {
            Self::ActivityFailed { .. } => FailureKind::ActivityTerminalFailure,
            Self::ExternalJobFailed { .. } => FailureKind::ExternalJobFailed,
            Self::ExternalJobTimedOut { .. } => FailureKind::ExternalJobTimedOut,
            Self::ChildWorkflowFailed { .. } => FailureKind::ChildWorkflowFailure,
            Self::Canceled { .. } => FailureKind::WorkflowCanceled,
            Self::TimedOut { .. } => FailureKind::WorkflowTimedOut,
            Self::ChildWorkflowStartFailed { .. }
            | Self::Application { .. }
            | Self::Payload { .. }
            | Self::NonDeterminism { .. } => FailureKind::WorkflowFailure,
        }
    }

    /// Identifier of the step that originated the failure, when there is one
    pub fn step_id(&self) -> Option<&str> {
        match self {
            Self::ActivityFailed { step_id, .. }
            | Self::ExternalJobFailed { step_id, .. }
            | Self::ExternalJobTimedOut { step_id, .. } => Some(step_id),
            Self::ChildWorkflowFailed { cause, .. } => cause.step_id(),
            _ => None,
        }
    }

    pub fn is_canceled(&self) -> bool {
        matches!(self, Self::Canceled { .. })
    }

    /// Rendered error chain, outermost first
    pub fn failure_chain(&self) -> Vec<String> {
        let mut chain = vec![self.to_string()];
        let mut current: Option<&(dyn std::error::Error + 'static)> =
            std::error::Error::source(self);
        while let Some(err) = current {
            chain.push(err.to_string());
            current = err.source();
        }
        chain
    }
}

impl From<serde_json::Error> for WorkflowError {
    fn from(error: serde_json::Error) -> Self {
        WorkflowError::payload("JSON serialization error", error)
    }
}

pub type WorkflowResult<T> = Result<T, WorkflowError>;

/// Error returned by one activity attempt
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ActivityError {
    #[error("{0}")]
    Retryable(String),

    #[error("{0}")]
    NonRetryable(String),

    #[error("Invalid activity input: {0}")]
    InvalidInput(String),

    #[error("Job {job_key} finished in state {state}: {message}")]
    JobFailed {
        job_key: String,
        state: String,
        message: String,
    },

    #[error("Job {job_key} did not finish within {timeout_secs}s")]
    JobTimedOut { job_key: String, timeout_secs: u64 },

    #[error("Attempt exceeded start-to-close timeout of {0:?}")]
    AttemptTimedOut(Duration),

    #[error("No activity registered for type {0}")]
    NotRegistered(String),
}

impl ActivityError {
    pub fn retryable(message: impl Into<String>) -> Self {
        Self::Retryable(message.into())
    }

    pub fn non_retryable(message: impl Into<String>) -> Self {
        Self::NonRetryable(message.into())
    }

    /// Whether the invoker may schedule another attempt after this error.
    ///
    /// Job outcomes are final: a job that failed or timed out is not polled again.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Retryable(_) | Self::AttemptTimedOut(_))
    }

    /// Convert the final attempt error into the workflow-visible failure
    pub fn into_workflow_error(self, step_id: String, activity_type: &str, attempts: u32) -> WorkflowError {
        match self {
            Self::JobFailed {
                job_key,
                state,
                message,
            } => WorkflowError::ExternalJobFailed {
                step_id,
                job_key,
                state,
                message,
            },
            Self::JobTimedOut {
                job_key,
                timeout_secs,
            } => WorkflowError::ExternalJobTimedOut {
                step_id,
                job_key,
                timeout_secs,
            },
            other => WorkflowError::ActivityFailed {
                step_id,
                activity_type: activity_type.to_string(),
                attempts,
                timed_out: matches!(other, Self::AttemptTimedOut(_)),
                message: other.to_string(),
            },
        }
    }
}

impl From<serde_json::Error> for ActivityError {
    fn from(error: serde_json::Error) -> Self {
        ActivityError::InvalidInput(error.to_string())
    }
}

/// Runtime and dispatcher errors
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Unknown workflow type: {0}")]
    UnknownWorkflowType(String),

    #[error("Workflow instance already exists: {0}")]
    DuplicateInstance(String),

    #[error("Workflow instance not found: {0}")]
    InstanceNotFound(String),

    #[error("Workflow instance {instance_id} is already {status}")]
    InstanceTerminal {
        instance_id: String,
        status: WorkflowStatus,
    },

    #[error("History error: {0}")]
    History(#[from] HistoryError),

    #[error("State transition error: {0}")]
    StateTransition(#[from] StateMachineError),

    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigurationError),

    #[error("Payload error: {0}")]
    Payload(String),

    #[error("Request for {instance_id} could not be recorded: {reason}")]
    NotRecorded { instance_id: String, reason: String },

    #[error("Workflow runtime is shut down")]
    ShutDown,
}

impl From<serde_json::Error> for EngineError {
    fn from(error: serde_json::Error) -> Self {
        EngineError::Payload(error.to_string())
    }
}

pub type EngineResult<T> = Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_chain_walks_child_causes() {
        let activity = WorkflowError::ActivityFailed {
            step_id: "create_nfs_share#1".to_string(),
            activity_type: "create_nfs_share".to_string(),
            attempts: 3,
            message: "HTTP 503".to_string(),
            timed_out: false,
        };
        let child = WorkflowError::ChildWorkflowFailed {
            child_id: "nfs-share-svm-1-share-b".to_string(),
            workflow_type: "NFSShareProvisioning".to_string(),
            cause: Box::new(activity),
        };

        let chain = child.failure_chain();
        assert_eq!(chain.len(), 2);
        assert!(chain[0].contains("nfs-share-svm-1-share-b"));
        assert!(chain[1].contains("HTTP 503"));
        assert_eq!(child.kind(), FailureKind::ChildWorkflowFailure);
        assert_eq!(child.step_id(), Some("create_nfs_share#1"));
    }

    #[test]
    fn test_job_errors_are_final_and_keep_their_kind() {
        let timed_out = ActivityError::JobTimedOut {
            job_key: "job-1".to_string(),
            timeout_secs: 300,
        };
        assert!(!timed_out.is_retryable());
        let failed = ActivityError::JobFailed {
            job_key: "job-1".to_string(),
            state: "FAILED".to_string(),
            message: "quota exceeded".to_string(),
        };
        assert!(!failed.is_retryable());

        assert_eq!(
            timed_out
                .into_workflow_error("wait_for_job#4".to_string(), "wait_for_job", 1)
                .kind(),
            FailureKind::ExternalJobTimedOut
        );
        assert_eq!(
            failed
                .into_workflow_error("wait_for_job#4".to_string(), "wait_for_job", 1)
                .kind(),
            FailureKind::ExternalJobFailed
        );
    }

    #[test]
    fn test_workflow_error_serde() {
        let error = WorkflowError::Canceled {
            reason: "operator request".to_string(),
        };
        let json = serde_json::to_value(&error).unwrap();
        assert_eq!(json["type"], "canceled");
        let parsed: WorkflowError = serde_json::from_value(json).unwrap();
        assert_eq!(parsed, error);
    }
}
