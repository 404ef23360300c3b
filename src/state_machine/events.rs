use serde::{Deserialize, Serialize};

/// Events that can trigger workflow instance transitions
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum WorkflowEvent {
    /// Begin stepping the coordination function
    Start,
    Complete,
    /// Unhandled failure with its message
    Fail(String),
    TimeOut,
    Cancel,
}

impl WorkflowEvent {
    /// Get a string representation of the event type for logging
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Complete => "complete",
            Self::Fail(_) => "fail",
            Self::TimeOut => "time_out",
            Self::Cancel => "cancel",
        }
    }

    /// Extract error message if this is a failure event
    pub fn error_message(&self) -> Option<&str> {
        match self {
            Self::Fail(msg) => Some(msg),
            _ => None,
        }
    }
}

/// Events that can trigger activity invocation transitions
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum ActivityEvent {
    /// Begin an attempt
    Start,
    Complete,
    Fail(String),
    /// Attempt exceeded start-to-close timeout
    TimeOut,
    /// Backoff delay scheduled before the next attempt
    ScheduleRetry,
}

impl ActivityEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Complete => "complete",
            Self::Fail(_) => "fail",
            Self::TimeOut => "time_out",
            Self::ScheduleRetry => "schedule_retry",
        }
    }
}

/// Events that can trigger timer transitions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimerEvent {
    Fire,
    Cancel,
}
