use serde::{Deserialize, Serialize};
use std::fmt;

/// Workflow instance lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    /// Created, coordination function not yet entered
    Scheduled,
    /// Coordination function is being stepped
    Running,
    /// Coordination function returned a result
    Completed,
    /// Unhandled failure reached the top of the coordination function
    Failed,
    /// Execution timeout elapsed
    TimedOut,
    /// Canceled on request or by parent close
    Canceled,
}

impl WorkflowStatus {
    /// Check if this is a terminal state (no further transitions allowed)
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::TimedOut | Self::Canceled
        )
    }

    /// Check if this is an active state (instance is being processed)
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Scheduled | Self::Running)
    }
}

impl fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Scheduled => write!(f, "scheduled"),
            Self::Running => write!(f, "running"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::TimedOut => write!(f, "timed_out"),
            Self::Canceled => write!(f, "canceled"),
        }
    }
}

impl std::str::FromStr for WorkflowStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "scheduled" => Ok(Self::Scheduled),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "timed_out" => Ok(Self::TimedOut),
            "canceled" => Ok(Self::Canceled),
            _ => Err(format!("Invalid workflow status: {s}")),
        }
    }
}

/// Status of one activity invocation across its attempts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityStatus {
    Scheduled,
    /// An attempt is executing
    Started,
    Completed,
    /// The latest attempt failed
    Failed,
    /// Waiting out the backoff delay before the next attempt
    RetryScheduled,
    /// The latest attempt exceeded its start-to-close timeout
    TimedOut,
}

impl ActivityStatus {
    /// An attempt has concluded; only a retry can move the invocation on
    pub fn is_attempt_concluded(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::TimedOut)
    }

    pub fn is_active(&self) -> bool {
        matches!(self, Self::Started)
    }
}

impl fmt::Display for ActivityStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Scheduled => write!(f, "scheduled"),
            Self::Started => write!(f, "started"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::RetryScheduled => write!(f, "retry_scheduled"),
            Self::TimedOut => write!(f, "timed_out"),
        }
    }
}

impl std::str::FromStr for ActivityStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "scheduled" => Ok(Self::Scheduled),
            "started" => Ok(Self::Started),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "retry_scheduled" => Ok(Self::RetryScheduled),
            "timed_out" => Ok(Self::TimedOut),
            _ => Err(format!("Invalid activity status: {s}")),
        }
    }
}

/// Durable timer lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimerStatus {
    Scheduled,
    Fired,
    Canceled,
}

impl TimerStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Fired | Self::Canceled)
    }
}

impl fmt::Display for TimerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Scheduled => write!(f, "scheduled"),
            Self::Fired => write!(f, "fired"),
            Self::Canceled => write!(f, "canceled"),
        }
    }
}
