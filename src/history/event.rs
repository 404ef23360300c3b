//! History events.
//!
//! A workflow instance's history is the ordered list of everything that was
//! decided or observed on its behalf. Scheduling events (`*Scheduled`,
//! `*Started`, `SignalWaitStarted`) are keyed by the suspension point sequence
//! number `seq` that the coordination function reached; resolution events carry
//! the same `seq`.

use crate::error::WorkflowError;
use crate::orchestration::activity::ActivityOptions;
use crate::state_machine::WorkflowStatus;
use crate::utils::serde::{duration_millis, option_duration_millis};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};
use std::time::Duration;

/// One recorded event. `event_id` is the 1-based position in the history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEvent {
    pub event_id: u64,
    pub recorded_at: DateTime<Utc>,
    pub kind: EventKind,
}

impl HistoryEvent {
    pub fn new(event_id: u64, kind: EventKind) -> Self {
        Self {
            event_id,
            recorded_at: Utc::now(),
            kind,
        }
    }
}

/// Link from a child instance back to the suspension point that started it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParentRef {
    pub workflow_id: String,
    pub seq: u64,
    /// Detached children never report back
    pub detached: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event_type", rename_all = "snake_case")]
pub enum EventKind {
    WorkflowStarted {
        workflow_type: String,
        input: Value,
        parent: Option<ParentRef>,
        #[serde(default, with = "option_duration_millis")]
        execution_timeout: Option<Duration>,
    },
    ActivityScheduled {
        seq: u64,
        activity_id: String,
        activity_type: String,
        input: Value,
        options: ActivityOptions,
    },
    ActivityCompleted {
        seq: u64,
        result: Value,
        attempts: u32,
    },
    ActivityFailed {
        seq: u64,
        error: WorkflowError,
        attempts: u32,
    },
    TimerStarted {
        seq: u64,
        #[serde(with = "duration_millis")]
        fire_after: Duration,
        fire_at: DateTime<Utc>,
    },
    TimerFired {
        seq: u64,
    },
    TimerCanceled {
        seq: u64,
    },
    ChildWorkflowStarted {
        seq: u64,
        child_id: String,
        workflow_type: String,
        input: Value,
        detached: bool,
    },
    ChildWorkflowCompleted {
        seq: u64,
        child_id: String,
        result: Value,
    },
    ChildWorkflowFailed {
        seq: u64,
        child_id: String,
        error: WorkflowError,
    },
    SignalWaitStarted {
        seq: u64,
        signal_name: String,
    },
    SignalReceived {
        signal_name: String,
        payload: Value,
    },
    WorkflowCancelRequested {
        reason: String,
    },
    WorkflowCompleted {
        result: Value,
    },
    WorkflowFailed {
        error: WorkflowError,
    },
    WorkflowCanceled {
        reason: String,
    },
    WorkflowTimedOut {
        #[serde(with = "duration_millis")]
        timeout: Duration,
    },
}

impl EventKind {
    /// Get a string representation of the event type for logging
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::WorkflowStarted { .. } => "workflow_started",
            Self::ActivityScheduled { .. } => "activity_scheduled",
            Self::ActivityCompleted { .. } => "activity_completed",
            Self::ActivityFailed { .. } => "activity_failed",
            Self::TimerStarted { .. } => "timer_started",
            Self::TimerFired { .. } => "timer_fired",
            Self::TimerCanceled { .. } => "timer_canceled",
            Self::ChildWorkflowStarted { .. } => "child_workflow_started",
            Self::ChildWorkflowCompleted { .. } => "child_workflow_completed",
            Self::ChildWorkflowFailed { .. } => "child_workflow_failed",
            Self::SignalWaitStarted { .. } => "signal_wait_started",
            Self::SignalReceived { .. } => "signal_received",
            Self::WorkflowCancelRequested { .. } => "workflow_cancel_requested",
            Self::WorkflowCompleted { .. } => "workflow_completed",
            Self::WorkflowFailed { .. } => "workflow_failed",
            Self::WorkflowCanceled { .. } => "workflow_canceled",
            Self::WorkflowTimedOut { .. } => "workflow_timed_out",
        }
    }

    /// Terminal status this event closes the instance with, if any
    pub fn terminal_status(&self) -> Option<WorkflowStatus> {
        match self {
            Self::WorkflowCompleted { .. } => Some(WorkflowStatus::Completed),
            Self::WorkflowFailed { .. } => Some(WorkflowStatus::Failed),
            Self::WorkflowCanceled { .. } => Some(WorkflowStatus::Canceled),
            Self::WorkflowTimedOut { .. } => Some(WorkflowStatus::TimedOut),
            _ => None,
        }
    }

    /// Suspension point a scheduling event opens
    pub fn scheduled_seq(&self) -> Option<u64> {
        match self {
            Self::ActivityScheduled { seq, .. }
            | Self::TimerStarted { seq, .. }
            | Self::ChildWorkflowStarted { seq, .. }
            | Self::SignalWaitStarted { seq, .. } => Some(*seq),
            _ => None,
        }
    }

    /// Suspension point a resolution event closes
    pub fn resolved_seq(&self) -> Option<u64> {
        match self {
            Self::ActivityCompleted { seq, .. }
            | Self::ActivityFailed { seq, .. }
            | Self::TimerFired { seq }
            | Self::TimerCanceled { seq }
            | Self::ChildWorkflowCompleted { seq, .. }
            | Self::ChildWorkflowFailed { seq, .. } => Some(*seq),
            _ => None,
        }
    }
}

/// Start information of an instance, taken from its first event
#[derive(Debug, Clone, PartialEq)]
pub struct StartedInfo {
    pub workflow_type: String,
    pub input: Value,
    pub parent: Option<ParentRef>,
    pub execution_timeout: Option<Duration>,
    pub started_at: DateTime<Utc>,
}

/// Work scheduled in history that has no resolution yet
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OutstandingWork {
    pub activities: Vec<OutstandingActivity>,
    pub timers: Vec<OutstandingTimer>,
    pub children: Vec<OutstandingChild>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OutstandingActivity {
    pub seq: u64,
    pub activity_id: String,
    pub activity_type: String,
    pub input: Value,
    pub options: ActivityOptions,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OutstandingTimer {
    pub seq: u64,
    pub fire_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OutstandingChild {
    pub seq: u64,
    pub child_id: String,
    pub workflow_type: String,
    pub input: Value,
}

/// Read-only queries over a recorded history
pub struct HistoryView<'a> {
    events: &'a [HistoryEvent],
}

impl<'a> HistoryView<'a> {
    pub fn new(events: &'a [HistoryEvent]) -> Self {
        Self { events }
    }

    pub fn started(&self) -> Option<StartedInfo> {
        match self.events.first() {
            Some(HistoryEvent {
                recorded_at,
                kind:
                    EventKind::WorkflowStarted {
                        workflow_type,
                        input,
                        parent,
                        execution_timeout,
                    },
                ..
            }) => Some(StartedInfo {
                workflow_type: workflow_type.clone(),
                input: input.clone(),
                parent: parent.clone(),
                execution_timeout: *execution_timeout,
                started_at: *recorded_at,
            }),
            _ => None,
        }
    }

    /// Terminal event of the instance, if it has closed
    pub fn terminal(&self) -> Option<&'a HistoryEvent> {
        self.events
            .iter()
            .rev()
            .find(|event| event.kind.terminal_status().is_some())
    }

    /// Status derived from history alone
    pub fn status(&self) -> WorkflowStatus {
        match self.terminal() {
            Some(event) => event
                .kind
                .terminal_status()
                .unwrap_or(WorkflowStatus::Running),
            None if self.events.is_empty() => WorkflowStatus::Scheduled,
            None => WorkflowStatus::Running,
        }
    }

    pub fn cancel_requested(&self) -> bool {
        self.events
            .iter()
            .any(|event| matches!(event.kind, EventKind::WorkflowCancelRequested { .. }))
    }

    /// Scheduled work that has not been resolved
    pub fn outstanding(&self) -> OutstandingWork {
        let resolved: HashSet<u64> = self
            .events
            .iter()
            .filter_map(|event| event.kind.resolved_seq())
            .collect();

        let mut work = OutstandingWork::default();
        for event in self.events {
            match &event.kind {
                EventKind::ActivityScheduled {
                    seq,
                    activity_id,
                    activity_type,
                    input,
                    options,
                } if !resolved.contains(seq) => work.activities.push(OutstandingActivity {
                    seq: *seq,
                    activity_id: activity_id.clone(),
                    activity_type: activity_type.clone(),
                    input: input.clone(),
                    options: options.clone(),
                }),
                EventKind::TimerStarted { seq, fire_at, .. } if !resolved.contains(seq) => {
                    work.timers.push(OutstandingTimer {
                        seq: *seq,
                        fire_at: *fire_at,
                    })
                }
                EventKind::ChildWorkflowStarted {
                    seq,
                    child_id,
                    workflow_type,
                    input,
                    detached: false,
                } if !resolved.contains(seq) => work.children.push(OutstandingChild {
                    seq: *seq,
                    child_id: child_id.clone(),
                    workflow_type: workflow_type.clone(),
                    input: input.clone(),
                }),
                _ => {}
            }
        }
        work
    }

    /// Signals received per name, in arrival order
    pub fn signals(&self) -> BTreeMap<&'a str, Vec<&'a Value>> {
        let mut signals: BTreeMap<&str, Vec<&Value>> = BTreeMap::new();
        for event in self.events {
            if let EventKind::SignalReceived {
                signal_name,
                payload,
            } = &event.kind
            {
                signals.entry(signal_name.as_str()).or_default().push(payload);
            }
        }
        signals
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn history() -> Vec<HistoryEvent> {
        let kinds = vec![
            EventKind::WorkflowStarted {
                workflow_type: "SVMCreation".to_string(),
                input: json!({"name": "svm-1"}),
                parent: None,
                execution_timeout: None,
            },
            EventKind::ActivityScheduled {
                seq: 0,
                activity_id: "validate_cluster_health#0".to_string(),
                activity_type: "validate_cluster_health".to_string(),
                input: json!("c1"),
                options: ActivityOptions::default(),
            },
            EventKind::ActivityCompleted {
                seq: 0,
                result: json!({"healthy": true}),
                attempts: 1,
            },
            EventKind::TimerStarted {
                seq: 1,
                fire_after: Duration::from_secs(30),
                fire_at: Utc::now(),
            },
            EventKind::ChildWorkflowStarted {
                seq: 2,
                child_id: "child".to_string(),
                workflow_type: "NFSShareProvisioning".to_string(),
                input: json!({}),
                detached: false,
            },
        ];
        kinds
            .into_iter()
            .enumerate()
            .map(|(i, kind)| HistoryEvent::new(i as u64 + 1, kind))
            .collect()
    }

    #[test]
    fn test_outstanding_work() {
        let events = history();
        let view = HistoryView::new(&events);
        let outstanding = view.outstanding();
        assert!(outstanding.activities.is_empty());
        assert_eq!(outstanding.timers.len(), 1);
        assert_eq!(outstanding.timers[0].seq, 1);
        assert_eq!(outstanding.children.len(), 1);
        assert_eq!(view.status(), WorkflowStatus::Running);
        assert_eq!(view.started().unwrap().workflow_type, "SVMCreation");
    }

    #[test]
    fn test_event_json_shape() {
        let event = HistoryEvent::new(
            4,
            EventKind::TimerStarted {
                seq: 1,
                fire_after: Duration::from_secs(30),
                fire_at: Utc::now(),
            },
        );
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["kind"]["event_type"], "timer_started");
        assert_eq!(json["kind"]["fire_after"], 30_000);
        let parsed: HistoryEvent = serde_json::from_value(json).unwrap();
        assert_eq!(parsed, event);
    }

    #[test]
    fn test_terminal_status_from_history() {
        let mut events = history();
        events.push(HistoryEvent::new(
            6,
            EventKind::WorkflowCanceled {
                reason: "operator".to_string(),
            },
        ));
        assert_eq!(HistoryView::new(&events).status(), WorkflowStatus::Canceled);
    }
}
