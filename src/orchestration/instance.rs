//! # Workflow Instance Records
//!
//! Read models of one workflow instance: its activity invocations, timers and
//! children, plus the snapshot returned by `describe` and the outcome returned
//! once the instance is terminal. These are views maintained by the instance's
//! actor; history remains the source of truth.

use super::activity_invoker::ActivityUpdate;
use super::retry_policy::RetryPolicy;
use crate::constants::defaults;
use crate::error::WorkflowError;
use crate::history::{EventKind, HistoryEvent, ParentRef};
use crate::state_machine::{
    next_activity_status, next_timer_status, ActivityEvent, ActivityStatus, TimerEvent,
    TimerStatus, WorkflowStatus,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::debug;

/// One scheduled activity call and its progress across attempts
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ActivityInvocation {
    pub seq: u64,
    pub activity_id: String,
    pub activity_type: String,
    pub input: Value,
    pub attempt: u32,
    pub retry_policy: RetryPolicy,
    pub start_to_close_timeout: Duration,
    pub status: ActivityStatus,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TimerRecord {
    pub seq: u64,
    pub fire_after: Duration,
    pub fire_at: DateTime<Utc>,
    pub status: TimerStatus,
}

/// A child started by this instance
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChildRecord {
    pub seq: u64,
    pub child_id: String,
    pub workflow_type: String,
    pub detached: bool,
    /// Terminal status once the child reported back
    pub outcome: Option<WorkflowStatus>,
}

/// Point-in-time view of an instance
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorkflowSnapshot {
    pub workflow_id: String,
    pub workflow_type: String,
    pub status: WorkflowStatus,
    pub parent: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub closed_at: Option<DateTime<Utc>>,
    pub history_length: usize,
    pub activities: Vec<ActivityInvocation>,
    pub timers: Vec<TimerRecord>,
    pub children: Vec<ChildRecord>,
    pub result: Option<Value>,
    pub error: Option<WorkflowError>,
}

impl WorkflowSnapshot {
    pub fn new(workflow_id: &str, workflow_type: &str) -> Self {
        Self {
            workflow_id: workflow_id.to_string(),
            workflow_type: workflow_type.to_string(),
            status: WorkflowStatus::Scheduled,
            parent: None,
            started_at: None,
            closed_at: None,
            history_length: 0,
            activities: Vec::new(),
            timers: Vec::new(),
            children: Vec::new(),
            result: None,
            error: None,
        }
    }

    /// Rebuild a snapshot from recorded history
    pub fn from_history(workflow_id: &str, workflow_type: &str, history: &[HistoryEvent]) -> Self {
        let (snapshot, _) = Self::fold(workflow_id, workflow_type, history);
        snapshot
    }

    pub(crate) fn fold(
        workflow_id: &str,
        workflow_type: &str,
        history: &[HistoryEvent],
    ) -> (Self, InstanceRecords) {
        let mut records = InstanceRecords::default();
        let mut snapshot = Self::new(workflow_id, workflow_type);
        for event in history {
            records.apply(event);
            snapshot.apply_lifecycle(event);
        }
        records.fill(&mut snapshot);
        (snapshot, records)
    }

    pub(crate) fn apply_lifecycle(&mut self, event: &HistoryEvent) {
        self.history_length = event.event_id as usize;
        match &event.kind {
            EventKind::WorkflowStarted { parent, .. } => {
                self.started_at = Some(event.recorded_at);
                self.parent = parent.as_ref().map(|p: &ParentRef| p.workflow_id.clone());
                self.status = WorkflowStatus::Running;
            }
            EventKind::WorkflowCompleted { result } => {
                self.result = Some(result.clone());
            }
            EventKind::WorkflowFailed { error } => {
                self.error = Some(error.clone());
            }
            EventKind::WorkflowCanceled { reason } => {
                self.error = Some(WorkflowError::Canceled {
                    reason: reason.clone(),
                });
            }
            EventKind::WorkflowTimedOut { timeout } => {
                self.error = Some(WorkflowError::TimedOut {
                    timeout_secs: timeout.as_secs(),
                });
            }
            _ => {}
        }
        if let Some(status) = event.kind.terminal_status() {
            self.status = status;
            self.closed_at = Some(event.recorded_at);
        }
    }

    /// Terminal outcome, once the instance has closed
    pub fn outcome(&self) -> Option<WorkflowOutcome> {
        if !self.status.is_terminal() {
            return None;
        }
        Some(WorkflowOutcome {
            workflow_id: self.workflow_id.clone(),
            workflow_type: self.workflow_type.clone(),
            status: self.status,
            result: self.result.clone(),
            failure_chain: self
                .error
                .as_ref()
                .map(WorkflowError::failure_chain)
                .unwrap_or_default(),
            error: self.error.clone(),
        })
    }
}

/// What a caller learns when an instance closes
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorkflowOutcome {
    pub workflow_id: String,
    pub workflow_type: String,
    pub status: WorkflowStatus,
    pub result: Option<Value>,
    pub error: Option<WorkflowError>,
    /// Rendered error chain, outermost first
    pub failure_chain: Vec<String>,
}

impl WorkflowOutcome {
    pub fn is_completed(&self) -> bool {
        self.status == WorkflowStatus::Completed
    }

    /// Deserialize the result of a completed instance
    pub fn result_as<T: serde::de::DeserializeOwned>(&self) -> Option<T> {
        self.result
            .as_ref()
            .and_then(|value| serde_json::from_value(value.clone()).ok())
    }
}

/// Activity, timer and child records keyed by suspension point
#[derive(Debug, Clone, Default)]
pub(crate) struct InstanceRecords {
    activities: BTreeMap<u64, ActivityInvocation>,
    timers: BTreeMap<u64, TimerRecord>,
    children: BTreeMap<u64, ChildRecord>,
}

impl InstanceRecords {
    /// Fold one history event into the records
    pub(crate) fn apply(&mut self, event: &HistoryEvent) {
        match &event.kind {
            EventKind::ActivityScheduled {
                seq,
                activity_id,
                activity_type,
                input,
                options,
            } => {
                self.activities.insert(
                    *seq,
                    ActivityInvocation {
                        seq: *seq,
                        activity_id: activity_id.clone(),
                        activity_type: activity_type.clone(),
                        input: input.clone(),
                        attempt: 0,
                        retry_policy: options.retry_policy.clone(),
                        start_to_close_timeout: options.start_to_close_timeout,
                        status: ActivityStatus::Scheduled,
                        last_error: None,
                    },
                );
            }
            EventKind::ActivityCompleted { seq, attempts, .. } => {
                if let Some(activity) = self.activities.get_mut(seq) {
                    activity.status = ActivityStatus::Completed;
                    activity.attempt = *attempts;
                }
            }
            EventKind::ActivityFailed {
                seq,
                attempts,
                error,
            } => {
                if let Some(activity) = self.activities.get_mut(seq) {
                    activity.status = match error {
                        WorkflowError::ActivityFailed {
                            timed_out: true, ..
                        } => ActivityStatus::TimedOut,
                        _ => ActivityStatus::Failed,
                    };
                    activity.attempt = *attempts;
                    activity.last_error = Some(error.to_string());
                }
            }
            EventKind::TimerStarted {
                seq,
                fire_after,
                fire_at,
            } => {
                self.timers.insert(
                    *seq,
                    TimerRecord {
                        seq: *seq,
                        fire_after: *fire_after,
                        fire_at: *fire_at,
                        status: TimerStatus::Scheduled,
                    },
                );
            }
            EventKind::TimerFired { seq } => self.timer_event(*seq, TimerEvent::Fire),
            EventKind::TimerCanceled { seq } => self.timer_event(*seq, TimerEvent::Cancel),
            EventKind::ChildWorkflowStarted {
                seq,
                child_id,
                workflow_type,
                detached,
                ..
            } => {
                self.children.insert(
                    *seq,
                    ChildRecord {
                        seq: *seq,
                        child_id: child_id.clone(),
                        workflow_type: workflow_type.clone(),
                        detached: *detached,
                        outcome: None,
                    },
                );
            }
            EventKind::ChildWorkflowCompleted { seq, .. } => {
                if let Some(child) = self.children.get_mut(seq) {
                    child.outcome = Some(WorkflowStatus::Completed);
                }
            }
            EventKind::ChildWorkflowFailed { seq, error, .. } => {
                if let Some(child) = self.children.get_mut(seq) {
                    child.outcome = Some(match error.kind() {
                        crate::error::FailureKind::WorkflowCanceled => WorkflowStatus::Canceled,
                        crate::error::FailureKind::WorkflowTimedOut => WorkflowStatus::TimedOut,
                        _ => WorkflowStatus::Failed,
                    });
                }
            }
            _ => {}
        }

        retain_recent(&mut self.activities, |activity| {
            activity.status.is_attempt_concluded()
        });
        retain_recent(&mut self.timers, |timer| timer.status != TimerStatus::Scheduled);
        retain_recent(&mut self.children, |child| {
            child.detached || child.outcome.is_some()
        });
    }

    pub(crate) fn activity(&self, seq: u64) -> Option<&ActivityInvocation> {
        self.activities.get(&seq)
    }

    fn timer_event(&mut self, seq: u64, event: TimerEvent) {
        if let Some(timer) = self.timers.get_mut(&seq) {
            if let Ok(status) = next_timer_status(timer.status, event) {
                timer.status = status;
            }
        }
    }

    /// Apply a live progress report from the invoker
    pub(crate) fn apply_update(&mut self, seq: u64, update: &ActivityUpdate) {
        let Some(activity) = self.activities.get_mut(&seq) else {
            return;
        };
        let event = match update.status {
            ActivityStatus::Started => ActivityEvent::Start,
            ActivityStatus::Completed => ActivityEvent::Complete,
            ActivityStatus::Failed => ActivityEvent::Fail(update.error.clone().unwrap_or_default()),
            ActivityStatus::TimedOut => ActivityEvent::TimeOut,
            ActivityStatus::RetryScheduled => ActivityEvent::ScheduleRetry,
            ActivityStatus::Scheduled => return,
        };
        match next_activity_status(activity.status, &event) {
            Ok(status) => {
                activity.status = status;
                activity.attempt = update.attempt;
                if update.error.is_some() {
                    activity.last_error = update.error.clone();
                }
            }
            Err(e) => {
                // Re-dispatch after recovery restarts the attempt cycle
                debug!(activity_id = %activity.activity_id, error = %e, "Ignoring activity update");
            }
        }
    }

    pub(crate) fn fill(&self, snapshot: &mut WorkflowSnapshot) {
        snapshot.activities = self.activities.values().cloned().collect();
        snapshot.timers = self.timers.values().cloned().collect();
        snapshot.children = self.children.values().cloned().collect();
    }
}

/// Drop the oldest closed records beyond the snapshot limit. Open records are
/// always kept, so a long-running instance keeps a bounded view.
fn retain_recent<T>(records: &mut BTreeMap<u64, T>, is_closed: impl Fn(&T) -> bool) {
    while records.len() > defaults::SNAPSHOT_CLOSED_RECORDS {
        let oldest_closed = records
            .iter()
            .find(|(_, record)| is_closed(record))
            .map(|(seq, _)| *seq);
        match oldest_closed {
            Some(seq) => {
                records.remove(&seq);
            }
            None => break,
        }
    }
}
