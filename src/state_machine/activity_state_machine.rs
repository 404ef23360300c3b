use super::errors::{StateMachineError, StateMachineResult};
use super::events::{ActivityEvent, TimerEvent};
use super::states::{ActivityStatus, TimerStatus};

/// Transition table for an activity invocation.
///
/// ```text
/// Scheduled ─start→ Started ─complete→ Completed
///                      │ fail / time_out
///                      ▼
///              Failed | TimedOut ─schedule_retry→ RetryScheduled ─start→ Started
/// ```
pub fn next_activity_status(
    current: ActivityStatus,
    event: &ActivityEvent,
) -> StateMachineResult<ActivityStatus> {
    let target = match (current, event) {
        (ActivityStatus::Scheduled | ActivityStatus::RetryScheduled, ActivityEvent::Start) => {
            ActivityStatus::Started
        }
        (ActivityStatus::Started, ActivityEvent::Complete) => ActivityStatus::Completed,
        (ActivityStatus::Started, ActivityEvent::Fail(_)) => ActivityStatus::Failed,
        (ActivityStatus::Started, ActivityEvent::TimeOut) => ActivityStatus::TimedOut,
        (ActivityStatus::Failed | ActivityStatus::TimedOut, ActivityEvent::ScheduleRetry) => {
            ActivityStatus::RetryScheduled
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

/// Transition table for a durable timer. Exactly one of Fired/Canceled.
pub fn next_timer_status(current: TimerStatus, event: TimerEvent) -> StateMachineResult<TimerStatus> {
    match (current, event) {
        (TimerStatus::Scheduled, TimerEvent::Fire) => Ok(TimerStatus::Fired),
        (TimerStatus::Scheduled, TimerEvent::Cancel) => Ok(TimerStatus::Canceled),
        (from_state, event) => Err(StateMachineError::InvalidTransition {
            from: from_state.to_string(),
            event: format!("{event:?}").to_lowercase(),
        }),
    }
}
