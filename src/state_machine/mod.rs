// Status enums and transition tables for workflow instances, activity
// invocations and timers.

pub mod activity_state_machine;
pub mod errors;
pub mod events;
pub mod states;
pub mod workflow_state_machine;

pub use activity_state_machine::{next_activity_status, next_timer_status};
pub use errors::{StateMachineError, StateMachineResult};
pub use events::{ActivityEvent, TimerEvent, WorkflowEvent};
pub use states::{ActivityStatus, TimerStatus, WorkflowStatus};
pub use workflow_state_machine::WorkflowStateMachine;
