use thiserror::Error;

/// State machine errors
#[derive(Debug, Clone, PartialEq, Error)]
pub enum StateMachineError {
    #[error("Invalid transition from {from} on event {event}")]
    InvalidTransition { from: String, event: String },

    #[error("{entity} {id} is in terminal state {state}")]
    AlreadyTerminal {
        entity: &'static str,
        id: String,
        state: String,
    },
}

pub type StateMachineResult<T> = Result<T, StateMachineError>;
