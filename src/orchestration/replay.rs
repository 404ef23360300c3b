//! # Replay Turns
//!
//! An [`Execution`] is one live run of a coordination function. It starts by
//! replaying the history stored so far, then stays suspended between turns
//! while the runtime records new events and feeds them in with
//! [`Execution::observe`]. A turn polls the function until it completes, fails
//! or suspends again, and reports the commands for suspension points history
//! has not seen yet.
//!
//! Suspension points are ready exactly when their resolution is in history, so
//! a rebuilt execution reaches the same state as the one that recorded the
//! history. Only a start pays for the history behind it; every later turn
//! costs what the newly resolved suspension points cost.

use super::context::{Command, ReplayState, WorkflowContext};
use super::workflow::ErasedWorkflow;
use crate::error::{WorkflowError, WorkflowResult};
use crate::history::HistoryEvent;
use futures::future::BoxFuture;
use futures::task::{waker_ref, ArcWake};
use parking_lot::Mutex;
use serde_json::Value;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use tracing::trace;

/// Where a coordination function stands after a turn
#[derive(Debug, Clone, PartialEq)]
pub enum TurnOutcome {
    Completed(Value),
    Failed(WorkflowError),
    Suspended {
        /// New work to record and start, in call order
        commands: Vec<Command>,
        /// Suspension points the function is blocked on
        awaiting: Vec<u64>,
    },
}

/// Set when a resolved suspension point needs the function polled again
struct Wakeup(AtomicBool);

impl ArcWake for Wakeup {
    fn wake_by_ref(arc_self: &Arc<Self>) {
        arc_self.0.store(true, Ordering::Release);
    }
}

/// A coordination function kept alive across turns
pub struct Execution {
    workflow_id: String,
    state: Arc<Mutex<ReplayState>>,
    future: Option<BoxFuture<'static, WorkflowResult<Value>>>,
    wakeup: Arc<Wakeup>,
    turns: u64,
}

impl fmt::Debug for Execution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Execution")
            .field("workflow_id", &self.workflow_id)
            .field("finished", &self.future.is_none())
            .field("turns", &self.turns)
            .finish()
    }
}

impl Execution {
    /// Start `definition` and bring it level with `history`
    pub fn start(
        definition: &Arc<dyn ErasedWorkflow>,
        workflow_id: &str,
        input: &Value,
        history: &[HistoryEvent],
    ) -> Self {
        let state = Arc::new(Mutex::new(ReplayState::from_history(
            workflow_id,
            definition.workflow_type(),
            history,
        )));
        let ctx = WorkflowContext::new(Arc::clone(&state));
        let future = Arc::clone(definition).run_json(ctx, input.clone());

        Self {
            workflow_id: workflow_id.to_string(),
            state,
            future: Some(future),
            wakeup: Arc::new(Wakeup(AtomicBool::new(true))),
            turns: 0,
        }
    }

    /// Feed an event recorded after the start
    pub fn observe(&mut self, event: &HistoryEvent) {
        let waker = self.state.lock().observe(event);
        if let Some(waker) = waker {
            waker.wake();
        }
    }

    /// An observed resolution is waiting for the next turn
    pub fn is_woken(&self) -> bool {
        self.wakeup.0.load(Ordering::Acquire)
    }

    pub fn is_finished(&self) -> bool {
        self.future.is_none()
    }

    /// Number of turns taken since the start
    pub fn turns(&self) -> u64 {
        self.turns
    }

    /// Poll the function until it completes, fails or blocks again
    pub fn turn(&mut self) -> TurnOutcome {
        let Some(future) = self.future.as_mut() else {
            return TurnOutcome::Failed(WorkflowError::application(
                "coordination function has already finished",
            ));
        };
        self.turns += 1;

        let waker = waker_ref(&self.wakeup);
        let mut cx = Context::from_waker(&waker);
        let poll = loop {
            self.wakeup.0.store(false, Ordering::Release);
            match future.as_mut().poll(&mut cx) {
                Poll::Pending if self.wakeup.0.load(Ordering::Acquire) => continue,
                poll => break poll,
            }
        };
        if poll.is_ready() {
            // Dropping the future touches the shared state
            self.future = None;
        }

        let mut state = self.state.lock();
        if let Some(error) = state.take_nondeterminism() {
            return TurnOutcome::Failed(error);
        }

        match poll {
            Poll::Ready(Ok(result)) => TurnOutcome::Completed(result),
            Poll::Ready(Err(error)) => TurnOutcome::Failed(error),
            Poll::Pending => {
                let awaiting = state.awaiting();
                if awaiting.is_empty() {
                    return TurnOutcome::Failed(WorkflowError::application(
                        "coordination function suspended outside of a workflow primitive",
                    ));
                }
                let commands = state.take_commands();
                trace!(
                    workflow_id = %self.workflow_id,
                    turn = self.turns,
                    commands = commands.len(),
                    awaiting = ?awaiting,
                    "Turn suspended"
                );
                TurnOutcome::Suspended { commands, awaiting }
            }
        }
    }
}

/// Run `definition` from the start against `history` and report where it stands
pub fn run_turn(
    definition: &Arc<dyn ErasedWorkflow>,
    workflow_id: &str,
    input: &Value,
    history: &[HistoryEvent],
) -> TurnOutcome {
    Execution::start(definition, workflow_id, input, history).turn()
}
