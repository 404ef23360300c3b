//! # Workflow Context
//!
//! The only capability set a coordination function receives. Every call that
//! reaches outside the function (activity, timer, child workflow, signal wait)
//! is a suspension point with a sequence number assigned in call order.
//!
//! The context answers suspension points from history. A point with a recorded
//! resolution completes immediately; a point with no scheduling event yet
//! produces a [`Command`] for the runtime to carry out, and wakes the function
//! once the runtime records its resolution. Requesting something different
//! from what history recorded at the same sequence number is reported as
//! nondeterminism.

use super::activity::{Activity, ActivityOptions};
use super::workflow::Workflow;
use crate::error::{WorkflowError, WorkflowResult};
use crate::history::{EventKind, HistoryEvent};
use serde::de::DeserializeOwned;
use serde_json::Value;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, Waker};
use std::time::Duration;

/// Work the runtime must start on behalf of a suspended coordination function
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    ScheduleActivity {
        seq: u64,
        activity_id: String,
        activity_type: String,
        input: Value,
        options: ActivityOptions,
    },
    StartTimer {
        seq: u64,
        fire_after: Duration,
    },
    StartChildWorkflow {
        seq: u64,
        child_id: String,
        workflow_type: String,
        input: Value,
        detached: bool,
    },
    WaitForSignal {
        seq: u64,
        signal_name: String,
    },
}

impl Command {
    pub fn seq(&self) -> u64 {
        match self {
            Self::ScheduleActivity { seq, .. }
            | Self::StartTimer { seq, .. }
            | Self::StartChildWorkflow { seq, .. }
            | Self::WaitForSignal { seq, .. } => *seq,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CallKind {
    Activity,
    Timer,
    ChildWorkflow,
    Signal,
}

/// What a suspension point asked for, compared against history on replay
#[derive(Debug, Clone, PartialEq, Eq)]
struct Call {
    kind: CallKind,
    name: String,
    target: Option<String>,
}

impl fmt::Display for Call {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.kind, &self.target) {
            (CallKind::Activity, _) => write!(f, "activity {}", self.name),
            (CallKind::Timer, _) => write!(f, "timer"),
            (CallKind::ChildWorkflow, Some(child_id)) => {
                write!(f, "child workflow {} ({child_id})", self.name)
            }
            (CallKind::ChildWorkflow, None) => write!(f, "child workflow {}", self.name),
            (CallKind::Signal, _) => write!(f, "signal {}", self.name),
        }
    }
}

/// Whether an event comes from stored history or was recorded while running
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Origin {
    Replayed,
    Live,
}

/// Replay bookkeeping shared by the context and its suspension futures.
///
/// Built once from stored history when an instance starts or is recovered,
/// then kept current by observing every event the runtime records afterwards.
pub(crate) struct ReplayState {
    workflow_id: String,
    workflow_type: String,
    next_seq: u64,
    /// Scheduling events from stored history the function has not reached yet
    recorded: BTreeMap<u64, Call>,
    resolutions: HashMap<u64, WorkflowResult<Value>>,
    /// Resolutions from stored history the function has not consumed yet
    replayed: HashSet<u64>,
    /// Pending suspension points and the waker of their last poll
    awaiting: BTreeMap<u64, Option<Waker>>,
    commands: Vec<Command>,
    nondeterminism: Option<WorkflowError>,
    /// Attached children without an outcome, for wrapping their failures
    children: HashMap<u64, String>,
    /// The n-th wait on a signal name is resolved by the n-th signal of that name
    signal_waits: HashMap<String, VecDeque<u64>>,
    buffered_signals: HashMap<String, VecDeque<Value>>,
}

impl ReplayState {
    pub(crate) fn from_history(workflow_id: &str, workflow_type: &str, history: &[HistoryEvent]) -> Self {
        let mut state = Self {
            workflow_id: workflow_id.to_string(),
            workflow_type: workflow_type.to_string(),
            next_seq: 0,
            recorded: BTreeMap::new(),
            resolutions: HashMap::new(),
            replayed: HashSet::new(),
            awaiting: BTreeMap::new(),
            commands: Vec::new(),
            nondeterminism: None,
            children: HashMap::new(),
            signal_waits: HashMap::new(),
            buffered_signals: HashMap::new(),
        };
        for event in history {
            state.apply(event, Origin::Replayed);
        }
        state
    }

    /// Fold an event recorded after the function started. Returns the waker
    /// of a suspension point the event resolved.
    pub(crate) fn observe(&mut self, event: &HistoryEvent) -> Option<Waker> {
        self.apply(event, Origin::Live)
    }

    fn apply(&mut self, event: &HistoryEvent, origin: Origin) -> Option<Waker> {
        match &event.kind {
            EventKind::ActivityScheduled {
                seq, activity_type, ..
            } => {
                self.scheduled(origin, *seq, Call {
                    kind: CallKind::Activity,
                    name: activity_type.clone(),
                    target: None,
                });
                None
            }
            EventKind::TimerStarted { seq, .. } => {
                self.scheduled(origin, *seq, Call {
                    kind: CallKind::Timer,
                    name: "timer".to_string(),
                    target: None,
                });
                None
            }
            EventKind::ChildWorkflowStarted {
                seq,
                child_id,
                workflow_type,
                detached,
                ..
            } => {
                if !detached {
                    self.children.insert(*seq, workflow_type.clone());
                }
                self.scheduled(origin, *seq, Call {
                    kind: CallKind::ChildWorkflow,
                    name: workflow_type.clone(),
                    target: Some(child_id.clone()),
                });
                None
            }
            EventKind::SignalWaitStarted { seq, signal_name } => {
                self.scheduled(origin, *seq, Call {
                    kind: CallKind::Signal,
                    name: signal_name.clone(),
                    target: None,
                });
                let buffered = self
                    .buffered_signals
                    .get_mut(signal_name.as_str())
                    .and_then(VecDeque::pop_front);
                match buffered {
                    Some(payload) => self.resolve(origin, *seq, Ok(payload)),
                    None => {
                        self.signal_waits
                            .entry(signal_name.clone())
                            .or_default()
                            .push_back(*seq);
                        None
                    }
                }
            }
            EventKind::SignalReceived {
                signal_name,
                payload,
            } => {
                let waiting = self
                    .signal_waits
                    .get_mut(signal_name.as_str())
                    .and_then(VecDeque::pop_front);
                match waiting {
                    Some(seq) => self.resolve(origin, seq, Ok(payload.clone())),
                    None => {
                        self.buffered_signals
                            .entry(signal_name.clone())
                            .or_default()
                            .push_back(payload.clone());
                        None
                    }
                }
            }
            EventKind::ActivityCompleted { seq, result, .. }
            | EventKind::ChildWorkflowCompleted { seq, result, .. } => {
                self.children.remove(seq);
                self.resolve(origin, *seq, Ok(result.clone()))
            }
            EventKind::ActivityFailed { seq, error, .. } => {
                self.resolve(origin, *seq, Err(error.clone()))
            }
            EventKind::TimerFired { seq } => self.resolve(origin, *seq, Ok(Value::Null)),
            EventKind::ChildWorkflowFailed {
                seq,
                child_id,
                error,
            } => {
                let workflow_type = self.children.remove(seq).unwrap_or_default();
                let error = match error {
                    WorkflowError::ChildWorkflowStartFailed { .. } => error.clone(),
                    cause => WorkflowError::ChildWorkflowFailed {
                        child_id: child_id.clone(),
                        workflow_type,
                        cause: Box::new(cause.clone()),
                    },
                };
                self.resolve(origin, *seq, Err(error))
            }
            _ => None,
        }
    }

    /// Live scheduling events echo commands the function already issued
    fn scheduled(&mut self, origin: Origin, seq: u64, call: Call) {
        if origin == Origin::Replayed {
            self.recorded.insert(seq, call);
        }
    }

    fn resolve(&mut self, origin: Origin, seq: u64, resolution: WorkflowResult<Value>) -> Option<Waker> {
        if origin == Origin::Replayed {
            self.replayed.insert(seq);
        }
        self.resolutions.insert(seq, resolution);
        self.awaiting.get_mut(&seq).and_then(Option::take)
    }

    fn schedule(&mut self, call: Call, command: impl FnOnce(u64) -> Command) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;

        match self.recorded.remove(&seq) {
            Some(recorded) if recorded == call => {}
            Some(recorded) => {
                if self.nondeterminism.is_none() {
                    self.nondeterminism = Some(WorkflowError::NonDeterminism {
                        seq,
                        requested: call.to_string(),
                        recorded: recorded.to_string(),
                    });
                }
            }
            None => self.commands.push(command(seq)),
        }
        seq
    }

    fn poll_resolution(&mut self, seq: u64, waker: &Waker) -> Poll<WorkflowResult<Value>> {
        match self.resolutions.remove(&seq) {
            Some(resolution) => {
                self.replayed.remove(&seq);
                self.awaiting.remove(&seq);
                Poll::Ready(resolution)
            }
            None => {
                self.awaiting.insert(seq, Some(waker.clone()));
                Poll::Pending
            }
        }
    }

    /// The function dropped a suspension point without awaiting it to the end
    fn forget(&mut self, seq: u64) {
        self.awaiting.remove(&seq);
        if self.replayed.remove(&seq) {
            self.resolutions.remove(&seq);
        }
    }

    pub(crate) fn is_replaying(&self) -> bool {
        !self.replayed.is_empty()
    }

    /// Nondeterminism observed so far, including recorded calls the function
    /// never reached again
    pub(crate) fn take_nondeterminism(&mut self) -> Option<WorkflowError> {
        if let Some(error) = self.nondeterminism.take() {
            return Some(error);
        }
        self.recorded
            .range(self.next_seq..)
            .next()
            .map(|(seq, recorded)| WorkflowError::NonDeterminism {
                seq: *seq,
                requested: "no further suspension point".to_string(),
                recorded: recorded.to_string(),
            })
    }

    pub(crate) fn take_commands(&mut self) -> Vec<Command> {
        std::mem::take(&mut self.commands)
    }

    pub(crate) fn awaiting(&self) -> Vec<u64> {
        self.awaiting.keys().copied().collect()
    }
}

/// Capability handle passed to coordination functions
#[derive(Clone)]
pub struct WorkflowContext {
    state: Arc<Mutex<ReplayState>>,
}

impl fmt::Debug for WorkflowContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("WorkflowContext")
            .field("workflow_id", &state.workflow_id)
            .field("workflow_type", &state.workflow_type)
            .field("next_seq", &state.next_seq)
            .finish()
    }
}

impl WorkflowContext {
    pub(crate) fn new(state: Arc<Mutex<ReplayState>>) -> Self {
        Self { state }
    }

    pub fn workflow_id(&self) -> String {
        self.state.lock().workflow_id.clone()
    }

    pub fn workflow_type(&self) -> String {
        self.state.lock().workflow_type.clone()
    }

    /// True while the function is re-executing code whose outcome is already
    /// recorded. Side-effect-free logging should be skipped in that case.
    pub fn is_replaying(&self) -> bool {
        self.state.lock().is_replaying()
    }

    fn suspend(&self, seq: u64) -> Suspension {
        Suspension {
            state: Arc::clone(&self.state),
            seq,
        }
    }

    /// Schedule an activity and wait for its final outcome
    pub fn execute_activity<A: Activity>(
        &self,
        input: &A::Input,
        options: ActivityOptions,
    ) -> impl Future<Output = WorkflowResult<A::Output>> {
        let scheduled = serde_json::to_value(input)
            .map_err(|e| WorkflowError::payload("activity input serialization failed", e))
            .map(|input| {
                let seq = self.state.lock().schedule(
                    Call {
                        kind: CallKind::Activity,
                        name: A::ACTIVITY_TYPE.to_string(),
                        target: None,
                    },
                    |seq| Command::ScheduleActivity {
                        seq,
                        activity_id: format!("{}#{seq}", A::ACTIVITY_TYPE),
                        activity_type: A::ACTIVITY_TYPE.to_string(),
                        input,
                        options,
                    },
                );
                self.suspend(seq)
            });

        async move {
            let value = scheduled?.await?;
            serde_json::from_value(value)
                .map_err(|e| WorkflowError::payload("activity output deserialization failed", e))
        }
    }

    /// Durable sleep on the workflow's logical clock
    pub fn sleep(&self, duration: Duration) -> impl Future<Output = ()> {
        let seq = self.state.lock().schedule(
            Call {
                kind: CallKind::Timer,
                name: "timer".to_string(),
                target: None,
            },
            |seq| Command::StartTimer {
                seq,
                fire_after: duration,
            },
        );
        let suspension = self.suspend(seq);
        async move {
            // Timers resolve only by firing
            let _ = suspension.await;
        }
    }

    /// Start a child workflow whose result the parent will await
    pub fn start_child<W: Workflow>(
        &self,
        child_id: impl Into<String>,
        input: &W::Input,
    ) -> ChildWorkflowHandle<W::Output> {
        let child_id = child_id.into();
        match serde_json::to_value(input) {
            Ok(input) => self.start_child_by_type(W::WORKFLOW_TYPE, child_id, input),
            Err(e) => ChildWorkflowHandle {
                child_id,
                slot: Err(WorkflowError::payload("child input serialization failed", e)),
                _output: PhantomData,
            },
        }
    }

    /// Start a child workflow by type name with a JSON input
    pub fn start_child_by_type<T>(
        &self,
        workflow_type: &str,
        child_id: impl Into<String>,
        input: Value,
    ) -> ChildWorkflowHandle<T> {
        let child_id = child_id.into();
        let seq = self.schedule_child(workflow_type, &child_id, input, false);
        ChildWorkflowHandle {
            child_id,
            slot: Ok(self.suspend(seq)),
            _output: PhantomData,
        }
    }

    /// Start a child workflow that outlives this instance and never reports back
    pub fn start_detached_child<W: Workflow>(
        &self,
        child_id: impl Into<String>,
        input: &W::Input,
    ) -> WorkflowResult<()> {
        let input = serde_json::to_value(input)
            .map_err(|e| WorkflowError::payload("child input serialization failed", e))?;
        self.schedule_child(W::WORKFLOW_TYPE, &child_id.into(), input, true);
        Ok(())
    }

    fn schedule_child(&self, workflow_type: &str, child_id: &str, input: Value, detached: bool) -> u64 {
        self.state.lock().schedule(
            Call {
                kind: CallKind::ChildWorkflow,
                name: workflow_type.to_string(),
                target: Some(child_id.to_string()),
            },
            |seq| Command::StartChildWorkflow {
                seq,
                child_id: child_id.to_string(),
                workflow_type: workflow_type.to_string(),
                input,
                detached,
            },
        )
    }

    /// Wait for the next signal of `signal_name` delivered to this instance
    pub fn wait_for_signal<T: DeserializeOwned>(
        &self,
        signal_name: &str,
    ) -> impl Future<Output = WorkflowResult<T>> {
        let seq = self.state.lock().schedule(
            Call {
                kind: CallKind::Signal,
                name: signal_name.to_string(),
                target: None,
            },
            |seq| Command::WaitForSignal {
                seq,
                signal_name: signal_name.to_string(),
            },
        );
        let suspension = self.suspend(seq);
        async move {
            let payload = suspension.await?;
            serde_json::from_value(payload)
                .map_err(|e| WorkflowError::payload("signal payload deserialization failed", e))
        }
    }
}

/// Future for one suspension point
struct Suspension {
    state: Arc<Mutex<ReplayState>>,
    seq: u64,
}

impl Future for Suspension {
    type Output = WorkflowResult<Value>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.state.lock().poll_resolution(self.seq, cx.waker())
    }
}

impl Drop for Suspension {
    fn drop(&mut self) {
        self.state.lock().forget(self.seq);
    }
}

/// Reference from a parent to a started child workflow
pub struct ChildWorkflowHandle<T> {
    child_id: String,
    slot: WorkflowResult<Suspension>,
    _output: PhantomData<T>,
}

impl<T: DeserializeOwned> ChildWorkflowHandle<T> {
    pub fn child_id(&self) -> &str {
        &self.child_id
    }

    /// Wait until the child reaches a terminal state
    pub async fn result(self) -> WorkflowResult<T> {
        let value = self.slot?.await?;
        serde_json::from_value(value)
            .map_err(|e| WorkflowError::payload("child output deserialization failed", e))
    }
}

impl<T> fmt::Debug for ChildWorkflowHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChildWorkflowHandle")
            .field("child_id", &self.child_id)
            .finish()
    }
}
