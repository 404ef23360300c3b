//! # Workflow Runtime
//!
//! The dispatcher: accepts start, signal and cancel requests, creates workflow
//! instances from the catalog and drives each one with its own actor task.
//!
//! ## Instance actors
//!
//! Every instance is owned by exactly one actor that applies its events strictly
//! in the order they are resolved. An actor:
//!
//! 1. records an event in the history store before acting on it,
//! 2. feeds the event to the live execution of the coordination function and
//!    runs a turn if the event resolved something the function waits on,
//! 3. records and starts the commands the turn produced (activities on the
//!    invoker pool, timers on the timer service, children as new instances),
//! 4. waits for the next resolution, signal or cancellation.
//!
//! Resolutions that arrive twice (a re-dispatched activity after recovery, a
//! child reporting back while the parent was restoring) are ignored once the
//! suspension point is resolved in history.
//!
//! An append that keeps failing after a few quick retries does not end the
//! actor. It drops its in-memory state, reloads the instance from the store
//! with backoff and resumes the way recovery does.
//!
//! ## Recovery
//!
//! [`WorkflowRuntime::recover`] rebuilds every stored instance. Handles for all
//! instances are registered before any actor starts so that children and
//! parents can find each other, then each non-terminal actor replays its
//! function once and re-dispatches the work its history shows as outstanding.
//!
//! ## Instance ids
//!
//! An id belongs to one instance while it runs. Starting a new instance under
//! the id of a closed one archives the closed run's history in the store and
//! replaces its handle.

use super::activity::ActivityRegistry;
use super::activity_invoker::{
    ActivityInvoker, ActivityRequest, ActivityUpdate, InvocationResult,
};
use super::instance::{InstanceRecords, WorkflowOutcome, WorkflowSnapshot};
use super::replay::{Execution, TurnOutcome};
use super::retry_policy::RetryPolicy;
use super::timer_service::TimerService;
use super::workflow::{ErasedWorkflow, Workflow, WorkflowCatalog};
use super::context::Command;
use crate::config::WorkflowEngineConfig;
use crate::constants::defaults;
use crate::error::{EngineError, EngineResult, WorkflowError};
use crate::events::{EventPublisher, WorkflowNotification};
use crate::history::{
    validate_instance_id, EventKind, HistoryEvent, HistoryStore, HistoryView,
    InMemoryHistoryStore, ParentRef,
};
use crate::logging::{log_error, log_workflow_operation};
use crate::orchestration::activity::Activity;
use crate::state_machine::{WorkflowEvent, WorkflowStateMachine, WorkflowStatus};
use chrono::Utc;
use dashmap::DashMap;
use futures::future::BoxFuture;
use futures::FutureExt;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

/// Options for a start request
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StartWorkflowOptions {
    /// Generated as `{workflow_type}-{uuid}` when absent
    pub workflow_id: Option<String>,
    /// Whole-instance deadline; the instance is timed out when it elapses
    pub execution_timeout: Option<Duration>,
}

impl StartWorkflowOptions {
    pub fn with_id(workflow_id: impl Into<String>) -> Self {
        Self {
            workflow_id: Some(workflow_id.into()),
            ..Default::default()
        }
    }

    pub fn execution_timeout(mut self, timeout: Duration) -> Self {
        self.execution_timeout = Some(timeout);
        self
    }
}

/// Summary of a recovery pass
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecoveryReport {
    /// Non-terminal instances whose actors were restarted
    pub resumed: Vec<String>,
    /// Terminal instances registered read-only
    pub terminal: Vec<String>,
    /// Instances whose workflow type is not in the catalog
    pub skipped: Vec<String>,
}

enum InstanceMessage {
    ActivityProgress {
        seq: u64,
        update: ActivityUpdate,
    },
    ActivityResolved {
        seq: u64,
        result: InvocationResult,
    },
    TimerFired {
        seq: u64,
    },
    ChildResolved {
        seq: u64,
        child_id: String,
        outcome: Result<Value, WorkflowError>,
    },
    Signal {
        signal_name: String,
        payload: Value,
        ack: oneshot::Sender<EngineResult<()>>,
    },
    Cancel {
        reason: String,
        ack: Option<oneshot::Sender<EngineResult<()>>>,
    },
    ExecutionTimedOut,
    Shutdown,
}

#[derive(Clone)]
struct InstanceHandle {
    tx: mpsc::UnboundedSender<InstanceMessage>,
    snapshot: watch::Receiver<WorkflowSnapshot>,
}

impl InstanceHandle {
    fn status(&self) -> WorkflowStatus {
        self.snapshot.borrow().status
    }
}

struct RuntimeInner {
    catalog: WorkflowCatalog,
    invoker: ActivityInvoker,
    timers: TimerService,
    store: Arc<dyn HistoryStore>,
    publisher: EventPublisher,
    instances: DashMap<String, InstanceHandle>,
    accepting: AtomicBool,
    /// Flipped once by `shutdown`; wakes actors backing off on the store
    stopping: watch::Sender<bool>,
    actors: parking_lot::Mutex<Vec<JoinHandle<()>>>,
}

/// Builder for [`WorkflowRuntime`]
pub struct WorkflowRuntimeBuilder {
    catalog: WorkflowCatalog,
    activities: ActivityRegistry,
    store: Option<Arc<dyn HistoryStore>>,
    max_concurrent_activities: usize,
    event_channel_capacity: usize,
}

impl Default for WorkflowRuntimeBuilder {
    fn default() -> Self {
        Self {
            catalog: WorkflowCatalog::new(),
            activities: ActivityRegistry::new(),
            store: None,
            max_concurrent_activities: defaults::MAX_CONCURRENT_ACTIVITIES,
            event_channel_capacity: defaults::EVENT_CHANNEL_CAPACITY,
        }
    }
}

impl WorkflowRuntimeBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take pool sizes from configuration
    pub fn from_config(config: &WorkflowEngineConfig) -> Self {
        Self {
            max_concurrent_activities: config.worker.max_concurrent_activities,
            event_channel_capacity: config.events.channel_capacity,
            ..Self::default()
        }
    }

    pub fn register_workflow<W: Workflow>(mut self, workflow: W) -> Self {
        self.catalog.register(workflow);
        self
    }

    pub fn register_activity<A: Activity>(mut self, activity: A) -> Self {
        self.activities.register(activity);
        self
    }

    pub fn catalog(mut self, catalog: WorkflowCatalog) -> Self {
        self.catalog = catalog;
        self
    }

    pub fn activities(mut self, activities: ActivityRegistry) -> Self {
        self.activities = activities;
        self
    }

    pub fn history_store(mut self, store: Arc<dyn HistoryStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn max_concurrent_activities(mut self, max: usize) -> Self {
        self.max_concurrent_activities = max;
        self
    }

    pub fn build(self) -> WorkflowRuntime {
        let store = self
            .store
            .unwrap_or_else(|| Arc::new(InMemoryHistoryStore::new()) as Arc<dyn HistoryStore>);
        info!(
            workflow_types = ?self.catalog.workflow_types(),
            activity_types = ?self.activities.activity_types(),
            max_concurrent_activities = self.max_concurrent_activities,
            "🚀 RUNTIME: Workflow runtime built"
        );
        WorkflowRuntime {
            inner: Arc::new(RuntimeInner {
                catalog: self.catalog,
                invoker: ActivityInvoker::new(
                    Arc::new(self.activities),
                    self.max_concurrent_activities,
                ),
                timers: TimerService::new(),
                store,
                publisher: EventPublisher::new(self.event_channel_capacity),
                instances: DashMap::new(),
                accepting: AtomicBool::new(true),
                stopping: watch::channel(false).0,
                actors: parking_lot::Mutex::new(Vec::new()),
            }),
        }
    }
}

/// Process-wide workflow runtime. Cheap to clone.
#[derive(Clone)]
pub struct WorkflowRuntime {
    inner: Arc<RuntimeInner>,
}

impl std::fmt::Debug for WorkflowRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowRuntime")
            .field("catalog", &self.inner.catalog)
            .field("instances", &self.inner.instances.len())
            .field("store", &self.inner.store)
            .finish()
    }
}

impl WorkflowRuntime {
    pub fn builder() -> WorkflowRuntimeBuilder {
        WorkflowRuntimeBuilder::new()
    }

    pub fn catalog(&self) -> &WorkflowCatalog {
        &self.inner.catalog
    }

    /// Start a workflow by type name, returning its instance id
    #[instrument(skip(self, input, options))]
    pub async fn start_workflow(
        &self,
        workflow_type: &str,
        input: Value,
        options: StartWorkflowOptions,
    ) -> EngineResult<String> {
        let workflow_id = options
            .workflow_id
            .unwrap_or_else(|| format!("{workflow_type}-{}", Uuid::new_v4()));
        self.inner
            .create_instance(
                workflow_id.clone(),
                workflow_type,
                input,
                None,
                options.execution_timeout,
            )
            .await?;
        Ok(workflow_id)
    }

    /// Typed form of [`start_workflow`](Self::start_workflow)
    pub async fn start<W: Workflow>(
        &self,
        input: &W::Input,
        options: StartWorkflowOptions,
    ) -> EngineResult<String> {
        let input = serde_json::to_value(input)?;
        self.start_workflow(W::WORKFLOW_TYPE, input, options).await
    }

    /// Deliver a named signal to a running instance
    #[instrument(skip(self, payload))]
    pub async fn signal_workflow(
        &self,
        workflow_id: &str,
        signal_name: &str,
        payload: Value,
    ) -> EngineResult<()> {
        let handle = self.inner.running_handle(workflow_id)?;
        let (ack, ack_rx) = oneshot::channel();
        handle
            .tx
            .send(InstanceMessage::Signal {
                signal_name: signal_name.to_string(),
                payload,
                ack,
            })
            .map_err(|_| self.inner.closed_error(workflow_id, &handle))?;
        ack_rx
            .await
            .map_err(|_| self.inner.closed_error(workflow_id, &handle))?
    }

    /// Cancel a running instance and wait until the cancellation is recorded
    #[instrument(skip(self))]
    pub async fn cancel_workflow(&self, workflow_id: &str, reason: &str) -> EngineResult<()> {
        let handle = self.inner.running_handle(workflow_id)?;
        let (ack, ack_rx) = oneshot::channel();
        handle
            .tx
            .send(InstanceMessage::Cancel {
                reason: reason.to_string(),
                ack: Some(ack),
            })
            .map_err(|_| self.inner.closed_error(workflow_id, &handle))?;
        ack_rx
            .await
            .map_err(|_| self.inner.closed_error(workflow_id, &handle))?
    }

    /// Current snapshot of an instance
    pub fn describe(&self, workflow_id: &str) -> EngineResult<WorkflowSnapshot> {
        let handle = self.inner.handle(workflow_id)?;
        let snapshot = handle.snapshot.borrow().clone();
        Ok(snapshot)
    }

    /// Snapshots of every known instance
    pub fn list_instances(&self) -> Vec<WorkflowSnapshot> {
        let mut snapshots: Vec<WorkflowSnapshot> = self
            .inner
            .instances
            .iter()
            .map(|entry| entry.value().snapshot.borrow().clone())
            .collect();
        snapshots.sort_by(|a, b| a.workflow_id.cmp(&b.workflow_id));
        snapshots
    }

    /// Recorded history of an instance
    pub async fn history(&self, workflow_id: &str) -> EngineResult<Vec<HistoryEvent>> {
        Ok(self.inner.store.read_all(workflow_id).await?)
    }

    /// History of an earlier run of `workflow_id`, archived when the id was
    /// reused. Runs are numbered from 1.
    pub async fn archived_history(&self, workflow_id: &str, run: u32) -> EngineResult<Vec<HistoryEvent>> {
        Ok(self.inner.store.read_archived(workflow_id, run).await?)
    }

    /// Wait until an instance reaches a terminal state
    pub async fn wait_for_completion(&self, workflow_id: &str) -> EngineResult<WorkflowOutcome> {
        let mut snapshot_rx = self.inner.handle(workflow_id)?.snapshot;
        let snapshot = snapshot_rx
            .wait_for(|snapshot| snapshot.status.is_terminal())
            .await
            .map_err(|_| EngineError::ShutDown)?
            .clone();
        snapshot.outcome().ok_or(EngineError::ShutDown)
    }

    /// Lifecycle notifications for every instance
    pub fn subscribe(&self) -> broadcast::Receiver<WorkflowNotification> {
        self.inner.publisher.subscribe()
    }

    /// Rebuild all stored instances and resume the non-terminal ones
    #[instrument(skip(self))]
    pub async fn recover(&self) -> EngineResult<RecoveryReport> {
        let inner = &self.inner;
        let mut report = RecoveryReport::default();
        let mut actors = Vec::new();

        // Phase 1: register every instance before any actor runs
        for workflow_id in inner.store.list_instances().await? {
            if inner.instances.contains_key(&workflow_id) {
                continue;
            }
            let history = inner.store.read_all(&workflow_id).await?;
            let view = HistoryView::new(&history);
            let Some(started) = view.started() else {
                warn!(workflow_id = %workflow_id, "History has no start event, skipping");
                report.skipped.push(workflow_id);
                continue;
            };

            let (snapshot, _) =
                WorkflowSnapshot::fold(&workflow_id, &started.workflow_type, &history);
            let (snapshot_tx, snapshot_rx) = watch::channel(snapshot);
            let (tx, rx) = mpsc::unbounded_channel();

            if view.status().is_terminal() {
                inner.instances.insert(
                    workflow_id.clone(),
                    InstanceHandle {
                        tx,
                        snapshot: snapshot_rx,
                    },
                );
                report.terminal.push(workflow_id);
                continue;
            }

            let Some(definition) = inner.catalog.get(&started.workflow_type) else {
                warn!(
                    workflow_id = %workflow_id,
                    workflow_type = %started.workflow_type,
                    "Workflow type is not registered, instance left untouched"
                );
                report.skipped.push(workflow_id);
                continue;
            };

            inner.instances.insert(
                workflow_id.clone(),
                InstanceHandle {
                    tx: tx.clone(),
                    snapshot: snapshot_rx,
                },
            );
            let actor = InstanceActor::new(
                Arc::clone(inner),
                workflow_id.clone(),
                definition,
                history,
                tx,
                snapshot_tx,
            );
            actors.push((actor, rx));
            report.resumed.push(workflow_id);
        }

        // Phase 2: start actors; each re-dispatches its outstanding work
        for (actor, rx) in actors {
            inner.spawn_actor(actor, rx, StartMode::Recovered);
        }

        info!(
            resumed = report.resumed.len(),
            terminal = report.terminal.len(),
            skipped = report.skipped.len(),
            "♻️ RECOVERY: Instances restored from history"
        );
        Ok(report)
    }

    /// Stop accepting work, stop every actor and wait for them within `grace`.
    ///
    /// In-flight activity attempts are abandoned without recording an outcome;
    /// they are dispatched again by the next `recover`.
    pub async fn shutdown(&self, grace: Duration) {
        let inner = &self.inner;
        inner.accepting.store(false, Ordering::SeqCst);
        inner.stopping.send_replace(true);
        for entry in inner.instances.iter() {
            let _ = entry.value().tx.send(InstanceMessage::Shutdown);
        }

        let actors: Vec<JoinHandle<()>> = std::mem::take(&mut *inner.actors.lock());
        let drained = tokio::time::timeout(grace, futures::future::join_all(actors)).await;
        match drained {
            Ok(_) => info!("🛑 RUNTIME: All instance actors stopped"),
            Err(_) => warn!(
                grace_secs = grace.as_secs(),
                "Instance actors did not stop within the grace period"
            ),
        }
    }
}

impl RuntimeInner {
    fn handle(&self, workflow_id: &str) -> EngineResult<InstanceHandle> {
        self.instances
            .get(workflow_id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| EngineError::InstanceNotFound(workflow_id.to_string()))
    }

    fn running_handle(&self, workflow_id: &str) -> EngineResult<InstanceHandle> {
        let handle = self.handle(workflow_id)?;
        let status = handle.status();
        if status.is_terminal() {
            return Err(EngineError::InstanceTerminal {
                instance_id: workflow_id.to_string(),
                status,
            });
        }
        Ok(handle)
    }

    fn closed_error(&self, workflow_id: &str, handle: &InstanceHandle) -> EngineError {
        let status = handle.status();
        if status.is_terminal() {
            EngineError::InstanceTerminal {
                instance_id: workflow_id.to_string(),
                status,
            }
        } else {
            EngineError::ShutDown
        }
    }

    async fn create_instance(
        self: &Arc<Self>,
        workflow_id: String,
        workflow_type: &str,
        input: Value,
        parent: Option<ParentRef>,
        execution_timeout: Option<Duration>,
    ) -> EngineResult<()> {
        if !self.accepting.load(Ordering::SeqCst) {
            return Err(EngineError::ShutDown);
        }
        let definition = self
            .catalog
            .get(workflow_type)
            .ok_or_else(|| EngineError::UnknownWorkflowType(workflow_type.to_string()))?;
        validate_instance_id(&workflow_id)?;

        let (tx, rx) = mpsc::unbounded_channel();
        let (snapshot_tx, snapshot_rx) =
            watch::channel(WorkflowSnapshot::new(&workflow_id, workflow_type));

        let handle = InstanceHandle {
            tx: tx.clone(),
            snapshot: snapshot_rx,
        };

        // Reserve the id before touching the store; a closed instance gives it up
        let previous = match self.instances.entry(workflow_id.clone()) {
            dashmap::mapref::entry::Entry::Occupied(mut occupied) => {
                if !occupied.get().status().is_terminal() {
                    return Err(EngineError::DuplicateInstance(workflow_id));
                }
                Some(occupied.insert(handle))
            }
            dashmap::mapref::entry::Entry::Vacant(vacant) => {
                vacant.insert(handle);
                None
            }
        };

        let started = HistoryEvent::new(
            1,
            EventKind::WorkflowStarted {
                workflow_type: workflow_type.to_string(),
                input,
                parent: parent.clone(),
                execution_timeout,
            },
        );
        if let Err(e) = self.persist_start(&workflow_id, &started).await {
            match previous {
                Some(previous) => {
                    self.instances.insert(workflow_id.clone(), previous);
                }
                None => {
                    self.instances.remove(&workflow_id);
                }
            }
            return Err(e);
        }

        log_workflow_operation(
            "start",
            &workflow_id,
            Some(workflow_type),
            "scheduled",
            parent.as_ref().map(|p| p.workflow_id.as_str()),
        );

        let actor = InstanceActor::new(
            Arc::clone(self),
            workflow_id.clone(),
            definition,
            vec![started],
            tx,
            snapshot_tx,
        );
        self.spawn_actor(actor, rx, StartMode::Fresh);
        let _ = self
            .publisher
            .publish_started(&workflow_id, workflow_type)
            .await;
        Ok(())
    }

    /// Record the start event, archiving a closed run stored under the same id
    async fn persist_start(&self, workflow_id: &str, started: &HistoryEvent) -> EngineResult<()> {
        let existing = self.store.read_all(workflow_id).await?;
        if !existing.is_empty() {
            if !HistoryView::new(&existing).status().is_terminal() {
                // Stored but not loaded; it belongs to recovery
                return Err(EngineError::DuplicateInstance(workflow_id.to_string()));
            }
            let run = self.store.archive(workflow_id).await?;
            info!(
                workflow_id = %workflow_id,
                run,
                events = existing.len(),
                "Closed run archived, instance id reused"
            );
        }
        self.store.append(workflow_id, started).await?;
        Ok(())
    }

    fn spawn_actor(
        &self,
        actor: InstanceActor,
        rx: mpsc::UnboundedReceiver<InstanceMessage>,
        mode: StartMode,
    ) {
        let task: BoxFuture<'static, ()> = actor.run(rx, mode).boxed();
        let handle = tokio::spawn(task);
        let mut actors = self.actors.lock();
        actors.retain(|actor| !actor.is_finished());
        actors.push(handle);
    }

    /// Ask an instance to cancel without waiting for the acknowledgement
    fn request_cancel(&self, workflow_id: &str, reason: String) {
        if let Some(handle) = self.instances.get(workflow_id) {
            let _ = handle.tx.send(InstanceMessage::Cancel { reason, ack: None });
        }
    }

    fn deliver_child_outcome(&self, parent: &ParentRef, child_id: &str, outcome: Result<Value, WorkflowError>) {
        match self.instances.get(&parent.workflow_id) {
            Some(handle) => {
                let _ = handle.tx.send(InstanceMessage::ChildResolved {
                    seq: parent.seq,
                    child_id: child_id.to_string(),
                    outcome,
                });
            }
            None => debug!(
                parent = %parent.workflow_id,
                child_id = %child_id,
                "Parent not loaded; it collects the outcome when recovered"
            ),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StartMode {
    Fresh,
    Recovered,
}

enum Flow {
    Continue,
    Stop,
}

enum Closing {
    Completed(Value),
    Failed(WorkflowError),
    Canceled(String),
    TimedOut(Duration),
}

/// Owns one workflow instance
struct InstanceActor {
    runtime: Arc<RuntimeInner>,
    workflow_id: String,
    workflow_type: String,
    definition: Arc<dyn ErasedWorkflow>,
    input: Value,
    parent: Option<ParentRef>,
    execution_timeout: Option<Duration>,
    /// History loaded at creation or after a store failure, taken by `begin`
    restored: Vec<HistoryEvent>,
    next_event_id: u64,
    execution: Option<Execution>,
    /// Scheduled activities, timers and attached children without a resolution
    unresolved: BTreeSet<u64>,
    unfired_timers: BTreeSet<u64>,
    machine: WorkflowStateMachine,
    records: InstanceRecords,
    snapshot: WorkflowSnapshot,
    snapshot_tx: watch::Sender<WorkflowSnapshot>,
    tx: mpsc::UnboundedSender<InstanceMessage>,
    activity_tasks: HashMap<u64, JoinHandle<()>>,
    open_children: BTreeMap<u64, String>,
    timeout_task: Option<JoinHandle<()>>,
}

impl InstanceActor {
    fn new(
        runtime: Arc<RuntimeInner>,
        workflow_id: String,
        definition: Arc<dyn ErasedWorkflow>,
        history: Vec<HistoryEvent>,
        tx: mpsc::UnboundedSender<InstanceMessage>,
        snapshot_tx: watch::Sender<WorkflowSnapshot>,
    ) -> Self {
        let workflow_type = definition.workflow_type().to_string();
        let started = HistoryView::new(&history).started();
        let (input, parent, execution_timeout) = match started {
            Some(started) => (started.input, started.parent, started.execution_timeout),
            None => (Value::Null, None, None),
        };
        let machine = WorkflowStateMachine::new(workflow_id.clone());
        let snapshot = WorkflowSnapshot::new(&workflow_id, &workflow_type);

        let mut actor = Self {
            runtime,
            workflow_id,
            workflow_type,
            definition,
            input,
            parent,
            execution_timeout,
            restored: Vec::new(),
            next_event_id: 1,
            execution: None,
            unresolved: BTreeSet::new(),
            unfired_timers: BTreeSet::new(),
            machine,
            records: InstanceRecords::default(),
            snapshot,
            snapshot_tx,
            tx,
            activity_tasks: HashMap::new(),
            open_children: BTreeMap::new(),
            timeout_task: None,
        };
        actor.load(history);
        actor
    }

    /// Take `history` as the instance's state; `begin` rebuilds the function
    fn load(&mut self, history: Vec<HistoryEvent>) {
        let (snapshot, records) =
            WorkflowSnapshot::fold(&self.workflow_id, &self.workflow_type, &history);
        self.snapshot = snapshot;
        self.records = records;
        self.unresolved.clear();
        self.unfired_timers.clear();
        for event in &history {
            self.track(&event.kind);
        }
        self.next_event_id = history.len() as u64 + 1;
        self.execution = None;
        self.open_children.clear();
        self.restored = history;
    }

    fn track(&mut self, kind: &EventKind) {
        match kind {
            EventKind::ChildWorkflowStarted { detached: true, .. }
            | EventKind::SignalWaitStarted { .. } => {}
            EventKind::TimerStarted { seq, .. } => {
                self.unresolved.insert(*seq);
                self.unfired_timers.insert(*seq);
            }
            kind => {
                if let Some(seq) = kind.scheduled_seq() {
                    self.unresolved.insert(seq);
                }
                if let Some(seq) = kind.resolved_seq() {
                    self.unresolved.remove(&seq);
                    self.unfired_timers.remove(&seq);
                }
            }
        }
    }

    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<InstanceMessage>, mode: StartMode) {
        let mut progress = self.begin(mode).await;
        loop {
            match progress {
                Ok(()) => {
                    progress = self.serve(&mut rx).await;
                    if progress.is_ok() {
                        break;
                    }
                }
                Err(EngineError::History(e)) => {
                    self.fail_actor(&e.to_string());
                    if !self.restore_from_store().await {
                        break;
                    }
                    if let Some(outcome) = self.snapshot.outcome() {
                        // The terminal event reached the store before the failure
                        self.machine =
                            WorkflowStateMachine::restore(self.workflow_id.clone(), outcome.status);
                        self.publish_snapshot();
                        self.report_closed(outcome.status, outcome_to_result(outcome))
                            .await;
                        break;
                    }
                    progress = self.begin(StartMode::Recovered).await;
                }
                Err(e) => {
                    self.fail_actor(&e.to_string());
                    break;
                }
            }
        }
        debug!(workflow_id = %self.workflow_id, status = %self.machine.current_state(), "Instance actor stopped");
    }

    /// Handle messages until the instance closes or the runtime stops it
    async fn serve(&mut self, rx: &mut mpsc::UnboundedReceiver<InstanceMessage>) -> EngineResult<()> {
        while !self.machine.current_state().is_terminal() {
            let Some(message) = rx.recv().await else {
                break;
            };
            match self.handle(message).await? {
                Flow::Continue => self.publish_snapshot(),
                Flow::Stop => break,
            }
        }
        Ok(())
    }

    /// The instance cannot go on with its in-memory state; stop its work
    fn fail_actor(&mut self, error: &str) {
        log_error("instance_actor", "advance", error, Some(&self.workflow_id));
        self.stop_outstanding_work();
        self.execution = None;
    }

    /// Reload the instance from the store, backing off while the store keeps
    /// failing. False if the runtime shut down first.
    async fn restore_from_store(&mut self) -> bool {
        let backoff = RetryPolicy::new(
            defaults::INSTANCE_RESTORE_BACKOFF,
            defaults::INSTANCE_RESTORE_MAX_BACKOFF,
            0,
        );
        let mut stopping = self.runtime.stopping.subscribe();
        let mut attempt: u32 = 1;
        loop {
            if *stopping.borrow() {
                return false;
            }
            tokio::select! {
                _ = tokio::time::sleep(backoff.delay_for_attempt(attempt)) => {}
                _ = stopping.changed() => return false,
            }
            match self.runtime.store.read_all(&self.workflow_id).await {
                Ok(history) => {
                    info!(
                        workflow_id = %self.workflow_id,
                        events = history.len(),
                        attempt,
                        "♻️ RESTORE: Instance reloaded from history"
                    );
                    self.load(history);
                    return true;
                }
                Err(e) => {
                    warn!(
                        workflow_id = %self.workflow_id,
                        attempt,
                        error = %e,
                        "History still unreadable, backing off"
                    );
                    attempt = attempt.saturating_add(1);
                }
            }
        }
    }

    async fn begin(&mut self, mode: StartMode) -> EngineResult<()> {
        let history = std::mem::take(&mut self.restored);
        self.execution = Some(Execution::start(
            &self.definition,
            &self.workflow_id,
            &self.input,
            &history,
        ));
        match mode {
            StartMode::Fresh => {
                self.machine.transition(&WorkflowEvent::Start)?;
                self.publish_snapshot();
                self.arm_execution_timeout();
                self.advance().await?;
            }
            StartMode::Recovered => {
                self.machine =
                    WorkflowStateMachine::restore(self.workflow_id.clone(), WorkflowStatus::Running);
                self.publish_snapshot();
                self.restore_outstanding(&history).await?;
            }
        }
        self.publish_snapshot();
        Ok(())
    }

    async fn restore_outstanding(&mut self, history: &[HistoryEvent]) -> EngineResult<()> {
        let view = HistoryView::new(history);
        if view.cancel_requested() {
            // Crashed between the request and the close
            let reason = history
                .iter()
                .rev()
                .find_map(|event| match &event.kind {
                    EventKind::WorkflowCancelRequested { reason } => Some(reason.clone()),
                    _ => None,
                })
                .unwrap_or_default();
            return self.close(Closing::Canceled(reason)).await;
        }
        let outstanding = view.outstanding();

        info!(
            workflow_id = %self.workflow_id,
            activities = outstanding.activities.len(),
            timers = outstanding.timers.len(),
            children = outstanding.children.len(),
            "Restoring outstanding work"
        );

        for activity in outstanding.activities {
            self.dispatch_activity(
                activity.seq,
                ActivityRequest {
                    workflow_id: self.workflow_id.clone(),
                    activity_id: activity.activity_id,
                    activity_type: activity.activity_type,
                    input: activity.input,
                    options: activity.options,
                },
            );
        }
        for timer in outstanding.timers {
            self.arm_timer(timer.seq, TimerService::remaining_until(timer.fire_at));
        }
        self.arm_execution_timeout();

        for child in outstanding.children {
            let existing = self
                .runtime
                .instances
                .get(&child.child_id)
                .map(|handle| handle.snapshot.borrow().clone());
            match existing {
                Some(snapshot) => match snapshot.outcome() {
                    Some(outcome) => {
                        let result = outcome_to_result(outcome);
                        self.record_child_outcome(child.seq, &child.child_id, result)
                            .await?;
                    }
                    None => {
                        self.open_children.insert(child.seq, child.child_id);
                    }
                },
                None => {
                    // Recorded but never created before the crash
                    self.start_child(child.seq, child.child_id, &child.workflow_type, child.input, false)
                        .await?;
                }
            }
        }
        // A turn also issues anything decided after the last recorded command
        self.advance().await
    }

    async fn handle(&mut self, message: InstanceMessage) -> EngineResult<Flow> {
        match message {
            InstanceMessage::ActivityProgress { seq, update } => {
                if !self.is_resolved(seq) {
                    self.records.apply_update(seq, &update);
                }
            }
            InstanceMessage::ActivityResolved { seq, result } => {
                self.activity_tasks.remove(&seq);
                if self.is_resolved(seq) {
                    debug!(workflow_id = %self.workflow_id, seq, "Duplicate activity resolution ignored");
                    return Ok(Flow::Continue);
                }
                let kind = match result {
                    Ok(completion) => EventKind::ActivityCompleted {
                        seq,
                        result: completion.result,
                        attempts: completion.attempts,
                    },
                    Err(failure) => {
                        let (activity_id, activity_type) = self
                            .records
                            .activity(seq)
                            .map(|a| (a.activity_id.clone(), a.activity_type.clone()))
                            .unwrap_or_else(|| (format!("activity#{seq}"), String::new()));
                        EventKind::ActivityFailed {
                            seq,
                            error: failure.last_error.into_workflow_error(
                                activity_id,
                                &activity_type,
                                failure.attempts,
                            ),
                            attempts: failure.attempts,
                        }
                    }
                };
                self.record(kind).await?;
                self.advance().await?;
            }
            InstanceMessage::TimerFired { seq } => {
                if !self.is_resolved(seq) {
                    self.record(EventKind::TimerFired { seq }).await?;
                    self.advance().await?;
                }
            }
            InstanceMessage::ChildResolved {
                seq,
                child_id,
                outcome,
            } => {
                if self.open_children.get(&seq) != Some(&child_id) {
                    debug!(
                        workflow_id = %self.workflow_id,
                        seq,
                        child_id = %child_id,
                        "Outcome of a child this instance is not waiting on ignored"
                    );
                    return Ok(Flow::Continue);
                }
                self.open_children.remove(&seq);
                if !self.is_resolved(seq) {
                    self.record_child_outcome(seq, &child_id, outcome).await?;
                    self.advance().await?;
                }
            }
            InstanceMessage::Signal {
                signal_name,
                payload,
                ack,
            } => {
                let recorded = self
                    .record(EventKind::SignalReceived {
                        signal_name,
                        payload,
                    })
                    .await;
                match recorded {
                    Ok(()) => {
                        let _ = ack.send(Ok(()));
                        self.advance().await?;
                    }
                    Err(e) => {
                        let _ = ack.send(Err(self.not_recorded(&e)));
                        return Err(e);
                    }
                }
            }
            InstanceMessage::Cancel { reason, ack } => {
                let canceled = self.cancel(reason).await;
                if let Some(ack) = ack {
                    let _ = ack.send(match &canceled {
                        Ok(()) => Ok(()),
                        Err(e) => Err(self.not_recorded(e)),
                    });
                }
                canceled?;
            }
            InstanceMessage::ExecutionTimedOut => {
                if let Some(timeout) = self.execution_timeout {
                    self.close(Closing::TimedOut(timeout)).await?;
                }
            }
            InstanceMessage::Shutdown => {
                self.stop_outstanding_work();
                return Ok(Flow::Stop);
            }
        }
        Ok(Flow::Continue)
    }

    fn not_recorded(&self, error: &EngineError) -> EngineError {
        EngineError::NotRecorded {
            instance_id: self.workflow_id.clone(),
            reason: error.to_string(),
        }
    }

    fn is_resolved(&self, seq: u64) -> bool {
        !self.unresolved.contains(&seq)
    }

    async fn cancel(&mut self, reason: String) -> EngineResult<()> {
        self.record(EventKind::WorkflowCancelRequested {
            reason: reason.clone(),
        })
        .await?;
        self.close(Closing::Canceled(reason)).await
    }

    async fn record(&mut self, kind: EventKind) -> EngineResult<()> {
        let event = HistoryEvent::new(self.next_event_id, kind);
        self.persist(&event).await?;
        debug!(
            workflow_id = %self.workflow_id,
            event_id = event.event_id,
            event_type = event.kind.event_type(),
            "Event recorded"
        );
        self.next_event_id += 1;
        self.track(&event.kind);
        self.records.apply(&event);
        self.snapshot.apply_lifecycle(&event);
        if let Some(execution) = self.execution.as_mut() {
            execution.observe(&event);
        }
        Ok(())
    }

    /// Append one event, retrying briefly before giving up on the store
    async fn persist(&mut self, event: &HistoryEvent) -> EngineResult<()> {
        let mut attempt: u32 = 1;
        loop {
            match self.runtime.store.append(&self.workflow_id, event).await {
                Ok(()) => return Ok(()),
                Err(e) if attempt < defaults::HISTORY_APPEND_ATTEMPTS => {
                    warn!(
                        workflow_id = %self.workflow_id,
                        event_id = event.event_id,
                        attempt,
                        error = %e,
                        "History append failed, retrying"
                    );
                    tokio::time::sleep(defaults::HISTORY_APPEND_BACKOFF * attempt).await;
                    attempt += 1;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    async fn record_child_outcome(
        &mut self,
        seq: u64,
        child_id: &str,
        outcome: Result<Value, WorkflowError>,
    ) -> EngineResult<()> {
        let kind = match outcome {
            Ok(result) => EventKind::ChildWorkflowCompleted {
                seq,
                child_id: child_id.to_string(),
                result,
            },
            Err(error) => EventKind::ChildWorkflowFailed {
                seq,
                child_id: child_id.to_string(),
                error,
            },
        };
        self.record(kind).await
    }

    /// Take turns while recorded events keep waking the function
    async fn advance(&mut self) -> EngineResult<()> {
        loop {
            let outcome = match self.execution.as_mut() {
                Some(execution) if execution.is_woken() => execution.turn(),
                _ => return Ok(()),
            };
            match outcome {
                TurnOutcome::Completed(result) => {
                    return self.close(Closing::Completed(result)).await;
                }
                TurnOutcome::Failed(error) => {
                    return self.close(Closing::Failed(error)).await;
                }
                TurnOutcome::Suspended { commands, .. } => {
                    for command in commands {
                        self.execute_command(command).await?;
                    }
                }
            }
        }
    }

    /// Record and start one command
    async fn execute_command(&mut self, command: Command) -> EngineResult<()> {
        match command {
            Command::ScheduleActivity {
                seq,
                activity_id,
                activity_type,
                input,
                options,
            } => {
                self.record(EventKind::ActivityScheduled {
                    seq,
                    activity_id: activity_id.clone(),
                    activity_type: activity_type.clone(),
                    input: input.clone(),
                    options: options.clone(),
                })
                .await?;
                self.dispatch_activity(
                    seq,
                    ActivityRequest {
                        workflow_id: self.workflow_id.clone(),
                        activity_id,
                        activity_type,
                        input,
                        options,
                    },
                );
                Ok(())
            }
            Command::StartTimer { seq, fire_after } => {
                let fire_at = Utc::now()
                    + chrono::Duration::from_std(fire_after).unwrap_or(chrono::Duration::MAX);
                self.record(EventKind::TimerStarted {
                    seq,
                    fire_after,
                    fire_at,
                })
                .await?;
                self.arm_timer(seq, fire_after);
                Ok(())
            }
            Command::StartChildWorkflow {
                seq,
                child_id,
                workflow_type,
                input,
                detached,
            } => {
                self.record(EventKind::ChildWorkflowStarted {
                    seq,
                    child_id: child_id.clone(),
                    workflow_type: workflow_type.clone(),
                    input: input.clone(),
                    detached,
                })
                .await?;
                self.start_child(seq, child_id, &workflow_type, input, detached)
                    .await
            }
            // A signal that arrived before the wait resolves it as the wait is recorded
            Command::WaitForSignal { seq, signal_name } => {
                self.record(EventKind::SignalWaitStarted { seq, signal_name })
                    .await
            }
        }
    }

    /// Create the child instance; a failed start is recorded as the child's outcome
    async fn start_child(
        &mut self,
        seq: u64,
        child_id: String,
        workflow_type: &str,
        input: Value,
        detached: bool,
    ) -> EngineResult<()> {
        let parent = ParentRef {
            workflow_id: self.workflow_id.clone(),
            seq,
            detached,
        };
        let started = self
            .runtime
            .create_instance(child_id.clone(), workflow_type, input, Some(parent), None)
            .await;

        match started {
            Ok(()) => {
                if !detached {
                    self.open_children.insert(seq, child_id);
                }
                Ok(())
            }
            Err(e) if detached => {
                warn!(
                    workflow_id = %self.workflow_id,
                    child_id = %child_id,
                    error = %e,
                    "Detached child could not be started"
                );
                Ok(())
            }
            Err(e) => {
                let error = WorkflowError::ChildWorkflowStartFailed {
                    child_id: child_id.clone(),
                    workflow_type: workflow_type.to_string(),
                    reason: e.to_string(),
                };
                self.record_child_outcome(seq, &child_id, Err(error)).await
            }
        }
    }

    fn dispatch_activity(&mut self, seq: u64, request: ActivityRequest) {
        let invoker = self.runtime.invoker.clone();
        let resolved_tx = self.tx.clone();
        let progress_tx = self.tx.clone();

        let task = tokio::spawn(async move {
            let result = invoker
                .invoke(request, move |update| {
                    let _ = progress_tx.send(InstanceMessage::ActivityProgress { seq, update });
                })
                .await;
            let _ = resolved_tx.send(InstanceMessage::ActivityResolved { seq, result });
        });
        self.activity_tasks.insert(seq, task);
    }

    fn arm_timer(&self, seq: u64, fire_after: Duration) {
        let tx = self.tx.clone();
        self.runtime
            .timers
            .start(&self.workflow_id, seq, fire_after, async move {
                let _ = tx.send(InstanceMessage::TimerFired { seq });
            });
    }

    fn arm_execution_timeout(&mut self) {
        let Some(timeout) = self.execution_timeout else {
            return;
        };
        let elapsed = self
            .snapshot
            .started_at
            .and_then(|started_at| (Utc::now() - started_at).to_std().ok())
            .unwrap_or(Duration::ZERO);
        let remaining = timeout.saturating_sub(elapsed);
        let tx = self.tx.clone();
        self.timeout_task = Some(tokio::spawn(async move {
            tokio::time::sleep(remaining).await;
            let _ = tx.send(InstanceMessage::ExecutionTimedOut);
        }));
    }

    fn stop_outstanding_work(&mut self) {
        for (_, task) in self.activity_tasks.drain() {
            task.abort();
        }
        if let Some(task) = self.timeout_task.take() {
            task.abort();
        }
        self.runtime.timers.cancel_all(&self.workflow_id);
    }

    /// Close the instance: stop its work, cancel attached children, record the
    /// terminal event and report to the parent
    async fn close(&mut self, closing: Closing) -> EngineResult<()> {
        self.stop_outstanding_work();
        self.execution = None;
        let unfired: Vec<u64> = self.unfired_timers.iter().copied().collect();
        for seq in unfired {
            self.record(EventKind::TimerCanceled { seq }).await?;
        }
        for (_, child_id) in std::mem::take(&mut self.open_children) {
            self.runtime
                .request_cancel(&child_id, format!("parent {} closed", self.workflow_id));
        }

        let (event, kind, child_outcome) = match closing {
            Closing::Completed(result) => (
                WorkflowEvent::Complete,
                EventKind::WorkflowCompleted {
                    result: result.clone(),
                },
                Ok(result),
            ),
            Closing::Failed(error) => (
                WorkflowEvent::Fail(error.to_string()),
                EventKind::WorkflowFailed {
                    error: error.clone(),
                },
                Err(error),
            ),
            Closing::Canceled(reason) => (
                WorkflowEvent::Cancel,
                EventKind::WorkflowCanceled {
                    reason: reason.clone(),
                },
                Err(WorkflowError::Canceled { reason }),
            ),
            Closing::TimedOut(timeout) => (
                WorkflowEvent::TimeOut,
                EventKind::WorkflowTimedOut { timeout },
                Err(WorkflowError::TimedOut {
                    timeout_secs: timeout.as_secs(),
                }),
            ),
        };

        let status = self.machine.transition(&event)?;
        self.record(kind).await?;
        self.publish_snapshot();
        self.report_closed(status, child_outcome).await;
        Ok(())
    }

    /// Log, notify subscribers and hand the outcome to an attached parent
    async fn report_closed(&mut self, status: WorkflowStatus, child_outcome: Result<Value, WorkflowError>) {
        let error = child_outcome.as_ref().err().cloned();
        log_workflow_operation(
            "close",
            &self.workflow_id,
            Some(&self.workflow_type),
            &status.to_string(),
            error.as_ref().map(ToString::to_string).as_deref(),
        );
        let _ = self
            .runtime
            .publisher
            .publish_closed(&self.workflow_id, &self.workflow_type, status, error)
            .await;

        if let Some(parent) = &self.parent {
            if !parent.detached {
                self.runtime
                    .deliver_child_outcome(parent, &self.workflow_id, child_outcome);
            }
        }
    }

    fn publish_snapshot(&mut self) {
        self.records.fill(&mut self.snapshot);
        self.snapshot.status = self.machine.current_state();
        self.snapshot_tx.send_replace(self.snapshot.clone());
    }
}

fn outcome_to_result(outcome: WorkflowOutcome) -> Result<Value, WorkflowError> {
    match (outcome.status, outcome.error) {
        (WorkflowStatus::Completed, _) => Ok(outcome.result.unwrap_or(Value::Null)),
        (_, Some(error)) => Err(error),
        (status, None) => Err(WorkflowError::application(format!(
            "child closed as {status} without an error"
        ))),
    }
}
