//! Runtime behavior with small purpose-built workflows: cancellation, signals,
//! execution timeouts, child close policy, retries and restart recovery.

mod common;

use async_trait::async_trait;
use common::{wait_for_snapshot, FlakyStore};
use serde_json::json;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use storage_workflows::history::HistoryStore;
use storage_workflows::{
    Activity, ActivityContext, ActivityError, ActivityOptions, ActivityStatus, EngineError,
    EventKind, FailureKind, FileHistoryStore, InMemoryHistoryStore, NotificationKind,
    RetryPolicy, StartWorkflowOptions, Workflow, WorkflowContext, WorkflowError, WorkflowResult,
    WorkflowRuntime, WorkflowStatus,
};

// --- activities ---

#[derive(Debug, Clone, Default)]
struct Greet {
    calls: Arc<AtomicU32>,
}

#[async_trait]
impl Activity for Greet {
    const ACTIVITY_TYPE: &'static str = "greet";
    type Input = String;
    type Output = String;

    async fn execute(&self, _ctx: ActivityContext, name: String) -> Result<String, ActivityError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(format!("hello {name}"))
    }
}

#[derive(Debug, Clone, Default)]
struct Unavailable {
    attempts: Arc<AtomicU32>,
}

#[async_trait]
impl Activity for Unavailable {
    const ACTIVITY_TYPE: &'static str = "unavailable";
    type Input = ();
    type Output = ();

    async fn execute(&self, ctx: ActivityContext, _input: ()) -> Result<(), ActivityError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        Err(ActivityError::retryable(format!(
            "backend unavailable on attempt {}",
            ctx.attempt
        )))
    }
}

// --- workflows ---

#[derive(Debug, Default)]
struct Sleepy;

#[async_trait]
impl Workflow for Sleepy {
    const WORKFLOW_TYPE: &'static str = "Sleepy";
    type Input = u64;
    type Output = String;

    async fn run(&self, ctx: WorkflowContext, seconds: u64) -> WorkflowResult<String> {
        ctx.sleep(Duration::from_secs(seconds)).await;
        Ok("woke".to_string())
    }
}

/// Greets, sleeps a minute, greets again
#[derive(Debug, Default)]
struct TwoGreetings;

#[async_trait]
impl Workflow for TwoGreetings {
    const WORKFLOW_TYPE: &'static str = "TwoGreetings";
    type Input = String;
    type Output = Vec<String>;

    async fn run(&self, ctx: WorkflowContext, name: String) -> WorkflowResult<Vec<String>> {
        let first = ctx
            .execute_activity::<Greet>(&name, ActivityOptions::default())
            .await?;
        ctx.sleep(Duration::from_secs(60)).await;
        let second = ctx
            .execute_activity::<Greet>(&format!("again {name}"), ActivityOptions::default())
            .await?;
        Ok(vec![first, second])
    }
}

/// Optionally sleeps, then returns the payload of the "approve" signal
#[derive(Debug, Default)]
struct Approval;

#[async_trait]
impl Workflow for Approval {
    const WORKFLOW_TYPE: &'static str = "Approval";
    type Input = u64;
    type Output = String;

    async fn run(&self, ctx: WorkflowContext, delay_secs: u64) -> WorkflowResult<String> {
        if delay_secs > 0 {
            ctx.sleep(Duration::from_secs(delay_secs)).await;
        }
        ctx.wait_for_signal::<String>("approve").await
    }
}

#[derive(Debug, Default)]
struct Retrying;

#[async_trait]
impl Workflow for Retrying {
    const WORKFLOW_TYPE: &'static str = "Retrying";
    type Input = ();
    type Output = ();

    async fn run(&self, ctx: WorkflowContext, _input: ()) -> WorkflowResult<()> {
        ctx.execute_activity::<Unavailable>(
            &(),
            ActivityOptions::new(Duration::from_secs(5)).with_retry_policy(RetryPolicy::new(
                Duration::from_secs(1),
                Duration::from_secs(10),
                3,
            )),
        )
        .await
    }
}

/// Starts a detached short sleeper, then waits on an attached long sleeper
#[derive(Debug, Default)]
struct Guardian;

#[async_trait]
impl Workflow for Guardian {
    const WORKFLOW_TYPE: &'static str = "Guardian";
    type Input = ();
    type Output = String;

    async fn run(&self, ctx: WorkflowContext, _input: ()) -> WorkflowResult<String> {
        ctx.start_detached_child::<Sleepy>("detached-sleeper", &10)?;
        ctx.start_child::<Sleepy>("attached-sleeper", &3600)
            .result()
            .await
    }
}

#[derive(Debug, Default)]
struct FailingParent;

#[async_trait]
impl Workflow for FailingParent {
    const WORKFLOW_TYPE: &'static str = "FailingParent";
    type Input = ();
    type Output = ();

    async fn run(&self, ctx: WorkflowContext, _input: ()) -> WorkflowResult<()> {
        ctx.start_child::<Retrying>("retrying-child", &()).result().await
    }
}

struct Counters {
    greetings: Arc<AtomicU32>,
    attempts: Arc<AtomicU32>,
}

fn runtime_with_store(store: Option<Arc<dyn HistoryStore>>) -> (WorkflowRuntime, Counters) {
    let counters = Counters {
        greetings: Arc::new(AtomicU32::new(0)),
        attempts: Arc::new(AtomicU32::new(0)),
    };
    let mut builder = WorkflowRuntime::builder()
        .register_workflow(Sleepy)
        .register_workflow(TwoGreetings)
        .register_workflow(Approval)
        .register_workflow(Retrying)
        .register_workflow(Guardian)
        .register_workflow(FailingParent)
        .register_activity(Greet {
            calls: Arc::clone(&counters.greetings),
        })
        .register_activity(Unavailable {
            attempts: Arc::clone(&counters.attempts),
        });
    if let Some(store) = store {
        builder = builder.history_store(store);
    }
    (builder.build(), counters)
}

fn runtime() -> (WorkflowRuntime, Counters) {
    runtime_with_store(None)
}

fn event_types(history: &[storage_workflows::HistoryEvent]) -> Vec<&'static str> {
    history.iter().map(|event| event.kind.event_type()).collect()
}

// --- dispatcher ---

#[tokio::test(start_paused = true)]
async fn test_start_rejects_unknown_type_and_duplicate_id() {
    let (runtime, _) = runtime();

    let err = runtime
        .start_workflow("Unknown", json!(null), StartWorkflowOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::UnknownWorkflowType(ref t) if t == "Unknown"));

    runtime
        .start::<Sleepy>(&60, StartWorkflowOptions::with_id("sleeper"))
        .await
        .unwrap();
    let err = runtime
        .start::<Sleepy>(&60, StartWorkflowOptions::with_id("sleeper"))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::DuplicateInstance(ref id) if id == "sleeper"));

    runtime.wait_for_completion("sleeper").await.unwrap();

    assert!(matches!(
        runtime.describe("missing"),
        Err(EngineError::InstanceNotFound(_))
    ));
}

#[tokio::test(start_paused = true)]
async fn test_closed_id_can_be_started_again() {
    let (runtime, _) = runtime();
    runtime
        .start::<Sleepy>(&60, StartWorkflowOptions::with_id("sleeper"))
        .await
        .unwrap();
    let first = runtime.wait_for_completion("sleeper").await.unwrap();
    assert_eq!(first.status, WorkflowStatus::Completed);

    runtime
        .start::<Sleepy>(&5, StartWorkflowOptions::with_id("sleeper"))
        .await
        .unwrap();
    let snapshot = runtime.describe("sleeper").unwrap();
    assert_eq!(snapshot.status, WorkflowStatus::Running);

    let second = runtime.wait_for_completion("sleeper").await.unwrap();
    assert_eq!(second.status, WorkflowStatus::Completed);

    // The closed run moved aside; the live history starts over
    let archived = runtime.archived_history("sleeper", 1).await.unwrap();
    assert_eq!(
        event_types(&archived),
        vec!["workflow_started", "timer_started", "timer_fired", "workflow_completed"]
    );
    let current = runtime.history("sleeper").await.unwrap();
    assert_eq!(current.first().map(|event| event.event_id), Some(1));
    assert_eq!(current.len(), 4);
    assert!(runtime.archived_history("sleeper", 2).await.unwrap().is_empty());

    // An open id is still a duplicate
    runtime
        .start::<Sleepy>(&60, StartWorkflowOptions::with_id("sleeper"))
        .await
        .unwrap();
    let err = runtime
        .start::<Sleepy>(&60, StartWorkflowOptions::with_id("sleeper"))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::DuplicateInstance(_)));

    assert!(matches!(
        runtime.describe("missing"),
        Err(EngineError::InstanceNotFound(_))
    ));
}

#[tokio::test(start_paused = true)]
async fn test_bad_input_fails_the_instance() {
    let (runtime, _) = runtime();
    let id = runtime
        .start_workflow("Sleepy", json!("not a number"), StartWorkflowOptions::default())
        .await
        .unwrap();

    let outcome = runtime.wait_for_completion(&id).await.unwrap();
    assert_eq!(outcome.status, WorkflowStatus::Failed);
    assert!(matches!(outcome.error, Some(WorkflowError::Payload { .. })));
}

#[tokio::test(start_paused = true)]
async fn test_lifecycle_notifications() {
    let (runtime, _) = runtime();
    let mut notifications = runtime.subscribe();

    let id = runtime
        .start::<Sleepy>(&5, StartWorkflowOptions::default())
        .await
        .unwrap();

    let started = notifications.recv().await.unwrap();
    assert_eq!(started.workflow_id, id);
    assert_eq!(started.workflow_type, "Sleepy");
    assert_eq!(started.kind, NotificationKind::Started);

    let closed = notifications.recv().await.unwrap();
    assert_eq!(closed.workflow_id, id);
    assert_eq!(closed.terminal_status(), Some(WorkflowStatus::Completed));
}

// --- cancellation and timeouts ---

#[tokio::test(start_paused = true)]
async fn test_cancel_closes_instance_and_cancels_timer() {
    let (runtime, _) = runtime();
    let id = runtime
        .start::<Sleepy>(&3600, StartWorkflowOptions::with_id("long-sleep"))
        .await
        .unwrap();
    wait_for_snapshot(&runtime, &id, |s| s.timers.len() == 1).await;

    runtime.cancel_workflow(&id, "operator request").await.unwrap();

    let outcome = runtime.wait_for_completion(&id).await.unwrap();
    assert_eq!(outcome.status, WorkflowStatus::Canceled);
    assert_eq!(
        outcome.error,
        Some(WorkflowError::Canceled {
            reason: "operator request".to_string()
        })
    );

    let history = runtime.history(&id).await.unwrap();
    assert_eq!(
        event_types(&history),
        vec![
            "workflow_started",
            "timer_started",
            "workflow_cancel_requested",
            "timer_canceled",
            "workflow_canceled"
        ]
    );

    let err = runtime.cancel_workflow(&id, "again").await.unwrap_err();
    assert!(matches!(
        err,
        EngineError::InstanceTerminal {
            status: WorkflowStatus::Canceled,
            ..
        }
    ));
}

#[tokio::test(start_paused = true)]
async fn test_execution_timeout() {
    let (runtime, _) = runtime();
    let id = runtime
        .start::<Sleepy>(
            &3600,
            StartWorkflowOptions::with_id("bounded").execution_timeout(Duration::from_secs(5)),
        )
        .await
        .unwrap();

    let started = tokio::time::Instant::now();
    let outcome = runtime.wait_for_completion(&id).await.unwrap();
    assert!(started.elapsed() < Duration::from_secs(3600));
    assert_eq!(outcome.status, WorkflowStatus::TimedOut);
    let error = outcome.error.unwrap();
    assert_eq!(error.kind(), FailureKind::WorkflowTimedOut);
    assert_eq!(error, WorkflowError::TimedOut { timeout_secs: 5 });

    let history = runtime.history(&id).await.unwrap();
    assert!(matches!(
        history.last().map(|e| &e.kind),
        Some(EventKind::WorkflowTimedOut { .. })
    ));
}

// --- signals ---

#[tokio::test(start_paused = true)]
async fn test_signal_after_wait_resumes_instance() {
    let (runtime, _) = runtime();
    let id = runtime
        .start::<Approval>(&0, StartWorkflowOptions::with_id("approval"))
        .await
        .unwrap();
    wait_for_snapshot(&runtime, &id, |s| s.history_length == 2).await;

    runtime
        .signal_workflow(&id, "approve", json!("ship it"))
        .await
        .unwrap();

    let outcome = runtime.wait_for_completion(&id).await.unwrap();
    assert_eq!(outcome.result_as::<String>().as_deref(), Some("ship it"));

    let err = runtime
        .signal_workflow(&id, "approve", json!("late"))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::InstanceTerminal { .. }));
}

#[tokio::test(start_paused = true)]
async fn test_signal_before_wait_is_buffered() {
    let (runtime, _) = runtime();
    let id = runtime
        .start::<Approval>(&30, StartWorkflowOptions::with_id("buffered"))
        .await
        .unwrap();
    wait_for_snapshot(&runtime, &id, |s| s.timers.len() == 1).await;

    // Arrives while the instance is still sleeping
    runtime
        .signal_workflow(&id, "approve", json!("early"))
        .await
        .unwrap();

    let outcome = runtime.wait_for_completion(&id).await.unwrap();
    assert_eq!(outcome.status, WorkflowStatus::Completed);
    assert_eq!(outcome.result_as::<String>().as_deref(), Some("early"));

    let history = runtime.history(&id).await.unwrap();
    assert_eq!(
        event_types(&history),
        vec![
            "workflow_started",
            "timer_started",
            "signal_received",
            "timer_fired",
            "signal_wait_started",
            "workflow_completed"
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn test_signal_unknown_instance() {
    let (runtime, _) = runtime();
    let err = runtime
        .signal_workflow("nobody", "approve", json!(null))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::InstanceNotFound(_)));
}

// --- retries ---

#[tokio::test(start_paused = true)]
async fn test_retries_exhausted() {
    let (runtime, counters) = runtime();
    let started = tokio::time::Instant::now();
    let id = runtime
        .start::<Retrying>(&(), StartWorkflowOptions::default())
        .await
        .unwrap();

    let outcome = runtime.wait_for_completion(&id).await.unwrap();
    assert_eq!(outcome.status, WorkflowStatus::Failed);
    assert_eq!(counters.attempts.load(Ordering::SeqCst), 3);
    // Backoff of 1s then 2s between the three attempts
    assert!(started.elapsed() >= Duration::from_secs(3));

    match outcome.error.unwrap() {
        WorkflowError::ActivityFailed {
            step_id,
            activity_type,
            attempts,
            message,
            timed_out,
        } => {
            assert_eq!(step_id, "unavailable#0");
            assert_eq!(activity_type, "unavailable");
            assert_eq!(attempts, 3);
            assert_eq!(message, "backend unavailable on attempt 3");
            assert!(!timed_out);
        }
        other => panic!("expected an activity failure, got {other:?}"),
    }

    let activity = &runtime.describe(&id).unwrap().activities[0];
    assert_eq!(activity.attempt, 3);
    assert_eq!(activity.status, ActivityStatus::Failed);
}

// --- child workflows ---

#[tokio::test(start_paused = true)]
async fn test_child_failure_carries_chain() {
    let (runtime, _) = runtime();
    let id = runtime
        .start::<FailingParent>(&(), StartWorkflowOptions::with_id("failing-parent"))
        .await
        .unwrap();

    let outcome = runtime.wait_for_completion(&id).await.unwrap();
    assert_eq!(outcome.status, WorkflowStatus::Failed);
    let error = outcome.error.unwrap();
    assert_eq!(error.kind(), FailureKind::ChildWorkflowFailure);
    assert_eq!(error.step_id(), Some("unavailable#0"));
    assert_eq!(outcome.failure_chain.len(), 2);
    assert!(outcome.failure_chain[0].contains("retrying-child"));
    assert!(outcome.failure_chain[1].contains("after 3 attempt(s)"));

    let child = runtime.describe("retrying-child").unwrap();
    assert_eq!(child.parent.as_deref(), Some("failing-parent"));
    assert_eq!(child.status, WorkflowStatus::Failed);
}

#[tokio::test(start_paused = true)]
async fn test_parent_cancel_cancels_attached_child_only() {
    let (runtime, _) = runtime();
    let id = runtime
        .start::<Guardian>(&(), StartWorkflowOptions::with_id("guardian"))
        .await
        .unwrap();
    wait_for_snapshot(&runtime, &id, |s| s.children.len() == 2).await;
    wait_for_snapshot(&runtime, "attached-sleeper", |s| s.timers.len() == 1).await;

    runtime.cancel_workflow(&id, "no longer needed").await.unwrap();

    let child = runtime.wait_for_completion("attached-sleeper").await.unwrap();
    assert_eq!(child.status, WorkflowStatus::Canceled);
    assert_eq!(
        child.error,
        Some(WorkflowError::Canceled {
            reason: "parent guardian closed".to_string()
        })
    );

    let detached = runtime.wait_for_completion("detached-sleeper").await.unwrap();
    assert_eq!(detached.status, WorkflowStatus::Completed);
    assert_eq!(detached.result_as::<String>().as_deref(), Some("woke"));

    let children = runtime.describe(&id).unwrap().children;
    assert!(children.iter().any(|c| c.child_id == "detached-sleeper" && c.detached));
}

// --- history store failures ---

const TWO_GREETINGS_HISTORY: [&str; 8] = [
    "workflow_started",
    "activity_scheduled",
    "activity_completed",
    "timer_started",
    "timer_fired",
    "activity_scheduled",
    "activity_completed",
    "workflow_completed",
];

async fn run_two_greetings_against(store: &Arc<FlakyStore>) -> Counters {
    let (runtime, counters) = runtime_with_store(Some(Arc::clone(store) as Arc<dyn HistoryStore>));
    let id = runtime
        .start::<TwoGreetings>(&"ada".to_string(), StartWorkflowOptions::with_id("greetings"))
        .await
        .unwrap();

    let outcome = runtime.wait_for_completion(&id).await.unwrap();
    assert_eq!(outcome.status, WorkflowStatus::Completed);
    assert_eq!(
        outcome.result_as::<Vec<String>>().unwrap(),
        vec!["hello ada".to_string(), "hello again ada".to_string()]
    );

    let history = runtime.history(&id).await.unwrap();
    assert_eq!(event_types(&history), TWO_GREETINGS_HISTORY.to_vec());
    let ids: Vec<u64> = history.iter().map(|event| event.event_id).collect();
    assert_eq!(ids, (1..=8).collect::<Vec<u64>>());
    assert_eq!(runtime.describe(&id).unwrap().status, WorkflowStatus::Completed);
    counters
}

#[tokio::test(start_paused = true)]
async fn test_failed_append_is_retried_in_place() {
    // The timer_started append fails once
    let store = Arc::new(FlakyStore::failing(4, 1));
    let counters = run_two_greetings_against(&store).await;
    assert_eq!(store.failed_appends(), 1);
    assert_eq!(counters.greetings.load(Ordering::SeqCst), 2);
}

#[tokio::test(start_paused = true)]
async fn test_instance_reloads_after_append_retries_run_out() {
    let store = Arc::new(FlakyStore::failing(4, 5));
    let counters = run_two_greetings_against(&store).await;
    assert_eq!(store.failed_appends(), 5);
    // The first greeting was recorded before the failure and is replayed
    assert_eq!(counters.greetings.load(Ordering::SeqCst), 2);
}

#[tokio::test(start_paused = true)]
async fn test_signal_is_answered_while_the_store_recovers() {
    // The signal_received append fails past the in-place retries
    let store = Arc::new(FlakyStore::failing(3, 5));
    let (runtime, _) = runtime_with_store(Some(Arc::clone(&store) as Arc<dyn HistoryStore>));
    let id = runtime
        .start::<Approval>(&0, StartWorkflowOptions::with_id("approval"))
        .await
        .unwrap();
    wait_for_snapshot(&runtime, &id, |s| s.status == WorkflowStatus::Running).await;

    let err = runtime
        .signal_workflow(&id, "approve", json!("first"))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::NotRecorded { .. }));

    // The reloaded instance takes the next signal
    let snapshot = wait_for_snapshot(&runtime, &id, |s| s.status == WorkflowStatus::Running).await;
    assert_eq!(snapshot.status, WorkflowStatus::Running);
    tokio::time::sleep(Duration::from_secs(5)).await;
    runtime
        .signal_workflow(&id, "approve", json!("second"))
        .await
        .unwrap();
    let outcome = runtime.wait_for_completion(&id).await.unwrap();
    assert_eq!(outcome.result_as::<String>().as_deref(), Some("second"));
}

// --- recovery ---

async fn assert_recovers_without_reinvoking(store: Arc<dyn HistoryStore>) {
    let (first, first_counters) = runtime_with_store(Some(Arc::clone(&store)));
    let id = first
        .start::<TwoGreetings>(&"ada".to_string(), StartWorkflowOptions::with_id("greetings"))
        .await
        .unwrap();
    wait_for_snapshot(&first, &id, |s| s.timers.len() == 1).await;
    first.shutdown(Duration::from_secs(1)).await;
    assert_eq!(first_counters.greetings.load(Ordering::SeqCst), 1);

    let (second, second_counters) = runtime_with_store(Some(Arc::clone(&store)));
    let report = second.recover().await.unwrap();
    assert_eq!(report.resumed, vec!["greetings".to_string()]);
    assert!(report.skipped.is_empty());

    let outcome = second.wait_for_completion(&id).await.unwrap();
    assert_eq!(outcome.status, WorkflowStatus::Completed);
    assert_eq!(
        outcome.result_as::<Vec<String>>().unwrap(),
        vec!["hello ada".to_string(), "hello again ada".to_string()]
    );
    // The recorded first greeting is replayed, not re-executed
    assert_eq!(second_counters.greetings.load(Ordering::SeqCst), 1);

    let history = second.history(&id).await.unwrap();
    assert_eq!(
        event_types(&history),
        vec![
            "workflow_started",
            "activity_scheduled",
            "activity_completed",
            "timer_started",
            "timer_fired",
            "activity_scheduled",
            "activity_completed",
            "workflow_completed"
        ]
    );

    // A third process finds nothing left to resume
    let (third, third_counters) = runtime_with_store(Some(store));
    let report = third.recover().await.unwrap();
    assert!(report.resumed.is_empty());
    assert_eq!(report.terminal, vec!["greetings".to_string()]);
    assert_eq!(third.describe(&id).unwrap().status, WorkflowStatus::Completed);
    assert_eq!(third_counters.greetings.load(Ordering::SeqCst), 0);
}

#[tokio::test(start_paused = true)]
async fn test_recovery_from_memory_store() {
    let store: Arc<dyn HistoryStore> = Arc::new(InMemoryHistoryStore::new());
    assert_recovers_without_reinvoking(store).await;
}

#[tokio::test(start_paused = true)]
async fn test_recovery_from_file_store() {
    let dir = tempfile::tempdir().unwrap();
    let store: Arc<dyn HistoryStore> =
        Arc::new(FileHistoryStore::open(dir.path()).await.unwrap());
    assert_recovers_without_reinvoking(store).await;
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_rejects_new_work() {
    let (runtime, _) = runtime();
    runtime.shutdown(Duration::from_secs(1)).await;
    let err = runtime
        .start::<Sleepy>(&1, StartWorkflowOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::ShutDown));
}
