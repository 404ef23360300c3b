//! # Orchestration Engine
//!
//! Durable execution core for deterministic workflows.
//!
//! ## Architecture
//!
//! Workflows are coordination functions that never touch the outside world
//! directly. Every side effect goes through the [`WorkflowContext`] and becomes
//! a suspension point recorded in the instance's history. A running instance
//! keeps its function suspended in memory and wakes it as resolutions are
//! recorded; after a restart the function is replayed from the start against
//! that history, so the instance resumes exactly where it left off.
//!
//! ## Core Components
//!
//! - **RetryPolicy**: Exponential backoff and attempt limits for activities
//! - **ActivityInvoker**: Bounded worker pool running activity attempts with timeouts and retries
//! - **TimerService**: Durable timers keyed by workflow instance and suspension point
//! - **WorkflowContext**: The only door from a coordination function to effects
//! - **Replay**: A live execution of a coordination function, rebuilt from history on recovery
//! - **WorkflowRuntime**: Catalog, dispatcher and per-instance actors
//!
//! Child workflows are ordinary instances started through the context; the
//! parent suspends on their outcome the same way it suspends on an activity.

pub mod activity;
pub mod activity_invoker;
pub mod context;
pub mod instance;
pub mod replay;
pub mod retry_policy;
pub mod runtime;
pub mod timer_service;
pub mod workflow;

pub use activity::{Activity, ActivityContext, ActivityOptions, ActivityRegistry, ErasedActivity};
pub use activity_invoker::{
    ActivityCompletion, ActivityInvoker, ActivityRequest, ActivityUpdate, InvocationResult,
    TerminalFailure,
};
pub use context::{ChildWorkflowHandle, Command, WorkflowContext};
pub use instance::{
    ActivityInvocation, ChildRecord, TimerRecord, WorkflowOutcome, WorkflowSnapshot,
};
pub use replay::{run_turn, Execution, TurnOutcome};
pub use retry_policy::{RetryDecision, RetryPolicy};
pub use runtime::{
    RecoveryReport, StartWorkflowOptions, WorkflowRuntime, WorkflowRuntimeBuilder,
};
pub use timer_service::TimerService;
pub use workflow::{ErasedWorkflow, Workflow, WorkflowCatalog};
