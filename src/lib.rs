#![allow(clippy::doc_markdown)] // Allow technical terms like NetApp, SVM, NFS in docs
#![allow(clippy::missing_errors_doc)] // Allow public functions without # Errors sections
#![allow(clippy::must_use_candidate)] // Allow methods without must_use when context is clear

//! # Storage Workflows
//!
//! Durable workflow execution core for storage infrastructure automation.
//!
//! ## Overview
//!
//! Multi-step storage operations (creating a storage virtual machine, provisioning
//! file shares, monitoring cluster performance, processing system events) are
//! written as deterministic coordination functions. The engine records every
//! scheduling decision and every resolution in an append-only history, so an
//! instance survives process restarts by replaying that history.
//!
//! ## Architecture
//!
//! - **Coordination functions** ([`Workflow`]) only see a [`WorkflowContext`]:
//!   activities, timers, child workflows and signals. No ambient I/O.
//! - **Activities** ([`Activity`]) do the real work on a bounded worker pool,
//!   each attempt under a start-to-close timeout and governed by a [`RetryPolicy`].
//! - **The runtime** ([`WorkflowRuntime`]) owns one actor per instance, persists
//!   history through a [`HistoryStore`] and publishes terminal notifications.
//!
//! ## Module Organization
//!
//! - [`orchestration`] - retry policy, activity invoker, timers, replay, runtime
//! - [`history`] - history events and persistence backends
//! - [`state_machine`] - workflow, activity and timer status transitions
//! - [`storage`] - storage activities and workflows
//! - [`config`] - layered YAML and environment configuration
//! - [`error`] - failure taxonomy
//! - [`events`] - lifecycle notifications
//! - [`logging`] - structured logging setup
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use storage_workflows::config::JobWaitConfig;
//! use storage_workflows::storage::{self, types::SvmConfig, LogNotifier, SimulatedStorageApi};
//! use storage_workflows::{StartWorkflowOptions, SvmCreationWorkflow, WorkflowRuntime};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let runtime = storage::register(
//!     WorkflowRuntime::builder(),
//!     Arc::new(SimulatedStorageApi::default()),
//!     Arc::new(LogNotifier),
//!     &JobWaitConfig::default(),
//! )
//! .build();
//!
//! let id = runtime
//!     .start::<SvmCreationWorkflow>(
//!         &SvmConfig::new("svm-1", "c1"),
//!         StartWorkflowOptions::with_id("svm-creation-svm-1"),
//!     )
//!     .await?;
//! let outcome = runtime.wait_for_completion(&id).await?;
//! println!("{} finished as {}", id, outcome.status);
//! # Ok(())
//! # }
//! ```
//!
//! ## Testing
//!
//! ```bash
//! cargo test --lib    # Unit tests
//! cargo test          # Unit and integration tests
//! ```

#[macro_use]
pub mod macros;

pub mod config;
pub mod constants;
pub mod error;
pub mod events;
pub mod history;
pub mod logging;
pub mod orchestration;
pub mod state_machine;
pub mod storage;
pub mod utils;

pub use config::{ConfigManager, WorkflowEngineConfig};
pub use constants::{activity_types, workflow_types};
pub use error::{
    ActivityError, EngineError, EngineResult, FailureKind, WorkflowError, WorkflowResult,
};
pub use events::{EventPublisher, NotificationKind, WorkflowNotification};
pub use history::{
    EventKind, FileHistoryStore, HistoryError, HistoryEvent, HistoryStore, InMemoryHistoryStore,
};
pub use orchestration::{
    Activity, ActivityContext, ActivityOptions, ActivityRegistry, RecoveryReport, RetryPolicy,
    StartWorkflowOptions, Workflow, WorkflowCatalog, WorkflowContext, WorkflowOutcome,
    WorkflowRuntime, WorkflowRuntimeBuilder, WorkflowSnapshot,
};
pub use state_machine::{ActivityStatus, TimerStatus, WorkflowStatus};
pub use storage::{
    ComprehensiveStorageProvisioningWorkflow, EventProcessingWorkflow,
    NfsShareProvisioningWorkflow, PerformanceMonitoringWorkflow, SvmCreationWorkflow,
};
