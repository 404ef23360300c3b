//! # Storage Domain
//!
//! Provisioning, monitoring and event handling for a storage management system,
//! expressed as workflows over the orchestration engine.
//!
//! - [`types`] - records exchanged with the storage management API
//! - [`api`] - the API and notifier boundary plus a simulated implementation
//! - [`activities`] - one activity per API operation, including the job wait
//! - [`workflows`] - the five coordination functions
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use storage_workflows::config::JobWaitConfig;
//! use storage_workflows::storage::{self, LogNotifier, SimulatedStorageApi};
//! use storage_workflows::WorkflowRuntime;
//!
//! let runtime = storage::register(
//!     WorkflowRuntime::builder(),
//!     Arc::new(SimulatedStorageApi::default()),
//!     Arc::new(LogNotifier),
//!     &JobWaitConfig::default(),
//! )
//! .build();
//! ```

pub mod activities;
pub mod api;
pub mod types;
pub mod workflows;

pub use activities::storage_activities;
pub use api::{LogNotifier, Notifier, SimulatedStorageApi, StorageApi, StorageApiError};
pub use workflows::{
    storage_workflows, ComprehensiveStorageProvisioningWorkflow, EventProcessingWorkflow,
    NfsShareProvisioningWorkflow, PerformanceMonitoringWorkflow, SvmCreationWorkflow,
};

use crate::config::JobWaitConfig;
use crate::orchestration::WorkflowRuntimeBuilder;
use std::sync::Arc;

/// Register every storage workflow and activity on a runtime builder
pub fn register(
    builder: WorkflowRuntimeBuilder,
    api: Arc<dyn StorageApi>,
    notifier: Arc<dyn Notifier>,
    job_wait: &JobWaitConfig,
) -> WorkflowRuntimeBuilder {
    builder
        .catalog(storage_workflows())
        .activities(storage_activities(api, notifier, job_wait))
}
