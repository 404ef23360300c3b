//! # Storage Workflows
//!
//! Coordination functions for the storage domain. They reach the storage API
//! only through the activities in [`crate::storage::activities`].

mod comprehensive;
mod event_processing;
mod nfs_share;
mod performance_monitoring;
mod svm_creation;

pub use comprehensive::ComprehensiveStorageProvisioningWorkflow;
pub use event_processing::EventProcessingWorkflow;
pub use nfs_share::NfsShareProvisioningWorkflow;
pub use performance_monitoring::PerformanceMonitoringWorkflow;
pub use svm_creation::{select_aggregate, SvmCreationWorkflow};

use crate::orchestration::WorkflowCatalog;

/// Catalog containing every storage workflow
pub fn storage_workflows() -> WorkflowCatalog {
    let mut catalog = WorkflowCatalog::new();
    catalog
        .register(SvmCreationWorkflow)
        .register(NfsShareProvisioningWorkflow)
        .register(PerformanceMonitoringWorkflow)
        .register(EventProcessingWorkflow)
        .register(ComprehensiveStorageProvisioningWorkflow);
    catalog
}
