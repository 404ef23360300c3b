//! # System Constants
//!
//! Names and defaults shared by the engine, the storage domain and the worker
//! binary. Workflow and activity type names are part of recorded history, so
//! they must never change for an existing deployment.

use std::time::Duration;

/// Task queue the storage worker serves
pub const DEFAULT_TASK_QUEUE: &str = "netapp-activeiq-task-queue";

/// Registered workflow type names
pub mod workflow_types {
    pub const SVM_CREATION: &str = "SVMCreation";
    pub const NFS_SHARE_PROVISIONING: &str = "NFSShareProvisioning";
    pub const PERFORMANCE_MONITORING: &str = "PerformanceMonitoring";
    pub const EVENT_PROCESSING: &str = "EventProcessing";
    pub const COMPREHENSIVE_STORAGE_PROVISIONING: &str = "ComprehensiveStorageProvisioning";
}

/// Registered activity type names
pub mod activity_types {
    pub const VALIDATE_CLUSTER_HEALTH: &str = "validate_cluster_health";
    pub const GET_AVAILABLE_AGGREGATES: &str = "get_available_aggregates";
    pub const CREATE_SVM: &str = "create_svm";
    pub const WAIT_FOR_JOB: &str = "wait_for_job";
    pub const CREATE_NFS_SHARE: &str = "create_nfs_share";
    pub const GET_PERFORMANCE_METRICS: &str = "get_performance_metrics";
    pub const CHECK_ALERT_THRESHOLDS: &str = "check_alert_thresholds";
    pub const SEND_NOTIFICATION: &str = "send_notification";
    pub const GET_SYSTEM_EVENTS: &str = "get_system_events";
    pub const ACKNOWLEDGE_EVENT: &str = "acknowledge_event";
}

/// Terminal states reported by the storage management job API
pub mod job_states {
    pub const COMPLETED: &str = "COMPLETED";
    pub const FAILED: &str = "FAILED";
    pub const CANCELLED: &str = "CANCELLED";
    pub const RUNNING: &str = "RUNNING";

    pub fn is_terminal(state: &str) -> bool {
        matches!(state, COMPLETED | FAILED | CANCELLED)
    }
}

/// Engine-wide defaults
pub mod defaults {
    use super::Duration;

    pub const JOB_POLL_INTERVAL: Duration = Duration::from_secs(2);
    pub const JOB_WAIT_TIMEOUT: Duration = Duration::from_secs(300);
    pub const MAX_CONCURRENT_ACTIVITIES: usize = 16;
    pub const SHUTDOWN_GRACE_PERIOD: Duration = Duration::from_secs(10);
    pub const EVENT_CHANNEL_CAPACITY: usize = 1000;
    pub const HISTORY_DIRECTORY: &str = "data/history";
    pub const START_TO_CLOSE_TIMEOUT: Duration = Duration::from_secs(60);
    /// Closed activity, timer and child records kept in a snapshot, per kind
    pub const SNAPSHOT_CLOSED_RECORDS: usize = 100;
    /// Attempts for one history append before the instance is rebuilt from the store
    pub const HISTORY_APPEND_ATTEMPTS: u32 = 3;
    pub const HISTORY_APPEND_BACKOFF: Duration = Duration::from_millis(50);
    /// Backoff bounds for rebuilding an instance after the store failed it
    pub const INSTANCE_RESTORE_BACKOFF: Duration = Duration::from_millis(500);
    pub const INSTANCE_RESTORE_MAX_BACKOFF: Duration = Duration::from_secs(30);
}
