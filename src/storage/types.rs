//! # Storage Domain Types
//!
//! Records exchanged between the storage workflows, their activities and the
//! storage management API. Field names follow the API's snake_case payloads.

use crate::utils::serde::duration_secs;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterInfo {
    pub cluster_id: String,
    pub name: String,
    pub version: String,
    pub health_status: String,
    pub nodes: Vec<String>,
}

impl ClusterInfo {
    pub fn is_healthy(&self) -> bool {
        self.health_status == "healthy"
    }
}

/// Storage aggregate as reported for a cluster
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Aggregate {
    pub name: String,
    pub key: String,
    /// Bytes
    pub available_size: u64,
    pub used_percentage: f64,
    pub state: String,
}

impl Aggregate {
    pub fn is_online(&self) -> bool {
        self.state == "online"
    }
}

fn default_language() -> String {
    "c.utf_8".to_string()
}

fn default_security_style() -> String {
    "unix".to_string()
}

/// Requested storage virtual machine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SvmConfig {
    pub name: String,
    pub cluster_key: String,
    /// Filled in by the SVM creation workflow from aggregate selection
    #[serde(default)]
    pub aggregate_name: Option<String>,
    #[serde(default)]
    pub root_volume: Option<String>,
    #[serde(default = "default_language")]
    pub language: String,
    #[serde(default = "default_security_style")]
    pub security_style: String,
}

impl SvmConfig {
    pub fn new(name: impl Into<String>, cluster_key: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            cluster_key: cluster_key.into(),
            aggregate_name: None,
            root_volume: None,
            language: default_language(),
            security_style: default_security_style(),
        }
    }
}

/// Asynchronous job handle returned by long-running API calls
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRef {
    pub uuid: String,
    pub state: String,
    #[serde(default)]
    pub description: String,
}

/// Result of `create_svm`; `job` is absent when the SVM already existed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SvmCreation {
    pub svm_key: String,
    pub job: Option<JobRef>,
}

/// An existing SVM
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SvmRecord {
    pub key: String,
    pub name: String,
    pub state: String,
}

/// Job status as polled from the job API
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobStatus {
    pub key: String,
    pub state: String,
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WaitForJobRequest {
    pub job_key: String,
    #[serde(with = "duration_secs")]
    pub timeout: Duration,
}

/// Requested NFS file share
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NfsShareConfig {
    pub name: String,
    /// Set by the comprehensive workflow once the SVM exists
    #[serde(default)]
    pub svm_key: String,
    pub path: String,
    #[serde(default)]
    pub export_policy: String,
    #[serde(default)]
    pub access_control: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NfsShare {
    pub key: String,
    pub name: String,
    pub path: String,
    pub state: String,
    #[serde(default)]
    pub access_control: BTreeMap<String, Value>,
}

fn default_monitoring_interval() -> Duration {
    Duration::from_secs(300)
}

fn default_error_backoff() -> Duration {
    Duration::from_secs(60)
}

/// Input of the performance monitoring loop
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitoringConfig {
    pub cluster_keys: Vec<String>,
    pub metrics: Vec<String>,
    #[serde(default)]
    pub alert_thresholds: BTreeMap<String, f64>,
    #[serde(default)]
    pub notification_channels: Vec<String>,
    /// Sleep between successful cycles
    #[serde(with = "duration_secs", default = "default_monitoring_interval")]
    pub interval: Duration,
    /// Sleep after a failed cycle
    #[serde(with = "duration_secs", default = "default_error_backoff")]
    pub error_backoff: Duration,
    /// Stop after this many cycles; runs forever when absent
    #[serde(default)]
    pub max_iterations: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsRequest {
    pub cluster_key: String,
    pub metrics: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceMetrics {
    pub cluster_key: String,
    pub timestamp: String,
    pub metrics: BTreeMap<String, f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThresholdCheck {
    pub metrics: PerformanceMetrics,
    pub thresholds: BTreeMap<String, f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub message: String,
    pub channels: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemEvent {
    pub key: String,
    pub severity: String,
    pub message: String,
    pub timestamp: String,
    pub state: String,
}

impl SystemEvent {
    pub fn is_new(&self) -> bool {
        self.state == "new"
    }
}

/// Result of the SVM creation workflow
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SvmCreationResult {
    pub svm_name: String,
    pub svm_key: String,
    pub cluster_info: ClusterInfo,
    pub aggregate_used: Aggregate,
    pub job_result: JobStatus,
    pub status: String,
}

/// Result of the NFS share provisioning workflow
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NfsShareResult {
    pub share_name: String,
    pub share_details: NfsShare,
    pub status: String,
}

/// Result of a bounded monitoring run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitoringSummary {
    pub iterations: u32,
    pub failed_iterations: u32,
    pub alerts_sent: u32,
    pub status: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessedEvent {
    pub event_key: String,
    pub action: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventProcessingResult {
    pub total_events_processed: usize,
    pub events: Vec<ProcessedEvent>,
    pub status: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComprehensiveProvisioningRequest {
    pub svm_config: SvmConfig,
    pub share_configs: Vec<NfsShareConfig>,
}

/// Per-share line of the comprehensive result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShareOutcome {
    pub share_name: String,
    pub child_id: String,
    pub status: String,
    pub result: Option<NfsShareResult>,
    pub error: Option<String>,
}

impl ShareOutcome {
    pub fn succeeded(&self) -> bool {
        self.result.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComprehensiveProvisioningResult {
    pub svm_result: SvmCreationResult,
    pub share_results: Vec<ShareOutcome>,
    pub total_shares_created: usize,
    pub failed_shares: usize,
    pub status: String,
}
