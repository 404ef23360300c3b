//! # Storage Activities
//!
//! Each activity wraps one call (or one poll loop) against the storage
//! management API. Activities may run more than once for the same workflow step,
//! so the create activities look for an existing resource before creating one.

use super::api::{Notifier, StorageApi};
use super::types::{
    Aggregate, ClusterInfo, JobStatus, MetricsRequest, NfsShare, NfsShareConfig, Notification,
    PerformanceMetrics, SvmConfig, SvmCreation, SystemEvent, ThresholdCheck, WaitForJobRequest,
};
use crate::config::JobWaitConfig;
use crate::constants::{activity_types, defaults, job_states};
use crate::error::ActivityError;
use crate::orchestration::{Activity, ActivityContext, ActivityRegistry};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Fetch cluster information and fail unless the cluster is healthy
#[derive(Debug, Clone)]
pub struct ValidateClusterHealth {
    api: Arc<dyn StorageApi>,
}

impl ValidateClusterHealth {
    pub fn new(api: Arc<dyn StorageApi>) -> Self {
        Self { api }
    }
}

#[async_trait]
impl Activity for ValidateClusterHealth {
    const ACTIVITY_TYPE: &'static str = activity_types::VALIDATE_CLUSTER_HEALTH;
    type Input = String;
    type Output = ClusterInfo;

    async fn execute(&self, _ctx: ActivityContext, cluster_key: String) -> Result<ClusterInfo, ActivityError> {
        info!(cluster_key = %cluster_key, "Validating cluster health");
        let cluster = self.api.get_cluster(&cluster_key).await?;
        if !cluster.is_healthy() {
            // The cluster may recover; let the retry policy decide
            return Err(ActivityError::retryable(format!(
                "Cluster {cluster_key} is not healthy: {}",
                cluster.health_status
            )));
        }
        Ok(cluster)
    }
}

#[derive(Debug, Clone)]
pub struct GetAvailableAggregates {
    api: Arc<dyn StorageApi>,
}

impl GetAvailableAggregates {
    pub fn new(api: Arc<dyn StorageApi>) -> Self {
        Self { api }
    }
}

#[async_trait]
impl Activity for GetAvailableAggregates {
    const ACTIVITY_TYPE: &'static str = activity_types::GET_AVAILABLE_AGGREGATES;
    type Input = String;
    type Output = Vec<Aggregate>;

    async fn execute(&self, _ctx: ActivityContext, cluster_key: String) -> Result<Vec<Aggregate>, ActivityError> {
        debug!(cluster_key = %cluster_key, "Fetching aggregates");
        Ok(self.api.list_aggregates(&cluster_key).await?)
    }
}

/// Submit SVM creation, or return the existing SVM of the same name
#[derive(Debug, Clone)]
pub struct CreateSvm {
    api: Arc<dyn StorageApi>,
}

impl CreateSvm {
    pub fn new(api: Arc<dyn StorageApi>) -> Self {
        Self { api }
    }
}

#[async_trait]
impl Activity for CreateSvm {
    const ACTIVITY_TYPE: &'static str = activity_types::CREATE_SVM;
    type Input = SvmConfig;
    type Output = SvmCreation;

    async fn execute(&self, ctx: ActivityContext, config: SvmConfig) -> Result<SvmCreation, ActivityError> {
        if let Some(existing) = self.api.find_svm(&config.cluster_key, &config.name).await? {
            info!(
                svm = %config.name,
                svm_key = %existing.key,
                attempt = ctx.attempt,
                "SVM already exists, reusing it"
            );
            return Ok(SvmCreation {
                svm_key: existing.key,
                job: None,
            });
        }

        info!(svm = %config.name, aggregate = ?config.aggregate_name, "Creating SVM");
        Ok(self.api.create_svm(&config).await?)
    }
}

/// Poll a job until it reaches a terminal state or the wait times out
#[derive(Debug, Clone)]
pub struct WaitForJob {
    api: Arc<dyn StorageApi>,
    poll_interval: Duration,
}

impl WaitForJob {
    pub fn new(api: Arc<dyn StorageApi>, poll_interval: Duration) -> Self {
        Self { api, poll_interval }
    }
}

#[async_trait]
impl Activity for WaitForJob {
    const ACTIVITY_TYPE: &'static str = activity_types::WAIT_FOR_JOB;
    type Input = WaitForJobRequest;
    type Output = JobStatus;

    async fn execute(&self, _ctx: ActivityContext, request: WaitForJobRequest) -> Result<JobStatus, ActivityError> {
        let started = Instant::now();
        let mut polls = 0u32;

        loop {
            if started.elapsed() >= request.timeout {
                warn!(
                    job_key = %request.job_key,
                    polls,
                    timeout_secs = request.timeout.as_secs(),
                    "Job did not finish in time"
                );
                return Err(ActivityError::JobTimedOut {
                    job_key: request.job_key,
                    timeout_secs: request.timeout.as_secs(),
                });
            }

            polls += 1;
            let status = match self.api.get_job(&request.job_key).await {
                Ok(status) => status,
                // A transient poll failure counts against this wait, not as an attempt
                Err(e) if e.is_retryable() => {
                    warn!(job_key = %request.job_key, polls, error = %e, "Job poll failed, polling again");
                    tokio::time::sleep(self.poll_interval).await;
                    continue;
                }
                Err(e) => return Err(e.into()),
            };
            debug!(job_key = %request.job_key, state = %status.state, polls, "Polled job");

            match status.state.as_str() {
                job_states::COMPLETED => return Ok(status),
                job_states::FAILED | job_states::CANCELLED => {
                    return Err(ActivityError::JobFailed {
                        job_key: request.job_key,
                        message: status.message.unwrap_or_else(|| "Job failed".to_string()),
                        state: status.state,
                    });
                }
                _ => tokio::time::sleep(self.poll_interval).await,
            }
        }
    }
}

/// Create an NFS share, or return the existing share of the same name
#[derive(Debug, Clone)]
pub struct CreateNfsShare {
    api: Arc<dyn StorageApi>,
}

impl CreateNfsShare {
    pub fn new(api: Arc<dyn StorageApi>) -> Self {
        Self { api }
    }
}

#[async_trait]
impl Activity for CreateNfsShare {
    const ACTIVITY_TYPE: &'static str = activity_types::CREATE_NFS_SHARE;
    type Input = NfsShareConfig;
    type Output = NfsShare;

    async fn execute(&self, _ctx: ActivityContext, config: NfsShareConfig) -> Result<NfsShare, ActivityError> {
        if config.svm_key.is_empty() {
            return Err(ActivityError::InvalidInput(format!(
                "share {} has no svm_key",
                config.name
            )));
        }
        if let Some(existing) = self.api.find_file_share(&config.svm_key, &config.name).await? {
            info!(share = %config.name, share_key = %existing.key, "NFS share already exists, reusing it");
            return Ok(existing);
        }

        info!(share = %config.name, svm_key = %config.svm_key, path = %config.path, "Creating NFS share");
        Ok(self.api.create_file_share(&config).await?)
    }
}

#[derive(Debug, Clone)]
pub struct GetPerformanceMetrics {
    api: Arc<dyn StorageApi>,
}

impl GetPerformanceMetrics {
    pub fn new(api: Arc<dyn StorageApi>) -> Self {
        Self { api }
    }
}

#[async_trait]
impl Activity for GetPerformanceMetrics {
    const ACTIVITY_TYPE: &'static str = activity_types::GET_PERFORMANCE_METRICS;
    type Input = MetricsRequest;
    type Output = PerformanceMetrics;

    async fn execute(&self, _ctx: ActivityContext, request: MetricsRequest) -> Result<PerformanceMetrics, ActivityError> {
        Ok(self
            .api
            .get_performance_metrics(&request.cluster_key, &request.metrics)
            .await?)
    }
}

/// Compare metrics against thresholds and return one alert message per violation
#[derive(Debug, Clone, Default)]
pub struct CheckAlertThresholds;

impl CheckAlertThresholds {
    pub fn evaluate(check: &ThresholdCheck) -> Vec<String> {
        check
            .metrics
            .metrics
            .iter()
            .filter_map(|(metric, value)| {
                let threshold = check.thresholds.get(metric)?;
                (value > threshold)
                    .then(|| format!("ALERT: {metric} is {value}, exceeds threshold {threshold}"))
            })
            .collect()
    }
}

#[async_trait]
impl Activity for CheckAlertThresholds {
    const ACTIVITY_TYPE: &'static str = activity_types::CHECK_ALERT_THRESHOLDS;
    type Input = ThresholdCheck;
    type Output = Vec<String>;

    async fn execute(&self, _ctx: ActivityContext, check: ThresholdCheck) -> Result<Vec<String>, ActivityError> {
        let alerts = Self::evaluate(&check);
        for alert in &alerts {
            warn!(cluster_key = %check.metrics.cluster_key, "{alert}");
        }
        Ok(alerts)
    }
}

/// Deliver a message to every listed channel
#[derive(Debug, Clone)]
pub struct SendNotification {
    notifier: Arc<dyn Notifier>,
}

impl SendNotification {
    pub fn new(notifier: Arc<dyn Notifier>) -> Self {
        Self { notifier }
    }
}

#[async_trait]
impl Activity for SendNotification {
    const ACTIVITY_TYPE: &'static str = activity_types::SEND_NOTIFICATION;
    type Input = Notification;
    type Output = bool;

    async fn execute(&self, _ctx: ActivityContext, notification: Notification) -> Result<bool, ActivityError> {
        for channel in &notification.channels {
            self.notifier.notify(channel, &notification.message).await?;
        }
        Ok(true)
    }
}

#[derive(Debug, Clone)]
pub struct GetSystemEvents {
    api: Arc<dyn StorageApi>,
}

impl GetSystemEvents {
    pub fn new(api: Arc<dyn StorageApi>) -> Self {
        Self { api }
    }
}

#[async_trait]
impl Activity for GetSystemEvents {
    const ACTIVITY_TYPE: &'static str = activity_types::GET_SYSTEM_EVENTS;
    /// Severity filter
    type Input = String;
    type Output = Vec<SystemEvent>;

    async fn execute(&self, _ctx: ActivityContext, severity: String) -> Result<Vec<SystemEvent>, ActivityError> {
        info!(severity = %severity, "Fetching system events");
        Ok(self.api.list_events(&severity).await?)
    }
}

#[derive(Debug, Clone)]
pub struct AcknowledgeEvent {
    api: Arc<dyn StorageApi>,
}

impl AcknowledgeEvent {
    pub fn new(api: Arc<dyn StorageApi>) -> Self {
        Self { api }
    }
}

#[async_trait]
impl Activity for AcknowledgeEvent {
    const ACTIVITY_TYPE: &'static str = activity_types::ACKNOWLEDGE_EVENT;
    type Input = String;
    type Output = bool;

    async fn execute(&self, _ctx: ActivityContext, event_key: String) -> Result<bool, ActivityError> {
        info!(event_key = %event_key, "Acknowledging event");
        self.api.acknowledge_event(&event_key).await?;
        Ok(true)
    }
}

/// Registry with every storage activity wired to the given collaborators
pub fn storage_activities(
    api: Arc<dyn StorageApi>,
    notifier: Arc<dyn Notifier>,
    job_wait: &JobWaitConfig,
) -> ActivityRegistry {
    let poll_interval = match job_wait.poll_interval() {
        interval if interval.is_zero() => defaults::JOB_POLL_INTERVAL,
        interval => interval,
    };

    let mut registry = ActivityRegistry::new();
    registry
        .register(ValidateClusterHealth::new(Arc::clone(&api)))
        .register(GetAvailableAggregates::new(Arc::clone(&api)))
        .register(CreateSvm::new(Arc::clone(&api)))
        .register(WaitForJob::new(Arc::clone(&api), poll_interval))
        .register(CreateNfsShare::new(Arc::clone(&api)))
        .register(GetPerformanceMetrics::new(Arc::clone(&api)))
        .register(CheckAlertThresholds)
        .register(SendNotification::new(notifier))
        .register(GetSystemEvents::new(Arc::clone(&api)))
        .register(AcknowledgeEvent::new(api));
    registry
}
