//! # Storage Management API Boundary
//!
//! Activities reach the storage management system and the notification
//! channels only through the [`StorageApi`] and [`Notifier`] traits. The REST
//! client that implements them in production lives outside this crate.
//!
//! [`SimulatedStorageApi`] answers with canned cluster, aggregate, metric and
//! event data and completes jobs after a configurable number of polls. It backs
//! the worker binary when no real client is wired in.

use super::types::{
    Aggregate, ClusterInfo, JobRef, JobStatus, NfsShare, NfsShareConfig, PerformanceMetrics,
    SvmConfig, SvmCreation, SvmRecord, SystemEvent,
};
use crate::constants::job_states;
use crate::error::ActivityError;
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use thiserror::Error;
use tracing::{debug, info};

/// Failure of a storage API call
#[derive(Debug, Clone, PartialEq, Error)]
pub enum StorageApiError {
    #[error("Request failed: {0}")]
    Transport(String),

    #[error("HTTP {status}: {message}")]
    Http { status: u16, message: String },

    #[error("{resource} {key} not found")]
    NotFound { resource: &'static str, key: String },

    #[error("Unexpected response: {0}")]
    InvalidResponse(String),
}

impl StorageApiError {
    pub fn http(status: u16, message: impl Into<String>) -> Self {
        Self::Http {
            status,
            message: message.into(),
        }
    }

    /// Transport failures, throttling and server errors are worth another attempt
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transport(_) => true,
            Self::Http { status, .. } => *status == 429 || *status >= 500,
            Self::NotFound { .. } | Self::InvalidResponse(_) => false,
        }
    }
}

impl From<StorageApiError> for ActivityError {
    fn from(error: StorageApiError) -> Self {
        if error.is_retryable() {
            ActivityError::Retryable(error.to_string())
        } else {
            ActivityError::NonRetryable(error.to_string())
        }
    }
}

pub type StorageApiResult<T> = Result<T, StorageApiError>;

/// Storage management operations used by the storage activities
#[async_trait]
pub trait StorageApi: Send + Sync + fmt::Debug {
    async fn get_cluster(&self, cluster_key: &str) -> StorageApiResult<ClusterInfo>;

    async fn list_aggregates(&self, cluster_key: &str) -> StorageApiResult<Vec<Aggregate>>;

    async fn find_svm(&self, cluster_key: &str, name: &str) -> StorageApiResult<Option<SvmRecord>>;

    /// Submit SVM creation; completes asynchronously through the returned job
    async fn create_svm(&self, config: &SvmConfig) -> StorageApiResult<SvmCreation>;

    async fn get_job(&self, job_key: &str) -> StorageApiResult<JobStatus>;

    async fn find_file_share(&self, svm_key: &str, name: &str) -> StorageApiResult<Option<NfsShare>>;

    async fn create_file_share(&self, config: &NfsShareConfig) -> StorageApiResult<NfsShare>;

    async fn get_performance_metrics(
        &self,
        cluster_key: &str,
        metrics: &[String],
    ) -> StorageApiResult<PerformanceMetrics>;

    async fn list_events(&self, severity: &str) -> StorageApiResult<Vec<SystemEvent>>;

    async fn acknowledge_event(&self, event_key: &str) -> StorageApiResult<()>;
}

/// Delivery of alert messages to a channel (email, chat, paging)
#[async_trait]
pub trait Notifier: Send + Sync + fmt::Debug {
    async fn notify(&self, channel: &str, message: &str) -> StorageApiResult<()>;
}

/// Notifier that writes every message to the log
#[derive(Debug, Clone, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, channel: &str, message: &str) -> StorageApiResult<()> {
        info!(channel = %channel, message = %message, "📣 NOTIFICATION: Sent");
        Ok(())
    }
}

#[derive(Debug, Default)]
struct SimulatedState {
    svms: HashMap<(String, String), SvmRecord>,
    shares: HashMap<(String, String), NfsShare>,
    job_polls: HashMap<String, u32>,
    acknowledged: HashSet<String>,
}

/// Canned storage API used when no management endpoint is configured
#[derive(Debug)]
pub struct SimulatedStorageApi {
    polls_until_complete: u32,
    state: Mutex<SimulatedState>,
}

impl Default for SimulatedStorageApi {
    fn default() -> Self {
        Self::new(3)
    }
}

impl SimulatedStorageApi {
    /// Jobs report `COMPLETED` on poll number `polls_until_complete`
    pub fn new(polls_until_complete: u32) -> Self {
        Self {
            polls_until_complete: polls_until_complete.max(1),
            state: Mutex::new(SimulatedState::default()),
        }
    }
}

#[async_trait]
impl StorageApi for SimulatedStorageApi {
    async fn get_cluster(&self, cluster_key: &str) -> StorageApiResult<ClusterInfo> {
        Ok(ClusterInfo {
            cluster_id: cluster_key.to_string(),
            name: format!("cluster-{cluster_key}"),
            version: "9.14.1".to_string(),
            health_status: "healthy".to_string(),
            nodes: vec!["node1".to_string(), "node2".to_string()],
        })
    }

    async fn list_aggregates(&self, _cluster_key: &str) -> StorageApiResult<Vec<Aggregate>> {
        Ok(vec![
            Aggregate {
                name: "aggr1".to_string(),
                key: "aggr1-key".to_string(),
                available_size: 1_000_000_000_000,
                used_percentage: 45.0,
                state: "online".to_string(),
            },
            Aggregate {
                name: "aggr2".to_string(),
                key: "aggr2-key".to_string(),
                available_size: 2_000_000_000_000,
                used_percentage: 30.0,
                state: "online".to_string(),
            },
        ])
    }

    async fn find_svm(&self, cluster_key: &str, name: &str) -> StorageApiResult<Option<SvmRecord>> {
        let state = self.state.lock();
        Ok(state
            .svms
            .get(&(cluster_key.to_string(), name.to_string()))
            .cloned())
    }

    async fn create_svm(&self, config: &SvmConfig) -> StorageApiResult<SvmCreation> {
        let svm_key = format!("svm-{}-key", config.name);
        let job_key = format!("svm-job-{}", config.name);
        let mut state = self.state.lock();
        state.svms.insert(
            (config.cluster_key.clone(), config.name.clone()),
            SvmRecord {
                key: svm_key.clone(),
                name: config.name.clone(),
                state: "running".to_string(),
            },
        );
        state.job_polls.insert(job_key.clone(), 0);
        debug!(svm = %config.name, job_key = %job_key, "Simulated SVM creation submitted");

        Ok(SvmCreation {
            svm_key,
            job: Some(JobRef {
                uuid: job_key,
                state: "running".to_string(),
                description: format!("Creating SVM {}", config.name),
            }),
        })
    }

    async fn get_job(&self, job_key: &str) -> StorageApiResult<JobStatus> {
        let mut state = self.state.lock();
        let Some(polls) = state.job_polls.get_mut(job_key) else {
            return Err(StorageApiError::NotFound {
                resource: "Job",
                key: job_key.to_string(),
            });
        };
        *polls += 1;
        let done = *polls >= self.polls_until_complete;

        Ok(JobStatus {
            key: job_key.to_string(),
            state: if done {
                job_states::COMPLETED
            } else {
                job_states::RUNNING
            }
            .to_string(),
            message: done.then(|| "Job completed successfully".to_string()),
        })
    }

    async fn find_file_share(&self, svm_key: &str, name: &str) -> StorageApiResult<Option<NfsShare>> {
        let state = self.state.lock();
        Ok(state
            .shares
            .get(&(svm_key.to_string(), name.to_string()))
            .cloned())
    }

    async fn create_file_share(&self, config: &NfsShareConfig) -> StorageApiResult<NfsShare> {
        let share = NfsShare {
            key: format!("share-{}-key", config.name),
            name: config.name.clone(),
            path: config.path.clone(),
            state: "available".to_string(),
            access_control: config.access_control.clone(),
        };
        self.state
            .lock()
            .shares
            .insert((config.svm_key.clone(), config.name.clone()), share.clone());
        Ok(share)
    }

    async fn get_performance_metrics(
        &self,
        cluster_key: &str,
        metrics: &[String],
    ) -> StorageApiResult<PerformanceMetrics> {
        let all: BTreeMap<String, f64> = [
            ("cpu_utilization", 65.5),
            ("memory_utilization", 78.2),
            ("disk_iops", 1250.0),
            ("network_throughput", 850.3),
        ]
        .into_iter()
        .map(|(name, value)| (name.to_string(), value))
        .collect();

        let selected = if metrics.is_empty() {
            all
        } else {
            all.into_iter()
                .filter(|(name, _)| metrics.contains(name))
                .collect()
        };

        Ok(PerformanceMetrics {
            cluster_key: cluster_key.to_string(),
            timestamp: Utc::now().to_rfc3339(),
            metrics: selected,
        })
    }

    async fn list_events(&self, _severity: &str) -> StorageApiResult<Vec<SystemEvent>> {
        let state = self.state.lock();
        let event = |key: &str, severity: &str, message: &str, timestamp: &str, initial: &str| {
            let acknowledged = state.acknowledged.contains(key);
            SystemEvent {
                key: key.to_string(),
                severity: severity.to_string(),
                message: message.to_string(),
                timestamp: timestamp.to_string(),
                state: if acknowledged { "acknowledged" } else { initial }.to_string(),
            }
        };

        Ok(vec![
            event(
                "event-001",
                "error",
                "Volume vol1 is nearly full",
                "2024-01-15T10:25:00Z",
                "new",
            ),
            event(
                "event-002",
                "warning",
                "High CPU utilization on node1",
                "2024-01-15T10:20:00Z",
                "acknowledged",
            ),
        ])
    }

    async fn acknowledge_event(&self, event_key: &str) -> StorageApiResult<()> {
        self.state.lock().acknowledged.insert(event_key.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(StorageApiError::Transport("connection reset".to_string()).is_retryable());
        assert!(StorageApiError::http(503, "unavailable").is_retryable());
        assert!(StorageApiError::http(429, "slow down").is_retryable());
        assert!(!StorageApiError::http(400, "bad request").is_retryable());
        assert!(!StorageApiError::NotFound {
            resource: "Job",
            key: "j1".to_string()
        }
        .is_retryable());
    }

    #[test]
    fn test_activity_error_conversion() {
        let retryable: ActivityError = StorageApiError::http(502, "bad gateway").into();
        assert!(retryable.is_retryable());

        let fatal: ActivityError = StorageApiError::http(403, "forbidden").into();
        assert!(!fatal.is_retryable());
        assert_eq!(fatal.to_string(), "HTTP 403: forbidden");
    }

    #[tokio::test]
    async fn test_simulated_job_completes_after_polls() {
        let api = SimulatedStorageApi::new(2);
        let creation = api.create_svm(&SvmConfig::new("svm-1", "c1")).await.unwrap();
        let job_key = creation.job.unwrap().uuid;

        assert_eq!(api.get_job(&job_key).await.unwrap().state, "RUNNING");
        assert_eq!(api.get_job(&job_key).await.unwrap().state, "COMPLETED");
        assert!(matches!(
            api.get_job("missing").await,
            Err(StorageApiError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_simulated_events_reflect_acknowledgement() {
        let api = SimulatedStorageApi::default();
        let before = api.list_events("error").await.unwrap();
        assert!(before[0].is_new());

        api.acknowledge_event("event-001").await.unwrap();
        let after = api.list_events("error").await.unwrap();
        assert!(!after[0].is_new());
    }
}
