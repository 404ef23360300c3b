//! Shared fixtures for integration tests: a scriptable storage API that records
//! every call, a notifier that records every message, and runtime builders.

#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use storage_workflows::config::JobWaitConfig;
use storage_workflows::history::{
    HistoryError, HistoryEvent, HistoryResult, HistoryStore, InMemoryHistoryStore,
};
use storage_workflows::storage::api::StorageApiResult;
use storage_workflows::storage::types::{
    Aggregate, ClusterInfo, JobRef, JobStatus, NfsShare, NfsShareConfig, PerformanceMetrics,
    SvmConfig, SvmCreation, SvmRecord, SystemEvent,
};
use storage_workflows::storage::{self, Notifier, StorageApi, StorageApiError};
use storage_workflows::{WorkflowRuntime, WorkflowRuntimeBuilder, WorkflowSnapshot};

#[derive(Debug, Default)]
struct FakeState {
    calls: Vec<String>,
    svms: HashMap<(String, String), SvmRecord>,
    shares: HashMap<(String, String), NfsShare>,
    job_polls: HashMap<String, u32>,
    metrics_calls: u32,
    acknowledged: HashSet<String>,
}

/// Storage API double with scripted failures
#[derive(Debug, Default)]
pub struct FakeStorageApi {
    state: Mutex<FakeState>,
    /// Jobs never leave RUNNING
    pub stuck_jobs: bool,
    /// Jobs report FAILED on the first poll
    pub failing_jobs: bool,
    /// 1-based job poll numbers that fail with HTTP 503
    pub failing_job_polls: HashSet<u32>,
    /// Every job poll fails with HTTP 503
    pub unreachable_jobs: bool,
    /// Share names whose creation is rejected with HTTP 400
    pub rejected_shares: HashSet<String>,
    /// 1-based metrics call numbers that fail with HTTP 400
    pub failing_metrics_calls: HashSet<u32>,
}

impl FakeStorageApi {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_stuck_jobs(mut self) -> Self {
        self.stuck_jobs = true;
        self
    }

    pub fn with_failing_jobs(mut self) -> Self {
        self.failing_jobs = true;
        self
    }

    pub fn failing_job_poll(mut self, poll: u32) -> Self {
        self.failing_job_polls.insert(poll);
        self
    }

    pub fn with_unreachable_jobs(mut self) -> Self {
        self.unreachable_jobs = true;
        self
    }

    pub fn rejecting_share(mut self, name: &str) -> Self {
        self.rejected_shares.insert(name.to_string());
        self
    }

    pub fn failing_metrics_call(mut self, call: u32) -> Self {
        self.failing_metrics_calls.insert(call);
        self
    }

    /// Every call so far, formatted `operation:arg[:arg]`
    pub fn calls(&self) -> Vec<String> {
        self.state.lock().calls.clone()
    }

    pub fn calls_to(&self, operation: &str) -> Vec<String> {
        let prefix = format!("{operation}:");
        self.calls()
            .into_iter()
            .filter(|call| call.starts_with(&prefix))
            .collect()
    }

    fn record(&self, call: String) {
        self.state.lock().calls.push(call);
    }
}

#[async_trait]
impl StorageApi for FakeStorageApi {
    async fn get_cluster(&self, cluster_key: &str) -> StorageApiResult<ClusterInfo> {
        self.record(format!("get_cluster:{cluster_key}"));
        Ok(ClusterInfo {
            cluster_id: cluster_key.to_string(),
            name: format!("cluster-{cluster_key}"),
            version: "9.14.1".to_string(),
            health_status: "healthy".to_string(),
            nodes: vec!["node1".to_string(), "node2".to_string()],
        })
    }

    async fn list_aggregates(&self, cluster_key: &str) -> StorageApiResult<Vec<Aggregate>> {
        self.record(format!("list_aggregates:{cluster_key}"));
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
        self.record(format!("find_svm:{cluster_key}:{name}"));
        Ok(self
            .state
            .lock()
            .svms
            .get(&(cluster_key.to_string(), name.to_string()))
            .cloned())
    }

    async fn create_svm(&self, config: &SvmConfig) -> StorageApiResult<SvmCreation> {
        let aggregate = config.aggregate_name.clone().unwrap_or_default();
        self.record(format!("create_svm:{}:{aggregate}", config.name));

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
        self.record(format!("get_job:{job_key}"));
        let mut state = self.state.lock();
        let polls = state.job_polls.entry(job_key.to_string()).or_insert(0);
        *polls += 1;
        if self.unreachable_jobs || self.failing_job_polls.contains(&*polls) {
            return Err(StorageApiError::http(503, "job service unavailable"));
        }

        let (job_state, message) = if self.failing_jobs {
            ("FAILED", Some("Aggregate is offline".to_string()))
        } else if self.stuck_jobs || *polls < 2 {
            ("RUNNING", None)
        } else {
            ("COMPLETED", Some("Job completed successfully".to_string()))
        };
        Ok(JobStatus {
            key: job_key.to_string(),
            state: job_state.to_string(),
            message,
        })
    }

    async fn find_file_share(&self, svm_key: &str, name: &str) -> StorageApiResult<Option<NfsShare>> {
        self.record(format!("find_file_share:{svm_key}:{name}"));
        Ok(self
            .state
            .lock()
            .shares
            .get(&(svm_key.to_string(), name.to_string()))
            .cloned())
    }

    async fn create_file_share(&self, config: &NfsShareConfig) -> StorageApiResult<NfsShare> {
        self.record(format!("create_file_share:{}", config.name));
        if self.rejected_shares.contains(&config.name) {
            return Err(StorageApiError::http(400, format!("path {} is invalid", config.path)));
        }
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
        _metrics: &[String],
    ) -> StorageApiResult<PerformanceMetrics> {
        self.record(format!("get_performance_metrics:{cluster_key}"));
        let call = {
            let mut state = self.state.lock();
            state.metrics_calls += 1;
            state.metrics_calls
        };
        if self.failing_metrics_calls.contains(&call) {
            return Err(StorageApiError::http(400, "metrics endpoint rejected the query"));
        }
        Ok(PerformanceMetrics {
            cluster_key: cluster_key.to_string(),
            timestamp: "2024-01-15T10:30:00Z".to_string(),
            metrics: BTreeMap::from([
                ("cpu_utilization".to_string(), 65.5),
                ("memory_utilization".to_string(), 78.2),
            ]),
        })
    }

    async fn list_events(&self, severity: &str) -> StorageApiResult<Vec<SystemEvent>> {
        self.record(format!("list_events:{severity}"));
        let acknowledged = self.state.lock().acknowledged.clone();
        let state = |key: &str, initial: &str| {
            if acknowledged.contains(key) {
                "acknowledged".to_string()
            } else {
                initial.to_string()
            }
        };
        Ok(vec![
            SystemEvent {
                key: "event-001".to_string(),
                severity: "error".to_string(),
                message: "Volume vol1 is nearly full".to_string(),
                timestamp: "2024-01-15T10:25:00Z".to_string(),
                state: state("event-001", "new"),
            },
            SystemEvent {
                key: "event-002".to_string(),
                severity: "warning".to_string(),
                message: "High CPU utilization on node1".to_string(),
                timestamp: "2024-01-15T10:20:00Z".to_string(),
                state: state("event-002", "acknowledged"),
            },
        ])
    }

    async fn acknowledge_event(&self, event_key: &str) -> StorageApiResult<()> {
        self.record(format!("acknowledge_event:{event_key}"));
        self.state.lock().acknowledged.insert(event_key.to_string());
        Ok(())
    }
}

/// Notifier that keeps every (channel, message) pair
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<(String, String)>>,
}

impl RecordingNotifier {
    pub fn sent(&self) -> Vec<(String, String)> {
        self.sent.lock().clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, channel: &str, message: &str) -> StorageApiResult<()> {
        self.sent
            .lock()
            .push((channel.to_string(), message.to_string()));
        Ok(())
    }
}

/// Memory store whose appends of one event id fail a set number of times
#[derive(Debug)]
pub struct FlakyStore {
    inner: InMemoryHistoryStore,
    event_id: u64,
    failures_left: AtomicU32,
    failed_appends: AtomicU32,
}

impl FlakyStore {
    pub fn failing(event_id: u64, times: u32) -> Self {
        Self {
            inner: InMemoryHistoryStore::new(),
            event_id,
            failures_left: AtomicU32::new(times),
            failed_appends: AtomicU32::new(0),
        }
    }

    pub fn failed_appends(&self) -> u32 {
        self.failed_appends.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl HistoryStore for FlakyStore {
    async fn append(&self, workflow_id: &str, event: &HistoryEvent) -> HistoryResult<()> {
        let fails = event.event_id == self.event_id
            && self
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
                .is_ok();
        if fails {
            self.failed_appends.fetch_add(1, Ordering::SeqCst);
            return Err(HistoryError::Io {
                operation: "append",
                workflow_id: workflow_id.to_string(),
                source: std::io::Error::new(std::io::ErrorKind::Other, "disk unavailable"),
            });
        }
        self.inner.append(workflow_id, event).await
    }

    async fn read_all(&self, workflow_id: &str) -> HistoryResult<Vec<HistoryEvent>> {
        self.inner.read_all(workflow_id).await
    }

    async fn list_instances(&self) -> HistoryResult<Vec<String>> {
        self.inner.list_instances().await
    }

    async fn archive(&self, workflow_id: &str) -> HistoryResult<u32> {
        self.inner.archive(workflow_id).await
    }

    async fn read_archived(&self, workflow_id: &str, run: u32) -> HistoryResult<Vec<HistoryEvent>> {
        self.inner.read_archived(workflow_id, run).await
    }
}

/// Builder with the storage workflows and activities wired to the fakes
pub fn storage_builder(
    api: &Arc<FakeStorageApi>,
    notifier: &Arc<RecordingNotifier>,
) -> WorkflowRuntimeBuilder {
    storage::register(
        WorkflowRuntime::builder(),
        Arc::clone(api) as Arc<dyn StorageApi>,
        Arc::clone(notifier) as Arc<dyn Notifier>,
        &JobWaitConfig::default(),
    )
}

pub fn storage_runtime(api: &Arc<FakeStorageApi>, notifier: &Arc<RecordingNotifier>) -> WorkflowRuntime {
    storage_builder(api, notifier).build()
}

pub fn storage_runtime_with_store(
    api: &Arc<FakeStorageApi>,
    notifier: &Arc<RecordingNotifier>,
    store: &Arc<dyn HistoryStore>,
) -> WorkflowRuntime {
    storage_builder(api, notifier)
        .history_store(Arc::clone(store))
        .build()
}

/// Poll `describe` until `condition` holds, failing after a bounded number of checks
pub async fn wait_for_snapshot<F>(runtime: &WorkflowRuntime, workflow_id: &str, condition: F) -> WorkflowSnapshot
where
    F: Fn(&WorkflowSnapshot) -> bool,
{
    for _ in 0..10_000 {
        if let Ok(snapshot) = runtime.describe(workflow_id) {
            if condition(&snapshot) {
                return snapshot;
            }
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    panic!("condition on {workflow_id} never held");
}
