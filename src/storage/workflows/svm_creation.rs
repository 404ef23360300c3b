use crate::constants::{job_states, workflow_types};
use crate::error::{WorkflowError, WorkflowResult};
use crate::orchestration::{ActivityOptions, RetryPolicy, Workflow, WorkflowContext};
use crate::storage::activities::{CreateSvm, GetAvailableAggregates, ValidateClusterHealth, WaitForJob};
use crate::storage::types::{Aggregate, JobStatus, SvmConfig, SvmCreationResult, WaitForJobRequest};
use async_trait::async_trait;
use std::time::Duration;

/// Validate the cluster, place the SVM on the roomiest aggregate, create it and
/// wait for the creation job.
#[derive(Debug, Clone, Default)]
pub struct SvmCreationWorkflow;

impl SvmCreationWorkflow {
    /// How long the creation job may run before the wait gives up
    pub const JOB_TIMEOUT: Duration = Duration::from_secs(30 * 60);

    fn retry_policy() -> RetryPolicy {
        RetryPolicy::new(Duration::from_secs(1), Duration::from_secs(60), 3)
    }

    fn options(timeout: Duration) -> ActivityOptions {
        ActivityOptions::new(timeout).with_retry_policy(Self::retry_policy())
    }
}

/// Online aggregate with the most available space
pub fn select_aggregate(aggregates: &[Aggregate]) -> Option<&Aggregate> {
    aggregates
        .iter()
        .filter(|aggregate| aggregate.is_online())
        .max_by_key(|aggregate| aggregate.available_size)
}

#[async_trait]
impl Workflow for SvmCreationWorkflow {
    const WORKFLOW_TYPE: &'static str = workflow_types::SVM_CREATION;
    type Input = SvmConfig;
    type Output = SvmCreationResult;

    async fn run(&self, ctx: WorkflowContext, mut config: SvmConfig) -> WorkflowResult<SvmCreationResult> {
        workflow_info!(ctx, svm_name = %config.name, cluster_key = %config.cluster_key, "Starting SVM creation");

        let cluster_info = ctx
            .execute_activity::<ValidateClusterHealth>(
                &config.cluster_key,
                Self::options(Duration::from_secs(30)),
            )
            .await?;

        let aggregates = ctx
            .execute_activity::<GetAvailableAggregates>(
                &config.cluster_key,
                Self::options(Duration::from_secs(30)),
            )
            .await?;

        let aggregate = select_aggregate(&aggregates).cloned().ok_or_else(|| {
            WorkflowError::application(format!(
                "No online aggregate available on cluster {}",
                config.cluster_key
            ))
        })?;
        config.aggregate_name = Some(aggregate.name.clone());
        workflow_info!(ctx, aggregate = %aggregate.name, available_size = aggregate.available_size, "Selected aggregate");

        let creation = ctx
            .execute_activity::<CreateSvm>(&config, Self::options(Duration::from_secs(120)))
            .await?;

        let job_result = match creation.job {
            Some(job) => {
                ctx.execute_activity::<WaitForJob>(
                    &WaitForJobRequest {
                        job_key: job.uuid,
                        timeout: Self::JOB_TIMEOUT,
                    },
                    Self::options(Duration::from_secs(35 * 60)),
                )
                .await?
            }
            None => JobStatus {
                key: String::new(),
                state: job_states::COMPLETED.to_string(),
                message: Some(format!("SVM {} already exists", config.name)),
            },
        };

        workflow_info!(ctx, svm_key = %creation.svm_key, "SVM creation completed");
        Ok(SvmCreationResult {
            svm_name: config.name,
            svm_key: creation.svm_key,
            cluster_info,
            aggregate_used: aggregate,
            job_result,
            status: "completed".to_string(),
        })
    }
}
