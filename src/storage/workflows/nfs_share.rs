use crate::constants::workflow_types;
use crate::error::WorkflowResult;
use crate::orchestration::{ActivityOptions, RetryPolicy, Workflow, WorkflowContext};
use crate::storage::activities::CreateNfsShare;
use crate::storage::types::{NfsShareConfig, NfsShareResult};
use async_trait::async_trait;
use std::time::Duration;

/// Create an NFS share and give it time to become available
#[derive(Debug, Clone, Default)]
pub struct NfsShareProvisioningWorkflow;

impl NfsShareProvisioningWorkflow {
    pub const SETTLE_DELAY: Duration = Duration::from_secs(10);
}

#[async_trait]
impl Workflow for NfsShareProvisioningWorkflow {
    const WORKFLOW_TYPE: &'static str = workflow_types::NFS_SHARE_PROVISIONING;
    type Input = NfsShareConfig;
    type Output = NfsShareResult;

    async fn run(&self, ctx: WorkflowContext, config: NfsShareConfig) -> WorkflowResult<NfsShareResult> {
        workflow_info!(ctx, share_name = %config.name, svm_key = %config.svm_key, "Starting NFS share provisioning");

        let options = ActivityOptions::new(Duration::from_secs(5 * 60)).with_retry_policy(
            RetryPolicy::new(Duration::from_secs(2), Duration::from_secs(30), 3),
        );
        let share = ctx.execute_activity::<CreateNfsShare>(&config, options).await?;

        ctx.sleep(Self::SETTLE_DELAY).await;

        Ok(NfsShareResult {
            share_name: config.name,
            share_details: share,
            status: "provisioned".to_string(),
        })
    }
}
