use super::{NfsShareProvisioningWorkflow, SvmCreationWorkflow};
use crate::constants::workflow_types;
use crate::error::WorkflowResult;
use crate::orchestration::{Workflow, WorkflowContext};
use crate::storage::types::{
    ComprehensiveProvisioningRequest, ComprehensiveProvisioningResult, ShareOutcome,
};
use async_trait::async_trait;
use std::time::Duration;

/// SVM creation followed by one share provisioning child per requested share.
///
/// A failed SVM child fails the whole run. A failed share child is reported in
/// the result and the remaining shares are still provisioned.
#[derive(Debug, Clone, Default)]
pub struct ComprehensiveStorageProvisioningWorkflow;

impl ComprehensiveStorageProvisioningWorkflow {
    /// Time given to a new SVM before shares are attached
    pub const SVM_SETTLE_DELAY: Duration = Duration::from_secs(30);

    pub fn svm_child_id(svm_name: &str) -> String {
        format!("svm-creation-{svm_name}")
    }

    pub fn share_child_id(svm_name: &str, share_name: &str) -> String {
        format!("nfs-share-{svm_name}-{share_name}")
    }
}

#[async_trait]
impl Workflow for ComprehensiveStorageProvisioningWorkflow {
    const WORKFLOW_TYPE: &'static str = workflow_types::COMPREHENSIVE_STORAGE_PROVISIONING;
    type Input = ComprehensiveProvisioningRequest;
    type Output = ComprehensiveProvisioningResult;

    async fn run(
        &self,
        ctx: WorkflowContext,
        request: ComprehensiveProvisioningRequest,
    ) -> WorkflowResult<ComprehensiveProvisioningResult> {
        let svm_name = request.svm_config.name.clone();
        workflow_info!(ctx, svm_name = %svm_name, shares = request.share_configs.len(), "Starting comprehensive storage provisioning");

        let svm_result = ctx
            .start_child::<SvmCreationWorkflow>(Self::svm_child_id(&svm_name), &request.svm_config)
            .result()
            .await?;

        ctx.sleep(Self::SVM_SETTLE_DELAY).await;

        let mut share_results = Vec::with_capacity(request.share_configs.len());
        for mut share_config in request.share_configs {
            share_config.svm_key = svm_result.svm_key.clone();
            let child_id = Self::share_child_id(&svm_name, &share_config.name);

            let outcome = ctx
                .start_child::<NfsShareProvisioningWorkflow>(child_id.clone(), &share_config)
                .result()
                .await;

            share_results.push(match outcome {
                Ok(result) => ShareOutcome {
                    share_name: share_config.name,
                    child_id,
                    status: result.status.clone(),
                    result: Some(result),
                    error: None,
                },
                Err(e) => {
                    workflow_warn!(ctx, child_id = %child_id, error = %e, "Share provisioning failed, continuing");
                    ShareOutcome {
                        share_name: share_config.name,
                        child_id,
                        status: "failed".to_string(),
                        result: None,
                        error: Some(e.failure_chain().join(": ")),
                    }
                }
            });
        }

        let total_shares_created = share_results.iter().filter(|s| s.succeeded()).count();
        let failed_shares = share_results.len() - total_shares_created;
        let status = if failed_shares == 0 {
            "completed"
        } else {
            "partially_completed"
        };

        Ok(ComprehensiveProvisioningResult {
            svm_result,
            share_results,
            total_shares_created,
            failed_shares,
            status: status.to_string(),
        })
    }
}
