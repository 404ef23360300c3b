use crate::constants::workflow_types;
use crate::error::WorkflowResult;
use crate::orchestration::{ActivityOptions, RetryPolicy, Workflow, WorkflowContext};
use crate::storage::activities::{CheckAlertThresholds, GetPerformanceMetrics, SendNotification};
use crate::storage::types::{
    MetricsRequest, MonitoringConfig, MonitoringSummary, Notification, ThresholdCheck,
};
use async_trait::async_trait;
use std::time::Duration;

/// Poll cluster metrics on an interval and alert on threshold violations.
///
/// A failing cycle is logged and followed by the shorter error backoff; it never
/// ends the loop. Without `max_iterations` the workflow runs until canceled.
#[derive(Debug, Clone, Default)]
pub struct PerformanceMonitoringWorkflow;

impl PerformanceMonitoringWorkflow {
    fn retry_policy() -> RetryPolicy {
        RetryPolicy::new(Duration::from_secs(5), Duration::from_secs(120), 5)
    }

    /// One pass over every cluster; returns the number of alerts sent
    async fn run_cycle(ctx: &WorkflowContext, config: &MonitoringConfig) -> WorkflowResult<u32> {
        let mut alerts_sent = 0;

        for cluster_key in &config.cluster_keys {
            let metrics = ctx
                .execute_activity::<GetPerformanceMetrics>(
                    &MetricsRequest {
                        cluster_key: cluster_key.clone(),
                        metrics: config.metrics.clone(),
                    },
                    ActivityOptions::new(Duration::from_secs(30))
                        .with_retry_policy(Self::retry_policy()),
                )
                .await?;

            let alerts = ctx
                .execute_activity::<CheckAlertThresholds>(
                    &ThresholdCheck {
                        metrics,
                        thresholds: config.alert_thresholds.clone(),
                    },
                    ActivityOptions::new(Duration::from_secs(10)),
                )
                .await?;

            for alert in alerts {
                ctx.execute_activity::<SendNotification>(
                    &Notification {
                        message: alert,
                        channels: config.notification_channels.clone(),
                    },
                    ActivityOptions::new(Duration::from_secs(15))
                        .with_retry_policy(Self::retry_policy()),
                )
                .await?;
                alerts_sent += 1;
            }
        }

        Ok(alerts_sent)
    }
}

#[async_trait]
impl Workflow for PerformanceMonitoringWorkflow {
    const WORKFLOW_TYPE: &'static str = workflow_types::PERFORMANCE_MONITORING;
    type Input = MonitoringConfig;
    type Output = MonitoringSummary;

    async fn run(&self, ctx: WorkflowContext, config: MonitoringConfig) -> WorkflowResult<MonitoringSummary> {
        workflow_info!(ctx, clusters = config.cluster_keys.len(), "Starting performance monitoring");

        let mut summary = MonitoringSummary {
            iterations: 0,
            failed_iterations: 0,
            alerts_sent: 0,
            status: "running".to_string(),
        };

        loop {
            summary.iterations += 1;
            let delay = match Self::run_cycle(&ctx, &config).await {
                Ok(alerts_sent) => {
                    summary.alerts_sent += alerts_sent;
                    config.interval
                }
                Err(e) => {
                    summary.failed_iterations += 1;
                    workflow_error!(ctx, iteration = summary.iterations, error = %e, "Error in monitoring cycle");
                    config.error_backoff
                }
            };

            if config
                .max_iterations
                .is_some_and(|max| summary.iterations >= max)
            {
                break;
            }
            ctx.sleep(delay).await;
        }

        summary.status = "completed".to_string();
        Ok(summary)
    }
}
