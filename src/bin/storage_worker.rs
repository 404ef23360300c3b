//! # Storage Worker
//!
//! Runs the storage workflows against the configured history store. On boot it
//! recovers every instance found in history, then starts the workflows listed
//! under `worker.startup_workflows`. Ctrl+C or SIGTERM stops dispatching and
//! waits for the instance actors within the grace period.

use anyhow::{Context, Result};
use std::sync::Arc;
use storage_workflows::config::ConfigManager;
use storage_workflows::error::EngineError;
use storage_workflows::history::store_from_config;
use storage_workflows::logging::init_structured_logging_with_level;
use storage_workflows::storage::{self, LogNotifier, SimulatedStorageApi};
use storage_workflows::{StartWorkflowOptions, WorkflowRuntimeBuilder};
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    let manager = ConfigManager::load().context("failed to load worker configuration")?;
    let config = manager.config();
    init_structured_logging_with_level(config.logging.level.as_deref());

    info!(
        environment = %manager.environment(),
        task_queue = %config.worker.task_queue,
        history_backend = ?config.history.backend,
        "🚀 Starting storage worker"
    );

    let store = store_from_config(&config.history)
        .await
        .context("failed to open history store")?;

    let runtime = storage::register(
        WorkflowRuntimeBuilder::from_config(config),
        Arc::new(SimulatedStorageApi::default()),
        Arc::new(LogNotifier),
        &config.job_wait,
    )
    .history_store(store)
    .build();

    let report = runtime.recover().await.context("recovery failed")?;
    if !report.skipped.is_empty() {
        warn!(skipped = ?report.skipped, "Some stored instances could not be resumed");
    }

    for startup in &config.worker.startup_workflows {
        let options = StartWorkflowOptions {
            workflow_id: startup.workflow_id.clone(),
            ..Default::default()
        };
        match runtime
            .start_workflow(&startup.workflow_type, startup.input.clone(), options)
            .await
        {
            Ok(workflow_id) => info!(workflow_id = %workflow_id, "Started startup workflow"),
            Err(EngineError::DuplicateInstance(workflow_id)) => {
                info!(workflow_id = %workflow_id, "Startup workflow already exists, leaving it to recovery")
            }
            Err(e) => {
                return Err(e).with_context(|| {
                    format!("failed to start startup workflow {}", startup.workflow_type)
                })
            }
        }
    }

    info!("🔄 Worker running... Press Ctrl+C to shutdown gracefully");

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("🛑 Received Ctrl+C, initiating graceful shutdown...");
        }
        result = wait_for_sigterm() => {
            match result {
                Ok(_) => info!("🛑 Received SIGTERM, initiating graceful shutdown..."),
                Err(e) => warn!("⚠️  Error setting up SIGTERM handler: {}", e),
            }
        }
    }

    runtime
        .shutdown(config.worker.shutdown_grace_period())
        .await;
    info!("✅ Worker shutdown complete");

    Ok(())
}

/// Wait for SIGTERM signal (for container deployments)
#[cfg(unix)]
async fn wait_for_sigterm() -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigterm = signal(SignalKind::terminate())?;
    sigterm.recv().await;
    Ok(())
}

#[cfg(not(unix))]
async fn wait_for_sigterm() -> Result<()> {
    std::future::pending::<()>().await;
    Ok(())
}
