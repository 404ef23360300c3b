//! # Workflow Definitions and Catalog
//!
//! A workflow is a deterministic coordination function. It receives a
//! [`WorkflowContext`] and its input and may only reach the outside world
//! through the context (activities, timers, child workflows, signals). The
//! catalog maps workflow type names to definitions for the dispatcher.

use super::context::WorkflowContext;
use crate::error::{WorkflowError, WorkflowResult};
use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// A registered coordination function
#[async_trait]
pub trait Workflow: Send + Sync + 'static {
    /// Name recorded in history and used for dispatch
    const WORKFLOW_TYPE: &'static str;

    type Input: Serialize + DeserializeOwned + Send + 'static;
    type Output: Serialize + DeserializeOwned + Send + 'static;

    async fn run(&self, ctx: WorkflowContext, input: Self::Input) -> WorkflowResult<Self::Output>;
}

/// Object-safe form of [`Workflow`] operating on JSON payloads
pub trait ErasedWorkflow: Send + Sync {
    fn workflow_type(&self) -> &'static str;

    /// Run the function on JSON payloads. The future owns the definition so
    /// it can stay suspended inside its instance between turns.
    fn run_json(self: Arc<Self>, ctx: WorkflowContext, input: Value) -> BoxFuture<'static, WorkflowResult<Value>>;
}

struct WorkflowAdapter<W>(W);

impl<W: Workflow> ErasedWorkflow for WorkflowAdapter<W> {
    fn workflow_type(&self) -> &'static str {
        W::WORKFLOW_TYPE
    }

    fn run_json(self: Arc<Self>, ctx: WorkflowContext, input: Value) -> BoxFuture<'static, WorkflowResult<Value>> {
        async move {
            let input: W::Input = serde_json::from_value(input)
                .map_err(|e| WorkflowError::payload("invalid workflow input", e))?;
            let output = self.0.run(ctx, input).await?;
            serde_json::to_value(output)
                .map_err(|e| WorkflowError::payload("workflow output serialization failed", e))
        }
        .boxed()
    }
}

/// Registered workflow definitions by type name
#[derive(Default, Clone)]
pub struct WorkflowCatalog {
    workflows: HashMap<String, Arc<dyn ErasedWorkflow>>,
}

impl WorkflowCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a workflow, replacing any previous definition of the same type
    pub fn register<W: Workflow>(&mut self, workflow: W) -> &mut Self {
        self.workflows
            .insert(W::WORKFLOW_TYPE.to_string(), Arc::new(WorkflowAdapter(workflow)));
        self
    }

    pub fn get(&self, workflow_type: &str) -> Option<Arc<dyn ErasedWorkflow>> {
        self.workflows.get(workflow_type).cloned()
    }

    pub fn contains(&self, workflow_type: &str) -> bool {
        self.workflows.contains_key(workflow_type)
    }

    pub fn workflow_types(&self) -> Vec<&str> {
        let mut types: Vec<&str> = self.workflows.keys().map(String::as_str).collect();
        types.sort_unstable();
        types
    }

    pub fn len(&self) -> usize {
        self.workflows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workflows.is_empty()
    }
}

impl fmt::Debug for WorkflowCatalog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkflowCatalog")
            .field("workflow_types", &self.workflow_types())
            .finish()
    }
}
