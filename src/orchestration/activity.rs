//! # Activities
//!
//! An activity is one unit of non-deterministic work (a REST call, a job wait,
//! a notification). Activities are invoked at least once per scheduled step and
//! must tolerate being invoked again for the same step.

use super::retry_policy::RetryPolicy;
use crate::constants::defaults;
use crate::error::ActivityError;
use crate::utils::serde::duration_millis;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Per-call scheduling options, recorded in history with the call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityOptions {
    #[serde(with = "duration_millis")]
    pub start_to_close_timeout: Duration,
    pub retry_policy: RetryPolicy,
}

impl Default for ActivityOptions {
    fn default() -> Self {
        Self {
            start_to_close_timeout: defaults::START_TO_CLOSE_TIMEOUT,
            retry_policy: RetryPolicy::default(),
        }
    }
}

impl ActivityOptions {
    pub fn new(start_to_close_timeout: Duration) -> Self {
        Self {
            start_to_close_timeout,
            ..Default::default()
        }
    }

    pub fn with_retry_policy(mut self, retry_policy: RetryPolicy) -> Self {
        self.retry_policy = retry_policy;
        self
    }
}

/// Information about the attempt being executed
#[derive(Debug, Clone)]
pub struct ActivityContext {
    pub workflow_id: String,
    pub activity_id: String,
    pub activity_type: String,
    /// 1-based attempt number
    pub attempt: u32,
}

/// A named unit of retryable external work
#[async_trait]
pub trait Activity: Send + Sync + 'static {
    /// Name recorded in history and used for dispatch
    const ACTIVITY_TYPE: &'static str;

    type Input: Serialize + DeserializeOwned + Send + 'static;
    type Output: Serialize + DeserializeOwned + Send + 'static;

    async fn execute(
        &self,
        ctx: ActivityContext,
        input: Self::Input,
    ) -> Result<Self::Output, ActivityError>;
}

/// Object-safe form of [`Activity`] operating on JSON payloads
#[async_trait]
pub trait ErasedActivity: Send + Sync {
    fn activity_type(&self) -> &'static str;

    async fn execute_json(&self, ctx: ActivityContext, input: Value) -> Result<Value, ActivityError>;
}

struct ActivityAdapter<A>(A);

#[async_trait]
impl<A: Activity> ErasedActivity for ActivityAdapter<A> {
    fn activity_type(&self) -> &'static str {
        A::ACTIVITY_TYPE
    }

    async fn execute_json(&self, ctx: ActivityContext, input: Value) -> Result<Value, ActivityError> {
        let input: A::Input = serde_json::from_value(input)
            .map_err(|e| ActivityError::InvalidInput(format!("{}: {e}", A::ACTIVITY_TYPE)))?;
        let output = self.0.execute(ctx, input).await?;
        serde_json::to_value(output)
            .map_err(|e| ActivityError::NonRetryable(format!("output serialization failed: {e}")))
    }
}

/// Activity implementations by type name
#[derive(Default, Clone)]
pub struct ActivityRegistry {
    activities: HashMap<String, Arc<dyn ErasedActivity>>,
}

impl ActivityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an activity, replacing any previous implementation of the same type
    pub fn register<A: Activity>(&mut self, activity: A) -> &mut Self {
        self.activities
            .insert(A::ACTIVITY_TYPE.to_string(), Arc::new(ActivityAdapter(activity)));
        self
    }

    pub fn get(&self, activity_type: &str) -> Option<Arc<dyn ErasedActivity>> {
        self.activities.get(activity_type).cloned()
    }

    pub fn contains(&self, activity_type: &str) -> bool {
        self.activities.contains_key(activity_type)
    }

    pub fn activity_types(&self) -> Vec<&str> {
        let mut types: Vec<&str> = self.activities.keys().map(String::as_str).collect();
        types.sort_unstable();
        types
    }

    pub fn len(&self) -> usize {
        self.activities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.activities.is_empty()
    }
}

impl fmt::Debug for ActivityRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActivityRegistry")
            .field("activity_types", &self.activity_types())
            .finish()
    }
}
