//! # Activity Invoker
//!
//! Executes one scheduled activity to a final outcome: every attempt runs under
//! the start-to-close timeout on a bounded worker pool, failures are retried per
//! the call's [`RetryPolicy`](super::retry_policy::RetryPolicy), and the caller
//! receives either the result or a [`TerminalFailure`].
//!
//! The invoker provides at-least-once execution. A crash between an attempt's
//! side effect and the recorded result means the attempt will run again after
//! recovery, so activities are written to be idempotent.
//!
//! Status transitions of the invocation (`Scheduled → Started → Completed`,
//! `Failed | TimedOut → RetryScheduled → Started`) are reported to the caller
//! through a callback so the owning instance can expose them.

use super::activity::{ActivityContext, ActivityOptions, ActivityRegistry};
use super::retry_policy::RetryDecision;
use crate::error::ActivityError;
use crate::logging::log_activity_operation;
use crate::state_machine::ActivityStatus;
use futures::FutureExt;
use serde_json::Value;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::time::{sleep, timeout};
use tracing::{debug, instrument, warn};

/// One scheduled activity call
#[derive(Debug, Clone)]
pub struct ActivityRequest {
    pub workflow_id: String,
    pub activity_id: String,
    pub activity_type: String,
    pub input: Value,
    pub options: ActivityOptions,
}

/// Status change reported while an invocation progresses
#[derive(Debug, Clone, PartialEq)]
pub struct ActivityUpdate {
    pub activity_id: String,
    pub attempt: u32,
    pub status: ActivityStatus,
    pub error: Option<String>,
    pub retry_delay: Option<Duration>,
}

/// Successful invocation
#[derive(Debug, Clone, PartialEq)]
pub struct ActivityCompletion {
    pub result: Value,
    pub attempts: u32,
}

/// Retries exhausted or a non-retryable error
#[derive(Debug, Clone, PartialEq)]
pub struct TerminalFailure {
    pub last_error: ActivityError,
    pub attempts: u32,
}

pub type InvocationResult = Result<ActivityCompletion, TerminalFailure>;

/// Runs activities on a bounded pool with timeout and retry
#[derive(Debug, Clone)]
pub struct ActivityInvoker {
    registry: Arc<ActivityRegistry>,
    worker_slots: Arc<Semaphore>,
    max_concurrent: usize,
}

impl ActivityInvoker {
    pub fn new(registry: Arc<ActivityRegistry>, max_concurrent: usize) -> Self {
        let max_concurrent = max_concurrent.max(1);
        Self {
            registry,
            worker_slots: Arc::new(Semaphore::new(max_concurrent)),
            max_concurrent,
        }
    }

    pub fn registry(&self) -> &ActivityRegistry {
        &self.registry
    }

    /// Attempts currently executing
    pub fn busy_slots(&self) -> usize {
        self.max_concurrent - self.worker_slots.available_permits()
    }

    /// Stop handing out worker slots; attempts waiting for one fail
    pub fn close(&self) {
        self.worker_slots.close();
    }

    /// Invoke an activity until it succeeds or fails terminally
    #[instrument(skip(self, request, on_update), fields(
        workflow_id = %request.workflow_id,
        activity_id = %request.activity_id,
        activity_type = %request.activity_type
    ))]
    pub async fn invoke<F>(&self, request: ActivityRequest, mut on_update: F) -> InvocationResult
    where
        F: FnMut(ActivityUpdate) + Send,
    {
        let Some(activity) = self.registry.get(&request.activity_type) else {
            warn!("No activity registered for type");
            return Err(TerminalFailure {
                last_error: ActivityError::NotRegistered(request.activity_type.clone()),
                attempts: 0,
            });
        };

        let policy = &request.options.retry_policy;
        let start_to_close = request.options.start_to_close_timeout;
        let mut attempt: u32 = 1;

        loop {
            // Phase 1: acquire a worker slot for this attempt only
            let permit = match self.worker_slots.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => {
                    return Err(TerminalFailure {
                        last_error: ActivityError::non_retryable("activity worker pool is closed"),
                        attempts: attempt.saturating_sub(1),
                    })
                }
            };

            // Phase 2: run the attempt under its timeout, isolating panics
            on_update(update(&request, attempt, ActivityStatus::Started, None, None));
            log_activity_operation(
                "attempt",
                &request.workflow_id,
                &request.activity_id,
                &request.activity_type,
                attempt,
                "started",
                None,
            );

            let ctx = ActivityContext {
                workflow_id: request.workflow_id.clone(),
                activity_id: request.activity_id.clone(),
                activity_type: request.activity_type.clone(),
                attempt,
            };
            let execution = AssertUnwindSafe(activity.execute_json(ctx, request.input.clone()))
                .catch_unwind();
            let outcome = match timeout(start_to_close, execution).await {
                Ok(Ok(result)) => result,
                Ok(Err(panic)) => Err(ActivityError::retryable(format!(
                    "activity panicked: {}",
                    panic_message(&panic)
                ))),
                Err(_) => Err(ActivityError::AttemptTimedOut(start_to_close)),
            };
            drop(permit);

            // Phase 3: resolve or schedule the next attempt
            let error = match outcome {
                Ok(result) => {
                    on_update(update(&request, attempt, ActivityStatus::Completed, None, None));
                    debug!(attempt, "Activity completed");
                    return Ok(ActivityCompletion {
                        result,
                        attempts: attempt,
                    });
                }
                Err(error) => error,
            };

            let status = if matches!(error, ActivityError::AttemptTimedOut(_)) {
                ActivityStatus::TimedOut
            } else {
                ActivityStatus::Failed
            };
            on_update(update(&request, attempt, status, Some(error.to_string()), None));
            log_activity_operation(
                "attempt",
                &request.workflow_id,
                &request.activity_id,
                &request.activity_type,
                attempt,
                &status.to_string(),
                Some(&error.to_string()),
            );

            if !error.is_retryable() {
                return Err(TerminalFailure {
                    last_error: error,
                    attempts: attempt,
                });
            }

            match policy.next_retry(attempt) {
                RetryDecision::Stop => {
                    warn!(attempts = attempt, error = %error, "Activity retries exhausted");
                    return Err(TerminalFailure {
                        last_error: error,
                        attempts: attempt,
                    });
                }
                RetryDecision::Retry {
                    delay,
                    next_attempt,
                } => {
                    on_update(update(
                        &request,
                        attempt,
                        ActivityStatus::RetryScheduled,
                        Some(error.to_string()),
                        Some(delay),
                    ));
                    debug!(attempt, next_attempt, delay_ms = delay.as_millis() as u64, "Retry scheduled");
                    sleep(delay).await;
                    attempt = next_attempt;
                }
            }
        }
    }
}

fn update(
    request: &ActivityRequest,
    attempt: u32,
    status: ActivityStatus,
    error: Option<String>,
    retry_delay: Option<Duration>,
) -> ActivityUpdate {
    ActivityUpdate {
        activity_id: request.activity_id.clone(),
        attempt,
        status,
        error,
        retry_delay,
    }
}

fn panic_message(panic: &Box<dyn Any + Send>) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestration::activity::Activity;
    use crate::orchestration::retry_policy::RetryPolicy;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct AlwaysFails {
        calls: Arc<AtomicU32>,
    }

    #[async_trait]
    impl Activity for AlwaysFails {
        const ACTIVITY_TYPE: &'static str = "always_fails";
        type Input = ();
        type Output = ();

        async fn execute(&self, _ctx: ActivityContext, _input: ()) -> Result<(), ActivityError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(ActivityError::retryable("HTTP 503"))
        }
    }

    struct Hangs;

    #[async_trait]
    impl Activity for Hangs {
        const ACTIVITY_TYPE: &'static str = "hangs";
        type Input = ();
        type Output = ();

        async fn execute(&self, _ctx: ActivityContext, _input: ()) -> Result<(), ActivityError> {
            sleep(Duration::from_secs(3600)).await;
            Ok(())
        }
    }

    struct Rejects {
        calls: Arc<AtomicU32>,
    }

    #[async_trait]
    impl Activity for Rejects {
        const ACTIVITY_TYPE: &'static str = "rejects";
        type Input = ();
        type Output = ();

        async fn execute(&self, _ctx: ActivityContext, _input: ()) -> Result<(), ActivityError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(ActivityError::non_retryable("HTTP 400"))
        }
    }

    struct Panics;

    #[async_trait]
    impl Activity for Panics {
        const ACTIVITY_TYPE: &'static str = "panics";
        type Input = ();
        type Output = ();

        async fn execute(&self, _ctx: ActivityContext, _input: ()) -> Result<(), ActivityError> {
            panic!("bad state");
        }
    }

    fn request(activity_type: &str, options: ActivityOptions) -> ActivityRequest {
        ActivityRequest {
            workflow_id: "wf-1".to_string(),
            activity_id: format!("{activity_type}#1"),
            activity_type: activity_type.to_string(),
            input: Value::Null,
            options,
        }
    }

    fn three_attempts() -> ActivityOptions {
        ActivityOptions::new(Duration::from_secs(30)).with_retry_policy(RetryPolicy::new(
            Duration::from_secs(1),
            Duration::from_secs(60),
            3,
        ))
    }

    #[tokio::test(start_paused = true)]
    async fn test_three_attempts_then_terminal_failure() {
        let calls = Arc::new(AtomicU32::new(0));
        let mut registry = ActivityRegistry::new();
        registry.register(AlwaysFails {
            calls: calls.clone(),
        });
        let invoker = ActivityInvoker::new(Arc::new(registry), 4);

        let mut updates = Vec::new();
        let started = tokio::time::Instant::now();
        let failure = invoker
            .invoke(request("always_fails", three_attempts()), |u| updates.push(u))
            .await
            .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(failure.attempts, 3);
        assert_eq!(failure.last_error, ActivityError::retryable("HTTP 503"));
        // 1s + 2s of backoff between the three attempts
        assert!(started.elapsed() >= Duration::from_secs(3));
        assert!(started.elapsed() < Duration::from_secs(4));

        let statuses: Vec<ActivityStatus> = updates.iter().map(|u| u.status).collect();
        assert_eq!(
            statuses,
            vec![
                ActivityStatus::Started,
                ActivityStatus::Failed,
                ActivityStatus::RetryScheduled,
                ActivityStatus::Started,
                ActivityStatus::Failed,
                ActivityStatus::RetryScheduled,
                ActivityStatus::Started,
                ActivityStatus::Failed,
            ]
        );
        assert_eq!(updates[2].retry_delay, Some(Duration::from_secs(1)));
        assert_eq!(updates[5].retry_delay, Some(Duration::from_secs(2)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_attempt_timeout_counts_as_failure() {
        let mut registry = ActivityRegistry::new();
        registry.register(Hangs);
        let invoker = ActivityInvoker::new(Arc::new(registry), 4);

        let options = ActivityOptions::new(Duration::from_secs(10)).with_retry_policy(
            RetryPolicy::new(Duration::from_secs(1), Duration::from_secs(1), 2),
        );
        let mut statuses = Vec::new();
        let failure = invoker
            .invoke(request("hangs", options), |u| statuses.push(u.status))
            .await
            .unwrap_err();

        assert_eq!(failure.attempts, 2);
        assert_eq!(
            failure.last_error,
            ActivityError::AttemptTimedOut(Duration::from_secs(10))
        );
        assert!(statuses.contains(&ActivityStatus::TimedOut));
        assert_eq!(invoker.busy_slots(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_retryable_error_stops_immediately() {
        let calls = Arc::new(AtomicU32::new(0));
        let mut registry = ActivityRegistry::new();
        registry.register(Rejects {
            calls: calls.clone(),
        });
        let invoker = ActivityInvoker::new(Arc::new(registry), 1);

        let failure = invoker
            .invoke(request("rejects", three_attempts()), |_| {})
            .await
            .unwrap_err();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(failure.attempts, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_panic_is_contained_as_attempt_failure() {
        let mut registry = ActivityRegistry::new();
        registry.register(Panics);
        let invoker = ActivityInvoker::new(Arc::new(registry), 1);

        let options = ActivityOptions::default().with_retry_policy(RetryPolicy::no_retries());
        let failure = invoker
            .invoke(request("panics", options), |_| {})
            .await
            .unwrap_err();
        assert!(failure.last_error.to_string().contains("bad state"));
    }

    #[tokio::test]
    async fn test_unknown_activity_type() {
        let invoker = ActivityInvoker::new(Arc::new(ActivityRegistry::new()), 1);
        let failure = invoker
            .invoke(request("missing", ActivityOptions::default()), |_| {})
            .await
            .unwrap_err();
        assert_eq!(failure.attempts, 0);
        assert!(matches!(failure.last_error, ActivityError::NotRegistered(_)));
    }
}
