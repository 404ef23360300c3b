//! # Timer Service
//!
//! Arms durable timers on the runtime clock. A timer is recorded in history
//! before it is armed (`TimerStarted` with its absolute `fire_at`), so after a
//! restart it is re-armed for the time remaining. Timers never fail; the only
//! way to stop one is cancellation by its owning instance.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::debug;

/// Identifies a timer: owning instance plus suspension point
pub type TimerKey = (String, u64);

/// Tracks armed timers so their owners can cancel them
#[derive(Debug, Clone, Default)]
pub struct TimerService {
    armed: Arc<DashMap<TimerKey, JoinHandle<()>>>,
}

impl TimerService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm a timer; `on_fire` runs once after `fire_after` unless canceled first
    pub fn start<F>(&self, workflow_id: &str, seq: u64, fire_after: Duration, on_fire: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let key: TimerKey = (workflow_id.to_string(), seq);
        let armed = Arc::clone(&self.armed);
        let task_key = key.clone();

        // Hold the entry lock so the task cannot remove itself before it is inserted
        let entry = self.armed.entry(key);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(fire_after).await;
            armed.remove(&task_key);
            on_fire.await;
        });
        if let dashmap::mapref::entry::Entry::Occupied(previous) = &entry {
            previous.get().abort();
        }
        entry.insert(handle);

        debug!(workflow_id = %workflow_id, seq, fire_after_ms = fire_after.as_millis() as u64, "Timer armed");
    }

    /// Cancel one timer. Returns false if it already fired or was never armed.
    pub fn cancel(&self, workflow_id: &str, seq: u64) -> bool {
        match self.armed.remove(&(workflow_id.to_string(), seq)) {
            Some((_, handle)) => {
                handle.abort();
                debug!(workflow_id = %workflow_id, seq, "Timer canceled");
                true
            }
            None => false,
        }
    }

    /// Cancel every timer owned by an instance, returning their sequence numbers
    pub fn cancel_all(&self, workflow_id: &str) -> Vec<u64> {
        let seqs: Vec<u64> = self
            .armed
            .iter()
            .filter(|entry| entry.key().0 == workflow_id)
            .map(|entry| entry.key().1)
            .collect();
        seqs.into_iter()
            .filter(|seq| self.cancel(workflow_id, *seq))
            .collect()
    }

    pub fn is_armed(&self, workflow_id: &str, seq: u64) -> bool {
        self.armed.contains_key(&(workflow_id.to_string(), seq))
    }

    pub fn armed_count(&self) -> usize {
        self.armed.len()
    }

    /// Time left until `fire_at`, zero if it has passed
    pub fn remaining_until(fire_at: DateTime<Utc>) -> Duration {
        (fire_at - Utc::now()).to_std().unwrap_or(Duration::ZERO)
    }
}
