//! # Retry Policy
//!
//! Pure backoff arithmetic for activity retries.
//!
//! The delay before attempt `n + 1` (after attempt `n` failed, `n` being 1-based)
//! is `min(initial_interval × backoff_coefficient^(n−1), maximum_interval)`.
//! `maximum_attempts = 0` means unlimited attempts.

use crate::utils::serde::duration_millis;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Backoff and attempt-limit rule governing activity retries
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Delay after the first failed attempt
    #[serde(with = "duration_millis")]
    pub initial_interval: Duration,
    /// Multiplier applied per additional failed attempt
    pub backoff_coefficient: f64,
    /// Cap on any single delay
    #[serde(with = "duration_millis")]
    pub maximum_interval: Duration,
    /// Total attempts allowed, 0 for unlimited
    pub maximum_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_interval: Duration::from_secs(1),
            backoff_coefficient: 2.0,
            maximum_interval: Duration::from_secs(100),
            maximum_attempts: 0,
        }
    }
}

/// What the invoker should do after a failed attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Retry { delay: Duration, next_attempt: u32 },
    Stop,
}

impl RetryPolicy {
    pub fn new(initial_interval: Duration, maximum_interval: Duration, maximum_attempts: u32) -> Self {
        Self {
            initial_interval,
            maximum_interval,
            maximum_attempts,
            ..Default::default()
        }
    }

    pub fn with_backoff_coefficient(mut self, backoff_coefficient: f64) -> Self {
        self.backoff_coefficient = backoff_coefficient;
        self
    }

    /// A policy that never retries
    pub fn no_retries() -> Self {
        Self {
            maximum_attempts: 1,
            ..Default::default()
        }
    }

    pub fn is_unlimited(&self) -> bool {
        self.maximum_attempts == 0
    }

    /// Delay to wait after `attempt` (1-based) failed
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let factor = self.backoff_coefficient.powi(exponent);
        let raw = self.initial_interval.as_secs_f64() * factor;

        if !raw.is_finite() || raw >= self.maximum_interval.as_secs_f64() {
            return self.maximum_interval;
        }

        Duration::try_from_secs_f64(raw)
            .map(|delay| delay.min(self.maximum_interval))
            .unwrap_or(self.maximum_interval)
    }

    /// Decide whether to schedule another attempt after `attempt` failed
    pub fn next_retry(&self, attempt: u32) -> RetryDecision {
        if !self.is_unlimited() && attempt >= self.maximum_attempts {
            return RetryDecision::Stop;
        }
        RetryDecision::Retry {
            delay: self.delay_for_attempt(attempt),
            next_attempt: attempt.saturating_add(1),
        }
    }

    /// Reject policies whose delays would shrink or are undefined
    pub fn validate(&self) -> Result<(), String> {
        if !self.backoff_coefficient.is_finite() || self.backoff_coefficient < 1.0 {
            return Err(format!(
                "backoff_coefficient must be a finite value >= 1.0, got {}",
                self.backoff_coefficient
            ));
        }
        if self.maximum_interval < self.initial_interval {
            return Err(format!(
                "maximum_interval {:?} is shorter than initial_interval {:?}",
                self.maximum_interval, self.initial_interval
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_default_policy() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.initial_interval, Duration::from_secs(1));
        assert_eq!(policy.backoff_coefficient, 2.0);
        assert_eq!(policy.maximum_interval, Duration::from_secs(100));
        assert!(policy.is_unlimited());
        assert!(policy.validate().is_ok());
    }

    #[test]
    fn test_exponential_delays_with_cap() {
        let policy = RetryPolicy::new(Duration::from_secs(1), Duration::from_secs(60), 3);
        assert_eq!(policy.delay_for_attempt(1), Duration::from_secs(1));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_secs(2));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_secs(4));
        assert_eq!(policy.delay_for_attempt(6), Duration::from_secs(32));
        assert_eq!(policy.delay_for_attempt(7), Duration::from_secs(60));
        assert_eq!(policy.delay_for_attempt(u32::MAX), Duration::from_secs(60));
    }

    #[test]
    fn test_stop_after_maximum_attempts() {
        let policy = RetryPolicy::new(Duration::from_secs(2), Duration::from_secs(30), 3);
        assert_eq!(
            policy.next_retry(1),
            RetryDecision::Retry {
                delay: Duration::from_secs(2),
                next_attempt: 2
            }
        );
        assert_eq!(
            policy.next_retry(2),
            RetryDecision::Retry {
                delay: Duration::from_secs(4),
                next_attempt: 3
            }
        );
        assert_eq!(policy.next_retry(3), RetryDecision::Stop);
    }

    #[test]
    fn test_unlimited_never_stops() {
        let policy = RetryPolicy::default();
        assert!(matches!(policy.next_retry(10_000), RetryDecision::Retry { .. }));
    }

    #[test]
    fn test_validation() {
        assert!(RetryPolicy::default()
            .with_backoff_coefficient(0.5)
            .validate()
            .is_err());
        assert!(RetryPolicy::new(Duration::from_secs(10), Duration::from_secs(1), 3)
            .validate()
            .is_err());
    }

    proptest! {
        #[test]
        fn prop_delay_matches_formula_and_is_monotonic(
            initial_ms in 1u64..10_000,
            coefficient in 1.0f64..4.0,
            max_ms in 1u64..600_000,
            attempt in 1u32..64,
        ) {
            let initial = Duration::from_millis(initial_ms);
            let maximum = Duration::from_millis(max_ms.max(initial_ms));
            let policy = RetryPolicy::new(initial, maximum, 0).with_backoff_coefficient(coefficient);

            let delay = policy.delay_for_attempt(attempt);
            let next = policy.delay_for_attempt(attempt + 1);
            prop_assert!(delay <= maximum);
            prop_assert!(next >= delay);

            let expected = (initial.as_secs_f64() * coefficient.powi(attempt as i32 - 1))
                .min(maximum.as_secs_f64());
            prop_assert!((delay.as_secs_f64() - expected).abs() < 1e-6);
        }

        #[test]
        fn prop_bounded_policy_allows_exact_attempt_count(max_attempts in 1u32..20) {
            let policy = RetryPolicy::new(Duration::from_millis(10), Duration::from_secs(1), max_attempts);
            let mut attempt = 1;
            while let RetryDecision::Retry { next_attempt, .. } = policy.next_retry(attempt) {
                attempt = next_attempt;
            }
            prop_assert_eq!(attempt, max_attempts);
        }
    }
}
