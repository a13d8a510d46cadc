//! Step retry policies - bounded backoff for transient member failures
//!
//! A step's `retry` policy governs re-execution of its member after
//! *transient* failures (timeouts, rate limits, connection drops). It is
//! distinct from the scoring retry loop: scoring retries re-evaluate
//! below-threshold output, while this policy re-runs a member that failed
//! outright. When both are configured, this loop runs inside each scoring
//! attempt.
//!
//! Delays follow the configured backoff shape, capped at `max_delay`, with
//! optional jitter (a random factor in 0.5..1.5) to spread retry storms.

use crate::member::MemberErrorKind;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Backoff shapes between attempts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RetryBackoff {
    Fixed,
    Linear,
    #[default]
    Exponential,
}

/// Retry configuration for one step's member invocations
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StepRetryPolicy {
    /// Maximum attempts, including the first
    pub attempts: usize,

    pub backoff: RetryBackoff,

    /// Seconds before the second attempt
    pub initial_delay: f64,

    /// Delay ceiling in seconds
    pub max_delay: f64,

    /// Randomize delays by a 0.5..1.5 factor
    pub jitter: bool,

    /// Error kinds worth retrying; `None` uses the member error kind's own
    /// default classification
    pub retry_on: Option<Vec<String>>,
}

impl Default for StepRetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 1,
            backoff: RetryBackoff::Exponential,
            initial_delay: 0.5,
            max_delay: 60.0,
            jitter: true,
            retry_on: None,
        }
    }
}

impl StepRetryPolicy {
    pub fn new(attempts: usize) -> Self {
        Self {
            attempts,
            ..Self::default()
        }
    }

    pub fn with_backoff(mut self, backoff: RetryBackoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_initial_delay(mut self, seconds: f64) -> Self {
        self.initial_delay = seconds;
        self
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Whether another attempt is allowed after `attempt` attempts have
    /// been made.
    pub fn should_retry(&self, attempt: usize) -> bool {
        attempt < self.attempts
    }

    /// Whether a failure of this kind is retryable under the policy.
    pub fn retries_kind(&self, kind: MemberErrorKind) -> bool {
        match &self.retry_on {
            Some(kinds) => kinds.iter().any(|k| k == kind.as_str()),
            None => kind.is_retryable(),
        }
    }

    /// Delay before the next attempt. `failed_attempt` is 1-based.
    pub fn delay(&self, failed_attempt: usize) -> Duration {
        let base = match self.backoff {
            RetryBackoff::Fixed => self.initial_delay,
            RetryBackoff::Linear => self.initial_delay * failed_attempt as f64,
            RetryBackoff::Exponential => {
                self.initial_delay * 2f64.powi(failed_attempt.saturating_sub(1) as i32)
            }
        };
        let capped = base.min(self.max_delay).max(0.0);
        let final_delay = if self.jitter {
            let factor = rand::thread_rng().gen_range(0.5..=1.5);
            capped * factor
        } else {
            capped
        };
        Duration::from_secs_f64(final_delay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_policy_is_single_attempt() {
        let policy = StepRetryPolicy::default();
        assert_eq!(policy.attempts, 1);
        assert!(!policy.should_retry(1));
    }

    #[test]
    fn test_exponential_delays() {
        let policy = StepRetryPolicy::new(5)
            .with_initial_delay(1.0)
            .with_jitter(false);
        assert_eq!(policy.delay(1).as_secs_f64(), 1.0);
        assert_eq!(policy.delay(2).as_secs_f64(), 2.0);
        assert_eq!(policy.delay(3).as_secs_f64(), 4.0);
    }

    #[test]
    fn test_linear_and_fixed_delays() {
        let linear = StepRetryPolicy::new(4)
            .with_backoff(RetryBackoff::Linear)
            .with_initial_delay(0.5)
            .with_jitter(false);
        assert_eq!(linear.delay(3).as_secs_f64(), 1.5);

        let fixed = StepRetryPolicy::new(4)
            .with_backoff(RetryBackoff::Fixed)
            .with_initial_delay(0.25)
            .with_jitter(false);
        assert_eq!(fixed.delay(3).as_secs_f64(), 0.25);
    }

    #[test]
    fn test_max_delay_cap() {
        let mut policy = StepRetryPolicy::new(10).with_initial_delay(10.0).with_jitter(false);
        policy.max_delay = 15.0;
        assert_eq!(policy.delay(5).as_secs_f64(), 15.0);
    }

    #[test]
    fn test_jitter_range() {
        let policy = StepRetryPolicy::new(3).with_initial_delay(1.0);
        for _ in 0..20 {
            let delay = policy.delay(2).as_secs_f64();
            assert!((1.0..=3.0).contains(&delay), "delay {delay} out of range");
        }
    }

    #[test]
    fn test_retry_on_filter() {
        let default_policy = StepRetryPolicy::new(3);
        assert!(default_policy.retries_kind(MemberErrorKind::Transient));
        assert!(!default_policy.retries_kind(MemberErrorKind::Permanent));

        let mut narrow = StepRetryPolicy::new(3);
        narrow.retry_on = Some(vec!["rate_limit".to_string()]);
        assert!(narrow.retries_kind(MemberErrorKind::RateLimit));
        assert!(!narrow.retries_kind(MemberErrorKind::Transient));
    }
}
