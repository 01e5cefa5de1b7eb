// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Retry scheduling for failed steps.
//!
//! [`RetryPolicy::decide`] is a pure function of the policy, the current retry
//! count and the non-retryable flag. [`StepError::annotate`] applies a decision
//! to an error so the code driving the step can see whether, and when, it will
//! be retried.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

// ============================================================================
// Retry Policy
// ============================================================================

/// How the delay grows between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackoffType {
    /// `base_delay * 2^current_retry_count`
    #[default]
    Exponential,
    /// `base_delay * (current_retry_count + 1)`
    Linear,
}

/// Retry configuration for a step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Retries allowed after the initial attempt.
    pub max_retries: u32,
    /// Base delay between attempts in milliseconds.
    pub base_delay_ms: u64,
    /// Delay growth.
    pub backoff: BackoffType,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 1000,
            backoff: BackoffType::Exponential,
        }
    }
}

impl RetryPolicy {
    /// Create a new retry policy.
    pub fn new(max_retries: u32, base_delay_ms: u64, backoff: BackoffType) -> Self {
        Self {
            max_retries,
            base_delay_ms,
            backoff,
        }
    }

    /// Delay before the next attempt, given how many retries already happened.
    pub fn delay_for(&self, current_retry_count: u32) -> Duration {
        let multiplier = match self.backoff {
            BackoffType::Exponential => 2u64.saturating_pow(current_retry_count),
            BackoffType::Linear => u64::from(current_retry_count).saturating_add(1),
        };
        Duration::from_millis(self.base_delay_ms.saturating_mul(multiplier))
    }

    /// Decide whether a failed attempt is retried and when.
    pub fn decide(
        &self,
        current_retry_count: u32,
        non_retryable: bool,
        now: DateTime<Utc>,
    ) -> RetryDecision {
        let next_retry_count = current_retry_count.saturating_add(1);
        let retryable = !non_retryable && next_retry_count <= self.max_retries;
        let delay = self.delay_for(current_retry_count);
        let next_retry_at = chrono::Duration::from_std(delay)
            .ok()
            .and_then(|d| now.checked_add_signed(d))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);

        RetryDecision {
            next_retry_count,
            retryable,
            delay,
            next_retry_at,
        }
    }
}

/// Outcome of [`RetryPolicy::decide`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryDecision {
    pub next_retry_count: u32,
    pub retryable: bool,
    pub delay: Duration,
    pub next_retry_at: DateTime<Utc>,
}

// ============================================================================
// Step Error
// ============================================================================

/// Error raised by a step, annotated with its retry state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{message} ({})", describe_retry(*.non_retryable, *.next_retry_at))]
pub struct StepError {
    /// Message from the failed attempt.
    pub message: String,
    /// Retries already scheduled for this step.
    #[serde(default)]
    pub retry_count: u32,
    /// Set once no further retries will happen.
    #[serde(default)]
    pub non_retryable: bool,
    /// When the next attempt is scheduled, if any.
    #[serde(default)]
    pub next_retry_at: Option<DateTime<Utc>>,
}

impl StepError {
    /// A fresh error with no retries yet.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retry_count: 0,
            non_retryable: false,
            next_retry_at: None,
        }
    }

    /// Set the number of retries already performed.
    pub fn with_retry_count(mut self, retry_count: u32) -> Self {
        self.retry_count = retry_count;
        self
    }

    /// Mark the error as never retryable.
    pub fn non_retryable(mut self) -> Self {
        self.non_retryable = true;
        self.next_retry_at = None;
        self
    }

    /// True while another attempt is scheduled.
    pub fn will_retry(&self) -> bool {
        !self.non_retryable && self.next_retry_at.is_some()
    }

    /// Apply the policy to this error.
    ///
    /// Returns `None` without touching the error when it is already
    /// non-retryable. Otherwise the retry count advances and the error is
    /// either scheduled or marked terminal.
    pub fn annotate(&mut self, policy: &RetryPolicy, now: DateTime<Utc>) -> Option<RetryDecision> {
        if self.non_retryable {
            return None;
        }

        let decision = policy.decide(self.retry_count, false, now);
        self.retry_count = decision.next_retry_count;
        if decision.retryable {
            self.next_retry_at = Some(decision.next_retry_at);
        } else {
            self.non_retryable = true;
            self.next_retry_at = None;
        }
        Some(decision)
    }

    /// Human-readable retry annotation.
    pub fn annotation(&self) -> String {
        describe_retry(self.non_retryable, self.next_retry_at)
    }

    /// Step state blob recording this failure.
    pub fn to_state(&self) -> Value {
        json!({
            "error": self.message,
            "retry": {
                "retry_count": self.retry_count,
                "retryable": !self.non_retryable,
                "next_retry_at": self.next_retry_at,
            }
        })
    }
}

fn describe_retry(non_retryable: bool, next_retry_at: Option<DateTime<Utc>>) -> String {
    match (non_retryable, next_retry_at) {
        (false, Some(at)) => format!("will retry at {}", at.to_rfc3339()),
        (false, None) => "not yet scheduled".to_string(),
        (true, _) => "no further retries".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(ts: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(ts)
            .unwrap()
            .with_timezone(&Utc)
    }

    #[test]
    fn test_policy_defaults() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_retries, 3);
        assert_eq!(policy.base_delay_ms, 1000);
        assert_eq!(policy.backoff, BackoffType::Exponential);
    }

    #[test]
    fn test_exponential_delay() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for(0), Duration::from_millis(1000));
        assert_eq!(policy.delay_for(1), Duration::from_millis(2000));
        assert_eq!(policy.delay_for(2), Duration::from_millis(4000));
    }

    #[test]
    fn test_linear_delay() {
        let policy = RetryPolicy::new(3, 1000, BackoffType::Linear);
        assert_eq!(policy.delay_for(0), Duration::from_millis(1000));
        assert_eq!(policy.delay_for(2), Duration::from_millis(3000));
    }

    #[test]
    fn test_delay_saturates() {
        let policy = RetryPolicy::new(100, u64::MAX, BackoffType::Exponential);
        assert_eq!(policy.delay_for(80), Duration::from_millis(u64::MAX));

        let decision = policy.decide(80, false, Utc::now());
        assert_eq!(decision.next_retry_at, DateTime::<Utc>::MAX_UTC);
    }

    #[test]
    fn test_decide_schedules_next_attempt() {
        let now = at("2025-01-01T00:00:00Z");
        let decision = RetryPolicy::default().decide(2, false, now);

        assert_eq!(decision.next_retry_count, 3);
        assert!(decision.retryable);
        assert_eq!(decision.delay, Duration::from_millis(4000));
        assert_eq!(decision.next_retry_at, at("2025-01-01T00:00:04Z"));
    }

    #[test]
    fn test_exhaustion_regardless_of_backoff() {
        let now = Utc::now();
        for backoff in [BackoffType::Exponential, BackoffType::Linear] {
            let policy = RetryPolicy::new(3, 1000, backoff);
            assert!(policy.decide(2, false, now).retryable);

            let decision = policy.decide(3, false, now);
            assert_eq!(decision.next_retry_count, 4);
            assert!(!decision.retryable, "{:?} should be exhausted", backoff);
        }
    }

    #[test]
    fn test_non_retryable_flag_wins() {
        let decision = RetryPolicy::default().decide(0, true, Utc::now());
        assert!(!decision.retryable);
        assert_eq!(decision.next_retry_count, 1);
    }

    #[test]
    fn test_zero_max_retries() {
        let policy = RetryPolicy::new(0, 1000, BackoffType::Exponential);
        assert!(!policy.decide(0, false, Utc::now()).retryable);
    }

    #[test]
    fn test_annotate_schedules_retry() {
        let now = at("2025-03-01T12:00:00Z");
        let mut err = StepError::new("timeout");

        let decision = err.annotate(&RetryPolicy::default(), now).unwrap();
        assert!(decision.retryable);
        assert_eq!(err.retry_count, 1);
        assert_eq!(err.next_retry_at, Some(at("2025-03-01T12:00:01Z")));
        assert!(err.will_retry());
        assert_eq!(
            err.to_string(),
            "timeout (will retry at 2025-03-01T12:00:01+00:00)"
        );
    }

    #[test]
    fn test_annotate_marks_terminal_then_short_circuits() {
        let mut err = StepError::new("boom").with_retry_count(3);

        let decision = err.annotate(&RetryPolicy::default(), Utc::now()).unwrap();
        assert!(!decision.retryable);
        assert!(err.non_retryable);
        assert_eq!(err.retry_count, 4);
        assert!(err.next_retry_at.is_none());
        assert_eq!(err.to_string(), "boom (no further retries)");

        let before = err.clone();
        assert!(err.annotate(&RetryPolicy::default(), Utc::now()).is_none());
        assert_eq!(err, before);
    }

    #[test]
    fn test_state_blob_shape() {
        let now = at("2025-03-01T12:00:00Z");
        let mut err = StepError::new("rate limited");
        err.annotate(&RetryPolicy::default(), now);

        let state = err.to_state();
        assert_eq!(state["error"], "rate limited");
        assert_eq!(state["retry"]["retry_count"], 1);
        assert_eq!(state["retry"]["retryable"], true);
        assert!(state["retry"]["next_retry_at"].is_string());

        let terminal = StepError::new("bad input").non_retryable().to_state();
        assert_eq!(terminal["retry"]["retryable"], false);
        assert!(terminal["retry"]["next_retry_at"].is_null());
    }

    #[test]
    fn test_policy_deserializes_with_defaults() {
        let policy: RetryPolicy = serde_json::from_str(r#"{"backoff": "linear"}"#).unwrap();
        assert_eq!(policy.backoff, BackoffType::Linear);
        assert_eq!(policy.max_retries, 3);
        assert_eq!(policy.base_delay_ms, 1000);
    }
}
