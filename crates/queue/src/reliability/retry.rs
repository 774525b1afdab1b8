//! Per-error-type retry limits and rollback delays

use std::collections::HashMap;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::config::{duration_millis, ConfigError};
use crate::dispatch::POISON_ERROR_TYPE;
use crate::message::MAX_TIME_OFFSET;

/// Retry limit and backoff for one error type
///
/// The delay is used as the rollback delay: a failed message becomes
/// eligible again only once its queue process time has passed.
///
/// # Example
///
/// ```
/// use durable_queue::RetryPolicy;
/// use std::time::Duration;
///
/// let policy = RetryPolicy::exponential()
///     .with_max_retries(5)
///     .with_initial_interval(Duration::from_millis(500))
///     .with_max_interval(Duration::from_secs(30))
///     .with_jitter(0.0);
///
/// assert_eq!(policy.delay_for_retry(1), Duration::from_millis(500));
/// assert_eq!(policy.delay_for_retry(3), Duration::from_secs(2));
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetryPolicy {
    /// Retries allowed after the first failure; the failure that pushes the
    /// count past this moves the message to the error store
    pub max_retries: u32,

    /// Delay before the first retry
    #[serde(with = "duration_millis")]
    pub initial_interval: Duration,

    /// Maximum delay between retries
    #[serde(with = "duration_millis")]
    pub max_interval: Duration,

    /// Growth factor per retry; 1.0 keeps the delay constant
    pub backoff_coefficient: f64,

    /// Fraction of the delay randomized in either direction, 0.0 to 1.0
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::exponential()
    }
}

impl RetryPolicy {
    /// Three retries starting at one second, doubling up to a minute, 10% jitter
    pub fn exponential() -> Self {
        Self {
            max_retries: 3,
            initial_interval: Duration::from_secs(1),
            max_interval: Duration::from_secs(60),
            backoff_coefficient: 2.0,
            jitter: 0.1,
        }
    }

    /// Create a policy that moves a message to the error store on its first failure
    pub fn no_retry() -> Self {
        Self {
            max_retries: 0,
            initial_interval: Duration::ZERO,
            max_interval: Duration::ZERO,
            backoff_coefficient: 1.0,
            jitter: 0.0,
        }
    }

    /// Constant delay between retries
    pub fn fixed(interval: Duration, max_retries: u32) -> Self {
        Self {
            max_retries,
            initial_interval: interval,
            max_interval: interval,
            backoff_coefficient: 1.0,
            jitter: 0.0,
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_initial_interval(mut self, interval: Duration) -> Self {
        self.initial_interval = interval;
        self
    }

    pub fn with_max_interval(mut self, interval: Duration) -> Self {
        self.max_interval = interval;
        self
    }

    pub fn with_backoff_coefficient(mut self, coefficient: f64) -> Self {
        self.backoff_coefficient = coefficient;
        self
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    /// Delay before retry number `retry` (1-based)
    pub fn delay_for_retry(&self, retry: u32) -> Duration {
        if retry == 0 {
            return Duration::ZERO;
        }

        let exponent = i32::try_from(retry - 1).unwrap_or(i32::MAX);
        let base = self.initial_interval.as_secs_f64() * self.backoff_coefficient.powi(exponent);
        if base.is_nan() || base <= 0.0 {
            return Duration::ZERO;
        }
        let capped = base.min(self.max_interval.as_secs_f64());

        // Deserialized policies may carry a jitter outside 0.0..=1.0
        let jitter = if self.jitter.is_finite() {
            self.jitter.clamp(0.0, 1.0)
        } else {
            0.0
        };
        let jittered = if jitter > 0.0 && capped > 0.0 {
            let mut rng = rand::thread_rng();
            let jitter_range = capped * jitter;
            let jitter_offset = rng.gen_range(-jitter_range..jitter_range);
            (capped + jitter_offset).max(0.0)
        } else {
            capped
        };

        if !jittered.is_finite() || jittered <= 0.0 {
            return Duration::ZERO;
        }
        Duration::try_from_secs_f64(jittered).unwrap_or(self.max_interval)
    }

    /// Reject settings that would produce negative or unbounded delays
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.backoff_coefficient.is_finite() || self.backoff_coefficient < 1.0 {
            return Err(ConfigError::invalid(
                "retry.backoff_coefficient",
                format!("must be a finite value of at least 1.0, got {}", self.backoff_coefficient),
            ));
        }
        if !(0.0..=1.0).contains(&self.jitter) {
            return Err(ConfigError::invalid(
                "retry.jitter",
                format!("must be between 0.0 and 1.0, got {}", self.jitter),
            ));
        }
        if self.max_interval < self.initial_interval {
            return Err(ConfigError::invalid(
                "retry.max_interval",
                "must not be shorter than the initial interval",
            ));
        }
        if self.max_interval > MAX_TIME_OFFSET {
            return Err(ConfigError::invalid(
                "retry.max_interval",
                format!("must not exceed {}s", MAX_TIME_OFFSET.as_secs()),
            ));
        }
        Ok(())
    }

    /// Whether `count` recorded failures exceed the retry limit
    pub fn is_exhausted(&self, count: u32) -> bool {
        count > self.max_retries
    }
}

/// Retry policies keyed by error type
///
/// Error types without an override use the default policy. Poison messages
/// are not retried unless overridden.
///
/// ```
/// use durable_queue::{ErrorPolicy, RetryPolicy};
///
/// let policy = ErrorPolicy::default()
///     .with_override("Timeout", RetryPolicy::exponential().with_max_retries(10))
///     .with_non_retryable("ValidationError");
///
/// assert_eq!(policy.for_error_type("Timeout").max_retries, 10);
/// assert_eq!(policy.for_error_type("ValidationError").max_retries, 0);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ErrorPolicy {
    #[serde(default)]
    pub default: RetryPolicy,

    #[serde(default)]
    pub overrides: HashMap<String, RetryPolicy>,
}

impl Default for ErrorPolicy {
    fn default() -> Self {
        Self::new(RetryPolicy::default())
    }
}

impl ErrorPolicy {
    pub fn new(default: RetryPolicy) -> Self {
        Self {
            default,
            overrides: HashMap::from([(POISON_ERROR_TYPE.to_string(), RetryPolicy::no_retry())]),
        }
    }

    pub fn with_override(mut self, error_type: impl Into<String>, policy: RetryPolicy) -> Self {
        self.overrides.insert(error_type.into(), policy);
        self
    }

    /// Never retry this error type
    pub fn with_non_retryable(self, error_type: impl Into<String>) -> Self {
        self.with_override(error_type, RetryPolicy::no_retry())
    }

    pub fn for_error_type(&self, error_type: &str) -> &RetryPolicy {
        self.overrides.get(error_type).unwrap_or(&self.default)
    }

    pub fn max_retries(&self, error_type: &str) -> u32 {
        self.for_error_type(error_type).max_retries
    }

    pub fn delay_for(&self, error_type: &str, retry: u32) -> Duration {
        self.for_error_type(error_type).delay_for_retry(retry)
    }

    /// Validate the default policy and every override
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.default.validate()?;
        for (error_type, policy) in &self.overrides {
            policy.validate().map_err(|e| match e {
                ConfigError::Invalid { field, reason } => {
                    ConfigError::invalid(field, format!("override for '{error_type}': {reason}"))
                }
                other => other,
            })?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exponential_delays() {
        let policy = RetryPolicy::exponential()
            .with_initial_interval(Duration::from_secs(1))
            .with_max_interval(Duration::from_secs(60))
            .with_jitter(0.0);

        assert_eq!(policy.delay_for_retry(0), Duration::ZERO);
        assert_eq!(policy.delay_for_retry(1), Duration::from_secs(1));
        assert_eq!(policy.delay_for_retry(2), Duration::from_secs(2));
        assert_eq!(policy.delay_for_retry(3), Duration::from_secs(4));
        assert_eq!(policy.delay_for_retry(4), Duration::from_secs(8));
    }

    #[test]
    fn test_max_interval_cap() {
        let policy = RetryPolicy::exponential()
            .with_initial_interval(Duration::from_secs(10))
            .with_max_interval(Duration::from_secs(30))
            .with_jitter(0.0);

        assert_eq!(policy.delay_for_retry(3), Duration::from_secs(30));
        assert_eq!(policy.delay_for_retry(200), Duration::from_secs(30));
    }

    #[test]
    fn test_jitter_stays_in_range() {
        let policy = RetryPolicy::exponential()
            .with_initial_interval(Duration::from_secs(10))
            .with_jitter(0.1);

        for _ in 0..100 {
            let delay = policy.delay_for_retry(1);
            assert!(delay >= Duration::from_secs(9));
            assert!(delay <= Duration::from_secs(11));
        }
    }

    #[test]
    fn test_is_exhausted() {
        let policy = RetryPolicy::fixed(Duration::from_millis(10), 2);
        assert!(!policy.is_exhausted(1));
        assert!(!policy.is_exhausted(2));
        assert!(policy.is_exhausted(3));

        assert!(RetryPolicy::no_retry().is_exhausted(1));
    }

    #[test]
    fn test_error_policy_overrides() {
        let policy = ErrorPolicy::new(RetryPolicy::fixed(Duration::from_secs(1), 3))
            .with_override("Timeout", RetryPolicy::fixed(Duration::from_secs(5), 7))
            .with_non_retryable("Invalid");

        assert_eq!(policy.max_retries("Other"), 3);
        assert_eq!(policy.max_retries("Timeout"), 7);
        assert_eq!(policy.max_retries("Invalid"), 0);
        assert_eq!(policy.delay_for("Timeout", 1), Duration::from_secs(5));
        assert_eq!(policy.max_retries(POISON_ERROR_TYPE), 0);
    }

    #[test]
    fn test_validate_rejects_bad_policies() {
        assert!(RetryPolicy::exponential().validate().is_ok());
        assert!(RetryPolicy::no_retry().validate().is_ok());
        assert!(RetryPolicy::fixed(Duration::ZERO, 3).validate().is_ok());

        let field = |policy: RetryPolicy| match policy.validate() {
            Err(ConfigError::Invalid { field, .. }) => field,
            other => panic!("expected invalid policy, got {other:?}"),
        };
        assert_eq!(
            field(RetryPolicy::exponential().with_backoff_coefficient(-2.0)),
            "retry.backoff_coefficient"
        );
        assert_eq!(
            field(RetryPolicy::exponential().with_backoff_coefficient(f64::NAN)),
            "retry.backoff_coefficient"
        );
        assert_eq!(
            field(RetryPolicy {
                jitter: 3.0,
                ..RetryPolicy::exponential()
            }),
            "retry.jitter"
        );
        assert_eq!(
            field(
                RetryPolicy::exponential()
                    .with_initial_interval(Duration::from_secs(10))
                    .with_max_interval(Duration::from_secs(1))
            ),
            "retry.max_interval"
        );
        assert_eq!(
            field(RetryPolicy::fixed(Duration::from_secs(u64::MAX), 1)),
            "retry.max_interval"
        );
    }

    #[test]
    fn test_error_policy_validates_overrides() {
        let policy = ErrorPolicy::default().with_override(
            "Timeout",
            RetryPolicy::exponential().with_backoff_coefficient(0.5),
        );
        match policy.validate() {
            Err(ConfigError::Invalid { field, reason }) => {
                assert_eq!(field, "retry.backoff_coefficient");
                assert!(reason.contains("Timeout"), "reason: {reason}");
            }
            other => panic!("expected invalid override, got {other:?}"),
        }
    }

    #[test]
    fn test_unvalidated_policy_never_panics() {
        let negative = RetryPolicy::exponential()
            .with_jitter(0.0)
            .with_backoff_coefficient(-2.0);
        assert_eq!(negative.delay_for_retry(2), Duration::ZERO);

        let nan = RetryPolicy::exponential().with_backoff_coefficient(f64::NAN);
        assert_eq!(nan.delay_for_retry(3), Duration::ZERO);

        let wild_jitter = RetryPolicy {
            jitter: f64::NAN,
            ..RetryPolicy::fixed(Duration::from_secs(2), 1)
        };
        assert_eq!(wild_jitter.delay_for_retry(1), Duration::from_secs(2));

        let huge = RetryPolicy::fixed(Duration::MAX, 1);
        assert_eq!(huge.delay_for_retry(1), Duration::MAX);
    }

    #[test]
    fn test_serde_roundtrip() {
        let policy = ErrorPolicy::default().with_non_retryable("Invalid");
        let json = serde_json::to_string(&policy).unwrap();
        let parsed: ErrorPolicy = serde_json::from_str(&json).unwrap();
        assert_eq!(policy, parsed);
    }
}
