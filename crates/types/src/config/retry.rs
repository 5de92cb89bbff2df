use std::time::Duration;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::ConfigError;

/// Retry policy for store-reported unprocessed batch items and throttling.
///
/// Backoff grows as `initial_backoff * multiplier^(attempt-1)`, capped at
/// `max_backoff`, with `±jitter` randomization.
///
/// # Validation Rules
///
/// - `max_attempts` must be >= 1 (1 means no retry)
/// - `initial_backoff` must be <= `max_backoff`
/// - `multiplier` must be >= 1.0
/// - `jitter` must be in `0.0..=1.0`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct RetryPolicy {
    /// Maximum number of attempts, including the first.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Backoff before the first retry.
    #[serde(default = "default_initial_backoff")]
    #[serde(with = "super::humantime_serde")]
    #[schemars(with = "String")]
    pub initial_backoff: Duration,
    /// Upper bound for any single backoff.
    #[serde(default = "default_max_backoff")]
    #[serde(with = "super::humantime_serde")]
    #[schemars(with = "String")]
    pub max_backoff: Duration,
    /// Exponential growth factor.
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    /// Randomization factor applied to each backoff.
    #[serde(default = "default_jitter")]
    pub jitter: f64,
}

#[bon::bon]
impl RetryPolicy {
    /// Creates a new retry policy with validation.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Validation`] if any value is out of range.
    #[builder]
    pub fn new(
        #[builder(default = default_max_attempts())] max_attempts: u32,
        #[builder(default = default_initial_backoff())] initial_backoff: Duration,
        #[builder(default = default_max_backoff())] max_backoff: Duration,
        #[builder(default = default_multiplier())] multiplier: f64,
        #[builder(default = default_jitter())] jitter: f64,
    ) -> Result<Self, ConfigError> {
        let policy = Self { max_attempts, initial_backoff, max_backoff, multiplier, jitter };
        policy.validate()?;
        Ok(policy)
    }
}

impl RetryPolicy {
    /// Creates a policy that never retries.
    #[must_use]
    pub fn no_retry() -> Self {
        Self { max_attempts: 1, ..Default::default() }
    }

    /// Validates the policy values.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Validation`] if any value is out of range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_attempts == 0 {
            return Err(ConfigError::Validation {
                message: "max_attempts must be >= 1".to_string(),
            });
        }
        if self.initial_backoff > self.max_backoff {
            return Err(ConfigError::Validation {
                message: format!(
                    "initial_backoff ({:?}) must not exceed max_backoff ({:?})",
                    self.initial_backoff, self.max_backoff
                ),
            });
        }
        if self.multiplier < 1.0 || !self.multiplier.is_finite() {
            return Err(ConfigError::Validation {
                message: format!("multiplier ({}) must be >= 1.0", self.multiplier),
            });
        }
        if !(0.0..=1.0).contains(&self.jitter) {
            return Err(ConfigError::Validation {
                message: format!("jitter ({}) must be in 0.0..=1.0", self.jitter),
            });
        }
        Ok(())
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_backoff: default_initial_backoff(),
            max_backoff: default_max_backoff(),
            multiplier: default_multiplier(),
            jitter: default_jitter(),
        }
    }
}

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_backoff() -> Duration {
    Duration::from_millis(100)
}

fn default_max_backoff() -> Duration {
    Duration::from_secs(10)
}

fn default_multiplier() -> f64 {
    2.0
}

fn default_jitter() -> f64 {
    0.25
}
