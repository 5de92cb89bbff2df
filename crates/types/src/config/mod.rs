//! Configuration types for tessera.
//!
//! All config structs validate their values at construction time via
//! fallible builders. Post-deserialization validation is available via
//! the `validate()` method on each struct.

// The schemars `JsonSchema` derive macro internally uses `.unwrap()` in its
// expansions. Allow it at the module level since config types are
// declarative structs with minimal procedural code.
#![allow(clippy::disallowed_methods, clippy::unwrap_used)]

mod batch;
mod retry;

pub use batch::*;
pub use retry::*;
use snafu::Snafu;

/// Configuration validation error.
///
/// Returned when a configuration value is outside its valid range or
/// violates a cross-field constraint.
#[derive(Debug, Snafu)]
pub enum ConfigError {
    /// A configuration value is invalid.
    #[snafu(display("invalid config: {message}"))]
    Validation {
        /// Description of the validation failure.
        message: String,
    },
}

/// Duration serialization using humantime format.
mod humantime_serde {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&humantime::format_duration(*duration).to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::disallowed_methods)]
mod tests {
    use std::time::Duration;

    use super::*;

    // =========================================================================
    // BatchConfig validation tests
    // =========================================================================

    #[test]
    fn test_batch_config_defaults_are_valid() {
        let config = BatchConfig::builder().build().expect("defaults should be valid");
        assert_eq!(config.write_chunk_size, 25);
        assert_eq!(config.get_chunk_size, 100);
        assert_eq!(config.concurrency, 1);
        assert_eq!(config, BatchConfig::default());
    }

    #[test]
    fn test_batch_config_write_chunk_size_bounds() {
        assert!(BatchConfig::builder().write_chunk_size(1).build().is_ok());
        assert!(BatchConfig::builder().write_chunk_size(25).build().is_ok());

        let err = BatchConfig::builder().write_chunk_size(26).build().unwrap_err();
        assert!(err.to_string().contains("write_chunk_size"));
        assert!(BatchConfig::builder().write_chunk_size(0).build().is_err());
    }

    #[test]
    fn test_batch_config_get_chunk_size_bounds() {
        assert!(BatchConfig::builder().get_chunk_size(100).build().is_ok());
        let err = BatchConfig::builder().get_chunk_size(101).build().unwrap_err();
        assert!(err.to_string().contains("get_chunk_size"));
    }

    #[test]
    fn test_batch_config_concurrency_must_be_bounded() {
        let err = BatchConfig::builder().concurrency(0).build().unwrap_err();
        assert!(err.to_string().contains("concurrency"));
        assert!(BatchConfig::builder().concurrency(8).build().is_ok());
    }

    #[test]
    fn test_batch_config_deserialize_fills_defaults() {
        let config: BatchConfig =
            serde_json::from_str(r#"{"concurrency": 4}"#).expect("deserialize");
        assert_eq!(config.concurrency, 4);
        assert_eq!(config.write_chunk_size, 25);
        config.validate().expect("valid");
    }

    // =========================================================================
    // RetryPolicy validation tests
    // =========================================================================

    #[test]
    fn test_retry_policy_defaults() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.initial_backoff, Duration::from_millis(100));
        assert_eq!(policy.max_backoff, Duration::from_secs(10));
        policy.validate().expect("defaults are valid");
    }

    #[test]
    fn test_retry_policy_builder_custom() {
        let policy = RetryPolicy::builder()
            .max_attempts(5)
            .initial_backoff(Duration::from_millis(10))
            .max_backoff(Duration::from_millis(200))
            .build()
            .expect("valid policy");
        assert_eq!(policy.max_attempts, 5);
        assert_eq!(policy.max_backoff, Duration::from_millis(200));
    }

    #[test]
    fn test_retry_policy_rejects_zero_attempts() {
        let err = RetryPolicy::builder().max_attempts(0).build().unwrap_err();
        assert!(err.to_string().contains("max_attempts"));
    }

    #[test]
    fn test_retry_policy_rejects_inverted_backoff() {
        let result = RetryPolicy::builder()
            .initial_backoff(Duration::from_secs(5))
            .max_backoff(Duration::from_secs(1))
            .build();
        assert!(result.is_err());
    }

    #[test]
    fn test_retry_policy_rejects_jitter_out_of_range() {
        assert!(RetryPolicy::builder().jitter(1.5).build().is_err());
        assert!(RetryPolicy::builder().jitter(-0.1).build().is_err());
        assert!(RetryPolicy::builder().jitter(0.0).build().is_ok());
    }

    #[test]
    fn test_retry_policy_humantime_roundtrip() {
        let policy = RetryPolicy::default();
        let json = serde_json::to_string(&policy).expect("serialize");
        assert!(json.contains("\"100ms\""), "{json}");
        let back: RetryPolicy = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back, policy);
    }

    #[test]
    fn test_no_retry_is_single_attempt() {
        assert_eq!(RetryPolicy::no_retry().max_attempts, 1);
    }
}
