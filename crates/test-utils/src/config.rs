//! Test configuration helpers.
//!
//! Provides sensible default configurations for tests, centralizing
//! magic values that would otherwise be scattered across test modules.

use std::time::Duration;

use tessera_types::config::{BatchConfig, RetryPolicy};

/// Returns a batch configuration with small chunks for tests.
///
/// - `write_chunk_size`: 5 (several chunks from a handful of items)
/// - `get_chunk_size`: 10
/// - `concurrency`: 2
#[must_use]
pub fn test_batch_config() -> BatchConfig {
    BatchConfig { write_chunk_size: 5, get_chunk_size: 10, concurrency: 2 }
}

/// Returns a retry policy with short, jitter-free backoff.
///
/// Pair with a paused tokio clock to make retries instant.
#[must_use]
pub fn test_retry_policy() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 3,
        initial_backoff: Duration::from_millis(5),
        max_backoff: Duration::from_millis(20),
        multiplier: 2.0,
        jitter: 0.0,
    }
}
