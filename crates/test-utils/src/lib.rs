//! Shared test utilities for tessera crates.
//!
//! This crate provides common test helpers to reduce boilerplate across test modules:
//!
//! - [`assert_eventually`] - Poll a condition until it holds or a deadline passes
//! - [`wait_for_count`] - Wait for a store counter to reach a target
//! - [`test_batch_config`] - Small-chunk batch configuration for tests
//! - [`test_retry_policy`] - Fast, jitter-free retry policy for tests
//! - [`strategies`] - Proptest generators for attribute values and items

#![deny(unsafe_code)]
// Test utilities are allowed to use unwrap for simplicity
#![cfg_attr(test, allow(clippy::disallowed_methods))]

mod assertions;
pub use assertions::{assert_eventually, wait_for_count};

mod config;
pub use config::{test_batch_config, test_retry_policy};

pub mod strategies;

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use std::{
        sync::{
            Arc,
            atomic::{AtomicUsize, Ordering},
        },
        time::Duration,
    };

    use super::*;

    // ============================================
    // Polling helper tests
    // ============================================

    #[tokio::test(start_paused = true)]
    async fn test_assert_eventually_sees_spawned_progress() {
        let calls = Arc::new(AtomicUsize::new(0));
        let worker = Arc::clone(&calls);
        tokio::spawn(async move {
            for _ in 0..3 {
                tokio::time::sleep(Duration::from_millis(20)).await;
                worker.fetch_add(1, Ordering::SeqCst);
            }
        });

        assert!(assert_eventually(Duration::from_secs(1), || calls.load(Ordering::SeqCst) == 3).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_assert_eventually_gives_up() {
        assert!(!assert_eventually(Duration::from_millis(50), || false).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_count_reports_last_value() {
        let rows = AtomicUsize::new(4);
        assert_eq!(wait_for_count(Duration::from_millis(30), 5, || rows.load(Ordering::SeqCst)).await, Err(4));
        rows.store(5, Ordering::SeqCst);
        assert_eq!(wait_for_count(Duration::from_millis(30), 5, || rows.load(Ordering::SeqCst)).await, Ok(()));
    }

    // ============================================
    // Config helper tests
    // ============================================

    #[test]
    fn test_batch_config_is_valid() {
        let config = test_batch_config();
        config.validate().expect("test batch config should validate");
        assert!(config.write_chunk_size < 25, "chunks should be small enough to split");
    }

    #[test]
    fn test_retry_policy_is_valid() {
        let policy = test_retry_policy();
        policy.validate().expect("test retry policy should validate");
        assert!(policy.max_attempts > 1, "retries should be enabled");
    }
}
