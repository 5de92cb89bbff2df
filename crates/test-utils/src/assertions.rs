//! Polling assertions for tests that race a store call.
//!
//! Batch and paging tests often need to act while a request is in flight,
//! for example cancelling a batch once the mock store has seen its second
//! chunk. These helpers poll on the tokio clock, so they also work under
//! `#[tokio::test(start_paused = true)]`.

use std::time::Duration;

use tokio::time::{Instant, sleep};

/// How often conditions are re-checked.
const POLL_INTERVAL: Duration = Duration::from_millis(5);

/// Polls `condition` until it holds or `timeout` elapses.
///
/// Returns `true` if the condition held before the deadline. The condition
/// is checked once more after the deadline.
pub async fn assert_eventually<F>(timeout: Duration, condition: F) -> bool
where
    F: Fn() -> bool,
{
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        sleep(POLL_INTERVAL).await;
    }
    condition()
}

/// Waits until `count` reports at least `target`.
///
/// Meant for counters such as `MockStore::batch_write_calls` or
/// `MockStore::len`. On timeout the last observed value is returned as the
/// error so the failing assertion can print it.
///
/// # Example
///
/// ```no_run
/// use std::sync::atomic::{AtomicUsize, Ordering};
/// use std::time::Duration;
/// use tessera_test_utils::wait_for_count;
///
/// # async fn example() {
/// let calls = AtomicUsize::new(0);
/// calls.fetch_add(2, Ordering::SeqCst);
/// wait_for_count(Duration::from_millis(100), 2, || calls.load(Ordering::SeqCst))
///     .await
///     .expect("two store calls");
/// # }
/// ```
pub async fn wait_for_count<F>(timeout: Duration, target: usize, count: F) -> Result<(), usize>
where
    F: Fn() -> usize,
{
    if assert_eventually(timeout, || count() >= target).await { Ok(()) } else { Err(count()) }
}
