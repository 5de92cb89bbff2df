//! Backoff between batch retry rounds.
//!
//! The schedule comes from a [`RetryPolicy`] via `backon`'s exponential
//! builder; jitter is applied per delay so concurrent callers spread out.
//! Sleeps race the caller's cancellation token.

use std::time::Duration;

use backon::{BackoffBuilder, ExponentialBackoff, ExponentialBuilder};
use rand::Rng;
use tessera_types::config::RetryPolicy;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Delays between retry rounds, ending once the policy's attempts are spent.
pub(crate) struct RetrySchedule {
    delays: ExponentialBackoff,
    jitter: f64,
    attempt: u32,
}

impl RetrySchedule {
    pub(crate) fn new(policy: &RetryPolicy) -> Self {
        // max_times counts retries; the first attempt is not one of them.
        let max_retries = policy.max_attempts.saturating_sub(1) as usize;
        let delays = ExponentialBuilder::default()
            .with_min_delay(policy.initial_backoff)
            .with_max_delay(policy.max_backoff)
            .with_factor(policy.multiplier as f32)
            .with_max_times(max_retries)
            .build();
        Self { delays, jitter: policy.jitter, attempt: 1 }
    }

    /// Number of the attempt that the next delay precedes.
    pub(crate) fn next_attempt(&self) -> u32 {
        self.attempt + 1
    }

    /// Returns the jittered delay before the next attempt, or `None` when
    /// the policy is exhausted.
    pub(crate) fn next_delay(&mut self) -> Option<Duration> {
        let delay = self.delays.next()?;
        self.attempt += 1;
        Some(apply_jitter(delay, self.jitter))
    }
}

/// Sleeps for `delay` unless `token` fires first.
///
/// Returns `false` if cancelled.
pub(crate) async fn sleep_unless_cancelled(
    delay: Duration,
    token: Option<&CancellationToken>,
) -> bool {
    let Some(token) = token else {
        tokio::time::sleep(delay).await;
        return true;
    };
    tokio::select! {
        biased;
        () = token.cancelled() => false,
        () = tokio::time::sleep(delay) => true,
    }
}

/// Waits out the next backoff of `schedule`.
///
/// Returns `false` when the schedule is exhausted or the token fired.
pub(crate) async fn backoff(
    schedule: &mut RetrySchedule,
    operation: &str,
    pending: usize,
    token: Option<&CancellationToken>,
) -> bool {
    let attempt = schedule.next_attempt();
    let Some(delay) = schedule.next_delay() else {
        return false;
    };
    debug!(
        operation,
        attempt,
        pending,
        backoff_ms = delay.as_millis() as u64,
        "retrying unprocessed batch items after backoff"
    );
    sleep_unless_cancelled(delay, token).await
}

/// Randomizes `dur` within `[dur * (1 - factor), dur * (1 + factor)]`.
fn apply_jitter(dur: Duration, factor: f64) -> Duration {
    if factor <= 0.0 {
        return dur;
    }

    let factor = factor.clamp(0.0, 1.0);
    let base_nanos = dur.as_nanos() as f64;
    let min_nanos = base_nanos * (1.0 - factor);
    let max_nanos = base_nanos * (1.0 + factor);

    let jittered_nanos = rand::thread_rng().gen_range(min_nanos..=max_nanos);
    Duration::from_nanos(jittered_nanos as u64)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::disallowed_methods)]
mod tests {
    use super::*;

    fn policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::builder()
            .max_attempts(max_attempts)
            .initial_backoff(Duration::from_millis(10))
            .max_backoff(Duration::from_millis(40))
            .multiplier(2.0)
            .jitter(0.0)
            .build()
            .unwrap()
    }

    #[test]
    fn test_schedule_grows_and_caps() {
        let mut schedule = RetrySchedule::new(&policy(5));
        let delays: Vec<_> = std::iter::from_fn(|| schedule.next_delay()).collect();
        assert_eq!(
            delays,
            vec![
                Duration::from_millis(10),
                Duration::from_millis(20),
                Duration::from_millis(40),
                Duration::from_millis(40),
            ]
        );
    }

    #[test]
    fn test_single_attempt_never_retries() {
        let mut schedule = RetrySchedule::new(&RetryPolicy::no_retry());
        assert_eq!(schedule.next_delay(), None);
    }

    #[test]
    fn test_attempt_numbering() {
        let mut schedule = RetrySchedule::new(&policy(3));
        assert_eq!(schedule.next_attempt(), 2);
        schedule.next_delay();
        assert_eq!(schedule.next_attempt(), 3);
    }

    #[test]
    fn test_jitter_stays_in_range() {
        let base = Duration::from_millis(100);
        for _ in 0..100 {
            let jittered = apply_jitter(base, 0.5);
            assert!(jittered >= Duration::from_millis(50));
            assert!(jittered <= Duration::from_millis(150));
        }
        assert_eq!(apply_jitter(base, 0.0), base);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sleep_interrupted_by_cancellation() {
        let token = CancellationToken::new();
        token.cancel();
        assert!(!sleep_unless_cancelled(Duration::from_secs(60), Some(&token)).await);
        assert!(sleep_unless_cancelled(Duration::from_millis(5), None).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_exhausts() {
        let mut schedule = RetrySchedule::new(&policy(2));
        assert!(backoff(&mut schedule, "batch_write", 3, None).await);
        assert!(!backoff(&mut schedule, "batch_write", 3, None).await);
    }
}
