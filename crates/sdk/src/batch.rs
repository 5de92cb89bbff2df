//! Batch orchestration.
//!
//! Bulk writes and gets are split into chunks no larger than the store's
//! per-call limit and dispatched with bounded concurrency. Items the store
//! reports as unprocessed, and chunks whose call failed with a retryable
//! error, are collected into the next round. Rounds are separated by the
//! table's retry backoff and stop when nothing is pending, the retry policy
//! is exhausted, or the caller cancels.
//!
//! Cancellation stops new chunk dispatches. Chunks already in flight run to
//! completion and their results are kept.
//!
//! A non-retryable chunk failure ends the batch after the current round. The
//! failed chunk stays pending and the error is kept in the outcome next to
//! whatever the other chunks applied.

use std::time::Instant;

use futures::{StreamExt, stream};
use tessera_types::{
    BatchGetRequest, BatchWriteRequest, Item, Store, StoreError, WriteRequest,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{
    config::TableConfig,
    error::Result,
    retry::{RetrySchedule, backoff},
};

/// Result of a batch write across all rounds.
#[derive(Debug, Default)]
pub(crate) struct WriteOutcome {
    pub processed: Vec<WriteRequest>,
    pub unprocessed: Vec<WriteRequest>,
    pub cancelled: bool,
    pub fatal: Option<StoreError>,
}

/// Result of a batch get across all rounds.
#[derive(Debug, Default)]
pub(crate) struct GetOutcome {
    pub items: Vec<Item>,
    /// Keys answered by a successful chunk, found or not.
    pub answered: usize,
    pub unprocessed: Vec<Item>,
    pub cancelled: bool,
    pub fatal: Option<StoreError>,
}

enum ChunkResult<T> {
    Done(T),
    Failed(StoreError),
    Skipped,
}

/// Drives one bulk operation against a table.
pub(crate) struct BatchOrchestrator<'a> {
    store: &'a dyn Store,
    config: &'a TableConfig,
    concurrency: usize,
    cancellation: Option<&'a CancellationToken>,
}

impl<'a> BatchOrchestrator<'a> {
    pub(crate) fn new(store: &'a dyn Store, config: &'a TableConfig) -> Self {
        Self {
            store,
            config,
            concurrency: config.batch.concurrency,
            cancellation: None,
        }
    }

    pub(crate) fn with_concurrency(mut self, concurrency: Option<usize>) -> Self {
        if let Some(concurrency) = concurrency {
            self.concurrency = concurrency.max(1);
        }
        self
    }

    pub(crate) fn with_cancellation(mut self, token: Option<&'a CancellationToken>) -> Self {
        self.cancellation = token;
        self
    }

    fn cancelled(&self) -> bool {
        self.cancellation.is_some_and(CancellationToken::is_cancelled)
    }

    /// Applies `writes`, retrying unprocessed items.
    ///
    /// Items left unprocessed, and a non-retryable chunk failure, are
    /// reported in the outcome.
    pub(crate) async fn write(&self, writes: Vec<WriteRequest>) -> WriteOutcome {
        const OPERATION: &str = "batch_write";
        let chunk_size = self.config.batch.write_chunk_size;
        let mut schedule = RetrySchedule::new(&self.config.retry_policy);
        let mut outcome = WriteOutcome::default();
        let mut pending = writes;

        loop {
            let chunks: Vec<Vec<WriteRequest>> =
                pending.chunks(chunk_size).map(<[WriteRequest]>::to_vec).collect();
            debug!(operation = OPERATION, chunks = chunks.len(), items = pending.len(), "Dispatching batch round");

            let results: Vec<(Vec<WriteRequest>, ChunkResult<Vec<WriteRequest>>)> =
                stream::iter(chunks)
                    .map(|chunk| async move {
                        if self.cancelled() {
                            return (chunk, ChunkResult::Skipped);
                        }
                        let request = BatchWriteRequest {
                            table: self.config.table.clone(),
                            writes: chunk.clone(),
                        };
                        match self.store.batch_write(request).await {
                            Ok(response) => (chunk, ChunkResult::Done(response.unprocessed)),
                            Err(e) => (chunk, ChunkResult::Failed(e)),
                        }
                    })
                    .buffer_unordered(self.concurrency)
                    .collect()
                    .await;

            let mut next = Vec::new();
            for (chunk, result) in results {
                match result {
                    ChunkResult::Done(unprocessed) => {
                        outcome.processed.extend(chunk.into_iter().filter(|w| !unprocessed.contains(w)));
                        next.extend(unprocessed);
                    },
                    ChunkResult::Failed(e) if e.is_retryable() => {
                        debug!(operation = OPERATION, error = %e, items = chunk.len(), "Batch chunk failed, will retry");
                        next.extend(chunk);
                    },
                    ChunkResult::Failed(e) => {
                        warn!(operation = OPERATION, error = %e, items = chunk.len(), "Batch chunk failed");
                        outcome.fatal.get_or_insert(e);
                        next.extend(chunk);
                    },
                    ChunkResult::Skipped => {
                        outcome.cancelled = true;
                        next.extend(chunk);
                    },
                }
            }
            pending = next;
            if pending.is_empty() || outcome.fatal.is_some() {
                break;
            }
            if outcome.cancelled || self.cancelled() {
                outcome.cancelled = true;
                break;
            }
            let attempt = schedule.next_attempt();
            if !backoff(&mut schedule, OPERATION, pending.len(), self.cancellation).await {
                outcome.cancelled = self.cancelled();
                break;
            }
            self.config.metrics.record_retry(OPERATION, attempt);
        }

        if !pending.is_empty() {
            warn!(
                operation = OPERATION,
                unprocessed = pending.len(),
                cancelled = outcome.cancelled,
                "Batch finished with unprocessed items"
            );
            self.config.metrics.record_unprocessed(OPERATION, pending.len());
        }
        outcome.unprocessed = pending;
        outcome
    }

    /// Fetches `keys`, retrying unprocessed keys.
    ///
    /// Keys left unprocessed, and a non-retryable chunk failure, are
    /// reported in the outcome.
    pub(crate) async fn get(&self, keys: Vec<Item>, consistent_read: bool) -> GetOutcome {
        const OPERATION: &str = "batch_get";
        let chunk_size = self.config.batch.get_chunk_size;
        let mut schedule = RetrySchedule::new(&self.config.retry_policy);
        let mut outcome = GetOutcome::default();
        let mut pending = keys;

        loop {
            let chunks: Vec<Vec<Item>> = pending.chunks(chunk_size).map(<[Item]>::to_vec).collect();
            debug!(operation = OPERATION, chunks = chunks.len(), keys = pending.len(), "Dispatching batch round");

            let results: Vec<(Vec<Item>, ChunkResult<(Vec<Item>, Vec<Item>)>)> = stream::iter(chunks)
                .map(|chunk| async move {
                    if self.cancelled() {
                        return (chunk, ChunkResult::Skipped);
                    }
                    let request = BatchGetRequest {
                        table: self.config.table.clone(),
                        keys: chunk.clone(),
                        consistent_read,
                    };
                    match self.store.batch_get(request).await {
                        Ok(response) => {
                            (chunk, ChunkResult::Done((response.items, response.unprocessed_keys)))
                        },
                        Err(e) => (chunk, ChunkResult::Failed(e)),
                    }
                })
                .buffer_unordered(self.concurrency)
                .collect()
                .await;

            let mut next = Vec::new();
            let mut fatal: Option<StoreError> = None;
            for (chunk, result) in results {
                match result {
                    ChunkResult::Done((items, unprocessed)) => {
                        outcome.answered += chunk.len().saturating_sub(unprocessed.len());
                        outcome.items.extend(items);
                        next.extend(unprocessed);
                    },
                    ChunkResult::Failed(e) if e.is_retryable() => {
                        debug!(operation = OPERATION, error = %e, keys = chunk.len(), "Batch chunk failed, will retry");
                        next.extend(chunk);
                    },
                    ChunkResult::Failed(e) => {
                        warn!(operation = OPERATION, error = %e, keys = chunk.len(), "Batch chunk failed");
                        outcome.fatal.get_or_insert(e);
                        next.extend(chunk);
                    },
                    ChunkResult::Skipped => {
                        outcome.cancelled = true;
                        next.extend(chunk);
                    },
                }
            }
            pending = next;
            if pending.is_empty() || outcome.fatal.is_some() {
                break;
            }
            if outcome.cancelled || self.cancelled() {
                outcome.cancelled = true;
                break;
            }
            let attempt = schedule.next_attempt();
            if !backoff(&mut schedule, OPERATION, pending.len(), self.cancellation).await {
                outcome.cancelled = self.cancelled();
                break;
            }
            self.config.metrics.record_retry(OPERATION, attempt);
        }

        if !pending.is_empty() {
            warn!(
                operation = OPERATION,
                unprocessed = pending.len(),
                cancelled = outcome.cancelled,
                "Batch finished with unprocessed keys"
            );
            self.config.metrics.record_unprocessed(OPERATION, pending.len());
        }
        outcome.unprocessed = pending;
        outcome
    }
}

/// Times `f` and records it under `operation`.
pub(crate) async fn timed<T, F>(config: &TableConfig, operation: &str, f: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    let start = Instant::now();
    let result = f.await;
    config.metrics.record_request(operation, start.elapsed(), result.is_ok());
    result
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::disallowed_methods)]
mod tests {
    use std::{sync::Arc, time::Duration};

    use tessera_types::{
        AttributeValue,
        config::{BatchConfig, RetryPolicy},
        item,
    };

    use super::*;
    use crate::mock::{MockStore, TableLayout};

    fn config(write_chunk_size: usize, concurrency: usize, max_attempts: u32) -> TableConfig {
        TableConfig::builder()
            .with_table("ledger")
            .with_batch(
                BatchConfig::builder()
                    .write_chunk_size(write_chunk_size)
                    .get_chunk_size(10)
                    .concurrency(concurrency)
                    .build()
                    .unwrap(),
            )
            .with_retry_policy(
                RetryPolicy::builder()
                    .max_attempts(max_attempts)
                    .initial_backoff(Duration::from_millis(1))
                    .max_backoff(Duration::from_millis(5))
                    .jitter(0.0)
                    .build()
                    .unwrap(),
            )
            .build()
            .unwrap()
    }

    fn store() -> Arc<MockStore> {
        Arc::new(MockStore::new(TableLayout::new("pk", Some("sk"))))
    }

    fn puts(n: usize) -> Vec<WriteRequest> {
        (0..n)
            .map(|i| WriteRequest::Put(item! { "pk" => "p", "sk" => format!("s{i:03}"), "n" => i }))
            .collect()
    }

    #[tokio::test]
    async fn test_write_chunks_and_completes() {
        let store = store();
        let config = config(25, 2, 3);
        let outcome = BatchOrchestrator::new(store.as_ref(), &config).write(puts(37)).await;
        assert_eq!(outcome.processed.len(), 37);
        assert!(outcome.unprocessed.is_empty());
        assert!(!outcome.cancelled);
        assert_eq!(store.batch_write_calls(), 2);
        assert_eq!(store.len(), 37);
    }

    #[tokio::test]
    async fn test_unprocessed_items_are_retried() {
        let store = store();
        store.inject_unprocessed(5);
        let config = config(25, 1, 3);
        let outcome = BatchOrchestrator::new(store.as_ref(), &config).write(puts(30)).await;
        assert_eq!(outcome.processed.len(), 30);
        assert!(outcome.unprocessed.is_empty());
        assert!(store.batch_write_calls() > 2);
    }

    #[tokio::test]
    async fn test_exhausted_retries_report_unprocessed() {
        let store = store();
        store.inject_unprocessed(usize::MAX);
        let config = config(10, 1, 2);
        let outcome = BatchOrchestrator::new(store.as_ref(), &config).write(puts(4)).await;
        assert!(outcome.processed.is_empty());
        assert_eq!(outcome.unprocessed.len(), 4);
        assert_eq!(store.batch_write_calls(), 2);
    }

    #[tokio::test]
    async fn test_retryable_chunk_failure_is_retried() {
        let store = store();
        store.inject_error(StoreError::Throttled { message: "slow down".to_owned() });
        let config = config(25, 1, 3);
        let outcome = BatchOrchestrator::new(store.as_ref(), &config).write(puts(3)).await;
        assert_eq!(outcome.processed.len(), 3);
        assert_eq!(store.batch_write_calls(), 2);
    }

    #[tokio::test]
    async fn test_fatal_chunk_failure_is_kept_in_outcome() {
        let store = store();
        store.inject_error(StoreError::Validation { message: "item too large".to_owned() });
        let config = config(25, 1, 3);
        let outcome = BatchOrchestrator::new(store.as_ref(), &config).write(puts(3)).await;
        assert!(matches!(outcome.fatal, Some(StoreError::Validation { .. })));
        assert!(outcome.processed.is_empty());
        assert_eq!(outcome.unprocessed.len(), 3);
        assert_eq!(store.batch_write_calls(), 1);
    }

    #[tokio::test]
    async fn test_fatal_chunk_keeps_committed_chunks() {
        let store = store();
        store.inject_error_after(1, StoreError::Validation { message: "item too large".to_owned() });
        let config = config(10, 1, 3);
        let outcome = BatchOrchestrator::new(store.as_ref(), &config).write(puts(23)).await;
        assert!(matches!(outcome.fatal, Some(StoreError::Validation { .. })));
        assert_eq!(outcome.processed.len(), 13);
        assert_eq!(outcome.unprocessed.len(), 10);
        assert_eq!(store.len(), 13);
        assert_eq!(store.batch_write_calls(), 3, "no retry round after a fatal failure");
    }

    #[tokio::test]
    async fn test_fatal_get_chunk_keeps_answered_keys() {
        let store = store();
        let config = config(25, 1, 3);
        BatchOrchestrator::new(store.as_ref(), &config).write(puts(25)).await;
        store.inject_error_after(1, StoreError::Validation { message: "bad key".to_owned() });

        let keys: Vec<Item> =
            (0..25).map(|i| item! { "pk" => "p", "sk" => format!("s{i:03}") }).collect();
        let outcome = BatchOrchestrator::new(store.as_ref(), &config).get(keys, false).await;
        assert!(matches!(outcome.fatal, Some(StoreError::Validation { .. })));
        assert_eq!(outcome.items.len(), 15, "get chunks hold 10 keys");
        assert_eq!(outcome.answered, 15);
        assert_eq!(outcome.unprocessed.len(), 10);
    }

    #[tokio::test]
    async fn test_cancelled_before_dispatch() {
        let store = store();
        let config = config(2, 1, 3);
        let token = CancellationToken::new();
        token.cancel();
        let outcome = BatchOrchestrator::new(store.as_ref(), &config)
            .with_cancellation(Some(&token))
            .write(puts(5))
            .await;
        assert!(outcome.cancelled);
        assert_eq!(outcome.unprocessed.len(), 5);
        assert_eq!(store.batch_write_calls(), 0);
    }

    #[tokio::test]
    async fn test_concurrency_is_bounded() {
        let store = store();
        store.set_latency(Duration::from_millis(10));
        let config = config(1, 3, 1);
        BatchOrchestrator::new(store.as_ref(), &config).write(puts(9)).await;
        assert!(store.peak_in_flight() <= 3);
        assert!(store.peak_in_flight() >= 2);
    }

    #[tokio::test]
    async fn test_get_collects_across_chunks() {
        let store = store();
        let config = config(25, 2, 3);
        BatchOrchestrator::new(store.as_ref(), &config).write(puts(15)).await;
        store.inject_unprocessed(3);

        let keys: Vec<Item> =
            (0..15).map(|i| item! { "pk" => "p", "sk" => format!("s{i:03}") }).collect();
        let outcome = BatchOrchestrator::new(store.as_ref(), &config).get(keys, false).await;
        assert_eq!(outcome.items.len(), 15);
        assert!(outcome.unprocessed.is_empty());
        assert!(outcome.items.iter().all(|i| i.get("n").is_some_and(|n| matches!(n, AttributeValue::Number(_)))));
    }
}
