//! Table configuration and per-call execution options.
//!
//! [`TableConfig`] is shared by every entity mapped onto one physical table:
//! - Physical table name
//! - Batch chunking and concurrency
//! - Retry policy for unprocessed batch items
//! - Cursor signing key
//! - Metrics sink
//!
//! [`ExecuteOptions`] tunes a single terminal call.

use std::{fmt, sync::Arc};

use snafu::ensure;
use tessera_types::{
    config::{BatchConfig, RetryPolicy},
    validation::validate_identifier,
};
use tokio_util::sync::CancellationToken;

use crate::{
    error::{ConfigSnafu, Error, Result},
    metrics::{Metrics, default_metrics},
    pagination::{CURSOR_KEY_LENGTH, CursorCodec},
};

/// Configuration for one physical table.
#[derive(Clone)]
pub struct TableConfig {
    pub(crate) table: String,
    pub(crate) batch: BatchConfig,
    pub(crate) retry_policy: RetryPolicy,
    pub(crate) cursors: CursorCodec,
    pub(crate) metrics: Arc<dyn Metrics>,
}

impl TableConfig {
    /// Creates a new configuration builder.
    #[must_use]
    pub fn builder() -> TableConfigBuilder {
        TableConfigBuilder::default()
    }

    /// Returns the physical table name.
    #[must_use]
    pub fn table(&self) -> &str {
        &self.table
    }

    /// Returns the batch configuration.
    #[must_use]
    pub fn batch(&self) -> &BatchConfig {
        &self.batch
    }

    /// Returns the retry policy.
    #[must_use]
    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry_policy
    }

    /// Returns the metrics sink.
    #[must_use]
    pub fn metrics(&self) -> &Arc<dyn Metrics> {
        &self.metrics
    }
}

impl fmt::Debug for TableConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TableConfig")
            .field("table", &self.table)
            .field("batch", &self.batch)
            .field("retry_policy", &self.retry_policy)
            .field("metrics", &self.metrics)
            .finish_non_exhaustive()
    }
}

/// Builder for [`TableConfig`].
#[derive(Default)]
pub struct TableConfigBuilder {
    table: Option<String>,
    batch: Option<BatchConfig>,
    retry_policy: Option<RetryPolicy>,
    cursor_key: Option<[u8; CURSOR_KEY_LENGTH]>,
    metrics: Option<Arc<dyn Metrics>>,
}

impl TableConfigBuilder {
    /// Sets the physical table name. Required.
    #[must_use]
    pub fn with_table(mut self, table: impl Into<String>) -> Self {
        self.table = Some(table.into());
        self
    }

    /// Sets batch chunking and concurrency.
    ///
    /// Default: 25 writes or 100 gets per call, one chunk at a time.
    #[must_use]
    pub fn with_batch(mut self, batch: BatchConfig) -> Self {
        self.batch = Some(batch);
        self
    }

    /// Sets the retry policy for unprocessed batch items.
    ///
    /// Default: 3 attempts, 100ms initial backoff, doubling, capped at 10s.
    #[must_use]
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = Some(policy);
        self
    }

    /// Sets the key used to sign pagination cursors.
    ///
    /// Default: a key derived from the table name, so cursors stay valid
    /// across processes that share the table. Set an explicit secret when
    /// cursors are handed to untrusted callers.
    #[must_use]
    pub fn with_cursor_key(mut self, key: [u8; CURSOR_KEY_LENGTH]) -> Self {
        self.cursor_key = Some(key);
        self
    }

    /// Sets the metrics sink.
    #[must_use]
    pub fn with_metrics(mut self, metrics: Arc<dyn Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Builds the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the table name is missing or invalid, or
    /// the batch or retry settings are out of range.
    pub fn build(self) -> Result<TableConfig> {
        let Some(table) = self.table else {
            return ConfigSnafu { message: "table name is required" }.fail();
        };
        validate_identifier("table", &table)
            .map_err(|e| Error::Config { message: e.to_string() })?;

        let batch = self.batch.unwrap_or_default();
        batch.validate().map_err(|e| Error::Config { message: e.to_string() })?;
        let retry_policy = self.retry_policy.unwrap_or_default();
        retry_policy.validate().map_err(|e| Error::Config { message: e.to_string() })?;

        let key = self.cursor_key.unwrap_or_else(|| CursorCodec::derive_key(&table));
        Ok(TableConfig {
            table,
            batch,
            retry_policy,
            cursors: CursorCodec::new(key),
            metrics: self.metrics.unwrap_or_else(default_metrics),
        })
    }
}

/// Sort direction of a range query.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Order {
    /// Ascending sort-key order.
    #[default]
    Asc,
    /// Descending sort-key order.
    Desc,
}

/// How many store pages a terminal call may read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pages {
    /// Read at most this many pages.
    Count(u32),
    /// Read until the range is exhausted or `limit` rows are collected.
    All,
}

impl Default for Pages {
    fn default() -> Self {
        Self::Count(1)
    }
}

/// Options accepted by every terminal call.
///
/// Fields that do not apply to an operation are ignored by it.
#[derive(Debug, Clone, Default)]
pub struct ExecuteOptions {
    pub(crate) raw: bool,
    pub(crate) concurrency: Option<usize>,
    pub(crate) cursor: Option<String>,
    pub(crate) original_error: bool,
    pub(crate) limit: Option<u32>,
    pub(crate) pages: Pages,
    pub(crate) order: Order,
    pub(crate) ignore_ownership: bool,
    pub(crate) consistent: bool,
    pub(crate) cancellation: Option<CancellationToken>,
}

impl ExecuteOptions {
    /// Creates default options.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Skips the read pipeline: results are the physical rows as stored.
    #[must_use]
    pub fn with_raw(mut self, raw: bool) -> Self {
        self.raw = raw;
        self
    }

    /// Overrides the table's batch concurrency for this call.
    #[must_use]
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = Some(concurrency);
        self
    }

    /// Resumes a query from a cursor returned by a previous page.
    #[must_use]
    pub fn with_cursor(mut self, cursor: impl Into<String>) -> Self {
        self.cursor = Some(cursor.into());
        self
    }

    /// Returns [`Error::Store`] with the store's error unchanged instead of
    /// classifying it.
    #[must_use]
    pub fn with_original_error(mut self, original: bool) -> Self {
        self.original_error = original;
        self
    }

    /// Caps the number of rows returned.
    #[must_use]
    pub fn with_limit(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Caps the number of store pages read.
    #[must_use]
    pub fn with_pages(mut self, pages: Pages) -> Self {
        self.pages = pages;
        self
    }

    /// Sets the sort direction.
    #[must_use]
    pub fn with_order(mut self, order: Order) -> Self {
        self.order = order;
        self
    }

    /// Accepts rows without checking the record-type tags.
    #[must_use]
    pub fn with_ignore_ownership(mut self, ignore: bool) -> Self {
        self.ignore_ownership = ignore;
        self
    }

    /// Requests strongly consistent reads.
    #[must_use]
    pub fn with_consistent_read(mut self, consistent: bool) -> Self {
        self.consistent = consistent;
        self
    }

    /// Stops dispatching store calls once `token` fires.
    #[must_use]
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = Some(token);
        self
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if let Some(concurrency) = self.concurrency {
            ensure!(concurrency > 0, ConfigSnafu { message: "concurrency must be > 0" });
        }
        if let Some(limit) = self.limit {
            ensure!(limit > 0, ConfigSnafu { message: "limit must be > 0" });
        }
        if let Pages::Count(pages) = self.pages {
            ensure!(pages > 0, ConfigSnafu { message: "pages must be > 0" });
        }
        Ok(())
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.cancellation.as_ref().is_some_and(CancellationToken::is_cancelled)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::disallowed_methods)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn test_table_required() {
        let err = TableConfig::builder().build().unwrap_err();
        assert!(matches!(err, Error::Config { .. }));
        assert!(err.to_string().contains("table name is required"));
    }

    #[test]
    fn test_defaults() {
        let config = TableConfig::builder().with_table("ledger").build().unwrap();
        assert_eq!(config.table(), "ledger");
        assert_eq!(config.batch(), &BatchConfig::default());
        assert_eq!(config.retry_policy(), &RetryPolicy::default());
    }

    #[test]
    fn test_invalid_table_name() {
        assert!(TableConfig::builder().with_table("").build().is_err());
    }

    #[test]
    fn test_invalid_retry_policy_rejected() {
        let policy = RetryPolicy {
            initial_backoff: Duration::from_secs(20),
            ..RetryPolicy::default()
        };
        let err =
            TableConfig::builder().with_table("ledger").with_retry_policy(policy).build().unwrap_err();
        assert!(err.to_string().contains("initial_backoff"));
    }

    #[test]
    fn test_derived_cursor_keys_differ_per_table() {
        assert_ne!(CursorCodec::derive_key("a"), CursorCodec::derive_key("b"));
        assert_eq!(CursorCodec::derive_key("a"), CursorCodec::derive_key("a"));
    }

    #[test]
    fn test_execute_options_validation() {
        assert!(ExecuteOptions::new().validate().is_ok());
        assert!(ExecuteOptions::new().with_concurrency(0).validate().is_err());
        assert!(ExecuteOptions::new().with_limit(0).validate().is_err());
        assert!(ExecuteOptions::new().with_pages(Pages::Count(0)).validate().is_err());
        assert!(ExecuteOptions::new().with_pages(Pages::Count(2)).validate().is_ok());
    }

    #[test]
    fn test_cancellation_flag() {
        let token = CancellationToken::new();
        let options = ExecuteOptions::new().with_cancellation(token.clone());
        assert!(!options.is_cancelled());
        token.cancel();
        assert!(options.is_cancelled());
    }
}
