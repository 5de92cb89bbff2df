//! The store capability consumed by the mapping layer.
//!
//! The mapping layer never talks to a wire client directly. It compiles every
//! operation into one of the request structs below and hands it to an
//! injected [`Store`]. The request structs are also what the `params()`
//! terminals return, so they serialize for inspection.
//!
//! Implementations must not retry on their own: unprocessed batch items and
//! throttling are reported back and the batch orchestrator decides what to do.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::{AttributeValue, Item, error::StoreError};

/// Placeholder maps referenced from expression strings.
///
/// `names` maps `#placeholder` to a physical field name; `values` maps
/// `:placeholder` to a value.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExpressionAttributes {
    /// `#name` placeholder to physical field.
    pub names: BTreeMap<String, String>,
    /// `:value` placeholder to value.
    pub values: BTreeMap<String, AttributeValue>,
}

impl ExpressionAttributes {
    /// Returns true if no placeholders are defined.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.names.is_empty() && self.values.is_empty()
    }
}

/// What a single-item write should return.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReturnValues {
    /// Return nothing.
    #[default]
    None,
    /// Return the item as it was before the write.
    AllOld,
    /// Return the item as it is after the write.
    AllNew,
}

/// Point lookup by primary key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GetRequest {
    /// Physical table name.
    pub table: String,
    /// Primary key fields.
    pub key: Item,
    /// Request a strongly consistent read.
    pub consistent_read: bool,
}

/// Full-item write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PutRequest {
    /// Physical table name.
    pub table: String,
    /// Item to store, including key fields.
    pub item: Item,
    /// Optional condition expression.
    pub condition: Option<String>,
    /// Placeholders referenced by `condition`.
    pub attributes: ExpressionAttributes,
}

/// Partial update of one item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateRequest {
    /// Physical table name.
    pub table: String,
    /// Primary key fields.
    pub key: Item,
    /// Update expression (`SET ... REMOVE ... ADD ... DELETE ...`).
    pub update: String,
    /// Optional condition expression.
    pub condition: Option<String>,
    /// Placeholders referenced by `update` and `condition`.
    pub attributes: ExpressionAttributes,
    /// What to return.
    pub return_values: ReturnValues,
}

/// Delete one item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeleteRequest {
    /// Physical table name.
    pub table: String,
    /// Primary key fields.
    pub key: Item,
    /// Optional condition expression.
    pub condition: Option<String>,
    /// Placeholders referenced by `condition`.
    pub attributes: ExpressionAttributes,
    /// What to return.
    pub return_values: ReturnValues,
}

/// Range query against the table or a secondary index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryRequest {
    /// Physical table name.
    pub table: String,
    /// Physical secondary index name, `None` for the table itself.
    pub index: Option<String>,
    /// Key condition expression.
    pub key_condition: String,
    /// Optional filter expression applied after the key condition.
    pub filter: Option<String>,
    /// Placeholders referenced by `key_condition` and `filter`.
    pub attributes: ExpressionAttributes,
    /// Maximum number of rows to evaluate.
    pub limit: Option<u32>,
    /// Continuation token from a previous page.
    pub exclusive_start_key: Option<Item>,
    /// Ascending sort-key order when true.
    pub scan_forward: bool,
}

/// Full scan of the table or a secondary index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanRequest {
    /// Physical table name.
    pub table: String,
    /// Physical secondary index name, `None` for the table itself.
    pub index: Option<String>,
    /// Optional filter expression.
    pub filter: Option<String>,
    /// Placeholders referenced by `filter`.
    pub attributes: ExpressionAttributes,
    /// Maximum number of rows to evaluate.
    pub limit: Option<u32>,
    /// Continuation token from a previous page.
    pub exclusive_start_key: Option<Item>,
}

/// One page of query or scan results.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Page {
    /// Rows that passed the filter.
    pub items: Vec<Item>,
    /// Continuation token, `None` when the range is exhausted.
    pub last_evaluated_key: Option<Item>,
}

/// Multi-key point lookup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchGetRequest {
    /// Physical table name.
    pub table: String,
    /// Primary keys to fetch.
    pub keys: Vec<Item>,
    /// Request strongly consistent reads.
    pub consistent_read: bool,
}

/// Result of one batch-get call.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BatchGetResponse {
    /// Rows found, in no particular order.
    pub items: Vec<Item>,
    /// Keys the store did not get to.
    pub unprocessed_keys: Vec<Item>,
}

/// A single put or delete inside a batch write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum WriteRequest {
    /// Store an item.
    Put(Item),
    /// Delete by primary key.
    Delete(Item),
}

/// Multi-item write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchWriteRequest {
    /// Physical table name.
    pub table: String,
    /// Writes to apply.
    pub writes: Vec<WriteRequest>,
}

/// Result of one batch-write call.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BatchWriteResponse {
    /// Writes the store did not apply.
    pub unprocessed: Vec<WriteRequest>,
}

/// Result type for store calls.
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// A partition-key/sort-key store with secondary indexes.
///
/// Every method is a single call to the underlying store. Implementations
/// must be safe to call concurrently; the batch orchestrator issues several
/// calls at once up to the configured concurrency.
#[async_trait]
pub trait Store: Send + Sync {
    /// Fetches one item by primary key.
    async fn get(&self, request: GetRequest) -> StoreResult<Option<Item>>;

    /// Writes one item.
    async fn put(&self, request: PutRequest) -> StoreResult<()>;

    /// Updates one item, returning what `return_values` asks for.
    async fn update(&self, request: UpdateRequest) -> StoreResult<Option<Item>>;

    /// Deletes one item, returning what `return_values` asks for.
    async fn delete(&self, request: DeleteRequest) -> StoreResult<Option<Item>>;

    /// Runs a key-condition query.
    async fn query(&self, request: QueryRequest) -> StoreResult<Page>;

    /// Scans the table or an index.
    async fn scan(&self, request: ScanRequest) -> StoreResult<Page>;

    /// Fetches several items by primary key.
    async fn batch_get(&self, request: BatchGetRequest) -> StoreResult<BatchGetResponse>;

    /// Applies several puts and deletes.
    async fn batch_write(&self, request: BatchWriteRequest) -> StoreResult<BatchWriteResponse>;
}
