//! In-memory [`Store`] for tests.
//!
//! [`MockStore`] holds a single table and evaluates the same expression
//! language the mapper compiles, so builders can be exercised end to end
//! without a real backend.
//!
//! # Features
//!
//! - **Key layout**: Table key fields plus any number of secondary indexes
//! - **Expression evaluation**: Key conditions, filters, conditions, updates
//! - **Paging**: `limit` counts evaluated rows before filtering, and an
//!   optional page size caps every response
//! - **Failure injection**: One-shot errors, unprocessed batch items, latency
//! - **Call counting**: Per-operation counts and peak concurrency
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use tessera::mock::{MockStore, TableLayout};
//!
//! let store = Arc::new(MockStore::new(
//!     TableLayout::new("pk", Some("sk")).with_index("gsi1", "gsi1pk", Some("gsi1sk")),
//! ));
//! store.inject_unprocessed(3);
//! ```

mod expr;

use std::{
    cmp::Ordering as CmpOrdering,
    collections::{BTreeMap, HashMap, VecDeque},
    sync::atomic::{AtomicU64, AtomicUsize, Ordering},
    time::Duration,
};

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use tessera_types::{
    AttributeValue, BatchGetRequest, BatchGetResponse, BatchWriteRequest, BatchWriteResponse,
    DeleteRequest, ExpressionAttributes, GetRequest, Item, Page, PutRequest, QueryRequest,
    ReturnValues, ScanRequest, Store, StoreError, StoreResult, UpdateRequest, WriteRequest,
};

use self::expr::{parse_condition, parse_update};

/// Most writes one `batch_write` call accepts.
pub const MAX_BATCH_WRITE: usize = 25;

/// Most keys one `batch_get` call accepts.
pub const MAX_BATCH_GET: usize = 100;

/// Partition and optional sort field of one index.
#[derive(Debug, Clone, PartialEq, Eq)]
struct KeyFields {
    pk: String,
    sk: Option<String>,
}

impl KeyFields {
    fn fields(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.pk.as_str()).chain(self.sk.as_deref())
    }
}

/// Physical key layout of the mocked table.
#[derive(Debug, Clone)]
pub struct TableLayout {
    table: KeyFields,
    indexes: BTreeMap<String, KeyFields>,
}

impl TableLayout {
    /// Creates a layout with the given table key fields.
    pub fn new(pk: impl Into<String>, sk: Option<&str>) -> Self {
        Self { table: KeyFields { pk: pk.into(), sk: sk.map(str::to_owned) }, indexes: BTreeMap::new() }
    }

    /// Adds a secondary index.
    #[must_use]
    pub fn with_index(mut self, name: impl Into<String>, pk: impl Into<String>, sk: Option<&str>) -> Self {
        self.indexes.insert(name.into(), KeyFields { pk: pk.into(), sk: sk.map(str::to_owned) });
        self
    }

    fn index(&self, name: Option<&str>) -> StoreResult<&KeyFields> {
        match name {
            None => Ok(&self.table),
            Some(name) => self
                .indexes
                .get(name)
                .ok_or_else(|| StoreError::Validation { message: format!("unknown index '{name}'") }),
        }
    }
}

/// Storage key of a row: table partition and sort values.
type RowKey = (String, String);

fn key_string(item: &Item, field: &str) -> Option<String> {
    match item.get(field)? {
        AttributeValue::String(s) => Some(s.clone()),
        AttributeValue::Number(n) => Some(n.to_string()),
        AttributeValue::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// Decrements the in-flight gauge when a call finishes.
struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// In-memory single-table store.
#[derive(Debug)]
pub struct MockStore {
    layout: TableLayout,

    /// Rows keyed by table partition and sort value.
    rows: RwLock<BTreeMap<RowKey, Item>>,

    /// Batch items still to be reported unprocessed.
    unprocessed_budget: AtomicUsize,

    /// Errors returned by the next calls, one per call.
    pending_errors: Mutex<VecDeque<Option<StoreError>>>,

    /// Delay applied to every call (milliseconds).
    latency_ms: AtomicU64,

    /// Cap on items per query or scan response; zero means none.
    page_size: AtomicUsize,

    /// Calls received per operation.
    calls: Mutex<HashMap<&'static str, usize>>,

    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,

    /// Most recent query request.
    last_query: Mutex<Option<QueryRequest>>,
}

impl MockStore {
    /// Creates an empty store with the given layout.
    pub fn new(layout: TableLayout) -> Self {
        Self {
            layout,
            rows: RwLock::new(BTreeMap::new()),
            unprocessed_budget: AtomicUsize::new(0),
            pending_errors: Mutex::new(VecDeque::new()),
            latency_ms: AtomicU64::new(0),
            page_size: AtomicUsize::new(0),
            calls: Mutex::new(HashMap::new()),
            in_flight: AtomicUsize::new(0),
            peak_in_flight: AtomicUsize::new(0),
            last_query: Mutex::new(None),
        }
    }

    /// Stores a physical row as-is, bypassing conditions.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Validation`] if the row lacks a table key field.
    pub fn insert_raw(&self, item: Item) -> StoreResult<()> {
        let key = self.row_key(&item)?;
        self.rows.write().insert(key, item);
        Ok(())
    }

    /// Returns every stored row in key order.
    pub fn rows(&self) -> Vec<Item> {
        self.rows.read().values().cloned().collect()
    }

    /// Number of stored rows.
    pub fn len(&self) -> usize {
        self.rows.read().len()
    }

    /// Returns true if no rows are stored.
    pub fn is_empty(&self) -> bool {
        self.rows.read().is_empty()
    }

    /// Reports the next `count` batch items (writes or keys) as unprocessed.
    /// The tail of each request is held back first.
    pub fn inject_unprocessed(&self, count: usize) {
        self.unprocessed_budget.store(count, Ordering::SeqCst);
    }

    /// Fails the next call with `error`. Repeated injections queue up.
    pub fn inject_error(&self, error: StoreError) {
        self.pending_errors.lock().push_back(Some(error));
    }

    /// Lets the next `calls` calls through, then fails one with `error`.
    pub fn inject_error_after(&self, calls: usize, error: StoreError) {
        let mut pending = self.pending_errors.lock();
        pending.extend(std::iter::repeat_n(None, calls));
        pending.push_back(Some(error));
    }

    /// Delays every call by `latency`.
    pub fn set_latency(&self, latency: Duration) {
        let millis = u64::try_from(latency.as_millis()).unwrap_or(u64::MAX);
        self.latency_ms.store(millis, Ordering::SeqCst);
    }

    /// Caps every query and scan response at `size` items.
    pub fn set_page_size(&self, size: Option<usize>) {
        self.page_size.store(size.unwrap_or(0), Ordering::SeqCst);
    }

    /// Number of calls received for `operation` (`"get"`, `"query"`, ...).
    pub fn calls(&self, operation: &str) -> usize {
        self.calls.lock().get(operation).copied().unwrap_or(0)
    }

    /// Number of `batch_write` calls received.
    pub fn batch_write_calls(&self) -> usize {
        self.calls("batch_write")
    }

    /// Number of `batch_get` calls received.
    pub fn batch_get_calls(&self) -> usize {
        self.calls("batch_get")
    }

    /// Highest number of calls that were in progress at once.
    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    /// The most recent query request received.
    pub fn last_query(&self) -> Option<QueryRequest> {
        self.last_query.lock().clone()
    }

    /// Clears counters and injected failures, keeping the rows.
    pub fn reset(&self) {
        self.calls.lock().clear();
        self.pending_errors.lock().clear();
        self.unprocessed_budget.store(0, Ordering::SeqCst);
        self.latency_ms.store(0, Ordering::SeqCst);
        self.peak_in_flight.store(0, Ordering::SeqCst);
    }

    async fn begin(&self, operation: &'static str) -> StoreResult<InFlight<'_>> {
        *self.calls.lock().entry(operation).or_default() += 1;
        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(current, Ordering::SeqCst);
        let guard = InFlight(&self.in_flight);

        let latency = self.latency_ms.load(Ordering::SeqCst);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }
        if let Some(Some(error)) = self.pending_errors.lock().pop_front() {
            return Err(error);
        }
        Ok(guard)
    }

    /// Takes up to `requested` items from the unprocessed budget.
    fn take_unprocessed(&self, requested: usize) -> usize {
        let previous = self
            .unprocessed_budget
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |budget| Some(budget - budget.min(requested)))
            .unwrap_or(0);
        previous.min(requested)
    }

    fn row_key(&self, item: &Item) -> StoreResult<RowKey> {
        let table = &self.layout.table;
        let missing = |field: &str| StoreError::Validation { message: format!("missing key field '{field}'") };
        let pk = key_string(item, &table.pk).ok_or_else(|| missing(&table.pk))?;
        let sk = match &table.sk {
            Some(field) => key_string(item, field).ok_or_else(|| missing(field))?,
            None => String::new(),
        };
        Ok((pk, sk))
    }

    fn check_condition(
        condition: Option<&str>,
        attributes: &ExpressionAttributes,
        existing: Option<&Item>,
    ) -> StoreResult<()> {
        let Some(condition) = condition else {
            return Ok(());
        };
        let parsed = parse_condition(condition, attributes)?;
        let empty = Item::new();
        if parsed.evaluate(existing.unwrap_or(&empty)) {
            Ok(())
        } else {
            Err(StoreError::ConditionalCheckFailed { message: "the conditional request failed".to_owned() })
        }
    }

    /// Sort position of a row within an index: index sort value, then the
    /// table key.
    fn position(&self, index: &KeyFields, row: &Item) -> Vec<String> {
        let table = &self.layout.table;
        [Some(index.pk.as_str()), index.sk.as_deref(), Some(table.pk.as_str()), table.sk.as_deref()]
            .into_iter()
            .flatten()
            .map(|field| key_string(row, field).unwrap_or_default())
            .collect()
    }

    /// Key fields returned as `last_evaluated_key`.
    fn evaluated_key(&self, index: &KeyFields, row: &Item) -> Item {
        self.layout
            .table
            .fields()
            .chain(index.fields())
            .filter_map(|field| row.get(field).map(|value| (field.to_owned(), value.clone())))
            .collect()
    }

    /// Rows present in `index`, in index order, starting after `start`.
    fn index_rows(&self, index: &KeyFields, start: Option<&Item>, forward: bool) -> Vec<(Vec<String>, Item)> {
        let rows = self.rows.read();
        let mut ordered: Vec<(Vec<String>, Item)> = rows
            .values()
            .filter(|row| index.fields().all(|field| key_string(row, field).is_some()))
            .map(|row| (self.position(index, row), row.clone()))
            .collect();
        ordered.sort_by(|a, b| a.0.cmp(&b.0));
        if !forward {
            ordered.reverse();
        }
        if let Some(start) = start {
            let start = self.position(index, start);
            ordered.retain(|(position, _)| {
                let ordering = position.cmp(&start);
                if forward { ordering == CmpOrdering::Greater } else { ordering == CmpOrdering::Less }
            });
        }
        ordered
    }

    /// Applies limit, page size and filter to candidate rows.
    fn page(
        &self,
        index: &KeyFields,
        candidates: Vec<(Vec<String>, Item)>,
        filter: Option<&expr::Condition>,
        limit: Option<u32>,
    ) -> Page {
        let page_size = self.page_size.load(Ordering::SeqCst);
        let mut cap = limit.map_or(usize::MAX, |l| l as usize);
        if page_size > 0 {
            cap = cap.min(page_size);
        }
        let more = candidates.len() > cap;
        let evaluated: Vec<Item> = candidates.into_iter().take(cap).map(|(_, row)| row).collect();
        let last_evaluated_key = if more { evaluated.last().map(|row| self.evaluated_key(index, row)) } else { None };
        let items = evaluated.into_iter().filter(|row| filter.is_none_or(|f| f.evaluate(row))).collect();
        Page { items, last_evaluated_key }
    }
}

#[async_trait]
impl Store for MockStore {
    async fn get(&self, request: GetRequest) -> StoreResult<Option<Item>> {
        let _call = self.begin("get").await?;
        let key = self.row_key(&request.key)?;
        Ok(self.rows.read().get(&key).cloned())
    }

    async fn put(&self, request: PutRequest) -> StoreResult<()> {
        let _call = self.begin("put").await?;
        let key = self.row_key(&request.item)?;
        let mut rows = self.rows.write();
        Self::check_condition(request.condition.as_deref(), &request.attributes, rows.get(&key))?;
        rows.insert(key, request.item);
        Ok(())
    }

    async fn update(&self, request: UpdateRequest) -> StoreResult<Option<Item>> {
        let _call = self.begin("update").await?;
        let key = self.row_key(&request.key)?;
        let update = parse_update(&request.update, &request.attributes)?;
        let mut rows = self.rows.write();
        let existing = rows.get(&key).cloned();
        Self::check_condition(request.condition.as_deref(), &request.attributes, existing.as_ref())?;

        let mut updated = existing.clone().unwrap_or_else(|| request.key.clone());
        update.apply(&mut updated)?;
        if self.row_key(&updated)? != key {
            return Err(StoreError::Validation { message: "update may not change table key fields".to_owned() });
        }
        rows.insert(key, updated.clone());
        Ok(match request.return_values {
            ReturnValues::None => None,
            ReturnValues::AllOld => existing,
            ReturnValues::AllNew => Some(updated),
        })
    }

    async fn delete(&self, request: DeleteRequest) -> StoreResult<Option<Item>> {
        let _call = self.begin("delete").await?;
        let key = self.row_key(&request.key)?;
        let mut rows = self.rows.write();
        Self::check_condition(request.condition.as_deref(), &request.attributes, rows.get(&key))?;
        let removed = rows.remove(&key);
        Ok(match request.return_values {
            ReturnValues::AllOld => removed,
            ReturnValues::None | ReturnValues::AllNew => None,
        })
    }

    async fn query(&self, request: QueryRequest) -> StoreResult<Page> {
        let _call = self.begin("query").await?;
        *self.last_query.lock() = Some(request.clone());
        let index = self.layout.index(request.index.as_deref())?;
        let key_condition = parse_condition(&request.key_condition, &request.attributes)?;
        let filter = request.filter.as_deref().map(|f| parse_condition(f, &request.attributes)).transpose()?;

        let mut candidates =
            self.index_rows(index, request.exclusive_start_key.as_ref(), request.scan_forward);
        candidates.retain(|(_, row)| key_condition.evaluate(row));
        Ok(self.page(index, candidates, filter.as_ref(), request.limit))
    }

    async fn scan(&self, request: ScanRequest) -> StoreResult<Page> {
        let _call = self.begin("scan").await?;
        let index = self.layout.index(request.index.as_deref())?;
        let filter = request.filter.as_deref().map(|f| parse_condition(f, &request.attributes)).transpose()?;
        let candidates = self.index_rows(index, request.exclusive_start_key.as_ref(), true);
        Ok(self.page(index, candidates, filter.as_ref(), request.limit))
    }

    async fn batch_get(&self, request: BatchGetRequest) -> StoreResult<BatchGetResponse> {
        let _call = self.begin("batch_get").await?;
        if request.keys.len() > MAX_BATCH_GET {
            return Err(StoreError::Validation {
                message: format!("batch_get accepts at most {MAX_BATCH_GET} keys, got {}", request.keys.len()),
            });
        }
        let held = self.take_unprocessed(request.keys.len());
        let served = request.keys.len() - held;
        let mut keys = request.keys;
        let unprocessed_keys = keys.split_off(served);

        let rows = self.rows.read();
        let mut items = Vec::with_capacity(keys.len());
        for key in &keys {
            if let Some(row) = rows.get(&self.row_key(key)?) {
                items.push(row.clone());
            }
        }
        Ok(BatchGetResponse { items, unprocessed_keys })
    }

    async fn batch_write(&self, request: BatchWriteRequest) -> StoreResult<BatchWriteResponse> {
        let _call = self.begin("batch_write").await?;
        if request.writes.len() > MAX_BATCH_WRITE {
            return Err(StoreError::Validation {
                message: format!(
                    "batch_write accepts at most {MAX_BATCH_WRITE} writes, got {}",
                    request.writes.len()
                ),
            });
        }
        let held = self.take_unprocessed(request.writes.len());
        let applied = request.writes.len() - held;
        let mut writes = request.writes;
        let unprocessed = writes.split_off(applied);

        let keyed = writes
            .into_iter()
            .map(|write| {
                let key = match &write {
                    WriteRequest::Put(item) | WriteRequest::Delete(item) => self.row_key(item)?,
                };
                Ok((key, write))
            })
            .collect::<StoreResult<Vec<_>>>()?;
        let mut rows = self.rows.write();
        for (key, write) in keyed {
            match write {
                WriteRequest::Put(item) => {
                    rows.insert(key, item);
                },
                WriteRequest::Delete(_) => {
                    rows.remove(&key);
                },
            }
        }
        Ok(BatchWriteResponse { unprocessed })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::disallowed_methods)]
mod tests {
    use std::collections::BTreeMap;

    use tessera_types::item;

    use super::*;

    fn store() -> MockStore {
        MockStore::new(TableLayout::new("pk", Some("sk")).with_index("gsi1", "gsi1pk", Some("gsi1sk")))
    }

    fn attributes(names: &[(&str, &str)], values: &[(&str, AttributeValue)]) -> ExpressionAttributes {
        ExpressionAttributes {
            names: names.iter().map(|(k, v)| ((*k).to_owned(), (*v).to_owned())).collect(),
            values: values.iter().map(|(k, v)| ((*k).to_owned(), v.clone())).collect::<BTreeMap<_, _>>(),
        }
    }

    fn query(key_condition: &str, attrs: ExpressionAttributes, limit: Option<u32>) -> QueryRequest {
        QueryRequest {
            table: "t".to_owned(),
            index: None,
            key_condition: key_condition.to_owned(),
            filter: None,
            attributes: attrs,
            limit,
            exclusive_start_key: None,
            scan_forward: true,
        }
    }

    fn seed(store: &MockStore, n: usize) {
        for i in 0..n {
            store
                .insert_raw(item! { "pk" => "P", "sk" => format!("S{i:02}"), "n" => i })
                .unwrap();
        }
    }

    #[tokio::test]
    async fn test_query_pages_by_limit() {
        let store = store();
        seed(&store, 5);
        let attrs = attributes(&[("#pk", "pk")], &[(":pk0", "P".into())]);
        let first = store.query(query("#pk = :pk0", attrs.clone(), Some(2))).await.unwrap();
        assert_eq!(first.items.len(), 2);
        assert_eq!(first.last_evaluated_key, Some(item! { "pk" => "P", "sk" => "S01" }));

        let mut next = query("#pk = :pk0", attrs, Some(10));
        next.exclusive_start_key = first.last_evaluated_key;
        let rest = store.query(next).await.unwrap();
        assert_eq!(rest.items.len(), 3);
        assert!(rest.last_evaluated_key.is_none());
    }

    #[tokio::test]
    async fn test_limit_applies_before_filter() {
        let store = store();
        seed(&store, 4);
        let attrs = attributes(&[("#pk", "pk"), ("#n", "n")], &[(":pk0", "P".into()), (":n0", 3.into())]);
        let mut request = query("#pk = :pk0", attrs, Some(2));
        request.filter = Some("#n = :n0".to_owned());
        let page = store.query(request).await.unwrap();
        assert!(page.items.is_empty());
        assert!(page.last_evaluated_key.is_some());
    }

    #[tokio::test]
    async fn test_secondary_index_is_sparse() {
        let store = store();
        store.insert_raw(item! { "pk" => "P", "sk" => "1", "gsi1pk" => "G", "gsi1sk" => "b" }).unwrap();
        store.insert_raw(item! { "pk" => "P", "sk" => "2" }).unwrap();
        store.insert_raw(item! { "pk" => "P", "sk" => "3", "gsi1pk" => "G", "gsi1sk" => "a" }).unwrap();
        let attrs = attributes(&[("#gsi1pk", "gsi1pk")], &[(":gsi1pk0", "G".into())]);
        let mut request = query("#gsi1pk = :gsi1pk0", attrs, None);
        request.index = Some("gsi1".to_owned());
        let page = store.query(request).await.unwrap();
        let sks: Vec<&str> = page.items.iter().filter_map(|i| i.get("sk")?.as_str()).collect();
        assert_eq!(sks, vec!["3", "1"]);
    }

    #[tokio::test]
    async fn test_conditional_put() {
        let store = store();
        let attrs = attributes(&[("#pk", "pk")], &[]);
        let put = || PutRequest {
            table: "t".to_owned(),
            item: item! { "pk" => "P", "sk" => "S" },
            condition: Some("attribute_not_exists(#pk)".to_owned()),
            attributes: attrs.clone(),
        };
        store.put(put()).await.unwrap();
        let err = store.put(put()).await.unwrap_err();
        assert!(matches!(err, StoreError::ConditionalCheckFailed { .. }));
    }

    #[tokio::test]
    async fn test_batch_limits_and_unprocessed() {
        let store = store();
        let writes: Vec<WriteRequest> =
            (0..26).map(|i| WriteRequest::Put(item! { "pk" => "P", "sk" => format!("{i}") })).collect();
        let err = store
            .batch_write(BatchWriteRequest { table: "t".to_owned(), writes: writes.clone() })
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Validation { .. }));

        store.inject_unprocessed(3);
        let response = store
            .batch_write(BatchWriteRequest { table: "t".to_owned(), writes: writes[..10].to_vec() })
            .await
            .unwrap();
        assert_eq!(response.unprocessed, writes[7..10].to_vec());
        assert_eq!(store.len(), 7);
        assert_eq!(store.batch_write_calls(), 2);
    }

    #[tokio::test]
    async fn test_injected_error_is_one_shot() {
        let store = store();
        store.inject_error(StoreError::Throttled { message: "slow down".to_owned() });
        let request = || GetRequest { table: "t".to_owned(), key: item! { "pk" => "P", "sk" => "S" }, consistent_read: false };
        assert!(matches!(store.get(request()).await, Err(StoreError::Throttled { .. })));
        assert!(store.get(request()).await.unwrap().is_none());
        assert_eq!(store.calls("get"), 2);
    }

    #[tokio::test]
    async fn test_delayed_error_skips_earlier_calls() {
        let store = store();
        store.inject_error_after(2, StoreError::Transport { message: "reset".to_owned() });
        let request = || GetRequest { table: "t".to_owned(), key: item! { "pk" => "P", "sk" => "S" }, consistent_read: false };
        assert!(store.get(request()).await.is_ok());
        assert!(store.get(request()).await.is_ok());
        assert!(matches!(store.get(request()).await, Err(StoreError::Transport { .. })));
        assert!(store.get(request()).await.is_ok());
    }
}
