//! One record type mapped onto a shared table.
//!
//! An [`Entity`] pairs a compiled schema with a store and a table
//! configuration. Every operation returns a builder; nothing touches the
//! store until the builder's `go()` is awaited, and `params()` returns the
//! compiled store request without executing it.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use tessera::{Entity, TableConfig, mock::{MockStore, TableLayout}};
//! use tessera::schema::{Attribute, Index, Model, Schema};
//! use tessera_types::item;
//!
//! # async fn example() -> tessera::Result<()> {
//! let schema = Schema::new(Model::new("billing", "invoice", "1"))
//!     .attribute(Attribute::string("accountId").required())
//!     .attribute(Attribute::string("invoiceId").required())
//!     .attribute(Attribute::number("amount"))
//!     .index(Index::table("byId").pk("pk", ["accountId"]).sk("sk", ["invoiceId"]));
//! let store = Arc::new(MockStore::new(TableLayout::new("pk", Some("sk"))));
//! let config = TableConfig::builder().with_table("ledger").build()?;
//! let invoices = Entity::new(schema, store, config)?;
//!
//! invoices.put(item! { "accountId" => "A1", "invoiceId" => "I1", "amount" => 40 }).go().await?;
//! let found = invoices.get(item! { "accountId" => "A1", "invoiceId" => "I1" }).go().await?;
//! assert!(found.is_some());
//! # Ok(())
//! # }
//! ```

use std::{fmt, sync::Arc};

use tessera_types::{Item, Store};

use crate::{
    builders::{
        BatchGetBuilder, BatchWriteBuilder, DeleteBuilder, FilterStage, GetBuilder, KeyStage,
        NoOps, PutBuilder, QueryBuilder, ScanBuilder, UpdateBuilder,
    },
    config::TableConfig,
    error::Result,
    keys::KeyCodec,
    pipeline::AttributePipeline,
    resolver::IndexResolver,
    schema::{CompiledSchema, Model, Schema},
};

/// A record type bound to a store.
#[derive(Clone)]
pub struct Entity {
    schema: Arc<CompiledSchema>,
    store: Arc<dyn Store>,
    config: TableConfig,
}

impl Entity {
    /// Compiles `schema` and binds it to `store`.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Schema`] if the declaration is invalid.
    pub fn new(schema: Schema, store: Arc<dyn Store>, config: TableConfig) -> Result<Self> {
        Ok(Self::from_compiled(Arc::new(schema.compile()?), store, config))
    }

    /// Binds an already compiled schema.
    #[must_use]
    pub fn from_compiled(
        schema: Arc<CompiledSchema>,
        store: Arc<dyn Store>,
        config: TableConfig,
    ) -> Self {
        Self { schema, store, config }
    }

    /// The compiled schema.
    #[must_use]
    pub fn schema(&self) -> &CompiledSchema {
        &self.schema
    }

    /// Service, entity name, and version.
    #[must_use]
    pub fn model(&self) -> &Model {
        self.schema.model()
    }

    /// Table configuration.
    #[must_use]
    pub fn config(&self) -> &TableConfig {
        &self.config
    }

    /// Key codec for this entity's indexes.
    #[must_use]
    pub fn codec(&self) -> KeyCodec<'_> {
        KeyCodec::new(&self.schema)
    }

    /// Index resolver for this entity.
    #[must_use]
    pub fn resolver(&self) -> IndexResolver<'_> {
        IndexResolver::new(&self.schema)
    }

    /// Attribute pipeline for this entity.
    #[must_use]
    pub fn pipeline(&self) -> AttributePipeline<'_> {
        AttributePipeline::new(&self.schema)
    }

    pub(crate) fn store(&self) -> &dyn Store {
        self.store.as_ref()
    }

    pub(crate) fn shared_schema(&self) -> &Arc<CompiledSchema> {
        &self.schema
    }

    /// Cursor scope of queries on this entity.
    pub(crate) fn scope(&self) -> String {
        let model = self.schema.model();
        format!("entity:{}/{}", model.service, model.entity)
    }

    /// Fetches one item by its table-index facets.
    pub fn get(&self, facets: Item) -> GetBuilder<'_> {
        GetBuilder::new(self, facets)
    }

    /// Fetches several items by their table-index facets.
    ///
    /// Results come back in the order of `keys`; missing items are `None`.
    pub fn batch_get(&self, keys: Vec<Item>) -> BatchGetBuilder<'_> {
        BatchGetBuilder::new(self, keys)
    }

    /// Writes an item, replacing any existing item with the same key.
    pub fn put(&self, item: Item) -> PutBuilder<'_> {
        PutBuilder::new(self, item, false)
    }

    /// Writes an item only if no item with the same key exists.
    pub fn create(&self, item: Item) -> PutBuilder<'_> {
        PutBuilder::new(self, item, true)
    }

    /// Writes several items through the batch orchestrator.
    pub fn batch_put(&self, items: Vec<Item>) -> BatchWriteBuilder<'_> {
        BatchWriteBuilder::puts(self, items)
    }

    /// Deletes several items through the batch orchestrator.
    pub fn batch_delete(&self, keys: Vec<Item>) -> BatchWriteBuilder<'_> {
        BatchWriteBuilder::deletes(self, keys)
    }

    /// Updates attributes of the item with the given table-index facets,
    /// creating it if it does not exist.
    pub fn update(&self, facets: Item) -> UpdateBuilder<'_, NoOps> {
        UpdateBuilder::new(self, facets, false)
    }

    /// Updates attributes of an item that must already exist.
    pub fn patch(&self, facets: Item) -> UpdateBuilder<'_, NoOps> {
        UpdateBuilder::new(self, facets, true)
    }

    /// Deletes the item with the given table-index facets.
    pub fn delete(&self, facets: Item) -> DeleteBuilder<'_> {
        DeleteBuilder::new(self, facets, false)
    }

    /// Deletes an item that must already exist.
    pub fn remove(&self, facets: Item) -> DeleteBuilder<'_> {
        DeleteBuilder::new(self, facets, true)
    }

    /// Starts a range query on a named access pattern.
    ///
    /// `facets` must cover the partition key; sort facets narrow the range.
    pub fn query(&self, access_pattern: &str, facets: Item) -> QueryBuilder<'_, KeyStage> {
        QueryBuilder::new(self, access_pattern, facets)
    }

    /// Queries whichever index best matches `attributes`.
    ///
    /// Attributes the chosen keys cannot use become equality filters.
    pub fn find(&self, attributes: Item) -> QueryBuilder<'_, FilterStage> {
        QueryBuilder::find(self, attributes)
    }

    /// Scans the table for this entity's rows.
    pub fn scan(&self) -> ScanBuilder<'_> {
        ScanBuilder::new(self)
    }
}

impl fmt::Debug for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Entity")
            .field("model", self.schema.model())
            .field("table", &self.config.table)
            .finish_non_exhaustive()
    }
}
