//! Schema-driven single-table mapping for partition/sort-key stores.
//!
//! Many record types share one physical table. Each is declared as a
//! [`Schema`](schema::Schema): attributes, a table index and any number of
//! secondary indexes whose keys are composed from attribute values. The
//! mapper turns that declaration into key strings, store requests and typed
//! results, and joins several record types into one query through
//! collections.
//!
//! # Features
//!
//! - **Key composition**: Deterministic, sortable keys from facet values
//! - **Index resolution**: Picks the index a partial set of facets can query
//! - **Typed builders**: Key conditions before filters, updates with at least
//!   one operation, both checked at compile time
//! - **Collections**: One query over several entities sharing a partition
//! - **Pagination**: Opaque cursors bound to the query that issued them
//! - **Batching**: Chunked, concurrent batch calls with retry of unprocessed
//!   items
//!
//! # Quick Start
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
//!     .attribute(Attribute::string("status").required())
//!     .attribute(Attribute::number("amount"))
//!     .index(Index::table("byId").pk("pk", ["accountId"]).sk("sk", ["invoiceId"]))
//!     .index(Index::secondary("byStatus", "gsi1").pk("gsi1pk", ["accountId"]).sk("gsi1sk", ["status", "invoiceId"]));
//!
//! let store = Arc::new(MockStore::new(
//!     TableLayout::new("pk", Some("sk")).with_index("gsi1", "gsi1pk", Some("gsi1sk")),
//! ));
//! let invoices = Entity::new(schema, store, TableConfig::builder().with_table("ledger").build()?)?;
//!
//! invoices
//!     .put(item! { "accountId" => "A1", "invoiceId" => "I1", "status" => "open", "amount" => 40 })
//!     .go()
//!     .await?;
//! let open = invoices.query("byStatus", item! { "accountId" => "A1", "status" => "open" }).go().await?;
//! assert_eq!(open.data.len(), 1);
//! # Ok(())
//! # }
//! ```
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │              Entity / Service (Public API)                  │
//! │  get │ put │ update │ delete │ query │ scan │ collection    │
//! ├─────────────────────────────────────────────────────────────┤
//! │                    Builders                                 │
//! │  Clause ordering │ Filter compilation │ Cursor handling     │
//! ├─────────────────────────────────────────────────────────────┤
//! │           Attribute Pipeline │ Index Resolver               │
//! │  Defaults │ Validation │ Hidden/read-only │ Facet matching  │
//! ├─────────────────────────────────────────────────────────────┤
//! │                  Key Codec │ Batch Orchestrator             │
//! │  Prefixes │ Labels │ Casing │ Chunking │ Retry (backon)     │
//! ├─────────────────────────────────────────────────────────────┤
//! │                  Store (tessera-types)                      │
//! └─────────────────────────────────────────────────────────────┘
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod batch;
pub mod builders;
mod collection;
mod config;
mod entity;
mod error;
pub mod expression;
pub mod keys;
mod metrics;
pub mod mock;
pub mod pagination;
pub mod pipeline;
pub mod resolver;
mod retry;
pub mod schema;

// Public API exports
pub use builders::{
    BatchGetBuilder, BatchWriteBuilder, BatchWriteOutput, DeleteBuilder, FilterStage, GetBuilder,
    HasOps, KeyStage, NoOps, PutBuilder, QueryBuilder, QueryPage, ScanBuilder, UpdateBuilder,
};
pub use collection::{CollectionBuilder, CollectionPage, Service, ServiceBuilder};
pub use config::{ExecuteOptions, Order, Pages, TableConfig, TableConfigBuilder};
pub use entity::Entity;
pub use error::{Error, Result, SchemaErrorKind};
pub use metrics::{DropReason, Metrics, MetricsFacade, NoopMetrics};
pub use pagination::CursorCodec;

// Re-export commonly used types from tessera-types
pub use tessera_types::{AttributeValue, ErrorCode, Item, Store, StoreError, item};
