//! Services and cross-entity collections.
//!
//! A [`Service`] groups the entities of one service that share a table.
//! Indexes that name the same collection place their rows under one
//! partition, sorted behind a common `$<collection>#` prefix, so a single
//! query returns every member's rows. The joiner splits those rows back out
//! by entity:
//!
//! - Tagged rows go to the member whose entity and version match the tags.
//! - Untagged rows (keys-only projections) go to the first member whose key
//!   format decodes them.
//! - Rows owned by no member are dropped at debug level.
//! - Rows a member owns but cannot decode are dropped at warn level.
//!
//! Every member appears in the result, with an empty list if it had no rows.

use std::collections::BTreeMap;

use tessera_types::{Item, QueryRequest};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use crate::{
    builders::{PagedRequest, collect_pages, resume_key_fields},
    config::{ExecuteOptions, Order, Pages},
    entity::Entity,
    error::{Error, Result, SchemaErrorKind},
    expression::{Attributes, ExpressionContext, FilterOps, join_clauses},
    keys::KeyMode,
    metrics::DropReason,
    pagination::{CursorCodec, PageContext},
    schema::{CompiledSchema, ENTITY_FIELD, IndexDescriptor, Segment, VERSION_FIELD},
};

/// One entity's place in a collection.
#[derive(Debug, Clone)]
struct Member {
    entity: String,
    access_pattern: String,
}

/// The entities of one service.
#[derive(Debug, Clone)]
pub struct Service {
    name: String,
    entities: BTreeMap<String, Entity>,
    collections: BTreeMap<String, Vec<Member>>,
}

/// Builder for [`Service`].
#[derive(Debug)]
pub struct ServiceBuilder {
    name: String,
    entities: Vec<Entity>,
}

impl ServiceBuilder {
    /// Registers an entity.
    #[must_use]
    pub fn entity(mut self, entity: Entity) -> Self {
        self.entities.push(entity);
        self
    }

    /// Validates the entities against each other and builds the service.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Schema`] with
    /// - [`SchemaErrorKind::ServiceMismatch`] if an entity belongs to another
    ///   service or table, or two entities share a name;
    /// - [`SchemaErrorKind::CollectionMismatch`] if members of a collection
    ///   read through different physical indexes, key fields, partition
    ///   facets, or casing.
    pub fn build(self) -> Result<Service> {
        let mut entities = BTreeMap::new();
        let mut table: Option<String> = None;
        for entity in self.entities {
            let model = entity.model();
            if model.service != self.name {
                return Err(Error::schema(
                    SchemaErrorKind::ServiceMismatch,
                    format!(
                        "entity '{}' belongs to service '{}', not '{}'",
                        model.entity, model.service, self.name
                    ),
                ));
            }
            let entity_table = entity.config().table();
            match &table {
                Some(t) if t != entity_table => {
                    return Err(Error::schema(
                        SchemaErrorKind::ServiceMismatch,
                        format!("entity '{}' uses table '{entity_table}', not '{t}'", model.entity),
                    ));
                },
                Some(_) => {},
                None => table = Some(entity_table.to_owned()),
            }
            let name = model.entity.clone();
            if entities.insert(name.clone(), entity).is_some() {
                return Err(Error::schema(
                    SchemaErrorKind::ServiceMismatch,
                    format!("entity '{name}' is registered twice"),
                ));
            }
        }

        let mut collections: BTreeMap<String, Vec<Member>> = BTreeMap::new();
        for (name, entity) in &entities {
            for index in entity.schema().indexes() {
                if let Some(collection) = index.collection() {
                    collections.entry(collection.to_owned()).or_default().push(Member {
                        entity: name.clone(),
                        access_pattern: index.access_pattern().to_owned(),
                    });
                }
            }
        }

        for (collection, members) in &collections {
            let mut descriptors = members.iter().filter_map(|m| {
                entities.get(&m.entity).and_then(|e| e.schema().index(&m.access_pattern).map(|i| (m, i)))
            });
            let Some((first_member, first)) = descriptors.next() else {
                continue;
            };
            for (member, index) in descriptors {
                if let Some(difference) = compatibility(first, index) {
                    return Err(Error::schema(
                        SchemaErrorKind::CollectionMismatch,
                        format!(
                            "collection '{collection}': '{}' and '{}' differ in {difference}",
                            first_member.entity, member.entity
                        ),
                    ));
                }
            }
        }

        Ok(Service { name: self.name, entities, collections })
    }
}

/// Names the first way two collection indexes disagree.
fn compatibility(a: &IndexDescriptor, b: &IndexDescriptor) -> Option<&'static str> {
    let sk_field = |i: &IndexDescriptor| i.sk().map(|sk| sk.field().to_owned());
    if a.physical_name() != b.physical_name() {
        Some("physical index")
    } else if a.pk().field() != b.pk().field() || sk_field(a) != sk_field(b) {
        Some("key fields")
    } else if a.pk().facets() != b.pk().facets() || a.pk().labels != b.pk().labels {
        Some("partition facets")
    } else if a.casing() != b.casing() {
        Some("casing")
    } else {
        None
    }
}

impl Service {
    /// Starts a service named `name`.
    #[must_use]
    pub fn builder(name: impl Into<String>) -> ServiceBuilder {
        ServiceBuilder { name: name.into(), entities: Vec::new() }
    }

    /// Service name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Looks up an entity by name.
    #[must_use]
    pub fn entity(&self, name: &str) -> Option<&Entity> {
        self.entities.get(name)
    }

    /// Registered entities, by name.
    pub fn entities(&self) -> impl Iterator<Item = &Entity> {
        self.entities.values()
    }

    /// Collection names.
    pub fn collections(&self) -> impl Iterator<Item = &str> {
        self.collections.keys().map(String::as_str)
    }

    /// Queries every member of a collection within one partition.
    ///
    /// `facets` must supply the collection's partition facets.
    pub fn collection(&self, name: &str, facets: Item) -> CollectionBuilder<'_> {
        CollectionBuilder { state: CollectionState::new(self, name, facets) }
    }
}

/// Rows of one collection page, grouped by entity name.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CollectionPage {
    /// Rows per member entity. Every member has an entry.
    pub data: BTreeMap<String, Vec<Item>>,
    /// Resume token, `None` when the partition is exhausted.
    pub cursor: Option<String>,
}

#[derive(Debug)]
struct CollectionState<'a> {
    service: &'a Service,
    name: String,
    first: (&'a Entity, &'a IndexDescriptor),
    members: Vec<(&'a Entity, &'a IndexDescriptor)>,
    pk: String,
    ctx: ExpressionContext,
    filters: Vec<String>,
    options: ExecuteOptions,
}

impl<'a> CollectionState<'a> {
    fn new(service: &'a Service, name: &str, facets: Item) -> Result<Self> {
        let members: Vec<(&Entity, &IndexDescriptor)> = service
            .collections
            .get(name)
            .into_iter()
            .flatten()
            .filter_map(|m| {
                let entity = service.entities.get(&m.entity)?;
                entity.schema().index(&m.access_pattern).map(|index| (entity, index))
            })
            .collect();
        let Some(&(first, index)) = members.first() else {
            return Err(Error::IndexResolution { index: name.to_owned(), missing: Vec::new() });
        };

        let partition = index.pk().facets();
        if let Some(extra) = facets.keys().find(|f| !partition.contains(f)) {
            return Err(Error::validation(
                extra.clone(),
                format!("not a partition facet of collection '{name}'"),
            ));
        }
        let pk = first
            .codec()
            .encode(index.access_pattern(), Segment::Partition, &facets, KeyMode::Full)
            .map_err(|e| match e {
                Error::IndexResolution { missing, .. } => {
                    Error::IndexResolution { index: name.to_owned(), missing }
                },
                other => other,
            })?;

        Ok(Self {
            service,
            name: name.to_owned(),
            first: (first, index),
            members,
            pk,
            ctx: ExpressionContext::new(),
            filters: Vec::new(),
            options: ExecuteOptions::default(),
        })
    }

    fn schemas(&self) -> Vec<&'a CompiledSchema> {
        self.members.iter().map(|(entity, _)| entity.schema()).collect()
    }

    fn first(&self) -> (&'a Entity, &'a IndexDescriptor) {
        self.first
    }

    fn scope(&self) -> String {
        format!("collection:{}/{}", self.service.name, self.name)
    }

    fn compile(&self) -> (QueryRequest, [u8; 8]) {
        let (entity, index) = self.first();
        let mut ctx = self.ctx.clone();
        let pk = ctx.equals(index.pk().field(), self.pk.clone());
        let sk_field = index.sk().map_or("", |sk| sk.field());
        let sk_name = ctx.name(sk_field);
        let sk_prefix = ctx.value(sk_field, index.casing().apply(&format!("${}#", self.name)));
        let key_condition = format!("{pk} AND begins_with({sk_name}, {sk_prefix})");
        let attributes = ctx.into_attributes();

        let key_values: Vec<String> = attributes
            .values
            .iter()
            .filter(|(placeholder, _)| key_condition.contains(placeholder.as_str()))
            .map(|(placeholder, value)| format!("{placeholder}={value}"))
            .collect();
        let mut parts = vec![self.name.as_str(), key_condition.as_str()];
        parts.extend(key_values.iter().map(String::as_str));
        let query_hash = CursorCodec::compute_query_hash(&parts);

        let request = QueryRequest {
            table: entity.config().table().to_owned(),
            index: index.physical_name().map(str::to_owned),
            key_condition,
            filter: join_clauses(&self.filters),
            attributes,
            limit: self.options.limit,
            exclusive_start_key: None,
            scan_forward: self.options.order == Order::Asc,
        };
        (request, query_hash)
    }

    fn page_context(&self, query_hash: [u8; 8]) -> PageContext<'a> {
        PageContext {
            scope: self.scope(),
            index: self.name.clone(),
            query_hash,
            members: self.members.iter().map(|(entity, index)| (entity.schema(), *index)).collect(),
        }
    }

    /// Finds the member that owns `row`, if any, and reads it.
    fn join(&self, row: Item) -> Joined {
        let tags = (
            row.get(ENTITY_FIELD).and_then(|v| v.as_str()),
            row.get(VERSION_FIELD).and_then(|v| v.as_str()),
        );
        let candidates: Vec<&(&Entity, &IndexDescriptor)> = match tags {
            (Some(entity), Some(version)) => self
                .members
                .iter()
                .filter(|(e, _)| e.model().entity == entity && e.model().version == version)
                .collect(),
            _ => self.members.iter().collect(),
        };
        for (entity, index) in candidates {
            match entity.pipeline().read_row(index, &row, false) {
                Ok(Some(item)) => {
                    let item = if self.options.raw { row } else { item };
                    return Joined::Member(entity.model().entity.clone(), item);
                },
                Ok(None) => {},
                Err(e) => return Joined::Undecodable(entity.model().entity.clone(), e),
            }
        }
        Joined::Foreign
    }

    #[instrument(skip_all, fields(service = %self.service.name, collection = %self.name, operation = "collection"))]
    async fn execute(self) -> Result<CollectionPage> {
        self.options.validate()?;
        if self.options.is_cancelled() {
            return Err(Error::Cancelled);
        }
        let (entity, index) = self.first();
        let config = entity.config();
        let (mut request, query_hash) = self.compile();
        let context = self.page_context(query_hash);
        if let Some(cursor) = &self.options.cursor {
            request.exclusive_start_key = Some(config.cursors.decode_key(&context, cursor)?);
        }
        debug!(key_condition = %request.key_condition, filter = ?request.filter, "Executing collection query");

        let key_fields = resume_key_fields(entity, index);
        let mut foreign = 0usize;
        let mut undecodable = 0usize;
        let (rows, last) = collect_pages(
            entity.store(),
            PagedRequest::Query(request),
            &self.options,
            &key_fields,
            |row| {
                Ok(match self.join(row) {
                    Joined::Member(name, item) => Some((name, item)),
                    Joined::Foreign => {
                        foreign += 1;
                        None
                    },
                    Joined::Undecodable(name, error) => {
                        warn!(entity = %name, %error, "Dropping collection row that does not decode");
                        undecodable += 1;
                        None
                    },
                })
            },
        )
        .await?;

        let scope = context.scope.as_str();
        if foreign > 0 {
            debug!(foreign, "Dropped rows owned by no collection member");
            config.metrics.record_dropped_rows(scope, DropReason::Foreign, foreign);
        }
        if undecodable > 0 {
            config.metrics.record_dropped_rows(scope, DropReason::Undecodable, undecodable);
        }

        let mut data: BTreeMap<String, Vec<Item>> =
            self.members.iter().map(|(e, _)| (e.model().entity.clone(), Vec::new())).collect();
        for (name, item) in rows {
            data.entry(name).or_default().push(item);
        }
        let cursor = last.map(|key| config.cursors.encode_key(&context, &key)).transpose()?;
        Ok(CollectionPage { data, cursor })
    }
}

enum Joined {
    Member(String, Item),
    Foreign,
    Undecodable(String, Error),
}

/// A query across every member of a collection.
///
/// Created by [`Service::collection`].
#[derive(Debug)]
pub struct CollectionBuilder<'a> {
    state: Result<CollectionState<'a>>,
}

impl CollectionBuilder<'_> {
    /// Adds a filter clause over the attributes of any member.
    #[must_use]
    pub fn filter<F>(mut self, f: F) -> Self
    where
        F: FnOnce(&Attributes<'_>, &mut FilterOps<'_>) -> Result<String>,
    {
        self.state = self.state.and_then(|mut state| {
            let schemas = state.schemas();
            if let Some(clause) = state.ctx.compile(&schemas, f)? {
                state.filters.push(clause);
            }
            Ok(state)
        });
        self
    }

    /// Adds a condition clause. Equivalent to [`Self::filter`].
    #[must_use]
    pub fn where_<F>(self, f: F) -> Self
    where
        F: FnOnce(&Attributes<'_>, &mut FilterOps<'_>) -> Result<String>,
    {
        self.filter(f)
    }

    /// Replaces the execution options.
    #[must_use]
    pub fn options(mut self, options: ExecuteOptions) -> Self {
        if let Ok(state) = &mut self.state {
            state.options = options;
        }
        self
    }

    /// Stops paging once `token` fires.
    #[must_use]
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        if let Ok(state) = &mut self.state {
            state.options.cancellation = Some(token);
        }
        self
    }

    /// Returns the compiled store request without executing it.
    ///
    /// # Errors
    ///
    /// Returns any error recorded while building the chain, or a rejected
    /// cursor.
    pub fn params(self) -> Result<QueryRequest> {
        let state = self.state?;
        state.options.validate()?;
        let (mut request, query_hash) = state.compile();
        if let Some(cursor) = &state.options.cursor {
            let context = state.page_context(query_hash);
            let (entity, _) = state.first();
            request.exclusive_start_key = Some(entity.config().cursors.decode_key(&context, cursor)?);
        }
        Ok(request)
    }

    /// Executes the query.
    ///
    /// # Errors
    ///
    /// Returns any error recorded while building the chain, a rejected
    /// cursor, or a store failure. Rows that fail to decode are dropped, not
    /// returned as errors.
    pub async fn go(self) -> Result<CollectionPage> {
        let state = self.state?;
        let config = state.first().0.config().clone();
        crate::batch::timed(&config, "collection", state.execute()).await
    }

    /// Executes one page starting at `cursor` (or the beginning).
    ///
    /// # Errors
    ///
    /// Same as [`Self::go`].
    pub async fn page(self, cursor: Option<String>) -> Result<CollectionPage> {
        let mut state = self.state?;
        state.options.cursor = cursor;
        state.options.pages = Pages::Count(1);
        let config = state.first().0.config().clone();
        crate::batch::timed(&config, "collection", state.execute()).await
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::disallowed_methods)]
mod tests {
    use std::{collections::HashMap, sync::Arc};

    use tessera_types::{AttributeValue, Store, item};

    use super::*;
    use crate::{
        TableConfig,
        mock::{MockStore, TableLayout},
        schema::{Attribute, Index, Model, Projection, Schema},
    };

    fn counts(page: &CollectionPage) -> HashMap<&str, usize> {
        page.data.iter().map(|(k, v)| (k.as_str(), v.len())).collect()
    }

    fn layout() -> TableLayout {
        TableLayout::new("pk", Some("sk")).with_index("gsi1", "gsi1pk", Some("gsi1sk"))
    }

    fn config() -> TableConfig {
        TableConfig::builder().with_table("ledger").build().unwrap()
    }

    fn invoice_schema() -> Schema {
        Schema::new(Model::new("billing", "invoice", "1"))
            .attribute(Attribute::string("accountId").required())
            .attribute(Attribute::string("invoiceId").required())
            .attribute(Attribute::number("amount"))
            .index(Index::table("byId").pk("pk", ["invoiceId"]).sk("sk", ["accountId"]))
            .index(
                Index::secondary("byAccount", "gsi1")
                    .pk("gsi1pk", ["accountId"])
                    .sk("gsi1sk", ["invoiceId"])
                    .collection("ledger"),
            )
    }

    fn payment_schema() -> Schema {
        Schema::new(Model::new("billing", "payment", "1"))
            .attribute(Attribute::string("accountId").required())
            .attribute(Attribute::string("paymentId").required())
            .attribute(Attribute::string("invoiceId"))
            .index(Index::table("byId").pk("pk", ["paymentId"]).sk("sk", ["accountId"]))
            .index(
                Index::secondary("byAccount", "gsi1")
                    .pk("gsi1pk", ["accountId"])
                    .sk("gsi1sk", ["paymentId"])
                    .collection("ledger"),
            )
    }

    fn service(store: &Arc<MockStore>) -> Service {
        let store: Arc<dyn Store> = Arc::clone(store) as Arc<dyn Store>;
        Service::builder("billing")
            .entity(Entity::new(invoice_schema(), Arc::clone(&store), config()).unwrap())
            .entity(Entity::new(payment_schema(), store, config()).unwrap())
            .build()
            .unwrap()
    }

    #[test]
    fn test_rejects_entity_from_other_service() {
        let store: Arc<dyn Store> = Arc::new(MockStore::new(layout()));
        let schema = Schema::new(Model::new("shipping", "parcel", "1"))
            .attribute(Attribute::string("id"))
            .index(Index::table("byId").pk("pk", ["id"]));
        let err = Service::builder("billing")
            .entity(Entity::new(schema, store, config()).unwrap())
            .build()
            .unwrap_err();
        assert!(matches!(err, Error::Schema { kind: SchemaErrorKind::ServiceMismatch, .. }));
    }

    #[test]
    fn test_rejects_mismatched_collection_members() {
        let store: Arc<dyn Store> = Arc::new(MockStore::new(layout()));
        let payments = payment_schema().index(
            Index::secondary("byPayment", "gsi2")
                .pk("gsi2pk", ["paymentId"])
                .sk("gsi2sk", ["accountId"])
                .collection("receipts"),
        );
        let receipts = Schema::new(Model::new("billing", "receipt", "1"))
            .attribute(Attribute::string("accountId"))
            .attribute(Attribute::string("receiptId"))
            .index(Index::table("byId").pk("pk", ["receiptId"]).sk("sk", ["accountId"]))
            .index(
                Index::secondary("byAccount", "gsi2")
                    .pk("gsi2pk", ["accountId"])
                    .sk("gsi2sk", ["receiptId"])
                    .collection("receipts"),
            );
        let err = Service::builder("billing")
            .entity(Entity::new(payments, Arc::clone(&store), config()).unwrap())
            .entity(Entity::new(receipts, store, config()).unwrap())
            .build()
            .unwrap_err();
        assert!(matches!(err, Error::Schema { kind: SchemaErrorKind::CollectionMismatch, .. }), "{err}");
    }

    #[test]
    fn test_collection_key_condition() {
        let store = Arc::new(MockStore::new(layout()));
        let request = service(&store).collection("ledger", item! { "accountId" => "A1" }).params().unwrap();
        assert_eq!(request.index.as_deref(), Some("gsi1"));
        assert_eq!(request.key_condition, "#gsi1pk = :gsi1pk0 AND begins_with(#gsi1sk, :gsi1sk0)");
        assert_eq!(request.attributes.values[":gsi1sk0"], AttributeValue::from("$ledger#"));
    }

    #[test]
    fn test_unknown_collection_and_missing_facets() {
        let store = Arc::new(MockStore::new(layout()));
        let service = service(&store);
        assert!(matches!(
            service.collection("nope", item! { "accountId" => "A1" }).params().unwrap_err(),
            Error::IndexResolution { .. }
        ));
        let err = service.collection("ledger", Item::new()).params().unwrap_err();
        assert!(matches!(err, Error::IndexResolution { ref missing, .. } if missing == &["accountId".to_owned()]));
    }

    #[tokio::test]
    async fn test_groups_rows_and_isolates_partitions() {
        let store = Arc::new(MockStore::new(layout()));
        let service = service(&store);
        let invoices = service.entity("invoice").unwrap();
        let payments = service.entity("payment").unwrap();
        invoices.put(item! { "accountId" => "A1", "invoiceId" => "I1", "amount" => 5 }).go().await.unwrap();
        invoices.put(item! { "accountId" => "A2", "invoiceId" => "I2" }).go().await.unwrap();
        payments.put(item! { "accountId" => "A1", "paymentId" => "P1", "invoiceId" => "I1" }).go().await.unwrap();

        let page = service.collection("ledger", item! { "accountId" => "A1" }).go().await.unwrap();
        assert_eq!(counts(&page), HashMap::from([("invoice", 1), ("payment", 1)]));
        assert_eq!(page.data["payment"][0]["paymentId"], AttributeValue::from("P1"));
        assert_eq!(page.cursor, None);

        let empty = service.collection("ledger", item! { "accountId" => "A9" }).go().await.unwrap();
        assert_eq!(counts(&empty), HashMap::from([("invoice", 0), ("payment", 0)]));
    }

    #[tokio::test]
    async fn test_foreign_and_undecodable_rows_are_dropped() {
        let store = Arc::new(MockStore::new(layout()));
        let service = service(&store);
        service
            .entity("invoice")
            .unwrap()
            .put(item! { "accountId" => "A1", "invoiceId" => "I1" })
            .go()
            .await
            .unwrap();
        store.insert_raw(item! {
            "pk" => "x", "sk" => "y",
            "gsi1pk" => "$billing#accountId_A1", "gsi1sk" => "$ledger#refund_1#refundId_R1",
            ENTITY_FIELD => "refund", VERSION_FIELD => "1",
        })
        .unwrap();
        store.insert_raw(item! {
            "pk" => "x2", "sk" => "y2",
            "gsi1pk" => "$billing#accountId_A1", "gsi1sk" => "$ledger#invoice_1#invoiceId_I9",
            "amount" => "not a number",
            ENTITY_FIELD => "invoice", VERSION_FIELD => "1",
        })
        .unwrap();

        let page = service.collection("ledger", item! { "accountId" => "A1" }).go().await.unwrap();
        assert_eq!(counts(&page), HashMap::from([("invoice", 1), ("payment", 0)]));
    }

    #[tokio::test]
    async fn test_keys_only_rows_are_rebuilt_from_keys() {
        let store = Arc::new(MockStore::new(layout()));
        let schema = Schema::new(Model::new("billing", "note", "1"))
            .attribute(Attribute::string("accountId"))
            .attribute(Attribute::string("noteId"))
            .attribute(Attribute::string("body"))
            .index(Index::table("byId").pk("pk", ["noteId"]).sk("sk", ["accountId"]))
            .index(
                Index::secondary("byAccount", "gsi1")
                    .pk("gsi1pk", ["accountId"])
                    .sk("gsi1sk", ["noteId"])
                    .collection("ledger")
                    .projection(Projection::KeysOnly),
            );
        let service = Service::builder("billing")
            .entity(Entity::new(schema, Arc::clone(&store) as Arc<dyn Store>, config()).unwrap())
            .build()
            .unwrap();
        store.insert_raw(item! {
            "pk" => "$billing#noteId_N1", "sk" => "$note_1#accountId_A1",
            "gsi1pk" => "$billing#accountId_A1", "gsi1sk" => "$ledger#note_1#noteId_N1",
        })
        .unwrap();
        let page = service.collection("ledger", item! { "accountId" => "A1" }).go().await.unwrap();
        assert_eq!(page.data["note"], vec![item! { "accountId" => "A1", "noteId" => "N1" }]);
    }
}
