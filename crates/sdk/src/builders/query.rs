//! Range queries and scans.
//!
//! A query chain moves through three stages:
//!
//! 1. [`Entity::query`] resolves the access pattern and encodes the
//!    partition key plus whatever sort-key prefix the facets allow.
//! 2. At most one range comparator (`begins`, `between`, `gt`, `gte`, `lt`,
//!    `lte`) extends the sort key. It must supply the next unsupplied sort
//!    facet, and may supply later ones, in slot order.
//! 3. Any number of `filter`/`where_` clauses, ANDed together.
//!
//! A second comparator does not compile:
//!
//! ```compile_fail
//! # use std::sync::Arc;
//! # use tessera::{Entity, TableConfig, mock::{MockStore, TableLayout}};
//! # use tessera::schema::{Attribute, Index, Model, Schema};
//! # use tessera_types::item;
//! # fn example(entity: &Entity) {
//! let _ = entity
//!     .query("byStatus", item! { "accountId" => "A1" })
//!     .gte(item! { "status" => "open" })
//!     .lte(item! { "status" => "paid" });
//! # }
//! ```
//!
//! Neither does a comparator after a filter:
//!
//! ```compile_fail
//! # use tessera::Entity;
//! # use tessera_types::item;
//! # fn example(entity: &Entity) {
//! let _ = entity
//!     .query("byStatus", item! { "accountId" => "A1" })
//!     .filter(|attr, op| Ok(op.exists(attr.get("amount")?)))
//!     .begins(item! { "status" => "o" });
//! # }
//! ```
//!
//! [`Entity::query`]: crate::Entity::query

use std::marker::PhantomData;

use tessera_types::{Item, Page, QueryRequest, ScanRequest, Store, StoreResult};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

use super::Conditions;
use crate::{
    config::{ExecuteOptions, Order, Pages},
    entity::Entity,
    error::{Error, InvalidClauseSnafu, Result},
    expression::{Attributes, ExpressionContext, FilterOps, join_clauses},
    keys::{DELIMITER, KeyCodec, KeyMode},
    metrics::DropReason,
    pagination::{CursorCodec, PageContext},
    resolver::{Intent, Resolution},
    schema::{ENTITY_FIELD, Segment, VERSION_FIELD},
};

/// Type-state marker: a range comparator may still be applied.
pub struct KeyStage(());

/// Type-state marker: only filters and terminals remain.
pub struct FilterStage(());

/// Appended to an incomplete sort key so that `>` and `<=` compare past
/// every key extending it.
const RANGE_SENTINEL: char = '~';

/// One page of results.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryPage {
    /// Rows, through the read pipeline unless `raw` was requested.
    pub data: Vec<Item>,
    /// Resume token, `None` when the range is exhausted.
    pub cursor: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
enum RangeCondition {
    Begins(String),
    Between(String, String),
    Gt(String),
    Gte(String),
    Lt(String),
    Lte(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Comparator {
    Begins,
    Gt,
    Gte,
    Lt,
    Lte,
}

/// Mutable build context of one query chain.
#[derive(Debug)]
pub(crate) struct QueryState<'a> {
    entity: &'a Entity,
    resolution: Resolution<'a>,
    facts: Item,
    range: Option<RangeCondition>,
    ctx: ExpressionContext,
    filters: Vec<String>,
    options: ExecuteOptions,
}

impl<'a> QueryState<'a> {
    fn new(entity: &'a Entity, access_pattern: &str, facts: Item) -> Result<Self> {
        let resolution = entity.resolver().resolve(access_pattern, &facts, Intent::Range)?;
        Ok(Self::from_resolution(entity, resolution, facts))
    }

    fn find(entity: &'a Entity, facts: Item) -> Result<Self> {
        let resolution = entity.resolver().find(&facts, Intent::Range)?;
        Ok(Self::from_resolution(entity, resolution, facts))
    }

    fn from_resolution(entity: &'a Entity, resolution: Resolution<'a>, facts: Item) -> Self {
        let mut ctx = ExpressionContext::new();
        let mut filters = Vec::new();
        for (name, value) in &resolution.residual {
            if let Some(attribute) = entity.schema().attribute(name) {
                filters.push(ctx.equals(attribute.field_name(), value.clone()));
            }
        }
        Self {
            entity,
            resolution,
            facts,
            range: None,
            ctx,
            filters,
            options: ExecuteOptions::default(),
        }
    }

    fn access_pattern(&self) -> &'a str {
        self.resolution.index.access_pattern()
    }

    fn sort_facets(&self) -> Result<&'a [String]> {
        match self.resolution.index.sk() {
            Some(sk) => Ok(sk.facets()),
            None => InvalidClauseSnafu {
                message: format!("access pattern '{}' has no sort key", self.access_pattern()),
            }
            .fail(),
        }
    }

    /// Merges comparator facets with the sort facets already in the key.
    ///
    /// Returns the merged facets and whether they complete the sort key.
    fn merge_sort(&self, facets: &Item) -> Result<(Item, bool)> {
        let sort = self.sort_facets()?;
        let already = self.resolution.sort_supplied.len();
        if already == sort.len() {
            return InvalidClauseSnafu {
                message: format!(
                    "every sort facet of '{}' is already supplied",
                    self.access_pattern()
                ),
            }
            .fail();
        }

        let mut merged: Item = self
            .resolution
            .sort_supplied
            .iter()
            .filter_map(|f| self.facts.get(f).map(|v| (f.clone(), v.clone())))
            .collect();
        for (name, value) in facets.iter().filter(|(_, v)| !v.is_null()) {
            if !sort.contains(name) {
                return InvalidClauseSnafu {
                    message: format!(
                        "'{name}' is not a sort facet of '{}'",
                        self.access_pattern()
                    ),
                }
                .fail();
            }
            if let Some(existing) = merged.get(name)
                && existing != value
            {
                return InvalidClauseSnafu {
                    message: format!("'{name}' was already supplied as {existing}"),
                }
                .fail();
            }
            merged.insert(name.clone(), value.clone());
        }

        let supplied = sort.iter().take_while(|f| merged.contains_key(f.as_str())).count();
        if let Some(stray) = sort[supplied..].iter().find(|f| merged.contains_key(f.as_str())) {
            return InvalidClauseSnafu {
                message: format!("'{stray}' supplied out of slot order; '{}' comes first", sort[supplied]),
            }
            .fail();
        }
        if supplied == already {
            return InvalidClauseSnafu {
                message: format!("range comparator must supply '{}'", sort[already]),
            }
            .fail();
        }
        Ok((merged, supplied == sort.len()))
    }

    fn encode_bound(&self, facets: &Item) -> Result<(String, bool)> {
        let (merged, complete) = self.merge_sort(facets)?;
        let key = KeyCodec::new(self.entity.schema()).encode_segment(
            self.resolution.index,
            Segment::Sort,
            &merged,
            KeyMode::Partial,
        )?;
        Ok((key, complete))
    }

    fn check_no_range(&self) -> Result<()> {
        match self.range {
            Some(_) => InvalidClauseSnafu { message: "a range comparator was already applied" }.fail(),
            None => Ok(()),
        }
    }

    fn apply_range(&mut self, comparator: Comparator, facets: &Item) -> Result<()> {
        self.check_no_range()?;
        let (key, complete) = self.encode_bound(facets)?;
        let past = |key: String| if complete { key } else { format!("{key}{DELIMITER}{RANGE_SENTINEL}") };
        self.range = Some(match comparator {
            Comparator::Begins => RangeCondition::Begins(key),
            Comparator::Gt => RangeCondition::Gt(past(key)),
            Comparator::Gte => RangeCondition::Gte(key),
            Comparator::Lt => RangeCondition::Lt(key),
            Comparator::Lte => RangeCondition::Lte(past(key)),
        });
        Ok(())
    }

    fn apply_between(&mut self, low: &Item, high: &Item) -> Result<()> {
        self.check_no_range()?;
        let (low, _) = self.encode_bound(low)?;
        let (high, complete) = self.encode_bound(high)?;
        let high = if complete { high } else { format!("{high}{DELIMITER}{RANGE_SENTINEL}") };
        self.range = Some(RangeCondition::Between(low, high));
        Ok(())
    }

    fn push_filter<F>(&mut self, f: F) -> Result<()>
    where
        F: FnOnce(&Attributes<'_>, &mut FilterOps<'_>) -> Result<String>,
    {
        if let Some(clause) = self.ctx.compile(&[self.entity.schema()], f)? {
            self.filters.push(clause);
        }
        Ok(())
    }

    /// Renders the key condition, registering its placeholders in `ctx`.
    fn key_condition(&self, ctx: &mut ExpressionContext) -> String {
        let index = self.resolution.index;
        let mut condition = ctx.equals(index.pk().field(), self.resolution.pk.clone());
        let (Some(sk), Some(prefix)) = (index.sk(), &self.resolution.sk) else {
            return condition;
        };
        let name = ctx.name(sk.field());
        let mut value = |v: &str| ctx.value(sk.field(), v);
        let clause = match &self.range {
            None if self.resolution.sk_complete() => format!("{name} = {}", value(prefix)),
            None => format!("begins_with({name}, {})", value(prefix)),
            Some(RangeCondition::Begins(v)) => format!("begins_with({name}, {})", value(v)),
            Some(RangeCondition::Between(low, high)) => {
                let low = value(low);
                let high = value(high);
                format!("{name} BETWEEN {low} AND {high}")
            },
            Some(RangeCondition::Gt(v)) => format!("{name} > {}", value(v)),
            Some(RangeCondition::Gte(v)) => format!("{name} >= {}", value(v)),
            Some(RangeCondition::Lt(v)) => format!("{name} < {}", value(v)),
            Some(RangeCondition::Lte(v)) => format!("{name} <= {}", value(v)),
        };
        condition.push_str(" AND ");
        condition.push_str(&clause);
        condition
    }

    /// Compiles the store request and the hash cursors are bound to.
    fn compile(&self) -> Result<(QueryRequest, [u8; 8])> {
        let mut ctx = self.ctx.clone();
        let key_condition = self.key_condition(&mut ctx);
        let attributes = ctx.into_attributes();

        let key_values: Vec<String> = attributes
            .values
            .iter()
            .filter(|(placeholder, _)| key_condition.contains(placeholder.as_str()))
            .map(|(placeholder, value)| format!("{placeholder}={value}"))
            .collect();
        let mut parts = vec![self.access_pattern(), key_condition.as_str()];
        parts.extend(key_values.iter().map(String::as_str));
        let query_hash = CursorCodec::compute_query_hash(&parts);

        let index = self.resolution.index;
        let request = QueryRequest {
            table: self.entity.config().table().to_owned(),
            index: index.physical_name().map(str::to_owned),
            key_condition,
            filter: join_clauses(&self.filters),
            attributes,
            limit: self.options.limit,
            exclusive_start_key: None,
            scan_forward: self.options.order == Order::Asc,
        };
        Ok((request, query_hash))
    }

    fn page_context(&self, query_hash: [u8; 8]) -> PageContext<'a> {
        PageContext {
            scope: self.entity.scope(),
            index: self.access_pattern().to_owned(),
            query_hash,
            members: vec![(self.entity.schema(), self.resolution.index)],
        }
    }

    fn params(self) -> Result<QueryRequest> {
        self.options.validate()?;
        let (mut request, query_hash) = self.compile()?;
        if let Some(cursor) = &self.options.cursor {
            let context = self.page_context(query_hash);
            request.exclusive_start_key =
                Some(self.entity.config().cursors.decode_key(&context, cursor)?);
        }
        Ok(request)
    }

    #[instrument(
        skip_all,
        fields(entity = %self.entity.model().entity, index = %self.access_pattern(), operation = "query")
    )]
    async fn execute(self) -> Result<QueryPage> {
        self.options.validate()?;
        if self.options.is_cancelled() {
            return Err(Error::Cancelled);
        }
        let (mut request, query_hash) = self.compile()?;
        let context = self.page_context(query_hash);
        let config = self.entity.config();
        if let Some(cursor) = &self.options.cursor {
            request.exclusive_start_key = Some(config.cursors.decode_key(&context, cursor)?);
        }
        debug!(
            key_condition = %request.key_condition,
            filter = ?request.filter,
            "Executing query"
        );

        let index = self.resolution.index;
        let key_fields = resume_key_fields(self.entity, index);
        let pipeline = self.entity.pipeline();
        let options = &self.options;
        let mut dropped = 0usize;
        let (data, last) =
            collect_pages(self.entity.store(), PagedRequest::Query(request), options, &key_fields, |row| {
                if options.raw {
                    return Ok(Some(row));
                }
                let item = pipeline.read_row(index, &row, options.ignore_ownership)?;
                if item.is_none() {
                    dropped += 1;
                }
                Ok(item)
            })
            .await?;

        if dropped > 0 {
            debug!(dropped, "Dropped rows owned by other entities");
            config.metrics.record_dropped_rows(&context.scope, DropReason::Foreign, dropped);
        }
        let cursor = last.map(|key| config.cursors.encode_key(&context, &key)).transpose()?;
        Ok(QueryPage { data, cursor })
    }
}

/// Fields that make up a resume key for rows read through `index`.
pub(crate) fn resume_key_fields(entity: &Entity, index: &crate::schema::IndexDescriptor) -> Vec<String> {
    let mut fields: Vec<String> =
        entity.schema().table_index().key_fields().map(str::to_owned).collect();
    for field in index.key_fields() {
        if !fields.iter().any(|f| f == field) {
            fields.push(field.to_owned());
        }
    }
    fields
}

/// A range query on one access pattern.
///
/// Created by [`Entity::query`](crate::Entity::query) or
/// [`Entity::find`](crate::Entity::find).
pub struct QueryBuilder<'a, S = KeyStage> {
    state: Result<QueryState<'a>>,
    _stage: PhantomData<S>,
}

impl<'a> QueryBuilder<'a, KeyStage> {
    pub(crate) fn new(entity: &'a Entity, access_pattern: &str, facets: Item) -> Self {
        Self { state: QueryState::new(entity, access_pattern, facets), _stage: PhantomData }
    }

    /// Sort keys starting with the encoding of `facets`.
    ///
    /// The last facet may be a value prefix: `{"status": "op"}` matches
    /// `open`.
    #[must_use]
    pub fn begins(self, facets: Item) -> QueryBuilder<'a, FilterStage> {
        self.advance(|state| state.apply_range(Comparator::Begins, &facets))
    }

    /// Sort keys between `low` and `high`, inclusive.
    #[must_use]
    pub fn between(self, low: Item, high: Item) -> QueryBuilder<'a, FilterStage> {
        self.advance(|state| state.apply_between(&low, &high))
    }

    /// Sort keys after `facets` and everything it prefixes.
    #[must_use]
    pub fn gt(self, facets: Item) -> QueryBuilder<'a, FilterStage> {
        self.advance(|state| state.apply_range(Comparator::Gt, &facets))
    }

    /// Sort keys at or after `facets`.
    #[must_use]
    pub fn gte(self, facets: Item) -> QueryBuilder<'a, FilterStage> {
        self.advance(|state| state.apply_range(Comparator::Gte, &facets))
    }

    /// Sort keys before `facets`.
    #[must_use]
    pub fn lt(self, facets: Item) -> QueryBuilder<'a, FilterStage> {
        self.advance(|state| state.apply_range(Comparator::Lt, &facets))
    }

    /// Sort keys up to and including everything `facets` prefixes.
    #[must_use]
    pub fn lte(self, facets: Item) -> QueryBuilder<'a, FilterStage> {
        self.advance(|state| state.apply_range(Comparator::Lte, &facets))
    }
}

impl<'a> QueryBuilder<'a, FilterStage> {
    pub(crate) fn find(entity: &'a Entity, attributes: Item) -> Self {
        Self { state: QueryState::find(entity, attributes), _stage: PhantomData }
    }
}

impl<'a, S> QueryBuilder<'a, S> {
    fn advance<T>(
        self,
        f: impl FnOnce(&mut QueryState<'a>) -> Result<()>,
    ) -> QueryBuilder<'a, T> {
        let state = self.state.and_then(|mut state| {
            f(&mut state)?;
            Ok(state)
        });
        QueryBuilder { state, _stage: PhantomData }
    }

    /// Adds a filter clause, ANDed with any others.
    ///
    /// ```no_run
    /// # use tessera::Entity;
    /// # use tessera_types::item;
    /// # async fn example(invoices: &Entity) -> tessera::Result<()> {
    /// let page = invoices
    ///     .query("byStatus", item! { "accountId" => "A1" })
    ///     .filter(|attr, op| {
    ///         let amount = attr.get("amount")?;
    ///         Ok(format!("{} OR {}", op.gt(amount, 100), op.not_exists(amount)))
    ///     })
    ///     .go()
    ///     .await?;
    /// # Ok(())
    /// # }
    /// ```
    #[must_use]
    pub fn filter<F>(self, f: F) -> QueryBuilder<'a, FilterStage>
    where
        F: FnOnce(&Attributes<'_>, &mut FilterOps<'_>) -> Result<String>,
    {
        self.advance(|state| state.push_filter(f))
    }

    /// Adds a condition clause. Equivalent to [`Self::filter`].
    #[must_use]
    pub fn where_<F>(self, f: F) -> QueryBuilder<'a, FilterStage>
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
    /// Returns any error recorded while building the chain.
    pub fn params(self) -> Result<QueryRequest> {
        self.state?.params()
    }

    /// Executes the query, reading as many pages as the options allow.
    ///
    /// # Errors
    ///
    /// Returns any error recorded while building the chain, a rejected
    /// cursor, a store failure, or a row of this entity that does not decode.
    pub async fn go(self) -> Result<QueryPage> {
        let state = self.state?;
        let config = state.entity.config().clone();
        crate::batch::timed(&config, "query", state.execute()).await
    }

    /// Executes one page starting at `cursor` (or the beginning).
    ///
    /// # Errors
    ///
    /// Same as [`Self::go`].
    pub async fn page(self, cursor: Option<String>) -> Result<QueryPage> {
        let mut state = self.state?;
        state.options.cursor = cursor;
        state.options.pages = Pages::Count(1);
        let config = state.entity.config().clone();
        crate::batch::timed(&config, "query", state.execute()).await
    }
}

/// A filtered scan over this entity's rows.
pub struct ScanBuilder<'a> {
    entity: &'a Entity,
    state: Result<Conditions>,
    options: ExecuteOptions,
}

impl<'a> ScanBuilder<'a> {
    pub(crate) fn new(entity: &'a Entity) -> Self {
        Self { entity, state: Ok(Conditions::default()), options: ExecuteOptions::default() }
    }

    /// Adds a filter clause, ANDed with any others.
    #[must_use]
    pub fn filter<F>(mut self, f: F) -> Self
    where
        F: FnOnce(&Attributes<'_>, &mut FilterOps<'_>) -> Result<String>,
    {
        let schema = self.entity.schema();
        self.state = self.state.and_then(|mut conditions| {
            conditions.push(schema, f)?;
            Ok(conditions)
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
        self.options = options;
        self
    }

    fn compile(
        entity: &'a Entity,
        mut conditions: Conditions,
        options: &ExecuteOptions,
    ) -> Result<(ScanRequest, PageContext<'a>)> {
        options.validate()?;
        if !options.ignore_ownership && !options.raw {
            let model = entity.model();
            let ctx = conditions.ctx();
            let entity_tag = ctx.equals(ENTITY_FIELD, model.entity.clone());
            let version_tag = ctx.equals(VERSION_FIELD, model.version.clone());
            conditions.push_raw(format!("{entity_tag} AND {version_tag}"));
        }
        let (filter, ctx) = conditions.into_parts();
        let context = PageContext {
            scope: entity.scope(),
            index: "scan".to_owned(),
            query_hash: CursorCodec::compute_query_hash(&["scan"]),
            members: vec![(entity.schema(), entity.schema().table_index())],
        };
        let exclusive_start_key = match &options.cursor {
            Some(cursor) => Some(entity.config().cursors.decode_key(&context, cursor)?),
            None => None,
        };
        let request = ScanRequest {
            table: entity.config().table().to_owned(),
            index: None,
            filter,
            attributes: ctx.into_attributes(),
            limit: options.limit,
            exclusive_start_key,
        };
        Ok((request, context))
    }

    /// Returns the compiled store request without executing it.
    ///
    /// # Errors
    ///
    /// Returns any error recorded while building the chain.
    pub fn params(self) -> Result<ScanRequest> {
        Self::compile(self.entity, self.state?, &self.options).map(|(request, _)| request)
    }

    /// Executes the scan.
    ///
    /// # Errors
    ///
    /// Returns any error recorded while building the chain, a rejected
    /// cursor, or a store failure.
    #[instrument(skip_all, fields(entity = %self.entity.model().entity, operation = "scan"))]
    pub async fn go(self) -> Result<QueryPage> {
        let Self { entity, state, options } = self;
        let config = entity.config();
        crate::batch::timed(config, "scan", async {
            let (request, context) = Self::compile(entity, state?, &options)?;
            if options.is_cancelled() {
                return Err(Error::Cancelled);
            }
            let table = entity.schema().table_index();
            let key_fields: Vec<String> = table.key_fields().map(str::to_owned).collect();
            let pipeline = entity.pipeline();
            let (data, last) = collect_pages(
                entity.store(),
                PagedRequest::Scan(request),
                &options,
                &key_fields,
                |row| {
                    if options.raw {
                        return Ok(Some(row));
                    }
                    pipeline.read_row(table, &row, options.ignore_ownership)
                },
            )
            .await?;
            let cursor = last.map(|key| config.cursors.encode_key(&context, &key)).transpose()?;
            Ok(QueryPage { data, cursor })
        })
        .await
    }
}

/// A query or scan that can be re-sent from a continuation key.
#[derive(Debug, Clone)]
pub(crate) enum PagedRequest {
    Query(QueryRequest),
    Scan(ScanRequest),
}

impl PagedRequest {
    fn operation(&self) -> &'static str {
        match self {
            Self::Query(_) => "query",
            Self::Scan(_) => "scan",
        }
    }

    fn set_start(&mut self, key: Option<Item>) {
        match self {
            Self::Query(r) => r.exclusive_start_key = key,
            Self::Scan(r) => r.exclusive_start_key = key,
        }
    }

    async fn send(&self, store: &dyn Store) -> StoreResult<Page> {
        match self {
            Self::Query(r) => store.query(r.clone()).await,
            Self::Scan(r) => store.scan(r.clone()).await,
        }
    }
}

/// Reads pages until the range is exhausted, the page budget is spent, or
/// `limit` accepted rows are collected.
///
/// `accept` maps each raw row to an output value or drops it. Returns the
/// accepted values and the key to resume from, if any.
pub(crate) async fn collect_pages<T, F>(
    store: &dyn Store,
    mut request: PagedRequest,
    options: &ExecuteOptions,
    key_fields: &[String],
    mut accept: F,
) -> Result<(Vec<T>, Option<Item>)>
where
    F: FnMut(Item) -> Result<Option<T>>,
{
    let limit = options.limit.map(|l| l as usize);
    let mut out = Vec::new();
    let mut pages = 0u32;
    loop {
        if options.is_cancelled() {
            return Err(Error::Cancelled);
        }
        let Page { items, last_evaluated_key } = request
            .send(store)
            .await
            .map_err(|e| Error::from_store(request.operation(), e, options.original_error))?;
        pages += 1;

        let mut rows = items.into_iter().peekable();
        while let Some(row) = rows.next() {
            let key: Item = key_fields
                .iter()
                .filter_map(|f| row.get(f).map(|v| (f.clone(), v.clone())))
                .collect();
            if let Some(value) = accept(row)? {
                out.push(value);
            }
            if limit.is_some_and(|l| out.len() >= l) {
                let resume = if rows.peek().is_some() { Some(key) } else { last_evaluated_key };
                return Ok((out, resume));
            }
        }

        let Some(last) = last_evaluated_key else {
            return Ok((out, None));
        };
        if let Pages::Count(n) = options.pages
            && pages >= n
        {
            return Ok((out, Some(last)));
        }
        request.set_start(Some(last));
    }
}
