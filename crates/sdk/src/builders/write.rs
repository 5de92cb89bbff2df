//! Single-item writes: put, create, update, patch, delete, remove.
//!
//! `create`, `patch`, and `remove` are the conditional forms. They add an
//! existence check over the table key fields to whatever `where_` clauses
//! the caller supplies, and a lost check surfaces as
//! [`Error::ConditionalCheckFailed`].
//!
//! [`UpdateBuilder`] uses type-state so that `go()` is only available once a
//! mutation has been added:
//!
//! ```compile_fail
//! # use tessera::Entity;
//! # use tessera_types::item;
//! # async fn example(invoices: &Entity) {
//! let _ = invoices.update(item! { "accountId" => "A1", "invoiceId" => "I1" }).go().await;
//! # }
//! ```

use std::marker::PhantomData;

use tessera_types::{AttributeValue, DeleteRequest, Item, PutRequest, ReturnValues, UpdateRequest};
use tracing::instrument;

use super::{Conditions, check_key_facets, key_existence};
use crate::{
    batch::timed,
    config::ExecuteOptions,
    entity::Entity,
    error::{Error, Result},
    expression::{Attributes, ExpressionContext, FilterOps},
    pipeline::WriteMode,
    schema::{Attribute, AttributeType, CompiledSchema, ENTITY_FIELD, VERSION_FIELD},
};

/// Type-state marker: no mutation yet.
pub struct NoOps(());

/// Type-state marker: at least one mutation.
pub struct HasOps(());

fn add_condition<F>(
    conditions: Result<Conditions>,
    schema: &CompiledSchema,
    f: F,
) -> Result<Conditions>
where
    F: FnOnce(&Attributes<'_>, &mut FilterOps<'_>) -> Result<String>,
{
    let mut conditions = conditions?;
    conditions.push(schema, f)?;
    Ok(conditions)
}

/// Writes one whole item.
///
/// Created by [`Entity::put`](crate::Entity::put) and
/// [`Entity::create`](crate::Entity::create).
#[derive(Debug)]
pub struct PutBuilder<'a> {
    entity: &'a Entity,
    item: Item,
    create: bool,
    conditions: Result<Conditions>,
    options: ExecuteOptions,
}

impl<'a> PutBuilder<'a> {
    pub(crate) fn new(entity: &'a Entity, item: Item, create: bool) -> Self {
        Self {
            entity,
            item,
            create,
            conditions: Ok(Conditions::default()),
            options: ExecuteOptions::default(),
        }
    }

    /// Adds a condition the stored item must satisfy.
    #[must_use]
    pub fn where_<F>(mut self, f: F) -> Self
    where
        F: FnOnce(&Attributes<'_>, &mut FilterOps<'_>) -> Result<String>,
    {
        self.conditions = add_condition(self.conditions, self.entity.schema(), f);
        self
    }

    /// Replaces the execution options.
    #[must_use]
    pub fn options(mut self, options: ExecuteOptions) -> Self {
        self.options = options;
        self
    }

    fn operation(&self) -> &'static str {
        if self.create { "create" } else { "put" }
    }

    fn compile(self) -> Result<PutRequest> {
        let schema = self.entity.schema();
        let pipeline = self.entity.pipeline();
        let attributes = pipeline.apply_write(&self.item, WriteMode::Put)?;
        let record = pipeline.to_record(&attributes)?;

        let mut conditions = self.conditions?;
        if self.create {
            let clause = key_existence(schema, conditions.ctx(), false);
            conditions.push_raw(clause);
        }
        let (condition, ctx) = conditions.into_parts();
        Ok(PutRequest {
            table: self.entity.config().table().to_owned(),
            item: record,
            condition,
            attributes: ctx.into_attributes(),
        })
    }

    /// Returns the compiled store request without executing it.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] from the write pipeline, or
    /// [`Error::IndexResolution`] if a table-index facet is missing.
    pub fn params(self) -> Result<PutRequest> {
        self.compile()
    }

    /// Writes the item and returns it as a read would.
    ///
    /// # Errors
    ///
    /// Returns compile errors as for [`Self::params`], or the classified
    /// store error. A `create` over an existing item fails with
    /// [`Error::ConditionalCheckFailed`].
    #[instrument(skip_all, fields(entity = %self.entity.model().entity, operation = self.operation()))]
    pub async fn go(self) -> Result<Item> {
        let entity = self.entity;
        let operation = self.operation();
        let options = self.options.clone();
        timed(entity.config(), operation, async move {
            options.validate()?;
            let request = self.compile()?;
            if options.is_cancelled() {
                return Err(Error::Cancelled);
            }
            let record = request.item.clone();
            entity
                .store()
                .put(request)
                .await
                .map_err(|e| Error::from_store(operation, e, options.original_error))?;
            if options.raw {
                return Ok(record);
            }
            Ok(entity.pipeline().apply_read(&record, true)?.unwrap_or_default())
        })
        .await
    }
}

/// Mutations accumulated by an update chain.
#[derive(Debug, Default)]
struct Mutations {
    set: Item,
    remove: Vec<String>,
    add: Item,
    subtract: Item,
    append: Item,
    delete: Item,
}

impl Mutations {
    fn touched(&self) -> impl Iterator<Item = &str> {
        self.set
            .keys()
            .chain(&self.remove)
            .chain(self.add.keys())
            .chain(self.subtract.keys())
            .chain(self.append.keys())
            .chain(self.delete.keys())
            .map(String::as_str)
    }
}

/// Updates attributes of one item.
///
/// Created by [`Entity::update`](crate::Entity::update), which creates the
/// item if it is missing, and [`Entity::patch`](crate::Entity::patch), which
/// requires it to exist.
#[derive(Debug)]
pub struct UpdateBuilder<'a, S = NoOps> {
    entity: &'a Entity,
    facets: Item,
    patch: bool,
    mutations: Mutations,
    conditions: Result<Conditions>,
    options: ExecuteOptions,
    _ops: PhantomData<S>,
}

impl<'a> UpdateBuilder<'a, NoOps> {
    pub(crate) fn new(entity: &'a Entity, facets: Item, patch: bool) -> Self {
        Self {
            entity,
            facets,
            patch,
            mutations: Mutations::default(),
            conditions: Ok(Conditions::default()),
            options: ExecuteOptions::default(),
            _ops: PhantomData,
        }
    }
}

impl<'a, S> UpdateBuilder<'a, S> {
    fn mutate(mut self, f: impl FnOnce(&mut Mutations)) -> UpdateBuilder<'a, HasOps> {
        f(&mut self.mutations);
        UpdateBuilder {
            entity: self.entity,
            facets: self.facets,
            patch: self.patch,
            mutations: self.mutations,
            conditions: self.conditions,
            options: self.options,
            _ops: PhantomData,
        }
    }

    /// Sets attributes to new values.
    ///
    /// Attributes watching them are recomputed, and any secondary index
    /// they feed is re-keyed.
    #[must_use]
    pub fn set(self, values: Item) -> UpdateBuilder<'a, HasOps> {
        self.mutate(|m| m.set.extend(values))
    }

    /// Removes attributes.
    #[must_use]
    pub fn remove<I, T>(self, names: I) -> UpdateBuilder<'a, HasOps>
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        self.mutate(|m| m.remove.extend(names.into_iter().map(Into::into)))
    }

    /// Adds to numbers, or adds elements to sets.
    #[must_use]
    pub fn add(self, values: Item) -> UpdateBuilder<'a, HasOps> {
        self.mutate(|m| m.add.extend(values))
    }

    /// Subtracts from numbers.
    #[must_use]
    pub fn subtract(self, values: Item) -> UpdateBuilder<'a, HasOps> {
        self.mutate(|m| m.subtract.extend(values))
    }

    /// Appends elements to lists.
    #[must_use]
    pub fn append(self, values: Item) -> UpdateBuilder<'a, HasOps> {
        self.mutate(|m| m.append.extend(values))
    }

    /// Deletes elements from sets.
    #[must_use]
    pub fn delete(self, values: Item) -> UpdateBuilder<'a, HasOps> {
        self.mutate(|m| m.delete.extend(values))
    }

    /// Adds a condition the stored item must satisfy.
    #[must_use]
    pub fn where_<F>(mut self, f: F) -> Self
    where
        F: FnOnce(&Attributes<'_>, &mut FilterOps<'_>) -> Result<String>,
    {
        self.conditions = add_condition(self.conditions, self.entity.schema(), f);
        self
    }

    /// Replaces the execution options.
    #[must_use]
    pub fn options(mut self, options: ExecuteOptions) -> Self {
        self.options = options;
        self
    }
}

/// Looks up an attribute an update may touch.
fn mutable_attribute<'s>(schema: &'s CompiledSchema, name: &str) -> Result<&'s Attribute> {
    let attribute = schema
        .attribute(name)
        .ok_or_else(|| Error::validation(name, "not a declared attribute"))?;
    if schema.table_index().slot_of(name).is_some() {
        return Err(Error::validation(name, "table key facets cannot be updated"));
    }
    if attribute.read_only {
        return Err(Error::validation(name, "attribute is read-only"));
    }
    Ok(attribute)
}

/// Checks and coerces the operand of an ADD, subtract, append, or DELETE.
fn operand(
    attribute: &Attribute,
    value: &AttributeValue,
    accepts: fn(&AttributeType) -> bool,
    verb: &str,
) -> Result<AttributeValue> {
    if !accepts(&attribute.kind) {
        return Err(Error::validation(
            &attribute.name,
            format!("cannot {verb} a {} attribute", attribute.kind),
        ));
    }
    match attribute.kind {
        AttributeType::Any => Ok(value.clone()),
        ref kind => kind.coerce(value).map_err(|message| Error::validation(&attribute.name, message)),
    }
}

impl UpdateBuilder<'_, HasOps> {
    fn operation(&self) -> &'static str {
        if self.patch { "patch" } else { "update" }
    }

    fn compile(self) -> Result<UpdateRequest> {
        let schema = self.entity.schema();
        let pipeline = self.entity.pipeline();
        let codec = self.entity.codec();
        check_key_facets(schema, &self.facets)?;
        let key = codec.primary_key(&self.facets)?;

        let mutations = &self.mutations;
        for name in mutations.touched() {
            mutable_attribute(schema, name)?;
        }
        for name in &mutations.remove {
            if schema.attribute(name).is_some_and(|a| a.required) {
                return Err(Error::validation(name.as_str(), "required attributes cannot be removed"));
            }
        }
        let set = pipeline.apply_write(&mutations.set, WriteMode::Update)?;

        let mut conditions = self.conditions?;
        let ctx: &mut ExpressionContext = conditions.ctx();
        let mut set_clauses = Vec::new();
        let mut remove_clauses = Vec::new();

        // Secondary index keys follow their facets.
        let mut available = self.facets.clone();
        available.extend(set.iter().map(|(k, v)| (k.clone(), v.clone())));
        for index in schema.indexes().iter().filter(|i| !i.is_table()) {
            let facets: Vec<&str> = index.facets().collect();
            if let Some(name) = facets.iter().find(|f| {
                mutations.add.contains_key(**f)
                    || mutations.subtract.contains_key(**f)
                    || mutations.append.contains_key(**f)
                    || mutations.delete.contains_key(**f)
            }) {
                return Err(Error::validation(
                    *name,
                    format!("facet of index '{}' can only be set or removed", index.access_pattern()),
                ));
            }
            if facets.iter().any(|f| mutations.remove.iter().any(|r| r.as_str() == *f)) {
                remove_clauses.extend(index.key_fields().map(|field| ctx.name(field)));
                continue;
            }
            let touched = facets.iter().any(|f| set.contains_key(*f));
            let missing: Vec<&str> =
                facets.iter().copied().filter(|f| available.get(*f).is_none_or(AttributeValue::is_null)).collect();
            if touched && !missing.is_empty() {
                return Err(Error::validation(
                    facets.iter().copied().find(|f| set.contains_key(*f)).unwrap_or_default(),
                    format!(
                        "updating index '{}' also requires [{}]",
                        index.access_pattern(),
                        missing.join(", ")
                    ),
                ));
            }
            if missing.is_empty() {
                for (field, value) in codec.index_keys(index, &available)? {
                    set_clauses.push(ctx.equals(&field, value));
                }
            }
        }

        for (field, value) in pipeline.to_physical(&self.facets).into_iter().chain(pipeline.to_physical(&set)) {
            set_clauses.push(ctx.equals(&field, value));
        }
        let model = schema.model();
        set_clauses.push(ctx.equals(ENTITY_FIELD, model.entity.clone()));
        set_clauses.push(ctx.equals(VERSION_FIELD, model.version.clone()));

        for (name, value) in &mutations.subtract {
            let attribute = mutable_attribute(schema, name)?;
            let value = operand(
                attribute,
                value,
                |k| matches!(k, AttributeType::Number | AttributeType::Any),
                "subtract from",
            )?;
            let field = ctx.name(attribute.field_name());
            let placeholder = ctx.value(attribute.field_name(), value);
            set_clauses.push(format!("{field} = {field} - {placeholder}"));
        }
        for (name, value) in &mutations.append {
            let attribute = mutable_attribute(schema, name)?;
            let value = operand(
                attribute,
                value,
                |k| matches!(k, AttributeType::List | AttributeType::Any),
                "append to",
            )?;
            let field = ctx.name(attribute.field_name());
            let empty = ctx.value(attribute.field_name(), AttributeValue::List(Vec::new()));
            let placeholder = ctx.value(attribute.field_name(), value);
            set_clauses.push(format!("{field} = list_append(if_not_exists({field}, {empty}), {placeholder})"));
        }

        for name in &mutations.remove {
            if let Some(attribute) = schema.attribute(name) {
                remove_clauses.push(ctx.name(attribute.field_name()));
            }
        }

        let mut add_clauses = Vec::new();
        for (name, value) in &mutations.add {
            let attribute = mutable_attribute(schema, name)?;
            let value = operand(
                attribute,
                value,
                |k| matches!(k, AttributeType::Number | AttributeType::Set(_) | AttributeType::Any),
                "add to",
            )?;
            let field = ctx.name(attribute.field_name());
            add_clauses.push(format!("{field} {}", ctx.value(attribute.field_name(), value)));
        }
        let mut delete_clauses = Vec::new();
        for (name, value) in &mutations.delete {
            let attribute = mutable_attribute(schema, name)?;
            let value = operand(
                attribute,
                value,
                |k| matches!(k, AttributeType::Set(_) | AttributeType::Any),
                "delete from",
            )?;
            let field = ctx.name(attribute.field_name());
            delete_clauses.push(format!("{field} {}", ctx.value(attribute.field_name(), value)));
        }

        let mut sections = Vec::new();
        for (keyword, clauses) in
            [("SET", set_clauses), ("REMOVE", remove_clauses), ("ADD", add_clauses), ("DELETE", delete_clauses)]
        {
            if !clauses.is_empty() {
                sections.push(format!("{keyword} {}", clauses.join(", ")));
            }
        }

        if self.patch {
            let clause = key_existence(schema, conditions.ctx(), true);
            conditions.push_raw(clause);
        }
        let (condition, ctx) = conditions.into_parts();
        Ok(UpdateRequest {
            table: self.entity.config().table().to_owned(),
            key,
            update: sections.join(" "),
            condition,
            attributes: ctx.into_attributes(),
            return_values: ReturnValues::AllNew,
        })
    }

    /// Returns the compiled store request without executing it.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] for an undeclared, read-only, or key
    /// attribute, a mistyped operand, or a secondary-index facet set without
    /// the other facets of its index.
    pub fn params(self) -> Result<UpdateRequest> {
        self.compile()
    }

    /// Applies the update and returns the item as stored afterwards.
    ///
    /// # Errors
    ///
    /// Returns compile errors as for [`Self::params`], or the classified
    /// store error. A `patch` of a missing item, or a failed `where_`
    /// clause, is [`Error::ConditionalCheckFailed`].
    #[instrument(skip_all, fields(entity = %self.entity.model().entity, operation = self.operation()))]
    pub async fn go(self) -> Result<Option<Item>> {
        let entity = self.entity;
        let operation = self.operation();
        let options = self.options.clone();
        timed(entity.config(), operation, async move {
            options.validate()?;
            let request = self.compile()?;
            if options.is_cancelled() {
                return Err(Error::Cancelled);
            }
            let row = entity
                .store()
                .update(request)
                .await
                .map_err(|e| Error::from_store(operation, e, options.original_error))?;
            match row {
                Some(row) if options.raw => Ok(Some(row)),
                Some(row) => entity.pipeline().apply_read(&row, true),
                None => Ok(None),
            }
        })
        .await
    }
}

/// Deletes one item.
///
/// Created by [`Entity::delete`](crate::Entity::delete) and
/// [`Entity::remove`](crate::Entity::remove).
#[derive(Debug)]
pub struct DeleteBuilder<'a> {
    entity: &'a Entity,
    facets: Item,
    must_exist: bool,
    return_old: bool,
    conditions: Result<Conditions>,
    options: ExecuteOptions,
}

impl<'a> DeleteBuilder<'a> {
    pub(crate) fn new(entity: &'a Entity, facets: Item, must_exist: bool) -> Self {
        Self {
            entity,
            facets,
            must_exist,
            return_old: false,
            conditions: Ok(Conditions::default()),
            options: ExecuteOptions::default(),
        }
    }

    /// Returns the deleted item from `go()`.
    #[must_use]
    pub fn return_old(mut self) -> Self {
        self.return_old = true;
        self
    }

    /// Adds a condition the stored item must satisfy.
    #[must_use]
    pub fn where_<F>(mut self, f: F) -> Self
    where
        F: FnOnce(&Attributes<'_>, &mut FilterOps<'_>) -> Result<String>,
    {
        self.conditions = add_condition(self.conditions, self.entity.schema(), f);
        self
    }

    /// Replaces the execution options.
    #[must_use]
    pub fn options(mut self, options: ExecuteOptions) -> Self {
        self.options = options;
        self
    }

    fn operation(&self) -> &'static str {
        if self.must_exist { "remove" } else { "delete" }
    }

    fn compile(self) -> Result<DeleteRequest> {
        let schema = self.entity.schema();
        check_key_facets(schema, &self.facets)?;
        let key = self.entity.codec().primary_key(&self.facets)?;
        let mut conditions = self.conditions?;
        if self.must_exist {
            let clause = key_existence(schema, conditions.ctx(), true);
            conditions.push_raw(clause);
        }
        let (condition, ctx) = conditions.into_parts();
        Ok(DeleteRequest {
            table: self.entity.config().table().to_owned(),
            key,
            condition,
            attributes: ctx.into_attributes(),
            return_values: if self.return_old { ReturnValues::AllOld } else { ReturnValues::None },
        })
    }

    /// Returns the compiled store request without executing it.
    ///
    /// # Errors
    ///
    /// Returns key errors as for [`crate::builders::GetBuilder::params`].
    pub fn params(self) -> Result<DeleteRequest> {
        self.compile()
    }

    /// Deletes the item.
    ///
    /// Returns what was stored if [`Self::return_old`] was called, and
    /// `None` otherwise.
    ///
    /// # Errors
    ///
    /// Returns key errors, or the classified store error. A `remove` of a
    /// missing item is [`Error::ConditionalCheckFailed`].
    #[instrument(skip_all, fields(entity = %self.entity.model().entity, operation = self.operation()))]
    pub async fn go(self) -> Result<Option<Item>> {
        let entity = self.entity;
        let operation = self.operation();
        let options = self.options.clone();
        timed(entity.config(), operation, async move {
            options.validate()?;
            let request = self.compile()?;
            if options.is_cancelled() {
                return Err(Error::Cancelled);
            }
            let old = entity
                .store()
                .delete(request)
                .await
                .map_err(|e| Error::from_store(operation, e, options.original_error))?;
            match old {
                Some(row) if options.raw => Ok(Some(row)),
                Some(row) => entity.pipeline().apply_read(&row, options.ignore_ownership),
                None => Ok(None),
            }
        })
        .await
    }
}
