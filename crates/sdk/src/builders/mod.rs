//! Fluent builders for entity operations.
//!
//! Each builder compiles one store request. Builders consume themselves on
//! their terminal call (`go()`, `page()`, or `params()`), so a chain can
//! produce exactly one operation. Type-state markers restrict which methods
//! are available at each step:
//!
//! - [`QueryBuilder<KeyStage>`](QueryBuilder) accepts one range comparator;
//!   afterwards it becomes a [`QueryBuilder<FilterStage>`](QueryBuilder) that
//!   only accepts filters and terminals.
//! - [`UpdateBuilder<NoOps>`](UpdateBuilder) has no terminal until at least one
//!   mutation has been added.
//!
//! Errors found while building (unknown attributes, comparators out of slot
//! order) are held until the terminal call and returned from it, before any
//! store call is made.

mod batch;
mod query;
mod read;
mod write;

pub use batch::{BatchWriteBuilder, BatchWriteOutput};
pub use query::{FilterStage, KeyStage, QueryBuilder, QueryPage, ScanBuilder};
pub(crate) use query::{PagedRequest, collect_pages, resume_key_fields};
pub use read::{BatchGetBuilder, GetBuilder};
pub use write::{DeleteBuilder, HasOps, NoOps, PutBuilder, UpdateBuilder};

use tessera_types::Item;

use crate::{
    error::{Error, Result},
    expression::{Attributes, ExpressionContext, FilterOps, join_clauses},
    schema::CompiledSchema,
};

/// Conditions accumulated by `where_` on a write builder.
#[derive(Debug, Default)]
pub(crate) struct Conditions {
    ctx: ExpressionContext,
    clauses: Vec<String>,
}

impl Conditions {
    pub(crate) fn push<F>(&mut self, schema: &CompiledSchema, f: F) -> Result<()>
    where
        F: FnOnce(&Attributes<'_>, &mut FilterOps<'_>) -> Result<String>,
    {
        if let Some(clause) = self.ctx.compile(&[schema], f)? {
            self.clauses.push(clause);
        }
        Ok(())
    }

    /// Adds a pre-rendered clause.
    pub(crate) fn push_raw(&mut self, clause: String) {
        self.clauses.push(clause);
    }

    pub(crate) fn ctx(&mut self) -> &mut ExpressionContext {
        &mut self.ctx
    }

    pub(crate) fn into_parts(self) -> (Option<String>, ExpressionContext) {
        (join_clauses(&self.clauses), self.ctx)
    }
}

/// Renders `attribute_exists` (or `attribute_not_exists`) over every key
/// field of the table index.
pub(crate) fn key_existence(schema: &CompiledSchema, ctx: &mut ExpressionContext, exists: bool) -> String {
    let function = if exists { "attribute_exists" } else { "attribute_not_exists" };
    schema
        .table_index()
        .key_fields()
        .map(|field| format!("{function}({})", ctx.name(field)))
        .collect::<Vec<_>>()
        .join(" AND ")
}

/// Rejects facets that are not table-index facets.
pub(crate) fn check_key_facets(schema: &CompiledSchema, facets: &Item) -> Result<()> {
    let table = schema.table_index();
    match facets.keys().find(|name| table.slot_of(name).is_none()) {
        Some(name) => Err(Error::validation(
            name.clone(),
            format!("not a facet of table index '{}'", table.access_pattern()),
        )),
        None => Ok(()),
    }
}
