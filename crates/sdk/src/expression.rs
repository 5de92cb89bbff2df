//! Filter and condition expression compilation.
//!
//! Callers describe filters with a callback that receives two helpers: an
//! [`Attributes`] lookup that only hands out declared attributes, and a
//! [`FilterOps`] value that renders comparisons while registering
//! placeholders in a shared [`ExpressionContext`]:
//!
//! ```
//! # use tessera::expression::{Attributes, ExpressionContext, FilterOps};
//! # use tessera::schema::{Attribute, Index, Model, Schema};
//! # let schema = Schema::new(Model::new("billing", "invoice", "1"))
//! #     .attribute(Attribute::string("id"))
//! #     .attribute(Attribute::number("amount"))
//! #     .index(Index::table("t").pk("pk", ["id"]))
//! #     .compile()?;
//! let mut ctx = ExpressionContext::new();
//! let clause = ctx.compile(&[&schema], |attr, op| {
//!     Ok(format!("{} AND {}", op.gte(attr.get("amount")?, 100), op.exists(attr.get("id")?)))
//! })?;
//! assert_eq!(clause.as_deref(), Some("#amount >= :amount0 AND attribute_exists(#id)"));
//! # Ok::<(), tessera::Error>(())
//! ```
//!
//! Name placeholders are derived from the field name and reused for the
//! same field; value placeholders carry a counter so repeated use of one
//! field never collides.

use std::collections::{BTreeMap, HashMap};

use tessera_types::{AttributeValue, ExpressionAttributes};

use crate::{
    error::{Error, Result},
    schema::CompiledSchema,
};

/// Placeholder registry shared by every clause of one request.
#[derive(Debug, Clone, Default)]
pub struct ExpressionContext {
    names: BTreeMap<String, String>,
    by_field: HashMap<String, String>,
    values: BTreeMap<String, AttributeValue>,
    counters: HashMap<String, usize>,
}

impl ExpressionContext {
    /// Creates an empty context.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the `#name` placeholder for `field`, registering it on first use.
    pub fn name(&mut self, field: &str) -> String {
        if let Some(existing) = self.by_field.get(field) {
            return existing.clone();
        }
        let base = sanitize(field);
        let mut candidate = format!("#{base}");
        let mut n = 0;
        while self.names.contains_key(&candidate) {
            n += 1;
            candidate = format!("#{base}_{n}");
        }
        self.names.insert(candidate.clone(), field.to_owned());
        self.by_field.insert(field.to_owned(), candidate.clone());
        candidate
    }

    /// Registers `value` under a fresh `:value` placeholder derived from `field`.
    pub fn value(&mut self, field: &str, value: impl Into<AttributeValue>) -> String {
        let base = sanitize(field);
        let counter = self.counters.entry(base.clone()).or_insert(0);
        let mut candidate = format!(":{base}{counter}");
        while self.values.contains_key(&candidate) {
            *counter += 1;
            candidate = format!(":{base}{counter}");
        }
        *counter += 1;
        self.values.insert(candidate.clone(), value.into());
        candidate
    }

    /// Renders `#field = :value`.
    pub fn equals(&mut self, field: &str, value: impl Into<AttributeValue>) -> String {
        let name = self.name(field);
        let value = self.value(field, value);
        format!("{name} = {value}")
    }

    /// Runs a filter callback against the attributes of `schemas`.
    ///
    /// Returns `Ok(None)` if the callback produced an empty expression.
    ///
    /// # Errors
    ///
    /// Propagates the callback's error, including [`Error::Validation`] from
    /// [`Attributes::get`] on an undeclared attribute.
    pub fn compile<F>(&mut self, schemas: &[&CompiledSchema], f: F) -> Result<Option<String>>
    where
        F: FnOnce(&Attributes<'_>, &mut FilterOps<'_>) -> Result<String>,
    {
        let attributes = Attributes { schemas };
        let mut ops = FilterOps { ctx: self };
        let rendered = f(&attributes, &mut ops)?;
        let trimmed = rendered.trim();
        Ok((!trimmed.is_empty()).then(|| trimmed.to_owned()))
    }

    /// Returns true if no placeholders are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.names.is_empty() && self.values.is_empty()
    }

    /// Snapshot of the registered placeholders.
    #[must_use]
    pub fn attributes(&self) -> ExpressionAttributes {
        ExpressionAttributes { names: self.names.clone(), values: self.values.clone() }
    }

    /// Consumes the context into the placeholder maps.
    #[must_use]
    pub fn into_attributes(self) -> ExpressionAttributes {
        ExpressionAttributes { names: self.names, values: self.values }
    }
}

/// A declared attribute, as handed to filter callbacks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttributeRef<'s> {
    name: &'s str,
    field: &'s str,
}

impl<'s> AttributeRef<'s> {
    /// Attribute name.
    #[must_use]
    pub fn name(&self) -> &'s str {
        self.name
    }

    /// Physical field name.
    #[must_use]
    pub fn field(&self) -> &'s str {
        self.field
    }
}

/// Attribute lookup passed to filter callbacks.
#[derive(Debug, Clone, Copy)]
pub struct Attributes<'s> {
    schemas: &'s [&'s CompiledSchema],
}

impl<'s> Attributes<'s> {
    /// Returns the named attribute.
    ///
    /// For collection queries the lookup spans every member entity; the
    /// first entity declaring the name wins.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] if no entity declares `name`.
    pub fn get(&self, name: &str) -> Result<AttributeRef<'s>> {
        self.schemas
            .iter()
            .find_map(|schema| schema.attribute(name))
            .map(|a| AttributeRef { name: a.name(), field: a.field_name() })
            .ok_or_else(|| Error::validation(name, "not a declared attribute"))
    }
}

/// Expression operators handed to filter callbacks.
///
/// Every method registers the placeholders it needs and returns the
/// rendered fragment.
#[derive(Debug)]
pub struct FilterOps<'c> {
    ctx: &'c mut ExpressionContext,
}

impl FilterOps<'_> {
    fn binary(&mut self, attr: AttributeRef<'_>, op: &str, value: AttributeValue) -> String {
        let name = self.ctx.name(attr.field);
        let value = self.ctx.value(attr.field, value);
        format!("{name} {op} {value}")
    }

    /// `attr = value`
    pub fn eq(&mut self, attr: AttributeRef<'_>, value: impl Into<AttributeValue>) -> String {
        self.binary(attr, "=", value.into())
    }

    /// `attr <> value`
    pub fn ne(&mut self, attr: AttributeRef<'_>, value: impl Into<AttributeValue>) -> String {
        self.binary(attr, "<>", value.into())
    }

    /// `attr > value`
    pub fn gt(&mut self, attr: AttributeRef<'_>, value: impl Into<AttributeValue>) -> String {
        self.binary(attr, ">", value.into())
    }

    /// `attr >= value`
    pub fn gte(&mut self, attr: AttributeRef<'_>, value: impl Into<AttributeValue>) -> String {
        self.binary(attr, ">=", value.into())
    }

    /// `attr < value`
    pub fn lt(&mut self, attr: AttributeRef<'_>, value: impl Into<AttributeValue>) -> String {
        self.binary(attr, "<", value.into())
    }

    /// `attr <= value`
    pub fn lte(&mut self, attr: AttributeRef<'_>, value: impl Into<AttributeValue>) -> String {
        self.binary(attr, "<=", value.into())
    }

    /// `(attr BETWEEN low AND high)`
    pub fn between(
        &mut self,
        attr: AttributeRef<'_>,
        low: impl Into<AttributeValue>,
        high: impl Into<AttributeValue>,
    ) -> String {
        let name = self.ctx.name(attr.field);
        let low = self.ctx.value(attr.field, low);
        let high = self.ctx.value(attr.field, high);
        format!("({name} BETWEEN {low} AND {high})")
    }

    /// `begins_with(attr, value)`
    pub fn begins(&mut self, attr: AttributeRef<'_>, value: impl Into<AttributeValue>) -> String {
        let name = self.ctx.name(attr.field);
        let value = self.ctx.value(attr.field, value);
        format!("begins_with({name}, {value})")
    }

    /// `attribute_exists(attr)`
    pub fn exists(&mut self, attr: AttributeRef<'_>) -> String {
        format!("attribute_exists({})", self.ctx.name(attr.field))
    }

    /// `attribute_not_exists(attr)`
    pub fn not_exists(&mut self, attr: AttributeRef<'_>) -> String {
        format!("attribute_not_exists({})", self.ctx.name(attr.field))
    }

    /// `contains(attr, value)`
    pub fn contains(&mut self, attr: AttributeRef<'_>, value: impl Into<AttributeValue>) -> String {
        let name = self.ctx.name(attr.field);
        let value = self.ctx.value(attr.field, value);
        format!("contains({name}, {value})")
    }

    /// `NOT contains(attr, value)`
    pub fn not_contains(
        &mut self,
        attr: AttributeRef<'_>,
        value: impl Into<AttributeValue>,
    ) -> String {
        format!("NOT {}", self.contains(attr, value))
    }

    /// `size(attr)`, for use on the left of a comparison.
    pub fn size(&mut self, attr: AttributeRef<'_>) -> String {
        format!("size({})", self.ctx.name(attr.field))
    }

    /// The bare `#name` placeholder of `attr`.
    pub fn name(&mut self, attr: AttributeRef<'_>) -> String {
        self.ctx.name(attr.field)
    }

    /// A bare `:value` placeholder for `value`, named after `attr`.
    pub fn value(&mut self, attr: AttributeRef<'_>, value: impl Into<AttributeValue>) -> String {
        self.ctx.value(attr.field, value)
    }
}

/// ANDs compiled clauses, parenthesizing each when there is more than one.
pub(crate) fn join_clauses(clauses: &[String]) -> Option<String> {
    match clauses {
        [] => None,
        [only] => Some(only.clone()),
        many => Some(many.iter().map(|c| format!("({c})")).collect::<Vec<_>>().join(" AND ")),
    }
}

fn sanitize(field: &str) -> String {
    let cleaned: String =
        field.chars().map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' }).collect();
    if cleaned.is_empty() { "f".to_owned() } else { cleaned }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::disallowed_methods)]
mod tests {
    use super::*;
    use crate::schema::{Attribute, Index, Model, Schema};

    fn schema() -> CompiledSchema {
        Schema::new(Model::new("billing", "invoice", "1"))
            .attribute(Attribute::string("id"))
            .attribute(Attribute::string("status"))
            .attribute(Attribute::number("amount").field("amt"))
            .attribute(Attribute::string("dotted").field("a.b"))
            .attribute(Attribute::string("under").field("a_b"))
            .index(Index::table("t").pk("pk", ["id"]))
            .compile()
            .unwrap()
    }

    #[test]
    fn test_value_counters_are_shared_across_clauses() {
        let schema = schema();
        let mut ctx = ExpressionContext::new();
        let first = ctx
            .compile(&[&schema], |attr, op| Ok(op.eq(attr.get("status")?, "open")))
            .unwrap()
            .unwrap();
        let second = ctx
            .compile(&[&schema], |attr, op| {
                let status = attr.get("status")?;
                Ok(format!("{} OR {}", op.eq(status, "paid"), op.ne(status, "void")))
            })
            .unwrap()
            .unwrap();
        assert_eq!(first, "#status = :status0");
        assert_eq!(second, "#status = :status1 OR #status <> :status2");
        let attributes = ctx.into_attributes();
        assert_eq!(attributes.names.len(), 1);
        assert_eq!(attributes.values.len(), 3);
    }

    #[test]
    fn test_placeholders_use_physical_fields() {
        let schema = schema();
        let mut ctx = ExpressionContext::new();
        let clause = ctx
            .compile(&[&schema], |attr, op| Ok(op.between(attr.get("amount")?, 1, 9)))
            .unwrap()
            .unwrap();
        assert_eq!(clause, "(#amt BETWEEN :amt0 AND :amt1)");
        assert_eq!(ctx.attributes().names["#amt"], "amt");
    }

    #[test]
    fn test_sanitized_names_never_collide() {
        let schema = schema();
        let mut ctx = ExpressionContext::new();
        let clause = ctx
            .compile(&[&schema], |attr, op| {
                Ok(format!("{} AND {}", op.eq(attr.get("dotted")?, "x"), op.eq(attr.get("under")?, "y")))
            })
            .unwrap()
            .unwrap();
        assert_eq!(clause, "#a_b = :a_b0 AND #a_b_1 = :a_b1");
        let names = ctx.into_attributes().names;
        assert_eq!(names["#a_b"], "a.b");
        assert_eq!(names["#a_b_1"], "a_b");
    }

    #[test]
    fn test_unknown_attribute_fails_compilation() {
        let schema = schema();
        let mut ctx = ExpressionContext::new();
        let err = ctx.compile(&[&schema], |attr, op| Ok(op.exists(attr.get("ghost")?))).unwrap_err();
        assert!(matches!(err, Error::Validation { ref attribute, .. } if attribute == "ghost"));
    }

    #[test]
    fn test_empty_clause_is_dropped() {
        let schema = schema();
        let mut ctx = ExpressionContext::new();
        assert!(ctx.compile(&[&schema], |_, _| Ok("  ".to_owned())).unwrap().is_none());
    }

    #[test]
    fn test_operator_rendering() {
        let schema = schema();
        let mut ctx = ExpressionContext::new();
        let clause = ctx
            .compile(&[&schema], |attr, op| {
                let id = attr.get("id")?;
                Ok([
                    op.begins(id, "I-"),
                    op.not_exists(id),
                    op.not_contains(id, "x"),
                    format!("{} > {}", op.size(id), op.value(id, 3)),
                ]
                .join(" AND "))
            })
            .unwrap()
            .unwrap();
        assert_eq!(
            clause,
            "begins_with(#id, :id0) AND attribute_not_exists(#id) AND NOT contains(#id, :id1) AND size(#id) > :id2"
        );
    }

    #[test]
    fn test_join_clauses() {
        assert_eq!(join_clauses(&[]), None);
        assert_eq!(join_clauses(&["a = b".to_owned()]).as_deref(), Some("a = b"));
        assert_eq!(
            join_clauses(&["a".to_owned(), "b OR c".to_owned()]).as_deref(),
            Some("(a) AND (b OR c)")
        );
    }
}
