//! Attribute pipeline.
//!
//! The write path turns caller input into the attributes that get stored:
//! defaults, set transforms (in watch order), type checks, required checks,
//! then custom validators. The read path turns a stored row back into what
//! the caller sees: ownership check, type check, get transforms, and hidden
//! attributes removed.

use std::collections::{BTreeSet, VecDeque};

use tessera_types::{AttributeValue, Item};
use tracing::trace;

use crate::{
    error::{Error, Result},
    keys::KeyCodec,
    schema::{CompiledSchema, ENTITY_FIELD, IndexDescriptor, Projection, VERSION_FIELD},
};

/// Which write operation is running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    /// `put` and `create`: the input is the whole item.
    Put,
    /// `update` and `patch`: the input is a partial set of attributes.
    Update,
}

/// Applies an entity's attribute rules in both directions.
#[derive(Debug, Clone, Copy)]
pub struct AttributePipeline<'a> {
    schema: &'a CompiledSchema,
}

impl<'a> AttributePipeline<'a> {
    /// Creates a pipeline over `schema`.
    #[must_use]
    pub fn new(schema: &'a CompiledSchema) -> Self {
        Self { schema }
    }

    /// Runs the write path over `input`, keyed by attribute name.
    ///
    /// In [`WriteMode::Put`] every attribute is considered: defaults fill
    /// gaps, every set transform runs, and required attributes must end up
    /// present. In [`WriteMode::Update`] only the supplied attributes and the
    /// attributes watching them are touched; read-only attributes and
    /// table-key facets are rejected.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] naming the first failing attribute.
    pub fn apply_write(&self, input: &Item, mode: WriteMode) -> Result<Item> {
        self.check_known(input)?;
        let mut item: Item =
            input.iter().filter(|(_, v)| !v.is_null()).map(|(k, v)| (k.clone(), v.clone())).collect();

        let affected = match mode {
            WriteMode::Put => None,
            WriteMode::Update => {
                self.check_mutable(input)?;
                Some(self.affected_by(input))
            },
        };

        for &position in self.schema.write_order() {
            if affected.as_ref().is_some_and(|a| !a.contains(&position)) {
                continue;
            }
            let attribute = &self.schema.attributes()[position];
            if mode == WriteMode::Put
                && !item.contains_key(&attribute.name)
                && let Some(default) = &attribute.default
            {
                item.insert(attribute.name.clone(), default());
            }
            if let Some(set) = &attribute.set {
                match set(item.get(&attribute.name), &item) {
                    Some(value) if !value.is_null() => {
                        item.insert(attribute.name.clone(), value);
                    },
                    _ => {
                        item.remove(&attribute.name);
                    },
                }
            }
        }

        for attribute in self.schema.attributes() {
            match item.get_mut(&attribute.name) {
                Some(value) => {
                    *value = attribute
                        .kind
                        .coerce(value)
                        .map_err(|message| Error::validation(&attribute.name, message))?;
                    if let Some(validate) = &attribute.validate {
                        validate(value).map_err(|message| Error::validation(&attribute.name, message))?;
                    }
                },
                None if mode == WriteMode::Put && attribute.required => {
                    return Err(Error::validation(&attribute.name, "required attribute is missing"));
                },
                None => {},
            }
        }

        trace!(entity = %self.schema.model().entity, ?mode, attributes = item.len(), "Applied write pipeline");
        Ok(item)
    }

    /// Runs the read path over a physical row.
    ///
    /// Returns `Ok(None)` when the row belongs to another entity or version
    /// and `ignore_ownership` is false.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Decode`] if a stored value does not match its
    /// attribute's declared type.
    pub fn apply_read(&self, row: &Item, ignore_ownership: bool) -> Result<Option<Item>> {
        if !ignore_ownership && !self.schema.owns(row) {
            return Ok(None);
        }

        let mut decoded = Item::new();
        for attribute in self.schema.attributes() {
            let Some(value) = row.get(attribute.field_name()).filter(|v| !v.is_null()) else {
                continue;
            };
            if !attribute.kind.accepts_stored(value) {
                return Err(Error::decode(
                    attribute.field_name(),
                    format!("expected {}, found {}", attribute.kind, value.type_name()),
                ));
            }
            decoded.insert(attribute.name.clone(), value.clone());
        }

        let mut output = Item::new();
        for attribute in self.schema.attributes() {
            if attribute.hidden {
                continue;
            }
            let Some(value) = decoded.get(&attribute.name) else {
                continue;
            };
            let value = match &attribute.get {
                Some(get) => get(value, &decoded),
                None => Some(value.clone()),
            };
            if let Some(value) = value {
                output.insert(attribute.name.clone(), value);
            }
        }
        Ok(Some(output))
    }

    /// Reads a row returned from `index`, whatever its projection.
    ///
    /// Rows carrying this entity's tags go through [`Self::apply_read`].
    /// Rows from a keys-only or include projection carry no tags; their
    /// facets are rebuilt from the table and index keys, and a key that does
    /// not decode marks the row as foreign.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Decode`] if a stored value does not match its type.
    pub fn read_row(
        &self,
        index: &IndexDescriptor,
        row: &Item,
        ignore_ownership: bool,
    ) -> Result<Option<Item>> {
        let tagged = row.contains_key(ENTITY_FIELD);
        if tagged || *index.projection() == Projection::All {
            return self.apply_read(row, ignore_ownership);
        }

        let facets = match KeyCodec::new(self.schema).facets_from_row(index, row) {
            Ok(facets) => facets,
            Err(e) => {
                trace!(error = %e, "Row keys do not decode for this entity");
                return Ok(None);
            },
        };
        let mut physical = row.clone();
        physical.extend(self.to_physical(&facets));
        self.apply_read(&physical, true)
    }

    /// Builds the stored record: physical fields, every index key, and the
    /// record-type tags.
    ///
    /// # Errors
    ///
    /// Returns [`Error::IndexResolution`] if the table-index facets are not
    /// all present.
    pub fn to_record(&self, attributes: &Item) -> Result<Item> {
        let mut record = KeyCodec::new(self.schema).record_keys(attributes)?;
        record.extend(self.to_physical(attributes));
        let model = self.schema.model();
        record.insert(ENTITY_FIELD.to_owned(), AttributeValue::from(&model.entity));
        record.insert(VERSION_FIELD.to_owned(), AttributeValue::from(&model.version));
        Ok(record)
    }

    /// Renames attribute names to physical field names, dropping undeclared names.
    #[must_use]
    pub fn to_physical(&self, attributes: &Item) -> Item {
        attributes
            .iter()
            .filter_map(|(name, value)| {
                self.schema.attribute(name).map(|a| (a.field_name().to_owned(), value.clone()))
            })
            .collect()
    }

    fn check_known(&self, input: &Item) -> Result<()> {
        match input.keys().find(|name| self.schema.attribute(name).is_none()) {
            Some(name) => Err(Error::validation(name.clone(), "not a declared attribute")),
            None => Ok(()),
        }
    }

    fn check_mutable(&self, input: &Item) -> Result<()> {
        let table = self.schema.table_index();
        for name in input.keys() {
            if table.slot_of(name).is_some() {
                return Err(Error::validation(name.clone(), "table key facets cannot be updated"));
            }
            if self.schema.attribute(name).is_some_and(|a| a.read_only) {
                return Err(Error::validation(name.clone(), "attribute is read-only"));
            }
        }
        Ok(())
    }

    /// Positions of the supplied attributes plus everything that watches
    /// them, transitively.
    fn affected_by(&self, input: &Item) -> BTreeSet<usize> {
        let mut affected = BTreeSet::new();
        let mut queue: VecDeque<usize> =
            input.keys().filter_map(|name| self.schema.position(name)).collect();
        while let Some(position) = queue.pop_front() {
            if affected.insert(position) {
                queue.extend(self.schema.watchers_of(position));
            }
        }
        affected
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::disallowed_methods)]
mod tests {
    use tessera_types::item;

    use super::*;
    use crate::schema::{Attribute, Index, Model, Schema};

    fn schema() -> CompiledSchema {
        Schema::new(Model::new("billing", "invoice", "1"))
            .attribute(Attribute::string("accountId").required())
            .attribute(Attribute::string("invoiceId").required())
            .attribute(Attribute::enumeration("status", ["open", "paid"]).default_value("open"))
            .attribute(
                Attribute::number("amount").validate(|v| match v.as_number() {
                    Some(n) if n < 0.0 => Err("must not be negative".to_owned()),
                    _ => Ok(()),
                }),
            )
            .attribute(Attribute::string("createdAt").read_only().default_value("2024-01-01"))
            .attribute(
                Attribute::string("label")
                    .watch(["status", "amount"])
                    .on_set(|_, item| {
                        let status = item.get("status").and_then(|v| v.as_str())?;
                        Some(AttributeValue::from(format!("{status}:{}", item.get("amount").map_or(0.0, |a| a.as_number().unwrap_or(0.0)))))
                    }),
            )
            .attribute(
                Attribute::string("email")
                    .field("em")
                    .on_set(|v, _| v.and_then(|v| v.as_str()).map(|s| s.to_lowercase().into())),
            )
            .attribute(Attribute::string("secret").hidden())
            .attribute(Attribute::string("note").on_get(|v, _| {
                if v.as_str() == Some("") { None } else { Some(v.clone()) }
            }))
            .index(Index::table("invoices").pk("pk", ["accountId"]).sk("sk", ["invoiceId"]))
            .compile()
            .unwrap()
    }

    #[test]
    fn test_put_applies_defaults_transforms_and_watchers() {
        let schema = schema();
        let pipeline = AttributePipeline::new(&schema);
        let out = pipeline
            .apply_write(
                &item! { "accountId" => "A1", "invoiceId" => "I1", "amount" => 10, "email" => "Ann@X.io" },
                WriteMode::Put,
            )
            .unwrap();
        assert_eq!(out["status"], AttributeValue::from("open"));
        assert_eq!(out["createdAt"], AttributeValue::from("2024-01-01"));
        assert_eq!(out["label"], AttributeValue::from("open:10"));
        assert_eq!(out["email"], AttributeValue::from("ann@x.io"));
    }

    #[test]
    fn test_put_requires_required_attributes() {
        let schema = schema();
        let pipeline = AttributePipeline::new(&schema);
        let err = pipeline.apply_write(&item! { "accountId" => "A1" }, WriteMode::Put).unwrap_err();
        assert!(matches!(err, Error::Validation { ref attribute, .. } if attribute == "invoiceId"));
    }

    #[test]
    fn test_validator_and_enum_failures_name_attribute() {
        let schema = schema();
        let pipeline = AttributePipeline::new(&schema);
        let err = pipeline
            .apply_write(&item! { "accountId" => "A1", "invoiceId" => "I1", "amount" => -1 }, WriteMode::Put)
            .unwrap_err();
        assert_eq!(err.to_string(), "Validation failed for 'amount': must not be negative");

        let err = pipeline
            .apply_write(&item! { "accountId" => "A1", "invoiceId" => "I1", "status" => "void" }, WriteMode::Put)
            .unwrap_err();
        assert!(matches!(err, Error::Validation { ref attribute, .. } if attribute == "status"));
    }

    #[test]
    fn test_update_touches_only_supplied_and_watchers() {
        let schema = schema();
        let pipeline = AttributePipeline::new(&schema);
        let out = pipeline.apply_write(&item! { "status" => "paid" }, WriteMode::Update).unwrap();
        // no defaults on update; label recomputed from the patch alone
        assert_eq!(out, item! { "status" => "paid", "label" => "paid:0" });
    }

    #[test]
    fn test_update_rejects_read_only_and_key_facets() {
        let schema = schema();
        let pipeline = AttributePipeline::new(&schema);
        let err = pipeline.apply_write(&item! { "createdAt" => "x" }, WriteMode::Update).unwrap_err();
        assert!(err.to_string().contains("read-only"));
        let err = pipeline.apply_write(&item! { "invoiceId" => "I2" }, WriteMode::Update).unwrap_err();
        assert!(err.to_string().contains("table key facets"));
        // put may still set read-only attributes
        assert!(
            pipeline
                .apply_write(&item! { "accountId" => "A", "invoiceId" => "I", "createdAt" => "x" }, WriteMode::Put)
                .is_ok()
        );
    }

    #[test]
    fn test_unknown_attribute_rejected() {
        let schema = schema();
        let pipeline = AttributePipeline::new(&schema);
        let err = pipeline.apply_write(&item! { "nope" => 1 }, WriteMode::Update).unwrap_err();
        assert!(matches!(err, Error::Validation { ref attribute, .. } if attribute == "nope"));
    }

    #[test]
    fn test_write_is_idempotent() {
        let schema = schema();
        let pipeline = AttributePipeline::new(&schema);
        let once = pipeline
            .apply_write(&item! { "accountId" => "A1", "invoiceId" => "I1", "email" => "MiXeD" }, WriteMode::Put)
            .unwrap();
        let twice = pipeline.apply_write(&once, WriteMode::Put).unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn test_record_round_trips_through_read() {
        let schema = schema();
        let pipeline = AttributePipeline::new(&schema);
        let attrs = pipeline
            .apply_write(
                &item! { "accountId" => "A1", "invoiceId" => "I1", "secret" => "s", "note" => "", "email" => "e" },
                WriteMode::Put,
            )
            .unwrap();
        let record = pipeline.to_record(&attrs).unwrap();
        assert_eq!(record["pk"], AttributeValue::from("$billing#accountId_A1"));
        assert_eq!(record["em"], AttributeValue::from("e"));
        assert_eq!(record[ENTITY_FIELD], AttributeValue::from("invoice"));

        let read = pipeline.apply_read(&record, false).unwrap().unwrap();
        assert!(!read.contains_key("secret"), "hidden attributes are not returned");
        assert!(!read.contains_key("note"), "get transform returning None omits the attribute");
        assert_eq!(read["email"], AttributeValue::from("e"));
        assert!(!read.contains_key("pk"));
    }

    #[test]
    fn test_read_drops_foreign_rows_unless_ignoring_ownership() {
        let schema = schema();
        let pipeline = AttributePipeline::new(&schema);
        let row = item! { ENTITY_FIELD => "payment", VERSION_FIELD => "1", "accountId" => "A1" };
        assert!(pipeline.apply_read(&row, false).unwrap().is_none());
        let read = pipeline.apply_read(&row, true).unwrap().unwrap();
        assert_eq!(read, item! { "accountId" => "A1" });
    }

    #[test]
    fn test_read_type_mismatch_is_decode_error() {
        let schema = schema();
        let pipeline = AttributePipeline::new(&schema);
        let row = item! { ENTITY_FIELD => "invoice", VERSION_FIELD => "1", "amount" => "ten" };
        let err = pipeline.apply_read(&row, false).unwrap_err();
        assert!(matches!(err, Error::Decode { ref what, .. } if what == "amount"));
    }
}
