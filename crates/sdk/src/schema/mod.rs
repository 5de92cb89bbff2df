//! Entity schema declarations and their compiled form.
//!
//! A [`Schema`] is the raw declaration: model identity, attributes, and
//! indexes. [`Schema::compile`] validates it once and produces a
//! [`CompiledSchema`] that every other component reads from. Compilation is
//! the only place schema errors are raised.
//!
//! ```
//! use tessera::schema::{Attribute, Index, Model, Schema};
//!
//! let schema = Schema::new(Model::new("billing", "invoice", "1"))
//!     .attribute(Attribute::string("accountId").required())
//!     .attribute(Attribute::string("invoiceId").required())
//!     .attribute(Attribute::number("amount"))
//!     .index(Index::table("invoices").pk("pk", ["accountId"]).sk("sk", ["invoiceId"]))
//!     .compile()
//!     .expect("valid schema");
//! assert_eq!(schema.table_index().pk().prefix(), "$billing");
//! ```

mod attribute;
mod compile;
mod index;

pub use attribute::{Attribute, AttributeType, DefaultFn, GetFn, SetFn, SetKind, ValidateFn};
pub use compile::{CompiledSchema, ENTITY_FIELD, VERSION_FIELD};
pub use index::{Casing, Index, IndexDescriptor, KeySegment, Projection, Segment, Slot};

use crate::error::Result;

/// Identity of an entity: which service it belongs to, its name, and schema version.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Model {
    /// Service namespace shared by entities that live in one table.
    pub service: String,
    /// Entity name.
    pub entity: String,
    /// Schema version.
    pub version: String,
}

impl Model {
    /// Creates a model identity.
    pub fn new(
        service: impl Into<String>,
        entity: impl Into<String>,
        version: impl Into<String>,
    ) -> Self {
        Self { service: service.into(), entity: entity.into(), version: version.into() }
    }
}

/// Uncompiled entity declaration.
#[derive(Debug, Clone)]
pub struct Schema {
    pub(crate) model: Model,
    pub(crate) attributes: Vec<Attribute>,
    pub(crate) indexes: Vec<Index>,
}

impl Schema {
    /// Starts a declaration for `model`.
    pub fn new(model: Model) -> Self {
        Self { model, attributes: Vec::new(), indexes: Vec::new() }
    }

    /// Adds an attribute. Declaration order is significant: it breaks ties
    /// in watch ordering and in index selection.
    #[must_use]
    pub fn attribute(mut self, attribute: Attribute) -> Self {
        self.attributes.push(attribute);
        self
    }

    /// Adds an index.
    #[must_use]
    pub fn index(mut self, index: Index) -> Self {
        self.indexes.push(index);
        self
    }

    /// Validates the declaration and builds the compiled schema.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Schema`](crate::Error::Schema) describing the first
    /// problem found.
    pub fn compile(self) -> Result<CompiledSchema> {
        CompiledSchema::compile(self)
    }
}
