//! Index declarations and their compiled descriptors.

use std::collections::HashMap;

/// Which attributes a secondary index carries.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Projection {
    /// Every attribute.
    #[default]
    All,
    /// Only table and index key fields. Reads rebuild facets from the keys.
    KeysOnly,
    /// Key fields plus the named attributes.
    Include(Vec<String>),
}

/// Case folding applied to encoded keys.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Casing {
    /// Keys keep the case of their inputs.
    #[default]
    None,
    /// Keys are lowercased.
    Lower,
    /// Keys are uppercased.
    Upper,
}

impl Casing {
    pub(crate) fn apply(self, s: &str) -> String {
        match self {
            Self::None => s.to_owned(),
            Self::Lower => s.to_lowercase(),
            Self::Upper => s.to_uppercase(),
        }
    }
}

/// Partition or sort half of a composite key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Segment {
    /// Partition key.
    Partition,
    /// Sort key.
    Sort,
}

/// Where a facet sits inside an index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Slot {
    /// Which key the facet belongs to.
    pub segment: Segment,
    /// Zero-based position within that key.
    pub position: usize,
}

/// Declared key: the physical field it is written to and its ordered facets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyDef {
    pub(crate) field: String,
    pub(crate) facets: Vec<String>,
}

/// Declaration of one access pattern.
///
/// ```
/// use tessera::schema::Index;
///
/// let by_status = Index::secondary("byStatus", "gsi1")
///     .pk("gsi1pk", ["accountId"])
///     .sk("gsi1sk", ["status", "createdAt"])
///     .collection("ledger");
/// assert_eq!(by_status.access_pattern(), "byStatus");
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Index {
    pub(crate) access_pattern: String,
    pub(crate) physical: Option<String>,
    pub(crate) pk: Option<KeyDef>,
    pub(crate) sk: Option<KeyDef>,
    pub(crate) collection: Option<String>,
    pub(crate) projection: Projection,
    pub(crate) casing: Casing,
}

impl Index {
    /// Declares the table's primary index.
    pub fn table(access_pattern: impl Into<String>) -> Self {
        Self::with_physical(access_pattern.into(), None)
    }

    /// Declares a secondary index backed by the physical index `name`.
    pub fn secondary(access_pattern: impl Into<String>, name: impl Into<String>) -> Self {
        Self::with_physical(access_pattern.into(), Some(name.into()))
    }

    fn with_physical(access_pattern: String, physical: Option<String>) -> Self {
        Self {
            access_pattern,
            physical,
            pk: None,
            sk: None,
            collection: None,
            projection: Projection::All,
            casing: Casing::None,
        }
    }

    /// Sets the partition key field and its facets.
    #[must_use]
    pub fn pk<S: Into<String>>(
        mut self,
        field: impl Into<String>,
        facets: impl IntoIterator<Item = S>,
    ) -> Self {
        self.pk = Some(KeyDef {
            field: field.into(),
            facets: facets.into_iter().map(Into::into).collect(),
        });
        self
    }

    /// Sets the sort key field and its facets.
    #[must_use]
    pub fn sk<S: Into<String>>(
        mut self,
        field: impl Into<String>,
        facets: impl IntoIterator<Item = S>,
    ) -> Self {
        self.sk = Some(KeyDef {
            field: field.into(),
            facets: facets.into_iter().map(Into::into).collect(),
        });
        self
    }

    /// Groups this index into a cross-entity collection.
    #[must_use]
    pub fn collection(mut self, name: impl Into<String>) -> Self {
        self.collection = Some(name.into());
        self
    }

    /// Sets the projection of a secondary index.
    #[must_use]
    pub fn projection(mut self, projection: Projection) -> Self {
        self.projection = projection;
        self
    }

    /// Sets key casing.
    #[must_use]
    pub fn casing(mut self, casing: Casing) -> Self {
        self.casing = casing;
        self
    }

    /// Access-pattern name.
    #[must_use]
    pub fn access_pattern(&self) -> &str {
        &self.access_pattern
    }
}

/// One compiled key of an index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeySegment {
    pub(crate) field: String,
    pub(crate) facets: Vec<String>,
    pub(crate) labels: Vec<String>,
    pub(crate) prefix: String,
}

impl KeySegment {
    /// Physical field the key is written to.
    #[must_use]
    pub fn field(&self) -> &str {
        &self.field
    }

    /// Facet attribute names, in slot order.
    #[must_use]
    pub fn facets(&self) -> &[String] {
        &self.facets
    }

    /// Constant prefix every encoded key of this segment starts with.
    #[must_use]
    pub fn prefix(&self) -> &str {
        &self.prefix
    }
}

/// Compiled index: resolved key segments plus facet lookup tables.
#[derive(Debug, Clone)]
pub struct IndexDescriptor {
    pub(crate) access_pattern: String,
    pub(crate) physical: Option<String>,
    pub(crate) pk: KeySegment,
    pub(crate) sk: Option<KeySegment>,
    pub(crate) collection: Option<String>,
    pub(crate) projection: Projection,
    pub(crate) casing: Casing,
    pub(crate) by_facet: HashMap<String, Slot>,
}

impl IndexDescriptor {
    /// Access-pattern name.
    #[must_use]
    pub fn access_pattern(&self) -> &str {
        &self.access_pattern
    }

    /// Physical secondary-index name, `None` for the table index.
    #[must_use]
    pub fn physical_name(&self) -> Option<&str> {
        self.physical.as_deref()
    }

    /// True for the table's primary index.
    #[must_use]
    pub fn is_table(&self) -> bool {
        self.physical.is_none()
    }

    /// Partition key segment.
    #[must_use]
    pub fn pk(&self) -> &KeySegment {
        &self.pk
    }

    /// Sort key segment, if the index has one.
    #[must_use]
    pub fn sk(&self) -> Option<&KeySegment> {
        self.sk.as_ref()
    }

    /// Returns the requested segment.
    #[must_use]
    pub fn segment(&self, segment: Segment) -> Option<&KeySegment> {
        match segment {
            Segment::Partition => Some(&self.pk),
            Segment::Sort => self.sk.as_ref(),
        }
    }

    /// Collection this index belongs to.
    #[must_use]
    pub fn collection(&self) -> Option<&str> {
        self.collection.as_deref()
    }

    /// Projection of the index.
    #[must_use]
    pub fn projection(&self) -> &Projection {
        &self.projection
    }

    /// Key casing.
    #[must_use]
    pub fn casing(&self) -> Casing {
        self.casing
    }

    /// Slot of `facet`, if it is part of this index.
    #[must_use]
    pub fn slot_of(&self, facet: &str) -> Option<Slot> {
        self.by_facet.get(facet).copied()
    }

    /// Facet occupying `slot`.
    #[must_use]
    pub fn facet_at(&self, slot: Slot) -> Option<&str> {
        self.segment(slot.segment)?.facets.get(slot.position).map(String::as_str)
    }

    /// Every facet of the index, partition facets first.
    pub fn facets(&self) -> impl Iterator<Item = &str> {
        self.pk
            .facets
            .iter()
            .chain(self.sk.iter().flat_map(|sk| sk.facets.iter()))
            .map(String::as_str)
    }

    /// Physical key fields written for this index.
    pub fn key_fields(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.pk.field.as_str()).chain(self.sk.as_ref().map(|sk| sk.field.as_str()))
    }
}
