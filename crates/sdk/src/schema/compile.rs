//! Schema normalization.
//!
//! Turns a raw [`Schema`] into a [`CompiledSchema`]: validated names,
//! per-index facet lookup tables, constant key prefixes, and the order in
//! which the write path evaluates attributes.

use std::collections::{BTreeSet, HashMap, HashSet};

use tessera_types::validation::validate_identifier;
use tracing::debug;

use super::{
    Attribute, Index, Model, Schema,
    index::{IndexDescriptor, KeySegment, Segment, Slot},
};
use crate::error::{Error, Result, SchemaErrorKind};

/// Field holding the entity name on every stored row.
pub const ENTITY_FIELD: &str = "__te_entity";

/// Field holding the entity version on every stored row.
pub const VERSION_FIELD: &str = "__te_version";

/// Validated, immutable schema shared by every component of an entity.
#[derive(Debug, Clone)]
pub struct CompiledSchema {
    model: Model,
    attributes: Vec<Attribute>,
    by_name: HashMap<String, usize>,
    by_field: HashMap<String, usize>,
    write_order: Vec<usize>,
    watchers: HashMap<usize, Vec<usize>>,
    indexes: Vec<IndexDescriptor>,
    by_access_pattern: HashMap<String, usize>,
    table_index: usize,
    key_fields: HashSet<String>,
}

impl CompiledSchema {
    pub(crate) fn compile(schema: Schema) -> Result<Self> {
        let Schema { model, attributes, indexes } = schema;

        check_identifier("service", &model.service)?;
        check_identifier("entity", &model.entity)?;
        check_identifier("version", &model.version)?;
        for (kind, name) in [("entity", &model.entity), ("version", &model.version)] {
            if name.contains(TAG_SEPARATOR) {
                return Err(Error::schema(
                    SchemaErrorKind::InvalidIdentifier,
                    format!("{kind} {name:?} contains '{TAG_SEPARATOR}', which separates entity and version in keys"),
                ));
            }
        }

        let mut by_name = HashMap::with_capacity(attributes.len());
        let mut by_field = HashMap::with_capacity(attributes.len());
        for (position, attribute) in attributes.iter().enumerate() {
            check_identifier("attribute", &attribute.name)?;
            check_identifier("field", attribute.field_name())?;
            check_identifier("label", attribute.key_label())?;
            if by_name.insert(attribute.name.clone(), position).is_some() {
                return Err(Error::schema(
                    SchemaErrorKind::DuplicateAttribute,
                    format!("attribute '{}' is declared twice", attribute.name),
                ));
            }
            if let Some(other) = by_field.insert(attribute.field_name().to_owned(), position) {
                return Err(Error::schema(
                    SchemaErrorKind::DuplicateField,
                    format!(
                        "attributes '{}' and '{}' both map to field '{}'",
                        attributes[other].name,
                        attribute.name,
                        attribute.field_name()
                    ),
                ));
            }
            if let super::AttributeType::Enum(values) = &attribute.kind
                && values.is_empty()
            {
                return Err(Error::schema(
                    SchemaErrorKind::InvalidEnum,
                    format!("enum attribute '{}' declares no values", attribute.name),
                ));
            }
        }

        let (watchers, write_order) = order_watches(&attributes, &by_name)?;

        let table_count = indexes.iter().filter(|i| i.physical.is_none()).count();
        if table_count != 1 {
            return Err(Error::schema(
                SchemaErrorKind::TableIndexCount,
                format!("exactly one table index is required, found {table_count}"),
            ));
        }

        let mut compiled = Vec::with_capacity(indexes.len());
        let mut by_access_pattern = HashMap::with_capacity(indexes.len());
        let mut physical_names = HashSet::new();
        let mut key_fields = HashSet::new();
        let mut collections = HashSet::new();
        for (position, index) in indexes.into_iter().enumerate() {
            check_identifier("index", &index.access_pattern)?;
            if by_access_pattern.insert(index.access_pattern.clone(), position).is_some() {
                return Err(Error::schema(
                    SchemaErrorKind::DuplicateIndex,
                    format!("access pattern '{}' is declared twice", index.access_pattern),
                ));
            }
            if let Some(physical) = &index.physical {
                check_identifier("index", physical)?;
                if !physical_names.insert(physical.clone()) {
                    return Err(Error::schema(
                        SchemaErrorKind::DuplicateIndex,
                        format!("physical index '{physical}' is used by two access patterns"),
                    ));
                }
            }
            if let Some(collection) = &index.collection {
                check_identifier("collection", collection)?;
                if !collections.insert(collection.clone()) {
                    return Err(Error::schema(
                        SchemaErrorKind::CollectionMismatch,
                        format!(
                            "entity '{}' joins collection '{collection}' through two indexes",
                            model.entity
                        ),
                    ));
                }
            }
            let descriptor = compile_index(&model, &attributes, &by_name, index)?;
            for field in descriptor.key_fields() {
                check_identifier("key field", field)?;
                if !key_fields.insert(field.to_owned()) {
                    return Err(Error::schema(
                        SchemaErrorKind::DuplicateKeyField,
                        format!("key field '{field}' is written by two indexes"),
                    ));
                }
                if let Some(&attr) = by_field.get(field) {
                    return Err(Error::schema(
                        SchemaErrorKind::DuplicateField,
                        format!(
                            "attribute '{}' maps onto key field '{field}'",
                            attributes[attr].name
                        ),
                    ));
                }
            }
            compiled.push(descriptor);
        }

        let table_index = compiled.iter().position(IndexDescriptor::is_table).unwrap_or_default();

        debug!(
            service = %model.service,
            entity = %model.entity,
            version = %model.version,
            attributes = attributes.len(),
            indexes = compiled.len(),
            "Compiled schema"
        );

        Ok(Self {
            model,
            attributes,
            by_name,
            by_field,
            write_order,
            watchers,
            indexes: compiled,
            by_access_pattern,
            table_index,
            key_fields,
        })
    }

    /// Model identity.
    #[must_use]
    pub fn model(&self) -> &Model {
        &self.model
    }

    /// Attributes in declaration order.
    #[must_use]
    pub fn attributes(&self) -> &[Attribute] {
        &self.attributes
    }

    /// Looks up an attribute by name.
    #[must_use]
    pub fn attribute(&self, name: &str) -> Option<&Attribute> {
        self.by_name.get(name).map(|&i| &self.attributes[i])
    }

    /// Looks up an attribute by its physical field.
    #[must_use]
    pub fn attribute_by_field(&self, field: &str) -> Option<&Attribute> {
        self.by_field.get(field).map(|&i| &self.attributes[i])
    }

    pub(crate) fn position(&self, name: &str) -> Option<usize> {
        self.by_name.get(name).copied()
    }

    /// Attribute positions in write-path evaluation order: every watched
    /// attribute precedes its watchers, ties broken by declaration order.
    #[must_use]
    pub fn write_order(&self) -> &[usize] {
        &self.write_order
    }

    /// Positions of the attributes watching the attribute at `position`.
    #[must_use]
    pub fn watchers_of(&self, position: usize) -> &[usize] {
        self.watchers.get(&position).map_or(&[], Vec::as_slice)
    }

    /// Indexes in declaration order.
    #[must_use]
    pub fn indexes(&self) -> &[IndexDescriptor] {
        &self.indexes
    }

    /// Looks up an index by access-pattern name.
    #[must_use]
    pub fn index(&self, access_pattern: &str) -> Option<&IndexDescriptor> {
        self.by_access_pattern.get(access_pattern).map(|&i| &self.indexes[i])
    }

    /// The table's primary index.
    #[must_use]
    pub fn table_index(&self) -> &IndexDescriptor {
        &self.indexes[self.table_index]
    }

    /// Returns true if `field` is a physical key field of any index.
    #[must_use]
    pub fn is_key_field(&self, field: &str) -> bool {
        self.key_fields.contains(field)
    }

    /// Returns true if `row` carries this entity's record-type tags.
    #[must_use]
    pub fn owns(&self, row: &tessera_types::Item) -> bool {
        row.get(ENTITY_FIELD).and_then(|v| v.as_str()) == Some(self.model.entity.as_str())
            && row.get(VERSION_FIELD).and_then(|v| v.as_str())
                == Some(self.model.version.as_str())
    }
}

/// Joins entity and version in key prefixes.
const TAG_SEPARATOR: char = '_';

fn check_identifier(kind: &str, name: &str) -> Result<()> {
    validate_identifier(kind, name)
        .map_err(|e| Error::schema(SchemaErrorKind::InvalidIdentifier, e.to_string()))
}

fn compile_index(
    model: &Model,
    attributes: &[Attribute],
    by_name: &HashMap<String, usize>,
    index: Index,
) -> Result<IndexDescriptor> {
    let Index { access_pattern, physical, pk, sk, collection, projection, casing } = index;

    let Some(pk) = pk else {
        return Err(Error::schema(
            SchemaErrorKind::MissingPartitionKey,
            format!("index '{access_pattern}' declares no partition key"),
        ));
    };
    if collection.is_some() && sk.is_none() {
        return Err(Error::schema(
            SchemaErrorKind::CollectionWithoutSortKey,
            format!("index '{access_pattern}' joins a collection but has no sort key"),
        ));
    }

    let mut by_facet = HashMap::new();
    let mut compile_segment = |segment: Segment, field: String, facets: Vec<String>| {
        let mut labels = Vec::with_capacity(facets.len());
        for (position, facet) in facets.iter().enumerate() {
            let Some(&attr) = by_name.get(facet) else {
                return Err(Error::schema(
                    SchemaErrorKind::MissingFacet,
                    format!("index '{access_pattern}' uses undeclared attribute '{facet}'"),
                ));
            };
            let attribute = &attributes[attr];
            if !attribute.kind.is_scalar() {
                return Err(Error::schema(
                    SchemaErrorKind::NonScalarFacet,
                    format!(
                        "index '{access_pattern}' uses '{facet}' of type {} as a facet",
                        attribute.kind
                    ),
                ));
            }
            if by_facet.insert(facet.clone(), Slot { segment, position }).is_some() {
                return Err(Error::schema(
                    SchemaErrorKind::DuplicateFacet,
                    format!("index '{access_pattern}' uses '{facet}' twice"),
                ));
            }
            labels.push(attribute.key_label().to_owned());
        }
        Ok((field, facets, labels))
    };

    let (pk_field, pk_facets, pk_labels) = compile_segment(Segment::Partition, pk.field, pk.facets)?;
    let sk = sk
        .map(|sk| compile_segment(Segment::Sort, sk.field, sk.facets))
        .transpose()?;

    let entity_tag = format!("{}{TAG_SEPARATOR}{}", model.entity, model.version);
    let pk_prefix = if sk.is_some() {
        format!("${}", model.service)
    } else {
        format!("${}${entity_tag}", model.service)
    };
    let sk = sk.map(|(field, facets, labels)| {
        let prefix = match &collection {
            Some(collection) => format!("${collection}#{entity_tag}"),
            None => format!("${entity_tag}"),
        };
        KeySegment { field, facets, labels, prefix }
    });

    Ok(IndexDescriptor {
        access_pattern,
        physical,
        pk: KeySegment { field: pk_field, facets: pk_facets, labels: pk_labels, prefix: pk_prefix },
        sk,
        collection,
        projection,
        casing,
        by_facet,
    })
}

/// Validates watch declarations and computes the write order.
///
/// Returns the watched-to-watchers map and a topological order of attribute
/// positions in which every watched attribute precedes its watchers.
fn order_watches(
    attributes: &[Attribute],
    by_name: &HashMap<String, usize>,
) -> Result<(HashMap<usize, Vec<usize>>, Vec<usize>)> {
    let mut watchers: HashMap<usize, Vec<usize>> = HashMap::new();
    let mut in_degree = vec![0usize; attributes.len()];

    for (position, attribute) in attributes.iter().enumerate() {
        if attribute.watch.is_empty() {
            continue;
        }
        if attribute.set.is_none() {
            return Err(Error::schema(
                SchemaErrorKind::InvalidWatch,
                format!("attribute '{}' watches others but has no set transform", attribute.name),
            ));
        }
        let mut seen = BTreeSet::new();
        for watched in &attribute.watch {
            let Some(&target) = by_name.get(watched) else {
                return Err(Error::schema(
                    SchemaErrorKind::InvalidWatch,
                    format!("attribute '{}' watches undeclared '{watched}'", attribute.name),
                ));
            };
            if target == position {
                return Err(Error::schema(
                    SchemaErrorKind::InvalidWatch,
                    format!("attribute '{}' watches itself", attribute.name),
                ));
            }
            if seen.insert(target) {
                watchers.entry(target).or_default().push(position);
                in_degree[position] += 1;
            }
        }
    }

    // Kahn's algorithm; the ready set is ordered so ties resolve by declaration order.
    let mut ready: BTreeSet<usize> =
        in_degree.iter().enumerate().filter(|(_, d)| **d == 0).map(|(i, _)| i).collect();
    let mut order = Vec::with_capacity(attributes.len());
    while let Some(next) = ready.pop_first() {
        order.push(next);
        for &watcher in watchers.get(&next).map_or(&[][..], Vec::as_slice) {
            in_degree[watcher] -= 1;
            if in_degree[watcher] == 0 {
                ready.insert(watcher);
            }
        }
    }

    if order.len() != attributes.len() {
        let cycle: Vec<&str> = in_degree
            .iter()
            .enumerate()
            .filter(|(_, d)| **d > 0)
            .map(|(i, _)| attributes[i].name.as_str())
            .collect();
        return Err(Error::schema(
            SchemaErrorKind::WatchCycle,
            format!("watch declarations form a cycle through [{}]", cycle.join(", ")),
        ));
    }

    Ok((watchers, order))
}
