//! Index resolution.
//!
//! Given an access pattern (or none, for `find`) and the facts the caller
//! supplied, decide which physical keys to address. The partition key must
//! be fully known; the sort key is the longest contiguous run of supplied
//! sort facets starting at slot 0. Anything supplied beyond that run is
//! returned as a residual for the caller to apply as equality filters.
//!
//! Resolution is a pure function of the schema and its inputs.

use tessera_types::Item;
use tracing::trace;

use crate::{
    error::{Error, Result},
    keys::{KeyCodec, KeyMode},
    schema::{CompiledSchema, IndexDescriptor, Segment},
};

/// What the caller intends to do with the resolved keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Intent {
    /// A single-item operation: every sort facet is required.
    Point,
    /// A range query: a sort-key prefix is enough.
    Range,
}

/// The keys chosen for an operation.
#[derive(Debug, Clone)]
pub struct Resolution<'a> {
    /// Chosen index.
    pub index: &'a IndexDescriptor,
    /// Encoded partition key.
    pub pk: String,
    /// Encoded sort key, possibly partial. `None` when the index has no sort key.
    pub sk: Option<String>,
    /// Sort facets encoded into `sk`, in slot order.
    pub sort_supplied: Vec<String>,
    /// Sort facets not yet supplied, in slot order.
    pub sort_remaining: Vec<String>,
    /// Supplied attributes the keys could not use.
    pub residual: Item,
}

impl Resolution<'_> {
    /// Returns true if every sort facet was supplied.
    #[must_use]
    pub fn sk_complete(&self) -> bool {
        self.sort_remaining.is_empty()
    }
}

/// Resolves supplied facts to index keys for one entity.
#[derive(Debug, Clone, Copy)]
pub struct IndexResolver<'a> {
    schema: &'a CompiledSchema,
    codec: KeyCodec<'a>,
}

impl<'a> IndexResolver<'a> {
    /// Creates a resolver over `schema`.
    #[must_use]
    pub fn new(schema: &'a CompiledSchema) -> Self {
        Self { schema, codec: KeyCodec::new(schema) }
    }

    /// Resolves keys on the named access pattern.
    ///
    /// # Errors
    ///
    /// - [`Error::Validation`] if `facts` names an undeclared attribute.
    /// - [`Error::IndexResolution`] if the access pattern is unknown, a
    ///   partition facet is missing, or (for [`Intent::Point`]) a sort facet
    ///   is missing.
    pub fn resolve(&self, access_pattern: &str, facts: &Item, intent: Intent) -> Result<Resolution<'a>> {
        self.check_known(facts)?;
        let index = self.schema.index(access_pattern).ok_or_else(|| Error::IndexResolution {
            index: access_pattern.to_owned(),
            missing: Vec::new(),
        })?;

        let missing_pk = missing_partition_facets(index, facts);
        if !missing_pk.is_empty() {
            return Err(Error::IndexResolution { index: index.access_pattern.clone(), missing: missing_pk });
        }
        let resolution = self.build(index, facts)?;
        if intent == Intent::Point && !resolution.sk_complete() {
            return Err(Error::IndexResolution {
                index: index.access_pattern.clone(),
                missing: resolution.sort_remaining,
            });
        }
        Ok(resolution)
    }

    /// Picks the index that best matches `facts`.
    ///
    /// Candidates are indexes whose partition facets are all supplied. The
    /// winner is the one that encodes the most sort facets, preferring a
    /// complete sort key on ties; remaining ties go to the index declared
    /// first.
    ///
    /// # Errors
    ///
    /// - [`Error::Validation`] if `facts` names an undeclared attribute.
    /// - [`Error::IndexResolution`] naming the index closest to being
    ///   satisfied if no index's partition key is covered.
    pub fn find(&self, facts: &Item, intent: Intent) -> Result<Resolution<'a>> {
        self.check_known(facts)?;

        let mut best: Option<(usize, bool, &IndexDescriptor)> = None;
        let mut closest: Option<(usize, &IndexDescriptor, Vec<String>)> = None;
        for index in self.schema.indexes() {
            let missing = missing_partition_facets(index, facts);
            if !missing.is_empty() {
                if closest.as_ref().is_none_or(|(n, _, _)| missing.len() < *n) {
                    closest = Some((missing.len(), index, missing));
                }
                continue;
            }
            let sort = index.sk().map_or(&[][..], |sk| sk.facets());
            let supplied = contiguous_supplied(sort, facts);
            let complete = supplied == sort.len();
            if intent == Intent::Point && !complete {
                continue;
            }
            let better = match best {
                None => true,
                Some((s, c, _)) => (supplied, complete) > (s, c),
            };
            if better {
                best = Some((supplied, complete, index));
            }
        }

        match best {
            Some((_, _, index)) => {
                trace!(access_pattern = %index.access_pattern, "Resolved index for find");
                self.build(index, facts)
            },
            None => {
                let (index, missing) = match closest {
                    Some((_, index, missing)) => (index.access_pattern.clone(), missing),
                    None => {
                        let table = self.schema.table_index();
                        let sort = table.sk().map_or(&[][..], |sk| sk.facets());
                        let missing = sort
                            .iter()
                            .filter(|f| !facts.contains_key(f.as_str()))
                            .cloned()
                            .collect();
                        (table.access_pattern.clone(), missing)
                    },
                };
                Err(Error::IndexResolution { index, missing })
            },
        }
    }

    fn build(&self, index: &'a IndexDescriptor, facts: &Item) -> Result<Resolution<'a>> {
        let pk = self.codec.encode_segment(index, Segment::Partition, facts, KeyMode::Full)?;

        let sort = index.sk().map_or(&[][..], |sk| sk.facets());
        let supplied = contiguous_supplied(sort, facts);
        let sk = match index.sk() {
            Some(_) => {
                Some(self.codec.encode_segment(index, Segment::Sort, facts, KeyMode::Partial)?)
            },
            None => None,
        };

        let used: Vec<&str> = index.pk().facets().iter().chain(&sort[..supplied]).map(String::as_str).collect();
        let residual = facts
            .iter()
            .filter(|(name, value)| !used.contains(&name.as_str()) && !value.is_null())
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect();

        Ok(Resolution {
            index,
            pk,
            sk,
            sort_supplied: sort[..supplied].to_vec(),
            sort_remaining: sort[supplied..].to_vec(),
            residual,
        })
    }

    fn check_known(&self, facts: &Item) -> Result<()> {
        match facts.keys().find(|name| self.schema.attribute(name).is_none()) {
            Some(name) => Err(Error::validation(name.clone(), "not a declared attribute")),
            None => Ok(()),
        }
    }
}

fn missing_partition_facets(index: &IndexDescriptor, facts: &Item) -> Vec<String> {
    index
        .pk()
        .facets()
        .iter()
        .filter(|f| facts.get(f.as_str()).is_none_or(|v| v.is_null()))
        .cloned()
        .collect()
}

fn contiguous_supplied(sort: &[String], facts: &Item) -> usize {
    sort.iter().take_while(|f| facts.get(f.as_str()).is_some_and(|v| !v.is_null())).count()
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic, clippy::disallowed_methods)]
mod tests {
    use tessera_types::{AttributeValue, item};

    use super::*;
    use crate::schema::{Attribute, Index, Model, Schema};

    fn schema() -> CompiledSchema {
        Schema::new(Model::new("billing", "invoice", "1"))
            .attribute(Attribute::string("accountId"))
            .attribute(Attribute::string("invoiceId"))
            .attribute(Attribute::string("status"))
            .attribute(Attribute::string("createdAt"))
            .attribute(Attribute::number("amount"))
            .index(Index::table("invoices").pk("pk", ["accountId"]).sk("sk", ["invoiceId"]))
            .index(
                Index::secondary("byStatus", "gsi1")
                    .pk("gsi1pk", ["accountId"])
                    .sk("gsi1sk", ["status", "createdAt"]),
            )
            .index(
                Index::secondary("byCreated", "gsi2")
                    .pk("gsi2pk", ["accountId"])
                    .sk("gsi2sk", ["createdAt"]),
            )
            .compile()
            .unwrap()
    }

    #[test]
    fn test_missing_partition_facet_is_named() {
        let schema = schema();
        let resolver = IndexResolver::new(&schema);
        let err = resolver.resolve("byStatus", &item! { "status" => "open" }, Intent::Range).unwrap_err();
        match err {
            Error::IndexResolution { index, missing } => {
                assert_eq!(index, "byStatus");
                assert_eq!(missing, vec!["accountId"]);
            },
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_gap_in_sort_facets_becomes_residual() {
        let schema = schema();
        let resolver = IndexResolver::new(&schema);
        let facts = item! { "accountId" => "A1", "createdAt" => "2024", "amount" => 5 };
        let resolution = resolver.resolve("byStatus", &facts, Intent::Range).unwrap();
        assert_eq!(resolution.pk, "$billing#accountId_A1");
        assert_eq!(resolution.sk.as_deref(), Some("$invoice_1"));
        assert!(resolution.sort_supplied.is_empty());
        assert_eq!(resolution.sort_remaining, vec!["status", "createdAt"]);
        assert_eq!(
            resolution.residual,
            item! { "createdAt" => "2024", "amount" => 5 }
        );
    }

    #[test]
    fn test_point_intent_requires_full_sort_key() {
        let schema = schema();
        let resolver = IndexResolver::new(&schema);
        let err = resolver
            .resolve("invoices", &item! { "accountId" => "A1" }, Intent::Point)
            .unwrap_err();
        assert!(matches!(err, Error::IndexResolution { ref missing, .. } if missing == &["invoiceId"]));
    }

    #[test]
    fn test_unknown_attribute_is_rejected() {
        let schema = schema();
        let resolver = IndexResolver::new(&schema);
        let err = resolver
            .resolve("invoices", &item! { "accountId" => "A1", "ghost" => 1 }, Intent::Range)
            .unwrap_err();
        assert!(matches!(err, Error::Validation { ref attribute, .. } if attribute == "ghost"));
    }

    #[test]
    fn test_find_prefers_most_sort_facets() {
        let schema = schema();
        let resolver = IndexResolver::new(&schema);
        let facts = item! { "accountId" => "A1", "status" => "open", "createdAt" => "2024" };
        let resolution = resolver.find(&facts, Intent::Range).unwrap();
        assert_eq!(resolution.index.access_pattern(), "byStatus");
        assert!(resolution.sk_complete());
        assert!(resolution.residual.is_empty());
    }

    #[test]
    fn test_find_breaks_ties_by_declaration_order() {
        let schema = schema();
        let resolver = IndexResolver::new(&schema);
        // Only the partition key is known: all three indexes score zero.
        let resolution = resolver.find(&item! { "accountId" => "A1", "amount" => 3 }, Intent::Range).unwrap();
        assert_eq!(resolution.index.access_pattern(), "invoices");
        assert_eq!(resolution.residual, item! { "amount" => 3 });
    }

    #[test]
    fn test_find_prefers_complete_sort_key_on_equal_depth() {
        let schema = schema();
        let resolver = IndexResolver::new(&schema);
        let facts = item! { "accountId" => "A1", "createdAt" => "2024" };
        let resolution = resolver.find(&facts, Intent::Range).unwrap();
        assert_eq!(resolution.index.access_pattern(), "byCreated");
        assert_eq!(resolution.sk.as_deref(), Some("$invoice_1#createdAt_2024"));
    }

    #[test]
    fn test_find_without_partition_key_names_closest_index() {
        let schema = schema();
        let resolver = IndexResolver::new(&schema);
        let err = resolver.find(&item! { "status" => "open" }, Intent::Range).unwrap_err();
        assert!(matches!(err, Error::IndexResolution { ref index, .. } if index == "invoices"));
    }

    #[test]
    fn test_resolution_is_deterministic() {
        let schema = schema();
        let resolver = IndexResolver::new(&schema);
        let facts = item! { "accountId" => "A1", "status" => AttributeValue::from("paid") };
        let a = resolver.find(&facts, Intent::Range).unwrap();
        let b = resolver.find(&facts, Intent::Range).unwrap();
        assert_eq!((a.index.access_pattern(), a.pk, a.sk), (b.index.access_pattern(), b.pk, b.sk));
    }
}
