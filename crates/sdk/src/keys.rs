//! Composite key encoding.
//!
//! Physical keys are delimited strings:
//!
//! ```text
//! pk: $<service>#<label>_<value>#<label>_<value>
//! sk: $<entity>_<version>#<label>_<value>...
//!     $<collection>#<entity>_<version>#<label>_<value>...   (collection index)
//! pk: $<service>$<entity>_<version>#<label>_<value>...      (index without sk)
//! ```
//!
//! Encoding the first `k` facets of a segment yields a string prefix of the
//! encoding of all of them, which is what makes `begins_with` range queries
//! work. Values are escaped so they can never contain the delimiter, and
//! numbers are written as fixed-width hex of an order-preserving bit pattern
//! so lexicographic order matches numeric order.

use tessera_types::{AttributeValue, Item};

use crate::{
    error::{Error, Result},
    schema::{AttributeType, CompiledSchema, IndexDescriptor, KeySegment, Segment},
};

/// Separates facets inside a key.
pub const DELIMITER: char = '#';

/// Separates a facet label from its value.
pub const LABEL_SEPARATOR: char = '_';

/// Whether every facet of a segment must be supplied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyMode {
    /// All facets are required; a missing facet is an error.
    Full,
    /// Encode the longest contiguous run of supplied facets from slot 0.
    Partial,
}

/// Encodes and decodes the composite keys of one entity.
#[derive(Debug, Clone, Copy)]
pub struct KeyCodec<'a> {
    schema: &'a CompiledSchema,
}

impl<'a> KeyCodec<'a> {
    /// Creates a codec over `schema`.
    #[must_use]
    pub fn new(schema: &'a CompiledSchema) -> Self {
        Self { schema }
    }

    /// Encodes one key of the named index.
    ///
    /// # Errors
    ///
    /// - [`Error::IndexResolution`] for an unknown index, or a missing facet in
    ///   [`KeyMode::Full`].
    /// - [`Error::Validation`] if a facet value does not match its type.
    pub fn encode(
        &self,
        access_pattern: &str,
        segment: Segment,
        facets: &Item,
        mode: KeyMode,
    ) -> Result<String> {
        let index = self.index(access_pattern)?;
        self.encode_segment(index, segment, facets, mode)
    }

    /// Decodes one key of the named index back into `(facet, value)` pairs,
    /// in slot order. Partial keys decode to the facets they contain.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Decode`] if the key does not start with the
    /// segment's prefix, a label does not match the declared order, or a
    /// value cannot be parsed as its declared type.
    pub fn decode(
        &self,
        access_pattern: &str,
        segment: Segment,
        key: &str,
    ) -> Result<Vec<(String, AttributeValue)>> {
        let index = self.index(access_pattern)?;
        self.decode_segment(index, segment, key)
    }

    pub(crate) fn encode_segment(
        &self,
        index: &IndexDescriptor,
        segment: Segment,
        facets: &Item,
        mode: KeyMode,
    ) -> Result<String> {
        let key = segment_of(index, segment)?;
        let mut encoded = key.prefix.clone();
        let mut missing = Vec::new();
        for (facet, label) in key.facets.iter().zip(&key.labels) {
            let Some(value) = facets.get(facet).filter(|v| !v.is_null()) else {
                match mode {
                    KeyMode::Partial => break,
                    KeyMode::Full => {
                        missing.push(facet.clone());
                        continue;
                    },
                }
            };
            if !missing.is_empty() {
                continue;
            }
            encoded.push(DELIMITER);
            encoded.push_str(label);
            encoded.push(LABEL_SEPARATOR);
            encoded.push_str(&self.encode_facet(facet, value)?);
        }
        if !missing.is_empty() {
            return Err(Error::IndexResolution {
                index: index.access_pattern.clone(),
                missing,
            });
        }
        Ok(index.casing.apply(&encoded))
    }

    pub(crate) fn decode_segment(
        &self,
        index: &IndexDescriptor,
        segment: Segment,
        raw: &str,
    ) -> Result<Vec<(String, AttributeValue)>> {
        let key = segment_of(index, segment)?;
        let what = || format!("{} key {raw:?}", key.field);
        let prefix = index.casing.apply(&key.prefix);
        let Some(rest) = raw.strip_prefix(prefix.as_str()) else {
            return Err(Error::decode(what(), format!("expected prefix {prefix:?}")));
        };
        if rest.is_empty() {
            return Ok(Vec::new());
        }
        let Some(rest) = rest.strip_prefix(DELIMITER) else {
            return Err(Error::decode(what(), format!("unexpected text after prefix {prefix:?}")));
        };

        let tokens: Vec<&str> = rest.split(DELIMITER).collect();
        if tokens.len() > key.facets.len() {
            return Err(Error::decode(
                what(),
                format!("{} facets found, {} declared", tokens.len(), key.facets.len()),
            ));
        }

        let mut decoded = Vec::with_capacity(tokens.len());
        for ((token, facet), label) in tokens.into_iter().zip(&key.facets).zip(&key.labels) {
            let label = index.casing.apply(label);
            let Some(value) = token
                .strip_prefix(label.as_str())
                .and_then(|v| v.strip_prefix(LABEL_SEPARATOR))
            else {
                return Err(Error::decode(what(), format!("expected label {label:?} for '{facet}'")));
            };
            let kind = self.facet_kind(facet)?;
            let value = decode_value(value, kind).ok_or_else(|| {
                Error::decode(what(), format!("facet '{facet}' is not a valid {kind}"))
            })?;
            decoded.push((facet.clone(), value));
        }
        Ok(decoded)
    }

    /// Full table-index key fields for an item given by attribute name.
    pub(crate) fn primary_key(&self, facets: &Item) -> Result<Item> {
        self.index_keys(self.schema.table_index(), facets)
    }

    /// Full key fields of one index.
    pub(crate) fn index_keys(&self, index: &IndexDescriptor, facets: &Item) -> Result<Item> {
        let mut keys = Item::new();
        let pk = self.encode_segment(index, Segment::Partition, facets, KeyMode::Full)?;
        keys.insert(index.pk.field.clone(), AttributeValue::String(pk));
        if let Some(sk) = &index.sk {
            let value = self.encode_segment(index, Segment::Sort, facets, KeyMode::Full)?;
            keys.insert(sk.field.clone(), AttributeValue::String(value));
        }
        Ok(keys)
    }

    /// Every key field of a complete item.
    ///
    /// The table index must be fully supplied. Secondary indexes are written
    /// only when all of their facets are present, so an item missing an
    /// optional facet is simply absent from that index.
    pub(crate) fn record_keys(&self, facets: &Item) -> Result<Item> {
        let mut keys = self.primary_key(facets)?;
        for index in self.schema.indexes().iter().filter(|i| !i.is_table()) {
            let complete = index.facets().all(|f| facets.get(f).is_some_and(|v| !v.is_null()));
            if complete {
                keys.extend(self.index_keys(index, facets)?);
            }
        }
        Ok(keys)
    }

    /// Decodes the facets held in a physical row's keys for `index` and the
    /// table index.
    pub(crate) fn facets_from_row(&self, index: &IndexDescriptor, row: &Item) -> Result<Item> {
        let mut facets = Item::new();
        let table = self.schema.table_index();
        let indexes = if index.is_table() { vec![index] } else { vec![table, index] };
        for index in indexes {
            for segment in [Segment::Partition, Segment::Sort] {
                let Some(key) = index.segment(segment) else {
                    continue;
                };
                let raw = row.get(&key.field).and_then(AttributeValue::as_str).ok_or_else(|| {
                    Error::decode(key.field.clone(), "key field is missing or not a string")
                })?;
                facets.extend(self.decode_segment(index, segment, raw)?);
            }
        }
        Ok(facets)
    }

    fn encode_facet(&self, facet: &str, value: &AttributeValue) -> Result<String> {
        let kind = self.facet_kind(facet)?;
        let value = kind.coerce(value).map_err(|message| Error::validation(facet, message))?;
        encode_value(&value).ok_or_else(|| {
            Error::validation(facet, format!("{} cannot be encoded into a key", value.type_name()))
        })
    }

    fn facet_kind(&self, facet: &str) -> Result<&'a AttributeType> {
        self.schema
            .attribute(facet)
            .map(|a| &a.kind)
            .ok_or_else(|| Error::validation(facet, "not a declared attribute"))
    }

    fn index(&self, access_pattern: &str) -> Result<&'a IndexDescriptor> {
        self.schema.index(access_pattern).ok_or_else(|| Error::IndexResolution {
            index: access_pattern.to_owned(),
            missing: Vec::new(),
        })
    }
}

fn segment_of(index: &IndexDescriptor, segment: Segment) -> Result<&KeySegment> {
    index.segment(segment).ok_or_else(|| Error::IndexResolution {
        index: index.access_pattern.clone(),
        missing: Vec::new(),
    })
}

/// Encodes a scalar value for use inside a key.
///
/// Returns `None` for non-scalars and NaN.
#[must_use]
pub fn encode_value(value: &AttributeValue) -> Option<String> {
    match value {
        AttributeValue::String(s) => Some(escape(s)),
        AttributeValue::Number(n) if n.is_nan() => None,
        AttributeValue::Number(n) => Some(encode_number(*n)),
        AttributeValue::Bool(b) => Some(b.to_string()),
        AttributeValue::Binary(bytes) => Some(hex(bytes)),
        _ => None,
    }
}

/// Decodes a key value as `kind`. Accepts either hex case so cased keys decode.
#[must_use]
pub fn decode_value(raw: &str, kind: &AttributeType) -> Option<AttributeValue> {
    match kind {
        AttributeType::String | AttributeType::Enum(_) => unescape(raw).map(AttributeValue::String),
        AttributeType::Number => decode_number(raw).map(AttributeValue::Number),
        AttributeType::Boolean => {
            if raw.eq_ignore_ascii_case("true") {
                Some(AttributeValue::Bool(true))
            } else if raw.eq_ignore_ascii_case("false") {
                Some(AttributeValue::Bool(false))
            } else {
                None
            }
        },
        AttributeType::Binary => unhex(raw).map(AttributeValue::Binary),
        _ => None,
    }
}

fn escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '%' => out.push_str("%25"),
            DELIMITER => out.push_str("%23"),
            c => out.push(c),
        }
    }
    out
}

fn unescape(s: &str) -> Option<String> {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars();
    while let Some(c) = chars.next() {
        if c == '%' {
            let code: String = chars.by_ref().take(2).collect();
            match code.as_str() {
                "25" => out.push('%'),
                "23" => out.push(DELIMITER),
                _ => return None,
            }
        } else {
            out.push(c);
        }
    }
    Some(out)
}

/// Maps a double onto a `u64` whose unsigned order matches numeric order.
fn encode_number(n: f64) -> String {
    // -0.0 and 0.0 must share a key.
    let n = if n == 0.0 { 0.0 } else { n };
    let bits = n.to_bits();
    let ordered = if bits >> 63 == 1 { !bits } else { bits | (1 << 63) };
    format!("{ordered:016X}")
}

fn decode_number(raw: &str) -> Option<f64> {
    if raw.len() != 16 || !raw.chars().all(|c| c.is_ascii_hexdigit()) {
        return None;
    }
    let ordered = u64::from_str_radix(raw, 16).ok()?;
    let bits = if ordered >> 63 == 1 { ordered & !(1 << 63) } else { !ordered };
    Some(f64::from_bits(bits))
}

fn hex(bytes: &[u8]) -> String {
    use std::fmt::Write;
    bytes.iter().fold(String::with_capacity(bytes.len() * 2), |mut out, b| {
        let _ = write!(out, "{b:02x}");
        out
    })
}

fn unhex(raw: &str) -> Option<Vec<u8>> {
    if raw.len() % 2 != 0 || !raw.is_ascii() {
        return None;
    }
    (0..raw.len()).step_by(2).map(|i| u8::from_str_radix(&raw[i..i + 2], 16).ok()).collect()
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic, clippy::disallowed_methods)]
mod tests {
    use tessera_types::item;

    use super::*;
    use crate::schema::{Attribute, Casing, Index, Model, Schema};

    fn schema(casing: Casing) -> CompiledSchema {
        Schema::new(Model::new("billing", "invoice", "1"))
            .attribute(Attribute::string("accountId"))
            .attribute(Attribute::string("invoiceId").label("inv"))
            .attribute(Attribute::number("amount"))
            .attribute(Attribute::boolean("paid"))
            .attribute(Attribute::binary("digest"))
            .attribute(Attribute::enumeration("status", ["open", "paid"]))
            .index(
                Index::table("invoices")
                    .pk("pk", ["accountId"])
                    .sk("sk", ["invoiceId"])
                    .casing(casing),
            )
            .index(
                Index::secondary("byAmount", "gsi1")
                    .pk("gsi1pk", ["accountId"])
                    .sk("gsi1sk", ["status", "amount", "paid", "digest"])
                    .collection("ledger"),
            )
            .compile()
            .unwrap()
    }

    #[test]
    fn test_encode_full_key() {
        let schema = schema(Casing::None);
        let codec = KeyCodec::new(&schema);
        let facets = item! { "accountId" => "A1", "invoiceId" => "I-7" };
        assert_eq!(
            codec.encode("invoices", Segment::Partition, &facets, KeyMode::Full).unwrap(),
            "$billing#accountId_A1"
        );
        assert_eq!(
            codec.encode("invoices", Segment::Sort, &facets, KeyMode::Full).unwrap(),
            "$invoice_1#inv_I-7"
        );
    }

    #[test]
    fn test_partial_key_is_prefix_of_full_key() {
        let schema = schema(Casing::None);
        let codec = KeyCodec::new(&schema);
        let full = item! {
            "accountId" => "A1",
            "status" => "open",
            "amount" => 12.5,
            "paid" => false,
            "digest" => vec![0xABu8, 0x01],
        };
        let full_key = codec.encode("byAmount", Segment::Sort, &full, KeyMode::Full).unwrap();
        assert_eq!(
            full_key,
            format!("$ledger#invoice_1#status_open#amount_{}#paid_false#digest_ab01", encode_number(12.5))
        );

        let partial = item! { "status" => "open", "paid" => false };
        let partial_key =
            codec.encode("byAmount", Segment::Sort, &partial, KeyMode::Partial).unwrap();
        assert_eq!(partial_key, "$ledger#invoice_1#status_open");
        assert!(full_key.starts_with(&partial_key));

        let none = codec.encode("byAmount", Segment::Sort, &Item::new(), KeyMode::Partial).unwrap();
        assert_eq!(none, "$ledger#invoice_1");
    }

    #[test]
    fn test_full_mode_reports_every_missing_facet() {
        let schema = schema(Casing::None);
        let codec = KeyCodec::new(&schema);
        let err = codec
            .encode("byAmount", Segment::Sort, &item! { "amount" => 1 }, KeyMode::Full)
            .unwrap_err();
        match err {
            Error::IndexResolution { index, missing } => {
                assert_eq!(index, "byAmount");
                assert_eq!(missing, vec!["status", "paid", "digest"]);
            },
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_delimiters_are_escaped() {
        let schema = schema(Casing::None);
        let codec = KeyCodec::new(&schema);
        let facets = item! { "invoiceId" => "a#b%c" };
        let key = codec.encode("invoices", Segment::Sort, &facets, KeyMode::Full).unwrap();
        assert_eq!(key, "$invoice_1#inv_a%23b%25c");
        let decoded = codec.decode("invoices", Segment::Sort, &key).unwrap();
        assert_eq!(decoded, vec![("invoiceId".to_owned(), AttributeValue::from("a#b%c"))]);
    }

    #[test]
    fn test_number_encoding_preserves_order() {
        let values = [-1e300, -42.5, -1.0, -0.0, 0.0, 1e-9, 1.0, 2.0, 10.0, 1e300];
        let encoded: Vec<String> = values.iter().map(|v| encode_number(*v)).collect();
        for pair in encoded.windows(2) {
            assert!(pair[0] <= pair[1], "{} should sort before {}", pair[0], pair[1]);
        }
        assert_eq!(encode_number(-0.0), encode_number(0.0));
        for v in values {
            let back = decode_number(&encode_number(v)).unwrap();
            assert!(back == v, "{v} decoded as {back}");
        }
    }

    #[test]
    fn test_casing_applies_to_whole_key_and_decodes() {
        let schema = schema(Casing::Lower);
        let codec = KeyCodec::new(&schema);
        let facets = item! { "accountId" => "ACME" };
        let key = codec.encode("invoices", Segment::Partition, &facets, KeyMode::Full).unwrap();
        assert_eq!(key, "$billing#accountid_acme");
        let decoded = codec.decode("invoices", Segment::Partition, &key).unwrap();
        assert_eq!(decoded, vec![("accountId".to_owned(), AttributeValue::from("acme"))]);
    }

    #[test]
    fn test_decode_rejects_foreign_prefix_and_labels() {
        let schema = schema(Casing::None);
        let codec = KeyCodec::new(&schema);
        for key in ["$payment_1#inv_1", "$invoice_10#inv_1", "$invoice_1#id_1", "$invoice_1#inv_1#x_2"] {
            let err = codec.decode("invoices", Segment::Sort, key).unwrap_err();
            assert!(matches!(err, Error::Decode { .. }), "{key}: {err}");
        }
    }

    #[test]
    fn test_type_mismatch_is_validation_error() {
        let schema = schema(Casing::None);
        let codec = KeyCodec::new(&schema);
        let facets = item! { "accountId" => "A1", "status" => "void" };
        let err = codec.encode("byAmount", Segment::Sort, &facets, KeyMode::Partial).unwrap_err();
        assert!(matches!(err, Error::Validation { ref attribute, .. } if attribute == "status"));
    }

    #[test]
    fn test_record_keys_skip_incomplete_secondary_index() {
        let schema = schema(Casing::None);
        let codec = KeyCodec::new(&schema);
        let keys = codec.record_keys(&item! { "accountId" => "A1", "invoiceId" => "I1" }).unwrap();
        assert_eq!(keys.len(), 2);
        assert!(keys.contains_key("pk") && keys.contains_key("sk"));
    }

    #[test]
    fn test_facets_from_row_reads_table_and_index_keys() {
        let schema = schema(Casing::None);
        let codec = KeyCodec::new(&schema);
        let attrs = item! {
            "accountId" => "A1",
            "invoiceId" => "I1",
            "status" => "paid",
            "amount" => 3,
            "paid" => true,
            "digest" => vec![1u8],
        };
        let row = codec.record_keys(&attrs).unwrap();
        let index = schema.index("byAmount").unwrap();
        assert_eq!(codec.facets_from_row(index, &row).unwrap(), attrs);
    }
}
