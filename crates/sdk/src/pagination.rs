//! Opaque pagination cursors.
//!
//! A cursor wraps the store's last-evaluated key so callers can resume a
//! query without seeing physical keys. Cursors are:
//! - HMAC-signed, so a tampered cursor is rejected
//! - Bound to a scope (entity or collection) and access pattern, so a cursor
//!   from one query cannot be replayed against another
//! - Bound to a hash of the key condition, so the range cannot change mid-pagination
//!
//! When the key belongs to a known entity it is stored as decoded facets and
//! re-encoded on the way back in; otherwise the raw key is carried as-is.

use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tessera_types::{
    Item,
    codec::{decode, encode},
};

use crate::{
    error::{Error, Result},
    keys::KeyCodec,
    schema::{CompiledSchema, IndexDescriptor},
};

/// Cursor format version for forward compatibility.
const CURSOR_VERSION: u8 = 1;

/// HMAC key length in bytes.
pub const CURSOR_KEY_LENGTH: usize = 32;

/// HMAC output length (truncated).
const HMAC_LENGTH: usize = 16;

/// Where to resume.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CursorPosition {
    /// Facets decoded from the last key of a known entity.
    Facets {
        /// Owning entity.
        entity: String,
        /// Owning entity version.
        version: String,
        /// Decoded table and index facets.
        facets: Item,
    },
    /// The raw last-evaluated key.
    Keys(Item),
}

/// Cursor contents. Serialized, signed, and base64-encoded for callers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cursor {
    /// Format version.
    pub version: u8,
    /// `entity:<service>/<name>` or `collection:<service>/<name>`.
    pub scope: String,
    /// Access pattern or collection index being paged.
    pub index: String,
    /// Resume position.
    pub position: CursorPosition,
    /// SeaHash of the key condition.
    pub query_hash: [u8; 8],
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SealedCursor {
    cursor: Cursor,
    hmac: [u8; HMAC_LENGTH],
}

/// Why a cursor was rejected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CursorError {
    /// Not base64, or not a cursor.
    InvalidFormat,
    /// Signature mismatch (tampered, or signed with another key).
    InvalidHmac,
    /// Produced by an incompatible version.
    UnsupportedVersion(u8),
    /// Issued for a different entity, collection, or index.
    ContextMismatch {
        /// Scope and index of the current query.
        expected: String,
        /// Scope and index recorded in the cursor.
        found: String,
    },
    /// The key condition changed since pagination started.
    QueryChanged,
    /// The recorded position no longer encodes to a key.
    InvalidPosition(String),
}

impl std::fmt::Display for CursorError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidFormat | Self::InvalidHmac => write!(f, "invalid cursor"),
            Self::UnsupportedVersion(v) => write!(f, "unsupported cursor version: {v}"),
            Self::ContextMismatch { expected, found } => {
                write!(f, "cursor was issued for {found}, not {expected}")
            },
            Self::QueryChanged => write!(f, "key condition changed; start a new pagination"),
            Self::InvalidPosition(message) => write!(f, "cursor position is invalid: {message}"),
        }
    }
}

impl std::error::Error for CursorError {}

/// The query a cursor is being encoded for or checked against.
#[derive(Debug, Clone)]
pub(crate) struct PageContext<'a> {
    pub scope: String,
    pub index: String,
    pub query_hash: [u8; 8],
    /// Entities whose rows may appear, with the index each reads through.
    pub members: Vec<(&'a CompiledSchema, &'a IndexDescriptor)>,
}

impl PageContext<'_> {
    fn label(&self) -> String {
        format!("{} via {}", self.scope, self.index)
    }
}

/// Cursor encoder/decoder with HMAC validation.
#[derive(Clone)]
pub struct CursorCodec {
    key: [u8; CURSOR_KEY_LENGTH],
}

impl std::fmt::Debug for CursorCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CursorCodec").finish_non_exhaustive()
    }
}

impl CursorCodec {
    /// Creates a codec with the given signing key.
    #[must_use]
    pub fn new(key: [u8; CURSOR_KEY_LENGTH]) -> Self {
        Self { key }
    }

    /// Creates a codec with a random key. Cursors do not survive a restart.
    #[must_use]
    pub fn with_random_key() -> Self {
        use rand::RngCore;
        let mut key = [0u8; CURSOR_KEY_LENGTH];
        rand::thread_rng().fill_bytes(&mut key);
        Self { key }
    }

    /// Derives a stable signing key from `seed`.
    #[must_use]
    pub fn derive_key(seed: &str) -> [u8; CURSOR_KEY_LENGTH] {
        let mut hasher = Sha256::new();
        hasher.update(b"tessera-cursor\0");
        hasher.update(seed.as_bytes());
        let digest = hasher.finalize();
        let mut key = [0u8; CURSOR_KEY_LENGTH];
        key.copy_from_slice(&digest);
        key
    }

    /// Signs and encodes a cursor.
    ///
    /// # Errors
    ///
    /// Returns [`CursorError::InvalidFormat`] if the cursor cannot be serialized.
    pub fn seal(&self, cursor: &Cursor) -> std::result::Result<String, CursorError> {
        let bytes = encode(cursor).map_err(|_| CursorError::InvalidFormat)?;
        let sealed = SealedCursor { cursor: cursor.clone(), hmac: self.sign(&bytes)? };
        let bytes = encode(&sealed).map_err(|_| CursorError::InvalidFormat)?;
        Ok(URL_SAFE_NO_PAD.encode(bytes))
    }

    /// Decodes and verifies a cursor.
    ///
    /// # Errors
    ///
    /// Returns an error if the cursor is malformed, its signature does not
    /// verify, or its version is unsupported.
    pub fn open(&self, encoded: &str) -> std::result::Result<Cursor, CursorError> {
        let bytes = URL_SAFE_NO_PAD.decode(encoded).map_err(|_| CursorError::InvalidFormat)?;
        let sealed: SealedCursor = decode(&bytes).map_err(|_| CursorError::InvalidFormat)?;
        let cursor_bytes = encode(&sealed.cursor).map_err(|_| CursorError::InvalidFormat)?;
        if sealed.hmac != self.sign(&cursor_bytes)? {
            return Err(CursorError::InvalidHmac);
        }
        if sealed.cursor.version != CURSOR_VERSION {
            return Err(CursorError::UnsupportedVersion(sealed.cursor.version));
        }
        Ok(sealed.cursor)
    }

    /// Checks that `cursor` was issued for the query described by the arguments.
    ///
    /// # Errors
    ///
    /// Returns [`CursorError::ContextMismatch`] or [`CursorError::QueryChanged`].
    pub fn validate_context(
        &self,
        cursor: &Cursor,
        scope: &str,
        index: &str,
        query_hash: [u8; 8],
    ) -> std::result::Result<(), CursorError> {
        if cursor.scope != scope || cursor.index != index {
            return Err(CursorError::ContextMismatch {
                expected: format!("{scope} via {index}"),
                found: format!("{} via {}", cursor.scope, cursor.index),
            });
        }
        if cursor.query_hash != query_hash {
            return Err(CursorError::QueryChanged);
        }
        Ok(())
    }

    /// Hashes the parts of a query that a cursor must not outlive.
    #[must_use]
    pub fn compute_query_hash(parts: &[&str]) -> [u8; 8] {
        seahash::hash(parts.join("\0").as_bytes()).to_le_bytes()
    }

    /// Encodes a store continuation key for `context`.
    pub(crate) fn encode_key(&self, context: &PageContext<'_>, last_key: &Item) -> Result<String> {
        let position = context
            .members
            .iter()
            .find_map(|(schema, index)| {
                KeyCodec::new(schema).facets_from_row(index, last_key).ok().map(|facets| {
                    CursorPosition::Facets {
                        entity: schema.model().entity.clone(),
                        version: schema.model().version.clone(),
                        facets,
                    }
                })
            })
            .unwrap_or_else(|| CursorPosition::Keys(last_key.clone()));
        let cursor = Cursor {
            version: CURSOR_VERSION,
            scope: context.scope.clone(),
            index: context.index.clone(),
            position,
            query_hash: context.query_hash,
        };
        self.seal(&cursor).map_err(|source| Error::Cursor { source })
    }

    /// Decodes a cursor issued for `context` back into the store key.
    pub(crate) fn decode_key(&self, context: &PageContext<'_>, encoded: &str) -> Result<Item> {
        let cursor = self.open(encoded).map_err(|source| Error::Cursor { source })?;
        self.validate_context(&cursor, &context.scope, &context.index, context.query_hash)
            .map_err(|source| Error::Cursor { source })?;
        match cursor.position {
            CursorPosition::Keys(key) => Ok(key),
            CursorPosition::Facets { entity, version, facets } => {
                let Some((schema, index)) = context
                    .members
                    .iter()
                    .find(|(s, _)| s.model().entity == entity && s.model().version == version)
                else {
                    return Err(Error::Cursor {
                        source: CursorError::ContextMismatch {
                            expected: context.label(),
                            found: format!("entity {entity} v{version}"),
                        },
                    });
                };
                let codec = KeyCodec::new(schema);
                let mut key = codec.primary_key(&facets).map_err(invalid_position)?;
                if !index.is_table() {
                    key.extend(codec.index_keys(index, &facets).map_err(invalid_position)?);
                }
                Ok(key)
            },
        }
    }

    fn sign(&self, bytes: &[u8]) -> std::result::Result<[u8; HMAC_LENGTH], CursorError> {
        let mut mac =
            <Hmac<Sha256>>::new_from_slice(&self.key).map_err(|_| CursorError::InvalidFormat)?;
        mac.update(bytes);
        let full = mac.finalize().into_bytes();
        let mut truncated = [0u8; HMAC_LENGTH];
        truncated.copy_from_slice(&full[..HMAC_LENGTH]);
        Ok(truncated)
    }
}

fn invalid_position(e: Error) -> Error {
    Error::Cursor { source: CursorError::InvalidPosition(e.to_string()) }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic, clippy::disallowed_methods)]
mod tests {
    use tessera_types::{AttributeValue, item};

    use super::*;
    use crate::{
        pipeline::AttributePipeline,
        schema::{Attribute, Index, Model, Schema},
    };

    fn schema(entity: &str) -> CompiledSchema {
        Schema::new(Model::new("billing", entity, "1"))
            .attribute(Attribute::string("accountId"))
            .attribute(Attribute::string("id"))
            .attribute(Attribute::number("amount"))
            .index(Index::table("primary").pk("pk", ["accountId"]).sk("sk", ["id"]))
            .index(
                Index::secondary("byAmount", "gsi1")
                    .pk("gsi1pk", ["accountId"])
                    .sk("gsi1sk", ["amount"])
                    .collection("ledger"),
            )
            .compile()
            .unwrap()
    }

    fn cursor() -> Cursor {
        Cursor {
            version: CURSOR_VERSION,
            scope: "entity:billing/invoice".to_owned(),
            index: "byAmount".to_owned(),
            position: CursorPosition::Keys(item! { "pk" => "p", "sk" => "s" }),
            query_hash: CursorCodec::compute_query_hash(&["byAmount", "#pk = :pk0"]),
        }
    }

    #[test]
    fn test_seal_open_roundtrip() {
        let codec = CursorCodec::with_random_key();
        let sealed = codec.seal(&cursor()).unwrap();
        assert!(!sealed.contains('='), "URL-safe without padding");
        assert_eq!(codec.open(&sealed).unwrap(), cursor());
    }

    #[test]
    fn test_tampered_cursor_rejected() {
        let codec = CursorCodec::with_random_key();
        let sealed = codec.seal(&cursor()).unwrap();
        let mut bytes = URL_SAFE_NO_PAD.decode(&sealed).unwrap();
        let mid = bytes.len() / 2;
        bytes[mid] ^= 0x01;
        let tampered = URL_SAFE_NO_PAD.encode(&bytes);
        assert!(matches!(
            codec.open(&tampered),
            Err(CursorError::InvalidHmac | CursorError::InvalidFormat)
        ));
    }

    #[test]
    fn test_cursor_from_other_key_rejected() {
        let sealed = CursorCodec::new([1; 32]).seal(&cursor()).unwrap();
        assert_eq!(CursorCodec::new([2; 32]).open(&sealed), Err(CursorError::InvalidHmac));
    }

    #[test]
    fn test_garbage_rejected() {
        let codec = CursorCodec::with_random_key();
        assert_eq!(codec.open("not base64!"), Err(CursorError::InvalidFormat));
        assert_eq!(codec.open(""), Err(CursorError::InvalidFormat));
    }

    #[test]
    fn test_context_validation() {
        let codec = CursorCodec::with_random_key();
        let cursor = cursor();
        let hash = cursor.query_hash;
        assert!(codec.validate_context(&cursor, "entity:billing/invoice", "byAmount", hash).is_ok());
        assert!(matches!(
            codec.validate_context(&cursor, "entity:billing/payment", "byAmount", hash),
            Err(CursorError::ContextMismatch { .. })
        ));
        assert_eq!(
            codec.validate_context(&cursor, "entity:billing/invoice", "byAmount", [0; 8]),
            Err(CursorError::QueryChanged)
        );
    }

    #[test]
    fn test_derived_key_is_stable() {
        assert_eq!(CursorCodec::derive_key("table"), CursorCodec::derive_key("table"));
        assert_ne!(CursorCodec::derive_key("table"), CursorCodec::derive_key("other"));
    }

    #[test]
    fn test_key_roundtrip_through_facets() {
        let invoice = schema("invoice");
        let codec = CursorCodec::new(CursorCodec::derive_key("t"));
        let index = invoice.index("byAmount").unwrap();
        let context = PageContext {
            scope: "entity:billing/invoice".to_owned(),
            index: "byAmount".to_owned(),
            query_hash: [7; 8],
            members: vec![(&invoice, index)],
        };
        let record = AttributePipeline::new(&invoice)
            .to_record(&item! { "accountId" => "A1", "id" => "x#1", "amount" => -3.5 })
            .unwrap();
        let last_key: Item = ["pk", "sk", "gsi1pk", "gsi1sk"]
            .into_iter()
            .map(|f| (f.to_owned(), record[f].clone()))
            .collect();

        let encoded = codec.encode_key(&context, &last_key).unwrap();
        let opened = codec.open(&encoded).unwrap();
        assert!(matches!(opened.position, CursorPosition::Facets { ref entity, .. } if entity == "invoice"));
        assert_eq!(codec.decode_key(&context, &encoded).unwrap(), last_key);
    }

    #[test]
    fn test_unknown_key_carried_raw() {
        let invoice = schema("invoice");
        let codec = CursorCodec::with_random_key();
        let context = PageContext {
            scope: "entity:billing/invoice".to_owned(),
            index: "primary".to_owned(),
            query_hash: [0; 8],
            members: vec![(&invoice, invoice.table_index())],
        };
        let foreign = item! { "pk" => "$billing#accountId_A1", "sk" => AttributeValue::from("$other_1#x_1") };
        let encoded = codec.encode_key(&context, &foreign).unwrap();
        assert_eq!(codec.decode_key(&context, &encoded).unwrap(), foreign);
    }

    #[test]
    fn test_cursor_for_other_index_is_cursor_error() {
        let invoice = schema("invoice");
        let codec = CursorCodec::with_random_key();
        let primary = PageContext {
            scope: "entity:billing/invoice".to_owned(),
            index: "primary".to_owned(),
            query_hash: [0; 8],
            members: vec![(&invoice, invoice.table_index())],
        };
        let by_amount = PageContext { index: "byAmount".to_owned(), ..primary.clone() };
        let encoded = codec.encode_key(&primary, &item! { "pk" => "a", "sk" => "b" }).unwrap();
        match codec.decode_key(&by_amount, &encoded) {
            Err(Error::Cursor { source: CursorError::ContextMismatch { .. } }) => {},
            other => panic!("expected context mismatch, got {other:?}"),
        }
    }
}
