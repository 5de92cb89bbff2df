//! Attribute values and items as the store sees them.
//!
//! An [`Item`] is an ordered map from field name to [`AttributeValue`]. The
//! same shape is used in both directions: caller-facing maps are keyed by
//! attribute name, store-facing maps are keyed by physical field name.

use std::{
    cmp::Ordering,
    collections::{BTreeMap, BTreeSet},
    fmt,
};

use serde::{Deserialize, Serialize};

/// A single stored record, or a key, or a patch: field name to value.
pub type Item = BTreeMap<String, AttributeValue>;

/// A value held by one attribute of an item.
///
/// Scalars (`String`, `Number`, `Bool`, `Binary`) may participate in keys.
/// The structured variants mirror the document and set types of the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AttributeValue {
    /// Explicit null.
    Null,
    /// UTF-8 string.
    String(String),
    /// Number. Stored as a double; integers up to 2^53 are exact.
    Number(f64),
    /// Boolean.
    Bool(bool),
    /// Opaque bytes.
    Binary(Vec<u8>),
    /// Ordered, heterogeneous list.
    List(Vec<AttributeValue>),
    /// Nested document.
    Map(Item),
    /// Set of strings.
    StringSet(BTreeSet<String>),
    /// Set of numbers, kept sorted and de-duplicated.
    NumberSet(Vec<f64>),
    /// Set of byte strings.
    BinarySet(BTreeSet<Vec<u8>>),
}

impl AttributeValue {
    /// Builds a number set, sorting and removing duplicates.
    pub fn number_set(values: impl IntoIterator<Item = f64>) -> Self {
        let mut values: Vec<f64> = values.into_iter().filter(|v| !v.is_nan()).collect();
        values.sort_by(f64::total_cmp);
        values.dedup();
        Self::NumberSet(values)
    }

    /// Builds a string set.
    pub fn string_set<S: Into<String>>(values: impl IntoIterator<Item = S>) -> Self {
        Self::StringSet(values.into_iter().map(Into::into).collect())
    }

    /// Short type tag used in error messages and the `attribute_type` function.
    #[must_use]
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Null => "NULL",
            Self::String(_) => "S",
            Self::Number(_) => "N",
            Self::Bool(_) => "BOOL",
            Self::Binary(_) => "B",
            Self::List(_) => "L",
            Self::Map(_) => "M",
            Self::StringSet(_) => "SS",
            Self::NumberSet(_) => "NS",
            Self::BinarySet(_) => "BS",
        }
    }

    /// Returns the string payload, if this is a string.
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    /// Returns the numeric payload, if this is a number.
    #[must_use]
    pub fn as_number(&self) -> Option<f64> {
        match self {
            Self::Number(n) => Some(*n),
            _ => None,
        }
    }

    /// Returns the boolean payload, if this is a boolean.
    #[must_use]
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Returns the nested map, if this is a map.
    #[must_use]
    pub fn as_map(&self) -> Option<&Item> {
        match self {
            Self::Map(m) => Some(m),
            _ => None,
        }
    }

    /// Returns true for `Null`.
    #[must_use]
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Returns true for the scalar variants that can be encoded into a key.
    #[must_use]
    pub fn is_scalar(&self) -> bool {
        matches!(self, Self::String(_) | Self::Number(_) | Self::Bool(_) | Self::Binary(_))
    }

    /// Orders two values of the same scalar type.
    ///
    /// Returns `None` when the types differ or are not comparable, which the
    /// expression evaluator treats as a false comparison.
    #[must_use]
    pub fn compare(&self, other: &Self) -> Option<Ordering> {
        match (self, other) {
            (Self::String(a), Self::String(b)) => Some(a.cmp(b)),
            (Self::Number(a), Self::Number(b)) => a.partial_cmp(b),
            (Self::Binary(a), Self::Binary(b)) => Some(a.cmp(b)),
            (Self::Bool(a), Self::Bool(b)) => Some(a.cmp(b)),
            _ => None,
        }
    }

    /// Size as reported by the store's `size()` function.
    #[must_use]
    pub fn size(&self) -> Option<usize> {
        match self {
            Self::String(s) => Some(s.len()),
            Self::Binary(b) => Some(b.len()),
            Self::List(l) => Some(l.len()),
            Self::Map(m) => Some(m.len()),
            Self::StringSet(s) => Some(s.len()),
            Self::NumberSet(s) => Some(s.len()),
            Self::BinarySet(s) => Some(s.len()),
            Self::Null | Self::Number(_) | Self::Bool(_) => None,
        }
    }
}

impl fmt::Display for AttributeValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => write!(f, "null"),
            Self::String(s) => write!(f, "{s:?}"),
            Self::Number(n) => write!(f, "{n}"),
            Self::Bool(b) => write!(f, "{b}"),
            Self::Binary(b) => write!(f, "<{} bytes>", b.len()),
            Self::List(l) => write!(f, "[{} items]", l.len()),
            Self::Map(m) => write!(f, "{{{} fields}}", m.len()),
            Self::StringSet(s) => write!(f, "<string set of {}>", s.len()),
            Self::NumberSet(s) => write!(f, "<number set of {}>", s.len()),
            Self::BinarySet(s) => write!(f, "<binary set of {}>", s.len()),
        }
    }
}

impl From<&str> for AttributeValue {
    fn from(value: &str) -> Self {
        Self::String(value.to_owned())
    }
}

impl From<String> for AttributeValue {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

impl From<&String> for AttributeValue {
    fn from(value: &String) -> Self {
        Self::String(value.clone())
    }
}

impl From<bool> for AttributeValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<f64> for AttributeValue {
    fn from(value: f64) -> Self {
        Self::Number(value)
    }
}

macro_rules! impl_from_integer {
    ($($ty:ty),*) => {
        $(
            impl From<$ty> for AttributeValue {
                #[allow(clippy::cast_precision_loss, clippy::cast_lossless)]
                fn from(value: $ty) -> Self {
                    Self::Number(value as f64)
                }
            }
        )*
    };
}

impl_from_integer!(i32, i64, u32, u64, usize);

impl From<Vec<u8>> for AttributeValue {
    fn from(value: Vec<u8>) -> Self {
        Self::Binary(value)
    }
}

impl From<Vec<AttributeValue>> for AttributeValue {
    fn from(value: Vec<AttributeValue>) -> Self {
        Self::List(value)
    }
}

impl From<Item> for AttributeValue {
    fn from(value: Item) -> Self {
        Self::Map(value)
    }
}

impl<T: Into<AttributeValue>> From<Option<T>> for AttributeValue {
    fn from(value: Option<T>) -> Self {
        value.map_or(Self::Null, Into::into)
    }
}

/// Builds an [`Item`] from `name => value` pairs.
///
/// ```
/// use tessera_types::{AttributeValue, item};
///
/// let item = item! { "accountId" => "A1", "amount" => 42 };
/// assert_eq!(item.get("amount"), Some(&AttributeValue::Number(42.0)));
/// ```
#[macro_export]
macro_rules! item {
    () => { $crate::Item::new() };
    ($($name:expr => $value:expr),+ $(,)?) => {{
        let mut item = $crate::Item::new();
        $( item.insert(::std::string::String::from($name), $crate::AttributeValue::from($value)); )+
        item
    }};
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::disallowed_methods)]
mod tests {
    use super::*;

    #[test]
    fn number_set_sorts_and_dedups() {
        let set = AttributeValue::number_set([3.0, 1.0, 3.0, 2.0, f64::NAN]);
        assert_eq!(set, AttributeValue::NumberSet(vec![1.0, 2.0, 3.0]));
    }

    #[test]
    fn compare_only_orders_matching_scalars() {
        let a = AttributeValue::from("a");
        let b = AttributeValue::from("b");
        assert_eq!(a.compare(&b), Some(Ordering::Less));
        assert_eq!(AttributeValue::from(2).compare(&AttributeValue::from(10)), Some(Ordering::Less));
        assert_eq!(a.compare(&AttributeValue::from(1)), None);
        assert_eq!(AttributeValue::Null.compare(&AttributeValue::Null), None);
    }

    #[test]
    fn item_macro_converts_values() {
        let item = item! { "name" => "alice", "age" => 30u32, "active" => true };
        assert_eq!(item.len(), 3);
        assert_eq!(item["name"].as_str(), Some("alice"));
        assert_eq!(item["age"].as_number(), Some(30.0));
        assert_eq!(item["active"].as_bool(), Some(true));
    }

    #[test]
    fn option_none_becomes_null() {
        let value: AttributeValue = Option::<String>::None.into();
        assert!(value.is_null());
    }

    #[test]
    fn size_of_collections() {
        assert_eq!(AttributeValue::from("abc").size(), Some(3));
        assert_eq!(AttributeValue::string_set(["a", "b"]).size(), Some(2));
        assert_eq!(AttributeValue::from(5).size(), None);
    }
}
