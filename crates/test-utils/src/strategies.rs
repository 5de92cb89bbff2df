//! Proptest strategies for tessera values.
//!
//! Reusable generators for property-based testing across crates. Strategies
//! produce well-formed attribute values and items while reaching the edge
//! cases key composition cares about: delimiters inside values, empty
//! strings, negative and fractional numbers.
//!
//! # Usage
//!
//! ```no_run
//! use proptest::prelude::*;
//! use tessera_test_utils::strategies;
//!
//! proptest! {
//!     #[test]
//!     fn my_property(value in strategies::arb_facet_value()) {
//!         // test invariant with a randomly generated facet value
//!     }
//! }
//! ```

use proptest::prelude::*;
use tessera_types::{AttributeValue, Item};

/// Generates an identifier usable as a service, entity, or attribute name:
/// `[a-z][a-zA-Z0-9]{0,15}`.
pub fn arb_identifier() -> impl Strategy<Value = String> {
    "[a-z][a-zA-Z0-9]{0,15}"
}

/// Generates a string facet value, biased towards the characters keys use
/// as separators.
pub fn arb_facet_string() -> impl Strategy<Value = String> {
    prop_oneof![
        3 => "[a-zA-Z0-9]{0,12}",
        2 => "[a-z0-9#_$~ -]{0,12}",
        1 => any::<String>(),
    ]
}

/// Generates a finite number that survives a decimal round trip: integers in
/// the `i32` range and values with at most three decimal places.
pub fn arb_number() -> impl Strategy<Value = f64> {
    prop_oneof![
        any::<i32>().prop_map(f64::from),
        (any::<i32>(), 0u32..1000).prop_map(|(whole, frac)| f64::from(whole) + f64::from(frac) / 1000.0),
    ]
}

/// Generates a scalar value that can be composed into a key.
pub fn arb_facet_value() -> impl Strategy<Value = AttributeValue> {
    prop_oneof![
        arb_facet_string().prop_map(AttributeValue::String),
        arb_number().prop_map(AttributeValue::Number),
        any::<bool>().prop_map(AttributeValue::Bool),
    ]
}

/// Generates any attribute value, nesting lists and maps up to three levels.
pub fn arb_attribute_value() -> impl Strategy<Value = AttributeValue> {
    let leaf = prop_oneof![
        Just(AttributeValue::Null),
        arb_facet_value(),
        proptest::collection::vec(any::<u8>(), 0..16).prop_map(AttributeValue::Binary),
        proptest::collection::btree_set("[a-z]{1,6}", 1..5).prop_map(AttributeValue::StringSet),
        proptest::collection::vec(arb_number(), 1..5).prop_map(AttributeValue::number_set),
    ];
    leaf.prop_recursive(3, 24, 4, |inner| {
        prop_oneof![
            proptest::collection::vec(inner.clone(), 0..4).prop_map(AttributeValue::List),
            proptest::collection::btree_map(arb_identifier(), inner, 0..4).prop_map(AttributeValue::Map),
        ]
    })
}

/// Generates an item of up to `max_fields` attributes.
pub fn arb_item(max_fields: usize) -> impl Strategy<Value = Item> {
    proptest::collection::btree_map(arb_identifier(), arb_attribute_value(), 0..=max_fields)
}

/// Generates a 32-byte cursor signing key.
pub fn arb_cursor_key() -> impl Strategy<Value = [u8; 32]> {
    any::<[u8; 32]>()
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::disallowed_methods)]
mod tests {
    use super::*;

    proptest! {
        #[test]
        fn strategy_produces_scalar_facets(value in arb_facet_value()) {
            prop_assert!(value.is_scalar());
        }

        #[test]
        fn strategy_produces_finite_numbers(n in arb_number()) {
            prop_assert!(n.is_finite());
        }

        #[test]
        fn strategy_produces_valid_identifiers(name in arb_identifier()) {
            prop_assert!(!name.is_empty());
            prop_assert!(name.chars().all(|c| c.is_ascii_alphanumeric()));
        }

        #[test]
        fn strategy_respects_item_size(item in arb_item(5)) {
            prop_assert!(item.len() <= 5);
        }
    }
}
