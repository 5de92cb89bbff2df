//! Fuzz target for composite key decoding.
//!
//! Tests that `KeyCodec::decode` never panics on arbitrary key strings, and
//! that keys composed from arbitrary facet values decode back to them.

#![no_main]

use std::sync::OnceLock;

use libfuzzer_sys::fuzz_target;
use tessera::{
    AttributeValue, Item,
    keys::{KeyCodec, KeyMode},
    schema::{Attribute, CompiledSchema, Index, Model, Schema, Segment},
};

fn schema() -> &'static CompiledSchema {
    static SCHEMA: OnceLock<CompiledSchema> = OnceLock::new();
    SCHEMA.get_or_init(|| {
        Schema::new(Model::new("fuzz", "entry", "1"))
            .attribute(Attribute::string("account"))
            .attribute(Attribute::number("amount"))
            .attribute(Attribute::boolean("settled"))
            .attribute(Attribute::binary("digest"))
            .index(
                Index::table("byAccount")
                    .pk("pk", ["account"])
                    .sk("sk", ["amount", "settled", "digest"]),
            )
            .compile()
            .expect("fuzz schema compiles")
    })
}

fuzz_target!(|data: &[u8]| {
    let codec = KeyCodec::new(schema());

    // Arbitrary text under either segment; must never panic
    if let Ok(raw) = std::str::from_utf8(data) {
        let _ = codec.decode("byAccount", Segment::Partition, raw);
        let _ = codec.decode("byAccount", Segment::Sort, raw);
        let _ = codec.decode("byAccount", Segment::Sort, &format!("$entry_1#{raw}"));
    }

    // Compose from fuzzer input and decode again
    if data.len() < 9 {
        return;
    }
    let mut bits = [0u8; 8];
    bits.copy_from_slice(&data[..8]);
    let amount = f64::from_le_bytes(bits);
    if !amount.is_finite() {
        return;
    }
    let settled = data[8] & 1 == 1;
    let digest = data[9..].to_vec();
    let account = String::from_utf8_lossy(&data[9..]).into_owned();

    let mut facets = Item::new();
    facets.insert("account".to_owned(), AttributeValue::String(account.clone()));
    facets.insert("amount".to_owned(), AttributeValue::Number(amount));
    facets.insert("settled".to_owned(), AttributeValue::Bool(settled));
    facets.insert("digest".to_owned(), AttributeValue::Binary(digest.clone()));

    let pk = codec.encode("byAccount", Segment::Partition, &facets, KeyMode::Full).expect("pk encodes");
    let sk = codec.encode("byAccount", Segment::Sort, &facets, KeyMode::Full).expect("sk encodes");
    let decoded_pk = codec.decode("byAccount", Segment::Partition, &pk).expect("pk decodes");
    let decoded_sk = codec.decode("byAccount", Segment::Sort, &sk).expect("sk decodes");

    assert_eq!(decoded_pk, vec![("account".to_owned(), AttributeValue::String(account))]);
    let amount = if amount == 0.0 { 0.0 } else { amount };
    assert_eq!(
        decoded_sk,
        vec![
            ("amount".to_owned(), AttributeValue::Number(amount)),
            ("settled".to_owned(), AttributeValue::Bool(settled)),
            ("digest".to_owned(), AttributeValue::Binary(digest)),
        ]
    );
});
