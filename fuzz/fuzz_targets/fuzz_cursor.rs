//! Fuzz target for pagination cursor parsing.
//!
//! Tests that `CursorCodec::open` never panics on arbitrary strings, and
//! that cursors from `seal` always open to the same value.

#![no_main]

use libfuzzer_sys::fuzz_target;
use tessera::{
    AttributeValue, Item,
    pagination::{Cursor, CursorCodec, CursorPosition},
};

fuzz_target!(|data: &[u8]| {
    if data.is_empty() {
        return;
    }

    let selector = data[0] % 3;
    let payload = &data[1..];

    match selector {
        // Open arbitrary strings; must never panic
        0 => fuzz_open_arbitrary(payload),
        // Open arbitrary base64; must never panic
        1 => fuzz_open_base64(payload),
        // Seal a cursor built from the input, then open it
        _ => fuzz_roundtrip(payload),
    }
});

fn fuzz_open_arbitrary(data: &[u8]) {
    if let Ok(s) = std::str::from_utf8(data) {
        let codec = CursorCodec::new([0u8; 32]);
        let _ = codec.open(s);
    }
}

fn fuzz_open_base64(data: &[u8]) {
    use base64::Engine;
    // A validly encoded but forged cursor.
    let encoded = base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(data);
    let codec = CursorCodec::new([0u8; 32]);
    let _ = codec.open(&encoded);
}

fn fuzz_roundtrip(data: &[u8]) {
    if data.len() < 8 {
        return;
    }
    let mut query_hash = [0u8; 8];
    query_hash.copy_from_slice(&data[..8]);
    let text = String::from_utf8_lossy(&data[8..]).into_owned();

    let mut facets = Item::new();
    facets.insert("id".to_owned(), AttributeValue::String(text.clone()));
    let cursor = Cursor {
        version: 1,
        scope: format!("entity:fuzz/{text}"),
        index: text,
        position: CursorPosition::Facets { entity: "entry".to_owned(), version: "1".to_owned(), facets },
        query_hash,
    };

    let codec = CursorCodec::new([42u8; 32]);
    let sealed = codec.seal(&cursor).expect("sealing a well-formed cursor");
    let opened = codec.open(&sealed).expect("roundtrip open failed for a sealed cursor");
    assert_eq!(opened, cursor, "roundtrip mismatch");
}
