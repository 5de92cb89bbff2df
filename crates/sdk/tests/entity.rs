//! Single-entity reads and writes against the mock store.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic, clippy::disallowed_methods)]

mod common;

use tessera::{AttributeValue, Error, ExecuteOptions, item};

fn invoice(id: &str, created: &str, amount: i32) -> tessera::Item {
    item! { "accountId" => "A1", "invoiceId" => id, "createdAt" => created, "amount" => amount }
}

#[tokio::test]
async fn test_put_get_update_delete() {
    let store = common::store();
    let invoices = common::invoices(&store);

    let stored = invoices.put(invoice("I1", "2024-01-01", 40)).go().await.unwrap();
    assert_eq!(stored.get("status"), Some(&AttributeValue::from("open")), "default applied");

    let key = item! { "accountId" => "A1", "invoiceId" => "I1" };
    let found = invoices.get(key.clone()).go().await.unwrap().unwrap();
    assert_eq!(found, stored);

    let updated = invoices
        .update(key.clone())
        .set(item! { "status" => "paid", "createdAt" => "2024-01-01" })
        .add(item! { "amount" => 5 })
        .go()
        .await
        .unwrap()
        .unwrap();
    assert_eq!(updated.get("status"), Some(&AttributeValue::from("paid")));
    assert_eq!(updated.get("amount"), Some(&AttributeValue::from(45)));

    let old = invoices.delete(key.clone()).return_old().go().await.unwrap();
    assert_eq!(old, Some(updated));
    assert!(invoices.get(key).go().await.unwrap().is_none());
    assert!(store.is_empty());
}

#[tokio::test]
async fn test_stored_row_carries_keys_and_tags() {
    let store = common::store();
    let invoices = common::invoices(&store);
    invoices.put(invoice("I1", "2024-01-01", 40)).go().await.unwrap();

    let rows = store.rows();
    assert_eq!(rows.len(), 1);
    let row = &rows[0];
    assert_eq!(row["pk"], AttributeValue::from("$billing#invoiceId_I1"));
    assert_eq!(row["sk"], AttributeValue::from("$invoice_1#accountId_A1"));
    assert_eq!(row["gsi1pk"], AttributeValue::from("$billing#accountId_A1"));
    assert_eq!(row["gsi2sk"], AttributeValue::from("$invoice_1#status_open#createdAt_2024-01-01"));
    assert_eq!(row["__te_entity"], AttributeValue::from("invoice"));
    assert_eq!(row["__te_version"], AttributeValue::from("1"));
}

#[tokio::test]
async fn test_conditional_update_failure() {
    let store = common::store();
    let invoices = common::invoices(&store);
    invoices.put(invoice("I1", "2024-01-01", 40)).go().await.unwrap();

    let err = invoices
        .update(item! { "accountId" => "A1", "invoiceId" => "I1" })
        .set(item! { "amount" => 10 })
        .where_(|attr, op| Ok(op.eq(attr.get("status")?, "paid")))
        .go()
        .await
        .unwrap_err();
    assert!(matches!(err, Error::ConditionalCheckFailed { .. }), "{err}");

    let unchanged =
        invoices.get(item! { "accountId" => "A1", "invoiceId" => "I1" }).go().await.unwrap().unwrap();
    assert_eq!(unchanged.get("amount"), Some(&AttributeValue::from(40)));
}

#[tokio::test]
async fn test_create_refuses_existing_item() {
    let store = common::store();
    let invoices = common::invoices(&store);
    invoices.create(invoice("I1", "2024-01-01", 40)).go().await.unwrap();
    let err = invoices.create(invoice("I1", "2024-01-02", 50)).go().await.unwrap_err();
    assert!(matches!(err, Error::ConditionalCheckFailed { .. }));
}

#[tokio::test]
async fn test_get_ignores_rows_of_other_entities() {
    let store = common::store();
    let invoices = common::invoices(&store);
    store.insert_raw(item! {
        "pk" => "$billing#invoiceId_X1",
        "sk" => "$invoice_1#accountId_A1",
        "__te_entity" => "payment",
        "__te_version" => "1",
        "amount" => 5,
    })
    .unwrap();

    let key = item! { "accountId" => "A1", "invoiceId" => "X1" };
    assert!(invoices.get(key.clone()).go().await.unwrap().is_none());

    let raw = invoices.get(key).options(ExecuteOptions::new().with_raw(true)).go().await.unwrap();
    assert!(raw.is_some());
}

#[tokio::test]
async fn test_required_attribute_is_enforced() {
    let store = common::store();
    let invoices = common::invoices(&store);
    let err = invoices
        .put(item! { "accountId" => "A1", "invoiceId" => "I1", "createdAt" => "2024-01-01" })
        .go()
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Validation { ref attribute, .. } if attribute == "amount"));
    assert_eq!(store.calls("put"), 0);
}

#[tokio::test]
async fn test_enum_rejects_unknown_value() {
    let store = common::store();
    let invoices = common::invoices(&store);
    let mut input = invoice("I1", "2024-01-01", 40);
    input.insert("status".to_owned(), "lost".into());
    let err = invoices.put(input).go().await.unwrap_err();
    assert!(matches!(err, Error::Validation { ref attribute, .. } if attribute == "status"));
}
