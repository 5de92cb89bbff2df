//! Collections: one query returning several entities of a partition.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic, clippy::disallowed_methods)]

mod common;

use tessera::{AttributeValue, ExecuteOptions, Service, item};

async fn seed(service: &Service, account: &str, invoices: usize, payments: usize) {
    let invoice = service.entity("invoice").unwrap();
    let payment = service.entity("payment").unwrap();
    for i in 0..invoices {
        invoice
            .put(item! {
                "accountId" => account,
                "invoiceId" => format!("{account}-I{i}"),
                "createdAt" => "2024-02-01",
                "amount" => 100,
            })
            .go()
            .await
            .unwrap();
    }
    for i in 0..payments {
        payment
            .put(item! {
                "accountId" => account,
                "paymentId" => format!("{account}-P{i}"),
                "invoiceId" => format!("{account}-I{i}"),
                "amount" => 25,
            })
            .go()
            .await
            .unwrap();
    }
}

#[tokio::test]
async fn test_collection_groups_members_and_isolates_partitions() {
    let store = common::store();
    let service = common::service(&store);
    seed(&service, "A1", 2, 3).await;
    seed(&service, "A2", 4, 1).await;

    let page = service.collection("statement", item! { "accountId" => "A1" }).go().await.unwrap();
    assert_eq!(page.data["invoice"].len(), 2);
    assert_eq!(page.data["payment"].len(), 3);
    assert!(
        page.data.values().flatten().all(|i| i.get("accountId") == Some(&AttributeValue::from("A1"))),
        "rows from another partition leaked"
    );
    assert!(page.cursor.is_none());
}

#[tokio::test]
async fn test_collection_lists_every_member_even_when_empty() {
    let store = common::store();
    let service = common::service(&store);
    seed(&service, "A1", 1, 0).await;

    let page = service.collection("statement", item! { "accountId" => "A1" }).go().await.unwrap();
    assert_eq!(page.data["invoice"].len(), 1);
    assert!(page.data["payment"].is_empty());
}

#[tokio::test]
async fn test_collection_filter_applies_to_all_members() {
    let store = common::store();
    let service = common::service(&store);
    seed(&service, "A1", 2, 2).await;

    let page = service
        .collection("statement", item! { "accountId" => "A1" })
        .filter(|attr, op| Ok(op.gt(attr.get("amount")?, 50)))
        .go()
        .await
        .unwrap();
    assert_eq!(page.data["invoice"].len(), 2);
    assert!(page.data["payment"].is_empty());
}

#[tokio::test]
async fn test_collection_pagination() {
    let store = common::store();
    let service = common::service(&store);
    seed(&service, "A1", 3, 3).await;

    let query = || {
        service
            .collection("statement", item! { "accountId" => "A1" })
            .options(ExecuteOptions::new().with_limit(4))
    };
    let first = query().page(None).await.unwrap();
    let first_total: usize = first.data.values().map(Vec::len).sum();
    assert_eq!(first_total, 4);

    let second = query().page(first.cursor).await.unwrap();
    let second_total: usize = second.data.values().map(Vec::len).sum();
    assert_eq!(second_total, 2);
    assert!(second.cursor.is_none());
}
