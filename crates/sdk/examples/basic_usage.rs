//! Basic usage example demonstrating reads, writes, and queries.
//!
//! Run: `cargo run --example basic_usage`
//!
//! This example shows:
//! - Declaring a schema with a table index and a secondary index
//! - Writing items with defaults and validation
//! - Point reads, updates, and conditional writes
//! - Range queries with filters and cursor pagination
//! - Error handling patterns

// Examples are allowed to use expect/unwrap for brevity
#![allow(clippy::expect_used, clippy::unwrap_used, clippy::disallowed_methods)]

use std::sync::Arc;

use tessera::{
    Entity, Error, ExecuteOptions, Result, TableConfig, item,
    mock::{MockStore, TableLayout},
    schema::{Attribute, Index, Model, Schema},
};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt().with_env_filter("tessera=debug").init();

    // -------------------------------------------------------------------------
    // 1. Declare the schema and bind it to a store
    // -------------------------------------------------------------------------
    let schema = Schema::new(Model::new("billing", "invoice", "1"))
        .attribute(Attribute::string("accountId").required())
        .attribute(Attribute::string("invoiceId").required().default_with(|| uuid::Uuid::new_v4().to_string().into()))
        .attribute(Attribute::enumeration("status", ["open", "paid", "void"]).default_value("open"))
        .attribute(Attribute::string("createdAt").required())
        .attribute(Attribute::number("amount").required().validate(|v| match v.as_number() {
            Some(n) if n >= 0.0 => Ok(()),
            _ => Err("must be a non-negative number".to_owned()),
        }))
        .index(Index::table("byId").pk("pk", ["invoiceId"]).sk("sk", ["accountId"]))
        .index(Index::secondary("byStatus", "gsi1").pk("gsi1pk", ["accountId"]).sk("gsi1sk", ["status", "createdAt"]));

    let store = Arc::new(MockStore::new(TableLayout::new("pk", Some("sk")).with_index("gsi1", "gsi1pk", Some("gsi1sk"))));
    let invoices = Entity::new(schema, store, TableConfig::builder().with_table("ledger").build()?)?;

    // -------------------------------------------------------------------------
    // 2. Write a few items
    // -------------------------------------------------------------------------
    let mut ids = Vec::new();
    for (days_ago, amount) in [(9, 120), (6, 40), (3, 75), (1, 310)] {
        let created = (chrono::Utc::now() - chrono::Duration::days(days_ago)).format("%Y-%m-%d").to_string();
        let stored = invoices
            .put(item! { "accountId" => "acct-7", "createdAt" => created, "amount" => amount })
            .go()
            .await?;
        println!("Stored invoice {}", stored["invoiceId"]);
        ids.push(stored["invoiceId"].clone());
    }

    // -------------------------------------------------------------------------
    // 3. Read one back, then update it
    // -------------------------------------------------------------------------
    let key = item! { "accountId" => "acct-7", "invoiceId" => ids[0].clone() };
    let found = invoices.get(key.clone()).go().await?;
    println!("Read back: {found:?}");

    let paid = invoices
        .patch(key.clone())
        .set(item! { "status" => "paid", "createdAt" => found.and_then(|i| i.get("createdAt").cloned()) })
        .go()
        .await?;
    println!("After payment: {paid:?}");

    // -------------------------------------------------------------------------
    // 4. Conditional writes fail cleanly
    // -------------------------------------------------------------------------
    match invoices.update(key).set(item! { "amount" => 0 }).where_(|attr, op| Ok(op.eq(attr.get("status")?, "open"))).go().await {
        Err(Error::ConditionalCheckFailed { operation, .. }) => println!("{operation} refused: invoice is no longer open"),
        other => println!("Unexpected result: {other:?}"),
    }

    // -------------------------------------------------------------------------
    // 5. Query open invoices above a threshold, one page at a time
    // -------------------------------------------------------------------------
    let mut cursor = None;
    loop {
        let page = invoices
            .query("byStatus", item! { "accountId" => "acct-7", "status" => "open" })
            .filter(|attr, op| Ok(op.gt(attr.get("amount")?, 50)))
            .options(ExecuteOptions::new().with_limit(1))
            .page(cursor)
            .await?;
        for invoice in &page.data {
            println!("Open invoice {} for {}", invoice["invoiceId"], invoice["amount"]);
        }
        match page.cursor {
            Some(next) => cursor = Some(next),
            None => break,
        }
    }

    Ok(())
}
