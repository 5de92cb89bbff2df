//! Collection and batch example: several entities in one partition.
//!
//! Run: `cargo run --example collections`
//!
//! This example shows:
//! - Grouping entities into a service
//! - Loading related items with one collection query
//! - Batch writes with chunking and bounded concurrency
//! - Handling partially applied batches

// Examples are allowed to use expect/unwrap for brevity
#![allow(clippy::expect_used, clippy::unwrap_used, clippy::disallowed_methods)]

use std::{sync::Arc, time::Duration};

use tessera::{
    Entity, Error, ExecuteOptions, Result, Service, Store, TableConfig, item,
    mock::{MockStore, TableLayout},
    schema::{Attribute, Index, Model, Schema},
};
use tessera_types::config::{BatchConfig, RetryPolicy};

fn schemas() -> (Schema, Schema) {
    let invoice = Schema::new(Model::new("billing", "invoice", "1"))
        .attribute(Attribute::string("accountId").required())
        .attribute(Attribute::string("invoiceId").required())
        .attribute(Attribute::number("amount").required())
        .index(Index::table("byId").pk("pk", ["invoiceId"]).sk("sk", ["accountId"]))
        .index(Index::secondary("byAccount", "gsi1").pk("gsi1pk", ["accountId"]).sk("gsi1sk", ["invoiceId"]).collection("statement"));
    let payment = Schema::new(Model::new("billing", "payment", "1"))
        .attribute(Attribute::string("accountId").required())
        .attribute(Attribute::string("paymentId").required())
        .attribute(Attribute::number("amount").required())
        .index(Index::table("byId").pk("pk", ["paymentId"]).sk("sk", ["accountId"]))
        .index(Index::secondary("byAccount", "gsi1").pk("gsi1pk", ["accountId"]).sk("gsi1sk", ["paymentId"]).collection("statement"));
    (invoice, payment)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt().with_env_filter("tessera=info").init();

    let store = Arc::new(MockStore::new(TableLayout::new("pk", Some("sk")).with_index("gsi1", "gsi1pk", Some("gsi1sk"))));
    let shared: Arc<dyn Store> = Arc::clone(&store) as Arc<dyn Store>;
    let config = TableConfig::builder()
        .with_table("ledger")
        .with_batch(BatchConfig::builder().write_chunk_size(25).concurrency(4).build().expect("valid batch config"))
        .with_retry_policy(RetryPolicy::builder().max_attempts(5).initial_backoff(Duration::from_millis(20)).build().expect("valid retry policy"))
        .build()?;

    let (invoice, payment) = schemas();
    let service = Service::builder("billing")
        .entity(Entity::new(invoice, Arc::clone(&shared), config.clone())?)
        .entity(Entity::new(payment, shared, config)?)
        .build()?;
    let invoices = service.entity("invoice").expect("registered");
    let payments = service.entity("payment").expect("registered");

    // -------------------------------------------------------------------------
    // 1. Batch-write 60 invoices; the store throttles a few items
    // -------------------------------------------------------------------------
    store.inject_unprocessed(7);
    let batch: Vec<_> = (0..60)
        .map(|i| item! { "accountId" => format!("acct-{}", i % 3), "invoiceId" => format!("inv-{i:03}"), "amount" => 10 * i })
        .collect();
    let written = invoices.batch_put(batch).go().await?;
    println!("Wrote {} invoices in {} calls", written.written, store.batch_write_calls());

    // -------------------------------------------------------------------------
    // 2. A batch that cannot finish reports what was left behind
    // -------------------------------------------------------------------------
    store.inject_unprocessed(usize::MAX);
    let receipts = (0..3).map(|i| item! { "accountId" => "acct-0", "paymentId" => format!("pay-{i}"), "amount" => 5 }).collect();
    match payments.batch_put(receipts).options(ExecuteOptions::new().with_concurrency(1)).go().await {
        Err(Error::PartialBatchFailure { succeeded, unprocessed, .. }) => {
            println!("{} payments applied, {} to resubmit", succeeded.len(), unprocessed.len());
            store.inject_unprocessed(0);
            payments.batch_put(unprocessed).go().await?;
        },
        other => println!("Unexpected result: {other:?}"),
    }

    // -------------------------------------------------------------------------
    // 3. Load a whole statement in one query
    // -------------------------------------------------------------------------
    let statement = service.collection("statement", item! { "accountId" => "acct-0" }).go().await?;
    for (entity, items) in &statement.data {
        println!("{entity}: {} items", items.len());
    }

    Ok(())
}
