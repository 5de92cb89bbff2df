//! Fixtures shared by the integration tests: a billing service with
//! invoices and payments sharing one table and one collection.

#![allow(dead_code, clippy::unwrap_used, clippy::expect_used, clippy::disallowed_methods)]

use std::sync::Arc;

use tessera::{
    Entity, Service, Store, TableConfig,
    mock::{MockStore, TableLayout},
    schema::{Attribute, Index, Model, Schema},
};
use tessera_types::config::BatchConfig;

pub const TABLE: &str = "ledger";

pub fn layout() -> TableLayout {
    TableLayout::new("pk", Some("sk"))
        .with_index("gsi1", "gsi1pk", Some("gsi1sk"))
        .with_index("gsi2", "gsi2pk", Some("gsi2sk"))
}

pub fn store() -> Arc<MockStore> {
    Arc::new(MockStore::new(layout()))
}

pub fn config() -> TableConfig {
    TableConfig::builder().with_table(TABLE).build().unwrap()
}

pub fn config_with_batch(batch: BatchConfig) -> TableConfig {
    TableConfig::builder().with_table(TABLE).with_batch(batch).build().unwrap()
}

pub fn invoice_schema() -> Schema {
    Schema::new(Model::new("billing", "invoice", "1"))
        .attribute(Attribute::string("accountId").required())
        .attribute(Attribute::string("invoiceId").required())
        .attribute(Attribute::enumeration("status", ["open", "paid", "void"]).default_value("open"))
        .attribute(Attribute::string("createdAt").required())
        .attribute(Attribute::number("amount").required())
        .attribute(Attribute::list("notes"))
        .index(Index::table("byId").pk("pk", ["invoiceId"]).sk("sk", ["accountId"]))
        .index(
            Index::secondary("byAccount", "gsi1")
                .pk("gsi1pk", ["accountId"])
                .sk("gsi1sk", ["invoiceId"])
                .collection("statement"),
        )
        .index(
            Index::secondary("byStatus", "gsi2")
                .pk("gsi2pk", ["accountId"])
                .sk("gsi2sk", ["status", "createdAt"]),
        )
}

pub fn payment_schema() -> Schema {
    Schema::new(Model::new("billing", "payment", "1"))
        .attribute(Attribute::string("accountId").required())
        .attribute(Attribute::string("paymentId").required())
        .attribute(Attribute::string("invoiceId"))
        .attribute(Attribute::number("amount").required())
        .index(Index::table("byId").pk("pk", ["paymentId"]).sk("sk", ["accountId"]))
        .index(
            Index::secondary("byAccount", "gsi1")
                .pk("gsi1pk", ["accountId"])
                .sk("gsi1sk", ["paymentId"])
                .collection("statement"),
        )
}

pub fn invoices(store: &Arc<MockStore>) -> Entity {
    Entity::new(invoice_schema(), Arc::clone(store) as Arc<dyn Store>, config()).unwrap()
}

pub fn payments(store: &Arc<MockStore>) -> Entity {
    Entity::new(payment_schema(), Arc::clone(store) as Arc<dyn Store>, config()).unwrap()
}

pub fn service(store: &Arc<MockStore>) -> Service {
    Service::builder("billing").entity(invoices(store)).entity(payments(store)).build().unwrap()
}
