#![allow(dead_code)]

use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use bulkwrite::{
    async_trait, CancellationToken, Entity, EntityDescriptor, ForeignKey, SqlValue, SqliteClient,
    StoreError, StoreTransaction, TransactionalStore,
};
use chrono::NaiveDateTime;

#[derive(Debug, Clone, PartialEq)]
pub struct TestEntity {
    pub id: i32,
    pub name: String,
}

impl TestEntity {
    pub fn new(id: i32, name: &str) -> Self {
        TestEntity { id, name: name.to_string() }
    }
}

impl Entity for TestEntity {
    fn describe() -> EntityDescriptor<Self> {
        EntityDescriptor::new("TestEntity")
            .table("TestEntities")
            .field("Id", |e: &TestEntity| e.id.into())
            .field("Name", |e: &TestEntity| e.name.as_str().into())
            .primary_key(["Id"])
    }
}

/// Same rows as [`TestEntity`] but written to a table without any constraint.
pub struct LooseEntity {
    pub id: i32,
    pub name: String,
}

impl Entity for LooseEntity {
    fn describe() -> EntityDescriptor<Self> {
        EntityDescriptor::new("LooseEntity")
            .table("loose_entities")
            .field("Id", |e: &LooseEntity| e.id.into())
            .field("Name", |e: &LooseEntity| e.name.as_str().into())
    }
}

pub struct Attachment {
    pub id: i32,
    pub payload: Vec<u8>,
}

impl Entity for Attachment {
    fn describe() -> EntityDescriptor<Self> {
        EntityDescriptor::new("Attachment")
            .table("TestEntities")
            .field("Id", |e: &Attachment| e.id.into())
            .field("Name", |e: &Attachment| e.payload.clone().into())
            .primary_key(["Id"])
    }
}

#[derive(Debug, Clone)]
pub struct Order {
    pub id: i64,
    pub customer: String,
    pub placed_at: NaiveDateTime,
}

impl Entity for Order {
    fn describe() -> EntityDescriptor<Self> {
        EntityDescriptor::new("Order")
            .table("order")
            .field("id", |e: &Order| e.id.into())
            .field("customer", |e: &Order| e.customer.as_str().into())
            .field_as("placedAt", "placed_at", |e: &Order| e.placed_at.into())
            .primary_key(["id"])
    }
}

#[derive(Debug, Clone)]
pub struct OrderItem {
    pub order_id: Option<i64>,
    pub line: i32,
    pub product: String,
    pub quantity: i32,
    pub order: Option<Order>,
}

impl Entity for OrderItem {
    fn describe() -> EntityDescriptor<Self> {
        EntityDescriptor::new("OrderItem")
            .table("order_items")
            .field_as("orderId", "order_id", |e: &OrderItem| e.order_id.into())
            .field("line", |e: &OrderItem| e.line.into())
            .field("product", |e: &OrderItem| e.product.as_str().into())
            .field("quantity", |e: &OrderItem| e.quantity.into())
            .primary_key(["orderId", "line"])
            .foreign_key(
                ForeignKey::new("orderId", "order", "id")
                    .via(|e: &OrderItem| e.order.as_ref().map(|order| order.id.into()))
                    .required(),
            )
    }
}

pub const SCHEMA: &str = r#"
    PRAGMA foreign_keys = ON;
    CREATE TABLE TestEntities (Id INTEGER PRIMARY KEY, Name TEXT);
    CREATE TABLE loose_entities (Id INTEGER, Name TEXT);
    CREATE TABLE "order" (id INTEGER PRIMARY KEY, customer TEXT NOT NULL, placed_at TEXT NOT NULL);
    CREATE TABLE order_items (
        order_id INTEGER NOT NULL REFERENCES "order" (id),
        line INTEGER NOT NULL,
        product TEXT NOT NULL,
        quantity INTEGER NOT NULL,
        PRIMARY KEY (order_id, line)
    );
"#;

pub async fn sqlite_store() -> SqliteClient {
    let client = SqliteClient::open_in_memory().unwrap();
    client.batch_execute(SCHEMA).await.unwrap();
    client
}

pub async fn test_entities(client: &SqliteClient) -> Vec<(i64, Option<String>)> {
    client
        .query_rows("SELECT Id, Name FROM TestEntities ORDER BY Id")
        .await
        .unwrap()
        .into_iter()
        .map(|row| {
            let id = match row.get("Id") {
                Some(SqlValue::I64(id)) => *id,
                other => panic!("unexpected id {other:?}"),
            };
            let name = match row.get("Name") {
                Some(SqlValue::String(name)) => Some(name.clone()),
                _ => None,
            };
            (id, name)
        })
        .collect()
}

pub async fn count(client: &SqliteClient, table: &str) -> i64 {
    let rows = client.query_rows(&format!("SELECT COUNT(*) AS n FROM {table}")).await.unwrap();
    match rows[0].get("n") {
        Some(SqlValue::I64(n)) => *n,
        other => panic!("unexpected count {other:?}"),
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Begin,
    Execute(String),
    Commit,
    Rollback,
}

/// Records every call made against it, with switches to make individual calls fail.
#[derive(Default)]
pub struct RecordingStore {
    pub events: Arc<Mutex<Vec<Event>>>,
    /// 1-based index of the statement to reject.
    pub fail_on_statement: Option<usize>,
    pub fail_rollback: bool,
    pub fail_commit: bool,
    /// Cancels the token while executing the given 1-based statement.
    pub cancel_on_statement: Option<(usize, CancellationToken)>,
    pub statement_delay: Option<Duration>,
}

impl RecordingStore {
    pub fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }

    pub fn executed(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                Event::Execute(sql) => Some(sql),
                _ => None,
            })
            .collect()
    }

    fn record(&self, event: Event) {
        self.events.lock().unwrap().push(event);
    }
}

#[async_trait]
impl TransactionalStore for RecordingStore {
    async fn begin_transaction(&self) -> Result<Box<dyn StoreTransaction + '_>, StoreError> {
        self.record(Event::Begin);
        Ok(Box::new(RecordingTransaction { store: self, executed: 0 }))
    }
}

struct RecordingTransaction<'a> {
    store: &'a RecordingStore,
    executed: usize,
}

#[async_trait]
impl StoreTransaction for RecordingTransaction<'_> {
    async fn execute_statement(&mut self, sql: &str) -> Result<u64, StoreError> {
        self.store.record(Event::Execute(sql.to_string()));
        self.executed += 1;

        if let Some((n, token)) = &self.store.cancel_on_statement {
            if *n == self.executed {
                token.cancel();
            }
        }

        if let Some(delay) = self.store.statement_delay {
            tokio::time::sleep(delay).await;
        }

        if self.store.fail_on_statement == Some(self.executed) {
            return Err(StoreError::Rejected("UNIQUE constraint failed".to_string()));
        }

        Ok(sql.matches(';').count() as u64)
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        self.store.record(Event::Commit);
        if self.store.fail_commit {
            return Err(StoreError::Rejected("commit refused".to_string()));
        }
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        self.store.record(Event::Rollback);
        if self.store.fail_rollback {
            return Err(StoreError::Rejected("connection lost".to_string()));
        }
        Ok(())
    }
}
