use std::time::Duration;

use async_trait::async_trait;

use crate::database::{postgres::client::PostgresError, sqlite::client::SqliteError};

#[derive(thiserror::Error, Debug)]
pub enum StoreError {
    #[error("{0}")]
    Postgres(#[from] PostgresError),

    #[error("{0}")]
    Sqlite(#[from] SqliteError),

    #[error("Statement did not complete within {0:?}")]
    Timeout(Duration),

    #[error("Store rejected the operation: {0}")]
    Rejected(String),
}

/// A relational store able to open transactions that run raw SQL text.
#[async_trait]
pub trait TransactionalStore: Send + Sync {
    async fn begin_transaction(&self) -> Result<Box<dyn StoreTransaction + '_>, StoreError>;
}

/// An open transaction. Dropping it without calling [`commit`](StoreTransaction::commit) or
/// [`rollback`](StoreTransaction::rollback) must leave nothing committed.
#[async_trait]
pub trait StoreTransaction: Send {
    /// Runs one statement text, which may hold several `;` separated statements, and returns the
    /// number of rows it affected.
    async fn execute_statement(&mut self, sql: &str) -> Result<u64, StoreError>;

    async fn commit(self: Box<Self>) -> Result<(), StoreError>;

    async fn rollback(self: Box<Self>) -> Result<(), StoreError>;
}

#[async_trait]
impl<S: TransactionalStore + ?Sized> TransactionalStore for std::sync::Arc<S> {
    async fn begin_transaction(&self) -> Result<Box<dyn StoreTransaction + '_>, StoreError> {
        (**self).begin_transaction().await
    }
}
