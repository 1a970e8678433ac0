use std::{env, path::PathBuf, sync::Arc};

use async_trait::async_trait;
use dotenv::dotenv;
use rusqlite::{types::ValueRef, Batch, Connection};
use tokio::sync::{oneshot, Mutex, OwnedMutexGuard};
use tracing::{debug, error, info, warn};

use crate::database::{
    sql_value::SqlValue,
    store::{StoreError, StoreTransaction, TransactionalStore},
};

pub fn connection_string() -> Result<String, env::VarError> {
    dotenv().ok();
    // Default to ./bulkwrite.db if DATABASE_URL is not set
    let connection = env::var("DATABASE_URL").unwrap_or_else(|_| "./bulkwrite.db".to_string());
    Ok(connection)
}

#[derive(thiserror::Error, Debug)]
pub enum SqliteConnectionError {
    #[error("The database connection string is wrong please check your environment: {0}")]
    DatabaseConnectionConfigWrong(#[from] env::VarError),

    #[error("SQLite error: {0}")]
    SqliteError(#[from] SqliteError),

    #[error("Can not connect to the database please make sure your connection string is correct")]
    CanNotConnectToDatabase,
}

#[derive(thiserror::Error, Debug)]
pub enum SqliteError {
    #[error("SQLite error: {0}")]
    SqliteError(#[from] rusqlite::Error),

    #[error("SQLite task failed: {0}")]
    TaskFailed(String),

    #[error("Transaction was already finished")]
    TransactionFinished,
}

/// One row returned by [`SqliteClient::query_rows`], columns kept in select order.
#[derive(Debug, Clone, PartialEq)]
pub struct ResultRow {
    pub columns: Vec<(String, SqlValue)>,
}

impl ResultRow {
    pub fn get(&self, column: &str) -> Option<&SqlValue> {
        self.columns.iter().find(|(name, _)| name == column).map(|(_, value)| value)
    }
}

/// A single SQLite connection shared behind an async mutex. A transaction holds the lock from
/// begin until commit or rollback, so writes never interleave.
#[derive(Clone)]
pub struct SqliteClient {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteClient {
    /// Opens the database named by `DATABASE_URL`, `./bulkwrite.db` when unset.
    pub async fn new() -> Result<Self, SqliteConnectionError> {
        let connection_str = connection_string()?;
        Self::open(connection_str).await
    }

    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, SqliteConnectionError> {
        let db_path = path.into();
        info!("Connecting to SQLite database at: {}", db_path.display());

        let conn = tokio::task::spawn_blocking(move || {
            if let Some(parent) = db_path.parent() {
                if !parent.as_os_str().is_empty() && !parent.exists() {
                    std::fs::create_dir_all(parent).map_err(|e| {
                        error!("Failed to create parent directories for SQLite database: {}", e);
                        SqliteConnectionError::CanNotConnectToDatabase
                    })?;
                }
            }

            let conn = Connection::open(&db_path).map_err(|e| {
                error!("Error connecting to SQLite database: {}", e);
                SqliteConnectionError::CanNotConnectToDatabase
            })?;

            conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;").map_err(
                |e| {
                    error!("Error setting SQLite pragmas: {}", e);
                    SqliteConnectionError::CanNotConnectToDatabase
                },
            )?;

            info!("Successfully connected to SQLite database");
            Ok::<Connection, SqliteConnectionError>(conn)
        })
        .await
        .map_err(|_| SqliteConnectionError::CanNotConnectToDatabase)??;

        Ok(Self::from_connection(conn))
    }

    pub fn open_in_memory() -> Result<Self, SqliteError> {
        Ok(Self::from_connection(Connection::open_in_memory()?))
    }

    pub fn from_connection(conn: Connection) -> Self {
        SqliteClient { conn: Arc::new(Mutex::new(conn)) }
    }

    /// Runs SQL outside of any bulk write, used for schema setup.
    pub async fn batch_execute(&self, sql: &str) -> Result<(), SqliteError> {
        let sql = sql.to_string();
        self.with_connection(move |conn| conn.execute_batch(&sql)).await
    }

    pub async fn query_rows(&self, sql: &str) -> Result<Vec<ResultRow>, SqliteError> {
        let sql = sql.to_string();
        self.with_connection(move |conn| {
            let mut stmt = conn.prepare(&sql)?;
            let names: Vec<String> =
                stmt.column_names().into_iter().map(|name| name.to_string()).collect();

            let mut rows = stmt.query([])?;
            let mut result = Vec::new();
            while let Some(row) = rows.next()? {
                let mut columns = Vec::with_capacity(names.len());
                for (i, name) in names.iter().enumerate() {
                    columns.push((name.clone(), read_value(row.get_ref(i)?)));
                }
                result.push(ResultRow { columns });
            }

            Ok(result)
        })
        .await
    }

    async fn with_connection<T, F>(&self, f: F) -> Result<T, SqliteError>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T, rusqlite::Error> + Send + 'static,
    {
        let guard = Arc::clone(&self.conn).lock_owned().await;
        tokio::task::spawn_blocking(move || f(&guard))
            .await
            .map_err(|e| SqliteError::TaskFailed(e.to_string()))?
            .map_err(SqliteError::SqliteError)
    }
}

fn read_value(value: ValueRef<'_>) -> SqlValue {
    match value {
        ValueRef::Null => SqlValue::Null,
        ValueRef::Integer(value) => SqlValue::I64(value),
        ValueRef::Real(value) => SqlValue::F64(value),
        ValueRef::Text(text) => SqlValue::String(String::from_utf8_lossy(text).into_owned()),
        ValueRef::Blob(bytes) => SqlValue::Bytes(bytes.to_vec()),
    }
}

/// Runs every statement of `sql` in order and sums the rows each one changed.
fn execute_all(conn: &Connection, sql: &str) -> Result<u64, rusqlite::Error> {
    let mut batch = Batch::new(conn, sql);
    let mut rows_affected = 0u64;

    while let Some(mut stmt) = batch.next()? {
        rows_affected += stmt.execute([])? as u64;
    }

    Ok(rows_affected)
}

type ConnectionGuard = OwnedMutexGuard<Connection>;

/// Ends a transaction left open on `conn`, if any.
fn rollback_open_transaction(conn: &Connection) {
    if conn.is_autocommit() {
        return;
    }

    if let Err(e) = conn.execute_batch("ROLLBACK") {
        error!("Error rolling back abandoned SQLite transaction: {}", e);
    }
}

/// The connection handed back by a statement task. Dropped unclaimed, when the caller stopped
/// waiting for the statement, it rolls the transaction back before releasing the lock.
struct ReturnedGuard(Option<ConnectionGuard>);

impl Drop for ReturnedGuard {
    fn drop(&mut self) {
        if let Some(guard) = self.0.take() {
            rollback_open_transaction(&guard);
        }
    }
}

async fn run_blocking<T, F>(
    guard: ConnectionGuard,
    f: F,
) -> Result<(ConnectionGuard, T), SqliteError>
where
    T: Send + 'static,
    F: FnOnce(&Connection) -> Result<T, rusqlite::Error> + Send + 'static,
{
    tokio::task::spawn_blocking(move || {
        let result = f(&guard);
        (guard, result)
    })
    .await
    .map_err(|e| SqliteError::TaskFailed(e.to_string()))
    .and_then(|(guard, result)| Ok((guard, result?)))
}

#[async_trait]
impl TransactionalStore for SqliteClient {
    async fn begin_transaction(&self) -> Result<Box<dyn StoreTransaction + '_>, StoreError> {
        let guard = Arc::clone(&self.conn).lock_owned().await;

        let (guard, _) = run_blocking(guard, |conn| {
            // a previous transaction abandoned mid-flight
            if !conn.is_autocommit() {
                warn!("SQLite connection was left inside a transaction, rolling it back");
                conn.execute_batch("ROLLBACK")?;
            }
            conn.execute_batch("BEGIN")
        })
        .await?;

        Ok(Box::new(SqliteTransaction { guard: Some(guard) }))
    }
}

pub struct SqliteTransaction {
    guard: Option<ConnectionGuard>,
}

impl SqliteTransaction {
    async fn finish(&mut self, sql: &'static str) -> Result<(), SqliteError> {
        let guard = self.guard.take().ok_or(SqliteError::TransactionFinished)?;
        run_blocking(guard, move |conn| {
            let result = conn.execute_batch(sql);
            // a failed COMMIT (deferred foreign keys, busy) keeps the transaction open
            if result.is_err() {
                rollback_open_transaction(conn);
            }
            result
        })
        .await?;
        Ok(())
    }
}

#[async_trait]
impl StoreTransaction for SqliteTransaction {
    async fn execute_statement(&mut self, sql: &str) -> Result<u64, StoreError> {
        let guard = self.guard.take().ok_or(SqliteError::TransactionFinished)?;
        let sql = sql.to_string();
        let (sender, receiver) = oneshot::channel();

        tokio::task::spawn_blocking(move || {
            let result = execute_all(&guard, &sql);
            if sender.send((ReturnedGuard(Some(guard)), result)).is_err() {
                debug!("SQLite statement finished after its caller stopped waiting, rolled back");
            }
        });

        let (mut returned, result) = receiver
            .await
            .map_err(|_| SqliteError::TaskFailed("statement task ended without a result".into()))?;

        self.guard = returned.0.take();
        Ok(result.map_err(SqliteError::SqliteError)?)
    }

    async fn commit(mut self: Box<Self>) -> Result<(), StoreError> {
        Ok(self.finish("COMMIT").await?)
    }

    async fn rollback(mut self: Box<Self>) -> Result<(), StoreError> {
        if self.guard.is_none() {
            // an interrupted statement hands its rollback to the returned guard
            debug!("SQLite transaction already released, nothing to roll back");
            return Ok(());
        }
        Ok(self.finish("ROLLBACK").await?)
    }
}

impl Drop for SqliteTransaction {
    fn drop(&mut self) {
        if let Some(guard) = self.guard.take() {
            rollback_open_transaction(&guard);
        }
    }
}
