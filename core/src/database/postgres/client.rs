use std::{env, time::Duration};

use async_trait::async_trait;
use bb8::{Pool, PooledConnection, RunError};
use bb8_postgres::PostgresConnectionManager;
use dotenv::dotenv;
use native_tls::TlsConnector;
use postgres_native_tls::MakeTlsConnector;
use tokio::{task, time::timeout};
use tokio_postgres::{config::SslMode, Config, Error as PgError, SimpleQueryMessage};
use tracing::{debug, error, warn};

use crate::database::store::{StoreError, StoreTransaction, TransactionalStore};

type PgConnectionManager = PostgresConnectionManager<MakeTlsConnector>;

pub fn connection_string() -> Result<String, env::VarError> {
    dotenv().ok();
    let connection = env::var("DATABASE_URL")?;
    Ok(connection)
}

#[derive(thiserror::Error, Debug)]
pub enum PostgresConnectionError {
    #[error("The database connection string is wrong please check your environment: {0}")]
    DatabaseConnectionConfigWrong(#[from] env::VarError),

    #[error("Connection pool error: {0}")]
    ConnectionPoolError(#[from] tokio_postgres::Error),

    #[error("Connection pool runtime error: {0}")]
    ConnectionPoolRuntimeError(#[from] RunError<tokio_postgres::Error>),

    #[error("Can not connect to the database please make sure your connection string is correct")]
    CanNotConnectToDatabase,

    #[error("Could not parse connection string make sure it is correctly formatted")]
    CouldNotParseConnectionString,

    #[error("Could not create tls connector")]
    CouldNotCreateTlsConnector,
}

#[derive(thiserror::Error, Debug)]
pub enum PostgresError {
    #[error("PgError {0}")]
    PgError(#[from] PgError),

    #[error("Connection pool error: {0}")]
    ConnectionPoolError(#[from] RunError<tokio_postgres::Error>),

    #[error("Transaction was already finished")]
    TransactionFinished,
}

pub struct PostgresClient {
    pool: Pool<PgConnectionManager>,
}

impl PostgresClient {
    /// Connects using `DATABASE_URL`, loading a `.env` file when present.
    pub async fn new() -> Result<Self, PostgresConnectionError> {
        let connection_str = connection_string()?;
        Self::connect(&connection_str).await
    }

    pub async fn connect(connection_str: &str) -> Result<Self, PostgresConnectionError> {
        async fn _connect(
            connection_str: &str,
            disable_ssl: bool,
        ) -> Result<PostgresClient, PostgresConnectionError> {
            let mut config: Config = connection_str
                .parse()
                .map_err(|_| PostgresConnectionError::CouldNotParseConnectionString)?;

            if disable_ssl {
                config.ssl_mode(SslMode::Disable);
            }

            let connector = TlsConnector::builder()
                .build()
                .map_err(|_| PostgresConnectionError::CouldNotCreateTlsConnector)?;
            let tls_connector = MakeTlsConnector::new(connector);

            let (client, connection) =
                match timeout(Duration::from_millis(5000), config.connect(tls_connector.clone()))
                    .await
                {
                    Ok(Ok((client, connection))) => (client, connection),
                    Ok(Err(e)) => {
                        // retry without ssl if ssl has been attempted and failed
                        if !disable_ssl
                            && config.get_ssl_mode() != SslMode::Disable
                            && !connection_str.contains("sslmode=require")
                        {
                            return Box::pin(_connect(connection_str, true)).await;
                        }
                        error!("Error connecting to database: {}", e);
                        return Err(PostgresConnectionError::CanNotConnectToDatabase);
                    }
                    Err(e) => {
                        error!("Timeout connecting to database: {}", e);
                        return Err(PostgresConnectionError::CanNotConnectToDatabase);
                    }
                };

            let connection_handle = task::spawn(connection);

            if client.simple_query("SELECT 1").await.is_err() {
                return Err(PostgresConnectionError::CanNotConnectToDatabase);
            }

            drop(client);
            match connection_handle.await {
                Ok(Ok(())) => (),
                Ok(Err(_)) => return Err(PostgresConnectionError::CanNotConnectToDatabase),
                Err(_) => return Err(PostgresConnectionError::CanNotConnectToDatabase),
            }

            let manager = PostgresConnectionManager::new(config, tls_connector);
            let pool = Pool::builder().build(manager).await?;

            Ok(PostgresClient { pool })
        }

        _connect(connection_str, false).await
    }

    /// Runs SQL outside of any bulk write, used for schema setup.
    pub async fn batch_execute(&self, sql: &str) -> Result<(), PostgresError> {
        let conn = self.pool.get().await?;
        conn.batch_execute(sql).await.map_err(PostgresError::PgError)
    }
}

#[async_trait]
impl TransactionalStore for PostgresClient {
    async fn begin_transaction(&self) -> Result<Box<dyn StoreTransaction + '_>, StoreError> {
        let conn = self.pool.get_owned().await.map_err(PostgresError::ConnectionPoolError)?;
        conn.batch_execute("BEGIN").await.map_err(PostgresError::PgError)?;

        Ok(Box::new(PostgresTransaction { conn: Some(conn) }))
    }
}

/// A transaction pinned to one pooled connection for its whole lifetime.
pub struct PostgresTransaction {
    conn: Option<PooledConnection<'static, PgConnectionManager>>,
}

impl PostgresTransaction {
    async fn finish(&mut self, sql: &str) -> Result<(), PostgresError> {
        let conn = self.conn.take().ok_or(PostgresError::TransactionFinished)?;
        conn.batch_execute(sql).await.map_err(PostgresError::PgError)
    }
}

#[async_trait]
impl StoreTransaction for PostgresTransaction {
    async fn execute_statement(&mut self, sql: &str) -> Result<u64, StoreError> {
        let conn = self.conn.as_ref().ok_or(PostgresError::TransactionFinished)?;
        let messages = conn.simple_query(sql).await.map_err(PostgresError::PgError)?;

        let rows_affected = messages
            .iter()
            .map(|message| match message {
                SimpleQueryMessage::CommandComplete(rows) => *rows,
                _ => 0,
            })
            .sum();

        Ok(rows_affected)
    }

    async fn commit(mut self: Box<Self>) -> Result<(), StoreError> {
        Ok(self.finish("COMMIT").await?)
    }

    async fn rollback(mut self: Box<Self>) -> Result<(), StoreError> {
        Ok(self.finish("ROLLBACK").await?)
    }
}

impl Drop for PostgresTransaction {
    fn drop(&mut self) {
        let Some(conn) = self.conn.take() else {
            return;
        };

        // the connection would otherwise go back to the pool mid transaction
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                debug!("Transaction dropped while open, rolling back");
                handle.spawn(async move {
                    if let Err(e) = conn.batch_execute("ROLLBACK").await {
                        error!("Error rolling back abandoned transaction: {}", e);
                    }
                });
            }
            Err(_) => warn!("Transaction dropped outside of a runtime, connection left open"),
        }
    }
}
