// public
pub mod manifest;

mod database;
pub use database::{
    batch_operations::{
        BatchOperationType, GeneratedStatement, WriteResult, WriteState, DEFAULT_BATCH_SIZE,
    },
    bulk_writer::BulkWriter,
    change_set::ChangeSet,
    errors::{BulkWriteError, ExecutionError, GenerationError, MetadataError},
    generate::{
        format_table_name, generate_delete_sql, generate_insert_sql, generate_statement,
        generate_update_sql, quote_identifier,
    },
    metadata::{
        ColumnMapping, Entity, EntityDescriptor, EntityMetadata, ForeignKey, ForeignKeyMapping,
        MetadataResolver,
    },
    postgres::client::{PostgresClient, PostgresConnectionError, PostgresError},
    sql_value::{format_value, FormatError, SqlValue},
    sqlite::client::{ResultRow, SqliteClient, SqliteConnectionError, SqliteError},
    store::{StoreError, StoreTransaction, TransactionalStore},
};
pub use database::batch_operations::{batch_count, partition, Batch};

mod helpers;
pub use helpers::{camel_to_snake, sql_preview};

mod logger;
pub use logger::{setup_info_logger, setup_logger};

// export 3rd party dependencies
pub use async_trait::async_trait;
pub use tokio_util::sync::CancellationToken;
pub use tracing::level_filters::LevelFilter;
