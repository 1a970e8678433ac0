use crate::database::{
    batch_operations::BatchOperationType, sql_value::FormatError, store::StoreError,
};

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum MetadataError {
    #[error("Entity {entity} has no table mapping")]
    NoTableMapping { entity: String },

    #[error("Entity {entity} declares no columns")]
    NoColumns { entity: String },

    #[error("Entity {entity} declares field {field} more than once")]
    DuplicateField { entity: String, field: String },

    #[error("Entity {entity} maps more than one field to column {column}")]
    DuplicateColumn { entity: String, column: String },

    #[error("Primary key field {field} of entity {entity} is not a declared field")]
    PrimaryKeyNotFound { entity: String, field: String },

    #[error("Foreign key field {field} of entity {entity} is not a declared field")]
    ForeignKeyFieldNotFound { entity: String, field: String },

    #[error("Column override names unknown field {field} of entity {entity}")]
    UnknownOverrideField { entity: String, field: String },

    #[error("Entity {entity} has no primary key, {operation} needs one to target rows")]
    NoPrimaryKey { entity: String, operation: BatchOperationType },

    #[error("Entity {entity} has no non-key columns to update")]
    NoUpdatableColumns { entity: String },

    #[error("Cached metadata for entity {entity} does not match its type")]
    CacheTypeMismatch { entity: String },
}

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum GenerationError {
    #[error("Could not format {entity}.{field} (column {column}) of row {row}: {source}")]
    Format {
        entity: String,
        field: String,
        column: String,
        row: usize,
        #[source]
        source: FormatError,
    },

    #[error("Key column {column} of {entity} row {row} is NULL so the row can not be targeted")]
    NullKey { entity: String, column: String, row: usize },

    #[error(
        "Foreign key {column} of {entity} row {row} could not be resolved to a {referenced_table}.{referenced_column} value"
    )]
    UnresolvedForeignKey {
        entity: String,
        column: String,
        referenced_table: String,
        referenced_column: String,
        row: usize,
    },
}

/// A statement rejected by the store, with enough context to find the batch it came from.
#[derive(thiserror::Error, Debug)]
#[error("{operation} of {entity} failed in batch {batch_id}: {source}")]
pub struct ExecutionError {
    pub batch_id: usize,
    pub operation: BatchOperationType,
    pub entity: String,
    pub sql_preview: String,
    #[source]
    pub source: StoreError,
    /// Set when the rollback that followed the failure also failed.
    pub rollback_error: Option<StoreError>,
}

#[derive(thiserror::Error, Debug)]
pub enum BulkWriteError {
    #[error("Batch size must be a positive integer")]
    InvalidBatchSize,

    #[error("{0}")]
    Metadata(#[from] MetadataError),

    #[error("Statement generation failed for batch {batch_id}: {source}")]
    Generation {
        batch_id: usize,
        #[source]
        source: GenerationError,
    },

    #[error("Statement generation task failed: {0}")]
    GenerationTaskFailed(String),

    #[error("Could not open a transaction: {0}")]
    Begin(#[source] StoreError),

    #[error("{0}")]
    Execution(#[from] Box<ExecutionError>),

    #[error("Commit failed: {0}")]
    Commit(#[source] StoreError),

    #[error("Bulk write cancelled after {statements_executed} statements, nothing was committed")]
    Cancelled { statements_executed: usize, rollback_error: Option<StoreError> },
}

impl BulkWriteError {
    /// Errors raised before any statement reached the store.
    pub fn is_pre_execution(&self) -> bool {
        matches!(
            self,
            BulkWriteError::InvalidBatchSize
                | BulkWriteError::Metadata(_)
                | BulkWriteError::Generation { .. }
                | BulkWriteError::GenerationTaskFailed(_)
        )
    }

    pub fn execution(&self) -> Option<&ExecutionError> {
        match self {
            BulkWriteError::Execution(error) => Some(error),
            _ => None,
        }
    }
}

impl From<ExecutionError> for BulkWriteError {
    fn from(error: ExecutionError) -> Self {
        BulkWriteError::Execution(Box::new(error))
    }
}
