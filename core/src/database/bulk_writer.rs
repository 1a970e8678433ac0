use std::{any::type_name, num::NonZeroUsize, sync::Arc, time::Instant};

use futures::{stream, StreamExt, TryStreamExt};
use tokio::task;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    database::{
        batch_operations::{
            batch_count, partition, BatchOperationType, GeneratedStatement, WriteResult,
            WriteState,
        },
        change_set::ChangeSet,
        errors::{BulkWriteError, ExecutionError},
        generate::generate_statement,
        metadata::{Entity, EntityMetadata, MetadataResolver},
        store::{StoreError, StoreTransaction, TransactionalStore},
    },
    helpers::sql_preview,
    manifest::{config::BulkWriteConfig, core::Manifest},
};

const SQL_PREVIEW_CHARS: usize = 240;

pub(crate) fn non_zero_batch_size(batch_size: usize) -> Result<NonZeroUsize, BulkWriteError> {
    NonZeroUsize::new(batch_size).ok_or(BulkWriteError::InvalidBatchSize)
}

/// Generates one statement per non-empty batch on the blocking pool, at most `concurrency`
/// batches at a time. Statements come back in batch order and the first failing batch in that
/// order aborts the whole generation.
pub(crate) async fn generate_statements<E: Entity>(
    entities: Arc<[E]>,
    metadata: Arc<EntityMetadata<E>>,
    operation: BatchOperationType,
    batch_size: NonZeroUsize,
    first_batch_id: usize,
    concurrency: usize,
) -> Result<Vec<GeneratedStatement>, BulkWriteError> {
    let batches = partition(entities.len(), batch_size, first_batch_id);

    let statements: Vec<Option<GeneratedStatement>> =
        stream::iter(batches.into_iter().map(|batch| {
            let entities = Arc::clone(&entities);
            let metadata = Arc::clone(&metadata);

            async move {
                let batch_id = batch.id;
                task::spawn_blocking(move || {
                    generate_statement(&entities, &batch, operation, &metadata)
                })
                .await
                .map_err(|e| BulkWriteError::GenerationTaskFailed(e.to_string()))?
                .map_err(|source| BulkWriteError::Generation { batch_id, source })
            }
        }))
        .buffered(concurrency.max(1))
        .try_collect()
        .await?;

    Ok(statements.into_iter().flatten().collect())
}

/// Tracks one invocation through its states for logging.
pub(crate) struct WriteProgress {
    label: String,
    state: WriteState,
    started: Instant,
}

impl WriteProgress {
    pub(crate) fn new(label: String) -> Self {
        WriteProgress { label, state: WriteState::Idle, started: Instant::now() }
    }

    pub(crate) fn transition(&mut self, next: WriteState) {
        if !self.state.can_transition_to(next) {
            warn!("{} - unexpected state change {:?} -> {:?}", self.label, self.state, next);
        }
        debug!("{} - {:?} -> {:?}", self.label, self.state, next);
        self.state = next;
    }

    pub(crate) fn state(&self) -> WriteState {
        self.state
    }
}

/// Batched bulk writes of entities into a transactional store.
///
/// Every call runs in exactly one transaction: it either commits all of its statements or none
/// of them. Statement generation runs in parallel, execution is sequential on the connection that
/// owns the transaction. Metadata resolved by one call is reused by later calls on the same
/// writer, and by any other writer sharing the resolver.
pub struct BulkWriter<S> {
    store: S,
    resolver: Arc<MetadataResolver>,
    config: BulkWriteConfig,
}

impl<S: TransactionalStore> BulkWriter<S> {
    pub fn new(store: S) -> Self {
        Self::with_config(store, BulkWriteConfig::default())
    }

    pub fn with_config(store: S, config: BulkWriteConfig) -> Self {
        let resolver = Arc::new(MetadataResolver::new(config.column_naming));
        BulkWriter { store, resolver, config }
    }

    /// Uses the manifest's config and its entity mappings as metadata overrides.
    pub fn from_manifest(store: S, manifest: &Manifest) -> Self {
        let config = manifest.config();
        let resolver = MetadataResolver::new(config.column_naming)
            .with_mappings(manifest.entities.iter().cloned());

        BulkWriter { store, resolver: Arc::new(resolver), config }
    }

    /// Shares a metadata cache with other writers.
    pub fn with_resolver(mut self, resolver: Arc<MetadataResolver>) -> Self {
        self.resolver = resolver;
        self
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn resolver(&self) -> &Arc<MetadataResolver> {
        &self.resolver
    }

    pub fn config(&self) -> &BulkWriteConfig {
        &self.config
    }

    pub async fn insert<E: Entity>(
        &self,
        entities: impl Into<Arc<[E]>>,
    ) -> Result<WriteResult, BulkWriteError> {
        self.bulk_write(entities, BatchOperationType::Insert, self.config.batch_size).await
    }

    pub async fn update<E: Entity>(
        &self,
        entities: impl Into<Arc<[E]>>,
    ) -> Result<WriteResult, BulkWriteError> {
        self.bulk_write(entities, BatchOperationType::Update, self.config.batch_size).await
    }

    pub async fn delete<E: Entity>(
        &self,
        entities: impl Into<Arc<[E]>>,
    ) -> Result<WriteResult, BulkWriteError> {
        self.bulk_write(entities, BatchOperationType::Delete, self.config.batch_size).await
    }

    pub async fn bulk_write<E: Entity>(
        &self,
        entities: impl Into<Arc<[E]>>,
        operation: BatchOperationType,
        batch_size: usize,
    ) -> Result<WriteResult, BulkWriteError> {
        self.bulk_write_cancellable(entities, operation, batch_size, CancellationToken::new())
            .await
    }

    /// As [`bulk_write`](Self::bulk_write), observing `cancel` before the transaction opens,
    /// before and while every statement runs, and before commit. A cancellation seen after the
    /// transaction opened abandons the running statement and rolls the transaction back.
    pub async fn bulk_write_cancellable<E: Entity>(
        &self,
        entities: impl Into<Arc<[E]>>,
        operation: BatchOperationType,
        batch_size: usize,
        cancel: CancellationToken,
    ) -> Result<WriteResult, BulkWriteError> {
        let entities: Arc<[E]> = entities.into();
        let batch_size = non_zero_batch_size(batch_size)?;

        if entities.is_empty() {
            debug!("{} of {} - nothing to write", operation, type_name::<E>());
            return Ok(WriteResult::empty());
        }

        let metadata = self.resolver.resolve::<E>()?;
        metadata.ensure_supports(operation)?;

        let mut progress =
            WriteProgress::new(format!("{} of {}", operation, metadata.entity_name));

        progress.transition(WriteState::Batching);
        let batches = batch_count(entities.len(), batch_size);
        info!(
            "{} - {} rows in {} batches of up to {}",
            progress.label,
            entities.len(),
            batches,
            batch_size
        );

        progress.transition(WriteState::Generating);
        let statements = generate_statements(
            entities,
            metadata,
            operation,
            batch_size,
            0,
            self.config.generation_concurrency(),
        )
        .await?;

        self.execute(statements, batches, &cancel, &mut progress).await
    }

    pub async fn write_changes(&self, changes: ChangeSet) -> Result<WriteResult, BulkWriteError> {
        self.write_changes_cancellable(changes, CancellationToken::new()).await
    }

    /// Writes every pending change in one transaction: all inserts, then all updates, then all
    /// deletes, each in the order its entity type was first added.
    pub async fn write_changes_cancellable(
        &self,
        changes: ChangeSet,
        cancel: CancellationToken,
    ) -> Result<WriteResult, BulkWriteError> {
        let batch_size =
            non_zero_batch_size(changes.batch_size().unwrap_or(self.config.batch_size))?;
        if changes.is_empty() {
            debug!("change set - nothing to write");
            return Ok(WriteResult::empty());
        }

        let groups = changes.prepare(&self.resolver)?;
        let mut progress = WriteProgress::new("change set".to_string());

        progress.transition(WriteState::Batching);
        let batches: usize = groups.iter().map(|group| batch_count(group.rows, batch_size)).sum();
        info!(
            "{} - {} rows across {} groups in {} batches of up to {}",
            progress.label,
            groups.iter().map(|group| group.rows).sum::<usize>(),
            groups.len(),
            batches,
            batch_size
        );

        progress.transition(WriteState::Generating);
        let concurrency = self.config.generation_concurrency();
        let mut statements = Vec::new();
        let mut next_batch_id = 0;

        for group in groups {
            debug!(
                "{} - generating {} of {} ({} rows)",
                progress.label, group.operation, group.entity, group.rows
            );
            let first_batch_id = next_batch_id;
            next_batch_id += batch_count(group.rows, batch_size);
            statements.extend((group.generate)(batch_size, first_batch_id, concurrency).await?);
        }

        self.execute(statements, batches, &cancel, &mut progress).await
    }

    async fn execute(
        &self,
        statements: Vec<GeneratedStatement>,
        batches: usize,
        cancel: &CancellationToken,
        progress: &mut WriteProgress,
    ) -> Result<WriteResult, BulkWriteError> {
        if cancel.is_cancelled() {
            warn!("{} - cancelled before the transaction opened", progress.label);
            return Err(BulkWriteError::Cancelled { statements_executed: 0, rollback_error: None });
        }

        progress.transition(WriteState::Executing);
        let mut transaction = self.store.begin_transaction().await.map_err(|e| {
            error!("{} - could not open a transaction: {}", progress.label, e);
            BulkWriteError::Begin(e)
        })?;

        let mut rows_affected = 0u64;
        let mut statements_executed = 0;

        for statement in &statements {
            if cancel.is_cancelled() {
                return Err(self.cancel(transaction, statements_executed, progress).await);
            }

            debug!(
                "{} - executing {} of {} batch {} ({} rows): {}",
                progress.label,
                statement.operation,
                statement.entity,
                statement.batch_id,
                statement.rows,
                sql_preview(&statement.sql, SQL_PREVIEW_CHARS)
            );

            let outcome = tokio::select! {
                result = self.run_statement(transaction.as_mut(), &statement.sql) => result,
                _ = cancel.cancelled() => {
                    return Err(self.cancel(transaction, statements_executed, progress).await);
                }
            };

            match outcome {
                Ok(rows) => {
                    rows_affected += rows;
                    statements_executed += 1;
                }
                Err(source) => {
                    let preview = sql_preview(&statement.sql, SQL_PREVIEW_CHARS).into_owned();
                    error!(
                        "{} - batch {} failed: {}\nFailed query:\n{}",
                        progress.label, statement.batch_id, source, preview
                    );

                    let rollback_error = rollback(transaction, progress).await;
                    return Err(ExecutionError {
                        batch_id: statement.batch_id,
                        operation: statement.operation,
                        entity: statement.entity.clone(),
                        sql_preview: preview,
                        source,
                        rollback_error,
                    }
                    .into());
                }
            }
        }

        if cancel.is_cancelled() {
            return Err(self.cancel(transaction, statements_executed, progress).await);
        }

        if let Err(e) = transaction.commit().await {
            error!("{} - commit failed: {}", progress.label, e);
            progress.transition(WriteState::RolledBack);
            return Err(BulkWriteError::Commit(e));
        }
        progress.transition(WriteState::Committed);

        info!(
            "{} - committed {} statements, {} rows affected in {:?}",
            progress.label,
            statements_executed,
            rows_affected,
            progress.started.elapsed()
        );

        Ok(WriteResult { rows_affected, statements_executed, batches, state: progress.state() })
    }

    async fn run_statement(
        &self,
        transaction: &mut (dyn StoreTransaction + '_),
        sql: &str,
    ) -> Result<u64, StoreError> {
        match self.config.statement_timeout() {
            None => transaction.execute_statement(sql).await,
            Some(limit) => tokio::time::timeout(limit, transaction.execute_statement(sql))
                .await
                .map_err(|_| StoreError::Timeout(limit))?,
        }
    }

    async fn cancel(
        &self,
        transaction: Box<dyn StoreTransaction + '_>,
        statements_executed: usize,
        progress: &mut WriteProgress,
    ) -> BulkWriteError {
        warn!(
            "{} - cancelled after {} statements, rolling back",
            progress.label, statements_executed
        );
        let rollback_error = rollback(transaction, progress).await;
        BulkWriteError::Cancelled { statements_executed, rollback_error }
    }
}

async fn rollback(
    transaction: Box<dyn StoreTransaction + '_>,
    progress: &mut WriteProgress,
) -> Option<StoreError> {
    warn!("{} - rolling back", progress.label);
    let result = transaction.rollback().await;
    progress.transition(WriteState::RolledBack);

    match result {
        Ok(()) => None,
        Err(e) => {
            error!("{} - rollback failed: {}", progress.label, e);
            Some(e)
        }
    }
}
