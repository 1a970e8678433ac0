//! Pending inserts, updates and deletes of several entity types, written together.

use std::{
    any::{Any, TypeId},
    num::NonZeroUsize,
    sync::Arc,
};

use futures::future::BoxFuture;

use crate::database::{
    batch_operations::{BatchOperationType, GeneratedStatement},
    bulk_writer::generate_statements,
    errors::{BulkWriteError, MetadataError},
    metadata::{Entity, MetadataResolver},
};

type GenerateGroup = Box<
    dyn FnOnce(
            NonZeroUsize,
            usize,
            usize,
        ) -> BoxFuture<'static, Result<Vec<GeneratedStatement>, BulkWriteError>>
        + Send,
>;

/// A group whose metadata is resolved and checked, ready to generate.
pub(crate) struct PreparedGroup {
    pub operation: BatchOperationType,
    pub entity: String,
    pub rows: usize,
    /// Called with the batch size, the first batch id and the generation concurrency.
    pub generate: GenerateGroup,
}

trait PendingGroup: Send {
    fn operation(&self) -> BatchOperationType;

    fn entity_type(&self) -> TypeId;

    fn len(&self) -> usize;

    fn as_any_mut(&mut self) -> &mut dyn Any;

    fn prepare(self: Box<Self>, resolver: &MetadataResolver)
        -> Result<PreparedGroup, MetadataError>;
}

struct TypedGroup<E> {
    operation: BatchOperationType,
    entities: Vec<E>,
}

impl<E: Entity> PendingGroup for TypedGroup<E> {
    fn operation(&self) -> BatchOperationType {
        self.operation
    }

    fn entity_type(&self) -> TypeId {
        TypeId::of::<E>()
    }

    fn len(&self) -> usize {
        self.entities.len()
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }

    fn prepare(
        self: Box<Self>,
        resolver: &MetadataResolver,
    ) -> Result<PreparedGroup, MetadataError> {
        let metadata = resolver.resolve::<E>()?;
        metadata.ensure_supports(self.operation)?;

        let operation = self.operation;
        let rows = self.entities.len();
        let entity = metadata.entity_name.clone();
        let entities: Arc<[E]> = self.entities.into();

        Ok(PreparedGroup {
            operation,
            entity,
            rows,
            generate: Box::new(move |batch_size, first_batch_id, concurrency| {
                Box::pin(generate_statements(
                    entities,
                    metadata,
                    operation,
                    batch_size,
                    first_batch_id,
                    concurrency,
                ))
            }),
        })
    }
}

fn execution_rank(operation: BatchOperationType) -> u8 {
    match operation {
        BatchOperationType::Insert => 0,
        BatchOperationType::Update => 1,
        BatchOperationType::Delete => 2,
    }
}

/// Entities of any number of types queued for insert, update or delete.
///
/// Entities are grouped by operation and type: adding more entities of a type already queued for
/// the same operation appends to that group. Written with
/// [`BulkWriter::write_changes`](crate::BulkWriter::write_changes), inserts run first, then
/// updates, then deletes, and each of those in the order the types were first added. Parents must
/// therefore be added before their children for inserts.
#[derive(Default)]
pub struct ChangeSet {
    groups: Vec<Box<dyn PendingGroup>>,
    batch_size: Option<usize>,
}

impl ChangeSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Overrides the writer's configured batch size for this change set.
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = Some(batch_size);
        self
    }

    pub fn batch_size(&self) -> Option<usize> {
        self.batch_size
    }

    pub fn insert<E: Entity>(&mut self, entities: impl IntoIterator<Item = E>) -> &mut Self {
        self.add(BatchOperationType::Insert, entities)
    }

    pub fn update<E: Entity>(&mut self, entities: impl IntoIterator<Item = E>) -> &mut Self {
        self.add(BatchOperationType::Update, entities)
    }

    pub fn delete<E: Entity>(&mut self, entities: impl IntoIterator<Item = E>) -> &mut Self {
        self.add(BatchOperationType::Delete, entities)
    }

    pub fn add<E: Entity>(
        &mut self,
        operation: BatchOperationType,
        entities: impl IntoIterator<Item = E>,
    ) -> &mut Self {
        let existing = self.groups.iter_mut().find(|group| {
            group.operation() == operation && group.entity_type() == TypeId::of::<E>()
        });

        match existing.and_then(|group| group.as_any_mut().downcast_mut::<TypedGroup<E>>()) {
            Some(group) => group.entities.extend(entities),
            None => self
                .groups
                .push(Box::new(TypedGroup { operation, entities: entities.into_iter().collect() })),
        }

        self
    }

    /// Total number of queued entities.
    pub fn len(&self) -> usize {
        self.groups.iter().map(|group| group.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn group_count(&self) -> usize {
        self.groups.len()
    }

    /// Resolves every non-empty group in execution order. Nothing is generated when any group's
    /// metadata is unusable.
    pub(crate) fn prepare(
        self,
        resolver: &MetadataResolver,
    ) -> Result<Vec<PreparedGroup>, MetadataError> {
        let mut groups: Vec<Box<dyn PendingGroup>> =
            self.groups.into_iter().filter(|group| group.len() > 0).collect();
        groups.sort_by_key(|group| execution_rank(group.operation()));

        groups.into_iter().map(|group| group.prepare(resolver)).collect()
    }
}

impl std::fmt::Debug for ChangeSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChangeSet")
            .field("groups", &self.groups.len())
            .field("entities", &self.len())
            .field("batch_size", &self.batch_size)
            .finish()
    }
}
