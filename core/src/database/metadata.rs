//! Entity-to-table mapping and the per-engine metadata cache.
//!
//! Entity types describe themselves once through [`Entity::describe`]. The [`MetadataResolver`]
//! validates that description, applies manifest overrides and the configured column naming, and
//! memoizes the result per type for as long as the resolver lives.

use std::{
    any::{type_name, Any, TypeId},
    collections::{BTreeMap, HashMap, HashSet},
    fmt,
    sync::{Arc, PoisonError, RwLock},
};

use once_cell::sync::OnceCell;
use tracing::debug;

use crate::database::{
    batch_operations::BatchOperationType, errors::MetadataError, sql_value::SqlValue,
};
use crate::helpers::camel_to_snake;
use crate::manifest::{config::ColumnNaming, entities::EntityMapping};

pub type ValueAccessor<E> = fn(&E) -> SqlValue;

/// Reads the key of a related entity held by value, `None` when it is not loaded.
pub type NavigationAccessor<E> = fn(&E) -> Option<SqlValue>;

/// A record type that can be written in bulk.
pub trait Entity: Sized + Send + Sync + 'static {
    fn describe() -> EntityDescriptor<Self>;
}

struct FieldDescriptor<E> {
    field_name: String,
    column_name: Option<String>,
    accessor: ValueAccessor<E>,
}

pub struct ForeignKey<E> {
    field_name: String,
    referenced_table: String,
    referenced_column: String,
    navigation: Option<NavigationAccessor<E>>,
    required: bool,
}

impl<E> ForeignKey<E> {
    pub fn new(
        field_name: impl Into<String>,
        referenced_table: impl Into<String>,
        referenced_column: impl Into<String>,
    ) -> Self {
        ForeignKey {
            field_name: field_name.into(),
            referenced_table: referenced_table.into(),
            referenced_column: referenced_column.into(),
            navigation: None,
            required: false,
        }
    }

    /// Prefer the key of the related entity when the record carries it.
    pub fn via(mut self, navigation: NavigationAccessor<E>) -> Self {
        self.navigation = Some(navigation);
        self
    }

    /// Reject rows where neither the related entity nor the raw column yields a key.
    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }
}

/// Declarative description of an entity type, produced by [`Entity::describe`].
pub struct EntityDescriptor<E> {
    name: String,
    table: Option<String>,
    schema: Option<String>,
    fields: Vec<FieldDescriptor<E>>,
    primary_key: Vec<String>,
    foreign_keys: Vec<ForeignKey<E>>,
}

impl<E> EntityDescriptor<E> {
    pub fn new(name: impl Into<String>) -> Self {
        EntityDescriptor {
            name: name.into(),
            table: None,
            schema: None,
            fields: Vec::new(),
            primary_key: Vec::new(),
            foreign_keys: Vec::new(),
        }
    }

    pub fn table(mut self, table: impl Into<String>) -> Self {
        self.table = Some(table.into());
        self
    }

    pub fn schema(mut self, schema: impl Into<String>) -> Self {
        self.schema = Some(schema.into());
        self
    }

    /// Adds a field whose column name follows the configured naming.
    pub fn field(mut self, field_name: impl Into<String>, accessor: ValueAccessor<E>) -> Self {
        self.fields.push(FieldDescriptor {
            field_name: field_name.into(),
            column_name: None,
            accessor,
        });
        self
    }

    /// Adds a field stored under an explicit column name.
    pub fn field_as(
        mut self,
        field_name: impl Into<String>,
        column_name: impl Into<String>,
        accessor: ValueAccessor<E>,
    ) -> Self {
        self.fields.push(FieldDescriptor {
            field_name: field_name.into(),
            column_name: Some(column_name.into()),
            accessor,
        });
        self
    }

    pub fn primary_key<I, S>(mut self, field_names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.primary_key = field_names.into_iter().map(Into::into).collect();
        self
    }

    pub fn foreign_key(mut self, foreign_key: ForeignKey<E>) -> Self {
        self.foreign_keys.push(foreign_key);
        self
    }
}

pub struct ColumnMapping<E> {
    pub field_name: String,
    pub column_name: String,
    pub accessor: ValueAccessor<E>,
}

impl<E> ColumnMapping<E> {
    pub fn value(&self, entity: &E) -> SqlValue {
        (self.accessor)(entity)
    }
}

impl<E> Clone for ColumnMapping<E> {
    fn clone(&self) -> Self {
        ColumnMapping {
            field_name: self.field_name.clone(),
            column_name: self.column_name.clone(),
            accessor: self.accessor,
        }
    }
}

impl<E> fmt::Debug for ColumnMapping<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ColumnMapping")
            .field("field_name", &self.field_name)
            .field("column_name", &self.column_name)
            .finish_non_exhaustive()
    }
}

pub struct ForeignKeyMapping<E> {
    pub referenced_table: String,
    pub referenced_column: String,
    pub navigation: Option<NavigationAccessor<E>>,
    pub required: bool,
}

impl<E> fmt::Debug for ForeignKeyMapping<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ForeignKeyMapping")
            .field("referenced_table", &self.referenced_table)
            .field("referenced_column", &self.referenced_column)
            .field("navigable", &self.navigation.is_some())
            .field("required", &self.required)
            .finish()
    }
}

/// Resolved, immutable mapping of an entity type onto its table.
pub struct EntityMetadata<E> {
    pub entity_name: String,
    pub table_name: String,
    pub schema_name: Option<String>,
    pub columns: Vec<ColumnMapping<E>>,
    pub primary_key: Vec<ColumnMapping<E>>,
    /// Keyed by local column name.
    pub foreign_keys: BTreeMap<String, ForeignKeyMapping<E>>,
}

impl<E> EntityMetadata<E> {
    pub fn is_key_column(&self, column_name: &str) -> bool {
        self.primary_key.iter().any(|key| key.column_name == column_name)
    }

    pub fn non_key_columns(&self) -> impl Iterator<Item = &ColumnMapping<E>> {
        self.columns.iter().filter(|column| !self.is_key_column(&column.column_name))
    }

    pub fn foreign_key(&self, column_name: &str) -> Option<&ForeignKeyMapping<E>> {
        self.foreign_keys.get(column_name)
    }

    /// Checks the mapping can express `operation` before any SQL is generated.
    pub fn ensure_supports(&self, operation: BatchOperationType) -> Result<(), MetadataError> {
        if operation.targets_existing_rows() && self.primary_key.is_empty() {
            return Err(MetadataError::NoPrimaryKey { entity: self.entity_name.clone(), operation });
        }

        if operation == BatchOperationType::Update && self.non_key_columns().next().is_none() {
            return Err(MetadataError::NoUpdatableColumns { entity: self.entity_name.clone() });
        }

        Ok(())
    }
}

impl<E> fmt::Debug for EntityMetadata<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntityMetadata")
            .field("entity_name", &self.entity_name)
            .field("table_name", &self.table_name)
            .field("schema_name", &self.schema_name)
            .field("columns", &self.columns)
            .field("primary_key", &self.primary_key)
            .field("foreign_keys", &self.foreign_keys)
            .finish()
    }
}

type CachedMetadata = Arc<dyn Any + Send + Sync>;

/// Memoizing metadata source shared by every bulk write of an engine instance.
///
/// Lookups for a type already resolved only take a read lock. The first resolution of a type
/// runs exactly once even under concurrent callers, other callers for that type wait on it while
/// resolutions of distinct types proceed independently. Failed resolutions are not cached.
pub struct MetadataResolver {
    naming: ColumnNaming,
    overrides: HashMap<String, EntityMapping>,
    cache: RwLock<HashMap<TypeId, Arc<OnceCell<CachedMetadata>>>>,
}

impl Default for MetadataResolver {
    fn default() -> Self {
        MetadataResolver::new(ColumnNaming::default())
    }
}

impl MetadataResolver {
    pub fn new(naming: ColumnNaming) -> Self {
        MetadataResolver { naming, overrides: HashMap::new(), cache: RwLock::new(HashMap::new()) }
    }

    /// Applies table, schema and column overrides keyed by entity name.
    pub fn with_mappings(mut self, mappings: impl IntoIterator<Item = EntityMapping>) -> Self {
        self.overrides.extend(mappings.into_iter().map(|mapping| (mapping.name.clone(), mapping)));
        self
    }

    pub fn naming(&self) -> ColumnNaming {
        self.naming
    }

    pub fn cached_types(&self) -> usize {
        let cache = self.cache.read().unwrap_or_else(PoisonError::into_inner);
        cache.values().filter(|cell| cell.get().is_some()).count()
    }

    pub fn resolve<E: Entity>(&self) -> Result<Arc<EntityMetadata<E>>, MetadataError> {
        let cell = self.cell_for(TypeId::of::<E>());

        let cached = cell.get_or_try_init(|| {
            let metadata = self.build::<E>()?;
            debug!(
                "Resolved metadata for {} -> {} ({} columns, {} key columns)",
                metadata.entity_name,
                metadata.table_name,
                metadata.columns.len(),
                metadata.primary_key.len()
            );
            Ok::<CachedMetadata, MetadataError>(Arc::new(metadata))
        })?;

        Arc::clone(cached)
            .downcast::<EntityMetadata<E>>()
            .map_err(|_| MetadataError::CacheTypeMismatch { entity: type_name::<E>().to_string() })
    }

    fn cell_for(&self, type_id: TypeId) -> Arc<OnceCell<CachedMetadata>> {
        {
            let cache = self.cache.read().unwrap_or_else(PoisonError::into_inner);
            if let Some(cell) = cache.get(&type_id) {
                return Arc::clone(cell);
            }
        }

        let mut cache = self.cache.write().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(cache.entry(type_id).or_default())
    }

    fn build<E: Entity>(&self) -> Result<EntityMetadata<E>, MetadataError> {
        let descriptor = E::describe();
        let entity = descriptor.name;
        let overrides = self.overrides.get(&entity);

        let table_name = overrides
            .and_then(|mapping| mapping.table.clone())
            .or(descriptor.table)
            .filter(|table| !table.trim().is_empty())
            .ok_or_else(|| MetadataError::NoTableMapping { entity: entity.clone() })?;

        let schema_name = overrides
            .and_then(|mapping| mapping.schema.clone())
            .or(descriptor.schema)
            .filter(|schema| !schema.trim().is_empty());

        if descriptor.fields.is_empty() {
            return Err(MetadataError::NoColumns { entity });
        }

        if let Some(mapping) = overrides {
            if let Some(unknown) = mapping
                .columns
                .keys()
                .find(|field| !descriptor.fields.iter().any(|f| &f.field_name == *field))
            {
                return Err(MetadataError::UnknownOverrideField {
                    entity,
                    field: unknown.clone(),
                });
            }
        }

        let mut seen_fields = HashSet::new();
        let mut seen_columns = HashSet::new();
        let mut columns = Vec::with_capacity(descriptor.fields.len());

        for field in descriptor.fields {
            if !seen_fields.insert(field.field_name.clone()) {
                return Err(MetadataError::DuplicateField { entity, field: field.field_name });
            }

            let column_name = overrides
                .and_then(|mapping| mapping.columns.get(&field.field_name).cloned())
                .or(field.column_name)
                .unwrap_or_else(|| self.column_name_for(&field.field_name));

            if !seen_columns.insert(column_name.clone()) {
                return Err(MetadataError::DuplicateColumn { entity, column: column_name });
            }

            columns.push(ColumnMapping {
                field_name: field.field_name,
                column_name,
                accessor: field.accessor,
            });
        }

        let find_column = |field_name: &str| {
            columns.iter().find(|column| column.field_name == field_name)
        };

        let mut primary_key = Vec::with_capacity(descriptor.primary_key.len());
        for field in &descriptor.primary_key {
            match find_column(field) {
                Some(column) => primary_key.push(column.clone()),
                None => {
                    return Err(MetadataError::PrimaryKeyNotFound {
                        entity,
                        field: field.clone(),
                    })
                }
            }
        }

        let mut foreign_keys = BTreeMap::new();
        for foreign_key in descriptor.foreign_keys {
            let column_name = match find_column(&foreign_key.field_name) {
                Some(column) => column.column_name.clone(),
                None => {
                    return Err(MetadataError::ForeignKeyFieldNotFound {
                        entity,
                        field: foreign_key.field_name,
                    })
                }
            };

            foreign_keys.insert(
                column_name,
                ForeignKeyMapping {
                    referenced_table: foreign_key.referenced_table,
                    referenced_column: foreign_key.referenced_column,
                    navigation: foreign_key.navigation,
                    required: foreign_key.required,
                },
            );
        }

        Ok(EntityMetadata {
            entity_name: entity,
            table_name,
            schema_name,
            columns,
            primary_key,
            foreign_keys,
        })
    }

    fn column_name_for(&self, field_name: &str) -> String {
        match self.naming {
            ColumnNaming::Verbatim => field_name.to_string(),
            ColumnNaming::SnakeCase => camel_to_snake(field_name),
        }
    }
}
