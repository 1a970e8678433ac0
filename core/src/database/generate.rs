//! SQL text generation for insert, update and delete batches.
//!
//! Every function here is pure: the output depends only on the rows and the resolved metadata,
//! so batches can be generated on any worker in any order.

use std::borrow::Cow;

use crate::database::{
    batch_operations::{Batch, BatchOperationType, GeneratedStatement, RESERVED_KEYWORDS},
    errors::GenerationError,
    metadata::{ColumnMapping, EntityMetadata},
    sql_value::SqlValue,
};

/// Quotes an identifier if it's a reserved keyword.
#[inline]
pub fn quote_identifier(name: &str) -> Cow<'_, str> {
    if RESERVED_KEYWORDS.iter().any(|keyword| keyword.eq_ignore_ascii_case(name)) {
        Cow::Owned(format!("\"{}\"", name))
    } else {
        Cow::Borrowed(name)
    }
}

/// Formats the table name, prefixed with its schema when there is one.
pub fn format_table_name<E>(metadata: &EntityMetadata<E>) -> String {
    match &metadata.schema_name {
        Some(schema) => {
            format!("{}.{}", quote_identifier(schema), quote_identifier(&metadata.table_name))
        }
        None => quote_identifier(&metadata.table_name).into_owned(),
    }
}

pub fn generate_column_names_sql<E>(columns: &[ColumnMapping<E>]) -> String {
    columns
        .iter()
        .map(|column| quote_identifier(&column.column_name))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Generates the statement for one batch, `None` when the batch holds no rows.
pub fn generate_statement<E>(
    entities: &[E],
    batch: &Batch,
    operation: BatchOperationType,
    metadata: &EntityMetadata<E>,
) -> Result<Option<GeneratedStatement>, GenerationError> {
    let rows = batch.rows(entities);
    if rows.is_empty() {
        return Ok(None);
    }

    let first_row = batch.range.start;
    let sql = match operation {
        BatchOperationType::Insert => generate_insert_sql(rows, first_row, metadata)?,
        BatchOperationType::Update => generate_update_sql(rows, first_row, metadata)?,
        BatchOperationType::Delete => generate_delete_sql(rows, first_row, metadata)?,
    };

    Ok(Some(GeneratedStatement {
        sql,
        operation,
        batch_id: batch.id,
        entity: metadata.entity_name.clone(),
        rows: rows.len(),
    }))
}

/// `INSERT INTO t (a, b) VALUES (..), (..);` with one tuple per row in input order.
///
/// `first_row` is the index of `rows[0]` in the caller's input and only feeds error context.
pub fn generate_insert_sql<E>(
    rows: &[E],
    first_row: usize,
    metadata: &EntityMetadata<E>,
) -> Result<String, GenerationError> {
    let mut sql = format!(
        "INSERT INTO {} ({}) VALUES ",
        format_table_name(metadata),
        generate_column_names_sql(&metadata.columns)
    );

    for (i, entity) in rows.iter().enumerate() {
        if i > 0 {
            sql.push_str(", ");
        }

        sql.push('(');
        for (j, column) in metadata.columns.iter().enumerate() {
            if j > 0 {
                sql.push_str(", ");
            }
            sql.push_str(&column_literal(entity, column, metadata, first_row + i)?);
        }
        sql.push(')');
    }

    sql.push(';');
    Ok(sql)
}

/// One `UPDATE ... SET ... WHERE <key predicate>;` per row, joined with a space.
pub fn generate_update_sql<E>(
    rows: &[E],
    first_row: usize,
    metadata: &EntityMetadata<E>,
) -> Result<String, GenerationError> {
    let table_name = format_table_name(metadata);
    let mut statements = Vec::with_capacity(rows.len());

    for (i, entity) in rows.iter().enumerate() {
        let row = first_row + i;
        let assignments = metadata
            .non_key_columns()
            .map(|column| {
                column_literal(entity, column, metadata, row).map(|literal| {
                    format!("{} = {}", quote_identifier(&column.column_name), literal)
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        statements.push(format!(
            "UPDATE {} SET {} WHERE {};",
            table_name,
            assignments.join(", "),
            key_predicate(entity, metadata, row)?
        ));
    }

    Ok(statements.join(" "))
}

/// One `DELETE FROM ... WHERE <key predicate>;` per row, joined with a space.
pub fn generate_delete_sql<E>(
    rows: &[E],
    first_row: usize,
    metadata: &EntityMetadata<E>,
) -> Result<String, GenerationError> {
    let table_name = format_table_name(metadata);
    let mut statements = Vec::with_capacity(rows.len());

    for (i, entity) in rows.iter().enumerate() {
        statements.push(format!(
            "DELETE FROM {} WHERE {};",
            table_name,
            key_predicate(entity, metadata, first_row + i)?
        ));
    }

    Ok(statements.join(" "))
}

fn key_predicate<E>(
    entity: &E,
    metadata: &EntityMetadata<E>,
    row: usize,
) -> Result<String, GenerationError> {
    let mut conditions = Vec::with_capacity(metadata.primary_key.len());

    for key in &metadata.primary_key {
        let value = column_value(entity, key, metadata, row)?;
        if value.is_null() {
            return Err(GenerationError::NullKey {
                entity: metadata.entity_name.clone(),
                column: key.column_name.clone(),
                row,
            });
        }

        conditions.push(format!(
            "{} = {}",
            quote_identifier(&key.column_name),
            format_literal(&value, key, metadata, row)?
        ));
    }

    Ok(conditions.join(" AND "))
}

/// Foreign key columns take the related entity's key when it is loaded, else the raw column.
fn column_value<E>(
    entity: &E,
    column: &ColumnMapping<E>,
    metadata: &EntityMetadata<E>,
    row: usize,
) -> Result<SqlValue, GenerationError> {
    let Some(foreign_key) = metadata.foreign_key(&column.column_name) else {
        return Ok(column.value(entity));
    };

    let value = foreign_key
        .navigation
        .and_then(|navigation| navigation(entity))
        .filter(|value| !value.is_null())
        .unwrap_or_else(|| column.value(entity));

    if foreign_key.required && value.is_null() {
        return Err(GenerationError::UnresolvedForeignKey {
            entity: metadata.entity_name.clone(),
            column: column.column_name.clone(),
            referenced_table: foreign_key.referenced_table.clone(),
            referenced_column: foreign_key.referenced_column.clone(),
            row,
        });
    }

    Ok(value)
}

fn column_literal<E>(
    entity: &E,
    column: &ColumnMapping<E>,
    metadata: &EntityMetadata<E>,
    row: usize,
) -> Result<String, GenerationError> {
    let value = column_value(entity, column, metadata, row)?;
    format_literal(&value, column, metadata, row)
}

fn format_literal<E>(
    value: &SqlValue,
    column: &ColumnMapping<E>,
    metadata: &EntityMetadata<E>,
    row: usize,
) -> Result<String, GenerationError> {
    value.to_sql_literal().map_err(|source| GenerationError::Format {
        entity: metadata.entity_name.clone(),
        field: column.field_name.clone(),
        column: column.column_name.clone(),
        row,
        source,
    })
}

#[cfg(test)]
mod tests {
    use std::num::NonZeroUsize;

    use super::*;
    use crate::database::{
        batch_operations::partition,
        metadata::{Entity, EntityDescriptor, ForeignKey, MetadataResolver},
        sql_value::FormatError,
    };

    struct TestEntity {
        id: i32,
        name: Option<String>,
    }

    impl Entity for TestEntity {
        fn describe() -> EntityDescriptor<Self> {
            EntityDescriptor::new("TestEntity")
                .table("TestEntities")
                .field("Id", |e: &TestEntity| e.id.into())
                .field("Name", |e: &TestEntity| e.name.clone().into())
                .primary_key(["Id"])
        }
    }

    struct Product {
        id: i64,
    }

    struct OrderItem {
        order_id: i64,
        line: i32,
        product_id: Option<i64>,
        product: Option<Product>,
        quantity: i32,
        attachment: Option<Vec<u8>>,
    }

    impl Entity for OrderItem {
        fn describe() -> EntityDescriptor<Self> {
            EntityDescriptor::new("OrderItem")
                .table("order_items")
                .schema("sales")
                .field_as("orderId", "order_id", |e: &OrderItem| e.order_id.into())
                .field_as("line", "line", |e: &OrderItem| e.line.into())
                .field_as("productId", "product_id", |e: &OrderItem| e.product_id.into())
                .field_as("quantity", "quantity", |e: &OrderItem| e.quantity.into())
                .field_as("attachment", "attachment", |e: &OrderItem| e.attachment.clone().into())
                .primary_key(["orderId", "line"])
                .foreign_key(
                    ForeignKey::new("productId", "products", "id")
                        .via(|e: &OrderItem| e.product.as_ref().map(|p| p.id.into()))
                        .required(),
                )
        }
    }

    fn item(order_id: i64, line: i32, product_id: Option<i64>, product: Option<i64>) -> OrderItem {
        OrderItem {
            order_id,
            line,
            product_id,
            product: product.map(|id| Product { id }),
            quantity: 3,
            attachment: None,
        }
    }

    fn entities() -> Vec<TestEntity> {
        vec![
            TestEntity { id: 1, name: Some("Entity1".to_string()) },
            TestEntity { id: 2, name: Some("Entity2".to_string()) },
        ]
    }

    #[test]
    fn test_insert_encodes_all_rows_in_one_statement() {
        let resolver = MetadataResolver::default();
        let metadata = resolver.resolve::<TestEntity>().unwrap();

        let sql = generate_insert_sql(&entities(), 0, &metadata).unwrap();
        assert_eq!(
            sql,
            "INSERT INTO TestEntities (Id, Name) VALUES (1, 'Entity1'), (2, 'Entity2');"
        );
    }

    #[test]
    fn test_update_is_one_statement_per_row_without_key_in_set() {
        let resolver = MetadataResolver::default();
        let metadata = resolver.resolve::<TestEntity>().unwrap();
        let rows = vec![
            TestEntity { id: 1, name: Some("UpdatedEntity1".to_string()) },
            TestEntity { id: 2, name: None },
        ];

        let sql = generate_update_sql(&rows, 0, &metadata).unwrap();
        assert_eq!(
            sql,
            "UPDATE TestEntities SET Name = 'UpdatedEntity1' WHERE Id = 1; \
             UPDATE TestEntities SET Name = NULL WHERE Id = 2;"
        );
    }

    #[test]
    fn test_delete_joins_composite_keys_with_and() {
        let resolver = MetadataResolver::default();
        let metadata = resolver.resolve::<OrderItem>().unwrap();
        let rows = vec![item(10, 1, Some(5), None), item(10, 2, Some(6), None)];

        let sql = generate_delete_sql(&rows, 0, &metadata).unwrap();
        assert_eq!(
            sql,
            "DELETE FROM sales.order_items WHERE order_id = 10 AND line = 1; \
             DELETE FROM sales.order_items WHERE order_id = 10 AND line = 2;"
        );
    }

    #[test]
    fn test_foreign_key_prefers_navigation_then_raw_value() {
        let resolver = MetadataResolver::default();
        let metadata = resolver.resolve::<OrderItem>().unwrap();
        let rows = vec![item(1, 1, Some(5), Some(42)), item(1, 2, Some(6), None)];

        let sql = generate_insert_sql(&rows, 0, &metadata).unwrap();
        assert_eq!(
            sql,
            "INSERT INTO sales.order_items (order_id, line, product_id, quantity, attachment) \
             VALUES (1, 1, 42, 3, NULL), (1, 2, 6, 3, NULL);"
        );
    }

    #[test]
    fn test_required_foreign_key_must_resolve() {
        let resolver = MetadataResolver::default();
        let metadata = resolver.resolve::<OrderItem>().unwrap();
        let rows = vec![item(1, 1, Some(5), None), item(1, 2, None, None)];

        let error = generate_insert_sql(&rows, 100, &metadata).unwrap_err();
        assert_eq!(
            error,
            GenerationError::UnresolvedForeignKey {
                entity: "OrderItem".to_string(),
                column: "product_id".to_string(),
                referenced_table: "products".to_string(),
                referenced_column: "id".to_string(),
                row: 101,
            }
        );
    }

    #[test]
    fn test_unsupported_value_reports_field_and_row() {
        let resolver = MetadataResolver::default();
        let metadata = resolver.resolve::<OrderItem>().unwrap();
        let mut bad = item(1, 1, Some(5), None);
        bad.attachment = Some(vec![0xde, 0xad]);

        let error = generate_insert_sql(&[bad], 0, &metadata).unwrap_err();
        assert_eq!(
            error,
            GenerationError::Format {
                entity: "OrderItem".to_string(),
                field: "attachment".to_string(),
                column: "attachment".to_string(),
                row: 0,
                source: FormatError::UnsupportedType("Bytes"),
            }
        );
    }

    #[test]
    fn test_null_key_is_rejected() {
        struct Nullable {
            id: Option<i32>,
            name: String,
        }

        impl Entity for Nullable {
            fn describe() -> EntityDescriptor<Self> {
                EntityDescriptor::new("Nullable")
                    .table("nullable")
                    .field("id", |e: &Nullable| e.id.into())
                    .field("name", |e: &Nullable| e.name.as_str().into())
                    .primary_key(["id"])
            }
        }

        let resolver = MetadataResolver::default();
        let metadata = resolver.resolve::<Nullable>().unwrap();
        let rows = vec![Nullable { id: None, name: "x".to_string() }];

        assert!(matches!(
            generate_update_sql(&rows, 0, &metadata),
            Err(GenerationError::NullKey { row: 0, .. })
        ));
        assert!(matches!(
            generate_delete_sql(&rows, 0, &metadata),
            Err(GenerationError::NullKey { .. })
        ));
    }

    #[test]
    fn test_reserved_identifiers_are_quoted() {
        assert_eq!(quote_identifier("user"), "\"user\"");
        assert_eq!(quote_identifier("Order"), "\"Order\"");
        assert_eq!(quote_identifier("orders"), "orders");
    }

    #[test]
    fn test_statements_carry_batch_context() {
        let resolver = MetadataResolver::default();
        let metadata = resolver.resolve::<TestEntity>().unwrap();
        let rows: Vec<TestEntity> =
            (0..5).map(|id| TestEntity { id, name: Some(format!("n{id}")) }).collect();

        let batches = partition(rows.len(), NonZeroUsize::new(2).unwrap(), 0);
        let statements: Vec<GeneratedStatement> = batches
            .iter()
            .filter_map(|batch| {
                generate_statement(&rows, batch, BatchOperationType::Insert, &metadata).unwrap()
            })
            .collect();

        assert_eq!(statements.len(), 3);
        assert_eq!(statements[2].batch_id, 2);
        assert_eq!(statements[2].rows, 1);
        assert_eq!(statements[2].sql, "INSERT INTO TestEntities (Id, Name) VALUES (4, 'n4');");
    }

    #[test]
    fn test_empty_batch_produces_no_statement() {
        let resolver = MetadataResolver::default();
        let metadata = resolver.resolve::<TestEntity>().unwrap();
        let batch = Batch { id: 0, range: 0..0 };

        for operation in
            [BatchOperationType::Insert, BatchOperationType::Update, BatchOperationType::Delete]
        {
            let statement = generate_statement(&entities(), &batch, operation, &metadata).unwrap();
            assert_eq!(statement, None);
        }
    }
}
