use std::{num::NonZeroUsize, thread, time::Duration};

use serde::{Deserialize, Serialize};

use crate::database::batch_operations::DEFAULT_BATCH_SIZE;

fn default_batch_size() -> usize {
    DEFAULT_BATCH_SIZE
}

/// How column names are derived for fields the entity description does not name explicitly.
#[derive(Debug, Default, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ColumnNaming {
    /// The field name is used as-is.
    #[default]
    Verbatim,
    /// `orderDate` / `OrderDate` become `order_date`.
    SnakeCase,
}

/// Tuning options for bulk writes.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct BulkWriteConfig {
    /// Rows per generated insert statement, and per group of update/delete statements.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Number of batches generated in parallel. Defaults to the available parallelism of the
    /// machine.
    ///
    /// Execution is not affected by this: every statement of a bulk write runs sequentially on the
    /// one connection that holds its transaction.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generation_concurrency: Option<usize>,

    /// Per statement timeout. A statement exceeding it fails the write and rolls it back.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub statement_timeout_ms: Option<u64>,

    #[serde(default)]
    pub column_naming: ColumnNaming,
}

impl Default for BulkWriteConfig {
    fn default() -> Self {
        BulkWriteConfig {
            batch_size: DEFAULT_BATCH_SIZE,
            generation_concurrency: None,
            statement_timeout_ms: None,
            column_naming: ColumnNaming::default(),
        }
    }
}

impl BulkWriteConfig {
    pub fn generation_concurrency(&self) -> usize {
        self.generation_concurrency
            .unwrap_or_else(|| thread::available_parallelism().map_or(1, NonZeroUsize::get))
            .max(1)
    }

    pub fn statement_timeout(&self) -> Option<Duration> {
        self.statement_timeout_ms.map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use serde_yaml;

    use super::*;

    #[test]
    fn test_config_simple() {
        let yaml = r#"
          batch_size: 250
          generation_concurrency: 2
          statement_timeout_ms: 1500
          column_naming: snake_case
        "#;

        let config: BulkWriteConfig = serde_yaml::from_str(yaml).unwrap();

        assert_eq!(config.batch_size, 250);
        assert_eq!(config.generation_concurrency(), 2);
        assert_eq!(config.statement_timeout(), Some(Duration::from_millis(1500)));
        assert_eq!(config.column_naming, ColumnNaming::SnakeCase);
    }

    #[test]
    fn test_config_optional() {
        let yaml = r#"
          generation_concurrency: 0
        "#;

        let config: BulkWriteConfig = serde_yaml::from_str(yaml).unwrap();

        assert_eq!(config.batch_size, 1000);
        assert_eq!(config.generation_concurrency(), 1);
        assert_eq!(config.statement_timeout(), None);
        assert_eq!(config.column_naming, ColumnNaming::Verbatim);
    }

    #[test]
    fn test_default_concurrency_is_at_least_one() {
        assert!(BulkWriteConfig::default().generation_concurrency() >= 1);
    }
}
