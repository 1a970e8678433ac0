pub mod batch_operations;
pub mod bulk_writer;
pub mod change_set;
pub mod errors;
pub mod generate;
pub mod metadata;
pub mod postgres;
pub mod sql_value;
pub mod sqlite;
pub mod store;
