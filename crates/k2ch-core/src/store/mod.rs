//! Store adapter: the ClickHouse capabilities the pipeline relies on, and
//! the provisioning of the destination table.

mod clickhouse;
mod provision;

pub use clickhouse::ClickHouseClient;
pub use provision::TableProvisioner;

use crate::decode::DecodedRow;
use crate::schema::{ColumnSpec, Schema};
use crate::Result;
use async_trait::async_trait;
use std::fmt;

/// Statements the pipeline issues against the analytical store.
///
/// Implementations bound every call by their own timeout. Callers run these
/// sequentially from the ingestion loop; nothing is pooled.
#[async_trait]
pub trait StoreClient: Send + Sync {
    /// Cheap round trip proving the store is reachable.
    async fn ping(&self) -> Result<()>;

    /// Run a statement that returns no rows (DDL).
    async fn execute(&self, sql: &str) -> Result<()>;

    /// Ask the store to infer column types for one JSON object.
    async fn describe_json(&self, sample: &str) -> Result<Vec<ColumnSpec>>;

    /// Insert all rows in one statement. All-or-nothing.
    async fn insert_rows(&self, table: &TableRef, schema: &Schema, rows: &[DecodedRow])
        -> Result<()>;
}

/// Fully qualified destination table.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TableRef {
    pub database: String,
    pub table: String,
}

impl TableRef {
    pub fn new(database: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            database: database.into(),
            table: table.into(),
        }
    }

    /// Destination for a topic inside `database`.
    pub fn for_topic(database: impl Into<String>, topic: &str) -> Self {
        Self::new(database, table_name_for_topic(topic))
    }

    /// Quoted `db`.`table` form for SQL.
    pub fn qualified(&self) -> String {
        format!(
            "{}.{}",
            quote_identifier(&self.database),
            quote_identifier(&self.table)
        )
    }
}

impl fmt::Display for TableRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.database, self.table)
    }
}

/// Table name derived from a topic: separators become underscores.
pub fn table_name_for_topic(topic: &str) -> String {
    topic
        .chars()
        .map(|c| if matches!(c, '.' | '-') { '_' } else { c })
        .collect()
}

/// Backtick-quote an identifier for ClickHouse.
pub fn quote_identifier(name: &str) -> String {
    let mut quoted = String::with_capacity(name.len() + 2);
    quoted.push('`');
    for c in name.chars() {
        if matches!(c, '`' | '\\') {
            quoted.push('\\');
        }
        quoted.push(c);
    }
    quoted.push('`');
    quoted
}
