//! Destination table creation.

use super::{quote_identifier, StoreClient, TableRef};
use crate::config::ClickHouseConfig;
use crate::schema::Schema;
use crate::{Result, SchemaError};
use tracing::{error, info};

/// Issues `CREATE TABLE IF NOT EXISTS` for an inferred schema.
///
/// Safe to run on every start: an existing table is left untouched, even if
/// its columns differ from the freshly inferred ones.
#[derive(Debug, Clone)]
pub struct TableProvisioner {
    engine: String,
    order_by: String,
}

impl TableProvisioner {
    pub fn new(config: &ClickHouseConfig) -> Self {
        Self {
            engine: config.table_engine.clone(),
            order_by: config.order_by.clone(),
        }
    }

    /// Column the table is ordered by.
    pub fn order_by(&self) -> &str {
        &self.order_by
    }

    /// Render the DDL, failing if the ordering column was not inferred.
    pub fn create_table_sql(&self, table: &TableRef, schema: &Schema) -> Result<String> {
        if !schema.contains(&self.order_by) {
            return Err(SchemaError::MissingOrderColumn(self.order_by.clone()).into());
        }

        let columns: Vec<String> = schema
            .columns()
            .iter()
            .map(|c| format!("{} {}", quote_identifier(&c.name), c.store_type))
            .collect();

        Ok(format!(
            "CREATE TABLE IF NOT EXISTS {} ({}) ENGINE = {} ORDER BY ({})",
            table.qualified(),
            columns.join(", "),
            self.engine,
            quote_identifier(&self.order_by)
        ))
    }

    /// Create the table if it does not exist yet.
    pub async fn provision(
        &self,
        store: &dyn StoreClient,
        table: &TableRef,
        schema: &Schema,
    ) -> Result<()> {
        let sql = self.create_table_sql(table, schema)?;
        store.execute(&sql).await.map_err(|e| {
            error!(table = %table, error = %e, "CREATE TABLE failed");
            SchemaError::ProvisionFailed {
                table: table.to_string(),
                message: e.to_string(),
            }
        })?;

        info!(
            table = %table,
            columns = schema.len(),
            engine = %self.engine,
            order_by = %self.order_by,
            "Destination table ready"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::ColumnSpec;
    use crate::test_utils::MemoryStore;
    use crate::Error;

    fn schema() -> Schema {
        Schema::new(vec![
            ColumnSpec::new("id", "Int64"),
            ColumnSpec::new("timestamp", "DateTime64(9)"),
            ColumnSpec::new("name", "String"),
        ])
        .unwrap()
    }

    #[test]
    fn test_create_table_sql() {
        let provisioner = TableProvisioner::new(&ClickHouseConfig::default());
        let sql = provisioner
            .create_table_sql(&TableRef::new("default", "user_events"), &schema())
            .unwrap();

        assert_eq!(
            sql,
            "CREATE TABLE IF NOT EXISTS `default`.`user_events` \
             (`id` Int64, `timestamp` DateTime64(9), `name` String) \
             ENGINE = MergeTree ORDER BY (`timestamp`)"
        );
    }

    #[test]
    fn test_missing_order_column_rejected() {
        let provisioner = TableProvisioner::new(&ClickHouseConfig::default());
        let schema = Schema::new(vec![ColumnSpec::new("id", "Int64")]).unwrap();

        let err = provisioner
            .create_table_sql(&TableRef::new("default", "t"), &schema)
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Schema(SchemaError::MissingOrderColumn(ref c)) if c == "timestamp"
        ));
    }

    #[tokio::test]
    async fn test_provision_is_idempotent() {
        let provisioner = TableProvisioner::new(&ClickHouseConfig::default());
        let store = MemoryStore::new();
        let table = TableRef::new("default", "user_events");

        provisioner.provision(&store, &table, &schema()).await.unwrap();
        provisioner.provision(&store, &table, &schema()).await.unwrap();

        assert_eq!(store.executed().len(), 2);
        assert_eq!(store.tables(), vec!["default.user_events".to_string()]);
    }

    #[tokio::test]
    async fn test_rejected_ddl_is_provisioning_error() {
        let provisioner = TableProvisioner::new(&ClickHouseConfig::default());
        let store = MemoryStore::new();
        store.fail_next_executes(1);

        let err = provisioner
            .provision(&store, &TableRef::new("default", "user_events"), &schema())
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            Error::Schema(SchemaError::ProvisionFailed { ref table, .. }) if table == "default.user_events"
        ));
        assert!(store.tables().is_empty());
    }
}
