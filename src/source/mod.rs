pub mod mysql;

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::{info, warn};

use crate::config::{CdcConfig, DataSourceConfig, EngineConfig};
use crate::core::event::RowMap;
use crate::core::gtid::GtidSet;
use crate::meta::CheckpointStore;
use crate::source::mysql::MySqlDataSource;

/// Tables grouped by schema, as returned by catalog listing.
pub type SchemaTables = BTreeMap<String, Vec<String>>;

/// Keyset-pagination cursor over a (possibly composite) primary key.
///
/// `values` is `None` before the first chunk; afterwards it holds the PK
/// column values of the last row returned. Advancing produces a fresh cursor,
/// the input is never mutated.
#[derive(Debug, Clone)]
pub struct PkCursor {
    columns: Vec<String>,
    values: Option<Vec<serde_json::Value>>,
}

impl PkCursor {
    pub fn new(columns: Vec<String>) -> Self {
        Self {
            columns,
            values: None,
        }
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn values(&self) -> Option<&[serde_json::Value]> {
        self.values.as_deref()
    }

    /// Build the cursor for the next chunk from the last row of this one.
    pub fn advanced(&self, last_row: &RowMap) -> Self {
        let values = self
            .columns
            .iter()
            .map(|col| last_row.get(col).cloned().unwrap_or(serde_json::Value::Null))
            .collect();
        Self {
            columns: self.columns.clone(),
            values: Some(values),
        }
    }
}

/// A per-table consistent snapshot: a REPEATABLE READ read-only transaction
/// plus the replication position captured when it opened. All reads run
/// inside that transaction; `commit` releases it.
#[async_trait]
pub trait SnapshotTx: Send {
    /// The replication coordinate pinned at transaction open.
    fn position(&self) -> &GtidSet;

    /// The table's `CREATE TABLE` statement.
    async fn table_ddl(&mut self, schema: &str, table: &str) -> Result<String>;

    /// Ordered primary-key columns; errors when the table has none.
    async fn primary_keys(&mut self, schema: &str, table: &str) -> Result<Vec<String>>;

    async fn count_rows(&mut self, schema: &str, table: &str) -> Result<u64>;

    /// Read the next `chunk_size` rows strictly after `cursor` in PK order.
    async fn fetch_chunk(
        &mut self,
        schema: &str,
        table: &str,
        cursor: &PkCursor,
        chunk_size: usize,
    ) -> Result<(Vec<RowMap>, PkCursor)>;

    async fn commit(self: Box<Self>) -> Result<()>;
}

/// Capability set over one source database. Only the MySQL realization
/// exists today; the trait is the seam other source kinds would implement.
#[async_trait]
pub trait DataSource: Send + Sync {
    fn kind(&self) -> &'static str;

    /// All user schemas (system schemas excluded).
    async fn list_schemas(&self) -> Result<Vec<String>>;

    /// Base tables grouped by schema, restricted to `schemas` when non-empty.
    async fn list_tables(&self, schemas: &[String]) -> Result<SchemaTables>;

    async fn begin_snapshot(&self) -> Result<Box<dyn SnapshotTx>>;

    /// The source's current replication position, outside any snapshot.
    async fn current_position(&self) -> Result<GtidSet>;
}

/// One registered source: its config, adapter, and replication state.
/// `id` is the 1-based position in the configuration and doubles as the
/// binlog client server-id, so it must stay unique within the process.
pub struct DataSourceHolder {
    pub id: u32,
    pub config: DataSourceConfig,
    pub source: Arc<dyn DataSource>,
    pub last_gtid: Arc<Mutex<GtidSet>>,
}

/// Connect every configured MySQL source and record its startup position in
/// the metadata store. Non-MySQL entries are skipped with a warning but keep
/// their slot in the server-id numbering.
pub async fn init_data_sources(
    config: &CdcConfig,
    engine: &EngineConfig,
    meta: &dyn CheckpointStore,
) -> Result<Vec<Arc<DataSourceHolder>>> {
    // One pinned connection per snapshot worker plus one for catalog queries
    let pool_size = engine.snapshot_concurrency + 1;

    let mut holders = Vec::new();
    for (i, source_config) in config.data_sources.iter().enumerate() {
        if !source_config.is_mysql() {
            warn!(
                "Skipping data source '{}': unsupported type '{}'",
                source_config.id, source_config.kind
            );
            continue;
        }

        let source = MySqlDataSource::connect(source_config, pool_size)
            .await
            .with_context(|| format!("failed to connect data source '{}'", source_config.id))?;

        let position = source
            .current_position()
            .await
            .with_context(|| format!("failed to read position of '{}'", source_config.id))?;
        meta.save_cdc_meta(&source_config.id, &source_config.kind, &position)
            .await
            .with_context(|| format!("failed to checkpoint '{}' at startup", source_config.id))?;

        info!(
            "Data source '{}' ready (server-id {}, position {})",
            source_config.id,
            i + 1,
            position
        );

        holders.push(Arc::new(DataSourceHolder {
            id: (i + 1) as u32,
            config: source_config.clone(),
            source: Arc::new(source),
            last_gtid: Arc::new(Mutex::new(GtidSet::new())),
        }));
    }
    Ok(holders)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cursor_starts_unset() {
        let cursor = PkCursor::new(vec!["a".to_string(), "b".to_string()]);
        assert!(cursor.values().is_none());
        assert_eq!(cursor.columns(), ["a", "b"]);
    }

    #[test]
    fn test_cursor_advance_is_fresh() {
        let cursor = PkCursor::new(vec!["a".to_string(), "b".to_string()]);

        let mut row = RowMap::new();
        row.insert("a".to_string(), serde_json::json!(1));
        row.insert("b".to_string(), serde_json::json!("x"));
        row.insert("payload".to_string(), serde_json::json!("ignored"));

        let next = cursor.advanced(&row);
        // The original cursor is untouched
        assert!(cursor.values().is_none());
        assert_eq!(
            next.values().unwrap(),
            [serde_json::json!(1), serde_json::json!("x")]
        );
    }

    #[test]
    fn test_cursor_advance_missing_column_is_null() {
        let cursor = PkCursor::new(vec!["a".to_string()]);
        let next = cursor.advanced(&RowMap::new());
        assert_eq!(next.values().unwrap(), [serde_json::Value::Null]);
    }
}
