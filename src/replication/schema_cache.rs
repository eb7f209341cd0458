//! Column-name cache for binlog row decoding.
//!
//! Rows events carry values positionally; the column names live in the
//! catalog. Lookups are cached per table and the whole cache is dropped on
//! any DDL statement, since column sets may have changed.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use mysql_async::prelude::*;
use mysql_async::Pool;
use parking_lot::Mutex;

pub struct SchemaCache {
    pool: Pool,
    cache: Mutex<HashMap<(String, String), Arc<Vec<String>>>>,
}

impl SchemaCache {
    pub fn new(pool: Pool) -> Self {
        Self {
            pool,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Ordered column names of a table, loaded lazily from the catalog.
    pub async fn columns(&self, schema: &str, table: &str) -> Result<Arc<Vec<String>>> {
        let key = (schema.to_string(), table.to_string());
        if let Some(columns) = self.cache.lock().get(&key) {
            return Ok(columns.clone());
        }

        let mut conn = self.pool.get_conn().await?;
        let columns: Vec<String> = conn
            .exec(
                "SELECT column_name FROM information_schema.columns \
                 WHERE table_schema = ? AND table_name = ? \
                 ORDER BY ordinal_position",
                (schema, table),
            )
            .await
            .with_context(|| format!("failed to load columns of {}.{}", schema, table))?;
        if columns.is_empty() {
            bail!("unknown table {}.{}", schema, table);
        }

        let columns = Arc::new(columns);
        self.cache.lock().insert(key, columns.clone());
        Ok(columns)
    }

    pub fn invalidate_all(&self) {
        self.cache.lock().clear();
    }
}
