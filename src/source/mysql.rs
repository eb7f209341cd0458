//! MySQL realization of the `DataSource` capability set.
//!
//! Catalog queries go through a pooled connection; each table snapshot pins
//! one connection to a REPEATABLE READ read-only transaction. The consistent
//! read view is established by the first statement of that transaction, so
//! `begin_snapshot` reads `@@GLOBAL.gtid_executed` as that first statement:
//! every change visible to the snapshot is covered by the captured set, and
//! the incremental stream started there replays at most a small overlapping
//! tail.

use anyhow::{Context, Result};
use async_trait::async_trait;
use mysql_async::prelude::*;
use mysql_async::{
    IsolationLevel, Opts, OptsBuilder, Params, Pool, PoolConstraints, PoolOpts, Row, Transaction,
    TxOpts, Value,
};
use tracing::debug;

use crate::config::DataSourceConfig;
use crate::core::error::CoreError;
use crate::core::event::RowMap;
use crate::core::gtid::GtidSet;
use crate::source::{DataSource, PkCursor, SchemaTables, SnapshotTx};
use crate::utils::{quote_ident, quote_table, validate_sql_identifier};

const SYSTEM_SCHEMAS: &str = "('information_schema', 'mysql', 'performance_schema', 'sys')";

/// Build connection options for one configured source. The pool is sized by
/// the caller (snapshot workers each pin a connection for the duration of
/// their table).
pub(crate) fn build_opts(config: &DataSourceConfig, pool_max: usize) -> Opts {
    let mut init = Vec::new();
    for (key, value) in &config.params {
        match key.as_str() {
            "charset" => init.push(format!("SET NAMES {}", value)),
            other => debug!("Ignoring connection param {}={}", other, value),
        }
    }

    let constraints = PoolConstraints::new(1, pool_max.max(1)).unwrap_or_default();

    OptsBuilder::default()
        .ip_or_hostname(config.host.clone())
        .tcp_port(config.port)
        .user(Some(config.user.clone()))
        .pass(Some(config.password.clone()))
        .db_name(if config.database.is_empty() {
            None
        } else {
            Some(config.database.clone())
        })
        .init(init)
        .pool_opts(PoolOpts::default().with_constraints(constraints))
        .into()
}

pub struct MySqlDataSource {
    pool: Pool,
}

impl MySqlDataSource {
    /// Connect and verify the source is reachable.
    pub async fn connect(config: &DataSourceConfig, pool_size: usize) -> Result<Self> {
        let pool = Pool::new(build_opts(config, pool_size));
        let mut conn = pool
            .get_conn()
            .await
            .with_context(|| format!("failed to connect to {}:{}", config.host, config.port))?;
        conn.query_drop("SELECT 1")
            .await
            .with_context(|| format!("ping failed for {}:{}", config.host, config.port))?;
        Ok(Self { pool })
    }

    /// The underlying pool, for catalog work outside a snapshot.
    #[allow(dead_code)]
    pub fn pool(&self) -> &Pool {
        &self.pool
    }
}

#[async_trait]
impl DataSource for MySqlDataSource {
    fn kind(&self) -> &'static str {
        "mysql"
    }

    async fn list_schemas(&self) -> Result<Vec<String>> {
        let mut conn = self.pool.get_conn().await?;
        let schemas: Vec<String> = conn
            .query(format!(
                "SELECT schema_name FROM information_schema.schemata \
                 WHERE schema_name NOT IN {}",
                SYSTEM_SCHEMAS
            ))
            .await
            .context("failed to list schemas")?;
        Ok(schemas)
    }

    async fn list_tables(&self, schemas: &[String]) -> Result<SchemaTables> {
        let mut query = format!(
            "SELECT table_schema, table_name FROM information_schema.tables \
             WHERE table_type = 'BASE TABLE' AND table_schema NOT IN {}",
            SYSTEM_SCHEMAS
        );
        let mut params: Vec<Value> = Vec::new();
        if !schemas.is_empty() {
            let placeholders = vec!["?"; schemas.len()].join(",");
            query.push_str(&format!(" AND table_schema IN ({})", placeholders));
            params.extend(schemas.iter().map(|s| Value::from(s.as_str())));
        }

        let mut conn = self.pool.get_conn().await?;
        let rows: Vec<(String, String)> = conn
            .exec(query, Params::from(params))
            .await
            .context("failed to list tables")?;

        let mut tables = SchemaTables::new();
        for (schema, table) in rows {
            tables.entry(schema).or_default().push(table);
        }
        Ok(tables)
    }

    async fn begin_snapshot(&self) -> Result<Box<dyn SnapshotTx>> {
        let mut opts = TxOpts::default();
        opts.with_isolation_level(IsolationLevel::RepeatableRead)
            .with_readonly(true);
        let mut tx = self
            .pool
            .start_transaction(opts)
            .await
            .context("failed to open snapshot transaction")?;

        // First statement inside the transaction: pins the read view and the
        // replication coordinate together.
        let pos = read_gtid_executed(&mut tx).await?;

        Ok(Box::new(MySqlSnapshotTx { tx, pos }))
    }

    async fn current_position(&self) -> Result<GtidSet> {
        let mut conn = self.pool.get_conn().await?;
        let raw: Option<String> = conn
            .query_first("SELECT @@GLOBAL.gtid_executed")
            .await
            .context("failed to read @@GLOBAL.gtid_executed")?;
        Ok(GtidSet::parse_str(raw.as_deref().unwrap_or(""))?)
    }
}

async fn read_gtid_executed(tx: &mut Transaction<'_>) -> Result<GtidSet> {
    let raw: Option<String> = tx
        .query_first("SELECT @@GLOBAL.gtid_executed")
        .await
        .context("failed to read @@GLOBAL.gtid_executed")?;
    Ok(GtidSet::parse_str(raw.as_deref().unwrap_or(""))?)
}

struct MySqlSnapshotTx {
    tx: Transaction<'static>,
    pos: GtidSet,
}

#[async_trait]
impl SnapshotTx for MySqlSnapshotTx {
    fn position(&self) -> &GtidSet {
        &self.pos
    }

    async fn table_ddl(&mut self, schema: &str, table: &str) -> Result<String> {
        validate_sql_identifier(schema)?;
        validate_sql_identifier(table)?;
        let row: Option<(String, String)> = self
            .tx
            .query_first(format!(
                "SHOW CREATE TABLE {}",
                quote_table(schema, table)
            ))
            .await
            .with_context(|| format!("show create table failed for {}.{}", schema, table))?;
        row.map(|(_, ddl)| ddl)
            .with_context(|| format!("show create table returned no rows for {}.{}", schema, table))
    }

    async fn primary_keys(&mut self, schema: &str, table: &str) -> Result<Vec<String>> {
        let keys: Vec<String> = self
            .tx
            .exec(
                "SELECT column_name FROM information_schema.columns \
                 WHERE table_schema = ? AND table_name = ? AND column_key = 'PRI' \
                 ORDER BY ordinal_position",
                (schema, table),
            )
            .await
            .with_context(|| format!("failed to read primary keys of {}.{}", schema, table))?;
        if keys.is_empty() {
            return Err(CoreError::snapshot_error(format!(
                "table {}.{} has no primary key",
                schema, table
            ))
            .into());
        }
        Ok(keys)
    }

    async fn count_rows(&mut self, schema: &str, table: &str) -> Result<u64> {
        validate_sql_identifier(schema)?;
        validate_sql_identifier(table)?;
        let count: Option<u64> = self
            .tx
            .query_first(format!(
                "SELECT COUNT(*) FROM {}",
                quote_table(schema, table)
            ))
            .await
            .with_context(|| format!("failed to count rows of {}.{}", schema, table))?;
        Ok(count.unwrap_or(0))
    }

    async fn fetch_chunk(
        &mut self,
        schema: &str,
        table: &str,
        cursor: &PkCursor,
        chunk_size: usize,
    ) -> Result<(Vec<RowMap>, PkCursor)> {
        validate_sql_identifier(schema)?;
        validate_sql_identifier(table)?;
        for column in cursor.columns() {
            validate_sql_identifier(column)?;
        }

        let (query, params) = build_chunk_query(schema, table, cursor, chunk_size);
        let rows: Vec<Row> = self
            .tx
            .exec(query, Params::from(params))
            .await
            .with_context(|| format!("failed to fetch chunk of {}.{}", schema, table))?;

        let rows: Vec<RowMap> = rows.iter().map(row_to_map).collect();
        let next = match rows.last() {
            Some(last) => cursor.advanced(last),
            None => cursor.clone(),
        };
        Ok((rows, next))
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        self.tx
            .commit()
            .await
            .context("failed to commit snapshot transaction")
    }
}

/// Build the keyset-pagination query: first call orders the whole table,
/// later calls resume strictly after the cursor with a PK tuple comparison.
pub(crate) fn build_chunk_query(
    schema: &str,
    table: &str,
    cursor: &PkCursor,
    chunk_size: usize,
) -> (String, Vec<Value>) {
    let order_by = cursor
        .columns()
        .iter()
        .map(|c| quote_ident(c))
        .collect::<Vec<_>>()
        .join(", ");

    match cursor.values() {
        None => (
            format!(
                "SELECT * FROM {} ORDER BY {} LIMIT ?",
                quote_table(schema, table),
                order_by
            ),
            vec![Value::from(chunk_size as u64)],
        ),
        Some(values) => {
            let tuple = cursor
                .columns()
                .iter()
                .map(|c| quote_ident(c))
                .collect::<Vec<_>>()
                .join(", ");
            let placeholders = vec!["?"; values.len()].join(", ");
            let mut params: Vec<Value> = values.iter().map(json_value_to_mysql).collect();
            params.push(Value::from(chunk_size as u64));
            (
                format!(
                    "SELECT * FROM {} WHERE ({}) > ({}) ORDER BY {} LIMIT ?",
                    quote_table(schema, table),
                    tuple,
                    placeholders,
                    order_by
                ),
                params,
            )
        }
    }
}

/// Convert one driver row to the column → JSON map dispatched downstream.
pub(crate) fn row_to_map(row: &Row) -> RowMap {
    let mut map = RowMap::new();
    for (i, column) in row.columns_ref().iter().enumerate() {
        let value = match row.as_ref(i) {
            Some(v) => mysql_value_to_json(v),
            None => serde_json::Value::Null,
        };
        map.insert(column.name_str().into_owned(), value);
    }
    map
}

/// Driver value → JSON. Binary payloads are decoded as UTF-8 text, numbers
/// pass through unchanged, temporal values are formatted the way MySQL
/// prints them.
pub(crate) fn mysql_value_to_json(value: &Value) -> serde_json::Value {
    match value {
        Value::NULL => serde_json::Value::Null,
        Value::Int(n) => serde_json::Value::Number((*n).into()),
        Value::UInt(n) => serde_json::Value::Number((*n).into()),
        Value::Float(f) => serde_json::Number::from_f64(*f as f64)
            .map(serde_json::Value::Number)
            .unwrap_or(serde_json::Value::Null),
        Value::Double(d) => serde_json::Number::from_f64(*d)
            .map(serde_json::Value::Number)
            .unwrap_or(serde_json::Value::Null),
        Value::Bytes(bytes) => {
            serde_json::Value::String(String::from_utf8_lossy(bytes).into_owned())
        }
        Value::Date(year, month, day, hour, minute, second, micros) => {
            serde_json::Value::String(format!(
                "{:04}-{:02}-{:02} {:02}:{:02}:{:02}.{:06}",
                year, month, day, hour, minute, second, micros
            ))
        }
        Value::Time(negative, days, hours, minutes, seconds, micros) => {
            let sign = if *negative { "-" } else { "" };
            let total_hours = days * 24 + *hours as u32;
            serde_json::Value::String(format!(
                "{}{:02}:{:02}:{:02}.{:06}",
                sign, total_hours, minutes, seconds, micros
            ))
        }
    }
}

/// JSON → driver value, for feeding cursor values back as query parameters.
pub(crate) fn json_value_to_mysql(value: &serde_json::Value) -> Value {
    match value {
        serde_json::Value::Null => Value::NULL,
        serde_json::Value::Bool(b) => Value::Int(*b as i64),
        serde_json::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Value::Int(i)
            } else if let Some(u) = n.as_u64() {
                Value::UInt(u)
            } else {
                Value::Double(n.as_f64().unwrap_or(0.0))
            }
        }
        serde_json::Value::String(s) => Value::Bytes(s.clone().into_bytes()),
        other => Value::Bytes(other.to_string().into_bytes()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_chunk_query_has_no_predicate() {
        let cursor = PkCursor::new(vec!["id".to_string()]);
        let (query, params) = build_chunk_query("app", "orders", &cursor, 100);
        assert_eq!(
            query,
            "SELECT * FROM `app`.`orders` ORDER BY `id` LIMIT ?"
        );
        assert_eq!(params, vec![Value::from(100u64)]);
    }

    #[test]
    fn test_resume_chunk_query_uses_tuple_comparison() {
        let cursor = PkCursor::new(vec!["a".to_string(), "b".to_string()]);
        let mut row = RowMap::new();
        row.insert("a".to_string(), serde_json::json!(1));
        row.insert("b".to_string(), serde_json::json!(2));
        let cursor = cursor.advanced(&row);

        let (query, params) = build_chunk_query("app", "pairs", &cursor, 7);
        assert_eq!(
            query,
            "SELECT * FROM `app`.`pairs` WHERE (`a`, `b`) > (?, ?) ORDER BY `a`, `b` LIMIT ?"
        );
        assert_eq!(
            params,
            vec![Value::Int(1), Value::Int(2), Value::from(7u64)]
        );
    }

    #[test]
    fn test_mysql_value_to_json() {
        assert_eq!(mysql_value_to_json(&Value::NULL), serde_json::Value::Null);
        assert_eq!(mysql_value_to_json(&Value::Int(-7)), serde_json::json!(-7));
        assert_eq!(
            mysql_value_to_json(&Value::UInt(42)),
            serde_json::json!(42u64)
        );
        assert_eq!(
            mysql_value_to_json(&Value::Bytes(b"hello".to_vec())),
            serde_json::json!("hello")
        );
        // Invalid UTF-8 degrades to replacement characters, not an error
        let garbled = mysql_value_to_json(&Value::Bytes(vec![0xff, 0xfe]));
        assert!(garbled.is_string());
        assert_eq!(
            mysql_value_to_json(&Value::Date(2024, 3, 1, 12, 30, 0, 0)),
            serde_json::json!("2024-03-01 12:30:00.000000")
        );
    }

    #[test]
    fn test_json_value_to_mysql() {
        assert_eq!(json_value_to_mysql(&serde_json::Value::Null), Value::NULL);
        assert_eq!(json_value_to_mysql(&serde_json::json!(5)), Value::Int(5));
        assert_eq!(
            json_value_to_mysql(&serde_json::json!(u64::MAX)),
            Value::UInt(u64::MAX)
        );
        assert_eq!(
            json_value_to_mysql(&serde_json::json!("abc")),
            Value::Bytes(b"abc".to_vec())
        );
        assert_eq!(json_value_to_mysql(&serde_json::json!(true)), Value::Int(1));
    }
}
