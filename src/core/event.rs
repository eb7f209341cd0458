//! Event model shared by the snapshot and incremental engines.
//!
//! Snapshot events travel through the dispatch channel as a tagged sum and
//! serialize to the consumer envelope `{"type": ..., "schema": ..., "table":
//! ..., ...payload}`.

use serde::Serialize;

use crate::core::gtid::GtidSet;

/// One row as a column name → value map. Binary column values arrive decoded
/// as UTF-8 text, everything else as plain JSON scalars.
pub type RowMap = serde_json::Map<String, serde_json::Value>;

/// Snapshot-phase event dispatched to the consumer.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum Event {
    /// The table's `CREATE TABLE` statement, emitted before any rows.
    #[serde(rename = "create_table")]
    Ddl {
        schema: String,
        table: String,
        ddl: String,
    },

    /// One chunk of rows in ascending primary-key order.
    #[serde(rename = "insert")]
    Data {
        schema: String,
        table: String,
        rows: Vec<RowMap>,
    },

    /// Table finished; `pos` is the replication coordinate captured when the
    /// snapshot transaction opened.
    #[serde(rename = "end")]
    End {
        schema: String,
        table: String,
        pos: GtidSet,
    },

    /// Table failed; the rest of the snapshot continues without it.
    #[serde(rename = "rollback")]
    Rollback {
        schema: String,
        table: String,
        err: String,
    },
}

impl Event {
    pub fn schema(&self) -> &str {
        match self {
            Event::Ddl { schema, .. }
            | Event::Data { schema, .. }
            | Event::End { schema, .. }
            | Event::Rollback { schema, .. } => schema,
        }
    }

    pub fn table(&self) -> &str {
        match self {
            Event::Ddl { table, .. }
            | Event::Data { table, .. }
            | Event::End { table, .. }
            | Event::Rollback { table, .. } => table,
        }
    }

    /// The envelope discriminator.
    pub fn kind(&self) -> &'static str {
        match self {
            Event::Ddl { .. } => "create_table",
            Event::Data { .. } => "insert",
            Event::End { .. } => "end",
            Event::Rollback { .. } => "rollback",
        }
    }
}

/// A decoded binlog row image.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum RowChange {
    Insert { after: RowMap },
    Update { before: RowMap, after: RowMap },
    Delete { before: RowMap },
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(id: i64) -> RowMap {
        let mut m = RowMap::new();
        m.insert("id".to_string(), serde_json::json!(id));
        m
    }

    #[test]
    fn test_envelope_discriminator() {
        let event = Event::Ddl {
            schema: "app".into(),
            table: "orders".into(),
            ddl: "CREATE TABLE `orders` (`id` int)".into(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "create_table");
        assert_eq!(json["schema"], "app");
        assert_eq!(json["table"], "orders");
        assert_eq!(event.kind(), "create_table");
    }

    #[test]
    fn test_data_envelope_carries_rows() {
        let event = Event::Data {
            schema: "app".into(),
            table: "orders".into(),
            rows: vec![row(1), row(2)],
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "insert");
        assert_eq!(json["rows"][1]["id"], 2);
    }

    #[test]
    fn test_rollback_envelope_carries_error() {
        let event = Event::Rollback {
            schema: "app".into(),
            table: "nopk".into(),
            err: "table app.nopk has no primary key".into(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "rollback");
        assert!(json["err"].as_str().unwrap().contains("no primary key"));
    }

    #[test]
    fn test_row_change_tagging() {
        let change = RowChange::Update {
            before: row(1),
            after: row(2),
        };
        let json = serde_json::to_value(&change).unwrap();
        assert_eq!(json["op"], "update");
        assert_eq!(json["before"]["id"], 1);
        assert_eq!(json["after"]["id"], 2);
    }
}
