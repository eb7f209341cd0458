//! Event handlers for the incremental engine.

use anyhow::Result;
use async_trait::async_trait;
use tracing::info;
use uuid::Uuid;

use crate::core::event::RowChange;
use crate::filter::FilterRule;

/// Callbacks the incremental engine dispatches decoded binlog events to.
/// Errors are logged by the engine and do not stop the stream.
#[async_trait]
pub trait BinlogEventHandler: Send + Sync {
    async fn on_row(&self, schema: &str, table: &str, changes: &[RowChange]) -> Result<()>;

    async fn on_ddl(&self, schema: &str, query: &str) -> Result<()>;

    async fn on_gtid(&self, uuid: &Uuid, gno: u64) -> Result<()>;
}

/// Reference handler: applies the same filter rule as the snapshot phase and
/// logs what passes.
pub struct LogEventHandler {
    rule: FilterRule,
}

impl LogEventHandler {
    pub fn new(rule: FilterRule) -> Self {
        Self { rule }
    }
}

#[async_trait]
impl BinlogEventHandler for LogEventHandler {
    async fn on_row(&self, schema: &str, table: &str, changes: &[RowChange]) -> Result<()> {
        if !self.rule.allow(schema, table) {
            return Ok(());
        }
        info!(
            "Row change on {}.{} at {}: {}",
            schema,
            table,
            chrono::Utc::now().timestamp(),
            serde_json::to_string(changes)?
        );
        Ok(())
    }

    async fn on_ddl(&self, schema: &str, query: &str) -> Result<()> {
        info!("DDL on {}: {}", schema, query);
        Ok(())
    }

    async fn on_gtid(&self, _uuid: &Uuid, _gno: u64) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::event::RowMap;

    #[tokio::test]
    async fn test_log_handler_accepts_events() {
        let handler = LogEventHandler::new(FilterRule::default());
        let changes = vec![RowChange::Insert {
            after: RowMap::new(),
        }];
        assert!(handler.on_row("app", "orders", &changes).await.is_ok());
        assert!(handler
            .on_ddl("app", "ALTER TABLE `orders` ADD `x` int")
            .await
            .is_ok());
        assert!(handler.on_gtid(&Uuid::from_u128(1), 5).await.is_ok());
    }
}
