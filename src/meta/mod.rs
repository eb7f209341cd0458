// Copyright 2025
// Licensed under the Elastic License v2.0

//! Durable checkpoint store in the metadata MySQL database.
//!
//! Positions are written with at-least-once semantics: a crash between a
//! snapshot checkpoint and the incremental start re-emits an overlapping tail
//! of events, which consumers must treat idempotently.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use mysql_async::prelude::*;
use mysql_async::Pool;
use tracing::{debug, info};

use crate::config::DataSourceConfig;
use crate::core::gtid::GtidSet;
use crate::source::mysql::build_opts;

/// The small persistence interface both engines checkpoint through.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Upsert a per-table snapshot position, keyed by
    /// `(data_source_id, schema, table)`.
    async fn save_table_meta(
        &self,
        data_source_id: &str,
        schema: &str,
        table: &str,
        pos: &GtidSet,
    ) -> Result<()>;

    /// Upsert a per-source incremental position, keyed by `data_source_id`.
    async fn save_cdc_meta(&self, data_source_id: &str, kind: &str, pos: &GtidSet) -> Result<()>;
}

/// MySQL-backed checkpoint store (the `[CDC_DATASOURCE]` config block).
pub struct MetaStore {
    pool: Pool,
}

impl MetaStore {
    pub async fn connect(config: &DataSourceConfig) -> Result<Self> {
        if !config.is_mysql() {
            bail!("CDC_DATASOURCE type must be mysql, got '{}'", config.kind);
        }

        let pool = Pool::new(build_opts(config, 2));
        let mut conn = pool
            .get_conn()
            .await
            .context("failed to connect to metadata store")?;
        conn.query_drop("SELECT 1")
            .await
            .context("metadata store ping failed")?;
        drop(conn);

        let store = Self { pool };
        store.ensure_tables().await?;
        info!(
            "Metadata store ready at {}:{}/{}",
            config.host, config.port, config.database
        );
        Ok(store)
    }

    /// Create the checkpoint tables if they don't exist.
    async fn ensure_tables(&self) -> Result<()> {
        let mut conn = self.pool.get_conn().await?;
        conn.query_drop(
            "CREATE TABLE IF NOT EXISTS cdc_meta (
                id               BIGINT AUTO_INCREMENT PRIMARY KEY,
                data_source_id   VARCHAR(64)  NOT NULL,
                data_source_type VARCHAR(32)  NOT NULL,
                last_pos         JSON,
                UNIQUE KEY uniq_datasource_id (data_source_id)
            )",
        )
        .await
        .context("failed to create cdc_meta")?;

        conn.query_drop(
            "CREATE TABLE IF NOT EXISTS cdc_table_meta (
                id             BIGINT AUTO_INCREMENT PRIMARY KEY,
                data_source_id VARCHAR(64) NOT NULL,
                sc             VARCHAR(64) NOT NULL,
                tb             VARCHAR(64) NOT NULL,
                last_pos       JSON,
                UNIQUE KEY uniq_table (data_source_id, sc, tb)
            )",
        )
        .await
        .context("failed to create cdc_table_meta")?;
        Ok(())
    }

    /// Drain the pool on shutdown.
    pub async fn close(&self) -> Result<()> {
        self.pool
            .clone()
            .disconnect()
            .await
            .context("failed to disconnect metadata store")
    }
}

#[async_trait]
impl CheckpointStore for MetaStore {
    async fn save_table_meta(
        &self,
        data_source_id: &str,
        schema: &str,
        table: &str,
        pos: &GtidSet,
    ) -> Result<()> {
        let last_pos = serde_json::to_string(pos).context("failed to serialize position")?;
        let mut conn = self.pool.get_conn().await?;
        conn.exec_drop(
            "INSERT INTO cdc_table_meta (data_source_id, sc, tb, last_pos)
             VALUES (?, ?, ?, ?)
             ON DUPLICATE KEY UPDATE last_pos = VALUES(last_pos)",
            (data_source_id, schema, table, &last_pos),
        )
        .await
        .with_context(|| format!("failed to upsert table meta for {}.{}", schema, table))?;
        debug!(
            "Checkpoint: table {}.{} of {} at {}",
            schema, table, data_source_id, pos
        );
        Ok(())
    }

    async fn save_cdc_meta(&self, data_source_id: &str, kind: &str, pos: &GtidSet) -> Result<()> {
        let last_pos = serde_json::to_string(pos).context("failed to serialize position")?;
        let mut conn = self.pool.get_conn().await?;
        conn.exec_drop(
            "INSERT INTO cdc_meta (data_source_id, data_source_type, last_pos)
             VALUES (?, ?, ?)
             ON DUPLICATE KEY UPDATE
                 data_source_type = VALUES(data_source_type),
                 last_pos = VALUES(last_pos)",
            (data_source_id, kind, &last_pos),
        )
        .await
        .with_context(|| format!("failed to upsert cdc meta for {}", data_source_id))?;
        debug!("Checkpoint: source {} at {}", data_source_id, pos);
        Ok(())
    }
}
