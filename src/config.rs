// Copyright 2025
// Licensed under the Elastic License v2.0

use std::collections::BTreeMap;
use std::env;
use std::fmt;
use std::fs;

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::info;

use crate::filter::FilterRule;

/// Environment variable naming the config file; defaults to `config.toml`.
const CONFIG_PATH_VAR: &str = "BINRELAY_CONFIG";

// =============================================================================
// Data source configuration
// =============================================================================

/// One captured source database (or the metadata target).
#[derive(Clone, Deserialize)]
pub struct DataSourceConfig {
    #[serde(default)]
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub user: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub database: String,
    #[serde(default)]
    pub params: BTreeMap<String, String>,
    #[serde(default)]
    pub global_filter: Option<FilterConfig>,
    #[serde(default)]
    pub schema_filters: BTreeMap<String, FilterConfig>,
}

fn default_port() -> u16 {
    3306
}

impl DataSourceConfig {
    pub fn is_mysql(&self) -> bool {
        self.kind.eq_ignore_ascii_case("mysql")
    }

    /// Compile the filter blocks into the runtime rule.
    pub fn filter_rule(&self) -> FilterRule {
        FilterRule::compile(self)
    }
}

impl fmt::Debug for DataSourceConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataSourceConfig")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &"[REDACTED]")
            .field("database", &self.database)
            .field("params", &self.params)
            .field("global_filter", &self.global_filter)
            .field("schema_filters", &self.schema_filters)
            .finish()
    }
}

/// Raw filter block: comma-separated lists, a trailing `_` on a table entry
/// means prefix match.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct FilterConfig {
    #[serde(default)]
    pub include_schemas: String,
    #[serde(default)]
    pub include_tables: String,
    #[serde(default)]
    pub exclude_tables: String,
}

// =============================================================================
// Engine tuning
// =============================================================================

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Rows per snapshot chunk.
    pub chunk_size: usize,
    /// Tables snapshotted concurrently per source.
    pub snapshot_concurrency: usize,
    /// Capacity of the snapshot event channel.
    pub channel_capacity: usize,
    /// Debounce for persisting the incremental position.
    pub checkpoint_interval_secs: u64,
    /// Reconnect attempts before the incremental engine gives up.
    pub max_reconnect_attempts: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            chunk_size: 100,
            snapshot_concurrency: 10,
            channel_capacity: 1000,
            checkpoint_interval_secs: 5,
            max_reconnect_attempts: 10,
        }
    }
}

// =============================================================================
// Main configuration
// =============================================================================

/// Central configuration for binrelay, loaded from a TOML file.
#[derive(Clone, Debug, Deserialize)]
pub struct CdcConfig {
    #[serde(rename = "DATASOURCE", default)]
    pub data_sources: Vec<DataSourceConfig>,
    #[serde(rename = "CDC_DATASOURCE")]
    pub cdc_data_source: DataSourceConfig,
    #[serde(rename = "ENGINE", default)]
    pub engine: EngineConfig,
}

impl CdcConfig {
    /// Load from the path in `BINRELAY_CONFIG` (default `config.toml`).
    pub fn load() -> Result<Self> {
        let path = env::var(CONFIG_PATH_VAR).unwrap_or_else(|_| "config.toml".to_string());
        Self::load_from(&path)
    }

    pub fn load_from(path: &str) -> Result<Self> {
        let data =
            fs::read_to_string(path).with_context(|| format!("failed to read config {}", path))?;
        Self::parse(&data).with_context(|| format!("failed to parse config {}", path))
    }

    pub fn parse(data: &str) -> Result<Self> {
        let config: CdcConfig = toml::from_str(data)?;
        Ok(config)
    }

    /// Print banner with configuration
    pub fn print_banner(&self) {
        info!("Starting binrelay...");
        for source in &self.data_sources {
            info!(
                "Source: {} ({} {}:{}/{})",
                source.id, source.kind, source.host, source.port, source.database
            );
        }
        info!(
            "Metadata: {} {}:{}/{}",
            self.cdc_data_source.kind,
            self.cdc_data_source.host,
            self.cdc_data_source.port,
            self.cdc_data_source.database
        );
        info!(
            "Snapshot: chunk_size={} concurrency={} channel={}",
            self.engine.chunk_size, self.engine.snapshot_concurrency, self.engine.channel_capacity
        );
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    const SAMPLE: &str = r#"
        [[DATASOURCE]]
        id = "prod-1"
        type = "mysql"
        host = "db.internal"
        port = 3307
        user = "repl"
        password = "secret"
        database = "app"
        params = { charset = "utf8mb4" }

        [DATASOURCE.global_filter]
        include_schemas = "app,logs"
        exclude_tables = "tmp_"

        [DATASOURCE.schema_filters.app]
        include_tables = "orders,users_"

        [CDC_DATASOURCE]
        type = "mysql"
        host = "meta.internal"
        user = "cdc"
        password = "metapass"
        database = "cdc_meta"
    "#;

    #[test]
    fn test_parse_sample() {
        let config = CdcConfig::parse(SAMPLE).unwrap();

        assert_eq!(config.data_sources.len(), 1);
        let source = &config.data_sources[0];
        assert_eq!(source.id, "prod-1");
        assert!(source.is_mysql());
        assert_eq!(source.host, "db.internal");
        assert_eq!(source.port, 3307);
        assert_eq!(source.params.get("charset").unwrap(), "utf8mb4");
        assert_eq!(
            source.global_filter.as_ref().unwrap().include_schemas,
            "app,logs"
        );
        assert_eq!(
            source.schema_filters.get("app").unwrap().include_tables,
            "orders,users_"
        );

        assert_eq!(config.cdc_data_source.database, "cdc_meta");
        // Defaults
        assert_eq!(config.cdc_data_source.port, 3306);
        assert_eq!(config.engine.chunk_size, 100);
        assert_eq!(config.engine.snapshot_concurrency, 10);
        assert_eq!(config.engine.channel_capacity, 1000);
        assert_eq!(config.engine.max_reconnect_attempts, 10);
    }

    #[test]
    fn test_engine_overrides() {
        let toml = format!(
            "{SAMPLE}\n[ENGINE]\nchunk_size = 500\nsnapshot_concurrency = 4\n"
        );
        let config = CdcConfig::parse(&toml).unwrap();
        assert_eq!(config.engine.chunk_size, 500);
        assert_eq!(config.engine.snapshot_concurrency, 4);
        // Unspecified keys keep their defaults
        assert_eq!(config.engine.channel_capacity, 1000);
    }

    #[test]
    fn test_compiled_filter() {
        let config = CdcConfig::parse(SAMPLE).unwrap();
        let rule = config.data_sources[0].filter_rule();

        assert!(rule.allow("app", "orders"));
        assert!(rule.allow("app", "users_archive"));
        assert!(!rule.allow("app", "payments"));
        assert!(rule.allow("logs", "anything"));
        assert!(!rule.allow("logs", "tmp_scratch"));
        assert!(!rule.allow("other", "orders"));
    }

    #[test]
    fn test_missing_cdc_datasource_is_fatal() {
        let toml = r#"
            [[DATASOURCE]]
            id = "x"
            type = "mysql"
            host = "h"
            user = "u"
        "#;
        assert!(CdcConfig::parse(toml).is_err());
    }

    #[test]
    fn test_debug_redacts_password() {
        let config = CdcConfig::parse(SAMPLE).unwrap();
        let debug = format!("{:?}", config.data_sources[0]);
        assert!(debug.contains("[REDACTED]"));
        assert!(!debug.contains("secret"));
    }

    #[test]
    #[serial]
    fn test_load_honors_config_path_var() {
        let dir = env::temp_dir().join("binrelay-config-test");
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join("cdc.toml");
        fs::write(&path, SAMPLE).unwrap();

        env::set_var(CONFIG_PATH_VAR, &path);
        let config = CdcConfig::load().unwrap();
        assert_eq!(config.data_sources[0].id, "prod-1");
        env::remove_var(CONFIG_PATH_VAR);
    }

    #[test]
    #[serial]
    fn test_load_missing_file() {
        env::set_var(CONFIG_PATH_VAR, "/nonexistent/binrelay.toml");
        assert!(CdcConfig::load().is_err());
        env::remove_var(CONFIG_PATH_VAR);
    }
}
