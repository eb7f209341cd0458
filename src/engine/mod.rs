// Copyright 2025
// Licensed under the Elastic License v2.0

pub mod snapshot;

use std::sync::Arc;

use anyhow::Result;
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::config::CdcConfig;
use crate::meta::{CheckpointStore, MetaStore};
use crate::replication::{IncrementalService, LogEventHandler, MySqlReplicationClient};
use crate::sink::{ConsoleConsumer, EventConsumer};
use crate::source::init_data_sources;
use snapshot::SnapshotService;

/// Main CDC engine that orchestrates all components: metadata store, source
/// registry, the snapshot phase, and the incremental services that run until
/// SIGINT/SIGTERM.
pub struct CdcEngine {
    config: CdcConfig,
}

impl CdcEngine {
    pub fn new(config: CdcConfig) -> Self {
        Self { config }
    }

    pub async fn run(self) -> Result<()> {
        let engine_config = self.config.engine.clone();

        // 1. Metadata store (checkpoint tables are created here)
        let meta = Arc::new(MetaStore::connect(&self.config.cdc_data_source).await?);
        let checkpoints: Arc<dyn CheckpointStore> = meta.clone();

        // 2. Source registry; startup positions are checkpointed per source
        let holders =
            init_data_sources(&self.config, &engine_config, checkpoints.as_ref()).await?;
        if holders.is_empty() {
            warn!("No usable data sources configured");
        }

        let consumer: Arc<dyn EventConsumer> = Arc::new(ConsoleConsumer);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        tokio::spawn(async move {
            wait_for_signal().await;
            info!("Shutdown signal received");
            let _ = shutdown_tx.send(true);
        });

        // 3. Snapshot phase, one source at a time (tables run concurrently
        // within a source). A failed source is reported and skipped.
        let snapshot = SnapshotService::new(&engine_config);
        let mut first_err: Option<anyhow::Error> = None;
        for holder in &holders {
            if *shutdown_rx.borrow() {
                break;
            }
            let rule = holder.config.filter_rule();
            match snapshot
                .run(
                    holder,
                    &rule,
                    checkpoints.clone(),
                    consumer.clone(),
                    shutdown_rx.clone(),
                )
                .await
            {
                Ok(()) => info!("Snapshot of '{}' complete", holder.config.id),
                Err(err) => {
                    error!("Snapshot of '{}' failed: {:#}", holder.config.id, err);
                    if first_err.is_none() {
                        first_err = Some(err);
                    }
                }
            }
        }

        // 4. Incremental phase: one binlog service per source, until shutdown
        let mut services = Vec::new();
        if !*shutdown_rx.borrow() {
            for holder in &holders {
                let client = Arc::new(MySqlReplicationClient::new(&holder.config));
                let handler = Arc::new(LogEventHandler::new(holder.config.filter_rule()));
                let service = IncrementalService::new(
                    holder.clone(),
                    client,
                    handler,
                    Some(checkpoints.clone()),
                    &engine_config,
                );
                service.start();
                services.push(service);
            }

            let mut shutdown = shutdown_rx.clone();
            while !*shutdown.borrow() {
                if shutdown.changed().await.is_err() {
                    break;
                }
            }
        }

        // 5. Ordered shutdown: signal everything, then wait
        for service in &services {
            service.stop();
        }
        for service in &services {
            service.shutdown().await;
        }
        if let Err(err) = meta.close().await {
            warn!("Metadata store disconnect failed: {:#}", err);
        }

        info!("binrelay shutdown complete");
        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(err) => {
                error!("Failed to install SIGTERM handler: {}", err);
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
