// Copyright 2025
// Licensed under the Elastic License v2.0

//! Snapshot engine: per-table chunked reads inside consistent transactions.
//!
//! For each source, the filtered (schema, table) pairs are snapshotted by a
//! bounded pool of workers. Every worker pins one connection to a REPEATABLE
//! READ transaction, persists the captured replication position first, then
//! streams DDL + row chunks + a final end position through a shared event
//! channel drained by a single consumer pump.
//!
//! A failing table emits a `rollback` event and dies alone; the remaining
//! tables keep going and `run` reports the first error once all workers have
//! drained.

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::{mpsc, watch, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info};

use crate::config::EngineConfig;
use crate::core::error::{CoreError, CoreResult};
use crate::core::event::{Event, RowMap};
use crate::core::gtid::GtidSet;
use crate::filter::FilterRule;
use crate::meta::CheckpointStore;
use crate::sink::EventConsumer;
use crate::source::{DataSourceHolder, PkCursor, SchemaTables};

/// Sends snapshot events into the shared channel, racing the shared
/// cancellation signal. A fired signal fails the dispatch with a cancelled
/// error, which is fatal for the dispatching worker.
#[derive(Clone)]
struct EventDispatcher {
    tx: mpsc::Sender<Event>,
    cancel: watch::Receiver<bool>,
}

impl EventDispatcher {
    async fn send(&self, event: Event) -> CoreResult<()> {
        if *self.cancel.borrow() {
            return Err(CoreError::dispatch_cancelled("snapshot cancelled"));
        }
        let mut cancel = self.cancel.clone();
        tokio::select! {
            res = self.tx.send(event) => {
                res.map_err(|_| CoreError::dispatch_error("event channel closed"))
            }
            _ = cancel.changed() => Err(CoreError::dispatch_cancelled("snapshot cancelled")),
        }
    }

    async fn ddl(&self, schema: &str, table: &str, ddl: String) -> CoreResult<()> {
        self.send(Event::Ddl {
            schema: schema.to_string(),
            table: table.to_string(),
            ddl,
        })
        .await
    }

    async fn data(&self, schema: &str, table: &str, rows: Vec<RowMap>) -> CoreResult<()> {
        self.send(Event::Data {
            schema: schema.to_string(),
            table: table.to_string(),
            rows,
        })
        .await
    }

    async fn end(&self, schema: &str, table: &str, pos: GtidSet) -> CoreResult<()> {
        self.send(Event::End {
            schema: schema.to_string(),
            table: table.to_string(),
            pos,
        })
        .await
    }

    async fn rollback(&self, schema: &str, table: &str, err: &anyhow::Error) -> CoreResult<()> {
        self.send(Event::Rollback {
            schema: schema.to_string(),
            table: table.to_string(),
            err: format!("{:#}", err),
        })
        .await
    }
}

pub struct SnapshotService {
    chunk_size: usize,
    concurrency: usize,
    channel_capacity: usize,
}

impl SnapshotService {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            chunk_size: config.chunk_size.max(1),
            concurrency: config.snapshot_concurrency.max(1),
            channel_capacity: config.channel_capacity.max(1),
        }
    }

    /// Snapshot every in-scope table of one source.
    pub async fn run(
        &self,
        holder: &Arc<DataSourceHolder>,
        rule: &FilterRule,
        meta: Arc<dyn CheckpointStore>,
        consumer: Arc<dyn EventConsumer>,
        shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        let schemas = self.load_and_filter_schemas(holder, rule).await?;
        let tables = self.load_and_filter_tables(holder, rule, &schemas).await?;

        let pairs: Vec<(String, String)> = tables
            .into_iter()
            .flat_map(|(schema, list)| list.into_iter().map(move |t| (schema.clone(), t)))
            .collect();
        info!(
            "Snapshot of '{}': {} tables, concurrency {}, chunk size {}",
            holder.config.id,
            pairs.len(),
            self.concurrency,
            self.chunk_size
        );

        let (tx, rx) = mpsc::channel(self.channel_capacity);
        let pump = tokio::spawn(run_consumer(rx, consumer));

        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let mut workers: JoinSet<Result<()>> = JoinSet::new();

        for (schema, table) in pairs {
            let permit = semaphore
                .clone()
                .acquire_owned()
                .await
                .context("snapshot semaphore closed")?;
            let dispatcher = EventDispatcher {
                tx: tx.clone(),
                cancel: shutdown.clone(),
            };
            let holder = holder.clone();
            let meta = meta.clone();
            let chunk_size = self.chunk_size;

            workers.spawn(async move {
                let _permit = permit;
                let result =
                    read_one_table(&holder, &meta, &dispatcher, &schema, &table, chunk_size).await;
                if let Err(err) = &result {
                    error!("Snapshot of {}.{} failed: {:#}", schema, table, err);
                    if let Err(dispatch_err) = dispatcher.rollback(&schema, &table, err).await {
                        error!(
                            "Failed to dispatch rollback for {}.{}: {}",
                            schema, table, dispatch_err
                        );
                        return Err(dispatch_err.into());
                    }
                }
                result
            });
        }
        // Close the channel once every worker-held sender is gone so the
        // pump drains and exits.
        drop(tx);

        let mut first_err: Option<anyhow::Error> = None;
        while let Some(joined) = workers.join_next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    if first_err.is_none() {
                        first_err = Some(err);
                    }
                }
                Err(join_err) => {
                    if first_err.is_none() {
                        first_err =
                            Some(anyhow::Error::new(join_err).context("snapshot worker panicked"));
                    }
                }
            }
        }

        pump.await.context("consumer pump panicked")?;

        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    async fn load_and_filter_schemas(
        &self,
        holder: &DataSourceHolder,
        rule: &FilterRule,
    ) -> Result<Vec<String>> {
        let schemas = holder
            .source
            .list_schemas()
            .await
            .with_context(|| format!("failed to list schemas of '{}'", holder.config.id))?;
        Ok(rule.allow_schemas(schemas))
    }

    async fn load_and_filter_tables(
        &self,
        holder: &DataSourceHolder,
        rule: &FilterRule,
        schemas: &[String],
    ) -> Result<SchemaTables> {
        let tables = holder
            .source
            .list_tables(schemas)
            .await
            .with_context(|| format!("failed to list tables of '{}'", holder.config.id))?;

        let mut filtered = SchemaTables::new();
        for (schema, list) in tables {
            for table in list {
                if rule.allow(&schema, &table) {
                    filtered.entry(schema.clone()).or_default().push(table);
                }
            }
        }
        Ok(filtered)
    }
}

/// Drain the event channel into the consumer. Consumer errors are logged and
/// never stop the stream.
async fn run_consumer(mut rx: mpsc::Receiver<Event>, consumer: Arc<dyn EventConsumer>) {
    while let Some(event) = rx.recv().await {
        if let Err(err) = consumer.consume(&event).await {
            error!(
                "Consumer '{}' failed on {} event for {}.{}: {:#}",
                consumer.name(),
                event.kind(),
                event.schema(),
                event.table(),
                err
            );
        }
    }
    debug!("Consumer pump drained");
}

async fn read_one_table(
    holder: &DataSourceHolder,
    meta: &Arc<dyn CheckpointStore>,
    dispatcher: &EventDispatcher,
    schema: &str,
    table: &str,
    chunk_size: usize,
) -> Result<()> {
    let mut snap = holder
        .source
        .begin_snapshot()
        .await
        .with_context(|| format!("failed to open snapshot for {}.{}", schema, table))?;
    let pos = snap.position().clone();

    // Persist the handoff coordinate before reading anything: a crash
    // mid-snapshot must not lose the position this table can resume from.
    if let Err(err) = meta
        .save_table_meta(&holder.config.id, schema, table, &pos)
        .await
    {
        error!("Failed to checkpoint {}.{}: {:#}", schema, table, err);
    }

    let ddl = snap.table_ddl(schema, table).await?;
    dispatcher.ddl(schema, table, ddl).await?;

    let keys = snap.primary_keys(schema, table).await?;
    let mut cursor = PkCursor::new(keys);

    let total = snap.count_rows(schema, table).await?;
    let chunks = total.div_ceil(chunk_size as u64);
    debug!(
        "Snapshot {}.{}: {} rows in {} chunks",
        schema, table, total, chunks
    );

    for _ in 0..chunks {
        let (rows, next) = snap.fetch_chunk(schema, table, &cursor, chunk_size).await?;
        if rows.is_empty() {
            break;
        }
        dispatcher.data(schema, table, rows).await?;
        cursor = next;
    }

    dispatcher.end(schema, table, pos).await?;
    snap.commit().await?;
    Ok(())
}
