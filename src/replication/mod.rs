//! Incremental engine: a resumable replication-log consumer.
//!
//! One service per source owns the reader task. It connects the binlog
//! stream positioned after `LastGTID`, advances that set on every GTID
//! event, and survives disconnects with exponential backoff (1s doubling to
//! 30s, giving up after `max_reconnect_attempts` consecutive failures).
//! Handler errors are logged and never stop the stream.

pub mod handler;
pub mod mysql;
pub mod schema_cache;

use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use futures::{Stream, StreamExt};
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::core::event::RowChange;
use crate::core::gtid::GtidSet;
use crate::meta::CheckpointStore;
use crate::source::DataSourceHolder;

pub use handler::{BinlogEventHandler, LogEventHandler};
pub use mysql::MySqlReplicationClient;

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// A decoded replication-log event, already freed of wire-format details.
#[derive(Debug, Clone)]
pub enum ReplicationEvent {
    /// A transaction identifier: advances `LastGTID`.
    Gtid { uuid: Uuid, gno: u64 },
    /// A statement from the log; only DDL statements are dispatched onward.
    Query { schema: String, query: String },
    /// Row images of one rows event.
    Rows {
        schema: String,
        table: String,
        changes: Vec<RowChange>,
    },
}

pub type EventStream = Pin<Box<dyn Stream<Item = Result<ReplicationEvent>> + Send>>;

/// Opens replication streams. The MySQL realization adapts the binlog
/// protocol client; tests drive the engine with scripted fakes.
#[async_trait]
pub trait ReplicationClient: Send + Sync {
    async fn connect(&self, server_id: u32, from: &GtidSet) -> Result<EventStream>;
}

struct ServiceState {
    running: bool,
    reconnect_attempts: u32,
}

/// The incremental engine for one source.
pub struct IncrementalService {
    holder: Arc<DataSourceHolder>,
    client: Arc<dyn ReplicationClient>,
    handler: Arc<dyn BinlogEventHandler>,
    meta: Option<Arc<dyn CheckpointStore>>,
    max_attempts: u32,
    checkpoint_interval: Duration,
    state: Mutex<ServiceState>,
    shutdown_tx: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl IncrementalService {
    pub fn new(
        holder: Arc<DataSourceHolder>,
        client: Arc<dyn ReplicationClient>,
        handler: Arc<dyn BinlogEventHandler>,
        meta: Option<Arc<dyn CheckpointStore>>,
        config: &EngineConfig,
    ) -> Arc<Self> {
        let (shutdown_tx, _) = watch::channel(false);
        Arc::new(Self {
            holder,
            client,
            handler,
            meta,
            max_attempts: config.max_reconnect_attempts,
            checkpoint_interval: Duration::from_secs(config.checkpoint_interval_secs.max(1)),
            state: Mutex::new(ServiceState {
                running: false,
                reconnect_attempts: 0,
            }),
            shutdown_tx,
            task: Mutex::new(None),
        })
    }

    /// Spawn the reader task. A second call while running is a no-op.
    pub fn start(self: &Arc<Self>) {
        {
            let mut state = self.state.lock();
            if state.running {
                warn!(
                    "Incremental service of '{}' is already running",
                    self.holder.config.id
                );
                return;
            }
            state.running = true;
            state.reconnect_attempts = 0;
        }
        self.shutdown_tx.send_replace(false);

        let service = self.clone();
        let shutdown_rx = self.shutdown_tx.subscribe();
        let handle = tokio::spawn(async move { service.run_loop(shutdown_rx).await });
        *self.task.lock() = Some(handle);
    }

    /// Signal the reader to exit. Idempotent; safe to call concurrently.
    pub fn stop(&self) {
        let was_running = {
            let mut state = self.state.lock();
            std::mem::replace(&mut state.running, false)
        };
        if !was_running {
            return;
        }
        info!("Stopping incremental service of '{}'", self.holder.config.id);
        let _ = self.shutdown_tx.send(true);
    }

    /// Stop and wait for the reader task to finish.
    pub async fn shutdown(&self) {
        self.stop();
        let task = self.task.lock().take();
        if let Some(task) = task {
            if let Err(err) = task.await {
                error!("Incremental reader task panicked: {}", err);
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.state.lock().running
    }

    /// Consecutive failed reconnect attempts, reset by a successful connect.
    pub fn reconnect_attempts(&self) -> u32 {
        self.state.lock().reconnect_attempts
    }

    async fn run_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let source_id = self.holder.config.id.clone();
        let mut backoff = INITIAL_BACKOFF;
        let mut attempts: u32 = 0;

        'reconnect: while self.is_running() && !*shutdown.borrow() {
            // Adopt the source's current position when no GTID state exists
            let from = { self.holder.last_gtid.lock().clone() };
            let from = if from.is_empty() {
                match self.holder.source.current_position().await {
                    Ok(pos) => {
                        info!(
                            "No GTID state for '{}', adopting current position {}",
                            source_id, pos
                        );
                        *self.holder.last_gtid.lock() = pos.clone();
                        pos
                    }
                    Err(err) => {
                        if self
                            .fallback(&mut backoff, &mut attempts, &mut shutdown, &err)
                            .await
                        {
                            continue;
                        }
                        break;
                    }
                }
            } else {
                from
            };

            let mut stream = match self.client.connect(self.holder.id, &from).await {
                Ok(stream) => stream,
                Err(err) => {
                    if self
                        .fallback(&mut backoff, &mut attempts, &mut shutdown, &err)
                        .await
                    {
                        continue;
                    }
                    break;
                }
            };

            info!("Replication stream of '{}' started after {}", source_id, from);
            backoff = INITIAL_BACKOFF;
            attempts = 0;
            self.state.lock().reconnect_attempts = 0;
            let mut last_checkpoint = Instant::now();

            let stream_err: Option<anyhow::Error> = loop {
                tokio::select! {
                    _ = shutdown.changed() => break None,
                    next = stream.next() => match next {
                        Some(Ok(event)) => {
                            self.dispatch(event).await;
                            self.maybe_checkpoint(&mut last_checkpoint).await;
                        }
                        Some(Err(err)) => break Some(err),
                        None => break Some(anyhow::anyhow!("replication stream ended")),
                    }
                }
            };
            drop(stream);

            match stream_err {
                None => break 'reconnect,
                Some(err) => {
                    if !self
                        .fallback(&mut backoff, &mut attempts, &mut shutdown, &err)
                        .await
                    {
                        break 'reconnect;
                    }
                }
            }
        }

        self.state.lock().running = false;
        self.persist_position().await;
        info!("Incremental service of '{}' stopped", source_id);
    }

    /// Count a failure and back off before the next attempt. Returns false
    /// when the failure budget is exhausted or shutdown fired during the
    /// sleep.
    async fn fallback(
        &self,
        backoff: &mut Duration,
        attempts: &mut u32,
        shutdown: &mut watch::Receiver<bool>,
        err: &anyhow::Error,
    ) -> bool {
        *attempts += 1;
        self.state.lock().reconnect_attempts = *attempts;
        if *attempts > self.max_attempts {
            error!(
                "Replication of '{}' failed {} consecutive times, giving up",
                self.holder.config.id, self.max_attempts
            );
            return false;
        }
        error!(
            "Replication of '{}' failed, retrying in {:?}: {:#}",
            self.holder.config.id, backoff, err
        );
        tokio::select! {
            _ = tokio::time::sleep(*backoff) => {}
            _ = shutdown.changed() => return false,
        }
        *backoff = (*backoff * 2).min(MAX_BACKOFF);
        true
    }

    async fn dispatch(&self, event: ReplicationEvent) {
        match event {
            ReplicationEvent::Gtid { uuid, gno } => {
                {
                    self.holder.last_gtid.lock().set(uuid, gno);
                }
                if let Err(err) = self.handler.on_gtid(&uuid, gno).await {
                    error!("OnGTID handler error: {:#}", err);
                }
            }
            ReplicationEvent::Query { schema, query } => {
                if is_ddl_query(&query) {
                    if let Err(err) = self.handler.on_ddl(&schema, &query).await {
                        error!("OnDDL handler error: {:#}", err);
                    }
                }
                // BEGIN and friends carry no row-level effect; RowsEvents do
            }
            ReplicationEvent::Rows {
                schema,
                table,
                changes,
            } => {
                if let Err(err) = self.handler.on_row(&schema, &table, &changes).await {
                    error!("OnRow handler error: {:#}", err);
                }
            }
        }
    }

    /// Debounced persistence of `LastGTID` through the metadata store.
    async fn maybe_checkpoint(&self, last: &mut Instant) {
        if self.meta.is_none() || last.elapsed() < self.checkpoint_interval {
            return;
        }
        *last = Instant::now();
        self.persist_position().await;
    }

    async fn persist_position(&self) {
        let Some(meta) = &self.meta else { return };
        let pos = { self.holder.last_gtid.lock().clone() };
        if pos.is_empty() {
            return;
        }
        if let Err(err) = meta
            .save_cdc_meta(&self.holder.config.id, &self.holder.config.kind, &pos)
            .await
        {
            error!(
                "Failed to checkpoint incremental position of '{}': {:#}",
                self.holder.config.id, err
            );
        }
    }
}

/// Only these statement kinds are surfaced as DDL; everything else in a
/// QueryEvent (BEGIN, dml in statement format, ...) is ignored.
pub(crate) fn is_ddl_query(query: &str) -> bool {
    let upper = query.trim().to_uppercase();
    ["CREATE", "ALTER", "DROP", "RENAME", "TRUNCATE"]
        .iter()
        .any(|prefix| upper.starts_with(prefix))
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicU32, Ordering};

    use crate::config::DataSourceConfig;
    use crate::core::event::RowMap;
    use crate::core::gtid::GtidSet;
    use crate::source::{DataSource, SchemaTables, SnapshotTx};

    fn uuid(n: u128) -> Uuid {
        Uuid::from_u128(n)
    }

    // -- fakes ---------------------------------------------------------------

    struct NullSource {
        pos: GtidSet,
    }

    #[async_trait]
    impl DataSource for NullSource {
        fn kind(&self) -> &'static str {
            "fake"
        }

        async fn list_schemas(&self) -> Result<Vec<String>> {
            Ok(vec![])
        }

        async fn list_tables(&self, _schemas: &[String]) -> Result<SchemaTables> {
            Ok(SchemaTables::new())
        }

        async fn begin_snapshot(&self) -> Result<Box<dyn SnapshotTx>> {
            Err(anyhow::anyhow!("not supported"))
        }

        async fn current_position(&self) -> Result<GtidSet> {
            Ok(self.pos.clone())
        }
    }

    enum ConnectOutcome {
        Fail,
        Succeed(Vec<ReplicationEvent>),
    }

    struct FakeClient {
        script: Mutex<VecDeque<ConnectOutcome>>,
        connects: AtomicU32,
    }

    impl FakeClient {
        fn new(script: Vec<ConnectOutcome>) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script.into()),
                connects: AtomicU32::new(0),
            })
        }
    }

    #[async_trait]
    impl ReplicationClient for FakeClient {
        async fn connect(&self, _server_id: u32, _from: &GtidSet) -> Result<EventStream> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            match self.script.lock().pop_front() {
                None | Some(ConnectOutcome::Fail) => {
                    Err(anyhow::anyhow!("connection refused"))
                }
                Some(ConnectOutcome::Succeed(events)) => {
                    let stream = futures::stream::iter(events.into_iter().map(Ok))
                        .chain(futures::stream::pending());
                    Ok(Box::pin(stream) as EventStream)
                }
            }
        }
    }

    #[derive(Default)]
    struct CountingHandler {
        rows: AtomicU32,
        ddls: AtomicU32,
        gtids: AtomicU32,
        fail: bool,
    }

    #[async_trait]
    impl BinlogEventHandler for CountingHandler {
        async fn on_row(&self, _schema: &str, _table: &str, _changes: &[RowChange]) -> Result<()> {
            self.rows.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(anyhow::anyhow!("handler failure"));
            }
            Ok(())
        }

        async fn on_ddl(&self, _schema: &str, _query: &str) -> Result<()> {
            self.ddls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn on_gtid(&self, _uuid: &Uuid, _gno: u64) -> Result<()> {
            self.gtids.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn test_holder() -> Arc<DataSourceHolder> {
        let config: DataSourceConfig = toml::from_str(
            r#"
            id = "src-1"
            type = "mysql"
            host = "localhost"
            user = "root"
            "#,
        )
        .unwrap();
        let mut pos = GtidSet::new();
        pos.set(uuid(7), 1);
        Arc::new(DataSourceHolder {
            id: 1,
            config,
            source: Arc::new(NullSource { pos }),
            last_gtid: Arc::new(Mutex::new(GtidSet::new())),
        })
    }

    fn test_service(
        client: Arc<FakeClient>,
        handler: Arc<CountingHandler>,
    ) -> Arc<IncrementalService> {
        IncrementalService::new(
            test_holder(),
            client,
            handler,
            None,
            &EngineConfig::default(),
        )
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(3600), async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("condition not reached");
    }

    fn sample_events() -> Vec<ReplicationEvent> {
        vec![
            ReplicationEvent::Gtid {
                uuid: uuid(7),
                gno: 2,
            },
            ReplicationEvent::Query {
                schema: "app".into(),
                query: "BEGIN".into(),
            },
            ReplicationEvent::Rows {
                schema: "app".into(),
                table: "orders".into(),
                changes: vec![RowChange::Insert {
                    after: RowMap::new(),
                }],
            },
            ReplicationEvent::Query {
                schema: "app".into(),
                query: "ALTER TABLE `orders` ADD COLUMN `x` int".into(),
            },
        ]
    }

    // -- tests ---------------------------------------------------------------

    #[test]
    fn test_is_ddl_query() {
        assert!(is_ddl_query("CREATE TABLE t (id int)"));
        assert!(is_ddl_query("  alter table t add column x int"));
        assert!(is_ddl_query("DROP TABLE t"));
        assert!(is_ddl_query("rename table a to b"));
        assert!(is_ddl_query("TRUNCATE t"));
        assert!(!is_ddl_query("BEGIN"));
        assert!(!is_ddl_query("INSERT INTO t VALUES (1)"));
        assert!(!is_ddl_query("COMMIT"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_after_failure_budget() {
        let client = FakeClient::new(vec![]); // every connect fails
        let service = test_service(client.clone(), Arc::new(CountingHandler::default()));

        service.start();
        wait_until(|| !service.is_running()).await;

        // 10 retried failures plus the final one that exhausts the budget
        assert_eq!(client.connects.load(Ordering::SeqCst), 11);
        service.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovers_after_failures_and_resets_budget() {
        let mut script: Vec<ConnectOutcome> = (0..10).map(|_| ConnectOutcome::Fail).collect();
        script.push(ConnectOutcome::Succeed(sample_events()));
        let client = FakeClient::new(script);
        let handler = Arc::new(CountingHandler::default());
        let service = test_service(client.clone(), handler.clone());

        service.start();
        wait_until(|| handler.rows.load(Ordering::SeqCst) == 1).await;

        assert!(service.is_running());
        assert_eq!(client.connects.load(Ordering::SeqCst), 11);
        assert_eq!(service.reconnect_attempts(), 0);

        // GTID events advanced the shared set; BEGIN was filtered, the ALTER
        // made it through
        assert_eq!(handler.gtids.load(Ordering::SeqCst), 1);
        assert_eq!(handler.ddls.load(Ordering::SeqCst), 1);
        let last = service.holder.last_gtid.lock().clone();
        assert!(last.to_string().contains(&format!("{}:1-2", uuid(7))));

        service.shutdown().await;
        assert!(!service.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_handler_errors_do_not_stop_stream() {
        let client = FakeClient::new(vec![ConnectOutcome::Succeed(sample_events())]);
        let handler = Arc::new(CountingHandler {
            fail: true,
            ..CountingHandler::default()
        });
        let service = test_service(client, handler.clone());

        service.start();
        wait_until(|| handler.rows.load(Ordering::SeqCst) == 1).await;
        assert!(service.is_running());
        service.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_is_idempotent_and_concurrent_safe() {
        let client = FakeClient::new(vec![ConnectOutcome::Succeed(vec![])]);
        let service = test_service(client, Arc::new(CountingHandler::default()));

        service.start();
        wait_until(|| service.reconnect_attempts() == 0 && service.is_running()).await;

        let a = service.clone();
        let b = service.clone();
        let (ra, rb) = tokio::join!(
            tokio::spawn(async move { a.stop() }),
            tokio::spawn(async move { b.stop() })
        );
        ra.unwrap();
        rb.unwrap();

        service.shutdown().await;
        assert!(!service.is_running());

        // A third stop on a stopped service is a no-op
        service.stop();
        assert!(!service.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_adopts_current_position_when_empty() {
        let client = FakeClient::new(vec![ConnectOutcome::Succeed(vec![])]);
        let service = test_service(client, Arc::new(CountingHandler::default()));
        assert!(service.holder.last_gtid.lock().is_empty());

        service.start();
        wait_until(|| !service.holder.last_gtid.lock().is_empty()).await;

        let adopted = service.holder.last_gtid.lock().clone();
        assert!(adopted.to_string().contains(&format!("{}:1-1", uuid(7))));
        service.shutdown().await;
    }
}
