//! Shared test doubles for capture integration tests
//!
//! - [`RecordingTransform`]: records every `apply`, optionally rejecting one destination
//!   or sleeping before each write
//! - [`RecordingAuditSink`]: records audit entries
//! - [`ScriptedConnector`]: in-memory binlog connections fed by the test
//! - [`ScriptedDeltaReader`]: canned delta batches per table group
//! - [`FlakyStore`]: metadata store whose saves can be made to fail

#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use ripple_cdc::common::{
    AuditSink, CdcError, ConnectorConfig, DeltaBatch, DeltaReader, DerivedChangeEvent,
    ErrorCategory, Mapping, MemoryMetadataStore, MetadataStore, NodeAddr, Result, StreamPosition,
    TableDef, TableGroupConfig, TaskMeta, Transform,
};
use ripple_cdc::mysql::{BinlogConnector, BinlogTransport, ColumnDef, ColumnType};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, Once};
use std::time::Duration;
use tokio::sync::mpsc;

static INIT: Once = Once::new();

/// Initialize test logging (idempotent)
pub fn init_test_logging() {
    INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::from_default_env()
                    .add_directive("ripple_cdc=debug".parse().unwrap()),
            )
            .with_test_writer()
            .try_init()
            .ok();
    });
}

/// Poll `cond` until it holds, panicking after ~2s.
pub async fn wait_until(what: &str, cond: impl Fn() -> bool) {
    for _ in 0..400 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("timed out waiting for {}", what);
}

pub const TASK_ID: &str = "orders-sync";
pub const CONNECTOR_ID: &str = "shop-primary";

pub fn orders_columns() -> Vec<ColumnDef> {
    vec![
        ColumnDef::new(ColumnType::Long, 0),
        ColumnDef::new(ColumnType::Varchar, 255),
    ]
}

pub fn orders_group(destination: &str) -> TableGroupConfig {
    TableGroupConfig::new(
        TableDef::new("orders", ["id", "name"]),
        TableDef::new(destination, ["id", "name"]),
    )
}

/// Store with one connector, the `orders-sync` mapping and `groups`.
pub async fn seeded_store(mapping: Mapping, groups: Vec<TableGroupConfig>) -> MemoryMetadataStore {
    let store = MemoryMetadataStore::new();
    store
        .put_connector(
            ConnectorConfig::new(CONNECTOR_ID, "mysql://db-1:3306,db-2:3306/shop", "repl")
                .with_password("secret"),
        )
        .await;
    store.put_mapping(mapping).await;
    store
        .put_table_groups(
            TASK_ID,
            groups
                .into_iter()
                .enumerate()
                .map(|(idx, g)| g.with_index(idx))
                .collect(),
        )
        .await;
    store
}

pub fn log_mapping() -> Mapping {
    Mapping::new(TASK_ID, CONNECTOR_ID).with_target("warehouse")
}

#[derive(Default)]
pub struct RecordingTransform {
    calls: Mutex<Vec<(String, DerivedChangeEvent)>>,
    reject: Mutex<Option<String>>,
    delay: Mutex<Option<Duration>>,
    started: AtomicUsize,
}

impl RecordingTransform {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail every apply targeting `destination`.
    pub fn reject(&self, destination: &str) {
        *self.reject.lock().unwrap() = Some(destination.to_string());
    }

    /// Sleep for `delay` inside every apply.
    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = Some(delay);
    }

    /// Applies entered, including ones still sleeping or abandoned.
    pub fn started(&self) -> usize {
        self.started.load(Ordering::SeqCst)
    }

    pub fn calls(&self) -> Vec<(String, DerivedChangeEvent)> {
        self.calls.lock().unwrap().clone()
    }

    pub fn destinations(&self) -> Vec<String> {
        self.calls().into_iter().map(|(d, _)| d).collect()
    }

    pub fn count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

#[async_trait]
impl Transform for RecordingTransform {
    async fn apply(
        &self,
        _mapping: &Mapping,
        group: &TableGroupConfig,
        event: &DerivedChangeEvent,
    ) -> Result<()> {
        self.started.fetch_add(1, Ordering::SeqCst);
        let delay = *self.delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let destination = group.destination_table.name.clone();
        if self.reject.lock().unwrap().as_deref() == Some(destination.as_str()) {
            return Err(CdcError::downstream(format!("{} refused the row", destination)));
        }
        self.calls.lock().unwrap().push((destination, event.clone()));
        Ok(())
    }
}

#[derive(Default)]
pub struct RecordingAuditSink {
    records: Mutex<Vec<(ErrorCategory, String)>>,
}

impl RecordingAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<(ErrorCategory, String)> {
        self.records.lock().unwrap().clone()
    }

    pub fn categories(&self) -> Vec<ErrorCategory> {
        self.records().into_iter().map(|(c, _)| c).collect()
    }
}

impl AuditSink for RecordingAuditSink {
    fn record(&self, category: ErrorCategory, message: &str) {
        self.records
            .lock()
            .unwrap()
            .push((category, message.to_string()));
    }
}

type Feed = mpsc::UnboundedSender<Result<Vec<u8>>>;

struct ScriptedTransport(mpsc::UnboundedReceiver<Result<Vec<u8>>>);

#[async_trait]
impl BinlogTransport for ScriptedTransport {
    async fn next_event(&mut self) -> Result<Option<Bytes>> {
        match self.0.recv().await {
            Some(Ok(event)) => Ok(Some(Bytes::from(event))),
            Some(Err(e)) => Err(e),
            None => Ok(None),
        }
    }
}

/// Binlog connector serving pre-arranged in-memory connections.
///
/// Each [`ScriptedConnector::connection`] call queues one connection and
/// returns the sender that feeds it. `open` with nothing queued is refused.
#[derive(Default)]
pub struct ScriptedConnector {
    pending: Mutex<VecDeque<mpsc::UnboundedReceiver<Result<Vec<u8>>>>>,
    opened: Mutex<Vec<(NodeAddr, StreamPosition)>>,
    open_delay: Mutex<Option<Duration>>,
}

impl ScriptedConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connection(&self) -> Feed {
        let (tx, rx) = mpsc::unbounded_channel();
        self.pending.lock().unwrap().push_back(rx);
        tx
    }

    /// Sleep for `delay` before serving each open.
    pub fn set_open_delay(&self, delay: Duration) {
        *self.open_delay.lock().unwrap() = Some(delay);
    }

    /// Every successful open: node and starting position.
    pub fn opened(&self) -> Vec<(NodeAddr, StreamPosition)> {
        self.opened.lock().unwrap().clone()
    }
}

#[async_trait]
impl BinlogConnector for ScriptedConnector {
    async fn open(
        &self,
        node: &NodeAddr,
        _connector: &ConnectorConfig,
        position: &StreamPosition,
    ) -> Result<Box<dyn BinlogTransport>> {
        let delay = *self.open_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let rx = self
            .pending
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| CdcError::connection(format!("{} refused connection", node)))?;
        self.opened
            .lock()
            .unwrap()
            .push((node.clone(), position.clone()));
        Ok(Box::new(ScriptedTransport(rx)))
    }
}

/// Delta reader returning queued batches per table group index.
#[derive(Default)]
pub struct ScriptedDeltaReader {
    batches: Mutex<HashMap<String, VecDeque<DeltaBatch>>>,
    reads: Mutex<Vec<(String, Option<String>)>>,
}

impl ScriptedDeltaReader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, group_index: usize, batch: DeltaBatch) {
        self.batches
            .lock()
            .unwrap()
            .entry(group_index.to_string())
            .or_default()
            .push_back(batch);
    }

    /// Every read: destination table and the cursor passed in.
    pub fn reads(&self) -> Vec<(String, Option<String>)> {
        self.reads.lock().unwrap().clone()
    }
}

#[async_trait]
impl DeltaReader for ScriptedDeltaReader {
    async fn read_delta(
        &self,
        _connector: &ConnectorConfig,
        group: &TableGroupConfig,
        cursor: Option<&str>,
    ) -> Result<DeltaBatch> {
        self.reads.lock().unwrap().push((
            group.destination_table.name.clone(),
            cursor.map(str::to_string),
        ));
        Ok(self
            .batches
            .lock()
            .unwrap()
            .get_mut(&group.cursor_key())
            .and_then(VecDeque::pop_front)
            .unwrap_or_default())
    }
}

/// Memory store whose `save_task_meta` fails while `failing` is set.
#[derive(Default)]
pub struct FlakyStore {
    pub inner: MemoryMetadataStore,
    failing: AtomicBool,
}

impl FlakyStore {
    pub fn new(inner: MemoryMetadataStore) -> Self {
        Self {
            inner,
            failing: AtomicBool::new(false),
        }
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

#[async_trait]
impl MetadataStore for FlakyStore {
    async fn get_connector(&self, connector_id: &str) -> Result<Option<ConnectorConfig>> {
        self.inner.get_connector(connector_id).await
    }

    async fn get_mapping(&self, mapping_id: &str) -> Result<Option<Mapping>> {
        self.inner.get_mapping(mapping_id).await
    }

    async fn get_table_groups(&self, task_id: &str) -> Result<Vec<TableGroupConfig>> {
        self.inner.get_table_groups(task_id).await
    }

    async fn get_task_meta(&self, task_id: &str) -> Result<Option<TaskMeta>> {
        self.inner.get_task_meta(task_id).await
    }

    async fn save_task_meta(&self, meta: &TaskMeta) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(CdcError::store("metadata store unavailable"));
        }
        self.inner.save_task_meta(meta).await
    }
}
