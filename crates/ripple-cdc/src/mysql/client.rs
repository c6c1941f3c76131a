//! Binlog streaming client
//!
//! [`BinlogStreamClient`] owns one replication connection at a time. On
//! `start()` it resolves the node list, opens a [`BinlogTransport`] through
//! its [`BinlogConnector`] at the tracked position, and spawns a read loop
//! that decodes every event and hands it to the registered
//! [`BinlogEventListener`] in wire order.
//!
//! ```text
//! BinlogConnector::open ──► BinlogTransport ──► BinlogDecoder ──► listener
//!                                                    │
//!                                                    └──► BookmarkTracker
//! ```
//!
//! Each `start()` creates a fresh [`BinlogDecoder`], so table ids cached by a
//! previous connection are never reused.

use crate::common::{
    BookmarkTracker, CdcError, ConnectorConfig, EngineConfig, NodeAddr, Result, StreamPosition,
    Validator, BINLOG_START_OFFSET,
};
use crate::mysql::decoder::{BinlogDecoder, BinlogEvent, DecodedEvent, RowFilter};
use crate::mysql::protocol::{BinlogStream, MySqlBinlogClient};
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

/// Source of raw binlog events (header + body, no packet framing).
#[async_trait]
pub trait BinlogTransport: Send {
    /// Next event, `None` once the server ends the stream.
    async fn next_event(&mut self) -> Result<Option<Bytes>>;

    /// Whether events carry a trailing CRC32 from the first byte on.
    fn checksum(&self) -> bool {
        false
    }
}

/// Opens replication connections.
#[async_trait]
pub trait BinlogConnector: Send + Sync {
    async fn open(
        &self,
        node: &NodeAddr,
        connector: &ConnectorConfig,
        position: &StreamPosition,
    ) -> Result<Box<dyn BinlogTransport>>;
}

/// Receives decoded events from a [`BinlogStreamClient`].
///
/// Calls are sequential per client and never overlap.
#[async_trait]
pub trait BinlogEventListener: Send + Sync {
    async fn on_event(&self, event: &DecodedEvent);

    /// The read loop ended on a fatal error. No further events follow.
    async fn on_error(&self, error: &CdcError);
}

fn connection_error(e: anyhow::Error) -> CdcError {
    CdcError::connection(format!("{:#}", e))
}

/// [`BinlogTransport`] over a live MySQL replication connection.
#[derive(Debug)]
pub struct MySqlTransport {
    stream: BinlogStream,
    checksum: bool,
}

#[async_trait]
impl BinlogTransport for MySqlTransport {
    async fn next_event(&mut self) -> Result<Option<Bytes>> {
        self.stream.next_event().await.map_err(connection_error)
    }

    fn checksum(&self) -> bool {
        self.checksum
    }
}

/// Connects to MySQL/MariaDB as a replica.
#[derive(Debug, Clone)]
pub struct MySqlConnector {
    connect_timeout: Duration,
    server_id: u32,
}

impl MySqlConnector {
    pub fn new(engine: &EngineConfig) -> Self {
        Self {
            connect_timeout: engine.connect_timeout(),
            server_id: engine.server_id,
        }
    }
}

impl Default for MySqlConnector {
    fn default() -> Self {
        Self::new(&EngineConfig::default())
    }
}

#[async_trait]
impl BinlogConnector for MySqlConnector {
    async fn open(
        &self,
        node: &NodeAddr,
        connector: &ConnectorConfig,
        position: &StreamPosition,
    ) -> Result<Box<dyn BinlogTransport>> {
        Validator::validate_connection_url(&connector.url)?;
        let server_id = connector.server_id.unwrap_or(self.server_id);

        let (file, offset) = if position.is_start() {
            ("", BINLOG_START_OFFSET)
        } else {
            (position.file_name.as_str(), position.dump_offset())
        };
        let offset = u32::try_from(offset).map_err(|_| {
            CdcError::config(format!("binlog offset {} out of range", offset))
        })?;

        let mut client = MySqlBinlogClient::connect(
            node,
            &connector.username,
            connector.password.as_deref(),
            self.connect_timeout,
        )
        .await
        .map_err(connection_error)?;

        let checksum = client.negotiate_checksum().await.map_err(connection_error)?;
        client
            .register_slave(server_id)
            .await
            .map_err(connection_error)?;
        let stream = client
            .binlog_dump(server_id, file, offset)
            .await
            .map_err(connection_error)?;

        Ok(Box::new(MySqlTransport { stream, checksum }))
    }
}

type ListenerSlot = Arc<RwLock<Option<Arc<dyn BinlogEventListener>>>>;

/// Replication client for one capture task.
pub struct BinlogStreamClient {
    config: ConnectorConfig,
    connector: Arc<dyn BinlogConnector>,
    tracker: Arc<BookmarkTracker>,
    row_filter: Option<RowFilter>,
    read_timeout: Option<Duration>,
    listener: ListenerSlot,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
    started: AtomicBool,
    closed: AtomicBool,
}

impl std::fmt::Debug for BinlogStreamClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BinlogStreamClient")
            .field("connector_id", &self.config.id)
            .field("position", &self.tracker.position())
            .field("started", &self.started.load(Ordering::Relaxed))
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl BinlogStreamClient {
    pub fn new(
        config: ConnectorConfig,
        connector: Arc<dyn BinlogConnector>,
        tracker: Arc<BookmarkTracker>,
    ) -> Self {
        Self {
            config,
            connector,
            tracker,
            row_filter: None,
            read_timeout: None,
            listener: Arc::new(RwLock::new(None)),
            cancel: CancellationToken::new(),
            task: Mutex::new(None),
            started: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }
    }

    /// Skip row events of tables the filter rejects, without decoding rows.
    pub fn with_row_filter(mut self, filter: RowFilter) -> Self {
        self.row_filter = Some(filter);
        self
    }

    /// Treat a stream idle for longer than `timeout` as dropped.
    pub fn with_read_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.read_timeout = timeout;
        self
    }

    /// Current stream position.
    pub fn position(&self) -> StreamPosition {
        self.tracker.position()
    }

    pub fn tracker(&self) -> &Arc<BookmarkTracker> {
        &self.tracker
    }

    /// Whether the read loop is alive.
    pub fn is_running(&self) -> bool {
        self.task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .is_some_and(|t| !t.is_finished())
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Connect and launch the read loop.
    ///
    /// Nodes are tried in order starting with the primary. A client starts
    /// at most once.
    pub async fn start(&self, listener: Arc<dyn BinlogEventListener>) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(CdcError::invalid_state("client is closed"));
        }
        if self.started.swap(true, Ordering::AcqRel) {
            return Err(CdcError::invalid_state("client already started"));
        }

        let nodes = self.config.nodes()?;
        let position = self.tracker.position();
        let mut last_error = None;
        let mut transport = None;
        for node in &nodes {
            match self.connector.open(node, &self.config, &position).await {
                Ok(t) => {
                    info!(node = %node, position = %position, "Binlog stream opened");
                    transport = Some(t);
                    break;
                }
                Err(e) => {
                    warn!(node = %node, "Failed to open binlog stream: {}", e);
                    last_error = Some(e);
                }
            }
        }
        let Some(transport) = transport else {
            return Err(last_error
                .unwrap_or_else(|| CdcError::connection("no reachable node")));
        };

        let mut decoder = BinlogDecoder::new().with_checksum(transport.checksum());
        if let Some(filter) = &self.row_filter {
            decoder = decoder.with_row_filter(filter.clone());
        }

        *self.listener.write().await = Some(listener);

        let read_loop = ReadLoop {
            transport,
            decoder,
            tracker: self.tracker.clone(),
            listener: self.listener.clone(),
            cancel: self.cancel.clone(),
            read_timeout: self.read_timeout,
        };
        let handle = tokio::spawn(read_loop.run());
        *self.task.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);
        Ok(())
    }

    /// Stop the read loop and detach the listener. Idempotent.
    ///
    /// Once this returns, the listener is never called again. An event the
    /// listener is still handling is dropped at its next await point rather
    /// than run to completion. Must not be awaited from inside a listener
    /// callback.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.cancel.cancel();
        self.listener.write().await.take();

        let task = self.task.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!("Binlog read loop ended abnormally: {}", e);
            }
        }
        debug!(connector_id = %self.config.id, "Binlog client closed");
    }
}

struct ReadLoop {
    transport: Box<dyn BinlogTransport>,
    decoder: BinlogDecoder,
    tracker: Arc<BookmarkTracker>,
    listener: ListenerSlot,
    cancel: CancellationToken,
    read_timeout: Option<Duration>,
}

impl ReadLoop {
    async fn next_raw(&mut self) -> Result<Option<Bytes>> {
        match self.read_timeout {
            Some(limit) => tokio::time::timeout(limit, self.transport.next_event())
                .await
                .map_err(|_| {
                    CdcError::connection(format!(
                        "no binlog data for {}s",
                        limit.as_secs()
                    ))
                })?,
            None => self.transport.next_event().await,
        }
    }

    async fn run(mut self) {
        let cancel = self.cancel.clone();
        let failure = loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => break None,
                next = self.next_raw() => next,
            };
            let data = match next {
                Ok(Some(data)) => data,
                Ok(None) => break Some(CdcError::ConnectionClosed),
                Err(e) => break Some(e),
            };
            let decoded = match self.decoder.decode(&data) {
                Ok(Some(decoded)) => decoded,
                Ok(None) => continue,
                Err(e) => break Some(e),
            };

            if let BinlogEvent::Control(control) = &decoded.event {
                if self.tracker.advance(control.next_file(), control.next_offset()) {
                    trace!(position = %self.tracker.position(), "Position advanced");
                }
            }

            let Some(listener) = self.listener.read().await.clone() else {
                break None;
            };
            // An event still being dispatched is abandoned on close.
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break None,
                _ = listener.on_event(&decoded) => {}
            }
        };

        if let Some(err) = failure {
            if !cancel.is_cancelled() {
                error!(position = %self.tracker.position(), "Binlog stream failed: {}", err);
                if let Some(listener) = self.listener.read().await.as_ref() {
                    listener.on_error(&err).await;
                }
            }
        }
        self.listener.write().await.take();
        debug!("Binlog read loop stopped");
    }
}
