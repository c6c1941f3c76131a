//! Capture task lifecycle
//!
//! ```text
//! CREATED ──► STARTING ──► RUNNING ──► STOPPING ──► STOPPED
//!                 │            │
//!                 └────────────┴──► FAILED
//! ```
//!
//! [`LogExtractor`] drives one binlog capture task: it resolves its table
//! groups into field pickers, opens a [`BinlogStreamClient`] at the persisted
//! bookmark and routes every decoded row through a [`LogDispatcher`].
//! Position changes only mark the bookmark dirty; the registry's flush tick
//! persists them.

use crate::capture::context::{TaskBookmark, TaskContext};
use crate::capture::dispatch::LogDispatcher;
use crate::common::{
    CdcError, Extractor, ListenerKind, Result, RowChangeEvent, StreamPosition,
};
use crate::mysql::{
    BinlogEvent, BinlogEventListener, BinlogStreamClient, DecodedEvent, RowFilter, TableMapEvent,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use tracing::{debug, error, info, trace, warn};

/// Lifecycle state of a capture task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[repr(u8)]
pub enum TaskState {
    Created = 0,
    Starting = 1,
    Running = 2,
    Stopping = 3,
    Stopped = 4,
    Failed = 5,
}

impl TaskState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Created,
            1 => Self::Starting,
            2 => Self::Running,
            3 => Self::Stopping,
            4 => Self::Stopped,
            _ => Self::Failed,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "CREATED",
            Self::Starting => "STARTING",
            Self::Running => "RUNNING",
            Self::Stopping => "STOPPING",
            Self::Stopped => "STOPPED",
            Self::Failed => "FAILED",
        }
    }

    /// STOPPED or FAILED: the task will never deliver again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Stopped | Self::Failed)
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Atomic task state with compare-and-set transitions.
#[derive(Debug)]
pub struct StateCell(AtomicU8);

impl Default for StateCell {
    fn default() -> Self {
        Self::new()
    }
}

impl StateCell {
    pub fn new() -> Self {
        Self(AtomicU8::new(TaskState::Created as u8))
    }

    pub fn get(&self) -> TaskState {
        TaskState::from_u8(self.0.load(Ordering::Acquire))
    }

    /// Move `from -> to`; false if the current state is not `from`.
    pub fn transition(&self, from: TaskState, to: TaskState) -> bool {
        self.0
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn set(&self, state: TaskState) {
        self.0.store(state as u8, Ordering::Release);
    }

    /// Move STARTING or RUNNING to FAILED. True only for the caller that
    /// performed the move.
    pub fn fail(&self) -> bool {
        self.transition(TaskState::Running, TaskState::Failed)
            || self.transition(TaskState::Starting, TaskState::Failed)
    }

    /// Move STARTING or RUNNING to STOPPING.
    pub fn begin_stop(&self) -> bool {
        self.transition(TaskState::Running, TaskState::Stopping)
            || self.transition(TaskState::Starting, TaskState::Stopping)
    }
}

/// Report a fatal task error once: state, log, audit, notification.
pub(crate) fn fail_task(ctx: &TaskContext, task_id: &str, state: &StateCell, err: &CdcError) {
    if state.fail() {
        error!(task_id, "Capture task failed: {}", err);
        ctx.report(task_id, err);
        ctx.notifier.failed(task_id, &err.to_string());
    }
}

/// Running-side state of a log task; registered as the client's listener.
struct LogSession {
    task_id: String,
    ctx: TaskContext,
    state: Arc<StateCell>,
    dispatcher: LogDispatcher,
    bookmark: TaskBookmark,
    rows: AtomicU64,
    applies: AtomicU64,
    downstream_errors: AtomicU64,
}

impl LogSession {
    async fn dispatch_row(&self, change: &RowChangeEvent) {
        self.rows.fetch_add(1, Ordering::Relaxed);
        match self.dispatcher.dispatch(change).await {
            Ok(count) => {
                self.applies.fetch_add(count as u64, Ordering::Relaxed);
            }
            Err(e) => {
                self.downstream_errors.fetch_add(1, Ordering::Relaxed);
                warn!(
                    task_id = %self.task_id,
                    table = %change.table,
                    op = %change.operation,
                    "Downstream apply failed: {}",
                    e
                );
                self.ctx.report(&self.task_id, &e);
            }
        }
    }
}

#[async_trait]
impl BinlogEventListener for LogSession {
    async fn on_event(&self, event: &DecodedEvent) {
        match &event.event {
            BinlogEvent::Rows(rows) => {
                for change in &rows.rows {
                    self.dispatch_row(change).await;
                }
            }
            BinlogEvent::Control(control) => {
                // The client has already advanced the shared tracker.
                trace!(
                    task_id = %self.task_id,
                    next_file = control.next_file().unwrap_or(""),
                    next_offset = control.next_offset(),
                    "Bookmark advanced"
                );
            }
            BinlogEvent::TableMap(table) => {
                trace!(
                    task_id = %self.task_id,
                    table_id = table.table_id,
                    table = %table.table_name,
                    "Table map"
                );
            }
            BinlogEvent::FormatDescription(fde) => {
                debug!(
                    task_id = %self.task_id,
                    server_version = %fde.server_version,
                    checksum = fde.checksum,
                    "Format description"
                );
            }
            BinlogEvent::Heartbeat => {}
        }
    }

    async fn on_error(&self, error: &CdcError) {
        fail_task(&self.ctx, &self.task_id, &self.state, error);
    }
}

/// Counters of a running log task.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LogTaskStats {
    pub rows: u64,
    pub applies: u64,
    pub downstream_errors: u64,
}

/// Binlog-driven capture task.
pub struct LogExtractor {
    task_id: String,
    ctx: TaskContext,
    state: Arc<StateCell>,
    session: OnceLock<Arc<LogSession>>,
    client: Mutex<Option<Arc<BinlogStreamClient>>>,
}

impl fmt::Debug for LogExtractor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LogExtractor")
            .field("task_id", &self.task_id)
            .field("state", &self.state.get())
            .finish_non_exhaustive()
    }
}

impl LogExtractor {
    pub fn new(task_id: impl Into<String>, ctx: TaskContext) -> Self {
        Self {
            task_id: task_id.into(),
            ctx,
            state: Arc::new(StateCell::new()),
            session: OnceLock::new(),
            client: Mutex::new(None),
        }
    }

    /// Current in-memory bookmark, once started.
    pub fn position(&self) -> Option<StreamPosition> {
        self.session
            .get()
            .map(|s| s.bookmark.tracker().position())
    }

    /// Whether the bookmark changed since the last flush.
    pub fn is_dirty(&self) -> bool {
        self.session
            .get()
            .is_some_and(|s| s.bookmark.tracker().is_dirty())
    }

    pub fn stats(&self) -> LogTaskStats {
        self.session
            .get()
            .map(|s| LogTaskStats {
                rows: s.rows.load(Ordering::Relaxed),
                applies: s.applies.load(Ordering::Relaxed),
                downstream_errors: s.downstream_errors.load(Ordering::Relaxed),
            })
            .unwrap_or_default()
    }

    async fn open(&self) -> Result<()> {
        let resolved = self.ctx.resolve(&self.task_id).await?;
        resolved.expect_kind(ListenerKind::Log)?;
        let pickers = resolved.pickers()?;

        let dispatcher = LogDispatcher::new(
            pickers,
            self.ctx.transform.clone(),
            self.ctx.engine.concurrency(),
            self.ctx.engine.apply_timeout(),
        );
        let bookmark = TaskBookmark::new(self.ctx.store.clone(), resolved.meta);
        let tracker = bookmark.tracker().clone();

        let session = Arc::new(LogSession {
            task_id: self.task_id.clone(),
            ctx: self.ctx.clone(),
            state: self.state.clone(),
            dispatcher,
            bookmark,
            rows: AtomicU64::new(0),
            applies: AtomicU64::new(0),
            downstream_errors: AtomicU64::new(0),
        });
        if self.session.set(session.clone()).is_err() {
            return Err(CdcError::invalid_state("task already opened"));
        }

        let filter_session = session.clone();
        let row_filter: RowFilter = Arc::new(move |table: &TableMapEvent| {
            filter_session
                .dispatcher
                .has_table(&table.schema_name, &table.table_name)
        });
        let client = Arc::new(
            BinlogStreamClient::new(resolved.connector, self.ctx.connector(), tracker)
                .with_row_filter(row_filter)
                .with_read_timeout(self.ctx.engine.read_timeout()),
        );
        *self.client.lock().unwrap_or_else(|e| e.into_inner()) = Some(client.clone());

        client.start(session).await
    }

    async fn release_client(&self) {
        let client = self.client.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(client) = client {
            client.close().await;
        }
    }
}

#[async_trait]
impl Extractor for LogExtractor {
    fn task_id(&self) -> &str {
        &self.task_id
    }

    fn state(&self) -> TaskState {
        self.state.get()
    }

    async fn start(&self) -> Result<()> {
        if !self.state.transition(TaskState::Created, TaskState::Starting) {
            return Err(CdcError::invalid_state(format!(
                "task '{}' is {}",
                self.task_id,
                self.state.get()
            )));
        }
        info!(task_id = %self.task_id, "Starting log capture task");

        if let Err(e) = self.open().await {
            self.state.fail();
            self.release_client().await;
            return Err(e);
        }
        if !self.state.transition(TaskState::Starting, TaskState::Running) {
            self.release_client().await;
            return Err(CdcError::invalid_state(format!(
                "task '{}' failed while starting",
                self.task_id
            )));
        }

        info!(
            task_id = %self.task_id,
            position = ?self.position(),
            "Log capture task running"
        );
        self.ctx.notifier.started(&self.task_id);
        Ok(())
    }

    async fn flush(&self) -> Result<bool> {
        match self.session.get() {
            Some(session) => session.bookmark.flush().await,
            None => Ok(false),
        }
    }

    async fn close(&self) {
        let stopping = self.state.begin_stop();
        if !stopping && self.state.transition(TaskState::Created, TaskState::Stopped) {
            return;
        }
        if stopping {
            info!(task_id = %self.task_id, "Stopping log capture task");
        }

        self.release_client().await;

        if stopping {
            self.state.set(TaskState::Stopped);
            info!(task_id = %self.task_id, "Log capture task stopped");
        }
    }
}
