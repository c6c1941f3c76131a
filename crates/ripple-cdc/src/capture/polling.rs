//! Timer-driven capture for sources without a replication log.
//!
//! Every cycle walks the table groups in configured order; each group gets a
//! delta read from its stored cursor, its rows are applied one by one, and
//! the returned cursor is recorded. A failing group ends the cycle so later
//! groups never overtake it.

use crate::capture::context::{TaskBookmark, TaskContext};
use crate::capture::dispatch::PollingDispatcher;
use crate::capture::extractor::{fail_task, StateCell, TaskState};
use crate::common::{
    CdcError, ConnectorConfig, DeltaReader, Extractor, ListenerKind, Result, ScheduleHandle,
    ScheduledJob,
};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use tracing::{debug, info};

struct PollingSession {
    task_id: String,
    ctx: TaskContext,
    state: Arc<StateCell>,
    connector: ConnectorConfig,
    reader: Arc<dyn DeltaReader>,
    dispatcher: PollingDispatcher,
    bookmark: TaskBookmark,
    cycles: AtomicU64,
    cycle_lock: tokio::sync::Mutex<()>,
}

impl PollingSession {
    async fn poll_once(&self) -> Result<usize> {
        let _cycle = self.cycle_lock.lock().await;
        if self.state.get() != TaskState::Running {
            return Ok(0);
        }

        let tracker = self.bookmark.tracker();
        let mut applied = 0;
        for picker in self.dispatcher.pickers() {
            let group = picker.group();
            let key = group.cursor_key();
            let cursor = tracker.cursor(&key);

            let batch = match self
                .reader
                .read_delta(&self.connector, group, cursor.as_deref())
                .await
            {
                Ok(batch) => batch,
                Err(e) if e.is_fatal() => {
                    fail_task(&self.ctx, &self.task_id, &self.state, &e);
                    return Err(e);
                }
                Err(e) => {
                    self.ctx.report(&self.task_id, &e);
                    return Err(e);
                }
            };

            match self.dispatcher.dispatch(picker, &batch.rows).await {
                Ok(count) => applied += count,
                Err(e) => {
                    self.ctx.report(&self.task_id, &e);
                    return Err(e);
                }
            }

            if let Some(next) = batch.next_cursor {
                tracker.set_cursor(key, next);
            }
        }

        let cycle = self.cycles.fetch_add(1, Ordering::Relaxed) + 1;
        debug!(task_id = %self.task_id, cycle, applied, "Polling cycle done");
        Ok(applied)
    }
}

#[async_trait]
impl ScheduledJob for PollingSession {
    fn name(&self) -> &str {
        &self.task_id
    }

    async fn run(&self) -> Result<()> {
        self.poll_once().await.map(|_| ())
    }
}

/// Capture task driven by the scheduler instead of a binlog stream.
pub struct PollingExtractor {
    task_id: String,
    ctx: TaskContext,
    state: Arc<StateCell>,
    session: OnceLock<Arc<PollingSession>>,
    schedule: Mutex<Option<ScheduleHandle>>,
}

impl fmt::Debug for PollingExtractor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PollingExtractor")
            .field("task_id", &self.task_id)
            .field("state", &self.state.get())
            .finish_non_exhaustive()
    }
}

impl PollingExtractor {
    pub fn new(task_id: impl Into<String>, ctx: TaskContext) -> Self {
        Self {
            task_id: task_id.into(),
            ctx,
            state: Arc::new(StateCell::new()),
            session: OnceLock::new(),
            schedule: Mutex::new(None),
        }
    }

    /// Run one cycle now. Returns the number of `apply` calls.
    pub async fn poll_once(&self) -> Result<usize> {
        match self.session.get() {
            Some(session) => session.poll_once().await,
            None => Err(CdcError::invalid_state(format!(
                "task '{}' is not started",
                self.task_id
            ))),
        }
    }

    /// Stored cursors, keyed by table group index.
    pub fn cursors(&self) -> BTreeMap<String, String> {
        self.session
            .get()
            .map(|s| s.bookmark.tracker().snapshot().cursors)
            .unwrap_or_default()
    }

    pub fn cycles(&self) -> u64 {
        self.session
            .get()
            .map(|s| s.cycles.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    async fn open(&self) -> Result<()> {
        let resolved = self.ctx.resolve(&self.task_id).await?;
        resolved.expect_kind(ListenerKind::Timing)?;
        let reader = self.ctx.delta_reader().ok_or_else(|| {
            CdcError::config("no delta reader configured for timing listeners")
        })?;
        let pickers = resolved.pickers()?;
        let interval = resolved.mapping.listener.poll_interval();

        let session = Arc::new(PollingSession {
            task_id: self.task_id.clone(),
            ctx: self.ctx.clone(),
            state: self.state.clone(),
            connector: resolved.connector,
            reader,
            dispatcher: PollingDispatcher::new(
                pickers,
                self.ctx.transform.clone(),
                self.ctx.engine.apply_timeout(),
            ),
            bookmark: TaskBookmark::new(self.ctx.store.clone(), resolved.meta),
            cycles: AtomicU64::new(0),
            cycle_lock: tokio::sync::Mutex::new(()),
        });
        if self.session.set(session.clone()).is_err() {
            return Err(CdcError::invalid_state("task already opened"));
        }

        let handle = self.ctx.scheduler.schedule(interval, session);
        *self.schedule.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);
        debug!(task_id = %self.task_id, interval_secs = interval.as_secs(), "Polling scheduled");
        Ok(())
    }

    async fn stop_schedule(&self) {
        let handle = self.schedule.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(handle) = handle {
            handle.shutdown().await;
        }
    }
}

#[async_trait]
impl Extractor for PollingExtractor {
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
        info!(task_id = %self.task_id, "Starting polling capture task");

        if let Err(e) = self.open().await {
            self.state.fail();
            self.stop_schedule().await;
            return Err(e);
        }
        self.state.transition(TaskState::Starting, TaskState::Running);
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

        self.stop_schedule().await;
        // Wait out a cycle that was already past the state check.
        if let Some(session) = self.session.get() {
            drop(session.cycle_lock.lock().await);
        }

        if stopping {
            self.state.set(TaskState::Stopped);
            info!(task_id = %self.task_id, "Polling capture task stopped");
        }
    }
}
