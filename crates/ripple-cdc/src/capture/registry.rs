//! Task registry
//!
//! The registry owns every running capture task, keyed by task id (the
//! mapping id). All mutation goes through [`TaskRegistry::register`] and
//! [`TaskRegistry::unregister`]; the periodic flush only iterates a
//! snapshot, so tasks can be added or removed while a flush is running.
//!
//! ```text
//! start_task ──► build ──► Extractor::start ──► register (insert-if-absent)
//! close_task ──► unregister ──► "task closed" ──► Extractor::close
//!            └─► (start in flight) mark cancelled; start_task undoes it
//! every flush_interval ──► flush_all ──► reap STOPPED/FAILED tasks
//! ```

use crate::capture::context::TaskContext;
use crate::capture::extractor::LogExtractor;
use crate::capture::polling::PollingExtractor;
use crate::common::{
    CdcError, Extractor, ListenerKind, Result, ScheduleHandle, ScheduledJob, TaskNotifier,
    Validator,
};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

/// Result of [`TaskRegistry::start_task`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    Started,
    /// A live task already exists for the id; nothing was started.
    AlreadyRunning,
    /// `close_task` arrived while starting; the task was closed again.
    Cancelled,
}

/// Result of [`TaskRegistry::close_task`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseOutcome {
    Closed,
    NotRunning,
    /// A start was in flight; it closes the task once it completes.
    StartCancelled,
}

/// Summary of one flush pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlushReport {
    /// Tasks whose bookmark was written
    pub persisted: usize,
    /// Tasks whose flush failed
    pub failed: usize,
    /// Terminal tasks removed from the registry
    pub reaped: Vec<String>,
}

/// Process-wide owner of running capture tasks.
pub struct TaskRegistry {
    ctx: TaskContext,
    tasks: RwLock<HashMap<String, Arc<dyn Extractor>>>,
    /// Starts in flight, each with its "close requested" flag.
    starting: Mutex<HashMap<String, bool>>,
    schedule: Mutex<Option<ScheduleHandle>>,
}

impl std::fmt::Debug for TaskRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskRegistry")
            .field("ctx", &self.ctx)
            .finish_non_exhaustive()
    }
}

impl TaskRegistry {
    pub fn new(ctx: TaskContext) -> Self {
        Self {
            ctx,
            tasks: RwLock::new(HashMap::new()),
            starting: Mutex::new(HashMap::new()),
            schedule: Mutex::new(None),
        }
    }

    pub fn context(&self) -> &TaskContext {
        &self.ctx
    }

    pub fn notifier(&self) -> &Arc<TaskNotifier> {
        &self.ctx.notifier
    }

    pub async fn get(&self, task_id: &str) -> Option<Arc<dyn Extractor>> {
        self.tasks.read().await.get(task_id).cloned()
    }

    pub async fn task_ids(&self) -> Vec<String> {
        let mut ids: Vec<_> = self.tasks.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub async fn len(&self) -> usize {
        self.tasks.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.tasks.read().await.is_empty()
    }

    /// Insert if no task is registered under `task_id`.
    ///
    /// Returns false, leaving the registry unchanged, if one already is.
    pub async fn register(&self, task_id: &str, task: Arc<dyn Extractor>) -> bool {
        let mut tasks = self.tasks.write().await;
        if tasks.contains_key(task_id) {
            return false;
        }
        tasks.insert(task_id.to_string(), task);
        true
    }

    /// Remove the task and emit "task closed". No-op if absent.
    ///
    /// The removed task is returned, not closed.
    pub async fn unregister(&self, task_id: &str) -> Option<Arc<dyn Extractor>> {
        let removed = self.tasks.write().await.remove(task_id);
        if removed.is_some() {
            self.ctx.notifier.closed(task_id);
        }
        removed
    }

    /// Remove only if the entry is still `task`.
    async fn unregister_exact(&self, task_id: &str, task: &Arc<dyn Extractor>) -> bool {
        let removed = {
            let mut tasks = self.tasks.write().await;
            match tasks.get(task_id) {
                Some(current) if Arc::ptr_eq(current, task) => tasks.remove(task_id).is_some(),
                _ => false,
            }
        };
        if removed {
            self.ctx.notifier.closed(task_id);
        }
        removed
    }

    /// Start the task for `task_id` unless one is already live.
    ///
    /// A STOPPED or FAILED entry is reaped first. Start failures are
    /// reported to the audit sink and returned; the task is not registered.
    pub async fn start_task(&self, task_id: &str) -> Result<StartOutcome> {
        Validator::validate_task_id(task_id)?;

        if let Some(existing) = self.get(task_id).await {
            if !existing.state().is_terminal() {
                debug!(task_id, "Task already running");
                return Ok(StartOutcome::AlreadyRunning);
            }
            if self.unregister_exact(task_id, &existing).await {
                existing.close().await;
                info!(task_id, state = %existing.state(), "Reaped terminal task");
            }
        }

        {
            let mut starting = self.starting.lock().unwrap_or_else(|e| e.into_inner());
            if starting.contains_key(task_id) {
                debug!(task_id, "Task start already in progress");
                return Ok(StartOutcome::AlreadyRunning);
            }
            starting.insert(task_id.to_string(), false);
        }
        self.launch(task_id).await
    }

    /// Drop the in-flight marker, returning whether a close was requested.
    fn finish_starting(&self, task_id: &str) -> bool {
        self.starting
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(task_id)
            .unwrap_or(false)
    }

    async fn launch(&self, task_id: &str) -> Result<StartOutcome> {
        let task = match self.build(task_id).await {
            Ok(task) => task,
            Err(e) => {
                self.finish_starting(task_id);
                error!(task_id, "Failed to start task: {}", e);
                self.ctx.report(task_id, &e);
                return Err(e);
            }
        };

        if let Err(e) = task.start().await {
            self.finish_starting(task_id);
            error!(task_id, "Failed to start task: {}", e);
            self.ctx.report(task_id, &e);
            task.close().await;
            return Err(e);
        }

        if !self.register(task_id, task.clone()).await {
            self.finish_starting(task_id);
            task.close().await;
            return Ok(StartOutcome::AlreadyRunning);
        }

        // A close_task that missed the marker finds the registered task.
        if self.finish_starting(task_id) {
            if self.unregister_exact(task_id, &task).await {
                task.close().await;
            }
            info!(task_id, "Task closed while starting");
            return Ok(StartOutcome::Cancelled);
        }
        info!(task_id, "Task registered");
        Ok(StartOutcome::Started)
    }

    async fn build(&self, task_id: &str) -> Result<Arc<dyn Extractor>> {
        let mapping = self
            .ctx
            .store
            .get_mapping(task_id)
            .await?
            .ok_or_else(|| CdcError::config(format!("no mapping for task '{}'", task_id)))?;

        let task: Arc<dyn Extractor> = match mapping.listener.listener_kind()? {
            ListenerKind::Log => Arc::new(LogExtractor::new(task_id, self.ctx.clone())),
            ListenerKind::Timing => Arc::new(PollingExtractor::new(task_id, self.ctx.clone())),
        };
        Ok(task)
    }

    /// Unregister and close. Unknown ids are a no-op.
    ///
    /// If a start for `task_id` is in flight, it is marked cancelled and
    /// closes the task itself once `Extractor::start` returns.
    pub async fn close_task(&self, task_id: &str) -> CloseOutcome {
        if let Some(cancelled) = self
            .starting
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get_mut(task_id)
        {
            *cancelled = true;
            info!(task_id, "Close requested while task is starting");
            return CloseOutcome::StartCancelled;
        }
        match self.unregister(task_id).await {
            Some(task) => {
                task.close().await;
                info!(task_id, "Task closed");
                CloseOutcome::Closed
            }
            None => CloseOutcome::NotRunning,
        }
    }

    /// Flush every registered task, then reap the terminal ones.
    ///
    /// A failing flush is reported and does not affect the other tasks.
    pub async fn flush_all(&self) -> FlushReport {
        let snapshot: Vec<(String, Arc<dyn Extractor>)> = self
            .tasks
            .read()
            .await
            .iter()
            .map(|(id, task)| (id.clone(), task.clone()))
            .collect();

        let mut report = FlushReport::default();
        for (task_id, task) in snapshot {
            match task.flush().await {
                Ok(true) => report.persisted += 1,
                Ok(false) => {}
                Err(e) => {
                    report.failed += 1;
                    warn!(task_id = %task_id, "Bookmark flush failed: {}", e);
                    self.ctx.report(&task_id, &e);
                }
            }

            if task.state().is_terminal() && self.unregister_exact(&task_id, &task).await {
                task.close().await;
                info!(task_id = %task_id, state = %task.state(), "Reaped terminal task");
                report.reaped.push(task_id);
            }
        }

        debug!(
            persisted = report.persisted,
            failed = report.failed,
            reaped = report.reaped.len(),
            "Flush tick"
        );
        report
    }

    /// Run [`flush_all`](Self::flush_all) every `flush_interval`.
    ///
    /// Replaces a previously started schedule.
    pub fn start_flush_schedule(self: &Arc<Self>) {
        let job: Arc<dyn ScheduledJob> = self.clone();
        let handle = self
            .ctx
            .scheduler
            .schedule(self.ctx.engine.flush_interval(), job);
        let previous = self
            .schedule
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .replace(handle);
        if let Some(previous) = previous {
            previous.stop();
        }
        info!(
            interval_secs = self.ctx.engine.flush_interval().as_secs(),
            "Flush schedule started"
        );
    }

    /// Stop the flush schedule, flush, then close every task.
    pub async fn shutdown(&self) {
        info!("Shutting down task registry");
        let handle = self.schedule.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(handle) = handle {
            handle.shutdown().await;
        }

        self.flush_all().await;

        let tasks: Vec<_> = self.tasks.write().await.drain().collect();
        for (task_id, task) in tasks {
            self.ctx.notifier.closed(&task_id);
            task.close().await;
        }
        info!("Task registry shut down");
    }
}

#[async_trait]
impl ScheduledJob for TaskRegistry {
    fn name(&self) -> &str {
        "bookmark-flush"
    }

    async fn run(&self) -> Result<()> {
        self.flush_all().await;
        Ok(())
    }
}
