//! Collaborators shared by the registry and its tasks

use crate::capture::picker::FieldPicker;
use crate::common::{
    order_table_groups, AuditSink, BookmarkTracker, CdcError, ConnectorConfig, DeltaReader,
    EngineConfig, ListenerKind, Mapping, MetadataStore, Result, Scheduler, TableGroupConfig,
    TaskMeta, TaskNotifier, TokioScheduler, TracingAuditSink, Transform,
};
use crate::mysql::{BinlogConnector, MySqlConnector};
use chrono::Utc;
use std::sync::{Arc, Mutex};
use tracing::debug;

/// Everything a capture task needs from its surroundings.
#[derive(Clone)]
pub struct TaskContext {
    pub store: Arc<dyn MetadataStore>,
    pub transform: Arc<dyn Transform>,
    pub audit: Arc<dyn AuditSink>,
    pub notifier: Arc<TaskNotifier>,
    pub scheduler: Arc<dyn Scheduler>,
    pub engine: EngineConfig,
    connector: Option<Arc<dyn BinlogConnector>>,
    delta_reader: Option<Arc<dyn DeltaReader>>,
}

impl std::fmt::Debug for TaskContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskContext")
            .field("engine", &self.engine)
            .field("custom_connector", &self.connector.is_some())
            .field("delta_reader", &self.delta_reader.is_some())
            .finish_non_exhaustive()
    }
}

impl TaskContext {
    pub fn new(store: Arc<dyn MetadataStore>, transform: Arc<dyn Transform>) -> Self {
        Self {
            store,
            transform,
            audit: Arc::new(TracingAuditSink),
            notifier: Arc::new(TaskNotifier::new()),
            scheduler: Arc::new(TokioScheduler),
            engine: EngineConfig::default(),
            connector: None,
            delta_reader: None,
        }
    }

    pub fn with_audit(mut self, audit: Arc<dyn AuditSink>) -> Self {
        self.audit = audit;
        self
    }

    pub fn with_notifier(mut self, notifier: Arc<TaskNotifier>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn with_scheduler(mut self, scheduler: Arc<dyn Scheduler>) -> Self {
        self.scheduler = scheduler;
        self
    }

    pub fn with_engine(mut self, engine: EngineConfig) -> Self {
        self.engine = engine;
        self
    }

    /// Replace the MySQL connector used by log tasks.
    pub fn with_connector(mut self, connector: Arc<dyn BinlogConnector>) -> Self {
        self.connector = Some(connector);
        self
    }

    /// Delta source for `timing` tasks.
    pub fn with_delta_reader(mut self, reader: Arc<dyn DeltaReader>) -> Self {
        self.delta_reader = Some(reader);
        self
    }

    pub fn connector(&self) -> Arc<dyn BinlogConnector> {
        self.connector
            .clone()
            .unwrap_or_else(|| Arc::new(MySqlConnector::new(&self.engine)))
    }

    pub fn delta_reader(&self) -> Option<Arc<dyn DeltaReader>> {
        self.delta_reader.clone()
    }

    /// Record a task error with the audit sink.
    pub fn report(&self, task_id: &str, error: &CdcError) {
        self.audit
            .record(error.category(), &format!("task {}: {}", task_id, error));
    }

    /// Load and check everything `start()` needs.
    pub(crate) async fn resolve(&self, task_id: &str) -> Result<ResolvedTask> {
        let mapping = self
            .store
            .get_mapping(task_id)
            .await?
            .ok_or_else(|| CdcError::config(format!("no mapping for task '{}'", task_id)))?;
        let kind = mapping.listener.listener_kind()?;

        let connector = self
            .store
            .get_connector(&mapping.source_connector_id)
            .await?
            .ok_or_else(|| {
                CdcError::config(format!(
                    "source connector '{}' not found",
                    mapping.source_connector_id
                ))
            })?;

        let groups = self.store.get_table_groups(task_id).await?;
        if groups.is_empty() {
            return Err(CdcError::config(format!(
                "task '{}' has no table groups",
                task_id
            )));
        }

        let meta = self
            .store
            .get_task_meta(task_id)
            .await?
            .unwrap_or_else(|| TaskMeta::new(task_id));

        debug!(
            task_id,
            kind = kind.as_str(),
            groups = groups.len(),
            bookmark = %meta.bookmark,
            "Resolved task"
        );
        Ok(ResolvedTask {
            mapping: Arc::new(mapping),
            kind,
            connector,
            groups: order_table_groups(groups),
            meta,
        })
    }
}

/// Configuration loaded at task start.
#[derive(Debug)]
pub(crate) struct ResolvedTask {
    pub mapping: Arc<Mapping>,
    pub kind: ListenerKind,
    pub connector: ConnectorConfig,
    pub groups: Vec<TableGroupConfig>,
    pub meta: TaskMeta,
}

impl ResolvedTask {
    pub fn expect_kind(&self, kind: ListenerKind) -> Result<()> {
        if self.kind == kind {
            Ok(())
        } else {
            Err(CdcError::config(format!(
                "listener kind '{}' cannot run as '{}'",
                self.kind.as_str(),
                kind.as_str()
            )))
        }
    }

    pub fn pickers(&self) -> Result<Vec<FieldPicker>> {
        self.groups
            .iter()
            .cloned()
            .map(|group| FieldPicker::new(self.mapping.clone(), group))
            .collect()
    }
}

/// A task's persisted metadata plus its live bookmark.
pub(crate) struct TaskBookmark {
    store: Arc<dyn MetadataStore>,
    tracker: Arc<BookmarkTracker>,
    meta: Mutex<TaskMeta>,
    /// Held across take and save so writes land in bookmark order.
    flush_lock: tokio::sync::Mutex<()>,
}

impl TaskBookmark {
    pub fn new(store: Arc<dyn MetadataStore>, mut meta: TaskMeta) -> Self {
        let tracker = Arc::new(BookmarkTracker::new(
            meta.bookmark.clone(),
            meta.cursors.clone(),
        ));
        let now = Utc::now();
        meta.begin_time = Some(now);
        meta.end_time = Some(now);
        Self {
            store,
            tracker,
            meta: Mutex::new(meta),
            flush_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn tracker(&self) -> &Arc<BookmarkTracker> {
        &self.tracker
    }

    /// Persist the bookmark if it changed since the last flush.
    ///
    /// A failed write re-marks the tracker so the next flush retries.
    /// Concurrent callers are serialized, so an older snapshot never
    /// overwrites a newer one.
    pub async fn flush(&self) -> Result<bool> {
        let _guard = self.flush_lock.lock().await;
        let Some(bookmark) = self.tracker.take_dirty() else {
            return Ok(false);
        };
        let meta = {
            let mut meta = self.meta.lock().unwrap_or_else(|e| e.into_inner());
            meta.bookmark = bookmark.position;
            meta.cursors = bookmark.cursors;
            meta.end_time = Some(Utc::now());
            meta.clone()
        };
        match self.store.save_task_meta(&meta).await {
            Ok(()) => {
                debug!(task_id = %meta.task_id, bookmark = %meta.bookmark, "Bookmark flushed");
                Ok(true)
            }
            Err(e) => {
                self.tracker.mark_dirty();
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::{
        ConnectorConfig, MemoryMetadataStore, StreamPosition, TableGroupConfig,
    };
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::{Notify, Semaphore};

    /// Store whose first save blocks until the gate opens.
    struct GatedStore {
        inner: MemoryMetadataStore,
        saves: AtomicUsize,
        entered: Notify,
        gate: Semaphore,
    }

    impl GatedStore {
        fn new() -> Self {
            Self {
                inner: MemoryMetadataStore::new(),
                saves: AtomicUsize::new(0),
                entered: Notify::new(),
                gate: Semaphore::new(0),
            }
        }
    }

    #[async_trait]
    impl MetadataStore for GatedStore {
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
            if self.saves.fetch_add(1, Ordering::SeqCst) == 0 {
                self.entered.notify_one();
                let _permit = self
                    .gate
                    .acquire()
                    .await
                    .map_err(|e| CdcError::store(e.to_string()))?;
            }
            self.inner.save_task_meta(meta).await
        }
    }

    #[tokio::test]
    async fn test_overlapping_flushes_persist_latest_bookmark() {
        let store = Arc::new(GatedStore::new());
        let bookmark = Arc::new(TaskBookmark::new(store.clone(), TaskMeta::new("t")));

        bookmark.tracker().advance(Some("log.000001"), 100);
        let first = tokio::spawn({
            let bookmark = bookmark.clone();
            async move { bookmark.flush().await }
        });
        store.entered.notified().await;

        bookmark.tracker().advance(Some("log.000001"), 200);
        let second = tokio::spawn({
            let bookmark = bookmark.clone();
            async move { bookmark.flush().await }
        });
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        store.gate.add_permits(1);

        assert!(first.await.unwrap().unwrap());
        assert!(second.await.unwrap().unwrap());
        let meta = store.get_task_meta("t").await.unwrap().unwrap();
        assert_eq!(meta.bookmark, StreamPosition::new("log.000001", 200));
        assert!(!bookmark.flush().await.unwrap());
    }
}
