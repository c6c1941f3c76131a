//! Collaborator traits
//!
//! The capture core talks to its surroundings only through these seams:
//!
//! - [`MetadataStore`]: connectors, mappings, table groups and task bookmarks
//! - [`Transform`]: the downstream stage receiving derived change events
//! - [`AuditSink`]: fire-and-forget error reporting
//! - [`DeltaReader`]: delta queries for polling-mode tasks
//! - [`Extractor`]: one capture task, as seen by the registry

use crate::capture::TaskState;
use crate::common::{
    ConnectorConfig, DeltaRow, DerivedChangeEvent, ErrorCategory, Mapping, Result,
    TableGroupConfig, TaskMeta,
};
use async_trait::async_trait;

/// Persistent configuration and task metadata.
#[async_trait]
pub trait MetadataStore: Send + Sync {
    async fn get_connector(&self, connector_id: &str) -> Result<Option<ConnectorConfig>>;

    async fn get_mapping(&self, mapping_id: &str) -> Result<Option<Mapping>>;

    /// Table groups of a task, in stored order.
    async fn get_table_groups(&self, task_id: &str) -> Result<Vec<TableGroupConfig>>;

    async fn get_task_meta(&self, task_id: &str) -> Result<Option<TaskMeta>>;

    async fn save_task_meta(&self, meta: &TaskMeta) -> Result<()>;
}

/// Downstream transform/write stage.
#[async_trait]
pub trait Transform: Send + Sync {
    /// Called once per field picker whose filter passed.
    async fn apply(
        &self,
        mapping: &Mapping,
        group: &TableGroupConfig,
        event: &DerivedChangeEvent,
    ) -> Result<()>;
}

/// Log/audit sink. Must not block.
pub trait AuditSink: Send + Sync {
    fn record(&self, category: ErrorCategory, message: &str);
}

/// Result of one delta query.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeltaBatch {
    pub rows: Vec<DeltaRow>,
    /// Cursor to resume from next cycle; `None` keeps the current one
    pub next_cursor: Option<String>,
}

/// Source of changes for tables without a log stream.
#[async_trait]
pub trait DeltaReader: Send + Sync {
    async fn read_delta(
        &self,
        connector: &ConnectorConfig,
        group: &TableGroupConfig,
        cursor: Option<&str>,
    ) -> Result<DeltaBatch>;
}

/// A capture task owned by the registry.
#[async_trait]
pub trait Extractor: Send + Sync {
    fn task_id(&self) -> &str;

    fn state(&self) -> TaskState;

    /// CREATED -> STARTING -> RUNNING. Errors leave the task FAILED.
    async fn start(&self) -> Result<()>;

    /// Persist the bookmark if it changed since the last flush.
    ///
    /// Returns whether a write happened.
    async fn flush(&self) -> Result<bool>;

    /// Detach listeners and stop. Idempotent.
    async fn close(&self);
}
