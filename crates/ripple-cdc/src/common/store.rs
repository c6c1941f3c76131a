//! In-process collaborators
//!
//! [`MemoryMetadataStore`] keeps connectors, mappings, table groups and task
//! metadata in memory. [`TracingAuditSink`] forwards audit records to
//! `tracing`. Both are usable as defaults and as test doubles.

use crate::common::{
    AuditSink, ConnectorConfig, ErrorCategory, Mapping, MetadataStore, Result, TableGroupConfig,
    TaskMeta,
};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::RwLock;
use tracing::{error, warn};

/// Metadata store backed by in-memory maps.
#[derive(Debug, Default)]
pub struct MemoryMetadataStore {
    connectors: RwLock<HashMap<String, ConnectorConfig>>,
    mappings: RwLock<HashMap<String, Mapping>>,
    table_groups: RwLock<HashMap<String, Vec<TableGroupConfig>>>,
    task_meta: RwLock<HashMap<String, TaskMeta>>,
    saves: AtomicU64,
}

impl MemoryMetadataStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn put_connector(&self, connector: ConnectorConfig) {
        self.connectors
            .write()
            .await
            .insert(connector.id.clone(), connector);
    }

    pub async fn put_mapping(&self, mapping: Mapping) {
        self.mappings.write().await.insert(mapping.id.clone(), mapping);
    }

    pub async fn put_table_groups(&self, task_id: impl Into<String>, groups: Vec<TableGroupConfig>) {
        self.table_groups.write().await.insert(task_id.into(), groups);
    }

    pub async fn put_task_meta(&self, meta: TaskMeta) {
        self.task_meta
            .write()
            .await
            .insert(meta.task_id.clone(), meta);
    }

    /// Number of `save_task_meta` calls that succeeded.
    pub fn save_count(&self) -> u64 {
        self.saves.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MetadataStore for MemoryMetadataStore {
    async fn get_connector(&self, connector_id: &str) -> Result<Option<ConnectorConfig>> {
        Ok(self.connectors.read().await.get(connector_id).cloned())
    }

    async fn get_mapping(&self, mapping_id: &str) -> Result<Option<Mapping>> {
        Ok(self.mappings.read().await.get(mapping_id).cloned())
    }

    async fn get_table_groups(&self, task_id: &str) -> Result<Vec<TableGroupConfig>> {
        Ok(self
            .table_groups
            .read()
            .await
            .get(task_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn get_task_meta(&self, task_id: &str) -> Result<Option<TaskMeta>> {
        Ok(self.task_meta.read().await.get(task_id).cloned())
    }

    async fn save_task_meta(&self, meta: &TaskMeta) -> Result<()> {
        self.task_meta
            .write()
            .await
            .insert(meta.task_id.clone(), meta.clone());
        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Audit sink writing through `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn record(&self, category: ErrorCategory, message: &str) {
        match category {
            ErrorCategory::Configuration | ErrorCategory::Downstream => {
                warn!(category = %category, "{}", message)
            }
            _ => error!(category = %category, "{}", message),
        }
    }
}
