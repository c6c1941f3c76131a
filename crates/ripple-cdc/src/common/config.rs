//! Task, connector and engine configuration
//!
//! These records are supplied by the metadata collaborator and are immutable
//! for a task's lifetime.

use crate::common::filter::FilterCondition;
use crate::common::position::StreamPosition;
use crate::common::validation::CONNECTION_TIMEOUT_SECS;
use crate::common::{CdcError, Result};
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::LazyLock;
use std::time::Duration;

/// Default MySQL port when the URL omits one.
pub const DEFAULT_MYSQL_PORT: u16 = 3306;

/// Default interval between bookmark flushes.
pub const DEFAULT_FLUSH_INTERVAL_SECS: u64 = 10;

/// Host list between `//` and the next `/` (e.g. `jdbc:mysql://a:3306,b:3307/db`).
static NODE_LIST_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"//([^/?]+)").expect("valid node list regex"));

/// One host of a (possibly multi-host) connection URL.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeAddr {
    pub host: String,
    pub port: u16,
}

impl NodeAddr {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Extract the node list from a connection URL.
    ///
    /// The first node is the primary. An empty list is a configuration error.
    pub fn parse_url(url: &str) -> Result<Vec<NodeAddr>> {
        let hosts = NODE_LIST_REGEX
            .captures(url)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str())
            .ok_or_else(|| CdcError::config(format!("No host list in URL '{}'", url)))?;

        let mut nodes = Vec::new();
        for entry in hosts.split(',').map(str::trim).filter(|s| !s.is_empty()) {
            // Strip credentials if present (user:pass@host)
            let entry = entry.rsplit_once('@').map(|(_, h)| h).unwrap_or(entry);
            let node = match entry.split_once(':') {
                Some((host, port)) => {
                    let port = port.parse().map_err(|_| {
                        CdcError::config(format!("Invalid port '{}' in URL '{}'", port, url))
                    })?;
                    NodeAddr::new(host, port)
                }
                None => NodeAddr::new(entry, DEFAULT_MYSQL_PORT),
            };
            if node.host.is_empty() {
                return Err(CdcError::config(format!("Empty host in URL '{}'", url)));
            }
            nodes.push(node);
        }

        if nodes.is_empty() {
            return Err(CdcError::config(format!("No nodes in URL '{}'", url)));
        }
        Ok(nodes)
    }
}

impl fmt::Display for NodeAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Source connection parameters.
///
/// # Security Note
///
/// `Debug` redacts the password.
#[derive(Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectorConfig {
    pub id: String,
    /// Connector type, e.g. `mysql`
    pub connector_type: String,
    /// Connection URL, e.g. `jdbc:mysql://10.0.0.1:3306,10.0.0.2:3306/shop`
    pub url: String,
    pub username: String,
    pub password: Option<String>,
    /// Replica server id; falls back to the engine default when `None`
    pub server_id: Option<u32>,
}

impl fmt::Debug for ConnectorConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectorConfig")
            .field("id", &self.id)
            .field("connector_type", &self.connector_type)
            .field("url", &self.url)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "[REDACTED]"))
            .field("server_id", &self.server_id)
            .finish()
    }
}

impl ConnectorConfig {
    pub fn new(id: impl Into<String>, url: impl Into<String>, username: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            connector_type: "mysql".to_string(),
            url: url.into(),
            username: username.into(),
            ..Default::default()
        }
    }

    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    pub fn with_server_id(mut self, server_id: u32) -> Self {
        self.server_id = Some(server_id);
        self
    }

    pub fn with_connector_type(mut self, connector_type: impl Into<String>) -> Self {
        self.connector_type = connector_type.into();
        self
    }

    /// Resolve the node list; index 0 is the primary.
    pub fn nodes(&self) -> Result<Vec<NodeAddr>> {
        NodeAddr::parse_url(&self.url)
    }
}

/// How a task receives changes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ListenerKind {
    /// Binlog-driven capture
    #[default]
    Log,
    /// Timer-driven delta queries
    Timing,
}

impl ListenerKind {
    pub fn parse(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "log" => Ok(Self::Log),
            "timing" => Ok(Self::Timing),
            other => Err(CdcError::config(format!(
                "Unknown listener kind '{}'",
                other
            ))),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Log => "log",
            Self::Timing => "timing",
        }
    }
}

/// Listener section of a mapping.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ListenerConfig {
    /// Raw listener kind; validated with [`ListenerKind::parse`] at start.
    pub kind: String,
    /// Polling interval for `timing` listeners.
    pub poll_interval_secs: u64,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            kind: ListenerKind::Log.as_str().to_string(),
            poll_interval_secs: 30,
        }
    }
}

impl ListenerConfig {
    pub fn log() -> Self {
        Self::default()
    }

    pub fn timing(poll_interval_secs: u64) -> Self {
        Self {
            kind: ListenerKind::Timing.as_str().to_string(),
            poll_interval_secs,
        }
    }

    pub fn listener_kind(&self) -> Result<ListenerKind> {
        ListenerKind::parse(&self.kind)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs.max(1))
    }
}

/// A sync job: source connector, target connector, listener.
///
/// The mapping id is the task id.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Mapping {
    pub id: String,
    pub name: String,
    pub source_connector_id: String,
    pub target_connector_id: String,
    pub listener: ListenerConfig,
}

impl Mapping {
    pub fn new(id: impl Into<String>, source_connector_id: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            source_connector_id: source_connector_id.into(),
            ..Default::default()
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_target(mut self, target_connector_id: impl Into<String>) -> Self {
        self.target_connector_id = target_connector_id.into();
        self
    }

    pub fn with_listener(mut self, listener: ListenerConfig) -> Self {
        self.listener = listener;
        self
    }
}

/// Table name plus its ordered column names.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TableDef {
    pub name: String,
    /// Column names in table-definition order (binlog position order).
    pub columns: Vec<String>,
}

impl TableDef {
    pub fn new<I, S>(name: impl Into<String>, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: name.into(),
            columns: columns.into_iter().map(Into::into).collect(),
        }
    }
}

/// Source column to destination column.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FieldMapping {
    pub source: String,
    pub target: String,
}

impl FieldMapping {
    pub fn new(source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
        }
    }
}

/// A configured source-table to destination-table pairing.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TableGroupConfig {
    /// Position within the mapping's table groups; keys polling cursors.
    pub index: usize,
    pub source_table: TableDef,
    pub destination_table: TableDef,
    pub filter: Vec<FilterCondition>,
    /// Columns forwarded downstream; empty selects the mapped or all columns.
    pub column_projection: Vec<String>,
    pub field_mapping: Vec<FieldMapping>,
    /// Lower values dispatch first; ties keep configuration order.
    pub sync_order: u32,
    /// Polling query settings, opaque to the engine.
    pub command: BTreeMap<String, String>,
}

impl TableGroupConfig {
    pub fn new(source_table: TableDef, destination_table: TableDef) -> Self {
        Self {
            source_table,
            destination_table,
            ..Default::default()
        }
    }

    pub fn with_index(mut self, index: usize) -> Self {
        self.index = index;
        self
    }

    pub fn with_filter(mut self, condition: FilterCondition) -> Self {
        self.filter.push(condition);
        self
    }

    pub fn with_projection<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.column_projection = columns.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_field_mapping(mut self, mapping: FieldMapping) -> Self {
        self.field_mapping.push(mapping);
        self
    }

    pub fn with_sync_order(mut self, sync_order: u32) -> Self {
        self.sync_order = sync_order;
        self
    }

    pub fn with_command(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.command.insert(key.into(), value.into());
        self
    }

    /// Key under which a polling cursor for this pairing is stored.
    pub fn cursor_key(&self) -> String {
        self.index.to_string()
    }
}

/// Sort table groups by `sync_order`, keeping configuration order for ties.
pub fn order_table_groups(mut groups: Vec<TableGroupConfig>) -> Vec<TableGroupConfig> {
    groups.sort_by_key(|g| g.sync_order);
    groups
}

/// Persisted per-task metadata.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TaskMeta {
    pub task_id: String,
    pub begin_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub bookmark: StreamPosition,
    pub cursors: BTreeMap<String, String>,
}

impl TaskMeta {
    pub fn new(task_id: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            ..Default::default()
        }
    }

    pub fn with_bookmark(mut self, bookmark: StreamPosition) -> Self {
        self.bookmark = bookmark;
        self
    }
}

/// Engine-wide tunables.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct EngineConfig {
    /// Interval of the registry's bookmark flush tick
    pub flush_interval_secs: u64,
    /// Concurrent downstream calls per mutation in log-derived mode
    pub dispatch_concurrency: usize,
    /// Upper bound for one downstream `apply`
    pub apply_timeout_ms: u64,
    /// TCP connect + handshake bound
    pub connect_timeout_secs: u64,
    /// Idle bound on the binlog stream; `None` waits indefinitely
    pub read_timeout_secs: Option<u64>,
    /// Replica server id used when the connector does not set one
    pub server_id: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            flush_interval_secs: DEFAULT_FLUSH_INTERVAL_SECS,
            dispatch_concurrency: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
            apply_timeout_ms: 30_000,
            connect_timeout_secs: CONNECTION_TIMEOUT_SECS,
            read_timeout_secs: None,
            server_id: 65535,
        }
    }
}

impl EngineConfig {
    pub fn with_flush_interval(mut self, interval: Duration) -> Self {
        self.flush_interval_secs = interval.as_secs().max(1);
        self
    }

    pub fn with_dispatch_concurrency(mut self, concurrency: usize) -> Self {
        self.dispatch_concurrency = concurrency;
        self
    }

    pub fn with_apply_timeout(mut self, timeout: Duration) -> Self {
        self.apply_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_server_id(mut self, server_id: u32) -> Self {
        self.server_id = server_id;
        self
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_secs(self.flush_interval_secs.max(1))
    }

    pub fn apply_timeout(&self) -> Duration {
        Duration::from_millis(self.apply_timeout_ms.max(1))
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs.max(1))
    }

    pub fn read_timeout(&self) -> Option<Duration> {
        self.read_timeout_secs.map(Duration::from_secs)
    }

    pub fn concurrency(&self) -> usize {
        self.dispatch_concurrency.max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_url_multi_host() {
        let nodes = NodeAddr::parse_url("jdbc:mysql://10.0.0.1:3306,10.0.0.2:3307/shop?useSSL=false")
            .unwrap();
        assert_eq!(
            nodes,
            vec![NodeAddr::new("10.0.0.1", 3306), NodeAddr::new("10.0.0.2", 3307)]
        );
    }

    #[test]
    fn test_parse_url_default_port() {
        let nodes = NodeAddr::parse_url("mysql://db.internal/orders").unwrap();
        assert_eq!(nodes, vec![NodeAddr::new("db.internal", DEFAULT_MYSQL_PORT)]);
    }

    #[test]
    fn test_parse_url_without_trailing_path() {
        let nodes = NodeAddr::parse_url("mysql://127.0.0.1:3306").unwrap();
        assert_eq!(nodes[0].to_string(), "127.0.0.1:3306");
    }

    #[test]
    fn test_parse_url_errors() {
        assert!(NodeAddr::parse_url("not a url").is_err());
        assert!(NodeAddr::parse_url("mysql://,/db").is_err());
        assert!(NodeAddr::parse_url("mysql://host:port/db").is_err());
    }

    #[test]
    fn test_connector_debug_redacts_password() {
        let config = ConnectorConfig::new("src", "mysql://localhost:3306/db", "repl")
            .with_password("super_secret");
        let debug = format!("{:?}", config);
        assert!(!debug.contains("super_secret"));
        assert!(debug.contains("[REDACTED]"));
    }

    #[test]
    fn test_listener_kind_parse() {
        assert_eq!(ListenerKind::parse("log").unwrap(), ListenerKind::Log);
        assert_eq!(ListenerKind::parse(" Timing ").unwrap(), ListenerKind::Timing);
        let err = ListenerKind::parse("trigger").unwrap_err();
        assert!(matches!(err, CdcError::Config(_)));
    }

    #[test]
    fn test_order_table_groups_stable() {
        let a = TableGroupConfig::new(TableDef::new("a", ["id"]), TableDef::new("b", ["id"]))
            .with_index(0)
            .with_sync_order(1);
        let b = TableGroupConfig::new(TableDef::new("a", ["id"]), TableDef::new("c", ["id"]))
            .with_index(1)
            .with_sync_order(1);
        let c = TableGroupConfig::new(TableDef::new("x", ["id"]), TableDef::new("y", ["id"]))
            .with_index(2)
            .with_sync_order(0);
        let ordered = order_table_groups(vec![a, b, c]);
        let indexes: Vec<_> = ordered.iter().map(|g| g.index).collect();
        assert_eq!(indexes, vec![2, 0, 1]);
    }

    #[test]
    fn test_engine_config_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.flush_interval(), Duration::from_secs(10));
        assert!(config.concurrency() >= 1);
        assert_eq!(config.connect_timeout(), Duration::from_secs(30));
        assert!(config.read_timeout().is_none());
    }

    #[test]
    fn test_engine_config_deserialize_partial() {
        let config: EngineConfig =
            serde_json::from_str(r#"{"flush_interval_secs": 5, "server_id": 42}"#).unwrap();
        assert_eq!(config.flush_interval(), Duration::from_secs(5));
        assert_eq!(config.server_id, 42);
        assert_eq!(config.apply_timeout(), Duration::from_secs(30));
    }

    #[test]
    fn test_task_meta_serde() {
        let meta = TaskMeta::new("task-1").with_bookmark(StreamPosition::new("log.000002", 500));
        let json = serde_json::to_string(&meta).unwrap();
        let back: TaskMeta = serde_json::from_str(&json).unwrap();
        assert_eq!(back, meta);
    }
}
