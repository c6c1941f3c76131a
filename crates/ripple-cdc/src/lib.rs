//! # ripple-cdc - MySQL binlog change data capture
//!
//! Reads a MySQL/MariaDB replication stream as a replica, decodes row
//! events, and fans every row out to the downstream destinations configured
//! for its table. Resume positions are tracked per task and persisted on a
//! fixed tick.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────┐   ┌──────────────────┐   ┌───────────────┐
//! │  MySQL    │──►│BinlogStreamClient│──►│ BinlogDecoder │
//! │  Binlog   │   └──────────────────┘   └───────┬───────┘
//! └───────────┘                                  │ RowChangeEvent
//!                                                ▼
//! ┌──────────────┐  flush   ┌──────────────┐  ┌───────────────┐
//! │ TaskRegistry │ ───────► │ LogExtractor │─►│ LogDispatcher │──► Transform
//! └──────────────┘          └──────────────┘  └───────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use ripple_cdc::capture::{TaskContext, TaskRegistry};
//! use ripple_cdc::common::{
//!     ConnectorConfig, DerivedChangeEvent, Mapping, MemoryMetadataStore, Result, TableDef,
//!     TableGroupConfig, Transform,
//! };
//! use std::sync::Arc;
//!
//! struct Print;
//!
//! #[async_trait::async_trait]
//! impl Transform for Print {
//!     async fn apply(
//!         &self,
//!         _mapping: &Mapping,
//!         _group: &TableGroupConfig,
//!         event: &DerivedChangeEvent,
//!     ) -> Result<()> {
//!         println!("{} -> {}: {:?}", event.source_table, event.destination_table, event.after);
//!         Ok(())
//!     }
//! }
//!
//! # async fn example() -> Result<()> {
//! let store = Arc::new(MemoryMetadataStore::new());
//! store
//!     .put_connector(ConnectorConfig::new("src", "mysql://localhost:3306/shop", "repl").with_password("secret"))
//!     .await;
//! store.put_mapping(Mapping::new("orders-sync", "src")).await;
//! store
//!     .put_table_groups(
//!         "orders-sync",
//!         vec![TableGroupConfig::new(
//!             TableDef::new("orders", ["id", "status"]),
//!             TableDef::new("orders_copy", ["id", "status"]),
//!         )],
//!     )
//!     .await;
//!
//! let registry = Arc::new(TaskRegistry::new(TaskContext::new(store, Arc::new(Print))));
//! registry.start_flush_schedule();
//! registry.start_task("orders-sync").await?;
//! // ...
//! registry.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod capture;
pub mod common;
pub mod mysql;

pub use capture::{CloseOutcome, StartOutcome, TaskContext, TaskRegistry, TaskState};
pub use common::{CdcError, CdcOp, ErrorCategory, Result};
