//! # Common CDC Types and Traits
//!
//! Source-agnostic building blocks shared by the binlog client and the
//! capture layer:
//!
//! - [`CdcError`] / [`ErrorCategory`] - Error taxonomy
//! - [`StreamPosition`] / [`BookmarkTracker`] - Resumable position with an atomic dirty flag
//! - [`ConnectorConfig`], [`Mapping`], [`TableGroupConfig`], [`EngineConfig`] - Configuration
//! - [`RowChangeEvent`], [`DerivedChangeEvent`] - Change events
//! - [`FilterPredicate`] - Table-group row filters
//! - [`MetadataStore`], [`Transform`], [`AuditSink`], [`DeltaReader`] - Collaborator seams
//! - [`Scheduler`] - Injected periodic ticker
//! - [`TaskNotifier`] - Task lifecycle notifications
//! - [`Validator`] - Input validation
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    Common Module                            │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Position      ←─── {file, offset} bookmark + dirty flag    │
//! │  Config        ←─── Connectors, mappings, table groups      │
//! │  Event         ←─── Row changes, derived events             │
//! │  Filter        ←─── and/or predicates over projected rows   │
//! │  Traits        ←─── Store, transform, audit, delta, task    │
//! │  Schedule      ←─── Flush tick, polling cycles              │
//! │  Notification  ←─── Started / closed / failed               │
//! └─────────────────────────────────────────────────────────────┘
//! ```

mod config;
mod error;
mod event;
mod filter;
mod notification;
mod position;
mod schedule;
mod store;
mod traits;
mod validation;

pub use config::*;
pub use error::*;
pub use event::*;
pub use filter::*;
pub use notification::*;
pub use position::*;
pub use schedule::*;
pub use store::*;
pub use traits::*;
pub use validation::*;
