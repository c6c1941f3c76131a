//! # Capture tasks
//!
//! - [`TaskRegistry`] - owns running tasks; start/close/flush/shutdown
//! - [`LogExtractor`] - binlog-driven task
//! - [`PollingExtractor`] - timer-driven task issuing delta reads
//! - [`LogDispatcher`] / [`PollingDispatcher`] - downstream delivery
//! - [`FieldPicker`] - per-destination projection and filter
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐  start/close   ┌──────────────┐
//! │ TaskRegistry │ ─────────────► │  Extractor   │
//! │  flush tick  │ ─── flush ───► │ (log / poll) │
//! └──────────────┘                └──────┬───────┘
//!                                        │ rows
//!                                        ▼
//!                                 ┌──────────────┐    apply    ┌───────────┐
//!                                 │  Dispatcher  │ ──────────► │ Transform │
//!                                 │ FieldPickers │             └───────────┘
//!                                 └──────────────┘
//! ```

mod context;
mod dispatch;
mod extractor;
mod picker;
mod polling;
mod registry;

pub use context::TaskContext;
pub use dispatch::{LogDispatcher, PollingDispatcher};
pub use extractor::{LogExtractor, LogTaskStats, StateCell, TaskState};
pub use picker::FieldPicker;
pub use polling::PollingExtractor;
pub use registry::{CloseOutcome, FlushReport, StartOutcome, TaskRegistry};
