//! # Stream positions and bookmarks
//!
//! A [`StreamPosition`] is the `{file, offset}` resume point in the binlog.
//! [`BookmarkTracker`] holds a task's in-memory bookmark together with the
//! dirty flag shared between the read loop (setter) and the flush tick
//! (checker).
//!
//! ```text
//!  read loop                      flush tick
//!  ─────────                      ──────────
//!  advance(file, offset)
//!    └─ dirty.store(true) ───────▶ take_dirty()
//!                                    └─ dirty.swap(false) → Some(snapshot)
//!                                       persist snapshot
//!                                       on failure: mark_dirty()
//! ```

use crate::common::{CdcError, Result};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering as CmpOrdering;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::RwLock;

/// Offset of the first event in every binlog file (after the magic header).
pub const BINLOG_START_OFFSET: u64 = 4;

/// Resume point in the replication log.
///
/// An empty `file_name` means "stream start": the dump is issued without a
/// file name and the server begins with its oldest retained log.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct StreamPosition {
    pub file_name: String,
    pub offset: u64,
}

impl StreamPosition {
    pub fn new(file_name: impl Into<String>, offset: u64) -> Self {
        Self {
            file_name: file_name.into(),
            offset,
        }
    }

    /// The beginning of the retained log.
    pub fn start() -> Self {
        Self::default()
    }

    pub fn is_start(&self) -> bool {
        self.file_name.is_empty()
    }

    /// Offset to send in `COM_BINLOG_DUMP`.
    pub fn dump_offset(&self) -> u64 {
        self.offset.max(BINLOG_START_OFFSET)
    }

    /// Apply a control event.
    ///
    /// A new file name always wins. Within the same file the offset only
    /// moves forward. Returns `true` when the position changed.
    pub fn advance(&mut self, next_file: Option<&str>, next_offset: u64) -> bool {
        match next_file {
            Some(file) if !file.is_empty() && file != self.file_name => {
                self.file_name = file.to_string();
                self.offset = next_offset;
                true
            }
            _ if next_offset > self.offset => {
                self.offset = next_offset;
                true
            }
            _ => false,
        }
    }

    /// Parse the `file:offset` form produced by `Display`.
    pub fn parse(s: &str) -> Result<Self> {
        let (file, offset) = s
            .rsplit_once(':')
            .ok_or_else(|| CdcError::config(format!("Invalid stream position '{}'", s)))?;
        let offset = offset
            .parse()
            .map_err(|_| CdcError::config(format!("Invalid offset in stream position '{}'", s)))?;
        Ok(Self::new(file, offset))
    }
}

impl PartialOrd for StreamPosition {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for StreamPosition {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        self.file_name
            .cmp(&other.file_name)
            .then(self.offset.cmp(&other.offset))
    }
}

impl fmt::Display for StreamPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.file_name, self.offset)
    }
}

/// Snapshot of everything a task persists as its bookmark.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Bookmark {
    pub position: StreamPosition,
    /// Per-pairing cursors used in polling mode.
    pub cursors: BTreeMap<String, String>,
}

/// In-memory bookmark with an atomic check-and-clear dirty flag.
#[derive(Debug, Default)]
pub struct BookmarkTracker {
    state: RwLock<Bookmark>,
    dirty: AtomicBool,
}

impl BookmarkTracker {
    pub fn new(position: StreamPosition, cursors: BTreeMap<String, String>) -> Self {
        Self {
            state: RwLock::new(Bookmark { position, cursors }),
            dirty: AtomicBool::new(false),
        }
    }

    pub fn position(&self) -> StreamPosition {
        self.state
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .position
            .clone()
    }

    pub fn cursor(&self, key: &str) -> Option<String> {
        self.state
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .cursors
            .get(key)
            .cloned()
    }

    pub fn snapshot(&self) -> Bookmark {
        self.state.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Advance the position and mark dirty if it moved.
    pub fn advance(&self, next_file: Option<&str>, next_offset: u64) -> bool {
        let changed = self
            .state
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .position
            .advance(next_file, next_offset);
        if changed {
            self.mark_dirty();
        }
        changed
    }

    /// Store a polling cursor and mark dirty if it changed.
    pub fn set_cursor(&self, key: impl Into<String>, value: impl Into<String>) -> bool {
        let value = value.into();
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        let changed = state.cursors.insert(key.into(), value.clone()).as_ref() != Some(&value);
        drop(state);
        if changed {
            self.mark_dirty();
        }
        changed
    }

    pub fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::Release);
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    /// Clear the dirty flag and return the bookmark to persist.
    ///
    /// Returns `None` when nothing changed since the last call. The flag is
    /// cleared before the snapshot is taken, so an update racing with this
    /// call re-marks the tracker and is picked up by the next flush.
    pub fn take_dirty(&self) -> Option<Bookmark> {
        if self.dirty.swap(false, Ordering::AcqRel) {
            Some(self.snapshot())
        } else {
            None
        }
    }
}
