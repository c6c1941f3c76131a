//! # Task notifications
//!
//! Lifecycle notifications for external observers (status pages, admin
//! surfaces). Every registry `unregister` emits exactly one
//! [`TaskNotificationKind::Closed`].
//!
//! ```rust
//! use ripple_cdc::common::{TaskNotificationKind, TaskNotifier};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let notifier = TaskNotifier::new();
//! let mut rx = notifier.subscribe();
//!
//! notifier.closed("mapping-1");
//!
//! let notification = rx.recv().await.unwrap();
//! assert_eq!(notification.kind, TaskNotificationKind::Closed);
//! assert_eq!(notification.task_id, "mapping-1");
//! # }
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::broadcast;
use tracing::debug;
use uuid::Uuid;

/// Notification types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskNotificationKind {
    /// Task reached RUNNING
    Started,
    /// Task removed from the registry
    Closed,
    /// Task hit an unrecoverable error
    Failed,
}

/// A single notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskNotification {
    pub id: Uuid,
    pub kind: TaskNotificationKind,
    pub task_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl TaskNotification {
    pub fn new(kind: TaskNotificationKind, task_id: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            task_id: task_id.into(),
            message: None,
            timestamp: Utc::now(),
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}

/// Broadcasts task notifications to any number of subscribers.
///
/// Sending never blocks; slow subscribers lag and lose the oldest entries.
#[derive(Debug)]
pub struct TaskNotifier {
    sender: broadcast::Sender<TaskNotification>,
    sent: AtomicU64,
}

impl Default for TaskNotifier {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskNotifier {
    pub fn new() -> Self {
        Self::with_capacity(256)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            sent: AtomicU64::new(0),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TaskNotification> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    /// Total notifications emitted, with or without subscribers.
    pub fn total_sent(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }

    pub fn notify(&self, notification: TaskNotification) {
        self.sent.fetch_add(1, Ordering::Relaxed);
        debug!(
            task_id = %notification.task_id,
            kind = ?notification.kind,
            "Task notification"
        );
        // No subscribers is fine
        let _ = self.sender.send(notification);
    }

    pub fn started(&self, task_id: &str) {
        self.notify(TaskNotification::new(TaskNotificationKind::Started, task_id));
    }

    pub fn closed(&self, task_id: &str) {
        self.notify(TaskNotification::new(TaskNotificationKind::Closed, task_id));
    }

    pub fn failed(&self, task_id: &str, error: &str) {
        self.notify(
            TaskNotification::new(TaskNotificationKind::Failed, task_id).with_message(error),
        );
    }
}
