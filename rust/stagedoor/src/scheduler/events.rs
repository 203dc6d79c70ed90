//! Per-task event streaming for observers.
//!
//! Pub/sub fan-out from the scheduler to UI clients: each task gets its own
//! broadcast channel, created lazily and torn down when the task is
//! removed. Slow subscribers lag and drop old events rather than applying
//! backpressure to the scheduler.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::domain::TaskStatus;

/// Channel capacity per task; beyond this a lagging subscriber loses the
/// oldest events.
const CHANNEL_CAPACITY: usize = 256;

/// Observable change on one task.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TaskEvent {
    /// Lifecycle transition.
    StatusChanged {
        task_id: String,
        from: TaskStatus,
        to: TaskStatus,
        timestamp: DateTime<Utc>,
    },
    /// New log line appended.
    Log { task_id: String, message: String },
    /// Payment link became available.
    PaymentLink { task_id: String, url: String },
}

impl TaskEvent {
    /// The task this event belongs to.
    #[must_use]
    pub fn task_id(&self) -> &str {
        match self {
            Self::StatusChanged { task_id, .. }
            | Self::Log { task_id, .. }
            | Self::PaymentLink { task_id, .. } => task_id,
        }
    }
}

/// Event bus keyed by task id.
#[derive(Debug, Clone, Default)]
pub struct TaskEventBus {
    channels: Arc<RwLock<HashMap<String, broadcast::Sender<TaskEvent>>>>,
}

impl TaskEventBus {
    /// Create an empty bus.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to a task's events, creating the channel if needed.
    pub fn subscribe(&self, task_id: &str) -> broadcast::Receiver<TaskEvent> {
        let mut channels = self.channels.write();
        let sender = channels.entry(task_id.to_string()).or_insert_with(|| {
            let (tx, _rx) = broadcast::channel(CHANNEL_CAPACITY);
            tx
        });
        sender.subscribe()
    }

    /// Broadcast an event to the task's subscribers; without subscribers
    /// the event is dropped, events are ephemeral.
    pub fn broadcast(&self, event: TaskEvent) {
        let channels = self.channels.read();
        if let Some(sender) = channels.get(event.task_id()) {
            let _ = sender.send(event);
        }
    }

    /// The scheduler re-keys a task's entry when the executor assigns the
    /// real id; existing subscribers follow the channel to the new key.
    pub fn rekey(&self, old_id: &str, new_id: &str) {
        let mut channels = self.channels.write();
        if let Some(sender) = channels.remove(old_id) {
            channels.insert(new_id.to_string(), sender);
        }
    }

    /// Drop a removed task's channel; subscribers observe a close.
    pub fn cleanup(&self, task_id: &str) {
        self.channels.write().remove(task_id);
    }

    /// Number of live channels, for diagnostics.
    #[must_use]
    pub fn active_channels(&self) -> usize {
        self.channels.read().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_broadcast_reaches_subscriber() {
        let bus = TaskEventBus::new();
        let mut rx = bus.subscribe("t-1");

        bus.broadcast(TaskEvent::Log {
            task_id: "t-1".to_string(),
            message: "armed".to_string(),
        });

        let event = rx.recv().await.unwrap();
        assert_eq!(event.task_id(), "t-1");
    }

    #[tokio::test]
    async fn test_events_isolated_per_task() {
        let bus = TaskEventBus::new();
        let mut rx1 = bus.subscribe("t-1");
        let _rx2 = bus.subscribe("t-2");

        bus.broadcast(TaskEvent::Log {
            task_id: "t-1".to_string(),
            message: "only t-1".to_string(),
        });

        let event = rx1.recv().await.unwrap();
        assert_eq!(event.task_id(), "t-1");
        assert_eq!(bus.active_channels(), 2);
    }

    #[tokio::test]
    async fn test_rekey_keeps_subscribers() {
        let bus = TaskEventBus::new();
        let mut rx = bus.subscribe("pending-abc");

        bus.rekey("pending-abc", "x-42");
        bus.broadcast(TaskEvent::Log {
            task_id: "x-42".to_string(),
            message: "running".to_string(),
        });

        let event = rx.recv().await.unwrap();
        assert_eq!(event.task_id(), "x-42");
    }

    #[tokio::test]
    async fn test_cleanup_closes_channel() {
        let bus = TaskEventBus::new();
        let mut rx = bus.subscribe("t-1");

        bus.cleanup("t-1");
        assert_eq!(bus.active_channels(), 0);
        assert!(rx.recv().await.is_err());
    }
}
