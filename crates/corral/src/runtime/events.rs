//! Container lifecycle events and bus.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Container lifecycle events.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RuntimeEvent {
    /// Container created.
    ContainerCreated { handle: String, timestamp: i64 },
    /// Container stopped.
    ContainerStopped { handle: String, timestamp: i64 },
    /// Container destroyed.
    ContainerDestroyed { handle: String, timestamp: i64 },
    /// The kernel killed a process of the container for exceeding its
    /// memory limit.
    OutOfMemory { handle: String, timestamp: i64 },
}

impl RuntimeEvent {
    /// Handle of the container the event is about.
    #[must_use]
    pub fn handle(&self) -> &str {
        match self {
            Self::ContainerCreated { handle, .. }
            | Self::ContainerStopped { handle, .. }
            | Self::ContainerDestroyed { handle, .. }
            | Self::OutOfMemory { handle, .. } => handle,
        }
    }
}

/// Event bus for container events.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<RuntimeEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        let (sender, _) = broadcast::channel(1024);
        Self { sender }
    }
}

impl EventBus {
    /// Create a new event bus.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to events.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<RuntimeEvent> {
        self.sender.subscribe()
    }

    /// Publish an event.
    pub fn publish(&self, event: RuntimeEvent) {
        // No subscribers is fine.
        let _ = self.sender.send(event);
    }
}

/// Current time as a unix timestamp.
pub(crate) fn now() -> i64 {
    chrono::Utc::now().timestamp()
}
