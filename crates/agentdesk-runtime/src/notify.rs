//! Notification channel — best-effort publish of named events.

use agentdesk_core::Result;
use serde::Serialize;
use tokio::sync::broadcast;

/// Topics published by the orchestrator and run tasks.
pub mod topics {
    pub const CONNECTION_ACK: &str = "connection-ack";
    pub const WARNING: &str = "warning";
    pub const STATE_CHANGED: &str = "state-changed";
    /// A reply produced by a run task.
    pub const AGENT_MESSAGE: &str = "agent-message";
}

/// A published event.
#[derive(Debug, Clone, Serialize)]
pub struct Notification {
    pub topic: String,
    pub payload: serde_json::Value,
    #[serde(rename = "emittedAt")]
    pub emitted_at: i64,
}

/// Outbound event sink. Delivery is at-most-once to current subscribers.
pub trait Notifier: Send + Sync {
    /// Publish an event, returning how many subscribers it reached.
    fn publish(&self, topic: &str, payload: serde_json::Value) -> Result<usize>;
}

/// In-process broadcast bus. Slow subscribers lag and lose events rather than
/// blocking publishers.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<Notification>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(1024)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.tx.subscribe()
    }

    /// Number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl Notifier for EventBus {
    fn publish(&self, topic: &str, payload: serde_json::Value) -> Result<usize> {
        let event = Notification {
            topic: topic.to_string(),
            payload,
            emitted_at: crate::types::now_millis(),
        };
        // Only fails when nobody is listening.
        Ok(self.tx.send(event).unwrap_or(0))
    }
}
