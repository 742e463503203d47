//! Run observability events.
//!
//! Components emit best-effort, fire-and-forget events through an injected
//! [`EventBus`]. Delivery is never awaited on the hot path and send failures
//! (no subscribers) are ignored.

use serde::Serialize;
use serde_json::Value;
use tokio::sync::broadcast;

/// Channels events are emitted on.
pub mod channels {
    pub const RUNS: &str = "runs";
    pub const DELEGATION: &str = "delegation";
    pub const POLLING: &str = "polling";
}

/// An emitted event as seen by subscribers.
#[derive(Debug, Clone, Serialize)]
pub struct EmittedEvent {
    pub channel: String,
    pub event: String,
    pub payload: Value,
}

/// Fire-and-forget event emitter.
pub trait EventBus: Send + Sync {
    fn emit(&self, channel: &str, event: &str, payload: Value);
}

/// Broadcast-backed bus. Subscribers that lag simply miss events.
pub struct BroadcastEventBus {
    tx: broadcast::Sender<EmittedEvent>,
}

impl BroadcastEventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EmittedEvent> {
        self.tx.subscribe()
    }
}

impl Default for BroadcastEventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

impl EventBus for BroadcastEventBus {
    fn emit(&self, channel: &str, event: &str, payload: Value) {
        let _ = self.tx.send(EmittedEvent {
            channel: channel.to_string(),
            event: event.to_string(),
            payload,
        });
    }
}
