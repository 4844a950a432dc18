//! Engine events: keyed notifications fanned out to any number of listeners.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::broadcast;

/// Something that happened inside the engine.
///
/// `key` is `<domain>.<action>`, for example `container.died`. The payload
/// carries the subject's `id`/`name` plus whatever the action adds
/// (`exit_code`, `digest`, ...).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineEvent {
    pub key: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub payload: BTreeMap<String, serde_json::Value>,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

impl EngineEvent {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            payload: BTreeMap::new(),
            timestamp: chrono::Utc::now(),
        }
    }

    /// Attach a payload field.
    pub fn with(mut self, field: &str, value: impl Into<serde_json::Value>) -> Self {
        self.payload.insert(field.to_string(), value.into());
        self
    }

    pub fn field(&self, name: &str) -> Option<&serde_json::Value> {
        self.payload.get(name)
    }

    /// String-valued payload field.
    pub fn field_str(&self, name: &str) -> Option<&str> {
        self.field(name).and_then(|v| v.as_str())
    }

    /// "container" for "container.started".
    pub fn domain(&self) -> &str {
        self.key.split_once('.').map_or(self.key.as_str(), |(d, _)| d)
    }
}

type Filter = Arc<dyn Fn(&EngineEvent) -> bool + Send + Sync>;

/// Broadcasts events. Clones share one channel.
#[derive(Clone)]
pub struct EventEmitter {
    tx: broadcast::Sender<EngineEvent>,
}

impl EventEmitter {
    /// `capacity` events are buffered per slow listener before it lags.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn emit(&self, event: EngineEvent) {
        tracing::trace!(key = %event.key, listeners = self.tx.receiver_count(), "event");
        // No listeners is not an error
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.tx.subscribe()
    }

    /// Listen for the events `filter` accepts.
    pub fn subscribe_filtered(
        &self,
        filter: impl Fn(&EngineEvent) -> bool + Send + Sync + 'static,
    ) -> EventStream {
        EventStream {
            rx: self.tx.subscribe(),
            filter: Arc::new(filter),
        }
    }
}

/// A filtered subscription.
pub struct EventStream {
    rx: broadcast::Receiver<EngineEvent>,
    filter: Filter,
}

impl EventStream {
    /// Next accepted event, or `None` once every emitter is gone.
    /// A lagging stream skips what it missed.
    pub async fn recv(&mut self) -> Option<EngineEvent> {
        use broadcast::error::RecvError;
        loop {
            let event = match self.rx.recv().await {
                Ok(event) => event,
                Err(RecvError::Lagged(missed)) => {
                    tracing::warn!(missed, "Event listener fell behind");
                    continue;
                }
                Err(RecvError::Closed) => return None,
            };
            if (self.filter)(&event) {
                return Some(event);
            }
        }
    }
}

/// Event keys emitted by the engine.
pub mod events {
    // Image events
    pub const IMAGE_BUILT: &str = "image.built";
    pub const IMAGE_TAGGED: &str = "image.tagged";
    pub const IMAGE_UNTAGGED: &str = "image.untagged";
    pub const IMAGE_REMOVED: &str = "image.removed";
    pub const IMAGE_IMPORTED: &str = "image.imported";
    pub const IMAGE_PRUNED: &str = "image.pruned";

    // Container events
    pub const CONTAINER_CREATED: &str = "container.created";
    pub const CONTAINER_STARTED: &str = "container.started";
    pub const CONTAINER_PAUSED: &str = "container.paused";
    pub const CONTAINER_UNPAUSED: &str = "container.unpaused";
    pub const CONTAINER_STOPPED: &str = "container.stopped";
    pub const CONTAINER_DIED: &str = "container.died";
    pub const CONTAINER_REMOVED: &str = "container.removed";
    pub const CONTAINER_COMMITTED: &str = "container.committed";

    // Volume events
    pub const VOLUME_CREATED: &str = "volume.created";
    pub const VOLUME_REMOVED: &str = "volume.removed";

    // Network events
    pub const NETWORK_CREATED: &str = "network.created";
    pub const NETWORK_REMOVED: &str = "network.removed";
    pub const NETWORK_CONNECTED: &str = "network.connected";
    pub const NETWORK_DISCONNECTED: &str = "network.disconnected";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_subscriber_sees_fields() {
        let emitter = EventEmitter::new(16);
        let mut rx = emitter.subscribe();

        emitter.emit(EngineEvent::new(events::CONTAINER_STARTED).with("id", "abc"));

        let event = rx.recv().await.unwrap();
        assert_eq!(event.key, events::CONTAINER_STARTED);
        assert_eq!(event.field_str("id"), Some("abc"));
        assert!(event.field("exit_code").is_none());
        assert_eq!(event.domain(), "container");
    }

    #[test]
    fn test_domain_without_action() {
        assert_eq!(EngineEvent::new("shutdown").domain(), "shutdown");
    }

    #[tokio::test]
    async fn test_filtered_stream() {
        let emitter = EventEmitter::new(16);
        let mut stream = emitter.subscribe_filtered(|e| e.domain() == "volume");

        emitter.emit(EngineEvent::new(events::IMAGE_BUILT));
        emitter.emit(EngineEvent::new(events::VOLUME_CREATED).with("name", "data"));

        let event = stream.recv().await.unwrap();
        assert_eq!(event.key, events::VOLUME_CREATED);
    }

    #[tokio::test]
    async fn test_stream_ends_when_emitter_dropped() {
        let emitter = EventEmitter::new(4);
        let mut stream = emitter.subscribe_filtered(|_| true);
        drop(emitter);
        assert!(stream.recv().await.is_none());
    }

    #[test]
    fn test_emit_without_subscribers() {
        let emitter = EventEmitter::new(4);
        emitter.emit(EngineEvent::new(events::NETWORK_CREATED));
    }

    #[test]
    fn test_event_json() {
        let event = EngineEvent::new(events::CONTAINER_DIED).with("exit_code", 0);
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["key"], "container.died");
        assert_eq!(json["payload"]["exit_code"], 0);

        let bare = serde_json::to_value(EngineEvent::new(events::IMAGE_PRUNED)).unwrap();
        assert!(bare.get("payload").is_none());
    }
}
