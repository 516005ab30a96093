//! Event bus (§4.9).
//!
//! In-process publish/subscribe for the topics listed below. Delivery is
//! best-effort: a subscriber whose buffer fills is simply dropped from that
//! publish (no backpressure, no replay for late joiners) — matching the
//! "fire and forget" texture of the teacher's D-Bus signal emission, just
//! generalized from one bus (D-Bus) to an in-process broadcast channel.

use serde::Serialize;
use tokio::sync::broadcast;

/// Minimum per-subscriber buffer capacity (§4.9).
pub const MIN_BUFFER: usize = 64;

/// One bus event. `topic` matches the §4.9 topic list; `payload` is
/// pre-serialized JSON so SSE subscribers can forward it unchanged.
#[derive(Debug, Clone, Serialize)]
pub struct BusEvent {
    pub topic: &'static str,
    pub payload: serde_json::Value,
}

pub const TOPIC_CONNECTED: &str = "connected";
pub const TOPIC_REQUEST_CREATED: &str = "request:created";
pub const TOPIC_REQUEST_APPROVED: &str = "request:approved";
pub const TOPIC_REQUEST_DENIED: &str = "request:denied";
pub const TOPIC_REQUEST_EXPIRED: &str = "request:expired";
pub const TOPIC_REQUEST_AUTO_APPROVED: &str = "request:auto_approved";
pub const TOPIC_STATS_UPDATED: &str = "stats:updated";
pub const TOPIC_APP_CONNECTED: &str = "app:connected";
pub const TOPIC_APP_REVOKED: &str = "app:revoked";
pub const TOPIC_KEY_CREATED: &str = "key:created";
pub const TOPIC_KEY_UNLOCKED: &str = "key:unlocked";
pub const TOPIC_KEY_DELETED: &str = "key:deleted";
pub const TOPIC_RELAYS_UPDATED: &str = "relays:updated";

/// Process-wide broadcast hub. One instance, threaded through constructors
/// (§9 "replace global singletons with an explicit context value").
pub struct EventBus {
    sender: broadcast::Sender<BusEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(MIN_BUFFER.max(256));
        Self { sender }
    }

    pub fn publish(&self, topic: &'static str, payload: impl Serialize) {
        let payload = serde_json::to_value(payload).unwrap_or(serde_json::Value::Null);
        // A publish with no subscribers is not an error; `send` only fails
        // when the receiver count is zero.
        let _ = self.sender.send(BusEvent { topic, payload });
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BusEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscriber_receives_published_event() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        bus.publish(TOPIC_KEY_CREATED, serde_json::json!({"name": "alice"}));
        let event = rx.recv().await.unwrap();
        assert_eq!(event.topic, TOPIC_KEY_CREATED);
    }

    #[tokio::test]
    async fn slow_subscriber_is_dropped_not_blocking() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        for i in 0..300 {
            bus.publish(TOPIC_STATS_UPDATED, serde_json::json!({"i": i}));
        }
        // the lagged receiver should report a Lagged error rather than hang
        let result = rx.recv().await;
        assert!(result.is_ok() || matches!(result, Err(broadcast::error::RecvError::Lagged(_))));
    }

    #[tokio::test]
    async fn publish_with_no_subscribers_does_not_panic() {
        let bus = EventBus::new();
        bus.publish(TOPIC_RELAYS_UPDATED, serde_json::json!({}));
    }
}
