//! Relay pool (§4.7).
//!
//! The teacher talks to `nostr_sdk::Client` directly with no seam at all
//! (`bunker.rs`), which makes the reconnect/backoff/health-loop timing
//! impossible to exercise without real sockets. [`RelayTransport`] factors
//! that interaction out: production wires it to `nostr-sdk`'s `Client`,
//! tests wire it to an in-memory fake (see `relay::fake` in the test
//! module below).

pub mod subscription;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use nostr::prelude::*;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::{Result, SignetError};

/// Connection lifecycle of one relay (§4.7).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Disconnected,
    Connecting,
    Connected,
    Authenticated,
}

/// In-memory status record for one relay (§3 "Relay status").
#[derive(Debug, Clone)]
pub struct RelayStatus {
    pub url: String,
    pub state: ConnState,
    pub last_connected_at: Option<Instant>,
    pub last_disconnected_at: Option<Instant>,
    pub attempts: u32,
}

/// Seam between the pool and the underlying WebSocket client.
///
/// One `RelayTransport` is owned by the pool for its whole lifetime; `connect`
/// may be called repeatedly (reconnect) and must be idempotent when already
/// connected.
#[async_trait]
pub trait RelayTransport: Send + Sync {
    async fn connect(&self, url: &str) -> Result<()>;
    async fn disconnect(&self, url: &str) -> Result<()>;
    async fn publish(&self, url: &str, event: &Event) -> Result<()>;
    async fn subscribe(&self, url: &str, sub_id: &str, filter: Filter) -> Result<()>;
    /// Pull the next inbound event across any relay, if one is queued.
    async fn try_recv(&self) -> Option<(String, Event)>;
    fn is_connected(&self, url: &str) -> bool;
}

/// Backoff schedule for reconnects: `min(1s * 2^attempts, 30s)` (§4.7).
pub fn reconnect_delay(attempts: u32) -> Duration {
    let secs = 1u64.saturating_shl(attempts.min(5)).min(30);
    Duration::from_secs(secs)
}

type OnEvent = Arc<dyn Fn(Event) + Send + Sync>;

struct Subscription {
    filter: Filter,
    on_event: OnEvent,
}

/// Multiplexed outbound connections to several Nostr relays (§4.7).
pub struct RelayPool {
    transport: Arc<dyn RelayTransport>,
    status: DashMap<String, RelayStatus>,
    subscriptions: DashMap<String, Subscription>,
}

impl RelayPool {
    pub fn new(transport: Arc<dyn RelayTransport>) -> Self {
        Self { transport, status: DashMap::new(), subscriptions: DashMap::new() }
    }

    pub async fn add_relay(&self, url: &str) -> Result<()> {
        self.status.insert(
            url.to_string(),
            RelayStatus { url: url.to_string(), state: ConnState::Connecting, last_connected_at: None, last_disconnected_at: None, attempts: 0 },
        );
        self.transport.connect(url).await?;
        if let Some(mut entry) = self.status.get_mut(url) {
            entry.state = ConnState::Connected;
            entry.last_connected_at = Some(Instant::now());
            entry.attempts = 0;
        }
        // Re-arm every existing subscription on the freshly connected relay.
        for entry in self.subscriptions.iter() {
            let _ = self.transport.subscribe(url, entry.key(), entry.value().filter.clone()).await;
        }
        Ok(())
    }

    pub fn statuses(&self) -> Vec<RelayStatus> {
        self.status.iter().map(|e| e.value().clone()).collect()
    }

    pub fn relay_urls(&self) -> Vec<String> {
        self.status.iter().map(|e| e.key().clone()).collect()
    }

    /// `publish`: dispatch to every connected relay concurrently, returning
    /// as soon as dispatch has happened — it does not wait for per-relay OK.
    pub async fn publish(&self, event: &Event) -> Result<()> {
        let urls: Vec<String> = self.status.iter().filter(|e| e.value().state == ConnState::Connected).map(|e| e.key().clone()).collect();
        if urls.is_empty() {
            return Err(SignetError::TransientIo("no connected relays".into()));
        }
        let futures = urls.iter().map(|url| self.transport.publish(url, event));
        let results = futures::future::join_all(futures).await;
        for (url, result) in urls.iter().zip(results) {
            if let Err(e) = result {
                warn!(relay = url, error = %e, "publish failed on relay");
            }
        }
        Ok(())
    }

    /// `subscribe`: register on every current relay and on any relay added
    /// later (see `add_relay`).
    pub async fn subscribe(&self, sub_id: &str, filter: Filter, on_event: OnEvent) -> Result<()> {
        self.subscriptions.insert(sub_id.to_string(), Subscription { filter: filter.clone(), on_event });
        for url in self.relay_urls() {
            let _ = self.transport.subscribe(&url, sub_id, filter.clone()).await;
        }
        Ok(())
    }

    pub fn unsubscribe(&self, sub_id: &str) {
        self.subscriptions.remove(sub_id);
    }

    /// Dispatch one inbound event to its subscription's handler, if any are
    /// queued on the transport. Intended to be polled from a dedicated task.
    pub async fn pump_once(&self) -> bool {
        if let Some((sub_id, event)) = self.transport.try_recv().await {
            if let Some(sub) = self.subscriptions.get(&sub_id) {
                (sub.on_event)(event);
            }
            true
        } else {
            false
        }
    }

    /// Reconnect a relay whose status isn't `Connected` (§4.7 health loop
    /// and §4.8 failed-probe reaction).
    pub async fn reconnect(&self, url: &str) -> Result<()> {
        let attempts = self.status.get(url).map(|e| e.attempts).unwrap_or(0);
        tokio::time::sleep(reconnect_delay(attempts)).await;
        match self.transport.connect(url).await {
            Ok(()) => {
                if let Some(mut entry) = self.status.get_mut(url) {
                    entry.state = ConnState::Connected;
                    entry.last_connected_at = Some(Instant::now());
                    entry.attempts = 0;
                }
                Ok(())
            }
            Err(e) => {
                if let Some(mut entry) = self.status.get_mut(url) {
                    entry.attempts += 1;
                    entry.state = ConnState::Disconnected;
                    entry.last_disconnected_at = Some(Instant::now());
                }
                Err(e)
            }
        }
    }

    /// Background health loop (every 30 s): force reconnection of any relay
    /// not currently `Connected` (§4.7).
    pub async fn health_check_once(&self) {
        let stale: Vec<String> = self.status.iter().filter(|e| e.value().state != ConnState::Connected).map(|e| e.key().clone()).collect();
        for url in stale {
            debug!(relay = url, "health check: reconnecting");
            let _ = self.reconnect(&url).await;
        }
    }
}

/// `nostr-sdk`-backed production transport.
pub struct NostrSdkTransport {
    client: nostr_sdk::Client,
    inbound: tokio::sync::Mutex<mpsc::UnboundedReceiver<(String, Event)>>,
    inbound_tx: mpsc::UnboundedSender<(String, Event)>,
    connected: DashMap<String, bool>,
}

impl NostrSdkTransport {
    pub fn new(client: nostr_sdk::Client) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self { client, inbound: tokio::sync::Mutex::new(rx), inbound_tx: tx, connected: DashMap::new() }
    }

    /// Drive `nostr-sdk`'s notification stream into the inbound channel.
    /// Spawned once at startup; subscription ids are threaded through the
    /// NIP-46 backend's own filter bookkeeping, not `nostr-sdk`'s.
    pub async fn run_notification_loop(self: Arc<Self>) {
        let tx = self.inbound_tx.clone();
        let client = self.client.clone();
        let _ = client
            .handle_notifications(move |notification| {
                let tx = tx.clone();
                async move {
                    if let nostr_sdk::RelayPoolNotification::Event { subscription_id, event, .. } = notification {
                        let _ = tx.send((subscription_id.to_string(), (*event).clone()));
                    }
                    Ok(false)
                }
            })
            .await;
    }
}

#[async_trait]
impl RelayTransport for NostrSdkTransport {
    async fn connect(&self, url: &str) -> Result<()> {
        self.client.add_relay(url).await.map_err(|e| SignetError::NostrError(e.to_string()))?;
        self.client.connect().await;
        self.connected.insert(url.to_string(), true);
        Ok(())
    }

    async fn disconnect(&self, url: &str) -> Result<()> {
        self.connected.insert(url.to_string(), false);
        let _ = self.client.remove_relay(url).await;
        Ok(())
    }

    async fn publish(&self, _url: &str, event: &Event) -> Result<()> {
        self.client.send_event(event).await.map_err(|e| SignetError::TransientIo(e.to_string()))?;
        Ok(())
    }

    async fn subscribe(&self, _url: &str, _sub_id: &str, filter: Filter) -> Result<()> {
        self.client.subscribe(filter, None).await.map_err(|e| SignetError::NostrError(e.to_string()))?;
        Ok(())
    }

    async fn try_recv(&self) -> Option<(String, Event)> {
        self.inbound.lock().await.try_recv().ok()
    }

    fn is_connected(&self, url: &str) -> bool {
        self.connected.get(url).map(|v| *v).unwrap_or(false)
    }
}

#[cfg(test)]
pub mod fake {
    //! In-memory [`RelayTransport`] fake used by the relay/subscription
    //! timing tests.

    use super::*;
    use std::sync::Mutex as StdMutex;

    pub struct FakeTransport {
        pub connected: DashMap<String, bool>,
        pub publishes: StdMutex<Vec<(String, EventId)>>,
        pub fail_connect: DashMap<String, bool>,
        inbound: tokio::sync::Mutex<Vec<(String, Event)>>,
    }

    impl FakeTransport {
        pub fn new() -> Self {
            Self { connected: DashMap::new(), publishes: StdMutex::new(Vec::new()), fail_connect: DashMap::new(), inbound: tokio::sync::Mutex::new(Vec::new()) }
        }

        pub fn set_fail_connect(&self, url: &str, fail: bool) {
            self.fail_connect.insert(url.to_string(), fail);
        }

        pub async fn push_inbound(&self, sub_id: &str, event: Event) {
            self.inbound.lock().await.push((sub_id.to_string(), event));
        }
    }

    #[async_trait]
    impl RelayTransport for FakeTransport {
        async fn connect(&self, url: &str) -> Result<()> {
            if self.fail_connect.get(url).map(|v| *v).unwrap_or(false) {
                return Err(SignetError::TransientIo(format!("{url} refused")));
            }
            self.connected.insert(url.to_string(), true);
            Ok(())
        }

        async fn disconnect(&self, url: &str) -> Result<()> {
            self.connected.insert(url.to_string(), false);
            Ok(())
        }

        async fn publish(&self, url: &str, event: &Event) -> Result<()> {
            self.publishes.lock().unwrap().push((url.to_string(), event.id));
            Ok(())
        }

        async fn subscribe(&self, _url: &str, _sub_id: &str, _filter: Filter) -> Result<()> {
            Ok(())
        }

        async fn try_recv(&self) -> Option<(String, Event)> {
            self.inbound.lock().await.pop()
        }

        fn is_connected(&self, url: &str) -> bool {
            self.connected.get(url).map(|v| *v).unwrap_or(false)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::fake::FakeTransport;
    use super::*;

    #[test]
    fn backoff_doubles_up_to_cap() {
        assert_eq!(reconnect_delay(0), Duration::from_secs(1));
        assert_eq!(reconnect_delay(1), Duration::from_secs(2));
        assert_eq!(reconnect_delay(4), Duration::from_secs(16));
        assert_eq!(reconnect_delay(10), Duration::from_secs(30));
    }

    #[tokio::test]
    async fn publish_dispatches_to_all_connected_relays() {
        let transport = Arc::new(FakeTransport::new());
        let pool = RelayPool::new(transport.clone());
        pool.add_relay("wss://a").await.unwrap();
        pool.add_relay("wss://b").await.unwrap();

        let keys = Keys::generate();
        let event = EventBuilder::text_note("gm").sign_with_keys(&keys).unwrap();
        pool.publish(&event).await.unwrap();

        assert_eq!(transport.publishes.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn publish_fails_with_no_connected_relays() {
        let transport = Arc::new(FakeTransport::new());
        let pool = RelayPool::new(transport);
        let keys = Keys::generate();
        let event = EventBuilder::text_note("gm").sign_with_keys(&keys).unwrap();
        let err = pool.publish(&event).await.unwrap_err();
        assert!(matches!(err, SignetError::TransientIo(_)));
    }

    #[tokio::test]
    async fn reconnect_resets_attempts_on_success() {
        let transport = Arc::new(FakeTransport::new());
        transport.set_fail_connect("wss://a", true);
        let pool = RelayPool::new(transport.clone());
        let _ = pool.add_relay("wss://a").await;
        assert!(pool.reconnect("wss://a").await.is_err());

        transport.set_fail_connect("wss://a", false);
        pool.reconnect("wss://a").await.unwrap();
        let status = pool.statuses().into_iter().find(|s| s.url == "wss://a").unwrap();
        assert_eq!(status.attempts, 0);
        assert_eq!(status.state, ConnState::Connected);
    }
}
