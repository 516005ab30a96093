//! Subscription manager (§4.8).
//!
//! Wraps [`super::RelayPool`] with the invariant that every registered
//! subscription is live on at least one relay. Owns the heartbeat loop:
//! sleep/wake detection via elapsed-time jump, a throwaway ping probe when
//! no jump is detected, and a debounced restart of every tracked
//! subscription when either signals trouble.

use std::sync::Arc;
use std::time::Duration;

use nostr::prelude::*;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{info, warn};

use super::RelayPool;
use crate::error::Result;

/// Default heartbeat interval (§4.8).
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(60);
/// A tick further apart than this multiple of the interval is a sleep/wake event.
pub const SLEEP_JUMP_MULTIPLIER: u32 = 3;
/// EOSE wait budget for the ping probe.
pub const PING_PROBE_TIMEOUT: Duration = Duration::from_secs(10);
/// Quiescence window before a restart actually runs (§4.8 "debounced 2s").
pub const RESTART_DEBOUNCE: Duration = Duration::from_secs(2);
/// Pause between closing and recreating subscriptions during a restart.
pub const RESTART_SETTLE: Duration = Duration::from_millis(500);

type OnEvent = Arc<dyn Fn(Event) + Send + Sync>;

#[derive(Clone)]
struct Managed {
    id: String,
    filter: Filter,
    on_event: OnEvent,
}

/// Outcome of one heartbeat tick, exposed for testability.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatOutcome {
    Healthy,
    SleepDetected,
    ProbeFailed,
}

pub struct SubscriptionManager {
    pool: Arc<RelayPool>,
    managed: Mutex<Vec<Managed>>,
    last_tick: Mutex<Option<Instant>>,
}

impl SubscriptionManager {
    pub fn new(pool: Arc<RelayPool>) -> Self {
        Self { pool, managed: Mutex::new(Vec::new()), last_tick: Mutex::new(None) }
    }

    pub async fn subscribe(&self, id: &str, filter: Filter, on_event: OnEvent) -> Result<()> {
        self.managed.lock().await.push(Managed { id: id.to_string(), filter: filter.clone(), on_event: on_event.clone() });
        self.pool.subscribe(id, filter, on_event).await
    }

    pub async fn unsubscribe(&self, id: &str) {
        self.managed.lock().await.retain(|m| m.id != id);
        self.pool.unsubscribe(id);
    }

    /// Run one heartbeat tick at `now` (injected so tests can simulate a
    /// clock jump without sleeping for real).
    pub async fn heartbeat_tick(&self, now: Instant) -> HeartbeatOutcome {
        let previous = { self.last_tick.lock().await.replace(now) };

        if let Some(previous) = previous {
            let elapsed = now.saturating_duration_since(previous);
            if elapsed > HEARTBEAT_INTERVAL * SLEEP_JUMP_MULTIPLIER {
                warn!(elapsed_secs = elapsed.as_secs(), "sleep/wake jump detected, restarting subscriptions");
                self.restart().await;
                return HeartbeatOutcome::SleepDetected;
            }
        }

        match self.ping_probe().await {
            true => HeartbeatOutcome::Healthy,
            false => {
                for url in self.pool.relay_urls() {
                    let _ = self.pool.reconnect(&url).await;
                }
                self.restart().await;
                HeartbeatOutcome::ProbeFailed
            }
        }
    }

    /// Open a throwaway subscription guaranteed to return no stored events
    /// and wait for an EOSE signal (modeled here as "did any relay accept
    /// the subscribe call", since the transport seam doesn't expose a
    /// separate EOSE primitive).
    async fn ping_probe(&self) -> bool {
        let probe_id = format!("ping-{}", uuid::Uuid::new_v4());
        let filter = Filter::new().kind(Kind::Metadata).since(Timestamp::now() + 31_536_000u64).limit(1);
        let result = tokio::time::timeout(PING_PROBE_TIMEOUT, self.pool.subscribe(&probe_id, filter, Arc::new(|_| {}))).await;
        self.pool.unsubscribe(&probe_id);
        matches!(result, Ok(Ok(())))
    }

    /// Debounced restart: close every managed subscription, settle, then
    /// recreate each with its original triple (§4.8).
    pub async fn restart(&self) {
        tokio::time::sleep(RESTART_DEBOUNCE).await;
        let managed = self.managed.lock().await.clone();
        for m in &managed {
            self.pool.unsubscribe(&m.id);
        }
        tokio::time::sleep(RESTART_SETTLE).await;
        for m in &managed {
            if let Err(e) = self.pool.subscribe(&m.id, m.filter.clone(), m.on_event.clone()).await {
                warn!(subscription = m.id, error = %e, "failed to recreate subscription after restart");
            }
        }
        info!(count = managed.len(), "subscriptions restarted");
    }
}

#[cfg(test)]
mod tests {
    use super::super::fake::FakeTransport;
    use super::*;

    #[tokio::test]
    async fn sleep_jump_triggers_restart_of_every_subscription() {
        let transport = Arc::new(FakeTransport::new());
        let pool = Arc::new(RelayPool::new(transport));
        pool.add_relay("wss://a").await.unwrap();
        let manager = SubscriptionManager::new(pool);

        manager.subscribe("sub1", Filter::new().kind(Kind::TextNote), Arc::new(|_| {})).await.unwrap();
        manager.subscribe("sub2", Filter::new().kind(Kind::Metadata), Arc::new(|_| {})).await.unwrap();

        let t0 = Instant::now();
        let outcome1 = manager.heartbeat_tick(t0).await;
        assert_eq!(outcome1, HeartbeatOutcome::Healthy);

        let jump = t0 + HEARTBEAT_INTERVAL * (SLEEP_JUMP_MULTIPLIER + 1);
        let outcome2 = manager.heartbeat_tick(jump).await;
        assert_eq!(outcome2, HeartbeatOutcome::SleepDetected);

        assert_eq!(manager.managed.lock().await.len(), 2);
    }

    #[tokio::test]
    async fn healthy_tick_does_not_restart() {
        let transport = Arc::new(FakeTransport::new());
        let pool = Arc::new(RelayPool::new(transport));
        pool.add_relay("wss://a").await.unwrap();
        let manager = SubscriptionManager::new(pool);
        manager.subscribe("sub1", Filter::new().kind(Kind::TextNote), Arc::new(|_| {})).await.unwrap();

        let t0 = Instant::now();
        manager.heartbeat_tick(t0).await;
        let next = t0 + HEARTBEAT_INTERVAL;
        let outcome = manager.heartbeat_tick(next).await;
        assert_eq!(outcome, HeartbeatOutcome::Healthy);
    }
}
