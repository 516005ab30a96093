//! Pending-request queue (§4.4).
//!
//! Parks NIP-46 requests whose ACL decision is `Undecided`, persisting
//! `allowed = NULL` and registering an in-memory waiter. The waiter
//! resolves on the first of: control-plane decision, or the 60 s TTL.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use sqlx::SqlitePool;
use tokio::sync::{oneshot, Mutex};
use tokio::time::timeout;
use tracing::debug;

use crate::bus::{EventBus, TOPIC_REQUEST_APPROVED, TOPIC_REQUEST_CREATED, TOPIC_REQUEST_DENIED, TOPIC_REQUEST_EXPIRED};
use crate::db::models::{ApprovalType, RequestRow, RequestStatus, TrustLevel};
use crate::db::{keyuser_repo, log_repo, request_repo};
use crate::error::{Result, SignetError};

/// Resolution of a parked request (§9 "exceptions for control flow").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    Approved,
    Denied,
    Expired,
}

/// Extra instructions carried on an `approve` call (§4.4).
#[derive(Debug, Clone, Default)]
pub struct ApproveScope {
    pub always_allow: bool,
    pub trust_level: Option<crate::db::models::TrustLevel>,
}

struct Waiter {
    tx: Option<oneshot::Sender<Resolution>>,
}

/// The queue itself: DB-backed requests plus in-memory wakers.
pub struct PendingQueue {
    pool: SqlitePool,
    bus: Arc<EventBus>,
    waiters: Mutex<HashMap<String, Waiter>>,
}

impl PendingQueue {
    pub fn new(pool: SqlitePool, bus: Arc<EventBus>) -> Self {
        Self { pool, bus, waiters: Mutex::new(HashMap::new()) }
    }

    /// `park`: persist the request and wait for a decision or TTL expiry.
    pub async fn park(&self, id: &str, key_name: &str, remote_pubkey: &str, method: &str, params: &str) -> Result<Resolution> {
        let row = request_repo::insert(&self.pool, id, key_name, remote_pubkey, method, params).await?;
        let (tx, rx) = oneshot::channel();
        {
            let mut guard = self.waiters.lock().await;
            guard.insert(id.to_string(), Waiter { tx: Some(tx) });
        }
        self.bus.publish(TOPIC_REQUEST_CREATED, &RequestSummary::from(&row));

        let ttl = Duration::from_secs(request_repo::PENDING_TTL_SECS as u64);
        let resolution = match timeout(ttl, rx).await {
            Ok(Ok(res)) => res,
            Ok(Err(_)) | Err(_) => {
                // Sender dropped without firing, or the TTL elapsed first.
                // `allowed` is left NULL; status is computed as Expired by
                // request_repo::status_of and the row is swept by cleanup().
                self.waiters.lock().await.remove(id);
                self.bus.publish(TOPIC_REQUEST_EXPIRED, serde_json::json!({"id": id}));
                Resolution::Expired
            }
        };
        Ok(resolution)
    }

    /// `approve`: linearized at the database layer; the loser of a race
    /// observes `AlreadyProcessed`.
    pub async fn approve(&self, id: &str, scope: ApproveScope) -> Result<()> {
        let row = request_repo::decide(&self.pool, id, true).await?;
        self.apply_scope(&row, &scope).await?;
        log_repo::append(&self.pool, "request:approved", Some(&row.method), Some(&row.params), None, Some(ApprovalType::Manual))
            .await?;
        self.bus.publish(TOPIC_REQUEST_APPROVED, &RequestSummary::from(&row));
        self.wake(id, Resolution::Approved).await;
        Ok(())
    }

    pub async fn deny(&self, id: &str) -> Result<()> {
        let row = request_repo::decide(&self.pool, id, false).await?;
        log_repo::append(&self.pool, "request:denied", Some(&row.method), Some(&row.params), None, Some(ApprovalType::Manual)).await?;
        self.bus.publish(TOPIC_REQUEST_DENIED, &RequestSummary::from(&row));
        self.wake(id, Resolution::Denied).await;
        Ok(())
    }

    async fn wake(&self, id: &str, resolution: Resolution) {
        if let Some(mut waiter) = self.waiters.lock().await.remove(id) {
            if let Some(tx) = waiter.tx.take() {
                let _ = tx.send(resolution);
            }
        }
    }

    /// `always_allow` materializes an allow SigningCondition for non-`connect`
    /// methods (§4.4). Approving a parked `connect` request with a trust
    /// level instead grants a KeyUser at that level plus a `connect`
    /// SigningCondition, mirroring `backend::auto_approve_connect` — without
    /// this, a first-contact `connect` that gets parked and later approved
    /// leaves no KeyUser behind and every following request from that remote
    /// falls back to `Undecided` again.
    async fn apply_scope(&self, row: &RequestRow, scope: &ApproveScope) -> Result<()> {
        if row.method == "connect" {
            if let Some(level) = scope.trust_level {
                self.ensure_connect_key_user(row, level).await?;
            }
            return Ok(());
        }

        if !scope.always_allow {
            return Ok(());
        }
        let Some(user) = keyuser_repo::find_active(&self.pool, &row.key_name, &row.remote_pubkey).await? else {
            return Ok(());
        };
        let kind = if row.method == "sign_event" {
            serde_json::from_str::<serde_json::Value>(&row.params)
                .ok()
                .and_then(|v| v.get(0).and_then(|e| e.get("kind")).and_then(|k| k.as_u64()))
                .map(|k| k.to_string())
        } else {
            None
        };
        keyuser_repo::upsert_condition(&self.pool, user.id, &row.method, kind.as_deref(), true).await
    }

    /// Find-or-create the KeyUser a `connect` approval grants (§4.4, §4.6).
    async fn ensure_connect_key_user(&self, row: &RequestRow, level: TrustLevel) -> Result<()> {
        let user = match keyuser_repo::find_active(&self.pool, &row.key_name, &row.remote_pubkey).await? {
            Some(user) => user,
            None => keyuser_repo::create(&self.pool, &row.key_name, &row.remote_pubkey, None, level).await?,
        };
        keyuser_repo::upsert_condition(&self.pool, user.id, "connect", None, true).await
    }

    pub async fn list(&self, status: Option<RequestStatus>, limit: i64, offset: i64) -> Result<Vec<RequestRow>> {
        request_repo::list(&self.pool, status, limit, offset).await
    }

    pub async fn get(&self, id: &str) -> Result<RequestRow> {
        request_repo::find(&self.pool, id).await?.ok_or_else(|| SignetError::NotFound(id.to_string()))
    }

    /// Polling fallback for callers that can't subscribe to the bus:
    /// exponential backoff from 100ms, ×1.5, capped at 2s, overall 65s.
    pub async fn poll_until_decided(&self, id: &str) -> Result<RequestStatus> {
        let mut delay = Duration::from_millis(100);
        let deadline = tokio::time::Instant::now() + Duration::from_secs(65);
        loop {
            let row = self.get(id).await?;
            let status = request_repo::status_of(&row, chrono::Utc::now());
            if status != RequestStatus::Pending {
                return Ok(status);
            }
            if tokio::time::Instant::now() >= deadline {
                return Ok(RequestStatus::Pending);
            }
            tokio::time::sleep(delay).await;
            delay = Duration::from_millis((delay.as_millis() as f64 * 1.5) as u64).min(Duration::from_secs(2));
        }
    }

    /// Background janitor: bulk-delete expired pending rows (§4.4 `cleanup`, §5).
    pub async fn cleanup(&self) -> Result<u64> {
        let removed = request_repo::cleanup_expired(&self.pool).await?;
        if removed > 0 {
            debug!(removed, "pruned expired pending requests");
        }
        Ok(removed)
    }
}

#[derive(serde::Serialize)]
struct RequestSummary {
    id: String,
    key_name: String,
    remote_pubkey: String,
    method: String,
}

impl From<&RequestRow> for RequestSummary {
    fn from(row: &RequestRow) -> Self {
        Self {
            id: row.id.clone(),
            key_name: row.key_name.clone(),
            remote_pubkey: row.remote_pubkey.clone(),
            method: row.method.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::connect_in_memory;

    #[tokio::test]
    async fn approve_wakes_parked_waiter() {
        let pool = connect_in_memory().await.unwrap();
        let bus = Arc::new(EventBus::new());
        let queue = Arc::new(PendingQueue::new(pool, bus));

        let q = queue.clone();
        let handle = tokio::spawn(async move { q.park("req1", "alice", &"b".repeat(64), "sign_event", "[]").await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.approve("req1", ApproveScope::default()).await.unwrap();

        let resolution = handle.await.unwrap().unwrap();
        assert_eq!(resolution, Resolution::Approved);
    }

    #[tokio::test]
    async fn second_approve_is_already_processed() {
        let pool = connect_in_memory().await.unwrap();
        let bus = Arc::new(EventBus::new());
        let queue = PendingQueue::new(pool, bus);
        request_repo::insert(&queue.pool, "req2", "alice", &"b".repeat(64), "ping", "[]").await.unwrap();

        queue.approve("req2", ApproveScope::default()).await.unwrap();
        let err = queue.approve("req2", ApproveScope::default()).await.unwrap_err();
        assert!(matches!(err, SignetError::AlreadyProcessed));
    }

    #[tokio::test]
    async fn always_allow_inserts_signing_condition() {
        let pool = connect_in_memory().await.unwrap();
        let bus = Arc::new(EventBus::new());
        let remote = "c".repeat(64);
        let user = keyuser_repo::create(&pool, "alice", &remote, None, crate::db::models::TrustLevel::Paranoid)
            .await
            .unwrap();
        request_repo::insert(&pool, "req3", "alice", &remote, "sign_event", r#"[{"kind":1}]"#).await.unwrap();

        let queue = PendingQueue::new(pool, bus);
        queue.approve("req3", ApproveScope { always_allow: true, trust_level: None }).await.unwrap();

        let conditions = keyuser_repo::conditions_for(&queue.pool, user.id).await.unwrap();
        assert_eq!(conditions.len(), 1);
        assert_eq!(conditions[0].method, "sign_event");
        assert_eq!(conditions[0].kind.as_deref(), Some("1"));
    }

    #[tokio::test]
    async fn approving_connect_with_trust_level_creates_key_user() {
        let pool = connect_in_memory().await.unwrap();
        let bus = Arc::new(EventBus::new());
        let remote = "d".repeat(64);
        request_repo::insert(&pool, "req4", "alice", &remote, "connect", "[]").await.unwrap();

        let queue = PendingQueue::new(pool, bus);
        queue
            .approve("req4", ApproveScope { always_allow: false, trust_level: Some(crate::db::models::TrustLevel::Full) })
            .await
            .unwrap();

        let user = keyuser_repo::find_active(&queue.pool, "alice", &remote).await.unwrap().unwrap();
        assert_eq!(user.trust_level, crate::db::models::TrustLevel::Full);
        let conditions = keyuser_repo::conditions_for(&queue.pool, user.id).await.unwrap();
        assert_eq!(conditions.len(), 1);
        assert_eq!(conditions[0].method, "connect");
        assert!(conditions[0].allow);
    }

    #[tokio::test]
    async fn approving_connect_without_trust_level_creates_no_key_user() {
        let pool = connect_in_memory().await.unwrap();
        let bus = Arc::new(EventBus::new());
        let remote = "e".repeat(64);
        request_repo::insert(&pool, "req5", "alice", &remote, "connect", "[]").await.unwrap();

        let queue = PendingQueue::new(pool, bus);
        queue.approve("req5", ApproveScope::default()).await.unwrap();

        assert!(keyuser_repo::find_active(&queue.pool, "alice", &remote).await.unwrap().is_none());
    }
}
