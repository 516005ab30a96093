//! ACL evaluator (§4.3).
//!
//! Decides `Permitted` / `Denied` / `Undecided` for one inbound NIP-46
//! call. Explicit [`SigningCondition`] rows always win; absent those, the
//! KeyUser's trust level supplies a default. A small LRU+TTL cache sits in
//! front of the KeyUser lookup — the per-method/kind row scan always hits
//! the database, since that table is small and mutated rarely per KeyUser.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use lru::LruCache;
use sqlx::SqlitePool;
use tracing::trace;

use crate::db::keyuser_repo;
use crate::db::models::TrustLevel;
use crate::error::Result;

/// Nostr event kinds considered low-risk under trust level `reasonable`.
pub const SAFE_KINDS: &[u16] = &[1, 6, 7, 16, 1111, 30023, 30024, 1808, 9735, 10000, 10001, 30000, 30001, 24242];

/// Kinds that override [`SAFE_KINDS`] even if present there.
pub const SENSITIVE_KINDS: &[u16] = &[0, 3, 4, 5, 10002, 22242, 24133, 13194, 23194, 23195];

/// Outcome of one ACL evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Permitted,
    Denied,
    Undecided,
}

const CACHE_CAPACITY: usize = 1000;
const CACHE_TTL: Duration = Duration::from_secs(30);

#[derive(Clone)]
struct CachedSummary {
    key_user_id: i64,
    revoked: bool,
    suspended: bool,
    trust_level: TrustLevel,
    has_global_deny: bool,
    cached_at: Instant,
}

/// LRU cache of KeyUser summaries, keyed by `(key_name, remote_pubkey)`.
pub struct AclCache {
    inner: Mutex<LruCache<(String, String), CachedSummary>>,
}

impl AclCache {
    fn new() -> Self {
        Self { inner: Mutex::new(LruCache::new(std::num::NonZeroUsize::new(CACHE_CAPACITY).unwrap())) }
    }

    fn get(&self, key: &(String, String)) -> Option<CachedSummary> {
        let mut guard = self.inner.lock().unwrap();
        match guard.get(key) {
            Some(entry) if entry.cached_at.elapsed() < CACHE_TTL => Some(entry.clone()),
            Some(_) => {
                guard.pop(key);
                None
            }
            None => None,
        }
    }

    fn put(&self, key: (String, String), summary: CachedSummary) {
        self.inner.lock().unwrap().put(key, summary);
    }

    /// Invalidate a single `(key_name, remote_pubkey)` entry, synchronously,
    /// so a revoke is visible on the very next evaluation (§8 "revocation
    /// latency").
    pub fn invalidate(&self, key_name: &str, remote_pubkey: &str) {
        self.inner.lock().unwrap().pop(&(key_name.to_string(), remote_pubkey.to_string()));
    }

    /// Invalidate every cached entry for a key (mass-revoke).
    pub fn invalidate_key(&self, key_name: &str) {
        let mut guard = self.inner.lock().unwrap();
        let stale: Vec<_> = guard
            .iter()
            .filter(|((k, _), _)| k == key_name)
            .map(|(k, _)| k.clone())
            .collect();
        for k in stale {
            guard.pop(&k);
        }
    }
}

impl Default for AclCache {
    fn default() -> Self {
        Self::new()
    }
}

pub struct AclEvaluator {
    pool: SqlitePool,
    cache: AclCache,
}

impl AclEvaluator {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool, cache: AclCache::new() }
    }

    pub fn cache(&self) -> &AclCache {
        &self.cache
    }

    /// Evaluate one request (§4.3). `kind` is `Some(n)` only for
    /// `sign_event`.
    pub async fn evaluate(&self, key_name: &str, remote_pubkey: &str, method: &str, kind: Option<u16>) -> Result<Decision> {
        let cache_key = (key_name.to_string(), remote_pubkey.to_string());
        let summary = match self.cache.get(&cache_key) {
            Some(s) => s,
            None => {
                let Some(user) = keyuser_repo::find_active(&self.pool, key_name, remote_pubkey).await? else {
                    return Ok(Decision::Undecided);
                };
                let conditions = keyuser_repo::conditions_for(&self.pool, user.id).await?;
                let has_global_deny = conditions.iter().any(|c| c.method == "*" && !c.allow);
                let summary = CachedSummary {
                    key_user_id: user.id,
                    revoked: user.is_revoked(),
                    suspended: user.is_suspended(chrono::Utc::now()),
                    trust_level: user.trust_level,
                    has_global_deny,
                    cached_at: Instant::now(),
                };
                self.cache.put(cache_key.clone(), summary.clone());
                summary
            }
        };

        if summary.revoked || summary.suspended {
            return Ok(Decision::Denied);
        }
        if summary.has_global_deny {
            return Ok(Decision::Denied);
        }

        let conditions = keyuser_repo::conditions_for(&self.pool, summary.key_user_id).await?;
        let kind_str = kind.map(|k| k.to_string());
        let matched = conditions.iter().find(|c| {
            if c.method != method {
                return false;
            }
            match &c.kind {
                None => true,
                Some(k) if k == "all" => true,
                Some(k) => kind_str.as_deref() == Some(k.as_str()),
            }
        });
        if let Some(cond) = matched {
            if cond.allow {
                keyuser_repo::touch_last_used(&self.pool, summary.key_user_id).await;
                return Ok(Decision::Permitted);
            }
            return Ok(Decision::Denied);
        }

        let decision = match summary.trust_level {
            TrustLevel::Paranoid => Decision::Undecided,
            TrustLevel::Full => Decision::Permitted,
            TrustLevel::Reasonable => match method {
                "ping" | "connect" => Decision::Permitted,
                "sign_event" => {
                    let k = kind.unwrap_or(u16::MAX);
                    if SAFE_KINDS.contains(&k) && !SENSITIVE_KINDS.contains(&k) {
                        Decision::Permitted
                    } else {
                        Decision::Undecided
                    }
                }
                "encrypt" | "decrypt" | "nip44_encrypt" | "nip44_decrypt" => Decision::Undecided,
                _ => Decision::Undecided,
            },
        };

        if decision == Decision::Permitted {
            trace!(key_user_id = summary.key_user_id, method, "acl permitted, touching last_used_at");
            keyuser_repo::touch_last_used(&self.pool, summary.key_user_id).await;
        }
        Ok(decision)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::connect_in_memory;
    use crate::db::keyuser_repo::create as create_user;

    #[tokio::test]
    async fn unknown_remote_is_undecided() {
        let pool = connect_in_memory().await.unwrap();
        let acl = AclEvaluator::new(pool);
        let decision = acl.evaluate("alice", &"a".repeat(64), "ping", None).await.unwrap();
        assert_eq!(decision, Decision::Undecided);
    }

    #[tokio::test]
    async fn reasonable_trust_matches_spec_table() {
        let pool = connect_in_memory().await.unwrap();
        let remote = "b".repeat(64);
        create_user(&pool, "alice", &remote, None, TrustLevel::Reasonable).await.unwrap();
        let acl = AclEvaluator::new(pool);

        assert_eq!(acl.evaluate("alice", &remote, "ping", None).await.unwrap(), Decision::Permitted);
        assert_eq!(acl.evaluate("alice", &remote, "connect", None).await.unwrap(), Decision::Permitted);
        assert_eq!(acl.evaluate("alice", &remote, "sign_event", Some(1)).await.unwrap(), Decision::Permitted);
        assert_eq!(acl.evaluate("alice", &remote, "sign_event", Some(4)).await.unwrap(), Decision::Undecided);
        assert_eq!(acl.evaluate("alice", &remote, "nip44_encrypt", None).await.unwrap(), Decision::Undecided);
        assert_eq!(acl.evaluate("alice", &remote, "sign_event", Some(9999)).await.unwrap(), Decision::Undecided);
    }

    #[tokio::test]
    async fn full_trust_permits_everything() {
        let pool = connect_in_memory().await.unwrap();
        let remote = "c".repeat(64);
        create_user(&pool, "alice", &remote, None, TrustLevel::Full).await.unwrap();
        let acl = AclEvaluator::new(pool);
        assert_eq!(acl.evaluate("alice", &remote, "nip44_decrypt", None).await.unwrap(), Decision::Permitted);
    }

    #[tokio::test]
    async fn revocation_is_immediately_visible_even_with_warm_cache() {
        let pool = connect_in_memory().await.unwrap();
        let remote = "d".repeat(64);
        let user = create_user(&pool, "alice", &remote, None, TrustLevel::Full).await.unwrap();
        let acl = AclEvaluator::new(pool);

        assert_eq!(acl.evaluate("alice", &remote, "ping", None).await.unwrap(), Decision::Permitted);
        keyuser_repo::revoke(&acl.pool, user.id).await.unwrap();
        acl.cache().invalidate("alice", &remote);

        assert_eq!(acl.evaluate("alice", &remote, "ping", None).await.unwrap(), Decision::Denied);
    }

    #[tokio::test]
    async fn global_deny_condition_blocks_everything() {
        let pool = connect_in_memory().await.unwrap();
        let remote = "e".repeat(64);
        let user = create_user(&pool, "alice", &remote, None, TrustLevel::Full).await.unwrap();
        keyuser_repo::upsert_condition(&pool, user.id, "*", None, false).await.unwrap();
        let acl = AclEvaluator::new(pool);
        assert_eq!(acl.evaluate("alice", &remote, "ping", None).await.unwrap(), Decision::Denied);
    }
}
