//! Connection-token store (§4.8, §3 `ConnectionToken`/`Token + Policy +
//! PolicyRule`).
//!
//! Atomic redemption itself lives in [`crate::db::token_repo`] (it's a
//! single conditional `UPDATE`); this module adds the materialization step
//! — turning a redeemed token's policy rules into SigningConditions on a
//! fresh KeyUser, in one transaction, with rollback-by-unredeem on failure.

use sqlx::SqlitePool;
use tracing::warn;
use uuid::Uuid;

use crate::db::models::{ConnectionToken, TrustLevel};
use crate::db::token_repo;
use crate::error::{Result, SignetError};

pub struct TokenStore {
    pool: SqlitePool,
}

impl TokenStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn create(&self, key_name: &str, policy_id: Option<i64>, ttl_secs: Option<i64>) -> Result<ConnectionToken> {
        let id = Uuid::new_v4().to_string();
        token_repo::create(&self.pool, &id, key_name, policy_id, ttl_secs.unwrap_or(token_repo::DEFAULT_TOKEN_TTL_SECS)).await
    }

    pub async fn list(&self) -> Result<Vec<ConnectionToken>> {
        token_repo::list(&self.pool).await
    }

    pub async fn delete(&self, id: &str) -> Result<()> {
        token_repo::delete(&self.pool, id).await
    }

    /// Redeem `id` for `remote_pubkey`, materializing its policy rules as
    /// SigningConditions on a newly created KeyUser (§4.6, §4.8). On any
    /// failure after the claim, `redeemed_at` is cleared to permit retry.
    pub async fn redeem_and_materialize(&self, id: &str, key_name: &str, remote_pubkey: &str) -> Result<i64> {
        let token = token_repo::redeem(&self.pool, id).await?;
        match self.materialize(&token, key_name, remote_pubkey).await {
            Ok(user_id) => {
                token_repo::attach_key_user(&self.pool, id, user_id).await?;
                Ok(user_id)
            }
            Err(e) => {
                warn!(token = id, error = %e, "token materialization failed, clearing redemption");
                let _ = token_repo::unredeem(&self.pool, id).await;
                Err(e)
            }
        }
    }

    /// KeyUser creation and every rule upsert run in one transaction (§4.6
    /// "in a single transaction"), mirroring `db::key_repo::rename`'s
    /// `pool.begin()`/`tx.commit()` idiom. A failure partway through rolls
    /// back the whole thing instead of leaving a half-provisioned KeyUser;
    /// the caller (`redeem_and_materialize`) additionally clears
    /// `redeemed_at` so the client can retry against a clean token.
    async fn materialize(&self, token: &ConnectionToken, key_name: &str, remote_pubkey: &str) -> Result<i64> {
        let mut tx = self.pool.begin().await?;

        let existing = sqlx::query("SELECT 1 FROM key_users WHERE key_name = ? AND remote_pubkey = ? AND revoked_at IS NULL")
            .bind(key_name)
            .bind(remote_pubkey)
            .fetch_optional(&mut *tx)
            .await?;
        if existing.is_some() {
            return Err(SignetError::Conflict(format!("KeyUser already exists for {remote_pubkey}")));
        }

        let now = chrono::Utc::now().to_rfc3339();
        let user_id = sqlx::query(
            "INSERT INTO key_users (key_name, remote_pubkey, description, trust_level, created_at)
             VALUES (?, ?, NULL, ?, ?)",
        )
        .bind(key_name)
        .bind(remote_pubkey)
        .bind(TrustLevel::Reasonable.as_str())
        .bind(&now)
        .execute(&mut *tx)
        .await?
        .last_insert_rowid();

        if let Some(policy_id) = token.policy_id {
            for rule in token_repo::rules_for_policy(&self.pool, policy_id).await? {
                sqlx::query("DELETE FROM signing_conditions WHERE key_user_id = ? AND method = ? AND kind IS ?")
                    .bind(user_id)
                    .bind(&rule.method)
                    .bind(rule.kind.as_deref())
                    .execute(&mut *tx)
                    .await?;
                sqlx::query("INSERT INTO signing_conditions (key_user_id, method, kind, allow) VALUES (?, ?, ?, ?)")
                    .bind(user_id)
                    .bind(&rule.method)
                    .bind(rule.kind.as_deref())
                    .bind(rule.allow as i64)
                    .execute(&mut *tx)
                    .await?;
            }
        }

        tx.commit().await?;
        Ok(user_id)
    }

    pub async fn cleanup(&self) -> Result<u64> {
        token_repo::cleanup_expired(&self.pool).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::connect_in_memory;

    #[tokio::test]
    async fn redeem_and_materialize_creates_key_user() {
        let pool = connect_in_memory().await.unwrap();
        let store = TokenStore::new(pool);
        let token = store.create("alice", None, None).await.unwrap();
        let user_id = store.redeem_and_materialize(&token.id, "alice", &"f".repeat(64)).await.unwrap();
        assert!(user_id > 0);
    }

    #[tokio::test]
    async fn second_redeem_fails() {
        let pool = connect_in_memory().await.unwrap();
        let store = TokenStore::new(pool);
        let token = store.create("alice", None, None).await.unwrap();
        store.redeem_and_materialize(&token.id, "alice", &"1".repeat(64)).await.unwrap();
        let err = store.redeem_and_materialize(&token.id, "alice", &"2".repeat(64)).await.unwrap_err();
        assert!(matches!(err, crate::error::SignetError::AlreadyProcessed));
    }
}
