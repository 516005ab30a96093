//! Repository for `connection_tokens`, `policies`, and `policy_rules`
//! (§3 `ConnectionToken`/`Token + Policy + PolicyRule`, §4.8 redemption).

use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};

use crate::error::{Result, SignetError};

use super::models::{ConnectionToken, PolicyRule};

/// Default token lifetime (§3).
pub const DEFAULT_TOKEN_TTL_SECS: i64 = 5 * 60;

fn row_to_token(row: sqlx::sqlite::SqliteRow) -> Result<ConnectionToken> {
    let expires_at: String = row.try_get("expires_at")?;
    let redeemed_at: Option<String> = row.try_get("redeemed_at")?;
    Ok(ConnectionToken {
        id: row.try_get("id")?,
        key_name: row.try_get("key_name")?,
        policy_id: row.try_get("policy_id")?,
        expires_at: DateTime::parse_from_rfc3339(&expires_at)
            .map(|d| d.with_timezone(&Utc))
            .map_err(|e| SignetError::Database(sqlx::Error::Decode(Box::new(e))))?,
        redeemed_at: redeemed_at
            .map(|s| {
                DateTime::parse_from_rfc3339(&s)
                    .map(|d| d.with_timezone(&Utc))
                    .map_err(|e| SignetError::Database(sqlx::Error::Decode(Box::new(e))))
            })
            .transpose()?,
        key_user_id: row.try_get("key_user_id")?,
    })
}

pub async fn create(pool: &SqlitePool, id: &str, key_name: &str, policy_id: Option<i64>, ttl_secs: i64) -> Result<ConnectionToken> {
    let expires_at = Utc::now() + chrono::Duration::seconds(ttl_secs);
    sqlx::query(
        "INSERT INTO connection_tokens (id, key_name, policy_id, expires_at, redeemed_at, key_user_id)
         VALUES (?, ?, ?, ?, NULL, NULL)",
    )
    .bind(id)
    .bind(key_name)
    .bind(policy_id)
    .bind(expires_at.to_rfc3339())
    .execute(pool)
    .await?;

    Ok(ConnectionToken {
        id: id.to_string(),
        key_name: key_name.to_string(),
        policy_id,
        expires_at,
        redeemed_at: None,
        key_user_id: None,
    })
}

pub async fn find(pool: &SqlitePool, id: &str) -> Result<Option<ConnectionToken>> {
    let row = sqlx::query("SELECT * FROM connection_tokens WHERE id = ?").bind(id).fetch_optional(pool).await?;
    row.map(row_to_token).transpose()
}

pub async fn list(pool: &SqlitePool) -> Result<Vec<ConnectionToken>> {
    let rows = sqlx::query("SELECT * FROM connection_tokens ORDER BY expires_at DESC").fetch_all(pool).await?;
    rows.into_iter().map(row_to_token).collect()
}

pub async fn delete(pool: &SqlitePool, id: &str) -> Result<()> {
    let changed = sqlx::query("DELETE FROM connection_tokens WHERE id = ?").bind(id).execute(pool).await?.rows_affected();
    if changed == 0 {
        return Err(SignetError::TokenNotFound);
    }
    Ok(())
}

/// Atomic redemption: `UPDATE ... WHERE redeemed_at IS NULL` must affect
/// exactly one row (§4.6, §4.8, §8 "token uniqueness"). Expired-but-unredeemed
/// tokens are rejected the same as already-redeemed ones.
pub async fn redeem(pool: &SqlitePool, id: &str) -> Result<ConnectionToken> {
    let now = Utc::now();
    let token = find(pool, id).await?.ok_or(SignetError::TokenNotFound)?;
    if token.expires_at < now {
        return Err(SignetError::Expired);
    }

    let changed = sqlx::query("UPDATE connection_tokens SET redeemed_at = ? WHERE id = ? AND redeemed_at IS NULL")
        .bind(now.to_rfc3339())
        .bind(id)
        .execute(pool)
        .await?
        .rows_affected();
    if changed == 0 {
        return Err(SignetError::AlreadyProcessed);
    }
    find(pool, id).await?.ok_or(SignetError::TokenNotFound)
}

/// Clear `redeemed_at` to permit retry after a post-claim failure (§4.6).
pub async fn unredeem(pool: &SqlitePool, id: &str) -> Result<()> {
    sqlx::query("UPDATE connection_tokens SET redeemed_at = NULL WHERE id = ?").bind(id).execute(pool).await?;
    Ok(())
}

pub async fn attach_key_user(pool: &SqlitePool, id: &str, key_user_id: i64) -> Result<()> {
    sqlx::query("UPDATE connection_tokens SET key_user_id = ? WHERE id = ?")
        .bind(key_user_id)
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn cleanup_expired(pool: &SqlitePool) -> Result<u64> {
    Ok(sqlx::query("DELETE FROM connection_tokens WHERE redeemed_at IS NULL AND expires_at < ?")
        .bind(Utc::now().to_rfc3339())
        .execute(pool)
        .await?
        .rows_affected())
}

pub async fn rules_for_policy(pool: &SqlitePool, policy_id: i64) -> Result<Vec<PolicyRule>> {
    let rows = sqlx::query("SELECT * FROM policy_rules WHERE policy_id = ?").bind(policy_id).fetch_all(pool).await?;
    rows.into_iter()
        .map(|row| {
            Ok(PolicyRule {
                id: row.try_get("id")?,
                policy_id: row.try_get("policy_id")?,
                method: row.try_get("method")?,
                kind: row.try_get("kind")?,
                allow: row.try_get::<i64, _>("allow")? != 0,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::connect_in_memory;

    #[tokio::test]
    async fn redeem_succeeds_once() {
        let pool = connect_in_memory().await.unwrap();
        create(&pool, "tok1", "alice", None, DEFAULT_TOKEN_TTL_SECS).await.unwrap();

        let first = redeem(&pool, "tok1").await;
        assert!(first.is_ok());
        let second = redeem(&pool, "tok1").await;
        assert!(matches!(second, Err(SignetError::AlreadyProcessed)));
    }

    #[tokio::test]
    async fn redeem_rejects_expired() {
        let pool = connect_in_memory().await.unwrap();
        create(&pool, "tok2", "alice", None, -1).await.unwrap();
        let err = redeem(&pool, "tok2").await.unwrap_err();
        assert!(matches!(err, SignetError::Expired));
    }

    #[tokio::test]
    async fn concurrent_redeem_has_one_winner() {
        let pool = connect_in_memory().await.unwrap();
        create(&pool, "tok3", "alice", None, DEFAULT_TOKEN_TTL_SECS).await.unwrap();

        let p1 = pool.clone();
        let p2 = pool.clone();
        let (r1, r2) = tokio::join!(redeem(&p1, "tok3"), redeem(&p2, "tok3"));
        let oks = [r1.is_ok(), r2.is_ok()].into_iter().filter(|ok| *ok).count();
        assert_eq!(oks, 1);
    }
}
