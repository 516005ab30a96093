//! Repository for `key_users` and `signing_conditions` (§3, §4.3).

use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};

use crate::error::{Result, SignetError};

use super::models::{KeyUser, SigningCondition, TrustLevel};

fn opt_dt(s: Option<String>) -> Result<Option<DateTime<Utc>>> {
    s.map(|s| {
        DateTime::parse_from_rfc3339(&s)
            .map(|d| d.with_timezone(&Utc))
            .map_err(|e| SignetError::Database(sqlx::Error::Decode(Box::new(e))))
    })
    .transpose()
}

fn row_to_keyuser(row: sqlx::sqlite::SqliteRow) -> Result<KeyUser> {
    let created_at: String = row.try_get("created_at")?;
    let trust_level: String = row.try_get("trust_level")?;
    Ok(KeyUser {
        id: row.try_get("id")?,
        key_name: row.try_get("key_name")?,
        remote_pubkey: row.try_get("remote_pubkey")?,
        description: row.try_get("description")?,
        trust_level: trust_level.parse()?,
        created_at: DateTime::parse_from_rfc3339(&created_at)
            .map(|d| d.with_timezone(&Utc))
            .map_err(|e| SignetError::Database(sqlx::Error::Decode(Box::new(e))))?,
        last_used_at: opt_dt(row.try_get("last_used_at")?)?,
        revoked_at: opt_dt(row.try_get("revoked_at")?)?,
        suspended_at: opt_dt(row.try_get("suspended_at")?)?,
        suspend_until: opt_dt(row.try_get("suspend_until")?)?,
    })
}

/// Load the single non-revoked KeyUser for `(key_name, remote_pubkey)`, if any.
pub async fn find_active(pool: &SqlitePool, key_name: &str, remote_pubkey: &str) -> Result<Option<KeyUser>> {
    let row = sqlx::query(
        "SELECT * FROM key_users WHERE key_name = ? AND remote_pubkey = ? AND revoked_at IS NULL",
    )
    .bind(key_name)
    .bind(remote_pubkey)
    .fetch_optional(pool)
    .await?;
    row.map(row_to_keyuser).transpose()
}

pub async fn find_by_id(pool: &SqlitePool, id: i64) -> Result<Option<KeyUser>> {
    let row = sqlx::query("SELECT * FROM key_users WHERE id = ?").bind(id).fetch_optional(pool).await?;
    row.map(row_to_keyuser).transpose()
}

pub async fn list_for_key(pool: &SqlitePool, key_name: &str) -> Result<Vec<KeyUser>> {
    let rows = sqlx::query("SELECT * FROM key_users WHERE key_name = ? ORDER BY created_at")
        .bind(key_name)
        .fetch_all(pool)
        .await?;
    rows.into_iter().map(row_to_keyuser).collect()
}

/// Insert a brand-new KeyUser. Fails if an active row already exists for
/// this `(key_name, remote_pubkey)` pair (enforced by the unique index, but
/// checked first for a clean error).
pub async fn create(
    pool: &SqlitePool,
    key_name: &str,
    remote_pubkey: &str,
    description: Option<&str>,
    trust_level: TrustLevel,
) -> Result<KeyUser> {
    if find_active(pool, key_name, remote_pubkey).await?.is_some() {
        return Err(SignetError::Conflict(format!("KeyUser already exists for {remote_pubkey}")));
    }
    let now = Utc::now();
    let id = sqlx::query(
        "INSERT INTO key_users (key_name, remote_pubkey, description, trust_level, created_at)
         VALUES (?, ?, ?, ?, ?)",
    )
    .bind(key_name)
    .bind(remote_pubkey)
    .bind(description)
    .bind(trust_level.as_str())
    .bind(now.to_rfc3339())
    .execute(pool)
    .await?
    .last_insert_rowid();

    Ok(KeyUser {
        id,
        key_name: key_name.to_string(),
        remote_pubkey: remote_pubkey.to_string(),
        description: description.map(str::to_string),
        trust_level,
        created_at: now,
        last_used_at: None,
        revoked_at: None,
        suspended_at: None,
        suspend_until: None,
    })
}

/// Best-effort timestamp bump on a `Permitted` decision (§4.3).
pub async fn touch_last_used(pool: &SqlitePool, id: i64) {
    let _ = sqlx::query("UPDATE key_users SET last_used_at = ? WHERE id = ?")
        .bind(Utc::now().to_rfc3339())
        .bind(id)
        .execute(pool)
        .await;
}

pub async fn revoke(pool: &SqlitePool, id: i64) -> Result<()> {
    let changed = sqlx::query("UPDATE key_users SET revoked_at = ? WHERE id = ? AND revoked_at IS NULL")
        .bind(Utc::now().to_rfc3339())
        .bind(id)
        .execute(pool)
        .await?
        .rows_affected();
    if changed == 0 {
        return Err(SignetError::NotFound(id.to_string()));
    }
    Ok(())
}

/// Revoke every active KeyUser for a key, returning the count (§4.2 `delete`).
pub async fn revoke_all_for_key(pool: &SqlitePool, key_name: &str) -> Result<u64> {
    Ok(sqlx::query("UPDATE key_users SET revoked_at = ? WHERE key_name = ? AND revoked_at IS NULL")
        .bind(Utc::now().to_rfc3339())
        .bind(key_name)
        .execute(pool)
        .await?
        .rows_affected())
}

pub async fn suspend(pool: &SqlitePool, id: i64, until: Option<DateTime<Utc>>) -> Result<()> {
    let changed = sqlx::query("UPDATE key_users SET suspended_at = ?, suspend_until = ? WHERE id = ?")
        .bind(Utc::now().to_rfc3339())
        .bind(until.map(|d| d.to_rfc3339()))
        .bind(id)
        .execute(pool)
        .await?
        .rows_affected();
    if changed == 0 {
        return Err(SignetError::NotFound(id.to_string()));
    }
    Ok(())
}

/// Update the free-form description and/or trust level of a KeyUser
/// (§6 `PATCH /apps/:id`).
pub async fn update(pool: &SqlitePool, id: i64, description: Option<&str>, trust_level: Option<TrustLevel>) -> Result<()> {
    let existing = find_by_id(pool, id).await?.ok_or_else(|| SignetError::NotFound(id.to_string()))?;
    let description = description.unwrap_or(existing.description.as_deref().unwrap_or_default());
    let trust_level = trust_level.unwrap_or(existing.trust_level).as_str();
    sqlx::query("UPDATE key_users SET description = ?, trust_level = ? WHERE id = ?")
        .bind(description)
        .bind(trust_level)
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn unsuspend(pool: &SqlitePool, id: i64) -> Result<()> {
    let changed = sqlx::query("UPDATE key_users SET suspended_at = NULL, suspend_until = NULL WHERE id = ?")
        .bind(id)
        .execute(pool)
        .await?
        .rows_affected();
    if changed == 0 {
        return Err(SignetError::NotFound(id.to_string()));
    }
    Ok(())
}

/// Fetch the explicit ACL rows for a KeyUser (§4.3 steps 2-3).
pub async fn conditions_for(pool: &SqlitePool, key_user_id: i64) -> Result<Vec<SigningCondition>> {
    let rows = sqlx::query("SELECT * FROM signing_conditions WHERE key_user_id = ?")
        .bind(key_user_id)
        .fetch_all(pool)
        .await?;
    rows.into_iter()
        .map(|row| {
            Ok(SigningCondition {
                id: row.try_get("id")?,
                key_user_id: row.try_get("key_user_id")?,
                method: row.try_get("method")?,
                kind: row.try_get("kind")?,
                allow: row.try_get::<i64, _>("allow")? != 0,
            })
        })
        .collect()
}

/// Insert an "allow" (or explicit deny) condition, replacing any existing
/// row for the same `(key_user_id, method, kind)` triple.
pub async fn upsert_condition(
    pool: &SqlitePool,
    key_user_id: i64,
    method: &str,
    kind: Option<&str>,
    allow: bool,
) -> Result<()> {
    sqlx::query(
        "DELETE FROM signing_conditions WHERE key_user_id = ? AND method = ? AND kind IS ?",
    )
    .bind(key_user_id)
    .bind(method)
    .bind(kind)
    .execute(pool)
    .await?;
    sqlx::query("INSERT INTO signing_conditions (key_user_id, method, kind, allow) VALUES (?, ?, ?, ?)")
        .bind(key_user_id)
        .bind(method)
        .bind(kind)
        .bind(allow as i64)
        .execute(pool)
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::connect_in_memory;

    #[tokio::test]
    async fn create_then_revoke_then_recreate() {
        let pool = connect_in_memory().await.unwrap();
        let user = create(&pool, "alice", "r".repeat(64).as_str(), None, TrustLevel::Reasonable).await.unwrap();
        assert!(find_active(&pool, "alice", &"r".repeat(64)).await.unwrap().is_some());

        revoke(&pool, user.id).await.unwrap();
        assert!(find_active(&pool, "alice", &"r".repeat(64)).await.unwrap().is_none());

        // a revoked row doesn't block a fresh KeyUser for the same pair
        create(&pool, "alice", "r".repeat(64).as_str(), None, TrustLevel::Paranoid).await.unwrap();
    }

    #[tokio::test]
    async fn upsert_condition_replaces_existing() {
        let pool = connect_in_memory().await.unwrap();
        let user = create(&pool, "alice", "r".repeat(64).as_str(), None, TrustLevel::Paranoid).await.unwrap();
        upsert_condition(&pool, user.id, "sign_event", Some("1"), true).await.unwrap();
        upsert_condition(&pool, user.id, "sign_event", Some("1"), false).await.unwrap();

        let rows = conditions_for(&pool, user.id).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert!(!rows[0].allow);
    }

    #[tokio::test]
    async fn update_changes_description_and_trust_level() {
        let pool = connect_in_memory().await.unwrap();
        let user = create(&pool, "alice", "r".repeat(64).as_str(), Some("old"), TrustLevel::Paranoid).await.unwrap();
        update(&pool, user.id, Some("new description"), Some(TrustLevel::Full)).await.unwrap();
        let reloaded = find_by_id(&pool, user.id).await.unwrap().unwrap();
        assert_eq!(reloaded.description.as_deref(), Some("new description"));
        assert_eq!(reloaded.trust_level, TrustLevel::Full);
    }

    #[tokio::test]
    async fn is_suspended_respects_suspend_until() {
        let pool = connect_in_memory().await.unwrap();
        let user = create(&pool, "alice", "r".repeat(64).as_str(), None, TrustLevel::Full).await.unwrap();
        let past = Utc::now() - chrono::Duration::seconds(10);
        suspend(&pool, user.id, Some(past)).await.unwrap();
        let reloaded = find_by_id(&pool, user.id).await.unwrap().unwrap();
        assert!(!reloaded.is_suspended(Utc::now()));
    }
}
