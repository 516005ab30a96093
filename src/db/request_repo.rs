//! Repository for the `requests` table (§3 `Request`, §4.4 pending queue).

use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};

use crate::error::{Result, SignetError};

use super::models::{RequestRow, RequestStatus};

/// Pending lifetime (§3, §4.4): after this a row with `allowed IS NULL` is
/// treated as expired.
pub const PENDING_TTL_SECS: i64 = 60;

fn row_to_request(row: sqlx::sqlite::SqliteRow) -> Result<RequestRow> {
    let created_at: String = row.try_get("created_at")?;
    let processed_at: Option<String> = row.try_get("processed_at")?;
    Ok(RequestRow {
        id: row.try_get("id")?,
        key_name: row.try_get("key_name")?,
        remote_pubkey: row.try_get("remote_pubkey")?,
        method: row.try_get("method")?,
        params: row.try_get("params")?,
        allowed: row.try_get::<Option<i64>, _>("allowed")?.map(|v| v != 0),
        created_at: DateTime::parse_from_rfc3339(&created_at)
            .map(|d| d.with_timezone(&Utc))
            .map_err(|e| SignetError::Database(sqlx::Error::Decode(Box::new(e))))?,
        processed_at: processed_at
            .map(|s| {
                DateTime::parse_from_rfc3339(&s)
                    .map(|d| d.with_timezone(&Utc))
                    .map_err(|e| SignetError::Database(sqlx::Error::Decode(Box::new(e))))
            })
            .transpose()?,
    })
}

pub fn status_of(req: &RequestRow, now: DateTime<Utc>) -> RequestStatus {
    match req.allowed {
        Some(true) => RequestStatus::Approved,
        Some(false) => RequestStatus::Denied,
        None if now.signed_duration_since(req.created_at).num_seconds() >= PENDING_TTL_SECS => {
            RequestStatus::Expired
        }
        None => RequestStatus::Pending,
    }
}

pub async fn insert(
    pool: &SqlitePool,
    id: &str,
    key_name: &str,
    remote_pubkey: &str,
    method: &str,
    params: &str,
) -> Result<RequestRow> {
    let now = Utc::now();
    sqlx::query(
        "INSERT INTO requests (id, key_name, remote_pubkey, method, params, allowed, created_at, processed_at)
         VALUES (?, ?, ?, ?, ?, NULL, ?, NULL)",
    )
    .bind(id)
    .bind(key_name)
    .bind(remote_pubkey)
    .bind(method)
    .bind(params)
    .bind(now.to_rfc3339())
    .execute(pool)
    .await?;

    Ok(RequestRow {
        id: id.to_string(),
        key_name: key_name.to_string(),
        remote_pubkey: remote_pubkey.to_string(),
        method: method.to_string(),
        params: params.to_string(),
        allowed: None,
        created_at: now,
        processed_at: None,
    })
}

pub async fn find(pool: &SqlitePool, id: &str) -> Result<Option<RequestRow>> {
    let row = sqlx::query("SELECT * FROM requests WHERE id = ?").bind(id).fetch_optional(pool).await?;
    row.map(row_to_request).transpose()
}

/// Atomically decide a request. Returns `Ok(row)` on success; `Err(AlreadyProcessed)`
/// if another caller decided it first (§5, §8 "mono-decision").
pub async fn decide(pool: &SqlitePool, id: &str, allow: bool) -> Result<RequestRow> {
    let now = Utc::now();
    let changed = sqlx::query("UPDATE requests SET allowed = ?, processed_at = ? WHERE id = ? AND allowed IS NULL")
        .bind(allow as i64)
        .bind(now.to_rfc3339())
        .bind(id)
        .execute(pool)
        .await?
        .rows_affected();
    if changed == 0 {
        let existing = find(pool, id).await?;
        return match existing {
            Some(_) => Err(SignetError::AlreadyProcessed),
            None => Err(SignetError::NotFound(id.to_string())),
        };
    }
    find(pool, id).await?.ok_or_else(|| SignetError::NotFound(id.to_string()))
}

pub async fn list(pool: &SqlitePool, status: Option<RequestStatus>, limit: i64, offset: i64) -> Result<Vec<RequestRow>> {
    let rows = sqlx::query("SELECT * FROM requests ORDER BY created_at DESC LIMIT ? OFFSET ?")
        .bind(limit)
        .bind(offset)
        .fetch_all(pool)
        .await?;
    let now = Utc::now();
    rows.into_iter()
        .map(row_to_request)
        .filter_map(|r| match (r, status) {
            (Ok(row), Some(want)) if status_of(&row, now) == want => Some(Ok(row)),
            (Ok(_), Some(_)) => None,
            (row, None) => Some(row),
        })
        .collect()
}

/// Bulk-delete expired pending rows; audit survives in the log table (§4.4 `cleanup`).
pub async fn cleanup_expired(pool: &SqlitePool) -> Result<u64> {
    let cutoff = Utc::now() - chrono::Duration::seconds(PENDING_TTL_SECS);
    Ok(sqlx::query("DELETE FROM requests WHERE allowed IS NULL AND created_at < ?")
        .bind(cutoff.to_rfc3339())
        .execute(pool)
        .await?
        .rows_affected())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::connect_in_memory;

    #[tokio::test]
    async fn decide_is_mono() {
        let pool = connect_in_memory().await.unwrap();
        insert(&pool, "req1", "alice", &"b".repeat(64), "sign_event", "{}").await.unwrap();

        let first = decide(&pool, "req1", true).await;
        assert!(first.is_ok());
        let second = decide(&pool, "req1", false).await;
        assert!(matches!(second, Err(SignetError::AlreadyProcessed)));
    }

    #[tokio::test]
    async fn status_of_detects_expiry() {
        let pool = connect_in_memory().await.unwrap();
        let row = insert(&pool, "req2", "alice", &"b".repeat(64), "ping", "[]").await.unwrap();
        let future = row.created_at + chrono::Duration::seconds(61);
        assert_eq!(status_of(&row, future), RequestStatus::Expired);
        assert_eq!(status_of(&row, row.created_at), RequestStatus::Pending);
    }

    #[tokio::test]
    async fn cleanup_removes_only_expired_pending() {
        let pool = connect_in_memory().await.unwrap();
        insert(&pool, "req3", "alice", &"b".repeat(64), "ping", "[]").await.unwrap();
        sqlx::query("UPDATE requests SET created_at = ? WHERE id = 'req3'")
            .bind((Utc::now() - chrono::Duration::seconds(120)).to_rfc3339())
            .execute(&pool)
            .await
            .unwrap();
        let removed = cleanup_expired(&pool).await.unwrap();
        assert_eq!(removed, 1);
        assert!(find(&pool, "req3").await.unwrap().is_none());
    }
}
