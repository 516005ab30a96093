//! Repository for the `logs` table (§3 `Log entry`, §4.4 audit-on-decision).

use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};

use crate::error::Result;

use super::models::{ApprovalType, LogEntry};

pub async fn append(
    pool: &SqlitePool,
    log_type: &str,
    method: Option<&str>,
    params: Option<&str>,
    key_user_id: Option<i64>,
    approval_type: Option<ApprovalType>,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO logs (type, method, params, key_user_id, approval_type, created_at)
         VALUES (?, ?, ?, ?, ?, ?)",
    )
    .bind(log_type)
    .bind(method)
    .bind(params)
    .bind(key_user_id)
    .bind(approval_type.map(|a| a.as_str()))
    .bind(Utc::now().to_rfc3339())
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn recent(pool: &SqlitePool, limit: i64) -> Result<Vec<LogEntry>> {
    let rows = sqlx::query("SELECT * FROM logs ORDER BY created_at DESC LIMIT ?").bind(limit).fetch_all(pool).await?;
    rows.into_iter()
        .map(|row| {
            let created_at: String = row.try_get("created_at")?;
            Ok(LogEntry {
                id: row.try_get("id")?,
                log_type: row.try_get("type")?,
                method: row.try_get("method")?,
                params: row.try_get("params")?,
                key_user_id: row.try_get("key_user_id")?,
                approval_type: row.try_get("approval_type")?,
                created_at: DateTime::parse_from_rfc3339(&created_at)
                    .map(|d| d.with_timezone(&Utc))
                    .map_err(|e| crate::error::SignetError::Database(sqlx::Error::Decode(Box::new(e))))?,
            })
        })
        .collect()
}

/// Delete log rows older than `older_than` (§3 retention, supplementing the
/// teacher's lack of any log policy).
pub async fn prune(pool: &SqlitePool, older_than: DateTime<Utc>) -> Result<u64> {
    Ok(sqlx::query("DELETE FROM logs WHERE created_at < ?")
        .bind(older_than.to_rfc3339())
        .execute(pool)
        .await?
        .rows_affected())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::connect_in_memory;

    #[tokio::test]
    async fn append_and_read_back() {
        let pool = connect_in_memory().await.unwrap();
        append(&pool, "request:approved", Some("sign_event"), Some("[]"), Some(1), Some(ApprovalType::AutoTrust))
            .await
            .unwrap();
        let rows = recent(&pool, 10).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].approval_type.as_deref(), Some("auto_trust"));
    }

    #[tokio::test]
    async fn prune_removes_old_rows_only() {
        let pool = connect_in_memory().await.unwrap();
        append(&pool, "key:created", None, None, None, None).await.unwrap();
        let cutoff = Utc::now() + chrono::Duration::seconds(1);
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let removed = prune(&pool, cutoff).await.unwrap();
        assert_eq!(removed, 1);
        assert!(recent(&pool, 10).await.unwrap().is_empty());
    }
}
