//! Repository for the `keys` table (§3 Key record, §4.2 vault operations).

use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};

use crate::error::{Result, SignetError};

use super::models::KeyRecord;

fn row_to_record(row: sqlx::sqlite::SqliteRow) -> Result<KeyRecord> {
    let created_at: String = row.try_get("created_at")?;
    Ok(KeyRecord {
        name: row.try_get("name")?,
        pubkey_hex: row.try_get("pubkey_hex")?,
        encrypted: row.try_get::<i64, _>("encrypted")? != 0,
        salt: row.try_get("salt")?,
        iv: row.try_get("iv")?,
        ciphertext: row.try_get("ciphertext")?,
        plain_secret: row.try_get("plain_secret")?,
        created_at: DateTime::parse_from_rfc3339(&created_at)
            .map(|d| d.with_timezone(&Utc))
            .map_err(|e| SignetError::Database(sqlx::Error::Decode(Box::new(e))))?,
    })
}

pub async fn insert(pool: &SqlitePool, record: &KeyRecord) -> Result<()> {
    let existing = sqlx::query("SELECT 1 FROM keys WHERE name = ?")
        .bind(&record.name)
        .fetch_optional(pool)
        .await?;
    if existing.is_some() {
        return Err(SignetError::NameInUse(record.name.clone()));
    }

    sqlx::query(
        "INSERT INTO keys (name, pubkey_hex, encrypted, salt, iv, ciphertext, plain_secret, created_at)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&record.name)
    .bind(&record.pubkey_hex)
    .bind(record.encrypted as i64)
    .bind(&record.salt)
    .bind(&record.iv)
    .bind(&record.ciphertext)
    .bind(&record.plain_secret)
    .bind(record.created_at.to_rfc3339())
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn find(pool: &SqlitePool, name: &str) -> Result<Option<KeyRecord>> {
    let row = sqlx::query("SELECT * FROM keys WHERE name = ?").bind(name).fetch_optional(pool).await?;
    row.map(row_to_record).transpose()
}

pub async fn list(pool: &SqlitePool) -> Result<Vec<KeyRecord>> {
    let rows = sqlx::query("SELECT * FROM keys ORDER BY name").fetch_all(pool).await?;
    rows.into_iter().map(row_to_record).collect()
}

pub async fn rename(pool: &SqlitePool, old: &str, new: &str) -> Result<()> {
    if new.is_empty() {
        return Err(SignetError::EmptyName);
    }
    let existing = sqlx::query("SELECT 1 FROM keys WHERE name = ?").bind(new).fetch_optional(pool).await?;
    if existing.is_some() {
        return Err(SignetError::NameInUse(new.to_string()));
    }

    let mut tx = pool.begin().await?;
    let changed = sqlx::query("UPDATE keys SET name = ? WHERE name = ?")
        .bind(new)
        .bind(old)
        .execute(&mut *tx)
        .await?
        .rows_affected();
    if changed == 0 {
        return Err(SignetError::NotFound(old.to_string()));
    }
    sqlx::query("UPDATE key_users SET key_name = ? WHERE key_name = ?")
        .bind(new)
        .bind(old)
        .execute(&mut *tx)
        .await?;
    sqlx::query("UPDATE requests SET key_name = ? WHERE key_name = ?")
        .bind(new)
        .bind(old)
        .execute(&mut *tx)
        .await?;
    sqlx::query("UPDATE connection_tokens SET key_name = ? WHERE key_name = ?")
        .bind(new)
        .bind(old)
        .execute(&mut *tx)
        .await?;
    tx.commit().await?;
    Ok(())
}

/// Overwrite the encryption envelope (used by `set_passphrase` and re-wrap
/// on passphrase change). Clears `plain_secret` when moving to encrypted.
pub async fn set_encryption(
    pool: &SqlitePool,
    name: &str,
    encrypted: bool,
    salt: Option<Vec<u8>>,
    iv: Option<Vec<u8>>,
    ciphertext: Option<Vec<u8>>,
    plain_secret: Option<Vec<u8>>,
) -> Result<()> {
    let changed = sqlx::query(
        "UPDATE keys SET encrypted = ?, salt = ?, iv = ?, ciphertext = ?, plain_secret = ? WHERE name = ?",
    )
    .bind(encrypted as i64)
    .bind(salt)
    .bind(iv)
    .bind(ciphertext)
    .bind(plain_secret)
    .bind(name)
    .execute(pool)
    .await?
    .rows_affected();
    if changed == 0 {
        return Err(SignetError::NotFound(name.to_string()));
    }
    Ok(())
}

pub async fn delete(pool: &SqlitePool, name: &str) -> Result<()> {
    let changed = sqlx::query("DELETE FROM keys WHERE name = ?").bind(name).execute(pool).await?.rows_affected();
    if changed == 0 {
        return Err(SignetError::NotFound(name.to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::connect_in_memory;

    fn sample(name: &str) -> KeyRecord {
        KeyRecord {
            name: name.to_string(),
            pubkey_hex: "a".repeat(64),
            encrypted: false,
            salt: None,
            iv: None,
            ciphertext: None,
            plain_secret: Some(vec![1; 32]),
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn insert_and_find_roundtrip() {
        let pool = connect_in_memory().await.unwrap();
        insert(&pool, &sample("alice")).await.unwrap();
        let found = find(&pool, "alice").await.unwrap().unwrap();
        assert_eq!(found.pubkey_hex, "a".repeat(64));
    }

    #[tokio::test]
    async fn insert_duplicate_name_fails() {
        let pool = connect_in_memory().await.unwrap();
        insert(&pool, &sample("alice")).await.unwrap();
        let err = insert(&pool, &sample("alice")).await.unwrap_err();
        assert!(matches!(err, SignetError::NameInUse(_)));
    }

    #[tokio::test]
    async fn rename_propagates_to_dependents() {
        let pool = connect_in_memory().await.unwrap();
        insert(&pool, &sample("alice")).await.unwrap();
        sqlx::query(
            "INSERT INTO key_users (key_name, remote_pubkey, trust_level, created_at) VALUES (?, ?, 'full', ?)",
        )
        .bind("alice")
        .bind("b".repeat(64))
        .bind(Utc::now().to_rfc3339())
        .execute(&pool)
        .await
        .unwrap();

        rename(&pool, "alice", "bob").await.unwrap();
        assert!(find(&pool, "alice").await.unwrap().is_none());
        assert!(find(&pool, "bob").await.unwrap().is_some());

        let row: (String,) = sqlx::query_as("SELECT key_name FROM key_users").fetch_one(&pool).await.unwrap();
        assert_eq!(row.0, "bob");
    }
}
