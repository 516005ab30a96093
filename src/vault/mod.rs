//! Key vault (§4.2).
//!
//! Owns the on-disk key records and the in-memory active set. Unlocking a
//! key decrypts its secret bytes into memory and invokes the registered
//! activation callback, which is how the vault starts a NIP-46 backend for
//! that key without depending on the backend module directly (§9 "cyclic
//! references between backend and vault").

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use dashmap::DashMap;
use nostr::prelude::*;
use sqlx::SqlitePool;
use tracing::{debug, info, instrument};

use crate::crypto;
use crate::db::key_repo;
use crate::db::keyuser_repo;
use crate::db::models::{KeyRecord, KeyStatus};
use crate::error::{Result, SignetError};

/// Callback invoked when a key transitions to online (created or unlocked).
/// Idempotent: a second call for an already-running key must be a no-op,
/// which is the responsibility of the callback's owner (the backend
/// supervisor), not the vault.
pub type ActivationCallback =
    Arc<dyn Fn(String, Keys) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

/// Public-facing summary returned by vault operations and `list` (§4.2).
#[derive(Debug, Clone, serde::Serialize)]
pub struct KeyInfo {
    pub name: String,
    pub pubkey_hex: String,
    pub npub: String,
    pub status: KeyStatus,
    pub app_count: i64,
}

struct ActiveKey {
    keys: Keys,
}

/// At-rest custody of secp256k1 keys plus the unlock/lock lifecycle.
pub struct KeyVault {
    pool: SqlitePool,
    active: DashMap<String, ActiveKey>,
    on_activate: Mutex<Option<ActivationCallback>>,
}

impl KeyVault {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool, active: DashMap::new(), on_activate: Mutex::new(None) }
    }

    pub fn register_activation_callback(&self, cb: ActivationCallback) {
        *self.on_activate.lock().unwrap() = Some(cb);
    }

    async fn activate(&self, name: &str, keys: Keys) {
        self.active.insert(name.to_string(), ActiveKey { keys: keys.clone() });
        let cb = self.on_activate.lock().unwrap().clone();
        if let Some(cb) = cb {
            cb(name.to_string(), keys).await;
        }
    }

    /// Borrow the live key material for `name`, for the duration of one
    /// sign/encrypt/decrypt call (§5 "lent by reference").
    pub fn signing_keys(&self, name: &str) -> Result<Keys> {
        self.active
            .get(name)
            .map(|entry| entry.keys.clone())
            .ok_or_else(|| SignetError::NotActive)
    }

    pub fn is_active(&self, name: &str) -> bool {
        self.active.contains_key(name)
    }

    async fn app_count(&self, name: &str) -> i64 {
        keyuser_repo::list_for_key(&self.pool, name)
            .await
            .map(|rows| rows.iter().filter(|u| !u.is_revoked()).count() as i64)
            .unwrap_or(0)
    }

    fn to_info(record: &KeyRecord, status: KeyStatus, app_count: i64) -> Result<KeyInfo> {
        let pubkey = PublicKey::from_hex(&record.pubkey_hex)?;
        Ok(KeyInfo {
            name: record.name.clone(),
            pubkey_hex: record.pubkey_hex.clone(),
            npub: pubkey.to_bech32().map_err(|e| SignetError::NostrError(e.to_string()))?,
            status,
            app_count,
        })
    }

    /// `create`: generate or import (nsec/hex), optionally encrypt at rest,
    /// and activate (§4.2).
    #[instrument(skip(self, passphrase, secret))]
    pub async fn create(&self, name: &str, passphrase: Option<&str>, secret: Option<&str>) -> Result<KeyInfo> {
        if name.is_empty() {
            return Err(SignetError::EmptyName);
        }
        if key_repo::find(&self.pool, name).await?.is_some() {
            return Err(SignetError::NameInUse(name.to_string()));
        }

        let keys = match secret {
            Some(s) => Keys::parse(s).map_err(|e| SignetError::InvalidSecretEncoding(e.to_string()))?,
            None => Keys::generate(),
        };
        let secret_bytes = keys.secret_key().to_secret_bytes();

        let record = match passphrase {
            Some(pass) if !pass.is_empty() => {
                let (salt, wrapped) = crypto::aes_gcm_wrap(pass, &secret_bytes)?;
                KeyRecord {
                    name: name.to_string(),
                    pubkey_hex: keys.public_key().to_hex(),
                    encrypted: true,
                    salt: Some(salt),
                    iv: Some(wrapped.iv.to_vec()),
                    ciphertext: Some(wrapped.ciphertext),
                    plain_secret: None,
                    created_at: Utc::now(),
                }
            }
            _ => KeyRecord {
                name: name.to_string(),
                pubkey_hex: keys.public_key().to_hex(),
                encrypted: false,
                salt: None,
                iv: None,
                ciphertext: None,
                plain_secret: Some(secret_bytes.to_vec()),
                created_at: Utc::now(),
            },
        };

        key_repo::insert(&self.pool, &record).await?;
        self.activate(name, keys).await;
        info!(key = name, "key created and activated");

        Self::to_info(&record, KeyStatus::Online, 0)
    }

    /// `unlock`: decrypt the stored material with `passphrase` and activate.
    #[instrument(skip(self, passphrase))]
    pub async fn unlock(&self, name: &str, passphrase: &str) -> Result<KeyInfo> {
        let record = key_repo::find(&self.pool, name).await?.ok_or_else(|| SignetError::NotFound(name.to_string()))?;
        if !record.encrypted {
            return Err(SignetError::NotEncrypted);
        }
        let salt = record.salt.clone().ok_or(SignetError::InvalidCiphertext)?;
        let iv = record.iv.clone().ok_or(SignetError::InvalidCiphertext)?;
        let ciphertext = record.ciphertext.clone().ok_or(SignetError::InvalidCiphertext)?;
        let iv: [u8; crypto::IV_LEN] = iv.try_into().map_err(|_| SignetError::InvalidCiphertext)?;

        let secret_bytes = crypto::aes_gcm_unwrap(passphrase, &salt, &crypto::WrappedSecret { iv, ciphertext })?;
        let secret_key = SecretKey::from_slice(&secret_bytes).map_err(|e| SignetError::NostrError(e.to_string()))?;
        let keys = Keys::new(secret_key);

        self.activate(name, keys).await;
        let app_count = self.app_count(name).await;
        Self::to_info(&record, KeyStatus::Online, app_count)
    }

    /// `lock`: drop the in-memory secret. The backend supervisor is
    /// expected to react to the next `is_active` check and stop polling.
    pub async fn lock(&self, name: &str) -> Result<()> {
        if key_repo::find(&self.pool, name).await?.is_none() {
            return Err(SignetError::NotFound(name.to_string()));
        }
        if self.active.remove(name).is_none() {
            return Err(SignetError::NotActive);
        }
        debug!(key = name, "key locked");
        Ok(())
    }

    /// `list`: ordered by name, each with status and an app-count stat.
    pub async fn list(&self) -> Result<Vec<KeyInfo>> {
        let records = key_repo::list(&self.pool).await?;
        let mut out = Vec::with_capacity(records.len());
        for record in &records {
            let status = if self.is_active(&record.name) {
                KeyStatus::Online
            } else if record.encrypted {
                KeyStatus::Locked
            } else {
                KeyStatus::Offline
            };
            let app_count = self.app_count(&record.name).await;
            out.push(Self::to_info(record, status, app_count)?);
        }
        Ok(out)
    }

    /// `rename`: propagate to dependent rows in one transaction.
    pub async fn rename(&self, old: &str, new: &str) -> Result<()> {
        key_repo::rename(&self.pool, old, new).await?;
        if let Some((_, active)) = self.active.remove(old) {
            self.active.insert(new.to_string(), active);
        }
        Ok(())
    }

    /// `set_passphrase`: wrap the currently-unlocked secret under a new
    /// passphrase. Requires the key to be active (we need the plaintext
    /// bytes) and not already encrypted.
    pub async fn set_passphrase(&self, name: &str, passphrase: &str) -> Result<()> {
        if passphrase.is_empty() {
            return Err(SignetError::EmptyPassphrase);
        }
        let record = key_repo::find(&self.pool, name).await?.ok_or_else(|| SignetError::NotFound(name.to_string()))?;
        if record.encrypted {
            return Err(SignetError::AlreadyEncrypted);
        }
        let keys = self.signing_keys(name)?;
        let secret_bytes = keys.secret_key().to_secret_bytes();
        let (salt, wrapped) = crypto::aes_gcm_wrap(passphrase, &secret_bytes)?;
        key_repo::set_encryption(
            &self.pool,
            name,
            true,
            Some(salt),
            Some(wrapped.iv.to_vec()),
            Some(wrapped.ciphertext),
            None,
        )
        .await
    }

    /// `delete`: requires passphrase proof if the key is encrypted. Returns
    /// the number of revoked KeyUsers.
    pub async fn delete(&self, name: &str, passphrase: Option<&str>) -> Result<u64> {
        let record = key_repo::find(&self.pool, name).await?.ok_or_else(|| SignetError::NotFound(name.to_string()))?;
        if record.encrypted {
            let pass = passphrase.ok_or(SignetError::PassphraseRequired)?;
            let salt = record.salt.clone().ok_or(SignetError::InvalidCiphertext)?;
            let iv: [u8; crypto::IV_LEN] =
                record.iv.clone().ok_or(SignetError::InvalidCiphertext)?.try_into().map_err(|_| SignetError::InvalidCiphertext)?;
            let ciphertext = record.ciphertext.clone().ok_or(SignetError::InvalidCiphertext)?;
            crypto::aes_gcm_unwrap(pass, &salt, &crypto::WrappedSecret { iv, ciphertext })?;
        }

        let revoked = keyuser_repo::revoke_all_for_key(&self.pool, name).await?;
        key_repo::delete(&self.pool, name).await?;
        self.active.remove(name);
        Ok(revoked)
    }

    /// Export the key as a NIP-49 `ncryptsec` bech32 string.
    pub async fn export_ncryptsec(&self, name: &str, password: &str) -> Result<String> {
        let keys = self.signing_keys(name)?;
        let encrypted = EncryptedSecretKey::new(keys.secret_key(), password, 16, KeySecurity::Medium)
            .map_err(|e| SignetError::NostrError(e.to_string()))?;
        encrypted.to_bech32().map_err(|e| SignetError::NostrError(e.to_string()))
    }

    /// Import a NIP-49 `ncryptsec` string, decrypting it with `password` and
    /// storing the result as a new plaintext-activated key.
    pub async fn import_ncryptsec(&self, name: &str, ncryptsec: &str, password: &str) -> Result<KeyInfo> {
        let encrypted = EncryptedSecretKey::from_bech32(ncryptsec)
            .map_err(|e| SignetError::InvalidSecretEncoding(e.to_string()))?;
        let secret_key = encrypted.decrypt(password).map_err(|_| SignetError::InvalidPassphrase)?;
        self.create(name, None, Some(&secret_key.to_secret_hex())).await
    }

    /// Import a key derived from a BIP-39 mnemonic (NIP-06).
    pub async fn import_from_mnemonic(&self, name: &str, mnemonic: &str, passphrase: Option<&str>) -> Result<KeyInfo> {
        let keys = Keys::from_mnemonic(mnemonic, passphrase).map_err(|e| SignetError::InvalidSecretEncoding(e.to_string()))?;
        self.create(name, None, Some(&keys.secret_key().to_secret_hex())).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::connect_in_memory;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn create_then_lock_then_unlock_same_npub() {
        let pool = connect_in_memory().await.unwrap();
        let vault = KeyVault::new(pool);
        let info = vault.create("alice", Some("hunter2"), None).await.unwrap();
        vault.lock("alice").await.unwrap();
        let unlocked = vault.unlock("alice", "hunter2").await.unwrap();
        assert_eq!(info.npub, unlocked.npub);
    }

    #[tokio::test]
    async fn delete_with_wrong_passphrase_fails() {
        let pool = connect_in_memory().await.unwrap();
        let vault = KeyVault::new(pool);
        vault.create("alice", Some("hunter2"), None).await.unwrap();
        let err = vault.delete("alice", Some("wrong")).await.unwrap_err();
        assert!(matches!(err, SignetError::InvalidPassphrase));
    }

    #[tokio::test]
    async fn delete_returns_revoked_count() {
        let pool = connect_in_memory().await.unwrap();
        let vault = KeyVault::new(pool);
        vault.create("alice", None, None).await.unwrap();
        keyuser_repo::create(&vault.pool, "alice", &"c".repeat(64), None, crate::db::models::TrustLevel::Full)
            .await
            .unwrap();
        let revoked = vault.delete("alice", None).await.unwrap();
        assert_eq!(revoked, 1);
    }

    #[tokio::test]
    async fn activation_callback_fires_on_create_and_unlock() {
        let pool = connect_in_memory().await.unwrap();
        let vault = KeyVault::new(pool);
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = calls.clone();
        vault.register_activation_callback(Arc::new(move |_name, _keys| {
            let calls = calls_clone.clone();
            Box::pin(async move {
                calls.fetch_add(1, Ordering::SeqCst);
            })
        }));

        vault.create("alice", Some("hunter2"), None).await.unwrap();
        vault.lock("alice").await.unwrap();
        vault.unlock("alice", "hunter2").await.unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn rename_keeps_active_entry() {
        let pool = connect_in_memory().await.unwrap();
        let vault = KeyVault::new(pool);
        vault.create("alice", None, None).await.unwrap();
        vault.rename("alice", "bob").await.unwrap();
        assert!(vault.is_active("bob"));
        assert!(!vault.is_active("alice"));
    }
}
