//! Row types for the §3 data model.
//!
//! These mirror the `migrations/0001_init.sql` schema directly; the
//! repository modules are the only code that touches `sqlx` queries, so
//! these structs stay plain data.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Trust level governing a [`KeyUser`]'s auto-approval defaults (§4.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrustLevel {
    Paranoid,
    Reasonable,
    Full,
}

impl TrustLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            TrustLevel::Paranoid => "paranoid",
            TrustLevel::Reasonable => "reasonable",
            TrustLevel::Full => "full",
        }
    }
}

impl std::str::FromStr for TrustLevel {
    type Err = crate::error::SignetError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "paranoid" => Ok(TrustLevel::Paranoid),
            "reasonable" => Ok(TrustLevel::Reasonable),
            "full" => Ok(TrustLevel::Full),
            other => Err(crate::error::SignetError::InvalidArgument(format!(
                "unknown trust level: {other}"
            ))),
        }
    }
}

/// A custodied key, as stored in the `keys` table.
#[derive(Debug, Clone)]
pub struct KeyRecord {
    pub name: String,
    pub pubkey_hex: String,
    pub encrypted: bool,
    pub salt: Option<Vec<u8>>,
    pub iv: Option<Vec<u8>>,
    pub ciphertext: Option<Vec<u8>>,
    pub plain_secret: Option<Vec<u8>>,
    pub created_at: DateTime<Utc>,
}

/// Status reported by `KeyVault::list` (§4.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyStatus {
    Online,
    Locked,
    Offline,
}

/// A remote client introduced to a key (§3 `KeyUser`).
#[derive(Debug, Clone)]
pub struct KeyUser {
    pub id: i64,
    pub key_name: String,
    pub remote_pubkey: String,
    pub description: Option<String>,
    pub trust_level: TrustLevel,
    pub created_at: DateTime<Utc>,
    pub last_used_at: Option<DateTime<Utc>>,
    pub revoked_at: Option<DateTime<Utc>>,
    pub suspended_at: Option<DateTime<Utc>>,
    pub suspend_until: Option<DateTime<Utc>>,
}

impl KeyUser {
    pub fn is_revoked(&self) -> bool {
        self.revoked_at.is_some()
    }

    /// True while a suspension is in effect (§4.3 step 1).
    pub fn is_suspended(&self, now: DateTime<Utc>) -> bool {
        match self.suspended_at {
            None => false,
            Some(_) => self.suspend_until.map(|until| until > now).unwrap_or(true),
        }
    }
}

/// Explicit ACL rule attached to a [`KeyUser`] (§3 `SigningCondition`).
#[derive(Debug, Clone)]
pub struct SigningCondition {
    pub id: i64,
    pub key_user_id: i64,
    pub method: String,
    pub kind: Option<String>,
    pub allow: bool,
}

/// One inbound NIP-46 call (§3 `Request`).
#[derive(Debug, Clone)]
pub struct RequestRow {
    pub id: String,
    pub key_name: String,
    pub remote_pubkey: String,
    pub method: String,
    pub params: String,
    pub allowed: Option<bool>,
    pub created_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
}

/// Computed status of a [`RequestRow`], per §4.4's `list`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestStatus {
    Pending,
    Approved,
    Denied,
    Expired,
}

/// One-shot secret bound to a key (§3 `ConnectionToken`).
#[derive(Debug, Clone)]
pub struct ConnectionToken {
    pub id: String,
    pub key_name: String,
    pub policy_id: Option<i64>,
    pub expires_at: DateTime<Utc>,
    pub redeemed_at: Option<DateTime<Utc>>,
    pub key_user_id: Option<i64>,
}

/// Named bundle of [`PolicyRule`]s materialized on token redemption.
#[derive(Debug, Clone)]
pub struct Policy {
    pub id: i64,
    pub name: String,
}

#[derive(Debug, Clone)]
pub struct PolicyRule {
    pub id: i64,
    pub policy_id: i64,
    pub method: String,
    pub kind: Option<String>,
    pub allow: bool,
}

/// Approval provenance recorded on a [`LogEntry`] (§3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalType {
    Manual,
    AutoTrust,
    AutoPermission,
}

impl ApprovalType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ApprovalType::Manual => "manual",
            ApprovalType::AutoTrust => "auto_trust",
            ApprovalType::AutoPermission => "auto_permission",
        }
    }
}

/// Audit record of an approval/denial/registration (§3 `Log entry`).
#[derive(Debug, Clone)]
pub struct LogEntry {
    pub id: i64,
    pub log_type: String,
    pub method: Option<String>,
    pub params: Option<String>,
    pub key_user_id: Option<i64>,
    pub approval_type: Option<String>,
    pub created_at: DateTime<Utc>,
}
