//! NIP-46 backend (§4.5, §4.6).
//!
//! One instance per active key. Subscribes to kind-24133 events addressed
//! to the key's pubkey (via the subscription manager), verifies/decrypts
//! inbound requests, dispatches through a closed [`Method`] enum (§9
//! "dynamic dispatch on NIP-46 methods"), authorizes non-`connect` calls
//! through the ACL evaluator and pending queue, and publishes NIP-44
//! encrypted responses through the relay pool.

use std::sync::Arc;

use nostr::prelude::*;
use serde_json::Value;
use sqlx::SqlitePool;
use tracing::{debug, error, info, instrument, warn};

use crate::acl::{AclEvaluator, Decision};
use crate::bus::{EventBus, TOPIC_APP_CONNECTED, TOPIC_REQUEST_AUTO_APPROVED};
use crate::crypto;
use crate::db::models::{ApprovalType, TrustLevel};
use crate::db::{keyuser_repo, log_repo};
use crate::error::{Result, SignetError};
use crate::queue::{PendingQueue, Resolution};
use crate::relay::subscription::SubscriptionManager;
use crate::relay::RelayPool;
use crate::tokens::TokenStore;
use crate::vault::KeyVault;

/// Nostr event kind carrying NIP-46 RPC traffic.
pub const NIP46_KIND: Kind = Kind::NostrConnect;

/// Closed set of NIP-46 methods this backend understands (§9).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Method {
    Connect,
    GetPublicKey,
    SignEvent,
    Nip44Encrypt,
    Nip44Decrypt,
    Ping,
    Nip04Deprecated,
    Unknown(String),
}

impl Method {
    fn parse(s: &str) -> Self {
        match s {
            "connect" => Method::Connect,
            "get_public_key" => Method::GetPublicKey,
            "sign_event" => Method::SignEvent,
            "nip44_encrypt" => Method::Nip44Encrypt,
            "nip44_decrypt" => Method::Nip44Decrypt,
            "ping" => Method::Ping,
            s if s.starts_with("nip04_") => Method::Nip04Deprecated,
            other => Method::Unknown(other.to_string()),
        }
    }

    fn as_str(&self) -> &str {
        match self {
            Method::Connect => "connect",
            Method::GetPublicKey => "get_public_key",
            Method::SignEvent => "sign_event",
            Method::Nip44Encrypt => "nip44_encrypt",
            Method::Nip44Decrypt => "nip44_decrypt",
            Method::Ping => "ping",
            Method::Nip04Deprecated => "nip04",
            Method::Unknown(s) => s,
        }
    }
}

struct NipRequest {
    id: String,
    method: Method,
    params: Value,
}

/// Outcome of dispatching one authorized method call.
enum MethodResult {
    Value(Value),
    Error(String),
    /// `connect` with a mismatched secret: silent drop, no response at all.
    SilentDrop,
}

pub struct Nip46Backend {
    key_name: String,
    pool: SqlitePool,
    vault: Arc<KeyVault>,
    acl: Arc<AclEvaluator>,
    queue: Arc<PendingQueue>,
    tokens: Arc<TokenStore>,
    relay_pool: Arc<RelayPool>,
    subscriptions: Arc<SubscriptionManager>,
    bus: Arc<EventBus>,
    admin_secret: Option<String>,
}

impl Nip46Backend {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        key_name: String,
        pool: SqlitePool,
        vault: Arc<KeyVault>,
        acl: Arc<AclEvaluator>,
        queue: Arc<PendingQueue>,
        tokens: Arc<TokenStore>,
        relay_pool: Arc<RelayPool>,
        subscriptions: Arc<SubscriptionManager>,
        bus: Arc<EventBus>,
        admin_secret: Option<String>,
    ) -> Self {
        Self { key_name, pool, vault, acl, queue, tokens, relay_pool, subscriptions, bus, admin_secret }
    }

    /// Subscribe to kind-24133 events addressed to this key (§4.5).
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        let keys = self.vault.signing_keys(&self.key_name)?;
        let pubkey = keys.public_key();
        let filter = Filter::new().kind(NIP46_KIND).pubkey(pubkey).since(Timestamp::now());

        let this = self.clone();
        let sub_id = format!("nip46-{}", self.key_name);
        self.subscriptions
            .subscribe(
                &sub_id,
                filter,
                Arc::new(move |event| {
                    let this = this.clone();
                    tokio::spawn(async move {
                        this.handle_event(event).await;
                    });
                }),
            )
            .await?;
        info!(key = %self.key_name, pubkey = %pubkey.to_hex(), "NIP-46 backend listening");
        Ok(())
    }

    /// `Received → Verified → Decrypted → Authorized|Parked → Executed →
    /// Responded` (§4.5). Bad-signature events are dropped silently at
    /// `Received`; every later failure produces an error response.
    #[instrument(skip(self, event), fields(key = %self.key_name))]
    async fn handle_event(&self, event: Event) {
        if !crypto::verify_event(&event) {
            debug!("dropping event with invalid signature");
            return;
        }

        let keys = match self.vault.signing_keys(&self.key_name) {
            Ok(k) => k,
            Err(_) => {
                debug!("key locked mid-flight, dropping event");
                return;
            }
        };
        let remote = event.pubkey;

        let plaintext = match crypto::nip44_decrypt(keys.secret_key(), &remote, &event.content) {
            Ok(p) => p,
            Err(_) => {
                warn!(remote = %remote.to_hex(), "failed to decrypt NIP-46 request");
                return;
            }
        };

        let request = match Self::parse_request(&plaintext) {
            Ok(r) => r,
            Err(_) => {
                warn!(remote = %remote.to_hex(), "malformed NIP-46 request body");
                return;
            }
        };

        let result = if request.method == Method::Connect {
            self.handle_connect(&remote, &request).await
        } else {
            self.handle_authorized(&remote, &request).await
        };

        match result {
            MethodResult::SilentDrop => {}
            MethodResult::Value(value) => self.respond(&keys, &remote, &request.id, Ok(value)).await,
            MethodResult::Error(msg) => self.respond(&keys, &remote, &request.id, Err(msg)).await,
        }
    }

    fn parse_request(plaintext: &str) -> Result<NipRequest> {
        let value: Value = serde_json::from_str(plaintext)?;
        let id = value.get("id").and_then(|v| v.as_str()).unwrap_or_default().to_string();
        let method = value.get("method").and_then(|v| v.as_str()).unwrap_or_default();
        let params = value.get("params").cloned().unwrap_or(Value::Array(vec![]));
        Ok(NipRequest { id, method: Method::parse(method), params })
    }

    /// §4.6: connect-with-secret / connect-with-token / normal ask flow.
    async fn handle_connect(&self, remote: &PublicKey, request: &NipRequest) -> MethodResult {
        let secret = request.params.get(1).and_then(|v| v.as_str());

        if let Some(secret) = secret {
            if let Some(admin_secret) = &self.admin_secret {
                let matches = crypto::timing_safe_eq(
                    secret.trim().to_lowercase().as_bytes(),
                    admin_secret.trim().to_lowercase().as_bytes(),
                );
                if matches {
                    return self.auto_approve_connect(remote).await;
                }
                // Try it as a one-shot connection token before giving up.
                match self.tokens.redeem_and_materialize(secret, &self.key_name, &remote.to_hex()).await {
                    Ok(_) => {
                        self.bus.publish(TOPIC_APP_CONNECTED, serde_json::json!({"remote": remote.to_hex()}));
                        return MethodResult::Value(Value::String("ack".into()));
                    }
                    Err(SignetError::TokenNotFound) | Err(SignetError::Expired) => {
                        // Not the admin secret and not a valid token: silent drop.
                        return MethodResult::SilentDrop;
                    }
                    Err(SignetError::AlreadyProcessed) => return MethodResult::SilentDrop,
                    Err(e) => {
                        error!(error = %e, "token redemption failed unexpectedly");
                        return MethodResult::SilentDrop;
                    }
                }
            }
        }

        // No secret presented, or no admin secret configured: normal flow.
        self.handle_authorized(remote, request).await
    }

    async fn auto_approve_connect(&self, remote: &PublicKey) -> MethodResult {
        let remote_hex = remote.to_hex();
        let user = match keyuser_repo::find_active(&self.pool, &self.key_name, &remote_hex).await {
            Ok(Some(u)) => u,
            Ok(None) => match keyuser_repo::create(&self.pool, &self.key_name, &remote_hex, None, TrustLevel::Reasonable).await {
                Ok(u) => u,
                Err(e) => return MethodResult::Error(e.to_string()),
            },
            Err(e) => return MethodResult::Error(e.to_string()),
        };
        if let Err(e) = keyuser_repo::upsert_condition(&self.pool, user.id, "connect", None, true).await {
            return MethodResult::Error(e.to_string());
        }
        self.bus.publish(TOPIC_APP_CONNECTED, serde_json::json!({"remote": remote_hex}));
        let _ = log_repo::append(&self.pool, "app:connected", Some("connect"), None, Some(user.id), Some(ApprovalType::AutoTrust)).await;
        MethodResult::Value(Value::String("ack".into()))
    }

    /// Every non-`connect` method (and `connect` with no secret/admin
    /// secret) passes through the ACL evaluator.
    async fn handle_authorized(&self, remote: &PublicKey, request: &NipRequest) -> MethodResult {
        let remote_hex = remote.to_hex();
        let kind = if request.method == Method::SignEvent {
            request.params.get(0).and_then(|v| v.as_str()).and_then(|s| serde_json::from_str::<Value>(s).ok()).and_then(|v| v.get("kind").and_then(|k| k.as_u64())).map(|k| k as u16)
        } else {
            None
        };

        let decision = match self.acl.evaluate(&self.key_name, &remote_hex, request.method.as_str(), kind).await {
            Ok(d) => d,
            Err(e) => return MethodResult::Error(e.to_string()),
        };

        match decision {
            Decision::Denied => MethodResult::Error("Not authorized".into()),
            Decision::Permitted => {
                let _ = log_repo::append(&self.pool, "request:auto_approved", Some(request.method.as_str()), None, None, Some(ApprovalType::AutoPermission)).await;
                self.bus.publish(TOPIC_REQUEST_AUTO_APPROVED, serde_json::json!({"method": request.method.as_str()}));
                self.execute(remote, request).await
            }
            Decision::Undecided => {
                let req_id = uuid::Uuid::new_v4().to_string();
                let params_json = request.params.to_string();
                let resolution = match self.queue.park(&req_id, &self.key_name, &remote_hex, request.method.as_str(), &params_json).await {
                    Ok(r) => r,
                    Err(e) => return MethodResult::Error(e.to_string()),
                };
                match resolution {
                    Resolution::Approved => self.execute(remote, request).await,
                    Resolution::Denied => MethodResult::Error("Not authorized".into()),
                    Resolution::Expired => MethodResult::SilentDrop,
                }
            }
        }
    }

    /// Run the actual method handler once authorization has cleared.
    async fn execute(&self, remote: &PublicKey, request: &NipRequest) -> MethodResult {
        let keys = match self.vault.signing_keys(&self.key_name) {
            Ok(k) => k,
            Err(_) => return MethodResult::Error("key is not active".into()),
        };

        match &request.method {
            Method::Connect | Method::Ping => MethodResult::Value(Value::String(if request.method == Method::Ping { "pong".into() } else { "ack".into() })),
            Method::GetPublicKey => MethodResult::Value(Value::String(keys.public_key().to_hex())),
            Method::SignEvent => self.handle_sign_event(&keys, request),
            Method::Nip44Encrypt => {
                let (peer, plaintext) = match Self::two_string_params(&request.params) {
                    Some(p) => p,
                    None => return MethodResult::Error("invalid params".into()),
                };
                let peer_key = match PublicKey::from_hex(&peer) {
                    Ok(k) => k,
                    Err(e) => return MethodResult::Error(e.to_string()),
                };
                match crypto::nip44_encrypt(keys.secret_key(), &peer_key, &plaintext) {
                    Ok(payload) => MethodResult::Value(Value::String(payload)),
                    Err(e) => MethodResult::Error(e.to_string()),
                }
            }
            Method::Nip44Decrypt => {
                let (peer, payload) = match Self::two_string_params(&request.params) {
                    Some(p) => p,
                    None => return MethodResult::Error("invalid params".into()),
                };
                let peer_key = match PublicKey::from_hex(&peer) {
                    Ok(k) => k,
                    Err(e) => return MethodResult::Error(e.to_string()),
                };
                match crypto::nip44_decrypt(keys.secret_key(), &peer_key, &payload) {
                    Ok(plaintext) => MethodResult::Value(Value::String(plaintext)),
                    Err(e) => MethodResult::Error(e.to_string()),
                }
            }
            Method::Nip04Deprecated => MethodResult::Error("NIP-04 is deprecated, use NIP-44".into()),
            Method::Unknown(m) => MethodResult::Error(format!("unknown method: {m}")),
        }
        .tap_log(remote, request)
    }

    fn handle_sign_event(&self, keys: &Keys, request: &NipRequest) -> MethodResult {
        let Some(event_json) = request.params.get(0).and_then(|v| v.as_str()) else {
            return MethodResult::Error("missing unsigned event".into());
        };
        let unsigned: Value = match serde_json::from_str(event_json) {
            Ok(v) => v,
            Err(e) => return MethodResult::Error(e.to_string()),
        };
        let kind = unsigned.get("kind").and_then(|v| v.as_u64()).unwrap_or(1) as u16;
        let content = unsigned.get("content").and_then(|v| v.as_str()).unwrap_or_default();
        let created_at = unsigned.get("created_at").and_then(|v| v.as_u64()).map(Timestamp::from).unwrap_or_else(Timestamp::now);

        let mut builder = EventBuilder::new(Kind::from(kind), content).custom_created_at(created_at);
        if let Some(tags) = unsigned.get("tags").and_then(|v| v.as_array()) {
            for tag_value in tags {
                if let Some(tag_strs) = tag_value.as_array() {
                    let strs: Vec<String> = tag_strs.iter().filter_map(|v| v.as_str().map(str::to_string)).collect();
                    if let Ok(tag) = Tag::parse(strs) {
                        builder = builder.tag(tag);
                    }
                }
            }
        }

        match crypto::sign_event(keys, builder) {
            Ok(signed) => serde_json::to_value(&signed).map(MethodResult::Value).unwrap_or_else(|e| MethodResult::Error(e.to_string())),
            Err(e) => MethodResult::Error(e.to_string()),
        }
    }

    fn two_string_params(params: &Value) -> Option<(String, String)> {
        let a = params.get(0)?.as_str()?.to_string();
        let b = params.get(1)?.as_str()?.to_string();
        Some((a, b))
    }

    /// Build, NIP-44 encrypt, sign, and publish the response event (§4.5).
    async fn respond(&self, keys: &Keys, remote: &PublicKey, id: &str, result: std::result::Result<Value, String>) {
        let body = match result {
            Ok(value) => serde_json::json!({"id": id, "result": value}),
            Err(msg) => serde_json::json!({"id": id, "result": "error", "error": msg}),
        };
        let encrypted = match crypto::nip44_encrypt(keys.secret_key(), remote, &body.to_string()) {
            Ok(e) => e,
            Err(e) => {
                error!(error = %e, "failed to encrypt NIP-46 response");
                return;
            }
        };
        let builder = EventBuilder::new(NIP46_KIND, encrypted).tag(Tag::public_key(*remote));
        let event = match crypto::sign_event(keys, builder) {
            Ok(e) => e,
            Err(e) => {
                error!(error = %e, "failed to sign NIP-46 response");
                return;
            }
        };
        if let Err(e) = self.relay_pool.publish(&event).await {
            warn!(error = %e, "failed to publish NIP-46 response");
        }
    }
}

trait TapLog {
    fn tap_log(self, remote: &PublicKey, request: &NipRequest) -> Self;
}

impl TapLog for MethodResult {
    fn tap_log(self, remote: &PublicKey, request: &NipRequest) -> Self {
        if let MethodResult::Error(msg) = &self {
            debug!(remote = %remote.to_hex(), method = request.method.as_str(), error = msg, "method handler returned error");
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn method_parse_recognizes_every_contract_verb() {
        assert_eq!(Method::parse("connect"), Method::Connect);
        assert_eq!(Method::parse("get_public_key"), Method::GetPublicKey);
        assert_eq!(Method::parse("sign_event"), Method::SignEvent);
        assert_eq!(Method::parse("nip44_encrypt"), Method::Nip44Encrypt);
        assert_eq!(Method::parse("nip44_decrypt"), Method::Nip44Decrypt);
        assert_eq!(Method::parse("ping"), Method::Ping);
        assert_eq!(Method::parse("nip04_encrypt"), Method::Nip04Deprecated);
        assert_eq!(Method::parse("something_else"), Method::Unknown("something_else".into()));
    }
}
