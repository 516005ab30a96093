//! HTTP control plane (§6).
//!
//! One axum `Router` exposing the connection/dashboard/keys/apps/requests/
//! tokens surface plus the `/events` SSE stream. Every route except
//! `/csrf-token` sits behind [`auth_and_csrf`]: a bearer check against the
//! configured admin secret, and a double-submit CSRF check on state-changing
//! methods. Neither needs a new crate — `axum-extra`'s cookie jar isn't part
//! of this stack, so both are a few lines of manual header parsing.

pub mod sse;

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, Request, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, patch, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sqlx::SqlitePool;
use tracing::instrument;

use crate::acl::AclEvaluator;
use crate::bus::EventBus;
use crate::crypto;
use crate::db::models::{KeyUser, RequestRow, RequestStatus, TrustLevel};
use crate::db::{keyuser_repo, log_repo, request_repo};
use crate::error::{Result, SignetError};
use crate::queue::{ApproveScope, PendingQueue};
use crate::relay::RelayPool;
use crate::tokens::TokenStore;
use crate::vault::KeyVault;

/// Services shared by every handler. Cloned per-request; everything inside
/// is already `Arc`/pool-cheap to clone (§9 "explicit context value").
#[derive(Clone)]
pub struct AppState {
    pub pool: SqlitePool,
    pub vault: Arc<KeyVault>,
    pub acl: Arc<AclEvaluator>,
    pub queue: Arc<PendingQueue>,
    pub tokens: Arc<TokenStore>,
    pub relay_pool: Arc<RelayPool>,
    pub bus: Arc<EventBus>,
    pub admin_secret: Option<String>,
    pub base_url: String,
}

/// Thin wrapper so `SignetError` can be returned directly from a handler.
pub struct ApiError(SignetError);

impl From<SignetError> for ApiError {
    fn from(err: SignetError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(crate::error::http_status(&self.0)).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (status, Json(json!({"error": self.0.to_string()}))).into_response()
    }
}

type ApiResult<T> = std::result::Result<T, ApiError>;

pub fn router(state: AppState) -> Router {
    let protected = Router::new()
        .route("/connection", get(get_connection))
        .route("/relays", get(get_relays))
        .route("/dashboard", get(get_dashboard))
        .route("/events", get(get_events))
        .route("/keys", get(list_keys).post(create_key))
        .route("/keys/:name", patch(rename_key).delete(delete_key))
        .route("/keys/:name/unlock", post(unlock_key))
        .route("/keys/:name/set-passphrase", post(set_passphrase))
        .route("/apps", get(list_apps))
        .route("/apps/:id", patch(update_app))
        .route("/apps/:id/revoke", post(revoke_app))
        .route("/apps/:id/suspend", post(suspend_app))
        .route("/apps/:id/unsuspend", post(unsuspend_app))
        .route("/requests", get(list_requests))
        .route("/requests/:id", get(get_request).post(decide_request))
        .route("/requests/batch", post(batch_decide))
        .route("/tokens", get(list_tokens).post(create_token))
        .route("/tokens/:id", delete(delete_token))
        .layer(middleware::from_fn_with_state(state.clone(), auth_and_csrf));

    Router::new().route("/csrf-token", get(csrf_token)).merge(protected).with_state(state)
}

/// Bearer-token auth plus double-submit CSRF for state-changing methods.
/// Skipped entirely when no `admin_secret` is configured (local/dev mode).
async fn auth_and_csrf(State(state): State<AppState>, req: Request<axum::body::Body>, next: Next) -> Response {
    let Some(secret) = state.admin_secret.as_deref() else {
        return next.run(req).await;
    };

    let headers = req.headers();
    let token = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));
    match token {
        Some(t) if crypto::timing_safe_eq(t.as_bytes(), secret.as_bytes()) => {}
        _ => return (StatusCode::UNAUTHORIZED, "missing or invalid bearer token").into_response(),
    }

    if req.method() != axum::http::Method::GET {
        let cookie_token = cookie_value(headers, "csrf_token");
        let header_token = headers.get("x-csrf-token").and_then(|v| v.to_str().ok()).map(str::to_string);
        match (cookie_token, header_token) {
            (Some(c), Some(h)) if crypto::timing_safe_eq(c.as_bytes(), h.as_bytes()) => {}
            _ => return (StatusCode::FORBIDDEN, "csrf token mismatch").into_response(),
        }
    }

    next.run(req).await
}

fn cookie_value(headers: &HeaderMap, name: &str) -> Option<String> {
    let raw = headers.get(axum::http::header::COOKIE)?.to_str().ok()?;
    raw.split(';').map(str::trim).find_map(|kv| kv.strip_prefix(&format!("{name}=")).map(str::to_string))
}

/// `GET /csrf-token`: issue a fresh token and set it as a readable cookie so
/// the client can echo it back via `X-CSRF-Token` on the next mutation.
async fn csrf_token() -> impl IntoResponse {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    let token = hex::encode(bytes);
    let mut headers = HeaderMap::new();
    headers.insert(
        axum::http::header::SET_COOKIE,
        format!("csrf_token={token}; Path=/; SameSite=Strict").parse().unwrap(),
    );
    (headers, Json(json!({"csrf_token": token})))
}

#[derive(Deserialize)]
struct KeyQuery {
    key: String,
}

/// `GET /connection`: bunker URI plus the relay list for one key (§6).
#[instrument(skip(state))]
async fn get_connection(State(state): State<AppState>, Query(q): Query<KeyQuery>) -> ApiResult<Json<Value>> {
    let record = crate::db::key_repo::find(&state.pool, &q.key).await?.ok_or_else(|| SignetError::NotFound(q.key.clone()))?;
    let relays = state.relay_pool.relay_urls();
    let mut uri = format!("bunker://{}?", record.pubkey_hex);
    let mut parts: Vec<String> = relays.iter().map(|r| format!("relay={r}")).collect();
    if let Some(secret) = &state.admin_secret {
        parts.push(format!("secret={}", hex::encode(secret.as_bytes())));
    }
    uri.push_str(&parts.join("&"));
    Ok(Json(json!({"bunker_uri": uri, "relays": relays})))
}

/// `GET /relays`: per-relay connection status.
async fn get_relays(State(state): State<AppState>) -> Json<Value> {
    let statuses: Vec<Value> = state
        .relay_pool
        .statuses()
        .into_iter()
        .map(|s| json!({"url": s.url, "state": format!("{:?}", s.state), "attempts": s.attempts}))
        .collect();
    Json(json!({"relays": statuses}))
}

/// `GET /dashboard`: stats, recent activity, and an hourly request histogram.
async fn get_dashboard(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    let keys = state.vault.list().await?;
    let total_apps: i64 = keys.iter().map(|k| k.app_count).sum();
    let recent = log_repo::recent(&state.pool, 50).await?;
    let recent_json: Vec<Value> = recent
        .iter()
        .map(|l| json!({"id": l.id, "type": l.log_type, "method": l.method, "approval_type": l.approval_type, "created_at": l.created_at}))
        .collect();

    let mut histogram = vec![0i64; 24];
    let now = Utc::now();
    for entry in &recent {
        let age_hours = now.signed_duration_since(entry.created_at).num_hours();
        if (0..24).contains(&age_hours) {
            histogram[age_hours as usize] += 1;
        }
    }

    Ok(Json(json!({
        "keys": keys.len(),
        "apps": total_apps,
        "relays": state.relay_pool.statuses().len(),
        "recent_activity": recent_json,
        "hourly_histogram": histogram,
    })))
}

/// `GET /events`: server-sent events over the bus (§4.9).
async fn get_events(State(state): State<AppState>) -> impl IntoResponse {
    sse::stream(state.bus.subscribe())
}

async fn list_keys(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    Ok(Json(json!({"keys": state.vault.list().await?})))
}

#[derive(Deserialize)]
struct CreateKeyBody {
    name: String,
    passphrase: Option<String>,
    secret: Option<String>,
}

async fn create_key(State(state): State<AppState>, Json(body): Json<CreateKeyBody>) -> ApiResult<Json<Value>> {
    let info = state.vault.create(&body.name, body.passphrase.as_deref(), body.secret.as_deref()).await?;
    state.bus.publish(crate::bus::TOPIC_KEY_CREATED, &info);
    Ok(Json(json!(info)))
}

#[derive(Deserialize)]
struct RenameKeyBody {
    new_name: String,
}

async fn rename_key(State(state): State<AppState>, Path(name): Path<String>, Json(body): Json<RenameKeyBody>) -> ApiResult<StatusCode> {
    state.vault.rename(&name, &body.new_name).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Deserialize, Default)]
struct DeleteKeyBody {
    passphrase: Option<String>,
}

async fn delete_key(State(state): State<AppState>, Path(name): Path<String>, body: Option<Json<DeleteKeyBody>>) -> ApiResult<Json<Value>> {
    let passphrase = body.and_then(|b| b.0.passphrase);
    let revoked = state.vault.delete(&name, passphrase.as_deref()).await?;
    state.bus.publish(crate::bus::TOPIC_KEY_DELETED, json!({"name": name, "revoked_apps": revoked}));
    Ok(Json(json!({"revoked_apps": revoked})))
}

#[derive(Deserialize)]
struct PassphraseBody {
    passphrase: String,
}

async fn unlock_key(State(state): State<AppState>, Path(name): Path<String>, Json(body): Json<PassphraseBody>) -> ApiResult<Json<Value>> {
    let info = state.vault.unlock(&name, &body.passphrase).await?;
    state.bus.publish(crate::bus::TOPIC_KEY_UNLOCKED, &info);
    Ok(Json(json!(info)))
}

async fn set_passphrase(State(state): State<AppState>, Path(name): Path<String>, Json(body): Json<PassphraseBody>) -> ApiResult<StatusCode> {
    state.vault.set_passphrase(&name, &body.passphrase).await?;
    Ok(StatusCode::NO_CONTENT)
}

fn keyuser_json(u: &KeyUser) -> Value {
    json!({
        "id": u.id,
        "key_name": u.key_name,
        "remote_pubkey": u.remote_pubkey,
        "description": u.description,
        "trust_level": u.trust_level,
        "created_at": u.created_at,
        "last_used_at": u.last_used_at,
        "revoked": u.is_revoked(),
        "suspended": u.is_suspended(Utc::now()),
    })
}

async fn list_apps(State(state): State<AppState>, Query(q): Query<KeyQuery>) -> ApiResult<Json<Value>> {
    let users = keyuser_repo::list_for_key(&state.pool, &q.key).await?;
    Ok(Json(json!({"apps": users.iter().map(keyuser_json).collect::<Vec<_>>()})))
}

#[derive(Deserialize, Default)]
struct UpdateAppBody {
    description: Option<String>,
    trust_level: Option<TrustLevel>,
}

async fn update_app(State(state): State<AppState>, Path(id): Path<i64>, Json(body): Json<UpdateAppBody>) -> ApiResult<StatusCode> {
    keyuser_repo::update(&state.pool, id, body.description.as_deref(), body.trust_level).await?;
    if let Some(user) = keyuser_repo::find_by_id(&state.pool, id).await? {
        state.acl.cache().invalidate(&user.key_name, &user.remote_pubkey);
    }
    Ok(StatusCode::NO_CONTENT)
}

async fn revoke_app(State(state): State<AppState>, Path(id): Path<i64>) -> ApiResult<StatusCode> {
    keyuser_repo::revoke(&state.pool, id).await?;
    if let Some(user) = keyuser_repo::find_by_id(&state.pool, id).await? {
        state.acl.cache().invalidate(&user.key_name, &user.remote_pubkey);
        state.bus.publish(crate::bus::TOPIC_APP_REVOKED, keyuser_json(&user));
    }
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Deserialize, Default)]
struct SuspendAppBody {
    until: Option<DateTime<Utc>>,
}

async fn suspend_app(State(state): State<AppState>, Path(id): Path<i64>, body: Option<Json<SuspendAppBody>>) -> ApiResult<StatusCode> {
    let until = body.and_then(|b| b.0.until);
    keyuser_repo::suspend(&state.pool, id, until).await?;
    if let Some(user) = keyuser_repo::find_by_id(&state.pool, id).await? {
        state.acl.cache().invalidate(&user.key_name, &user.remote_pubkey);
    }
    Ok(StatusCode::NO_CONTENT)
}

async fn unsuspend_app(State(state): State<AppState>, Path(id): Path<i64>) -> ApiResult<StatusCode> {
    keyuser_repo::unsuspend(&state.pool, id).await?;
    if let Some(user) = keyuser_repo::find_by_id(&state.pool, id).await? {
        state.acl.cache().invalidate(&user.key_name, &user.remote_pubkey);
    }
    Ok(StatusCode::NO_CONTENT)
}

fn request_json(row: &RequestRow) -> Value {
    let status = request_repo::status_of(row, Utc::now());
    json!({
        "id": row.id,
        "key_name": row.key_name,
        "remote_pubkey": row.remote_pubkey,
        "method": row.method,
        "params": serde_json::from_str::<Value>(&row.params).unwrap_or(Value::Null),
        "status": status,
        "created_at": row.created_at,
        "processed_at": row.processed_at,
    })
}

#[derive(Deserialize)]
struct ListRequestsQuery {
    status: Option<RequestStatus>,
    limit: Option<i64>,
    offset: Option<i64>,
}

async fn list_requests(State(state): State<AppState>, Query(q): Query<ListRequestsQuery>) -> ApiResult<Json<Value>> {
    let rows = state.queue.list(q.status, q.limit.unwrap_or(50), q.offset.unwrap_or(0)).await?;
    Ok(Json(json!({"requests": rows.iter().map(request_json).collect::<Vec<_>>()})))
}

async fn get_request(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<Json<Value>> {
    let row = state.queue.get(&id).await?;
    Ok(Json(request_json(&row)))
}

#[derive(Deserialize)]
struct DecideBody {
    allow: bool,
    #[serde(default)]
    always_allow: bool,
    trust_level: Option<TrustLevel>,
}

async fn decide_one(state: &AppState, id: &str, body: &DecideBody) -> Result<()> {
    if body.allow {
        state.queue.approve(id, ApproveScope { always_allow: body.always_allow, trust_level: body.trust_level }).await?;
        if let Some(level) = body.trust_level {
            let row = state.queue.get(id).await?;
            if let Some(user) = keyuser_repo::find_active(&state.pool, &row.key_name, &row.remote_pubkey).await? {
                keyuser_repo::update(&state.pool, user.id, None, Some(level)).await?;
                state.acl.cache().invalidate(&row.key_name, &row.remote_pubkey);
            }
        }
    } else {
        state.queue.deny(id).await?;
    }
    Ok(())
}

async fn decide_request(State(state): State<AppState>, Path(id): Path<String>, Json(body): Json<DecideBody>) -> ApiResult<StatusCode> {
    decide_one(&state, &id, &body).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Deserialize)]
struct BatchDecideBody {
    id: String,
    allow: bool,
    #[serde(default)]
    always_allow: bool,
    trust_level: Option<TrustLevel>,
}

async fn batch_decide(State(state): State<AppState>, Json(items): Json<Vec<BatchDecideBody>>) -> ApiResult<Json<Value>> {
    let mut results = Vec::with_capacity(items.len());
    for item in &items {
        let body = DecideBody { allow: item.allow, always_allow: item.always_allow, trust_level: item.trust_level };
        let outcome = decide_one(&state, &item.id, &body).await;
        results.push(json!({"id": item.id, "ok": outcome.is_ok(), "error": outcome.err().map(|e| e.to_string())}));
    }
    Ok(Json(json!({"results": results})))
}

#[derive(Deserialize)]
struct CreateTokenBody {
    key_name: String,
    policy_id: Option<i64>,
    ttl_secs: Option<i64>,
}

async fn create_token(State(state): State<AppState>, Json(body): Json<CreateTokenBody>) -> ApiResult<Json<Value>> {
    let token = state.tokens.create(&body.key_name, body.policy_id, body.ttl_secs).await?;
    Ok(Json(json!({
        "id": token.id,
        "key_name": token.key_name,
        "policy_id": token.policy_id,
        "expires_at": token.expires_at,
    })))
}

async fn list_tokens(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    let tokens = state.tokens.list().await?;
    let out: Vec<Value> = tokens
        .iter()
        .map(|t| json!({"id": t.id, "key_name": t.key_name, "policy_id": t.policy_id, "expires_at": t.expires_at, "redeemed_at": t.redeemed_at}))
        .collect();
    Ok(Json(json!({"tokens": out})))
}

async fn delete_token(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<StatusCode> {
    state.tokens.delete(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cookie_value_parses_among_siblings() {
        let mut headers = HeaderMap::new();
        headers.insert(axum::http::header::COOKIE, "a=1; csrf_token=abc123; b=2".parse().unwrap());
        assert_eq!(cookie_value(&headers, "csrf_token"), Some("abc123".to_string()));
        assert_eq!(cookie_value(&headers, "missing"), None);
    }
}
