//! Admin API: configuration, users, tokens, and hash generation.
//!
//! Every endpoint requires admin permission at `/`. The whole surface is
//! absent when the server runs with `--disable-admin`.

use axum::extract::rejection::JsonRejection;
use axum::extract::{Extension, Json, State};
use axum::response::Json as JsonResponse;
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeMap;
use tracing::{info, warn};

use crate::auth::{Identity, Perm, require};
use crate::config::{
    self, AclRule, BCRYPT_MAX_COST, BCRYPT_MIN_COST, Config, Share, TOKEN_BYTES, TOKEN_PREFIX_LEN,
    User,
};
use crate::error::ApiError;
use crate::http::body_json;
use crate::shares::{ShareName, SharedState};

async fn admin_only(
    app: &SharedState,
    share: &str,
    identity: &Identity,
) -> Result<(), ApiError> {
    let view = app.view(share).await;
    require(&view, identity, Perm::Admin, "")
}

/// The admin-editable slice of the configuration. Users and tokens are
/// managed through their own endpoints and never travel in this payload.
#[derive(Serialize, Deserialize, Default)]
#[serde(default, rename_all = "camelCase")]
pub(crate) struct AdminConfigPayload {
    root: String,
    state_dir: String,
    follow_symlinks: bool,
    auth_optional: bool,
    acls: Vec<AclRule>,
    shares: BTreeMap<String, Share>,
}

impl AdminConfigPayload {
    fn from_config(cfg: &Config) -> Self {
        Self {
            root: cfg.root.clone(),
            state_dir: cfg.state_dir.clone(),
            follow_symlinks: cfg.follow_symlinks,
            auth_optional: cfg.auth_optional,
            acls: cfg.acls.clone(),
            shares: cfg.shares.clone(),
        }
    }
}

async fn persist_if_configured(app: &SharedState, cfg: &Config) -> Result<(), ApiError> {
    if let Some(path) = app.config_path_buf() {
        config::persist(path, cfg)
            .await
            .map_err(|err| ApiError::Internal(format!("persist config: {err}")))?;
    }
    Ok(())
}

/// `GET /api/admin/config`.
pub async fn config_get(
    State(app): State<SharedState>,
    Extension(share): Extension<ShareName>,
    Extension(identity): Extension<Identity>,
) -> Result<JsonResponse<serde_json::Value>, ApiError> {
    admin_only(&app, &share.0, &identity).await?;
    let cfg = app.snapshot().await;
    Ok(JsonResponse(json!({
        "config": AdminConfigPayload::from_config(&cfg),
        "persisted": app.persisted(),
        "configPath": app.config_path(),
    })))
}

/// `PUT /api/admin/config`: normalize, persist, swap, and invalidate the
/// per-share caches.
pub async fn config_put(
    State(app): State<SharedState>,
    Extension(share): Extension<ShareName>,
    Extension(identity): Extension<Identity>,
    payload: Result<Json<AdminConfigPayload>, JsonRejection>,
) -> Result<JsonResponse<serde_json::Value>, ApiError> {
    admin_only(&app, &share.0, &identity).await?;
    let payload = body_json(payload)?;

    let mut cfg = (*app.snapshot().await).clone();
    cfg.root = payload.root.trim().to_string();
    cfg.state_dir = payload.state_dir.trim().to_string();
    cfg.follow_symlinks = payload.follow_symlinks;
    cfg.auth_optional = payload.auth_optional;
    cfg.acls = payload.acls;
    cfg.shares = payload.shares;

    let normalized = config::normalize(cfg, app.portable())
        .map_err(|err| ApiError::BadRequest(err.to_string()))?;
    persist_if_configured(&app, &normalized).await?;
    let response = json!({
        "ok": true,
        "config": AdminConfigPayload::from_config(&normalized),
        "persisted": app.persisted(),
        "configPath": app.config_path(),
    });
    app.replace_config(normalized).await;
    info!("configuration replaced");
    Ok(JsonResponse(response))
}

/// `GET /api/admin/state`: usernames and token prefixes only; secrets stay
/// out of responses.
pub async fn state(
    State(app): State<SharedState>,
    Extension(share): Extension<ShareName>,
    Extension(identity): Extension<Identity>,
) -> Result<JsonResponse<serde_json::Value>, ApiError> {
    admin_only(&app, &share.0, &identity).await?;
    let cfg = app.snapshot().await;

    let users: Vec<&String> = cfg.users.keys().collect();
    let mut tokens: Vec<(String, String)> = cfg
        .tokens
        .iter()
        .map(|(token, user)| {
            let prefix = token.chars().take(TOKEN_PREFIX_LEN).collect::<String>();
            (prefix, user.clone())
        })
        .collect();
    tokens.sort_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.cmp(&b.0)));
    let tokens: Vec<serde_json::Value> = tokens
        .into_iter()
        .map(|(prefix, user)| json!({"tokenPrefix": prefix, "user": user}))
        .collect();

    Ok(JsonResponse(json!({
        "users": users,
        "tokens": tokens,
        "persisted": app.persisted(),
        "configPath": app.config_path(),
    })))
}

fn validate_cost(cost: Option<u32>) -> Result<u32, ApiError> {
    let cost = cost.filter(|c| *c != 0).unwrap_or(bcrypt::DEFAULT_COST);
    if !(BCRYPT_MIN_COST..=BCRYPT_MAX_COST).contains(&cost) {
        return Err(ApiError::BadRequest("bad cost".into()));
    }
    Ok(cost)
}

async fn bcrypt_hash_blocking(password: String, cost: u32) -> Result<String, ApiError> {
    tokio::task::spawn_blocking(move || bcrypt::hash(password, cost))
        .await
        .map_err(|err| ApiError::Internal(err.to_string()))?
        .map_err(|err| ApiError::Internal(format!("bcrypt failed: {err}")))
}

#[derive(Deserialize)]
pub(crate) struct UserCreateBody {
    username: String,
    password: String,
    #[serde(default)]
    cost: Option<u32>,
}

/// `POST /api/admin/users`: create or update a user.
pub async fn user_create(
    State(app): State<SharedState>,
    Extension(share): Extension<ShareName>,
    Extension(identity): Extension<Identity>,
    payload: Result<Json<UserCreateBody>, JsonRejection>,
) -> Result<JsonResponse<serde_json::Value>, ApiError> {
    admin_only(&app, &share.0, &identity).await?;
    let body = body_json(payload)?;

    let username = body.username.trim().to_string();
    if username.is_empty() || username.contains('\0') || username.contains(':') {
        return Err(ApiError::BadRequest("bad username".into()));
    }
    if body.password.is_empty() {
        return Err(ApiError::BadRequest("missing password".into()));
    }
    let cost = validate_cost(body.cost)?;
    let hash = bcrypt_hash_blocking(body.password, cost).await?;

    let mut cfg = (*app.snapshot().await).clone();
    cfg.users
        .insert(username.clone(), User { bcrypt: hash.clone() });
    if let Err(err) = persist_if_configured(&app, &cfg).await {
        warn!(username, "user created but config persist failed");
        return Err(err);
    }
    app.swap_config(cfg).await;
    info!(username, "user created");
    Ok(JsonResponse(json!({
        "ok": true,
        "username": username,
        "bcrypt": hash,
        "persisted": app.persisted(),
    })))
}

#[derive(Deserialize)]
pub(crate) struct UserDeleteBody {
    username: String,
}

/// `DELETE /api/admin/users`: remove a user and revoke their tokens.
pub async fn user_delete(
    State(app): State<SharedState>,
    Extension(share): Extension<ShareName>,
    Extension(identity): Extension<Identity>,
    payload: Result<Json<UserDeleteBody>, JsonRejection>,
) -> Result<JsonResponse<serde_json::Value>, ApiError> {
    admin_only(&app, &share.0, &identity).await?;
    let body = body_json(payload)?;
    let username = body.username.trim().to_string();

    let mut cfg = (*app.snapshot().await).clone();
    cfg.users.remove(&username);
    cfg.tokens.retain(|_, user| *user != username);
    persist_if_configured(&app, &cfg).await?;
    app.swap_config(cfg).await;
    info!(username, "user deleted");
    Ok(JsonResponse(json!({"ok": true, "persisted": app.persisted()})))
}

#[derive(Deserialize)]
pub(crate) struct TokenCreateBody {
    username: String,
}

/// `POST /api/admin/tokens`: mint a bearer token for an existing user.
pub async fn token_create(
    State(app): State<SharedState>,
    Extension(share): Extension<ShareName>,
    Extension(identity): Extension<Identity>,
    payload: Result<Json<TokenCreateBody>, JsonRejection>,
) -> Result<JsonResponse<serde_json::Value>, ApiError> {
    admin_only(&app, &share.0, &identity).await?;
    let body = body_json(payload)?;
    let username = body.username.trim().to_string();
    if username.is_empty() {
        return Err(ApiError::BadRequest("missing username".into()));
    }

    let mut cfg = (*app.snapshot().await).clone();
    if !cfg.users.contains_key(&username) {
        return Err(ApiError::BadRequest("unknown user".into()));
    }
    let mut raw = [0u8; TOKEN_BYTES];
    rand::thread_rng().fill_bytes(&mut raw);
    let token = URL_SAFE_NO_PAD.encode(raw);

    cfg.tokens.insert(token.clone(), username.clone());
    persist_if_configured(&app, &cfg).await?;
    app.swap_config(cfg).await;
    info!(username, "token created");
    Ok(JsonResponse(json!({
        "ok": true,
        "token": token,
        "username": username,
        "persisted": app.persisted(),
    })))
}

#[derive(Deserialize)]
pub(crate) struct TokenDeleteBody {
    token: String,
}

/// `DELETE /api/admin/tokens`.
pub async fn token_delete(
    State(app): State<SharedState>,
    Extension(share): Extension<ShareName>,
    Extension(identity): Extension<Identity>,
    payload: Result<Json<TokenDeleteBody>, JsonRejection>,
) -> Result<JsonResponse<serde_json::Value>, ApiError> {
    admin_only(&app, &share.0, &identity).await?;
    let body = body_json(payload)?;
    let token = body.token.trim().to_string();
    if token.is_empty() {
        return Err(ApiError::BadRequest("missing token".into()));
    }

    let mut cfg = (*app.snapshot().await).clone();
    cfg.tokens.remove(&token);
    persist_if_configured(&app, &cfg).await?;
    app.swap_config(cfg).await;
    info!("token revoked");
    Ok(JsonResponse(json!({"ok": true, "persisted": app.persisted()})))
}

#[derive(Deserialize)]
pub(crate) struct BcryptBody {
    password: String,
    #[serde(default)]
    cost: Option<u32>,
}

/// `POST /api/admin/bcrypt`: hash a password without storing anything.
pub async fn bcrypt_hash(
    State(app): State<SharedState>,
    Extension(share): Extension<ShareName>,
    Extension(identity): Extension<Identity>,
    payload: Result<Json<BcryptBody>, JsonRejection>,
) -> Result<JsonResponse<serde_json::Value>, ApiError> {
    admin_only(&app, &share.0, &identity).await?;
    let body = body_json(payload)?;
    if body.password.is_empty() {
        return Err(ApiError::BadRequest("missing password".into()));
    }
    let cost = validate_cost(body.cost)?;
    let hash = bcrypt_hash_blocking(body.password, cost).await?;
    Ok(JsonResponse(json!({"bcrypt": hash})))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cost_validation_bounds() {
        assert_eq!(validate_cost(None).expect("default"), bcrypt::DEFAULT_COST);
        assert_eq!(validate_cost(Some(0)).expect("zero"), bcrypt::DEFAULT_COST);
        assert_eq!(validate_cost(Some(4)).expect("min"), 4);
        assert_eq!(validate_cost(Some(31)).expect("max"), 31);
        assert!(validate_cost(Some(3)).is_err());
        assert!(validate_cost(Some(32)).is_err());
    }

    #[test]
    fn payload_round_trips_config_fields() {
        let mut cfg = Config {
            root: "/srv".into(),
            follow_symlinks: true,
            ..Config::default()
        };
        cfg.users.insert(
            "alice".into(),
            User {
                bcrypt: "$2b$12$x".into(),
            },
        );
        let payload = AdminConfigPayload::from_config(&cfg);
        assert_eq!(payload.root, "/srv");
        assert!(payload.follow_symlinks);
        let as_json = serde_json::to_value(&payload).expect("serialize");
        assert!(as_json.get("users").is_none(), "users must not leak");
    }
}
