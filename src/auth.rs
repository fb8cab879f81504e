//! Authentication and path-scoped authorization.
//!
//! The middleware turns the `Authorization` header into an [`Identity`]
//! request extension (empty string = anonymous). Handlers then ask
//! [`require`] whether that identity holds a permission on a cleaned path;
//! denial surfaces as a Basic challenge for anonymous optional-auth clients
//! and as `403` otherwise.

use axum::extract::{Extension, Request, State};
use axum::http::header;
use axum::middleware::Next;
use axum::response::{IntoResponse, Redirect, Response};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;

use crate::error::ApiError;
use crate::shares::{ShareName, SharedState, ShareView, share_name};

/// The authenticated username, or `""` for anonymous.
#[derive(Clone, Debug, Default)]
pub struct Identity(pub String);

impl Identity {
    pub fn is_anonymous(&self) -> bool {
        self.0.is_empty()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Perm {
    Read,
    Write,
    Admin,
}

pub async fn authenticate(
    State(app): State<SharedState>,
    mut req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let view = app.view(&share_name(&req)).await;
    if !view.has_auth() {
        req.extensions_mut().insert(Identity::default());
        return Ok(next.run(req).await);
    }

    let authz = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .unwrap_or("")
        .trim()
        .to_string();

    if view.auth_optional() && authz.is_empty() {
        req.extensions_mut().insert(Identity::default());
        return Ok(next.run(req).await);
    }

    if let Some(token) = authz.strip_prefix("Bearer ") {
        let token = token.trim();
        if token.is_empty() {
            return Err(ApiError::Unauthorized);
        }
        let Some(user) = view.tokens().get(token).filter(|u| !u.is_empty()) else {
            return Err(ApiError::Unauthorized);
        };
        req.extensions_mut().insert(Identity(user.clone()));
        return Ok(next.run(req).await);
    }

    let Some((user, pass)) = parse_basic(&authz) else {
        return Err(ApiError::Unauthorized);
    };
    let Some(account) = view.users().get(&user) else {
        return Err(ApiError::Unauthorized);
    };
    let hash = account.bcrypt.clone();
    let verified = tokio::task::spawn_blocking(move || bcrypt::verify(&pass, &hash))
        .await
        .map_err(|err| ApiError::Internal(err.to_string()))?
        .unwrap_or(false);
    if !verified {
        return Err(ApiError::Unauthorized);
    }
    req.extensions_mut().insert(Identity(user));
    Ok(next.run(req).await)
}

fn parse_basic(value: &str) -> Option<(String, String)> {
    let raw = value.strip_prefix("Basic ")?;
    let decoded = BASE64_STANDARD.decode(raw.trim()).ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (user, pass) = decoded.split_once(':')?;
    if user.is_empty() || user.contains('\0') || pass.contains('\0') {
        return None;
    }
    Some((user.to_string(), pass.to_string()))
}

/// First-match ACL evaluation over a clean absolute path.
pub fn allowed(view: &ShareView, user: &str, clean_path: &str, perm: Perm) -> bool {
    let clean_path = if clean_path.is_empty() { "/" } else { clean_path };
    if !view.has_auth() {
        return true;
    }

    for rule in view.acls() {
        let rule_path = normalized_rule_path(&rule.path);
        let is_match = rule_path == "/"
            || clean_path == rule_path
            || clean_path.starts_with(&format!("{rule_path}/"));
        if !is_match {
            continue;
        }
        return match perm {
            Perm::Read => contains_user(&rule.read, user),
            Perm::Write => !user.is_empty() && contains_user(&rule.write, user),
            Perm::Admin => !user.is_empty() && contains_user(&rule.admin, user),
        };
    }

    // Auth is configured but no rule matched: authenticated users may read,
    // nobody writes.
    match perm {
        Perm::Read => !user.is_empty(),
        Perm::Write | Perm::Admin => false,
    }
}

fn normalized_rule_path(path: &str) -> String {
    let path = path.trim();
    if path.is_empty() || path == "/" {
        return "/".to_string();
    }
    let path = path.trim_end_matches('/');
    if path.starts_with('/') {
        path.to_string()
    } else {
        format!("/{path}")
    }
}

fn contains_user(list: &[String], user: &str) -> bool {
    list.iter()
        .map(|name| name.trim())
        .filter(|name| !name.is_empty())
        .any(|name| name == "*" || constant_time_eq(name.as_bytes(), user.as_bytes()))
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// `true` when a denial should be answered with a Basic challenge instead
/// of `403`: auth is configured, anonymous access is allowed, and this
/// request is anonymous.
pub fn should_challenge(view: &ShareView, identity: &Identity) -> bool {
    view.has_auth() && view.auth_optional() && identity.is_anonymous()
}

/// Check `perm` on `/<rel>`, mapping denial to the right status.
pub fn require(
    view: &ShareView,
    identity: &Identity,
    perm: Perm,
    rel: &str,
) -> Result<(), ApiError> {
    let clean = format!("/{rel}");
    if allowed(view, &identity.0, &clean, perm) {
        return Ok(());
    }
    if should_challenge(view, identity) {
        Err(ApiError::Unauthorized)
    } else {
        Err(ApiError::Forbidden("forbidden".into()))
    }
}

/// `GET /login`: trigger the browser's Basic prompt when auth is
/// configured, otherwise bounce home.
pub async fn login(
    State(app): State<SharedState>,
    Extension(share): Extension<ShareName>,
    Extension(identity): Extension<Identity>,
) -> Response {
    let view = app.view(&share.0).await;
    if !view.has_auth() || !identity.is_anonymous() {
        return Redirect::to("/").into_response();
    }
    ApiError::Unauthorized.into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AclRule, Config, User};
    use crate::shares::AppState;

    fn rule(path: &str, read: &[&str], write: &[&str], admin: &[&str]) -> AclRule {
        AclRule {
            path: path.into(),
            read: read.iter().map(|s| s.to_string()).collect(),
            write: write.iter().map(|s| s.to_string()).collect(),
            admin: admin.iter().map(|s| s.to_string()).collect(),
        }
    }

    async fn view_with(acls: Vec<AclRule>, auth_optional: bool) -> ShareView {
        let mut cfg = Config {
            root: "/srv".into(),
            auth_optional,
            acls,
            ..Config::default()
        };
        cfg.users.insert(
            "alice".into(),
            User {
                bcrypt: "$2b$12$x".into(),
            },
        );
        AppState::new(cfg, None, false).view("").await
    }

    #[tokio::test]
    async fn no_auth_allows_everything() {
        let cfg = Config {
            root: "/srv".into(),
            ..Config::default()
        };
        let view = AppState::new(cfg, None, false).view("").await;
        assert!(allowed(&view, "", "/anything", Perm::Admin));
    }

    #[tokio::test]
    async fn first_match_wins_even_over_later_specific_rules() {
        let view = view_with(
            vec![
                rule("/", &["alice"], &[], &[]),
                rule("/public", &["*"], &[], &[]),
            ],
            true,
        )
        .await;
        // "/" matches first; the later "/public" rule must never be reached.
        assert!(!allowed(&view, "", "/public/photo.jpg", Perm::Read));
        assert!(allowed(&view, "alice", "/public/photo.jpg", Perm::Read));
    }

    #[tokio::test]
    async fn wildcard_read_allows_anonymous() {
        let view = view_with(
            vec![
                rule("/public", &["*"], &[], &[]),
                rule("/", &["alice"], &[], &[]),
            ],
            true,
        )
        .await;
        assert!(allowed(&view, "", "/public", Perm::Read));
        assert!(allowed(&view, "", "/public/nested/file", Perm::Read));
        assert!(!allowed(&view, "", "/other", Perm::Read));
    }

    #[tokio::test]
    async fn wildcard_write_still_denies_anonymous() {
        let view = view_with(vec![rule("/", &["*"], &["*"], &["*"])], true).await;
        assert!(!allowed(&view, "", "/x", Perm::Write));
        assert!(!allowed(&view, "", "/x", Perm::Admin));
        assert!(allowed(&view, "alice", "/x", Perm::Write));
    }

    #[tokio::test]
    async fn prefix_matches_on_segment_boundaries_only() {
        let view = view_with(
            vec![
                rule("/photos", &["alice"], &[], &[]),
                rule("/", &[], &[], &[]),
            ],
            false,
        )
        .await;
        assert!(allowed(&view, "alice", "/photos/a.jpg", Perm::Read));
        // "/photosX" must fall through to the "/" rule, which denies.
        assert!(!allowed(&view, "alice", "/photosX", Perm::Read));
    }

    #[tokio::test]
    async fn default_policy_reads_for_authenticated_only() {
        let view = view_with(vec![], false).await;
        assert!(allowed(&view, "alice", "/x", Perm::Read));
        assert!(!allowed(&view, "", "/x", Perm::Read));
        assert!(!allowed(&view, "alice", "/x", Perm::Write));
        assert!(!allowed(&view, "alice", "/x", Perm::Admin));
    }

    #[tokio::test]
    async fn require_challenges_anonymous_in_optional_mode() {
        let view = view_with(vec![rule("/", &["alice"], &[], &[])], true).await;
        let err = require(&view, &Identity::default(), Perm::Read, "secret").unwrap_err();
        assert!(matches!(err, ApiError::Unauthorized));

        let err = require(&view, &Identity("bob".into()), Perm::Read, "secret").unwrap_err();
        assert!(matches!(err, ApiError::Forbidden(_)));
    }

    #[test]
    fn parse_basic_rejects_malformed_credentials() {
        let encode = |s: &str| format!("Basic {}", BASE64_STANDARD.encode(s));
        assert!(parse_basic(&encode("alice:secret")).is_some());
        assert!(parse_basic(&encode("nopassword")).is_none());
        assert!(parse_basic(&encode(":secret")).is_none());
        assert!(parse_basic(&encode("alice:se\0cret")).is_none());
        assert!(parse_basic("Basic !!!not-base64!!!").is_none());
    }
}
