//! Share dispatch and per-share resources.
//!
//! The dispatcher rewrites `/s/<name>/…` to `/…` and tags the request with
//! the share name; handlers then read a [`ShareView`], the merge of the
//! global config with that share's overrides. Dedup stores, upload
//! managers, and WebDAV lock systems are built lazily per share and
//! invalidated together whenever the configuration is replaced.

use axum::extract::{Request, State};
use axum::http::Uri;
use axum::http::uri::PathAndQuery;
use axum::middleware::Next;
use axum::response::{IntoResponse, Redirect, Response};
use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};

use crate::config::{AclRule, Config, DEFAULT_STATE_DIR_NAME, Share, User};
use crate::dedup::DedupStore;
use crate::error::ApiError;
use crate::thumb::ThumbPipeline;
use crate::upload::UploadManager;
use crate::webdav_lock::ShareLockSystem;

/// Name of the share a request was dispatched to; empty for the default
/// share.
#[derive(Clone, Debug, Default)]
pub struct ShareName(pub String);

pub type SharedState = Arc<AppState>;

pub struct AppState {
    config: RwLock<Arc<Config>>,
    config_path: Option<PathBuf>,
    portable: bool,
    caches: Mutex<ShareCaches>,
    pub thumbs: ThumbPipeline,
}

#[derive(Default)]
struct ShareCaches {
    dedup: HashMap<String, Arc<DedupStore>>,
    uploads: HashMap<String, Arc<UploadManager>>,
    dav_locks: HashMap<String, ShareLockSystem>,
}

impl AppState {
    pub fn new(cfg: Config, config_path: Option<PathBuf>, portable: bool) -> Self {
        Self {
            config: RwLock::new(Arc::new(cfg)),
            config_path,
            portable,
            caches: Mutex::new(ShareCaches::default()),
            thumbs: ThumbPipeline::new(),
        }
    }

    pub async fn snapshot(&self) -> Arc<Config> {
        self.config.read().await.clone()
    }

    pub async fn view(&self, share: &str) -> ShareView {
        ShareView {
            cfg: self.snapshot().await,
            name: share.to_string(),
        }
    }

    /// Swap the configuration without touching per-share resources. Only
    /// valid for mutations that cannot move share roots (users, tokens).
    pub async fn swap_config(&self, cfg: Config) {
        *self.config.write().await = Arc::new(cfg);
    }

    /// Swap in a new configuration and drop every per-share resource so the
    /// next request rebuilds them against the new roots.
    pub async fn replace_config(&self, cfg: Config) {
        *self.config.write().await = Arc::new(cfg);
        let mut caches = self.caches.lock().await;
        caches.dedup.clear();
        caches.uploads.clear();
        caches.dav_locks.clear();
    }

    pub async fn share_deps(
        &self,
        view: &ShareView,
    ) -> io::Result<(Arc<DedupStore>, Arc<UploadManager>)> {
        let key = view.name.clone();
        let mut caches = self.caches.lock().await;
        if let (Some(store), Some(uploads)) = (caches.dedup.get(&key), caches.uploads.get(&key)) {
            return Ok((store.clone(), uploads.clone()));
        }
        let store = Arc::new(DedupStore::open(&view.state_dir()).await?);
        let uploads = Arc::new(
            UploadManager::open(
                view.root_path(),
                &view.state_dir(),
                store.clone(),
                view.follow_symlinks(),
            )
            .await?,
        );
        caches.dedup.insert(key.clone(), store.clone());
        caches.uploads.insert(key, uploads.clone());
        Ok((store, uploads))
    }

    pub async fn dav_locks(&self, share: &str) -> ShareLockSystem {
        let mut caches = self.caches.lock().await;
        caches
            .dav_locks
            .entry(share.to_string())
            .or_insert_with(ShareLockSystem::new)
            .clone()
    }

    pub fn persisted(&self) -> bool {
        self.config_path.is_some()
    }

    pub fn config_path(&self) -> String {
        self.config_path
            .as_ref()
            .map(|p| p.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    pub fn config_path_buf(&self) -> Option<&PathBuf> {
        self.config_path.as_ref()
    }

    pub fn portable(&self) -> bool {
        self.portable
    }
}

/// Effective configuration for one request: the global document with the
/// dispatched share's overrides applied.
#[derive(Clone)]
pub struct ShareView {
    cfg: Arc<Config>,
    name: String,
}

impl ShareView {
    fn share(&self) -> Option<&Share> {
        if self.name.is_empty() {
            None
        } else {
            self.cfg.shares.get(&self.name)
        }
    }

    pub fn root(&self) -> &str {
        match self.share() {
            Some(share) => &share.root,
            None => &self.cfg.root,
        }
    }

    pub fn root_path(&self) -> PathBuf {
        PathBuf::from(self.root())
    }

    pub fn state_dir(&self) -> PathBuf {
        let (root, configured) = match self.share() {
            Some(share) => (share.root.as_str(), share.state_dir.as_str()),
            None => (self.cfg.root.as_str(), self.cfg.state_dir.as_str()),
        };
        if !configured.is_empty() {
            PathBuf::from(configured)
        } else {
            Path::new(root).join(DEFAULT_STATE_DIR_NAME)
        }
    }

    pub fn follow_symlinks(&self) -> bool {
        self.share()
            .and_then(|share| share.follow_symlinks)
            .unwrap_or(self.cfg.follow_symlinks)
    }

    pub fn acls(&self) -> &[AclRule] {
        match self.share() {
            Some(share) if !share.acls.is_empty() => &share.acls,
            _ => &self.cfg.acls,
        }
    }

    pub fn users(&self) -> &std::collections::BTreeMap<String, User> {
        &self.cfg.users
    }

    pub fn tokens(&self) -> &std::collections::BTreeMap<String, String> {
        &self.cfg.tokens
    }

    pub fn auth_optional(&self) -> bool {
        self.cfg.auth_optional
    }

    pub fn has_auth(&self) -> bool {
        self.cfg.has_auth()
    }

    /// URL prefix for links pointing back into this share.
    pub fn url_prefix(&self) -> String {
        if self.name.is_empty() {
            String::new()
        } else {
            format!("/s/{}", self.name)
        }
    }
}

/// Read the share tag set by [`dispatch`].
pub fn share_name(req: &Request) -> String {
    req.extensions()
        .get::<ShareName>()
        .map(|s| s.0.clone())
        .unwrap_or_default()
}

/// Route `/s/<name>/…` to the inner router with the prefix stripped; tag
/// everything else as the default share.
pub async fn dispatch(State(app): State<SharedState>, mut req: Request, next: Next) -> Response {
    let path = req.uri().path().to_string();
    let Some(rest) = path.strip_prefix("/s/") else {
        req.extensions_mut().insert(ShareName(String::new()));
        return next.run(req).await;
    };
    let Some(slash) = rest.find('/') else {
        if rest.is_empty() {
            return ApiError::NotFound("not found".into()).into_response();
        }
        return Redirect::temporary(&format!("/s/{rest}/")).into_response();
    };
    let share = &rest[..slash];
    if share.is_empty() {
        return ApiError::NotFound("not found".into()).into_response();
    }
    if !app.snapshot().await.shares.contains_key(share) {
        return ApiError::NotFound("not found".into()).into_response();
    }
    let Some(uri) = rewrite_path(req.uri(), &rest[slash..]) else {
        return ApiError::BadRequest("bad path".into()).into_response();
    };
    *req.uri_mut() = uri;
    req.extensions_mut().insert(ShareName(share.to_string()));
    next.run(req).await
}

fn rewrite_path(uri: &Uri, new_path: &str) -> Option<Uri> {
    let path_and_query = match uri.query() {
        Some(query) => format!("{new_path}?{query}"),
        None => new_path.to_string(),
    };
    let mut parts = uri.clone().into_parts();
    parts.path_and_query = Some(PathAndQuery::try_from(path_and_query).ok()?);
    Uri::from_parts(parts).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_with_share() -> Config {
        let mut cfg = Config {
            root: "/srv/root".into(),
            follow_symlinks: false,
            ..Config::default()
        };
        cfg.shares.insert(
            "media".into(),
            Share {
                root: "/srv/media".into(),
                follow_symlinks: Some(true),
                acls: vec![AclRule {
                    path: "/".into(),
                    read: vec!["*".into()],
                    ..AclRule::default()
                }],
                ..Share::default()
            },
        );
        cfg
    }

    #[tokio::test]
    async fn view_merges_share_overrides() {
        let app = AppState::new(config_with_share(), None, false);

        let root_view = app.view("").await;
        assert_eq!(root_view.root(), "/srv/root");
        assert!(!root_view.follow_symlinks());
        assert!(root_view.acls().is_empty());
        assert_eq!(root_view.url_prefix(), "");

        let media = app.view("media").await;
        assert_eq!(media.root(), "/srv/media");
        assert!(media.follow_symlinks());
        assert_eq!(media.acls().len(), 1);
        assert_eq!(media.url_prefix(), "/s/media");
        assert_eq!(
            media.state_dir(),
            Path::new("/srv/media").join(DEFAULT_STATE_DIR_NAME)
        );
    }

    #[tokio::test]
    async fn replace_config_invalidates_lock_cache() {
        use dav_server::davpath::DavPath;
        use dav_server::ls::DavLockSystem;

        let app = AppState::new(config_with_share(), None, false);
        let path = DavPath::new("/locked").expect("dav path");
        let before = app.dav_locks("media").await;
        before
            .lock(&path, Some("alice"), None, None, false, false)
            .await
            .expect("lock");

        app.replace_config(config_with_share()).await;
        let after = app.dav_locks("media").await;
        // The rebuilt lock system does not carry the old lock.
        after
            .lock(&path, Some("bob"), None, None, false, false)
            .await
            .expect("lock on fresh system");
    }
}
