//! Resumable chunked uploads.
//!
//! Sessions live in `<stateDir>/uploads/` as a `<id>.part` data file plus a
//! `<id>.json` sidecar. The sidecar is rewritten atomically on every offset
//! change and is the source of truth across restarts; the in-memory table
//! is only a cache. Finalization hands the assembled file to the dedup
//! store and materializes the destination through the path resolver.

use axum::body::Body;
use axum::extract::{Extension, Multipart, Path as UrlPath, Query, State};
use axum::response::{IntoResponse, Json, Response};
use futures_util::StreamExt;
use http_body_util::BodyExt;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::fs::{self, File};
use tokio::io::{AsyncSeekExt, AsyncWriteExt, SeekFrom};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::atomic::AtomicFile;
use crate::auth::{Identity, Perm, require};
use crate::dedup::DedupStore;
use crate::error::ApiError;
use crate::files::{ConflictMode, unique_sibling_rel};
use crate::fsutil::{self, clean_rel_path, join_rel, resolve_within_root};
use crate::shares::{ShareName, SharedState};

/// One resumable upload. Serialized as the on-disk sidecar.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub id: String,
    pub dest_rel: String,
    /// Declared total size; `-1` means unknown.
    pub size: i64,
    /// Bytes written so far; always the length of the `.part` file.
    pub offset: i64,
    pub created: i64,
}

pub enum UploadError {
    NotFound,
    /// Client-correctable state violation; surfaced as `400` with message.
    State(String),
    Path,
    Io(io::Error),
}

impl From<io::Error> for UploadError {
    fn from(err: io::Error) -> Self {
        UploadError::Io(err)
    }
}

impl From<UploadError> for ApiError {
    fn from(err: UploadError) -> Self {
        match err {
            UploadError::NotFound => ApiError::NotFound("not found".into()),
            UploadError::State(msg) => ApiError::BadRequest(msg),
            UploadError::Path => ApiError::BadRequest("bad path".into()),
            UploadError::Io(err) => ApiError::Internal(err.to_string()),
        }
    }
}

pub struct UploadManager {
    root: PathBuf,
    dir: PathBuf,
    follow_symlinks: bool,
    store: Arc<DedupStore>,
    sessions: Mutex<HashMap<String, Session>>,
}

impl UploadManager {
    /// Open the manager for a share, restoring any sidecars left by a
    /// previous run. Dangling `.part` files without a sidecar are left for
    /// operator cleanup.
    pub async fn open(
        root: PathBuf,
        state_dir: &Path,
        store: Arc<DedupStore>,
        follow_symlinks: bool,
    ) -> io::Result<Self> {
        let dir = state_dir.join("uploads");
        fs::create_dir_all(&dir).await?;
        let manager = Self {
            root,
            dir,
            follow_symlinks,
            store,
            sessions: Mutex::new(HashMap::new()),
        };
        manager.recover().await;
        Ok(manager)
    }

    async fn recover(&self) {
        let Ok(mut entries) = fs::read_dir(&self.dir).await else {
            return;
        };
        let mut sessions = self.sessions.lock().await;
        while let Ok(Some(entry)) = entries.next_entry().await {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if !name.ends_with(".json") {
                continue;
            }
            let Ok(raw) = fs::read(entry.path()).await else {
                continue;
            };
            match serde_json::from_slice::<Session>(&raw) {
                Ok(session) if !session.id.is_empty() => {
                    debug!(id = session.id, offset = session.offset, "restored upload session");
                    sessions.insert(session.id.clone(), session);
                }
                _ => warn!(sidecar = %name, "skipping unreadable upload sidecar"),
            }
        }
    }

    pub async fn create(&self, dest_rel: String, total: i64) -> Result<Session, UploadError> {
        let dest_rel = clean_rel_path(&dest_rel).map_err(|_| UploadError::Path)?;
        let session = Session {
            id: Uuid::new_v4().simple().to_string(),
            dest_rel,
            size: total,
            offset: 0,
            created: unix_now(),
        };
        self.save(&session).await?;
        let mut sessions = self.sessions.lock().await;
        sessions.insert(session.id.clone(), session.clone());
        Ok(session)
    }

    pub async fn get(&self, id: &str) -> Option<Session> {
        self.sessions.lock().await.get(id).cloned()
    }

    /// Write one chunk at `start`. The only accepted `start` is the current
    /// offset, and the body must be exactly `end - start + 1` bytes.
    pub async fn patch(
        &self,
        id: &str,
        start: i64,
        end: i64,
        total: i64,
        body: Body,
    ) -> Result<Session, UploadError> {
        let mut session = self.get(id).await.ok_or(UploadError::NotFound)?;
        if start != session.offset {
            return Err(UploadError::State(format!(
                "offset mismatch: have {} want {}",
                session.offset, start
            )));
        }
        if session.size < 0 && total >= 0 {
            session.size = total;
        } else if session.size >= 0 && total >= 0 && session.size != total {
            return Err(UploadError::State(format!(
                "size mismatch: have {} want {}",
                session.size, total
            )));
        }

        let expected = end - start + 1;
        let part_path = self.part_path(id);
        let mut file = fs::OpenOptions::new()
            .create(true)
            .write(true)
            .open(&part_path)
            .await?;
        file.seek(SeekFrom::Start(start as u64)).await?;

        let mut wrote: i64 = 0;
        let mut stream = BodyExt::into_data_stream(body);
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|err| UploadError::State(err.to_string()))?;
            if chunk.is_empty() {
                continue;
            }
            wrote += chunk.len() as i64;
            if wrote > expected {
                return Err(UploadError::State(format!(
                    "chunk length mismatch: got more than {expected} bytes"
                )));
            }
            file.write_all(&chunk).await?;
        }
        if wrote != expected {
            return Err(UploadError::State(format!(
                "short write: {wrote} != {expected}"
            )));
        }
        file.sync_all().await?;

        let updated = {
            let mut sessions = self.sessions.lock().await;
            let entry = sessions.get_mut(id).ok_or(UploadError::NotFound)?;
            if entry.offset != start {
                return Err(UploadError::State(format!(
                    "offset mismatch: have {} want {}",
                    entry.offset, start
                )));
            }
            entry.offset = end + 1;
            entry.size = session.size;
            entry.clone()
        };
        self.save(&updated).await?;
        Ok(updated)
    }

    /// Finalize: verify completeness, move the part file through the blob
    /// store, and materialize the destination. Consumes the session.
    pub async fn finish(&self, id: &str) -> Result<(String, String, u64), UploadError> {
        let session = self.get(id).await.ok_or(UploadError::NotFound)?;
        if session.size >= 0 && session.offset != session.size {
            return Err(UploadError::State(format!(
                "upload incomplete: offset={} size={}",
                session.offset, session.size
            )));
        }

        let part_path = self.part_path(id);
        let meta = fs::metadata(&part_path)
            .await
            .map_err(|_| UploadError::NotFound)?;
        if session.size >= 0 && meta.len() != session.size as u64 {
            return Err(UploadError::State(format!(
                "size mismatch: file={} expected={}",
                meta.len(),
                session.size
            )));
        }

        let tmp_path = self.dir.join(format!("{id}.tmp"));
        let _ = fs::remove_file(&tmp_path).await;
        fs::rename(&part_path, &tmp_path).await?;

        let (sha256hex, blob_path, size) = self.store.put(&tmp_path).await?;
        let dst = resolve_within_root(&self.root, &session.dest_rel, self.follow_symlinks)
            .await
            .map_err(|_| UploadError::Path)?;
        DedupStore::link_or_copy(&blob_path, &dst).await?;

        let _ = fs::remove_file(self.sidecar_path(id)).await;
        self.sessions.lock().await.remove(id);
        Ok((session.dest_rel, sha256hex, size))
    }

    /// Remove the session and its on-disk state. Idempotent.
    pub async fn cancel(&self, id: &str) {
        let _ = fs::remove_file(self.part_path(id)).await;
        let _ = fs::remove_file(self.dir.join(format!("{id}.tmp"))).await;
        let _ = fs::remove_file(self.sidecar_path(id)).await;
        self.sessions.lock().await.remove(id);
    }

    /// Directory for short-lived multipart spool files.
    pub fn spool_dir(&self) -> &Path {
        &self.dir
    }

    fn part_path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{id}.part"))
    }

    fn sidecar_path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{id}.json"))
    }

    async fn save(&self, session: &Session) -> Result<(), UploadError> {
        let data = serde_json::to_vec_pretty(session).map_err(io::Error::other)?;
        let mut atomic = AtomicFile::create(&self.sidecar_path(&session.id)).await?;
        if let Err(err) = atomic.write_all(&data).await {
            atomic.cancel().await;
            return Err(err.into());
        }
        atomic.commit().await?;
        Ok(())
    }
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Parse `Content-Range: bytes <start>-<end>/<total|*>`.
pub(crate) fn parse_content_range(value: &str) -> Result<(i64, i64, i64), String> {
    let value = value.trim();
    let Some(value) = value.strip_prefix("bytes ") else {
        return Err("missing Content-Range (expected: bytes start-end/total)".into());
    };
    let Some((range, total)) = value.split_once('/') else {
        return Err("invalid Content-Range".into());
    };
    let Some((start, end)) = range.split_once('-') else {
        return Err("invalid Content-Range range".into());
    };
    let start: i64 = start
        .parse()
        .ok()
        .filter(|n| *n >= 0)
        .ok_or("invalid Content-Range start")?;
    let end: i64 = end
        .parse()
        .ok()
        .filter(|n| *n >= start)
        .ok_or("invalid Content-Range end")?;
    let total: i64 = if total == "*" {
        -1
    } else {
        total
            .parse()
            .ok()
            .filter(|n| *n > 0 && end < *n)
            .ok_or("invalid Content-Range total")?
    };
    Ok((start, end, total))
}

// --- handlers ---

#[derive(Deserialize)]
pub(crate) struct CreateQuery {
    path: Option<String>,
    size: Option<String>,
    mode: Option<String>,
}

fn session_json(session: &Session, with_dest: bool) -> serde_json::Value {
    if with_dest {
        json!({
            "id": session.id,
            "offset": session.offset,
            "size": session.size,
            "dest": session.dest_rel,
        })
    } else {
        json!({"id": session.id, "offset": session.offset, "size": session.size})
    }
}

/// `POST /api/uploads?path=&size=&mode=`: allocate a session. This is the
/// ACL check point for the destination and where conflict modes apply.
pub async fn create(
    State(app): State<SharedState>,
    Extension(share): Extension<ShareName>,
    Extension(identity): Extension<Identity>,
    Query(query): Query<CreateQuery>,
) -> Result<Response, ApiError> {
    let dest = clean_rel_path(query.path.as_deref().unwrap_or(""))?;
    if dest.is_empty() {
        return Err(ApiError::BadRequest("missing path".into()));
    }
    let mode = ConflictMode::parse(query.mode.as_deref())?;
    let total = query
        .size
        .as_deref()
        .and_then(|v| v.trim().parse::<i64>().ok())
        .unwrap_or(-1);

    let view = app.view(&share.0).await;
    require(&view, &identity, Perm::Write, &dest)?;

    let mut final_dest = dest.clone();
    let dest_abs = resolve_within_root(&view.root_path(), &dest, view.follow_symlinks()).await?;
    if fs::metadata(&dest_abs).await.is_ok() {
        match mode {
            ConflictMode::Skip => {
                return Ok(Json(json!({"skipped": true, "path": dest})).into_response());
            }
            ConflictMode::Error => {
                return Err(ApiError::Conflict("destination exists".into()));
            }
            ConflictMode::Rename => {
                final_dest = unique_sibling_rel(&view, &dest).await?;
            }
            ConflictMode::Overwrite => {}
        }
    }

    let (_, uploads) = app
        .share_deps(&view)
        .await
        .map_err(|err| ApiError::Internal(format!("server init failed: {err}")))?;
    let session = uploads.create(final_dest, total).await?;
    info!(
        id = session.id,
        dest = session.dest_rel,
        size = session.size,
        "upload session created"
    );
    Ok(Json(session_json(&session, true)).into_response())
}

async fn session_for(
    app: &SharedState,
    share: &str,
    identity: &Identity,
    id: &str,
) -> Result<(Arc<UploadManager>, Session), ApiError> {
    let view = app.view(share).await;
    let (_, uploads) = app
        .share_deps(&view)
        .await
        .map_err(|err| ApiError::Internal(format!("server init failed: {err}")))?;
    let session = uploads
        .get(id)
        .await
        .ok_or_else(|| ApiError::NotFound("not found".into()))?;
    require(&view, identity, Perm::Write, &session.dest_rel)?;
    Ok((uploads, session))
}

/// `GET /api/uploads/<id>`: resync point for clients.
pub async fn status(
    State(app): State<SharedState>,
    Extension(share): Extension<ShareName>,
    Extension(identity): Extension<Identity>,
    UrlPath(id): UrlPath<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let (_, session) = session_for(&app, &share.0, &identity, &id).await?;
    Ok(Json(session_json(&session, true)))
}

/// `PATCH /api/uploads/<id>` with `Content-Range`.
pub async fn patch(
    State(app): State<SharedState>,
    Extension(share): Extension<ShareName>,
    Extension(identity): Extension<Identity>,
    UrlPath(id): UrlPath<String>,
    headers: axum::http::HeaderMap,
    body: Body,
) -> Result<Json<serde_json::Value>, ApiError> {
    let (uploads, _) = session_for(&app, &share.0, &identity, &id).await?;
    let range = headers
        .get(axum::http::header::CONTENT_RANGE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    let (start, end, total) = parse_content_range(range).map_err(ApiError::BadRequest)?;
    let session = uploads.patch(&id, start, end, total, body).await?;
    debug!(id, offset = session.offset, "upload chunk accepted");
    Ok(Json(session_json(&session, false)))
}

/// `POST /api/uploads/<id>/finish`.
pub async fn finish(
    State(app): State<SharedState>,
    Extension(share): Extension<ShareName>,
    Extension(identity): Extension<Identity>,
    UrlPath(id): UrlPath<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let (uploads, _) = session_for(&app, &share.0, &identity, &id).await?;
    let (path, sha256, size) = uploads.finish(&id).await?;
    info!(id, path, sha256, size, "upload finished");
    Ok(Json(json!({"ok": true, "path": path, "sha256": sha256, "size": size})))
}

/// `DELETE /api/uploads/<id>`: cancel; equivalent to the client aborting.
pub async fn cancel(
    State(app): State<SharedState>,
    Extension(share): Extension<ShareName>,
    Extension(identity): Extension<Identity>,
    UrlPath(id): UrlPath<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let (uploads, _) = session_for(&app, &share.0, &identity, &id).await?;
    uploads.cancel(&id).await;
    info!(id, "upload canceled");
    Ok(Json(json!({"ok": true})))
}

#[derive(Deserialize)]
pub(crate) struct MultipartQuery {
    path: Option<String>,
    mode: Option<String>,
}

/// `POST /api/upload`: one-shot multipart fallback. The file is spooled
/// under the uploads state dir, deduplicated, then materialized with the
/// same conflict modes as session uploads.
pub async fn multipart_upload(
    State(app): State<SharedState>,
    Extension(share): Extension<ShareName>,
    Extension(identity): Extension<Identity>,
    Query(query): Query<MultipartQuery>,
    mut multipart: Multipart,
) -> Result<Json<serde_json::Value>, ApiError> {
    let dir_rel = clean_rel_path(query.path.as_deref().unwrap_or(""))?;
    let mode = ConflictMode::parse(query.mode.as_deref())?;

    let view = app.view(&share.0).await;
    require(&view, &identity, Perm::Write, &dir_rel)?;
    let dir_abs = resolve_within_root(&view.root_path(), &dir_rel, view.follow_symlinks()).await?;

    let (store, uploads) = app
        .share_deps(&view)
        .await
        .map_err(|err| ApiError::Internal(format!("server init failed: {err}")))?;

    let mut file_name = None;
    let mut spool_path = None;
    while let Some(mut field) = multipart
        .next_field()
        .await
        .map_err(|_| ApiError::BadRequest("bad multipart".into()))?
    {
        let Some(name) = field.file_name().map(str::to_string) else {
            continue;
        };
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or(0);
        let spool = uploads.spool_dir().join(format!("mp-{nanos}.tmp"));
        let mut out = File::create(&spool)
            .await
            .map_err(|err| ApiError::Internal(err.to_string()))?;
        while let Some(chunk) = field
            .chunk()
            .await
            .map_err(|_| ApiError::BadRequest("bad multipart".into()))?
        {
            out.write_all(&chunk)
                .await
                .map_err(|err| ApiError::Internal(err.to_string()))?;
        }
        drop(out);
        file_name = Some(name);
        spool_path = Some(spool);
        break;
    }
    let (Some(file_name), Some(spool_path)) = (file_name, spool_path) else {
        return Err(ApiError::BadRequest("missing file".into()));
    };

    let (sha256, blob_path, size) = store
        .put(&spool_path)
        .await
        .map_err(|err| ApiError::Internal(format!("dedup failed: {err}")))?;

    let mut dst_rel = clean_rel_path(&join_rel(&dir_rel, &file_name))?;
    let mut dst_abs =
        resolve_within_root(&view.root_path(), &dst_rel, view.follow_symlinks()).await?;
    if fs::metadata(&dst_abs).await.is_ok() {
        match mode {
            ConflictMode::Skip => {
                let _ = fs::remove_file(&spool_path).await;
                return Ok(Json(json!({"ok": true, "skipped": true, "path": dst_rel})));
            }
            ConflictMode::Error => {
                let _ = fs::remove_file(&spool_path).await;
                return Err(ApiError::Conflict("destination exists".into()));
            }
            ConflictMode::Rename => {
                let base = dst_rel.rsplit('/').next().unwrap_or(&dst_rel);
                let unique = fsutil::unique_name_in_dir(&dir_abs, base)
                    .await
                    .map_err(|err| ApiError::Internal(err.to_string()))?;
                dst_rel = join_rel(&dir_rel, &unique);
                dst_abs =
                    resolve_within_root(&view.root_path(), &dst_rel, view.follow_symlinks())
                        .await?;
            }
            ConflictMode::Overwrite => {}
        }
    }
    DedupStore::link_or_copy(&blob_path, &dst_abs)
        .await
        .map_err(|err| ApiError::Internal(format!("write failed: {err}")))?;
    info!(path = dst_rel, sha256, size, "multipart upload stored");
    Ok(Json(json!({"ok": true, "sha256": sha256, "size": size, "path": dst_rel})))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const HELLO_WORLD_SHA256: &str =
        "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9";

    async fn make_manager() -> (tempfile::TempDir, UploadManager) {
        let temp = tempdir().expect("tempdir");
        let root = temp.path().join("root");
        let state = temp.path().join("state");
        std::fs::create_dir_all(&root).expect("root");
        std::fs::create_dir_all(&state).expect("state");
        let store = Arc::new(DedupStore::open(&state).await.expect("store"));
        let manager = UploadManager::open(root, &state, store, false)
            .await
            .expect("manager");
        (temp, manager)
    }

    #[tokio::test]
    async fn resumable_upload_with_unknown_size() {
        let (temp, manager) = make_manager().await;
        let session = manager
            .create("notes/a.txt".into(), -1)
            .await
            .unwrap_or_else(|_| panic!("create failed"));
        assert_eq!(session.offset, 0);
        assert_eq!(session.size, -1);

        let session = manager
            .patch(&session.id, 0, 4, -1, Body::from("hello"))
            .await
            .unwrap_or_else(|_| panic!("first patch failed"));
        assert_eq!(session.offset, 5);
        assert_eq!(session.size, -1);

        let session = manager
            .patch(&session.id, 5, 10, 11, Body::from(" world"))
            .await
            .unwrap_or_else(|_| panic!("second patch failed"));
        assert_eq!(session.offset, 11);
        assert_eq!(session.size, 11);

        let (path, sha256, size) = manager
            .finish(&session.id)
            .await
            .unwrap_or_else(|_| panic!("finish failed"));
        assert_eq!(path, "notes/a.txt");
        assert_eq!(sha256, HELLO_WORLD_SHA256);
        assert_eq!(size, 11);

        let written = std::fs::read(temp.path().join("root/notes/a.txt")).expect("read dest");
        assert_eq!(written, b"hello world");
        assert!(manager.get(&session.id).await.is_none());
    }

    #[tokio::test]
    async fn patch_rejects_offset_mismatch() {
        let (_temp, manager) = make_manager().await;
        let session = manager
            .create("a.bin".into(), 11)
            .await
            .unwrap_or_else(|_| panic!("create failed"));
        manager
            .patch(&session.id, 0, 4, 11, Body::from("hello"))
            .await
            .unwrap_or_else(|_| panic!("patch failed"));

        let err = manager
            .patch(&session.id, 0, 4, 11, Body::from("hello"))
            .await;
        assert!(matches!(err, Err(UploadError::State(msg)) if msg.contains("offset mismatch")));

        let session = manager.get(&session.id).await.expect("session");
        assert_eq!(session.offset, 5, "offset must not move on rejection");
    }

    #[tokio::test]
    async fn patch_rejects_short_and_oversized_bodies() {
        let (_temp, manager) = make_manager().await;
        let session = manager
            .create("a.bin".into(), -1)
            .await
            .unwrap_or_else(|_| panic!("create failed"));

        let err = manager
            .patch(&session.id, 0, 9, -1, Body::from("short"))
            .await;
        assert!(matches!(err, Err(UploadError::State(msg)) if msg.contains("short write")));

        let err = manager
            .patch(&session.id, 0, 1, -1, Body::from("too many bytes"))
            .await;
        assert!(matches!(err, Err(UploadError::State(_))));
    }

    #[tokio::test]
    async fn finish_rejects_incomplete_upload() {
        let (_temp, manager) = make_manager().await;
        let session = manager
            .create("a.bin".into(), 10)
            .await
            .unwrap_or_else(|_| panic!("create failed"));
        manager
            .patch(&session.id, 0, 4, 10, Body::from("hello"))
            .await
            .unwrap_or_else(|_| panic!("patch failed"));

        let err = manager.finish(&session.id).await;
        assert!(matches!(err, Err(UploadError::State(msg)) if msg.contains("incomplete")));
    }

    #[tokio::test]
    async fn sessions_survive_restart_via_sidecars() {
        let temp = tempdir().expect("tempdir");
        let root = temp.path().join("root");
        let state = temp.path().join("state");
        std::fs::create_dir_all(&root).expect("root");
        std::fs::create_dir_all(&state).expect("state");

        let store = Arc::new(DedupStore::open(&state).await.expect("store"));
        let manager = UploadManager::open(root.clone(), &state, store.clone(), false)
            .await
            .expect("manager");
        let session = manager
            .create("keep.bin".into(), -1)
            .await
            .unwrap_or_else(|_| panic!("create failed"));
        manager
            .patch(&session.id, 0, 2, -1, Body::from("abc"))
            .await
            .unwrap_or_else(|_| panic!("patch failed"));
        drop(manager);

        let manager = UploadManager::open(root, &state, store, false)
            .await
            .expect("reopen");
        let restored = manager.get(&session.id).await.expect("restored session");
        assert_eq!(restored.dest_rel, "keep.bin");
        assert_eq!(restored.offset, 3);
    }

    #[tokio::test]
    async fn cancel_is_idempotent_and_removes_state() {
        let (temp, manager) = make_manager().await;
        let session = manager
            .create("gone.bin".into(), -1)
            .await
            .unwrap_or_else(|_| panic!("create failed"));
        manager
            .patch(&session.id, 0, 2, -1, Body::from("abc"))
            .await
            .unwrap_or_else(|_| panic!("patch failed"));

        manager.cancel(&session.id).await;
        assert!(manager.get(&session.id).await.is_none());
        let uploads_dir = temp.path().join("state/uploads");
        let leftovers = std::fs::read_dir(uploads_dir).expect("read dir").count();
        assert_eq!(leftovers, 0);

        manager.cancel(&session.id).await;
    }

    #[test]
    fn content_range_parsing() {
        assert_eq!(parse_content_range("bytes 0-4/11").expect("parse"), (0, 4, 11));
        assert_eq!(parse_content_range("bytes 5-10/*").expect("parse"), (5, 10, -1));
        assert!(parse_content_range("0-4/11").is_err());
        assert!(parse_content_range("bytes 4-0/11").is_err());
        assert!(parse_content_range("bytes 0-11/11").is_err());
        assert!(parse_content_range("bytes 0-4").is_err());
        assert!(parse_content_range("bytes a-b/c").is_err());
    }
}
