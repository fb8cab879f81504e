//! Copy and move across paths inside a share.
//!
//! Both operations process items in request order and stop at the first
//! error; already-applied items stay applied. Recursive copies never follow
//! symlinks.

use axum::extract::rejection::JsonRejection;
use axum::extract::{Extension, Json, State};
use axum::response::Json as JsonResponse;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::io;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::info;
use uuid::Uuid;
use walkdir::WalkDir;

use crate::auth::{Identity, Perm, require};
use crate::error::ApiError;
use crate::files::{ConflictMode, unique_sibling_rel};
use crate::fsutil::{clean_rel_path, join_rel, resolve_within_root};
use crate::http::body_json;
use crate::shares::{ShareName, SharedState};

#[derive(Deserialize)]
pub(crate) struct TransferBody {
    #[serde(default)]
    paths: Vec<String>,
    #[serde(default, rename = "destDir")]
    dest_dir: String,
    #[serde(default)]
    mode: Option<String>,
    #[serde(default)]
    overwrite: bool,
}

#[derive(Serialize)]
pub(crate) struct TransferItem {
    from: String,
    to: String,
    status: &'static str,
}

fn transfer_mode(body: &TransferBody) -> Result<ConflictMode, ApiError> {
    match body.mode.as_deref().map(str::trim).filter(|m| !m.is_empty()) {
        Some(mode) => {
            ConflictMode::from_name(mode).ok_or_else(|| ApiError::BadRequest("bad mode".into()))
        }
        None if body.overwrite => Ok(ConflictMode::Overwrite),
        None => Ok(ConflictMode::Error),
    }
}

/// `POST /api/copy`.
pub async fn copy(
    State(app): State<SharedState>,
    Extension(share): Extension<ShareName>,
    Extension(identity): Extension<Identity>,
    payload: Result<Json<TransferBody>, JsonRejection>,
) -> Result<JsonResponse<serde_json::Value>, ApiError> {
    let body = body_json(payload)?;
    transfer(&app, &share.0, &identity, body, false).await
}

/// `POST /api/move`: rename first, copy+delete on cross-device failures.
pub async fn move_items(
    State(app): State<SharedState>,
    Extension(share): Extension<ShareName>,
    Extension(identity): Extension<Identity>,
    payload: Result<Json<TransferBody>, JsonRejection>,
) -> Result<JsonResponse<serde_json::Value>, ApiError> {
    let body = body_json(payload)?;
    transfer(&app, &share.0, &identity, body, true).await
}

async fn transfer(
    app: &SharedState,
    share: &str,
    identity: &Identity,
    body: TransferBody,
    moving: bool,
) -> Result<JsonResponse<serde_json::Value>, ApiError> {
    if body.paths.is_empty() {
        return Err(ApiError::BadRequest("missing paths".into()));
    }
    let mode = transfer_mode(&body)?;

    let view = app.view(share).await;
    let dest_dir_rel = clean_rel_path(&body.dest_dir)?;
    let dest_dir_abs =
        resolve_within_root(&view.root_path(), &dest_dir_rel, view.follow_symlinks())
            .await
            .map_err(|_| ApiError::BadRequest("bad dest".into()))?;
    let dest_meta = fs::metadata(&dest_dir_abs).await;
    if !dest_meta.map(|m| m.is_dir()).unwrap_or(false) {
        return Err(ApiError::BadRequest("dest is not a directory".into()));
    }
    require(&view, identity, Perm::Write, &dest_dir_rel)?;

    let mut out = Vec::with_capacity(body.paths.len());
    for raw in &body.paths {
        let src_rel = clean_rel_path(raw)?;
        if src_rel.is_empty() {
            continue;
        }
        let src_perm = if moving { Perm::Write } else { Perm::Read };
        require(&view, identity, src_perm, &src_rel)?;

        let src_abs =
            resolve_within_root(&view.root_path(), &src_rel, view.follow_symlinks()).await?;
        let src_meta = fs::metadata(&src_abs)
            .await
            .map_err(|_| ApiError::NotFound("not found".into()))?;
        let base = src_rel.rsplit('/').next().unwrap_or("").to_string();
        if base.is_empty() || base == "." {
            return Err(ApiError::BadRequest("bad name".into()));
        }

        let mut dst_rel = join_rel(&dest_dir_rel, &base);
        let mut dst_abs =
            resolve_within_root(&view.root_path(), &dst_rel, view.follow_symlinks())
                .await
                .map_err(|_| ApiError::BadRequest("bad dest".into()))?;
        require(&view, identity, Perm::Write, &dst_rel)?;

        let mut status = "ok";
        let mut wipe_dest = false;
        if fs::metadata(&dst_abs).await.is_ok() {
            match mode {
                ConflictMode::Skip => {
                    out.push(TransferItem {
                        from: src_rel,
                        to: dst_rel,
                        status: "skipped",
                    });
                    continue;
                }
                ConflictMode::Error => {
                    return Err(ApiError::Conflict("destination exists".into()));
                }
                ConflictMode::Rename => {
                    dst_rel = unique_sibling_rel(&view, &dst_rel).await?;
                    dst_abs = resolve_within_root(
                        &view.root_path(),
                        &dst_rel,
                        view.follow_symlinks(),
                    )
                    .await
                    .map_err(|_| ApiError::BadRequest("bad dest".into()))?;
                    status = "renamed";
                }
                ConflictMode::Overwrite => {
                    status = "overwritten";
                    wipe_dest = moving;
                }
            }
        }

        validate_targets(src_meta.is_dir(), &src_abs, &dst_abs)?;

        if moving {
            if wipe_dest {
                let _ = remove_any(&dst_abs).await;
            }
            if let Some(parent) = dst_abs.parent() {
                fs::create_dir_all(parent)
                    .await
                    .map_err(|err| ApiError::Internal(format!("mkdir failed: {err}")))?;
            }
            if fs::rename(&src_abs, &dst_abs).await.is_err() {
                // Cross-device: fall back to copy + delete.
                copy_entry(&src_abs, &dst_abs, src_meta.is_dir(), mode).await?;
                remove_any(&src_abs)
                    .await
                    .map_err(|err| ApiError::Internal(format!("move failed: {err}")))?;
            }
        } else {
            copy_entry(&src_abs, &dst_abs, src_meta.is_dir(), mode).await?;
        }
        out.push(TransferItem {
            from: src_rel,
            to: dst_rel,
            status,
        });
    }
    info!(
        count = out.len(),
        dest = dest_dir_rel,
        moving,
        "transfer complete"
    );
    Ok(JsonResponse(json!({"ok": true, "items": out})))
}

/// Reject copying a directory into itself or a file onto itself.
fn validate_targets(src_is_dir: bool, src_abs: &Path, dst_abs: &Path) -> Result<(), ApiError> {
    if src_is_dir {
        if dst_abs == src_abs || dst_abs.starts_with(src_abs) {
            return Err(ApiError::BadRequest("destination is inside source".into()));
        }
    } else if dst_abs == src_abs {
        return Err(ApiError::BadRequest("destination matches source".into()));
    }
    Ok(())
}

async fn remove_any(path: &Path) -> io::Result<()> {
    match fs::symlink_metadata(path).await {
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err),
        Ok(meta) if meta.is_dir() => fs::remove_dir_all(path).await,
        Ok(_) => fs::remove_file(path).await,
    }
}

async fn copy_entry(
    src: &Path,
    dst: &Path,
    is_dir: bool,
    mode: ConflictMode,
) -> Result<(), ApiError> {
    let src = src.to_path_buf();
    let dst = dst.to_path_buf();
    let overwrite = mode == ConflictMode::Overwrite;
    let result = tokio::task::spawn_blocking(move || {
        if is_dir {
            copy_dir_no_symlinks(&src, &dst, overwrite)
        } else {
            copy_file_atomic(&src, &dst, overwrite)
        }
    })
    .await
    .map_err(|err| ApiError::Internal(err.to_string()))?;
    result.map_err(|err| match err.kind() {
        io::ErrorKind::AlreadyExists => ApiError::Conflict("destination exists".into()),
        _ => ApiError::Internal(format!("copy failed: {err}")),
    })
}

/// Blocking file copy to a sibling temp, fsync, rename.
fn copy_file_atomic(src: &Path, dst: &Path, overwrite: bool) -> io::Result<()> {
    use std::io::Write;

    if !overwrite && std::fs::metadata(dst).is_ok() {
        return Err(io::ErrorKind::AlreadyExists.into());
    }
    let mut input = std::fs::File::open(src)?;
    if let Some(parent) = dst.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let tmp = tmp_sibling(dst);
    let result = (|| {
        let mut output = std::fs::File::create(&tmp)?;
        std::io::copy(&mut input, &mut output)?;
        output.flush()?;
        output.sync_all()
    })();
    if let Err(err) = result {
        let _ = std::fs::remove_file(&tmp);
        return Err(err);
    }
    if overwrite {
        let _ = std::fs::remove_file(dst);
    } else if std::fs::metadata(dst).is_ok() {
        let _ = std::fs::remove_file(&tmp);
        return Err(io::ErrorKind::AlreadyExists.into());
    }
    std::fs::rename(&tmp, dst)
}

fn tmp_sibling(dst: &Path) -> PathBuf {
    let mut name = dst.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(format!(".tmp-{}", Uuid::new_v4().simple()));
    dst.with_file_name(name)
}

/// Blocking recursive copy that skips symlinks entirely.
fn copy_dir_no_symlinks(src_dir: &Path, dst_dir: &Path, overwrite: bool) -> io::Result<()> {
    if let Ok(meta) = std::fs::metadata(dst_dir)
        && !meta.is_dir()
    {
        if !overwrite {
            return Err(io::ErrorKind::AlreadyExists.into());
        }
        std::fs::remove_file(dst_dir)?;
    }
    std::fs::create_dir_all(dst_dir)?;
    for entry in WalkDir::new(src_dir).follow_links(false) {
        let entry = entry.map_err(io::Error::other)?;
        if entry.path_is_symlink() {
            continue;
        }
        let rel = entry
            .path()
            .strip_prefix(src_dir)
            .map_err(io::Error::other)?;
        if rel.as_os_str().is_empty() {
            continue;
        }
        let target = dst_dir.join(rel);
        if entry.file_type().is_dir() {
            std::fs::create_dir_all(&target)?;
        } else {
            copy_file_atomic(entry.path(), &target, overwrite)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn copy_file_atomic_respects_overwrite_flag() {
        let temp = tempdir().expect("tempdir");
        let src = temp.path().join("src.txt");
        let dst = temp.path().join("dst.txt");
        std::fs::write(&src, b"new").expect("write src");
        std::fs::write(&dst, b"old").expect("write dst");

        let err = copy_file_atomic(&src, &dst, false).expect_err("must refuse");
        assert_eq!(err.kind(), io::ErrorKind::AlreadyExists);
        assert_eq!(std::fs::read(&dst).expect("read"), b"old");

        copy_file_atomic(&src, &dst, true).expect("overwrite");
        assert_eq!(std::fs::read(&dst).expect("read"), b"new");
    }

    #[cfg(unix)]
    #[test]
    fn copy_dir_skips_symlinks() {
        use std::os::unix::fs::symlink;

        let temp = tempdir().expect("tempdir");
        let src = temp.path().join("src");
        std::fs::create_dir_all(src.join("sub")).expect("dirs");
        std::fs::write(src.join("sub/file.txt"), b"data").expect("write");
        symlink(temp.path(), src.join("loop")).expect("symlink");

        let dst = temp.path().join("dst");
        copy_dir_no_symlinks(&src, &dst, false).expect("copy");

        assert_eq!(std::fs::read(dst.join("sub/file.txt")).expect("read"), b"data");
        assert!(!dst.join("loop").exists());
    }

    #[test]
    fn validate_targets_rejects_self_copies() {
        let src = Path::new("/srv/a");
        assert!(validate_targets(true, src, Path::new("/srv/a/b")).is_err());
        assert!(validate_targets(true, src, src).is_err());
        assert!(validate_targets(false, src, src).is_err());
        assert!(validate_targets(true, src, Path::new("/srv/b")).is_ok());
        assert!(validate_targets(false, src, Path::new("/srv/b")).is_ok());
    }

    #[test]
    fn transfer_mode_defaults() {
        let body = |mode: Option<&str>, overwrite: bool| TransferBody {
            paths: vec!["a".into()],
            dest_dir: "".into(),
            mode: mode.map(str::to_string),
            overwrite,
        };
        assert_eq!(
            transfer_mode(&body(None, false)).expect("mode"),
            ConflictMode::Error
        );
        assert_eq!(
            transfer_mode(&body(None, true)).expect("mode"),
            ConflictMode::Overwrite
        );
        assert_eq!(
            transfer_mode(&body(Some("skip"), false)).expect("mode"),
            ConflictMode::Skip
        );
        assert!(transfer_mode(&body(Some("merge"), false)).is_err());
    }
}
