//! Directory listings, file downloads, and basic file mutations.

use axum::body::Body;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Extension, Path as UrlPath, Query, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Json, Response};
use httpdate::{fmt_http_date, parse_http_date};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::io::SeekFrom;
use tokio::fs::{self, File};
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio_util::io::ReaderStream;
use tracing::{debug, info};

use crate::atomic::AtomicFile;
use crate::auth::{Identity, Perm, require};
use crate::config::MAX_WRITE_BODY;
use crate::error::ApiError;
use crate::etag::etag_from_metadata;
use crate::fsutil::{self, clean_rel_path, join_rel, resolve_within_root};
use crate::http::body_json;
use crate::shares::{ShareName, SharedState, ShareView};
use crate::thumb::{is_image_ext, is_text_ext};

/// What to do when a write's destination already exists.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum ConflictMode {
    Overwrite,
    Rename,
    Skip,
    Error,
}

impl ConflictMode {
    pub(crate) fn from_name(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "overwrite" => Some(Self::Overwrite),
            "rename" => Some(Self::Rename),
            "skip" => Some(Self::Skip),
            "error" => Some(Self::Error),
            _ => None,
        }
    }

    /// Parse an optional mode string, defaulting to `overwrite`.
    pub(crate) fn parse(value: Option<&str>) -> Result<Self, ApiError> {
        match value.map(str::trim).filter(|v| !v.is_empty()) {
            None => Ok(Self::Overwrite),
            Some(v) => {
                Self::from_name(v).ok_or_else(|| ApiError::BadRequest("bad mode".into()))
            }
        }
    }
}

/// Compute a free `base (N)ext` sibling for `rel` and return the new rel.
pub(crate) async fn unique_sibling_rel(view: &ShareView, rel: &str) -> Result<String, ApiError> {
    let (parent_rel, base) = match rel.rsplit_once('/') {
        Some((parent, base)) => (parent.to_string(), base.to_string()),
        None => (String::new(), rel.to_string()),
    };
    let parent_abs =
        resolve_within_root(&view.root_path(), &parent_rel, view.follow_symlinks()).await?;
    let name = fsutil::unique_name_in_dir(&parent_abs, &base)
        .await
        .map_err(|err| ApiError::Internal(err.to_string()))?;
    Ok(join_rel(&parent_rel, &name))
}

#[derive(Serialize, Default, Clone)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ListItem {
    pub name: String,
    pub path: String,
    pub is_dir: bool,
    #[serde(skip_serializing_if = "is_false")]
    pub is_link: bool,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub link_to: String,
    pub size: i64,
    pub mtime: i64,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub mime: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub thumb: String,
}

fn is_false(value: &bool) -> bool {
    !*value
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ReadmeInfo {
    pub path: String,
    pub name: String,
    pub size: i64,
    pub mtime: i64,
}

pub(crate) fn query_escape(value: &str) -> String {
    form_urlencoded::byte_serialize(value.as_bytes()).collect()
}

pub(crate) fn content_type_for_name(name: &str) -> String {
    mime_guess::from_path(name)
        .first()
        .map(|mime| mime.essence_str().to_string())
        .unwrap_or_default()
}

pub(crate) fn file_ext(name: &str) -> String {
    match name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => format!(".{}", ext.to_ascii_lowercase()),
        _ => String::new(),
    }
}

/// Fill in mime and thumbnail URL for a non-directory item.
pub(crate) fn enrich_item(view: &ShareView, item: &mut ListItem) {
    if item.is_dir {
        return;
    }
    let ext = file_ext(&item.name);
    item.mime = content_type_for_name(&item.name);
    if is_image_ext(&ext) {
        item.thumb = format!(
            "{}/thumb?path={}",
            view.url_prefix(),
            query_escape(&item.path)
        );
    } else if is_text_ext(&ext)
        && item.size > 0
        && item.size <= crate::config::TEXT_THUMB_MAX_SOURCE as i64
    {
        item.thumb = format!(
            "{}/thumb?path={}&t=txt",
            view.url_prefix(),
            query_escape(&item.path)
        );
    }
}

#[derive(Deserialize)]
pub(crate) struct PathQuery {
    path: Option<String>,
}

/// `GET /api/list?path=`: sorted directory listing with a README pointer.
pub async fn list(
    State(app): State<SharedState>,
    Extension(share): Extension<ShareName>,
    Extension(identity): Extension<Identity>,
    Query(query): Query<PathQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let rel = clean_rel_path(query.path.as_deref().unwrap_or(""))?;
    let view = app.view(&share.0).await;
    require(&view, &identity, Perm::Read, &rel)?;

    let abs = resolve_within_root(&view.root_path(), &rel, view.follow_symlinks()).await?;
    let meta = fs::metadata(&abs)
        .await
        .map_err(|_| ApiError::NotFound("not found".into()))?;
    if !meta.is_dir() {
        return Err(ApiError::BadRequest("not a directory".into()));
    }

    let mut readme = None;
    for candidate in ["README.md", "readme.md"] {
        if let Ok(meta) = fs::metadata(abs.join(candidate)).await
            && meta.is_file()
        {
            readme = Some(ReadmeInfo {
                path: join_rel(&rel, candidate),
                name: candidate.to_string(),
                size: meta.len() as i64,
                mtime: unix_mtime(&meta),
            });
            break;
        }
    }

    let mut items = Vec::new();
    let mut entries = fs::read_dir(&abs)
        .await
        .map_err(|err| ApiError::Internal(err.to_string()))?;
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|err| ApiError::Internal(err.to_string()))?
    {
        let name = entry.file_name().to_string_lossy().into_owned();
        let child_rel = join_rel(&rel, &name);
        let meta = entry.metadata().await.ok();
        let file_type = entry.file_type().await.ok();
        let is_link = file_type.is_some_and(|t| t.is_symlink());
        let mut item = ListItem {
            name,
            path: child_rel,
            is_dir: file_type.is_some_and(|t| t.is_dir()),
            is_link,
            size: meta.as_ref().map(|m| m.len() as i64).unwrap_or(0),
            mtime: meta.as_ref().map(unix_mtime).unwrap_or(0),
            ..ListItem::default()
        };
        if is_link
            && let Ok(target) = fs::read_link(entry.path()).await
        {
            item.link_to = target.to_string_lossy().into_owned();
        }
        enrich_item(&view, &mut item);
        items.push(item);
    }
    items.sort_by(|a, b| {
        b.is_dir
            .cmp(&a.is_dir)
            .then_with(|| a.name.to_lowercase().cmp(&b.name.to_lowercase()))
    });

    info!(path = rel, count = items.len(), "list directory");
    Ok(Json(json!({"path": rel, "items": items, "readme": readme})))
}

pub(crate) fn unix_mtime(meta: &std::fs::Metadata) -> i64 {
    meta.modified()
        .ok()
        .and_then(|ts| ts.duration_since(std::time::UNIX_EPOCH).ok())
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

#[derive(Deserialize)]
pub(crate) struct DownloadQuery {
    dl: Option<String>,
}

/// `GET /f/<rel>`: file download with Range, If-Range, and optional
/// attachment disposition (`?dl=1`).
pub async fn download(
    State(app): State<SharedState>,
    Extension(share): Extension<ShareName>,
    Extension(identity): Extension<Identity>,
    UrlPath(raw_rel): UrlPath<String>,
    Query(query): Query<DownloadQuery>,
    request_headers: HeaderMap,
) -> Result<Response, ApiError> {
    let rel = clean_rel_path(&raw_rel)?;
    let view = app.view(&share.0).await;
    require(&view, &identity, Perm::Read, &rel)?;

    let abs = resolve_within_root(&view.root_path(), &rel, view.follow_symlinks()).await?;
    let meta = fs::metadata(&abs)
        .await
        .map_err(|_| ApiError::NotFound("not found".into()))?;
    if meta.is_dir() {
        return Err(ApiError::BadRequest("is a directory".into()));
    }
    let file_size = meta.len();
    let modified = meta.modified().ok();

    let mut headers = HeaderMap::new();
    let mime = content_type_for_name(&rel);
    if !mime.is_empty() {
        headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_str(&mime)
                .map_err(|_| ApiError::Internal("invalid mime type".into()))?,
        );
    }
    headers.insert(header::ACCEPT_RANGES, HeaderValue::from_static("bytes"));
    headers.insert(
        header::ETAG,
        HeaderValue::from_str(&etag_from_metadata(&meta))
            .map_err(|_| ApiError::Internal("header build failed".into()))?,
    );
    if let Some(modified) = modified {
        headers.insert(
            header::LAST_MODIFIED,
            HeaderValue::from_str(&fmt_http_date(modified))
                .map_err(|_| ApiError::Internal("header build failed".into()))?,
        );
    }
    if query.dl.as_deref() == Some("1") {
        let base = rel.rsplit('/').next().unwrap_or(&rel);
        headers.insert(
            header::CONTENT_DISPOSITION,
            HeaderValue::from_str(&format!("attachment; filename=\"{}\"", base.replace('"', "'")))
                .map_err(|_| ApiError::Internal("header build failed".into()))?,
        );
    }

    let if_range_matches = match request_headers
        .get(header::IF_RANGE)
        .and_then(|value| value.to_str().ok())
    {
        Some(value) => match parse_http_date(value) {
            Ok(date) => modified.map(|ts| ts <= date).unwrap_or(false),
            Err(_) => false,
        },
        None => true,
    };
    let range = if if_range_matches {
        parse_range(request_headers.get(header::RANGE), file_size)?
    } else {
        None
    };

    let mut file = File::open(&abs)
        .await
        .map_err(|err| ApiError::Internal(err.to_string()))?;

    if let Some((start, end)) = range {
        let length = end - start + 1;
        debug!(path = rel, start, end, length, "range download");
        file.seek(SeekFrom::Start(start))
            .await
            .map_err(|err| ApiError::Internal(err.to_string()))?;
        headers.insert(
            header::CONTENT_RANGE,
            HeaderValue::from_str(&format!("bytes {start}-{end}/{file_size}"))
                .map_err(|_| ApiError::Internal("header build failed".into()))?,
        );
        headers.insert(
            header::CONTENT_LENGTH,
            HeaderValue::from_str(&length.to_string())
                .map_err(|_| ApiError::Internal("header build failed".into()))?,
        );
        let stream = ReaderStream::new(file.take(length));
        return Ok((StatusCode::PARTIAL_CONTENT, headers, Body::from_stream(stream))
            .into_response());
    }

    headers.insert(
        header::CONTENT_LENGTH,
        HeaderValue::from_str(&file_size.to_string())
            .map_err(|_| ApiError::Internal("header build failed".into()))?,
    );
    info!(path = rel, size = file_size, "download");
    let stream = ReaderStream::new(file);
    Ok((StatusCode::OK, headers, Body::from_stream(stream)).into_response())
}

/// Parse a single-range `Range` header against the file size.
fn parse_range(
    value: Option<&HeaderValue>,
    file_size: u64,
) -> Result<Option<(u64, u64)>, ApiError> {
    let Some(value) = value else {
        return Ok(None);
    };
    if file_size == 0 {
        return Err(ApiError::RangeNotSatisfiable(file_size));
    }
    let value = value
        .to_str()
        .map_err(|_| ApiError::BadRequest("invalid Range header".into()))?;
    let Some(range) = value.strip_prefix("bytes=") else {
        return Err(ApiError::BadRequest("invalid Range header".into()));
    };
    if range.contains(',') {
        return Err(ApiError::BadRequest("multiple ranges not supported".into()));
    }

    let (start_part, end_part) = range
        .split_once('-')
        .ok_or_else(|| ApiError::BadRequest("invalid Range header".into()))?;

    let (start, end) = if start_part.is_empty() {
        let suffix: u64 = end_part
            .parse()
            .map_err(|_| ApiError::BadRequest("invalid Range header".into()))?;
        if suffix == 0 {
            return Ok(None);
        }
        (
            file_size.saturating_sub(suffix),
            file_size.saturating_sub(1),
        )
    } else {
        let start: u64 = start_part
            .parse()
            .map_err(|_| ApiError::BadRequest("invalid Range header".into()))?;
        let end: u64 = if end_part.is_empty() {
            file_size.saturating_sub(1)
        } else {
            end_part
                .parse()
                .map_err(|_| ApiError::BadRequest("invalid Range header".into()))?
        };
        (start, end)
    };

    if start > end || start >= file_size || end >= file_size {
        return Err(ApiError::RangeNotSatisfiable(file_size));
    }
    Ok(Some((start, end)))
}

#[derive(Deserialize)]
pub(crate) struct MkdirBody {
    path: String,
}

/// `POST /api/mkdir`: recursive directory creation.
pub async fn mkdir(
    State(app): State<SharedState>,
    Extension(share): Extension<ShareName>,
    Extension(identity): Extension<Identity>,
    payload: Result<Json<MkdirBody>, JsonRejection>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let body = body_json(payload)?;
    let rel = clean_rel_path(&body.path)?;
    let view = app.view(&share.0).await;
    require(&view, &identity, Perm::Write, &rel)?;
    let abs = resolve_within_root(&view.root_path(), &rel, view.follow_symlinks()).await?;
    fs::create_dir_all(&abs)
        .await
        .map_err(|err| ApiError::Internal(format!("mkdir failed: {err}")))?;
    info!(path = rel, "mkdir");
    Ok(Json(json!({"ok": true})))
}

#[derive(Deserialize)]
pub(crate) struct RenameBody {
    from: String,
    to: String,
}

/// `POST /api/rename`: creates parent dirs of the target, then renames.
pub async fn rename(
    State(app): State<SharedState>,
    Extension(share): Extension<ShareName>,
    Extension(identity): Extension<Identity>,
    payload: Result<Json<RenameBody>, JsonRejection>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let body = body_json(payload)?;
    let from_rel = clean_rel_path(&body.from)?;
    let to_rel = clean_rel_path(&body.to)?;
    let view = app.view(&share.0).await;
    require(&view, &identity, Perm::Write, &from_rel)?;
    require(&view, &identity, Perm::Write, &to_rel)?;

    let from_abs = resolve_within_root(&view.root_path(), &from_rel, view.follow_symlinks())
        .await
        .map_err(|_| ApiError::BadRequest("bad from".into()))?;
    let to_abs = resolve_within_root(&view.root_path(), &to_rel, view.follow_symlinks())
        .await
        .map_err(|_| ApiError::BadRequest("bad to".into()))?;
    if let Some(parent) = to_abs.parent() {
        fs::create_dir_all(parent)
            .await
            .map_err(|err| ApiError::Internal(format!("mkdir failed: {err}")))?;
    }
    fs::rename(&from_abs, &to_abs)
        .await
        .map_err(|err| ApiError::Internal(format!("rename failed: {err}")))?;
    info!(from = from_rel, to = to_rel, "rename");
    Ok(Json(json!({"ok": true})))
}

/// The delete body accepts `path` only; anything else (notably a `paths`
/// array) is a client error, not something to silently ignore.
#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct DeleteBody {
    path: String,
}

/// `POST /api/delete`: recursive removal; requires admin on the path.
pub async fn delete(
    State(app): State<SharedState>,
    Extension(share): Extension<ShareName>,
    Extension(identity): Extension<Identity>,
    payload: Result<Json<DeleteBody>, JsonRejection>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let body = body_json(payload)?;
    let rel = clean_rel_path(&body.path)?;
    let view = app.view(&share.0).await;
    require(&view, &identity, Perm::Admin, &rel)?;
    let abs = resolve_within_root(&view.root_path(), &rel, view.follow_symlinks()).await?;

    match fs::symlink_metadata(&abs).await {
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => return Err(ApiError::Internal(format!("delete failed: {err}"))),
        Ok(meta) => {
            let result = if meta.is_dir() {
                fs::remove_dir_all(&abs).await
            } else {
                fs::remove_file(&abs).await
            };
            result.map_err(|err| ApiError::Internal(format!("delete failed: {err}")))?;
        }
    }
    info!(path = rel, "delete");
    Ok(Json(json!({"ok": true})))
}

#[derive(Deserialize)]
pub(crate) struct WriteBody {
    path: String,
    content: String,
    #[serde(default)]
    mode: Option<String>,
}

/// `POST /api/write`: small text writes (≤ 2 MiB), atomic replace, with
/// conflict modes against an existing destination.
pub async fn write(
    State(app): State<SharedState>,
    Extension(share): Extension<ShareName>,
    Extension(identity): Extension<Identity>,
    payload: Result<Json<WriteBody>, JsonRejection>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let body = body_json(payload)?;
    let mut rel = clean_rel_path(&body.path)?;
    if rel.is_empty() {
        return Err(ApiError::BadRequest("missing path".into()));
    }
    let mode = ConflictMode::parse(body.mode.as_deref())?;
    if body.content.len() > MAX_WRITE_BODY {
        return Err(ApiError::PayloadTooLarge);
    }
    let view = app.view(&share.0).await;
    require(&view, &identity, Perm::Write, &rel)?;

    let mut abs = resolve_within_root(&view.root_path(), &rel, view.follow_symlinks()).await?;
    if let Ok(meta) = fs::metadata(&abs).await {
        if meta.is_dir() {
            return Err(ApiError::BadRequest("is a directory".into()));
        }
        match mode {
            ConflictMode::Skip => {
                return Ok(Json(json!({"ok": true, "skipped": true, "path": rel})));
            }
            ConflictMode::Error => return Err(ApiError::Conflict("destination exists".into())),
            ConflictMode::Rename => {
                rel = unique_sibling_rel(&view, &rel).await?;
                abs = resolve_within_root(&view.root_path(), &rel, view.follow_symlinks()).await?;
            }
            ConflictMode::Overwrite => {}
        }
    }

    if let Some(parent) = abs.parent() {
        fs::create_dir_all(parent)
            .await
            .map_err(|err| ApiError::Internal(format!("mkdir failed: {err}")))?;
    }
    let mut atomic = AtomicFile::create(&abs)
        .await
        .map_err(|err| ApiError::Internal(format!("write failed: {err}")))?;
    if let Err(err) = atomic.write_all(body.content.as_bytes()).await {
        atomic.cancel().await;
        return Err(ApiError::Internal(format!("write failed: {err}")));
    }
    atomic
        .commit()
        .await
        .map_err(|err| ApiError::Internal(format!("write failed: {err}")))?;
    info!(path = rel, bytes = body.content.len(), "write file");
    Ok(Json(json!({"ok": true, "path": rel})))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header(value: &str) -> HeaderValue {
        HeaderValue::from_str(value).expect("header value")
    }

    #[test]
    fn parse_range_accepts_single_ranges() {
        assert_eq!(
            parse_range(Some(&header("bytes=0-4")), 100).expect("range"),
            Some((0, 4))
        );
        assert_eq!(
            parse_range(Some(&header("bytes=10-")), 100).expect("range"),
            Some((10, 99))
        );
        assert_eq!(
            parse_range(Some(&header("bytes=-5")), 100).expect("range"),
            Some((95, 99))
        );
        assert_eq!(parse_range(None, 100).expect("range"), None);
    }

    #[test]
    fn parse_range_rejects_bad_input() {
        assert!(parse_range(Some(&header("bytes=5-2")), 100).is_err());
        assert!(parse_range(Some(&header("bytes=0-4,10-12")), 100).is_err());
        assert!(parse_range(Some(&header("items=0-4")), 100).is_err());
        assert!(matches!(
            parse_range(Some(&header("bytes=200-300")), 100),
            Err(ApiError::RangeNotSatisfiable(100))
        ));
    }

    #[test]
    fn conflict_mode_parsing() {
        assert_eq!(
            ConflictMode::parse(None).expect("default"),
            ConflictMode::Overwrite
        );
        assert_eq!(
            ConflictMode::parse(Some(" Rename ")).expect("rename"),
            ConflictMode::Rename
        );
        assert!(ConflictMode::parse(Some("merge")).is_err());
    }

    #[test]
    fn query_escape_covers_reserved_chars() {
        assert_eq!(query_escape("a b&c.txt"), "a+b%26c.txt");
        assert_eq!(query_escape("photos/trip"), "photos%2Ftrip");
    }

    #[test]
    fn file_ext_lowercases_and_handles_dotfiles() {
        assert_eq!(file_ext("photo.JPG"), ".jpg");
        assert_eq!(file_ext("archive.tar.gz"), ".gz");
        assert_eq!(file_ext(".bashrc"), "");
        assert_eq!(file_ext("noext"), "");
    }
}
