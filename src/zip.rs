//! Zip download streaming and read-only archive peeking.
//!
//! Archives are assembled into an unlinked temp file on a blocking thread
//! and streamed from there, so memory use stays flat regardless of size.

use axum::body::{Body, Bytes};
use axum::extract::{Extension, Query, State};
use axum::http::{HeaderMap, HeaderValue, header};
use axum::response::{IntoResponse, Json, Response};
use serde::Deserialize;
use serde_json::json;
use std::collections::HashMap;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::PathBuf;
use tokio::fs;
use tokio_util::io::ReaderStream;
use tracing::{debug, info};
use walkdir::WalkDir;
use zip::CompressionMethod;
use zip::read::ZipArchive;
use zip::write::{SimpleFileOptions, ZipWriter};

use crate::auth::{Identity, Perm, require};
use crate::config::{ZIP_LIST_MAX_ENTRIES, ZIP_NAME_MAX_LEN, ZIP_PATH_MAX_LEN};
use crate::error::ApiError;
use crate::files::content_type_for_name;
use crate::fsutil::{clamp_rel_path, clean_rel_path, resolve_within_root};
use crate::shares::{ShareName, SharedState};

/// Sanitize a name that becomes an entry path inside an archive: forward
/// slashes only, no NUL, no `..`, bounded length.
fn sanitize_zip_path(p: &str) -> String {
    let mut p = clamp_rel_path(p);
    if p.len() > ZIP_PATH_MAX_LEN {
        p.truncate(ZIP_PATH_MAX_LEN);
    }
    p
}

/// Sanitize the archive's own download name.
fn sanitize_zip_base_name(name: &str) -> String {
    let name = name.trim();
    let name = name.strip_suffix(".zip").unwrap_or(name);
    let name = name
        .replace('\0', "")
        .replace(['/', '\\'], "-");
    let mut name = name.trim_matches(['.', ' ']).to_string();
    if name.is_empty() {
        return "download".to_string();
    }
    if name.len() > ZIP_NAME_MAX_LEN {
        name.truncate(ZIP_NAME_MAX_LEN);
    }
    name
}

fn base_name(rel: &str) -> &str {
    rel.rsplit('/').next().unwrap_or(rel)
}

/// De-duplicate top-level entry names with a ` (N)` counter before the
/// extension.
fn unique_top(used: &mut HashMap<String, u32>, base: &str) -> String {
    let base = sanitize_zip_path(base);
    let base = if base.is_empty() {
        "item".to_string()
    } else {
        base
    };
    let counter = used.entry(base.clone()).or_insert(0);
    let n = *counter;
    *counter += 1;
    if n == 0 {
        return base;
    }
    let (stem, ext) = match base.rfind('.') {
        Some(0) | None => (base.as_str(), ""),
        Some(i) => (&base[..i], &base[i..]),
    };
    format!("{stem} ({n}){ext}")
}

#[derive(Deserialize)]
pub(crate) struct ZipQuery {
    path: Option<String>,
}

#[derive(Deserialize)]
struct ZipPostBody {
    #[serde(default)]
    paths: Vec<String>,
    #[serde(default)]
    name: String,
}

/// `GET /api/zip?path=`: one path, streamed as a zip.
pub async fn zip_get(
    State(app): State<SharedState>,
    Extension(share): Extension<ShareName>,
    Extension(identity): Extension<Identity>,
    Query(query): Query<ZipQuery>,
) -> Result<Response, ApiError> {
    let rel = clean_rel_path(query.path.as_deref().unwrap_or(""))?;
    if rel.is_empty() {
        return Err(ApiError::BadRequest("missing path".into()));
    }
    let name = base_name(&rel).to_string();
    stream_zip(&app, &share.0, &identity, vec![rel], name).await
}

/// `POST /api/zip`: multi-select: JSON `{paths, name}`, a form with
/// repeated `paths`, or the `?path=` fallback.
pub async fn zip_post(
    State(app): State<SharedState>,
    Extension(share): Extension<ShareName>,
    Extension(identity): Extension<Identity>,
    Query(query): Query<ZipQuery>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");

    let mut paths = Vec::new();
    let mut name = String::new();
    if content_type.contains("application/json") {
        let parsed: ZipPostBody =
            serde_json::from_slice(&body).map_err(|_| ApiError::BadRequest("bad json".into()))?;
        for p in parsed.paths {
            let p = clean_rel_path(&p)?;
            if !p.is_empty() {
                paths.push(p);
            }
        }
        name = parsed.name.trim().to_string();
    } else {
        for (key, value) in form_urlencoded::parse(&body) {
            match key.as_ref() {
                "paths" => {
                    let p = clean_rel_path(&value)?;
                    if !p.is_empty() {
                        paths.push(p);
                    }
                }
                "name" => name = value.trim().to_string(),
                _ => {}
            }
        }
        if paths.is_empty()
            && let Some(p) = query.path.as_deref()
        {
            let p = clean_rel_path(p)?;
            if !p.is_empty() {
                paths.push(p);
            }
        }
    }
    if paths.is_empty() {
        return Err(ApiError::BadRequest("missing paths".into()));
    }
    if name.is_empty() {
        name = if paths.len() == 1 {
            base_name(&paths[0]).to_string()
        } else {
            "download".to_string()
        };
    }
    stream_zip(&app, &share.0, &identity, paths, name).await
}

async fn stream_zip(
    app: &SharedState,
    share: &str,
    identity: &Identity,
    paths: Vec<String>,
    name: String,
) -> Result<Response, ApiError> {
    let view = app.view(share).await;
    for rel in &paths {
        require(&view, identity, Perm::Read, rel)?;
    }

    let mut items = Vec::with_capacity(paths.len());
    for rel in paths {
        let abs = resolve_within_root(&view.root_path(), &rel, view.follow_symlinks()).await?;
        let meta = fs::metadata(&abs)
            .await
            .map_err(|_| ApiError::NotFound("not found".into()))?;
        items.push((rel, abs, meta.is_dir()));
    }

    let name = sanitize_zip_base_name(&name);
    info!(name, items = items.len(), "zip download");
    let (file, size) = tokio::task::spawn_blocking(move || build_zip(items))
        .await
        .map_err(|err| ApiError::Internal(err.to_string()))?
        .map_err(|err| ApiError::Internal(format!("zip failed: {err}")))?;

    let mut headers = HeaderMap::new();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/zip"),
    );
    headers.insert(
        header::CONTENT_LENGTH,
        HeaderValue::from_str(&size.to_string())
            .map_err(|_| ApiError::Internal("header build failed".into()))?,
    );
    headers.insert(
        header::CONTENT_DISPOSITION,
        HeaderValue::from_str(&format!("attachment; filename=\"{name}.zip\""))
            .map_err(|_| ApiError::Internal("header build failed".into()))?,
    );
    let stream = ReaderStream::new(fs::File::from_std(file));
    Ok((headers, Body::from_stream(stream)).into_response())
}

fn build_zip(items: Vec<(String, PathBuf, bool)>) -> std::io::Result<(std::fs::File, u64)> {
    let spool = tempfile::tempfile()?;
    let mut writer = ZipWriter::new(spool);
    let options = SimpleFileOptions::default()
        .compression_method(CompressionMethod::Deflated)
        .unix_permissions(0o644);

    let mut used: HashMap<String, u32> = HashMap::new();
    for (rel, abs, is_dir) in items {
        let top = unique_top(&mut used, base_name(&rel));
        if !is_dir {
            add_file(&mut writer, options, &abs, &top)?;
            continue;
        }
        for entry in WalkDir::new(&abs).follow_links(false) {
            let Ok(entry) = entry else { continue };
            if entry.path_is_symlink() || entry.file_type().is_dir() {
                continue;
            }
            let Ok(inner) = entry.path().strip_prefix(&abs) else {
                continue;
            };
            let zip_path =
                sanitize_zip_path(&format!("{top}/{}", inner.to_string_lossy().replace('\\', "/")));
            if zip_path.is_empty() {
                continue;
            }
            add_file(&mut writer, options, entry.path(), &zip_path)?;
        }
    }

    let mut file = writer.finish().map_err(std::io::Error::other)?;
    let size = file.stream_position()?;
    file.seek(SeekFrom::Start(0))?;
    Ok((file, size))
}

fn add_file(
    writer: &mut ZipWriter<std::fs::File>,
    options: SimpleFileOptions,
    path: &std::path::Path,
    zip_path: &str,
) -> std::io::Result<()> {
    // Sources that vanish or refuse to open are skipped, not fatal.
    let Ok(mut file) = std::fs::File::open(path) else {
        debug!(path = %path.display(), "skipping unreadable zip source");
        return Ok(());
    };
    writer
        .start_file(zip_path, options)
        .map_err(std::io::Error::other)?;
    std::io::copy(&mut file, writer)?;
    Ok(())
}

#[derive(Deserialize)]
pub(crate) struct ZipListQuery {
    path: Option<String>,
}

/// `GET /api/zipls?path=`: list entries of a stored `.zip` (capped).
pub async fn zip_list(
    State(app): State<SharedState>,
    Extension(share): Extension<ShareName>,
    Extension(identity): Extension<Identity>,
    Query(query): Query<ZipListQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let rel = clean_rel_path(query.path.as_deref().unwrap_or(""))?;
    if rel.is_empty() {
        return Err(ApiError::BadRequest("missing path".into()));
    }
    let view = app.view(&share.0).await;
    require(&view, &identity, Perm::Read, &rel)?;
    let abs = open_zip_target(&view, &rel).await?;

    let (entries, truncated) = tokio::task::spawn_blocking(move || -> Result<_, ApiError> {
        let file = std::fs::File::open(&abs)
            .map_err(|err| ApiError::BadRequest(format!("open zip failed: {err}")))?;
        let mut archive = ZipArchive::new(file)
            .map_err(|err| ApiError::BadRequest(format!("open zip failed: {err}")))?;
        let truncated = archive.len() > ZIP_LIST_MAX_ENTRIES;
        let mut out = Vec::with_capacity(archive.len().min(256));
        for index in 0..archive.len().min(ZIP_LIST_MAX_ENTRIES) {
            let entry = archive
                .by_index(index)
                .map_err(|err| ApiError::BadRequest(format!("open zip failed: {err}")))?;
            out.push(json!({
                "name": entry.name(),
                "isDir": entry.is_dir() || entry.name().ends_with('/'),
                "size": entry.size(),
                "csize": entry.compressed_size(),
                "mtime": entry.last_modified().map(zip_datetime_unix).unwrap_or(0),
            }));
        }
        Ok((out, truncated))
    })
    .await
    .map_err(|err| ApiError::Internal(err.to_string()))??;

    Ok(Json(json!({
        "path": rel,
        "entries": entries,
        "truncated": truncated,
    })))
}

#[derive(Deserialize)]
pub(crate) struct ZipGetQuery {
    path: Option<String>,
    entry: Option<String>,
}

/// `GET /api/zipget?path=&entry=`: stream one entry out of a stored zip.
pub async fn zip_entry(
    State(app): State<SharedState>,
    Extension(share): Extension<ShareName>,
    Extension(identity): Extension<Identity>,
    Query(query): Query<ZipGetQuery>,
) -> Result<Response, ApiError> {
    let rel = clean_rel_path(query.path.as_deref().unwrap_or(""))?;
    let entry_name = query.entry.as_deref().unwrap_or("").trim().to_string();
    if rel.is_empty() || entry_name.is_empty() {
        return Err(ApiError::BadRequest("missing params".into()));
    }
    let view = app.view(&share.0).await;
    require(&view, &identity, Perm::Read, &rel)?;
    let abs = open_zip_target(&view, &rel).await?;

    let wanted = entry_name.clone();
    let (file, size) = tokio::task::spawn_blocking(move || -> Result<_, ApiError> {
        let source = std::fs::File::open(&abs)
            .map_err(|err| ApiError::BadRequest(format!("open zip failed: {err}")))?;
        let mut archive = ZipArchive::new(source)
            .map_err(|err| ApiError::BadRequest(format!("open zip failed: {err}")))?;
        let mut entry = archive
            .by_name(&wanted)
            .map_err(|_| ApiError::NotFound("not found".into()))?;
        if entry.is_dir() {
            return Err(ApiError::BadRequest("is a directory".into()));
        }
        let mut spool = tempfile::tempfile().map_err(|err| ApiError::Internal(err.to_string()))?;
        let mut buf = [0u8; 64 * 1024];
        let mut size: u64 = 0;
        loop {
            let read = entry
                .read(&mut buf)
                .map_err(|err| ApiError::BadRequest(format!("open entry failed: {err}")))?;
            if read == 0 {
                break;
            }
            spool
                .write_all(&buf[..read])
                .map_err(|err| ApiError::Internal(err.to_string()))?;
            size += read as u64;
        }
        spool
            .seek(SeekFrom::Start(0))
            .map_err(|err| ApiError::Internal(err.to_string()))?;
        Ok((spool, size))
    })
    .await
    .map_err(|err| ApiError::Internal(err.to_string()))??;

    let mut file_name = base_name(&entry_name.replace('\\', "/")).to_string();
    if file_name.is_empty() || file_name == "." {
        file_name = "file".to_string();
    }
    let mut headers = HeaderMap::new();
    let mime = content_type_for_name(&file_name);
    if !mime.is_empty() {
        headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_str(&mime)
                .map_err(|_| ApiError::Internal("header build failed".into()))?,
        );
    }
    headers.insert(
        header::CONTENT_LENGTH,
        HeaderValue::from_str(&size.to_string())
            .map_err(|_| ApiError::Internal("header build failed".into()))?,
    );
    headers.insert(
        header::CONTENT_DISPOSITION,
        HeaderValue::from_str(&format!(
            "attachment; filename=\"{}\"",
            file_name.replace('"', "'")
        ))
        .map_err(|_| ApiError::Internal("header build failed".into()))?,
    );
    let stream = ReaderStream::new(fs::File::from_std(file));
    Ok((headers, Body::from_stream(stream)).into_response())
}

async fn open_zip_target(
    view: &crate::shares::ShareView,
    rel: &str,
) -> Result<PathBuf, ApiError> {
    let abs = resolve_within_root(&view.root_path(), rel, view.follow_symlinks()).await?;
    let meta = fs::metadata(&abs)
        .await
        .map_err(|_| ApiError::NotFound("not found".into()))?;
    if meta.is_dir() {
        return Err(ApiError::NotFound("not found".into()));
    }
    if !rel.to_ascii_lowercase().ends_with(".zip") {
        return Err(ApiError::BadRequest("not a zip".into()));
    }
    Ok(abs)
}

fn zip_datetime_unix(dt: zip::DateTime) -> i64 {
    let (year, month, day) = (dt.year() as i64, dt.month() as i64, dt.day() as i64);
    let year_adj = if month <= 2 { year - 1 } else { year };
    let era = year_adj.div_euclid(400);
    let yoe = year_adj - era * 400;
    let month_shifted = (month + 9) % 12;
    let doy = (153 * month_shifted + 2) / 5 + day - 1;
    let doe = yoe * 365 + yoe / 4 - yoe / 100 + doy;
    let days = era * 146097 + doe - 719468;
    days * 86400 + dt.hour() as i64 * 3600 + dt.minute() as i64 * 60 + dt.second() as i64
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn sanitize_zip_path_blocks_escapes() {
        assert_eq!(sanitize_zip_path("../../etc/passwd"), "etc/passwd");
        assert_eq!(sanitize_zip_path("a\\b\\c.txt"), "a/b/c.txt");
        assert_eq!(sanitize_zip_path("a\0b"), "ab");
        let long = "x".repeat(500);
        assert_eq!(sanitize_zip_path(&long).len(), ZIP_PATH_MAX_LEN);
    }

    #[test]
    fn sanitize_base_name_defaults_and_trims() {
        assert_eq!(sanitize_zip_base_name("  report.zip "), "report");
        assert_eq!(sanitize_zip_base_name("a/b\\c"), "a-b-c");
        assert_eq!(sanitize_zip_base_name("..."), "download");
        assert_eq!(sanitize_zip_base_name(""), "download");
    }

    #[test]
    fn unique_top_suffixes_before_extension() {
        let mut used = HashMap::new();
        assert_eq!(unique_top(&mut used, "report.txt"), "report.txt");
        assert_eq!(unique_top(&mut used, "report.txt"), "report (1).txt");
        assert_eq!(unique_top(&mut used, "report.txt"), "report (2).txt");
        assert_eq!(unique_top(&mut used, "notes"), "notes");
        assert_eq!(unique_top(&mut used, "notes"), "notes (1)");
    }

    #[test]
    fn build_zip_walks_directories_and_round_trips() {
        let temp = tempdir().expect("tempdir");
        let dir = temp.path().join("docs");
        std::fs::create_dir_all(dir.join("sub")).expect("dirs");
        std::fs::write(dir.join("a.txt"), b"alpha").expect("write");
        std::fs::write(dir.join("sub/b.txt"), b"beta").expect("write");
        let single = temp.path().join("docs/a.txt");

        let (file, size) = build_zip(vec![
            ("docs".into(), dir.clone(), true),
            ("docs/a.txt".into(), single, false),
        ])
        .expect("build");
        assert!(size > 0);

        let mut archive = ZipArchive::new(file).expect("read back");
        let names: Vec<String> = (0..archive.len())
            .map(|i| archive.by_index(i).expect("entry").name().to_string())
            .collect();
        assert!(names.contains(&"docs/a.txt".to_string()));
        assert!(names.contains(&"docs/sub/b.txt".to_string()));
        assert!(names.contains(&"a.txt".to_string()));

        let mut entry = archive.by_name("docs/sub/b.txt").expect("entry");
        let mut content = String::new();
        entry.read_to_string(&mut content).expect("read entry");
        assert_eq!(content, "beta");
    }

    #[test]
    fn zip_datetime_conversion() {
        let dt = zip::DateTime::from_date_and_time(2024, 1, 1, 0, 0, 0).expect("datetime");
        assert_eq!(zip_datetime_unix(dt), 1_704_067_200);
    }
}
