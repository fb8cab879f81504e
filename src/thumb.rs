//! Thumbnail pipeline: single-flight production with a bounded worker pool
//! and an on-disk JPEG cache.
//!
//! For one cache key only a single producer ever runs; concurrent requests
//! for the same key wait for its result. Independently, a small semaphore
//! caps the number of producers executing at once, whatever their keys.

use axum::body::Body;
use axum::extract::{Extension, Query, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::{Rgb, RgbImage};
use serde::Deserialize;
use std::collections::HashMap;
use std::io::Cursor;
use std::path::Path;
use std::sync::{Arc, Mutex as StdMutex};
use tokio::fs;
use tokio::sync::{Mutex, OwnedMutexGuard, Semaphore};
use tracing::debug;

use crate::auth::{Identity, Perm, require};
use crate::config::{THUMB_DEFAULT_DIM, THUMB_MAX_DIM, THUMB_MIN_DIM, THUMB_WORKERS};
use crate::error::ApiError;
use crate::files::unix_mtime;
use crate::fsutil::{clean_rel_path, resolve_within_root};
use crate::shares::{ShareName, SharedState};

const JPEG_QUALITY: u8 = 82;
const TEXT_THUMB_MAX_BYTES: usize = 16 * 1024;
const TEXT_THUMB_MAX_LINES: usize = 16;

pub(crate) fn is_image_ext(ext: &str) -> bool {
    matches!(ext, ".jpg" | ".jpeg" | ".png" | ".gif" | ".webp")
}

pub(crate) fn is_text_ext(ext: &str) -> bool {
    matches!(
        ext,
        ".txt"
            | ".log"
            | ".md"
            | ".json"
            | ".yaml"
            | ".yml"
            | ".toml"
            | ".ini"
            | ".cfg"
            | ".conf"
            | ".go"
            | ".js"
            | ".ts"
            | ".tsx"
            | ".jsx"
            | ".py"
            | ".rs"
            | ".java"
            | ".c"
            | ".h"
            | ".cpp"
            | ".hpp"
            | ".sh"
            | ".css"
            | ".html"
    )
}

type ThumbResult = Result<Vec<u8>, String>;
type Slot = Arc<Mutex<Option<ThumbResult>>>;

pub struct ThumbPipeline {
    inflight: StdMutex<HashMap<String, Slot>>,
    workers: Semaphore,
}

enum Role {
    Leader(OwnedMutexGuard<Option<ThumbResult>>),
    Waiter(Slot),
}

/// Removes an in-flight key even if the leading request is dropped
/// mid-production.
struct KeyCleanup<'a> {
    pipeline: &'a ThumbPipeline,
    key: String,
}

impl Drop for KeyCleanup<'_> {
    fn drop(&mut self) {
        let mut map = self
            .pipeline
            .inflight
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        map.remove(&self.key);
    }
}

impl ThumbPipeline {
    pub fn new() -> Self {
        Self {
            inflight: StdMutex::new(HashMap::new()),
            workers: Semaphore::new(THUMB_WORKERS),
        }
    }

    /// Run `produce` for `key`, coalescing with any in-flight production of
    /// the same key and respecting the worker cap.
    pub async fn run<F, Fut>(&self, key: &str, produce: F) -> ThumbResult
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = ThumbResult>,
    {
        let role = {
            let mut map = self.inflight.lock().unwrap_or_else(|e| e.into_inner());
            match map.get(key) {
                Some(slot) => Role::Waiter(slot.clone()),
                None => {
                    let slot: Slot = Arc::new(Mutex::new(None));
                    match slot.clone().try_lock_owned() {
                        Ok(guard) => {
                            map.insert(key.to_string(), slot);
                            Role::Leader(guard)
                        }
                        Err(_) => Role::Waiter(slot),
                    }
                }
            }
        };

        match role {
            Role::Leader(mut guard) => {
                let _cleanup = KeyCleanup {
                    pipeline: self,
                    key: key.to_string(),
                };
                let result = match self.workers.acquire().await {
                    Ok(_permit) => produce().await,
                    Err(_) => Err("thumbnail workers unavailable".to_string()),
                };
                *guard = Some(result.clone());
                result
            }
            Role::Waiter(slot) => {
                let guard = slot.lock().await;
                guard
                    .clone()
                    .unwrap_or_else(|| Err("thumbnail unavailable".to_string()))
            }
        }
    }
}

impl Default for ThumbPipeline {
    fn default() -> Self {
        Self::new()
    }
}

fn safe_key(rel: &str) -> String {
    let key = rel.replace(['/', '\\'], "_").replace("..", "_");
    if key.is_empty() { "root".to_string() } else { key }
}

fn clamp_dim(requested: Option<&str>) -> u32 {
    requested
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .and_then(|v| v.parse::<u32>().ok())
        .map(|n| n.clamp(THUMB_MIN_DIM, THUMB_MAX_DIM))
        .unwrap_or(THUMB_DEFAULT_DIM)
}

#[derive(Deserialize)]
pub(crate) struct ThumbQuery {
    path: Option<String>,
    s: Option<String>,
    t: Option<String>,
}

/// `GET /thumb?path=&s=&t=`: serve a cached thumbnail or produce one.
/// Production errors degrade to `404` so the UI can fall back to icons.
pub async fn thumb(
    State(app): State<SharedState>,
    Extension(share): Extension<ShareName>,
    Extension(identity): Extension<Identity>,
    Query(query): Query<ThumbQuery>,
    request_headers: HeaderMap,
) -> Result<Response, ApiError> {
    let rel = clean_rel_path(query.path.as_deref().unwrap_or(""))?;
    let view = app.view(&share.0).await;
    require(&view, &identity, Perm::Read, &rel)?;

    let abs = resolve_within_root(&view.root_path(), &rel, view.follow_symlinks()).await?;
    let meta = fs::metadata(&abs)
        .await
        .map_err(|_| ApiError::NotFound("not found".into()))?;
    if meta.is_dir() {
        return Err(ApiError::NotFound("not found".into()));
    }

    let kind = query
        .t
        .as_deref()
        .map(|t| t.trim().to_ascii_lowercase())
        .unwrap_or_default();
    let ext = crate::files::file_ext(rel.rsplit('/').next().unwrap_or(&rel));
    let is_text = kind == "txt" && is_text_ext(&ext);
    if !is_image_ext(&ext) && !is_text {
        return Err(ApiError::NotFound("not found".into()));
    }
    let max = clamp_dim(query.s.as_deref());

    let thumb_dir = view.state_dir().join("thumbs");
    let _ = fs::create_dir_all(&thumb_dir).await;
    let key = format!("{}-{}-{}-{}", safe_key(&rel), unix_mtime(&meta), max, kind);
    let thumb_path = thumb_dir.join(format!("{key}.jpg"));

    let etag = format!("\"{key}\"");
    let mut headers = HeaderMap::new();
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("image/jpeg"));
    headers.insert(
        header::ETAG,
        HeaderValue::from_str(&etag).map_err(|_| ApiError::Internal("header build failed".into()))?,
    );
    headers.insert(
        header::CACHE_CONTROL,
        HeaderValue::from_static("public, max-age=31536000, immutable"),
    );

    if request_headers
        .get(header::IF_NONE_MATCH)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value.contains(&etag))
    {
        return Ok((StatusCode::NOT_MODIFIED, headers).into_response());
    }

    if let Ok(cached) = fs::read(&thumb_path).await {
        return Ok((headers, Body::from(cached)).into_response());
    }

    let source = abs.clone();
    let produced = app
        .thumbs
        .run(&key, || async move {
            tokio::task::spawn_blocking(move || {
                if is_text {
                    make_text_thumb(&source, max)
                } else {
                    make_image_thumb(&source, max)
                }
            })
            .await
            .map_err(|err| err.to_string())?
        })
        .await;
    let bytes = match produced {
        Ok(bytes) => bytes,
        Err(err) => {
            debug!(path = rel, error = err, "thumbnail production failed");
            return Err(ApiError::NotFound("not found".into()));
        }
    };
    let _ = fs::write(&thumb_path, &bytes).await;
    Ok((headers, Body::from(bytes)).into_response())
}

fn encode_jpeg(img: &RgbImage) -> ThumbResult {
    let mut out = Cursor::new(Vec::new());
    let encoder = JpegEncoder::new_with_quality(&mut out, JPEG_QUALITY);
    img.write_with_encoder(encoder).map_err(|e| e.to_string())?;
    Ok(out.into_inner())
}

fn make_image_thumb(path: &Path, max: u32) -> ThumbResult {
    let img = image::ImageReader::open(path)
        .map_err(|e| e.to_string())?
        .with_guessed_format()
        .map_err(|e| e.to_string())?
        .decode()
        .map_err(|e| e.to_string())?;
    let (w, h) = (img.width(), img.height());
    if w == 0 || h == 0 {
        return Err("empty image".into());
    }
    let scaled = if w.max(h) > max {
        img.resize(max, max, FilterType::CatmullRom)
    } else {
        img
    };
    encode_jpeg(&scaled.to_rgb8())
}

/// Render the head of a text file (16 KiB / 16 lines) as a dark card with
/// one bar per line, scaled to line length.
fn make_text_thumb(path: &Path, max: u32) -> ThumbResult {
    let mut data = std::fs::read(path).map_err(|e| e.to_string())?;
    data.truncate(TEXT_THUMB_MAX_BYTES);
    let text = String::from_utf8_lossy(&data).replace("\r\n", "\n");
    let lines: Vec<&str> = text.lines().take(TEXT_THUMB_MAX_LINES).collect();

    let bg = Rgb([0x0b, 0x12, 0x20]);
    let fg = Rgb([0xe2, 0xe8, 0xf0]);
    let muted = Rgb([0x94, 0xa3, 0xb8]);
    let mut img = RgbImage::from_pixel(max, max, bg);

    let name_len = path
        .file_name()
        .map(|n| n.to_string_lossy().chars().count())
        .unwrap_or(4)
        .min(32);
    fill_bar(&mut img, 10, 12, (name_len as u32) * 7, 8, fg);

    let mut y = 32u32;
    for line in lines {
        let trimmed = line.trim_end();
        if !trimmed.is_empty() {
            let width = (trimmed.chars().count().min(120) as u32) * 5;
            fill_bar(&mut img, 10, y, width, 6, muted);
        }
        y += 12;
        if y + 10 > max {
            break;
        }
    }
    encode_jpeg(&img)
}

fn fill_bar(img: &mut RgbImage, x: u32, y: u32, width: u32, height: u32, color: Rgb<u8>) {
    let max_x = img.width().saturating_sub(10);
    let max_y = img.height();
    for py in y..(y + height).min(max_y) {
        for px in x..(x + width).min(max_x) {
            img.put_pixel(px, py, color);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tempfile::tempdir;

    #[tokio::test]
    async fn equal_keys_share_one_producer() {
        let pipeline = Arc::new(ThumbPipeline::new());
        let calls = Arc::new(AtomicUsize::new(0));

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let pipeline = pipeline.clone();
            let calls = calls.clone();
            tasks.push(tokio::spawn(async move {
                pipeline
                    .run("same-key", || async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        Ok(vec![1, 2, 3])
                    })
                    .await
            }));
        }
        for task in tasks {
            let result = task.await.expect("join").expect("thumb");
            assert_eq!(result, vec![1, 2, 3]);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn different_keys_run_independently() {
        let pipeline = Arc::new(ThumbPipeline::new());
        let calls = Arc::new(AtomicUsize::new(0));
        for key in ["a", "b", "c"] {
            let calls = calls.clone();
            pipeline
                .run(key, || async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(vec![])
                })
                .await
                .expect("thumb");
        }
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn failed_production_is_shared_then_retryable() {
        let pipeline = ThumbPipeline::new();
        let err = pipeline
            .run("bad", || async { Err("decode failed".to_string()) })
            .await
            .expect_err("must fail");
        assert_eq!(err, "decode failed");

        // The key was released; a later request may try again.
        let ok = pipeline.run("bad", || async { Ok(vec![9]) }).await;
        assert_eq!(ok.expect("retry"), vec![9]);
    }

    #[test]
    fn clamp_dim_bounds_requests() {
        assert_eq!(clamp_dim(None), THUMB_DEFAULT_DIM);
        assert_eq!(clamp_dim(Some("32")), THUMB_MIN_DIM);
        assert_eq!(clamp_dim(Some("4096")), THUMB_MAX_DIM);
        assert_eq!(clamp_dim(Some("300")), 300);
        assert_eq!(clamp_dim(Some("junk")), THUMB_DEFAULT_DIM);
    }

    #[test]
    fn safe_key_flattens_separators() {
        assert_eq!(safe_key("a/b/c.jpg"), "a_b_c.jpg");
        assert_eq!(safe_key(""), "root");
        assert_eq!(safe_key("a..b"), "a_b");
    }

    #[test]
    fn text_thumb_produces_jpeg() {
        let temp = tempdir().expect("tempdir");
        let path = temp.path().join("sample.txt");
        std::fs::write(&path, "fn main() {}\n\nlet x = 1;\n").expect("write");
        let bytes = make_text_thumb(&path, 256).expect("thumb");
        assert_eq!(&bytes[..2], &[0xff, 0xd8], "jpeg magic");
    }

    #[test]
    fn image_thumb_downscales() {
        let temp = tempdir().expect("tempdir");
        let path = temp.path().join("big.png");
        let big = RgbImage::from_pixel(800, 400, Rgb([10, 20, 30]));
        big.save(&path).expect("save png");

        let bytes = make_image_thumb(&path, 128).expect("thumb");
        let decoded = image::load_from_memory(&bytes).expect("decode");
        assert_eq!(decoded.width(), 128);
        assert_eq!(decoded.height(), 64);
    }
}
