//! Embedded browser UI shell and static assets.

use axum::body::Body;
use axum::extract::{Extension, Path as UrlPath, State};
use axum::http::{HeaderMap, HeaderValue, header};
use axum::response::{IntoResponse, Redirect, Response};
use rust_embed::RustEmbed;

use crate::auth::{Identity, Perm, allowed, should_challenge};
use crate::error::ApiError;
use crate::shares::{ShareName, SharedState};

#[derive(RustEmbed)]
#[folder = "web"]
struct WebAssets;

const FAVICON_SVG: &str = r##"<?xml version="1.0" encoding="UTF-8"?>
<svg xmlns="http://www.w3.org/2000/svg" width="64" height="64" viewBox="0 0 64 64">
  <rect x="2" y="2" width="60" height="60" rx="14" fill="#eef2ff" stroke="#cbd5e1" stroke-width="2"/>
  <g fill="none" stroke="#2563eb" stroke-linecap="round" stroke-linejoin="round" stroke-width="3">
    <path d="M24 18h8l5 5h13a6 6 0 0 1 6 6v16a6 6 0 0 1-6 6H24a6 6 0 0 1-6-6V24a6 6 0 0 1 6-6"/>
    <path d="M46 45v5a6 6 0 0 1-6 6H16a6 6 0 0 1-6-6V28a6 6 0 0 1 6-6h6"/>
  </g>
</svg>"##;

fn embedded_page(name: &str) -> Result<Response, ApiError> {
    let asset = WebAssets::get(name)
        .ok_or_else(|| ApiError::Internal(format!("missing ui: {name}")))?;
    let mut headers = HeaderMap::new();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/html; charset=utf-8"),
    );
    Ok((headers, Body::from(asset.data.into_owned())).into_response())
}

/// `GET /`: the browser shell.
pub async fn index_page() -> Result<Response, ApiError> {
    embedded_page("index.html")
}

/// `GET /admin`: admin panel; gated like the admin API, but anonymous
/// optional-auth visitors are bounced to a friendly page instead of a 403.
pub async fn admin_page(
    State(app): State<SharedState>,
    Extension(share): Extension<ShareName>,
    Extension(identity): Extension<Identity>,
) -> Result<Response, ApiError> {
    let view = app.view(&share.0).await;
    if !allowed(&view, &identity.0, "/admin", Perm::Admin) {
        if should_challenge(&view, &identity) {
            return Err(ApiError::Unauthorized);
        }
        return Ok(Redirect::to("/unauthorized").into_response());
    }
    embedded_page("admin.html")
}

/// `GET /unauthorized`.
pub async fn unauthorized_page() -> Result<Response, ApiError> {
    embedded_page("unauthorized.html")
}

/// `GET /assets/<path>`: embedded static files; cacheable for an hour (set
/// by the response-header middleware).
pub async fn asset(UrlPath(path): UrlPath<String>) -> Result<Response, ApiError> {
    if path.contains("..") {
        return Err(ApiError::NotFound("not found".into()));
    }
    let asset = WebAssets::get(&format!("assets/{path}"))
        .ok_or_else(|| ApiError::NotFound("not found".into()))?;
    let mime = mime_guess::from_path(&path).first_or_octet_stream();
    let mut headers = HeaderMap::new();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_str(mime.essence_str())
            .map_err(|_| ApiError::Internal("invalid mime type".into()))?,
    );
    Ok((headers, Body::from(asset.data.into_owned())).into_response())
}

/// `GET /favicon.ico`: a small inline SVG mark, no binary blob to embed.
pub async fn favicon() -> Response {
    let mut headers = HeaderMap::new();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("image/svg+xml; charset=utf-8"),
    );
    headers.insert(
        header::CACHE_CONTROL,
        HeaderValue::from_static("public, max-age=31536000, immutable"),
    );
    (headers, FAVICON_SVG).into_response()
}
