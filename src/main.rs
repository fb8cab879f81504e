//! lanparty server binary.
//!
//! A self-hosted LAN file server: shares local directory trees over HTTP
//! for browsing, download, and resumable upload, and speaks WebDAV against
//! the same trees. This entry point parses the CLI/environment, loads and
//! normalizes the JSON configuration, assembles the axum router, and runs
//! the listener until shutdown.

mod admin;
mod assets;
mod atomic;
mod auth;
mod config;
mod dedup;
mod error;
mod etag;
mod files;
mod fsutil;
mod http;
mod logging;
mod search;
mod shares;
mod thumb;
mod transfer;
mod upload;
mod webdav;
mod webdav_lock;
mod zip;

use axum::Router;
use axum::extract::connect_info::ConnectInfo;
use axum::extract::DefaultBodyLimit;
use axum::http::{Request, header};
use axum::middleware;
use axum::response::IntoResponse;
use axum::routing::{any, get, post};
use axum_server::Handle;
use clap::Parser;
use shadow_rs::shadow;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tower_http::compression::CompressionLayer;
use tower_http::trace::{DefaultOnRequest, DefaultOnResponse, TraceLayer};
use tracing::{Level, info, info_span};

use crate::config::{Args, BCRYPT_MAX_COST, BCRYPT_MIN_COST, Command, Config};
use crate::shares::{AppState, SharedState};

shadow!(build);

#[tokio::main]
async fn main() -> Result<(), io::Error> {
    logging::init_logging();
    let args = Args::parse();

    if let Some(Command::Passwd { password, cost }) = args.command {
        return passwd(&password, cost);
    }

    let mut cfg = match &args.config {
        Some(path) => {
            let raw = std::fs::read(path)
                .map_err(|err| io::Error::other(format!("read config: {err}")))?;
            serde_json::from_slice::<Config>(&raw)
                .map_err(|err| io::Error::other(format!("parse config: {err}")))?
        }
        None => Config::default(),
    };
    // CLI and environment beat the config file.
    if let Some(root) = args.root.clone() {
        cfg.root = root;
    }
    if let Some(state_dir) = args.state.clone() {
        cfg.state_dir = state_dir;
    }
    if args.follow_symlinks {
        cfg.follow_symlinks = true;
    }
    if args.config.is_none() && cfg.root.trim().is_empty() {
        return Err(io::Error::other("missing --root (or provide --config)"));
    }
    let cfg = config::normalize(cfg, args.portable)?;

    let state: SharedState = Arc::new(AppState::new(
        cfg.clone(),
        args.config.clone(),
        args.portable,
    ));
    let app = build_router(state, args.disable_admin);

    let addr: SocketAddr = args.addr.parse().map_err(|err| {
        io::Error::new(io::ErrorKind::InvalidInput, format!("listen address: {err}"))
    })?;
    let handle = Handle::new();

    info!("lanparty listening on http://{addr} (root={})", cfg.root);
    info!("webdav endpoint: http://{addr}/dav/ (use BasicAuth if configured)");

    let server = axum_server::bind(addr)
        .handle(handle.clone())
        .serve(app.into_make_service_with_connect_info::<SocketAddr>());
    tokio::select! {
        result = server => result?,
        _ = shutdown_signal(handle) => {}
    }
    Ok(())
}

fn passwd(password: &str, cost: u32) -> Result<(), io::Error> {
    if password.is_empty() {
        return Err(io::Error::other("usage: lanparty passwd -p <password>"));
    }
    if !(BCRYPT_MIN_COST..=BCRYPT_MAX_COST).contains(&cost) {
        return Err(io::Error::other(format!(
            "invalid cost {cost} (min={BCRYPT_MIN_COST} max={BCRYPT_MAX_COST})"
        )));
    }
    let hash = bcrypt::hash(password, cost)
        .map_err(|err| io::Error::other(format!("bcrypt: {err}")))?;
    println!("{hash}");
    Ok(())
}

fn build_router(state: SharedState, disable_admin: bool) -> Router {
    let compress = CompressionLayer::new();

    let mut inner = Router::new()
        .route("/", get(assets::index_page).layer(compress.clone()))
        .route("/healthz", get(healthz))
        .route("/login", get(auth::login))
        .route(
            "/unauthorized",
            get(assets::unauthorized_page).layer(compress.clone()),
        )
        .route("/f/{*rel}", get(files::download))
        .route("/thumb", get(thumb::thumb))
        .route("/api/list", get(files::list))
        .route("/api/search", get(search::search))
        .route("/api/mkdir", post(files::mkdir))
        .route("/api/rename", post(files::rename))
        .route("/api/delete", post(files::delete))
        .route(
            "/api/write",
            post(files::write).layer(DefaultBodyLimit::max(4 * 1024 * 1024)),
        )
        .route("/api/copy", post(transfer::copy))
        .route("/api/move", post(transfer::move_items))
        .route(
            "/api/upload",
            post(upload::multipart_upload).layer(DefaultBodyLimit::disable()),
        )
        .route("/api/uploads", post(upload::create))
        .route(
            "/api/uploads/{id}",
            get(upload::status)
                .patch(upload::patch)
                .delete(upload::cancel)
                .layer(DefaultBodyLimit::disable()),
        )
        .route("/api/uploads/{id}/finish", post(upload::finish))
        .route("/api/zip", get(zip::zip_get).post(zip::zip_post))
        .route("/api/zipls", get(zip::zip_list))
        .route("/api/zipget", get(zip::zip_entry))
        .route("/dav", any(webdav::dav))
        .route("/dav/{*rest}", any(webdav::dav));
    if !disable_admin {
        inner = inner
            .route("/admin", get(assets::admin_page).layer(compress.clone()))
            .route(
                "/api/admin/config",
                get(admin::config_get).put(admin::config_put),
            )
            .route("/api/admin/state", get(admin::state))
            .route(
                "/api/admin/users",
                post(admin::user_create).delete(admin::user_delete),
            )
            .route(
                "/api/admin/tokens",
                post(admin::token_create).delete(admin::token_delete),
            )
            .route("/api/admin/bcrypt", post(admin::bcrypt_hash));
    }

    let dispatched = inner
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth::authenticate,
        ))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            shares::dispatch,
        ))
        .with_state(state);

    Router::new()
        .route("/healthz", get(healthz))
        .route("/favicon.ico", get(assets::favicon))
        .route("/assets/{*path}", get(assets::asset).layer(compress))
        .fallback_service(dispatched)
        .layer(middleware::from_fn(http::response_headers))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(|request: &Request<_>| {
                    let forwarded_ip = request
                        .headers()
                        .get("x-forwarded-for")
                        .and_then(|v| v.to_str().ok())
                        .map(|s| s.split(',').next().unwrap_or("").trim().to_string());
                    let connect_ip = request
                        .extensions()
                        .get::<ConnectInfo<SocketAddr>>()
                        .map(|ConnectInfo(addr)| addr.to_string());
                    let client_ip = forwarded_ip
                        .or(connect_ip)
                        .unwrap_or_else(|| "unknown".to_string());

                    info_span!(
                        "request",
                        client_ip,
                        method = ?request.method(),
                        path = ?request.uri().path(),
                    )
                })
                .on_request(DefaultOnRequest::new().level(Level::DEBUG))
                .on_response(DefaultOnResponse::new().level(Level::DEBUG)),
        )
}

async fn healthz() -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        "ok\n",
    )
}

async fn shutdown_signal(handle: Handle) {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("received termination signal, shutting down");
    handle.graceful_shutdown(Some(Duration::from_secs(10)));
}
