//! Bounded breadth-first search over a share subtree.
//!
//! Non-hidden directories are scanned before hidden ones so the useful hits
//! arrive first. Symlinked directories are never entered. The walk stops at
//! 500 hits or 200 000 visited entries, whichever comes first, and reports
//! which cap was hit.

use axum::extract::{Extension, Query, State};
use axum::response::Json;
use serde::Deserialize;
use serde_json::json;
use std::collections::VecDeque;
use std::path::PathBuf;
use tokio::fs;

use crate::auth::{Identity, Perm, require};
use crate::config::{SEARCH_MAX_FILES, SEARCH_MAX_HITS};
use crate::error::ApiError;
use crate::files::{ListItem, enrich_item, unix_mtime};
use crate::fsutil::{clean_rel_path, join_rel, resolve_within_root};
use crate::shares::{ShareName, SharedState};

#[derive(Deserialize)]
pub(crate) struct SearchQuery {
    path: Option<String>,
    q: Option<String>,
}

struct Node {
    abs: PathBuf,
    rel: String,
}

/// `GET /api/search?path=&q=`.
pub async fn search(
    State(app): State<SharedState>,
    Extension(share): Extension<ShareName>,
    Extension(identity): Extension<Identity>,
    Query(query): Query<SearchQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let needle = query.q.as_deref().unwrap_or("").trim().to_string();
    if needle.is_empty() {
        return Ok(Json(
            json!({"items": [], "seen": 0, "truncated": false, "reason": ""}),
        ));
    }
    let base_rel = clean_rel_path(query.path.as_deref().unwrap_or(""))?;
    let view = app.view(&share.0).await;
    require(&view, &identity, Perm::Read, &base_rel)?;
    let base_abs = resolve_within_root(&view.root_path(), &base_rel, view.follow_symlinks()).await?;

    let needle = needle.to_lowercase();
    let mut hits: Vec<ListItem> = Vec::new();
    let mut seen: usize = 0;
    let mut truncated = false;
    let mut reason = "";

    let mut normal_queue: VecDeque<Node> = VecDeque::new();
    let mut hidden_queue: VecDeque<Node> = VecDeque::new();
    normal_queue.push_back(Node {
        abs: base_abs,
        rel: base_rel,
    });

    'walk: while let Some(node) = normal_queue
        .pop_front()
        .or_else(|| hidden_queue.pop_front())
    {
        // The directory node itself counts against the visit cap.
        seen += 1;
        if seen > SEARCH_MAX_FILES {
            truncated = true;
            reason = "maxFiles";
            break;
        }

        let Ok(mut dir) = fs::read_dir(&node.abs).await else {
            continue;
        };
        let mut normal_entries = Vec::new();
        let mut hidden_entries = Vec::new();
        while let Ok(Some(entry)) = dir.next_entry().await {
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with('.') {
                hidden_entries.push((name, entry));
            } else {
                normal_entries.push((name, entry));
            }
        }
        normal_entries.sort_by(|a, b| a.0.cmp(&b.0));
        hidden_entries.sort_by(|a, b| a.0.cmp(&b.0));

        for (name, entry) in normal_entries.into_iter().chain(hidden_entries) {
            seen += 1;
            if seen > SEARCH_MAX_FILES {
                truncated = true;
                reason = "maxFiles";
                break 'walk;
            }
            let child_rel = join_rel(&node.rel, &name);
            if child_rel.to_lowercase().contains(&needle) {
                let meta = entry.metadata().await.ok();
                let is_dir = entry.file_type().await.is_ok_and(|t| t.is_dir());
                let mut item = ListItem {
                    name: name.clone(),
                    path: child_rel.clone(),
                    is_dir,
                    size: meta.as_ref().map(|m| m.len() as i64).unwrap_or(0),
                    mtime: meta.as_ref().map(unix_mtime).unwrap_or(0),
                    ..ListItem::default()
                };
                enrich_item(&view, &mut item);
                hits.push(item);
                if hits.len() >= SEARCH_MAX_HITS {
                    truncated = true;
                    reason = "maxHits";
                    break 'walk;
                }
            }
            // Entry file types come from lstat, so symlinked directories are
            // never queued.
            if entry.file_type().await.is_ok_and(|t| t.is_dir()) {
                let child = Node {
                    abs: entry.path(),
                    rel: child_rel,
                };
                if name.starts_with('.') {
                    hidden_queue.push_back(child);
                } else {
                    normal_queue.push_back(child);
                }
            }
        }
    }

    Ok(Json(json!({
        "items": hits,
        "seen": seen,
        "truncated": truncated,
        "reason": reason,
    })))
}
