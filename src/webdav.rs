//! WebDAV endpoint backed by a path-policy-enforcing filesystem.
//!
//! A stock WebDAV filesystem only guarantees lexical containment, so every
//! primitive here re-resolves its path through the share resolver before
//! delegating. Authorization happens at the HTTP entry: read permission for
//! `GET/HEAD/OPTIONS/PROPFIND`, write permission for everything else,
//! evaluated against the `/dav`-stripped path.

use axum::body::Body;
use axum::extract::{Extension, Request, State};
use axum::response::Response;
use dav_server::davpath::DavPath;
use dav_server::fs::{
    DavDirEntry, DavFile, DavFileSystem, DavMetaData, FsError, FsFuture, FsStream, OpenOptions,
    ReadDirMeta,
};
use dav_server::localfs::LocalFs;
use dav_server::DavHandler;
use std::path::PathBuf;

use crate::auth::{Identity, Perm, allowed, should_challenge};
use crate::error::ApiError;
use crate::fsutil::{clamp_rel_path, clean_rel_path, resolve_within_root};
use crate::shares::{ShareName, SharedState};

/// Filesystem wrapper that re-checks every path against the share's
/// containment and symlink policy before touching the inner local fs.
#[derive(Clone)]
struct GuardedFs {
    root: PathBuf,
    follow_symlinks: bool,
    inner: Box<LocalFs>,
}

impl GuardedFs {
    fn new(root: PathBuf, follow_symlinks: bool) -> Self {
        let inner = LocalFs::new(&root, false, false, false);
        Self {
            root,
            follow_symlinks,
            inner,
        }
    }

    async fn verify(&self, path: &DavPath) -> Result<(), FsError> {
        let rel = path.as_rel_ospath().to_string_lossy().into_owned();
        let rel = clean_rel_path(&rel).map_err(|_| FsError::Forbidden)?;
        resolve_within_root(&self.root, &rel, self.follow_symlinks)
            .await
            .map_err(|_| FsError::Forbidden)?;
        Ok(())
    }
}

impl DavFileSystem for GuardedFs {
    fn open<'a>(
        &'a self,
        path: &'a DavPath,
        options: OpenOptions,
    ) -> FsFuture<'a, Box<dyn DavFile>> {
        Box::pin(async move {
            self.verify(path).await?;
            self.inner.open(path, options).await
        })
    }

    fn read_dir<'a>(
        &'a self,
        path: &'a DavPath,
        meta: ReadDirMeta,
    ) -> FsFuture<'a, FsStream<Box<dyn DavDirEntry>>> {
        Box::pin(async move {
            self.verify(path).await?;
            self.inner.read_dir(path, meta).await
        })
    }

    fn metadata<'a>(&'a self, path: &'a DavPath) -> FsFuture<'a, Box<dyn DavMetaData>> {
        Box::pin(async move {
            self.verify(path).await?;
            self.inner.metadata(path).await
        })
    }

    fn symlink_metadata<'a>(&'a self, path: &'a DavPath) -> FsFuture<'a, Box<dyn DavMetaData>> {
        Box::pin(async move {
            self.verify(path).await?;
            self.inner.symlink_metadata(path).await
        })
    }

    fn create_dir<'a>(&'a self, path: &'a DavPath) -> FsFuture<'a, ()> {
        Box::pin(async move {
            self.verify(path).await?;
            self.inner.create_dir(path).await
        })
    }

    fn remove_dir<'a>(&'a self, path: &'a DavPath) -> FsFuture<'a, ()> {
        Box::pin(async move {
            self.verify(path).await?;
            self.inner.remove_dir(path).await
        })
    }

    fn remove_file<'a>(&'a self, path: &'a DavPath) -> FsFuture<'a, ()> {
        Box::pin(async move {
            self.verify(path).await?;
            self.inner.remove_file(path).await
        })
    }

    fn rename<'a>(&'a self, from: &'a DavPath, to: &'a DavPath) -> FsFuture<'a, ()> {
        Box::pin(async move {
            self.verify(from).await?;
            self.verify(to).await?;
            self.inner.rename(from, to).await
        })
    }

    fn copy<'a>(&'a self, from: &'a DavPath, to: &'a DavPath) -> FsFuture<'a, ()> {
        Box::pin(async move {
            self.verify(from).await?;
            self.verify(to).await?;
            self.inner.copy(from, to).await
        })
    }
}

fn dav_path_to_clean(url_path: &str) -> String {
    let stripped = url_path.strip_prefix("/dav").unwrap_or(url_path);
    let cleaned = clamp_rel_path(stripped);
    format!("/{cleaned}")
}

/// `ANY /dav[/…]`.
pub async fn dav(
    State(app): State<SharedState>,
    Extension(share): Extension<ShareName>,
    Extension(identity): Extension<Identity>,
    req: Request,
) -> Result<Response, ApiError> {
    let view = app.view(&share.0).await;
    let clean = dav_path_to_clean(req.uri().path());

    let deny = |view: &crate::shares::ShareView, identity: &Identity| {
        if should_challenge(view, identity) {
            ApiError::Unauthorized
        } else {
            ApiError::Forbidden("forbidden".into())
        }
    };
    if !allowed(&view, &identity.0, &clean, Perm::Read) {
        return Err(deny(&view, &identity));
    }
    let read_only = matches!(req.method().as_str(), "GET" | "HEAD" | "OPTIONS" | "PROPFIND");
    if !read_only && !allowed(&view, &identity.0, &clean, Perm::Write) {
        return Err(deny(&view, &identity));
    }

    let locks = app.dav_locks(&share.0).await;
    let handler = DavHandler::builder()
        .strip_prefix("/dav")
        .filesystem(Box::new(GuardedFs::new(
            view.root_path(),
            view.follow_symlinks(),
        )))
        .locksystem(Box::new(locks))
        .build_handler();

    let response = handler.handle(req).await;
    Ok(response.map(Body::new))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dav_paths_strip_prefix_and_clean() {
        assert_eq!(dav_path_to_clean("/dav"), "/");
        assert_eq!(dav_path_to_clean("/dav/"), "/");
        assert_eq!(dav_path_to_clean("/dav/a/b"), "/a/b");
        assert_eq!(dav_path_to_clean("/dav/a/../b"), "/b");
        assert_eq!(dav_path_to_clean("/dav/../x"), "/x");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn guarded_fs_blocks_symlink_components() {
        use std::os::unix::fs::symlink;
        use tempfile::tempdir;

        let temp = tempdir().expect("tempdir");
        let root = temp.path().join("root");
        std::fs::create_dir_all(&root).expect("root");
        let outside = temp.path().join("outside.txt");
        std::fs::write(&outside, b"secret").expect("write");
        symlink(&outside, root.join("leak.txt")).expect("symlink");

        let fs = GuardedFs::new(root, false);
        let path = DavPath::new("/leak.txt").expect("dav path");
        let err = fs.metadata(&path).await.expect_err("must refuse");
        assert!(matches!(err, FsError::Forbidden));
    }
}
