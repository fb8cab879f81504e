//! Content-addressed blob store.
//!
//! Blobs live at `<stateDir>/blobs/<sha256hex>` and are immutable once
//! named. Concurrent `put`s of identical content are safe: the last rename
//! wins and the bytes are the same.

use sha2::{Digest, Sha256};
use std::io;
use std::path::{Path, PathBuf};
use tokio::fs::{self, File};
use tokio::io::AsyncReadExt;

const HASH_BUF_SIZE: usize = 1024 * 1024;

#[derive(Debug)]
pub struct DedupStore {
    dir: PathBuf,
}

impl DedupStore {
    /// Open (creating if needed) the blob directory under `state_dir`.
    pub async fn open(state_dir: &Path) -> io::Result<Self> {
        let dir = state_dir.join("blobs");
        fs::create_dir_all(&dir).await?;
        Ok(Self { dir })
    }

    pub fn blob_path(&self, sha256hex: &str) -> PathBuf {
        self.dir.join(sha256hex)
    }

    /// Move `temp` into the store keyed by its SHA-256. The temp file is
    /// always consumed: renamed into place, or removed when the blob (or a
    /// cross-device copy of it) already exists.
    pub async fn put(&self, temp: &Path) -> io::Result<(String, PathBuf, u64)> {
        let mut file = File::open(temp).await?;
        let mut hasher = Sha256::new();
        let mut buf = vec![0u8; HASH_BUF_SIZE];
        let mut size: u64 = 0;
        loop {
            let read = file.read(&mut buf).await?;
            if read == 0 {
                break;
            }
            hasher.update(&buf[..read]);
            size += read as u64;
        }
        drop(file);

        let sum = hex::encode(hasher.finalize());
        let dst = self.blob_path(&sum);

        if let Ok(meta) = fs::metadata(&dst).await
            && meta.is_file()
        {
            let _ = fs::remove_file(temp).await;
            return Ok((sum, dst, meta.len()));
        }

        if let Err(rename_err) = fs::rename(temp, &dst).await {
            // Cross-device temp dirs cannot be renamed into the store.
            copy_with_sync(temp, &dst).await.map_err(|copy_err| {
                io::Error::other(format!("store blob: rename={rename_err} copy={copy_err}"))
            })?;
            let _ = fs::remove_file(temp).await;
        }
        Ok((sum, dst, size))
    }

    /// Materialize a blob at `dst`: hardlink when the filesystem allows it,
    /// otherwise a buffered copy with fsync. Any existing `dst` is replaced.
    pub async fn link_or_copy(blob: &Path, dst: &Path) -> io::Result<()> {
        if let Some(parent) = dst.parent() {
            fs::create_dir_all(parent).await?;
        }
        let _ = fs::remove_file(dst).await;
        if fs::hard_link(blob, dst).await.is_ok() {
            return Ok(());
        }
        copy_with_sync(blob, dst).await
    }
}

async fn copy_with_sync(src: &Path, dst: &Path) -> io::Result<()> {
    let mut input = File::open(src).await?;
    let mut output = File::create(dst).await?;
    tokio::io::copy(&mut input, &mut output).await?;
    output.sync_all().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const HELLO_SHA256: &str = "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824";

    async fn store_with_temp(content: &[u8]) -> (tempfile::TempDir, DedupStore, PathBuf) {
        let temp = tempdir().expect("tempdir");
        let store = DedupStore::open(temp.path()).await.expect("open store");
        let temp_file = temp.path().join("incoming");
        std::fs::write(&temp_file, content).expect("write temp");
        (temp, store, temp_file)
    }

    #[tokio::test]
    async fn put_names_blob_by_content_hash() {
        let (_temp, store, temp_file) = store_with_temp(b"hello").await;
        let (sum, blob, size) = store.put(&temp_file).await.expect("put");
        assert_eq!(sum, HELLO_SHA256);
        assert_eq!(size, 5);
        assert_eq!(std::fs::read(&blob).expect("read blob"), b"hello");
        assert!(!temp_file.exists(), "temp must be consumed");
    }

    #[tokio::test]
    async fn put_adopts_existing_blob() {
        let (temp, store, temp_file) = store_with_temp(b"hello").await;
        let (_, first_blob, _) = store.put(&temp_file).await.expect("first put");

        let second = temp.path().join("incoming2");
        std::fs::write(&second, b"hello").expect("write");
        let (sum, blob, size) = store.put(&second).await.expect("second put");
        assert_eq!(sum, HELLO_SHA256);
        assert_eq!(blob, first_blob);
        assert_eq!(size, 5);
        assert!(!second.exists(), "temp must be consumed on dedup hit too");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn link_or_copy_shares_the_inode() {
        use std::os::unix::fs::MetadataExt;

        let (temp, store, temp_file) = store_with_temp(b"hello").await;
        let (_, blob, _) = store.put(&temp_file).await.expect("put");

        let a = temp.path().join("a.txt");
        let b = temp.path().join("nested/b.txt");
        DedupStore::link_or_copy(&blob, &a).await.expect("link a");
        DedupStore::link_or_copy(&blob, &b).await.expect("link b");

        let ino_a = std::fs::metadata(&a).expect("meta").ino();
        let ino_b = std::fs::metadata(&b).expect("meta").ino();
        assert_eq!(ino_a, ino_b);
        assert_eq!(std::fs::read(&b).expect("read"), b"hello");
    }

    #[tokio::test]
    async fn link_or_copy_replaces_existing_destination() {
        let (temp, store, temp_file) = store_with_temp(b"hello").await;
        let (_, blob, _) = store.put(&temp_file).await.expect("put");

        let dst = temp.path().join("existing.txt");
        std::fs::write(&dst, b"stale").expect("seed");
        DedupStore::link_or_copy(&blob, &dst).await.expect("replace");
        assert_eq!(std::fs::read(&dst).expect("read"), b"hello");
    }
}
