//! Temp-write-then-rename helper for atomic file replacement.

use std::io;
use std::path::{Path, PathBuf};
use tokio::fs::{self, File};
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

/// A temp file next to its target that becomes the target on [`commit`].
///
/// [`commit`]: AtomicFile::commit
pub struct AtomicFile {
    target: PathBuf,
    temp_path: PathBuf,
    file: File,
}

impl AtomicFile {
    /// Create a temp file in the target's directory.
    pub async fn create(target: &Path) -> io::Result<Self> {
        let parent = target
            .parent()
            .ok_or_else(|| io::Error::other("target has no parent directory"))?;
        let base = target
            .file_name()
            .map(|name| name.to_string_lossy())
            .unwrap_or_else(|| "file".into());
        let temp_path = parent.join(format!(".{base}.tmp.{}", Uuid::new_v4().simple()));
        let file = File::create(&temp_path).await?;
        Ok(Self {
            target: target.to_path_buf(),
            temp_path,
            file,
        })
    }

    pub fn file_mut(&mut self) -> &mut File {
        &mut self.file
    }

    pub async fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        self.file.write_all(data).await
    }

    /// Abandon the write and remove the temp file.
    pub async fn cancel(self) {
        drop(self.file);
        let _ = fs::remove_file(&self.temp_path).await;
    }

    /// Flush, fsync, and rename over the target. The parent directory is
    /// synced on either side of the rename.
    pub async fn commit(self) -> io::Result<()> {
        self.file.sync_all().await?;
        drop(self.file);

        if let Some(parent) = self.target.parent() {
            let _ = sync_dir(parent).await;
        }
        if let Err(err) = fs::rename(&self.temp_path, &self.target).await {
            let _ = fs::remove_file(&self.temp_path).await;
            return Err(err);
        }
        if let Some(parent) = self.target.parent() {
            let _ = sync_dir(parent).await;
        }
        Ok(())
    }
}

async fn sync_dir(path: &Path) -> io::Result<()> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || {
        let dir = std::fs::File::open(path)?;
        dir.sync_all()
    })
    .await
    .map_err(|err| io::Error::other(err.to_string()))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn commit_replaces_target() {
        let temp = tempdir().expect("tempdir");
        let target = temp.path().join("out.txt");
        std::fs::write(&target, b"old").expect("seed");

        let mut atomic = AtomicFile::create(&target).await.expect("create");
        atomic.write_all(b"new").await.expect("write");
        atomic.commit().await.expect("commit");

        assert_eq!(std::fs::read(&target).expect("read"), b"new");
    }

    #[tokio::test]
    async fn cancel_leaves_target_untouched() {
        let temp = tempdir().expect("tempdir");
        let target = temp.path().join("out.txt");
        std::fs::write(&target, b"old").expect("seed");

        let mut atomic = AtomicFile::create(&target).await.expect("create");
        atomic.write_all(b"new").await.expect("write");
        atomic.cancel().await;

        assert_eq!(std::fs::read(&target).expect("read"), b"old");
        let leftovers = std::fs::read_dir(temp.path()).expect("read dir").count();
        assert_eq!(leftovers, 1);
    }
}
