//! Path cleaning and containment under a share root.
//!
//! Every filesystem-touching handler funnels user paths through
//! [`clean_rel_path`] and [`resolve_within_root`]. Nothing else in the crate
//! is allowed to turn a request path into an absolute path.

use std::io;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::ErrorKind;

/// Failure modes of path resolution.
#[derive(Debug)]
pub enum PathError {
    /// The path cannot be cleaned (contains a NUL byte).
    BadPath,
    /// The cleaned path would leave the share root.
    Escape,
    /// A component of the path is a symlink and the share forbids them.
    SymlinkDisabled,
    /// Symlink evaluation resolved outside the share root.
    SymlinkEscape,
    Io(io::Error),
}

impl From<io::Error> for PathError {
    fn from(err: io::Error) -> Self {
        PathError::Io(err)
    }
}

/// Normalize a user-supplied path into a slash-separated relative path with
/// no leading slash. `""`, `"."`, and `"/"` all become `""` (the root).
/// Backslashes are treated as separators. A path that tries to climb above
/// the root (`"../etc"`) or contains NUL is rejected.
pub fn clean_rel_path(p: &str) -> Result<String, PathError> {
    if p.contains('\0') {
        return Err(PathError::BadPath);
    }
    let p = p.trim();
    if p.is_empty() || p == "." || p == "/" {
        return Ok(String::new());
    }
    let p = p.replace('\\', "/");
    let mut parts: Vec<&str> = Vec::new();
    for seg in p.split('/') {
        match seg {
            "" | "." => {}
            ".." => {
                if parts.pop().is_none() {
                    return Err(PathError::Escape);
                }
            }
            seg => parts.push(seg),
        }
    }
    Ok(parts.join("/"))
}

/// Lexically normalize a path the way [`clean_rel_path`] does, but clamp
/// `..` at the root instead of failing. Used for names that end up inside
/// archives rather than on the filesystem.
pub fn clamp_rel_path(p: &str) -> String {
    let p = p.replace('\0', "").replace('\\', "/");
    let mut parts: Vec<&str> = Vec::new();
    for seg in p.split('/') {
        match seg {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            seg => parts.push(seg),
        }
    }
    parts.join("/")
}

/// Resolve `rel` (already cleaned) under `root` and enforce the share's
/// symlink policy.
///
/// With `follow_symlinks == false` every existing component is lstat'ed and
/// the call fails if any is a symlink; a missing tail is fine (create
/// flows). With `follow_symlinks == true` the path is fully evaluated and
/// must stay at or below the evaluated root.
pub async fn resolve_within_root(
    root: &Path,
    rel: &str,
    follow_symlinks: bool,
) -> Result<PathBuf, PathError> {
    if rel.contains('\0') {
        return Err(PathError::BadPath);
    }
    let joined = if rel.is_empty() {
        root.to_path_buf()
    } else {
        root.join(rel)
    };
    if joined != root && !joined.starts_with(root) {
        return Err(PathError::Escape);
    }

    if !follow_symlinks {
        let mut current = root.to_path_buf();
        for seg in rel.split('/').filter(|s| !s.is_empty()) {
            current.push(seg);
            match fs::symlink_metadata(&current).await {
                Ok(meta) => {
                    if meta.file_type().is_symlink() {
                        return Err(PathError::SymlinkDisabled);
                    }
                }
                // A missing component means the remaining tail does not
                // exist either; containment was already established above.
                Err(err) if err.kind() == ErrorKind::NotFound => return Ok(joined),
                Err(err) => return Err(PathError::Io(err)),
            }
        }
        return Ok(joined);
    }

    let root_real = match fs::canonicalize(root).await {
        Ok(real) => real,
        Err(_) => root.to_path_buf(),
    };
    let real = match fs::canonicalize(&joined).await {
        Ok(real) => real,
        Err(err) if err.kind() == ErrorKind::NotFound => {
            // Non-existent destination: evaluate the parent instead.
            let parent = joined.parent().ok_or(PathError::Escape)?;
            let parent_real = fs::canonicalize(parent).await?;
            match joined.file_name() {
                Some(name) => parent_real.join(name),
                None => parent_real,
            }
        }
        Err(err) => return Err(PathError::Io(err)),
    };
    if real != root_real && !real.starts_with(&root_real) {
        return Err(PathError::SymlinkEscape);
    }
    Ok(real)
}

/// Join a relative parent and a child name, keeping `""` as the root.
pub fn join_rel(parent: &str, name: &str) -> String {
    if parent.is_empty() {
        name.to_string()
    } else {
        format!("{parent}/{name}")
    }
}

/// Find a free sibling name in `dir_abs`: `file.txt` becomes `file (1).txt`,
/// `file (2).txt`, and so on.
pub async fn unique_name_in_dir(dir_abs: &Path, base: &str) -> io::Result<String> {
    let (stem, ext) = match base.rfind('.') {
        Some(0) | None => (base, ""),
        Some(i) => (&base[..i], &base[i..]),
    };
    for n in 1..10_000u32 {
        let candidate = format!("{stem} ({n}){ext}");
        match fs::symlink_metadata(dir_abs.join(&candidate)).await {
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(candidate),
            Err(err) => return Err(err),
            Ok(_) => {}
        }
    }
    Err(io::Error::other("no free name"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn clean_normalizes_equivalent_forms() {
        for input in ["/a/b", "a//b", "a/./b", "a\\b", " a/b "] {
            assert_eq!(clean_rel_path(input).unwrap(), "a/b");
        }
    }

    #[test]
    fn clean_maps_root_spellings_to_empty() {
        for input in ["", ".", "/", "  "] {
            assert_eq!(clean_rel_path(input).unwrap(), "");
        }
    }

    #[test]
    fn clean_is_idempotent() {
        for input in ["a/b/c", "x/../y", "photos/2024//trip"] {
            let once = clean_rel_path(input).unwrap();
            assert_eq!(clean_rel_path(&once).unwrap(), once);
        }
    }

    #[test]
    fn clean_allows_interior_parent_segments() {
        assert_eq!(clean_rel_path("a/../b").unwrap(), "b");
    }

    #[test]
    fn clean_rejects_escapes_and_nul() {
        assert!(matches!(clean_rel_path("../etc"), Err(PathError::Escape)));
        assert!(matches!(
            clean_rel_path("a/../../etc"),
            Err(PathError::Escape)
        ));
        assert!(matches!(clean_rel_path("a\0b"), Err(PathError::BadPath)));
    }

    #[test]
    fn clamp_drops_leading_parents() {
        assert_eq!(clamp_rel_path("../../etc/passwd"), "etc/passwd");
        assert_eq!(clamp_rel_path("a\\b\\c"), "a/b/c");
    }

    #[tokio::test]
    async fn resolve_allows_missing_tail() {
        let temp = tempdir().expect("tempdir");
        let resolved = resolve_within_root(temp.path(), "new/dir/file.txt", false)
            .await
            .expect("resolve");
        assert!(resolved.starts_with(temp.path()));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn resolve_rejects_symlink_when_disabled() {
        use std::os::unix::fs::symlink;

        let temp = tempdir().expect("tempdir");
        let root = temp.path().join("root");
        std::fs::create_dir_all(&root).expect("create root");
        let outside = temp.path().join("outside.txt");
        std::fs::write(&outside, b"secret").expect("write outside");
        symlink(&outside, root.join("link")).expect("symlink");

        let result = resolve_within_root(&root, "link", false).await;
        assert!(matches!(result, Err(PathError::SymlinkDisabled)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn resolve_rejects_symlink_escape_when_following() {
        use std::os::unix::fs::symlink;

        let temp = tempdir().expect("tempdir");
        let root = temp.path().join("root");
        std::fs::create_dir_all(&root).expect("create root");
        let outside = temp.path().join("outside");
        std::fs::create_dir_all(&outside).expect("create outside");
        symlink(&outside, root.join("leak")).expect("symlink");

        let result = resolve_within_root(&root, "leak", true).await;
        assert!(matches!(result, Err(PathError::SymlinkEscape)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn resolve_accepts_symlink_inside_root_when_following() {
        use std::os::unix::fs::symlink;

        let temp = tempdir().expect("tempdir");
        let root = temp.path().join("root");
        std::fs::create_dir_all(root.join("real")).expect("create dirs");
        symlink(root.join("real"), root.join("alias")).expect("symlink");

        let resolved = resolve_within_root(&root, "alias", true)
            .await
            .expect("resolve");
        let root_real = std::fs::canonicalize(&root).expect("canonicalize");
        assert!(resolved.starts_with(&root_real));
    }

    #[tokio::test]
    async fn unique_name_counts_up() {
        let temp = tempdir().expect("tempdir");
        std::fs::write(temp.path().join("a.txt"), b"x").expect("write");
        std::fs::write(temp.path().join("a (1).txt"), b"x").expect("write");
        let name = unique_name_in_dir(temp.path(), "a.txt").await.expect("name");
        assert_eq!(name, "a (2).txt");
    }

    #[tokio::test]
    async fn unique_name_handles_dotfiles() {
        let temp = tempdir().expect("tempdir");
        std::fs::write(temp.path().join(".env"), b"x").expect("write");
        let name = unique_name_in_dir(temp.path(), ".env").await.expect("name");
        assert_eq!(name, ".env (1)");
    }
}
