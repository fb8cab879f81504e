//! Configuration model, normalization, persistence, and CLI arguments.

use clap::{Parser, Subcommand};
use serde::{Deserialize, Serialize};
use shadow_rs::formatcp;
use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};

use crate::atomic::AtomicFile;
use crate::build;

const VERSION_INFO: &str = formatcp!(
    r#"{}
commit_hash: {}
build_time: {}
build_env: {},{}"#,
    build::PKG_VERSION,
    build::SHORT_COMMIT,
    build::BUILD_TIME,
    build::RUST_VERSION,
    build::RUST_CHANNEL
);

pub const DEFAULT_STATE_DIR_NAME: &str = ".lanparty";
pub const PORTABLE_STATE_ROOT: &str = ".lanparty-state";
pub const MAX_WRITE_BODY: usize = 2 * 1024 * 1024;
pub const BCRYPT_MIN_COST: u32 = 4;
pub const BCRYPT_MAX_COST: u32 = 31;
pub const TOKEN_BYTES: usize = 24;
pub const TOKEN_PREFIX_LEN: usize = 8;
pub const SEARCH_MAX_HITS: usize = 500;
pub const SEARCH_MAX_FILES: usize = 200_000;
pub const ZIP_LIST_MAX_ENTRIES: usize = 5000;
pub const ZIP_PATH_MAX_LEN: usize = 240;
pub const ZIP_NAME_MAX_LEN: usize = 120;
pub const THUMB_MIN_DIM: u32 = 64;
pub const THUMB_MAX_DIM: u32 = 1024;
pub const THUMB_DEFAULT_DIM: u32 = 256;
pub const THUMB_WORKERS: usize = 4;
pub const TEXT_THUMB_MAX_SOURCE: u64 = 1024 * 1024;

/// The JSON configuration document. Unknown keys are ignored; everything is
/// optional except that a root or at least one share must exist.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Config {
    /// Default share root.
    pub root: String,
    /// Default share state dir; empty means `<root>/.lanparty`.
    pub state_dir: String,
    pub follow_symlinks: bool,
    /// Treat requests without credentials as anonymous instead of failing.
    pub auth_optional: bool,
    pub users: BTreeMap<String, User>,
    /// Opaque token string -> username.
    pub tokens: BTreeMap<String, String>,
    /// Ordered; the first rule whose path prefixes the request path wins.
    pub acls: Vec<AclRule>,
    pub shares: BTreeMap<String, Share>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct User {
    pub bcrypt: String,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AclRule {
    /// Clean absolute prefix, e.g. `/` or `/photos`.
    pub path: String,
    /// Usernames, or `*` for anyone.
    pub read: Vec<String>,
    pub write: Vec<String>,
    pub admin: Vec<String>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Share {
    pub root: String,
    pub state_dir: String,
    pub acls: Vec<AclRule>,
    pub follow_symlinks: Option<bool>,
}

impl Config {
    pub fn has_auth(&self) -> bool {
        !self.users.is_empty() || !self.tokens.is_empty()
    }
}

/// Make the configuration usable: absolute roots, resolved state dirs
/// (created on disk), cleaned ACL paths, validated share names.
pub fn normalize(mut cfg: Config, portable: bool) -> io::Result<Config> {
    cfg.root = cfg.root.trim().to_string();
    cfg.state_dir = cfg.state_dir.trim().to_string();
    if cfg.root.is_empty() && cfg.shares.is_empty() {
        return Err(io::Error::other(
            "configure a root path or at least one share",
        ));
    }

    if !cfg.root.is_empty() {
        let root = std::path::absolute(&cfg.root)?;
        cfg.root = root.to_string_lossy().into_owned();
        cfg.state_dir = resolve_state_dir(&root, &cfg.state_dir, portable, "_default")?;
    } else if !cfg.state_dir.is_empty() {
        let state = std::path::absolute(&cfg.state_dir)?;
        std::fs::create_dir_all(&state)?;
        cfg.state_dir = state.to_string_lossy().into_owned();
    }

    cfg.acls = normalize_acls(cfg.acls);

    let mut shares = BTreeMap::new();
    for (raw_name, mut share) in std::mem::take(&mut cfg.shares) {
        let name = raw_name.trim().to_string();
        if name.is_empty() {
            return Err(io::Error::other("share name cannot be empty"));
        }
        if name.contains(['/', '\\', '#', '?']) {
            return Err(io::Error::other(format!(
                "share {name:?}: name cannot contain /, \\, #, or ?"
            )));
        }
        if shares.contains_key(&name) {
            return Err(io::Error::other(format!("duplicate share name {name:?}")));
        }
        let root = share.root.trim();
        if root.is_empty() {
            return Err(io::Error::other(format!("share {name:?}: missing root")));
        }
        let root = std::path::absolute(root)?;
        share.state_dir = resolve_state_dir(&root, share.state_dir.trim(), portable, &name)?;
        share.root = root.to_string_lossy().into_owned();
        share.acls = normalize_acls(share.acls);
        shares.insert(name, share);
    }
    cfg.shares = shares;
    Ok(cfg)
}

fn resolve_state_dir(
    root: &Path,
    configured: &str,
    portable: bool,
    portable_key: &str,
) -> io::Result<String> {
    let state = if !configured.is_empty() {
        std::path::absolute(configured)?
    } else if portable {
        std::path::absolute(Path::new(PORTABLE_STATE_ROOT).join(portable_key))?
    } else {
        root.join(DEFAULT_STATE_DIR_NAME)
    };
    std::fs::create_dir_all(&state)?;
    Ok(state.to_string_lossy().into_owned())
}

pub fn normalize_acls(acls: Vec<AclRule>) -> Vec<AclRule> {
    acls.into_iter()
        .map(|rule| {
            let path = rule.path.trim();
            let path = if path.is_empty() || path == "/" {
                "/".to_string()
            } else {
                format!("/{}", path.trim_matches('/'))
            };
            AclRule {
                path,
                read: clean_names(rule.read),
                write: clean_names(rule.write),
                admin: clean_names(rule.admin),
            }
        })
        .collect()
}

fn clean_names(names: Vec<String>) -> Vec<String> {
    names
        .into_iter()
        .map(|name| name.trim().to_string())
        .filter(|name| !name.is_empty())
        .collect()
}

/// Write the configuration as indented JSON, atomically.
pub async fn persist(path: &Path, cfg: &Config) -> io::Result<()> {
    let data = serde_json::to_vec_pretty(cfg).map_err(io::Error::other)?;
    let mut atomic = AtomicFile::create(path).await?;
    if let Err(err) = atomic.write_all(&data).await {
        atomic.cancel().await;
        return Err(err);
    }
    atomic.commit().await
}

/// Command line and environment configuration. CLI beats env beats the
/// config file.
#[derive(Parser, Debug)]
#[command(
    name = "lanparty",
    version = VERSION_INFO,
    about = "LAN file server with shares, resumable uploads, and WebDAV"
)]
pub struct Args {
    #[command(subcommand)]
    pub command: Option<Command>,
    #[arg(
        short = 'a',
        long,
        env = "LANPARTY_ADDR",
        default_value = "0.0.0.0:3923",
        help = "Listen address"
    )]
    pub addr: String,
    #[arg(
        short = 'r',
        long,
        env = "LANPARTY_ROOT",
        help = "Share root (required unless --config is given)"
    )]
    pub root: Option<String>,
    #[arg(
        long,
        env = "LANPARTY_STATE",
        help = "State dir for uploads/blobs/thumbs (default: <root>/.lanparty)"
    )]
    pub state: Option<String>,
    #[arg(short = 'c', long, env = "LANPARTY_CONFIG", help = "Path to config JSON")]
    pub config: Option<PathBuf>,
    #[arg(
        long,
        env = "LANPARTY_PORTABLE",
        help = "Keep per-share state under ./.lanparty-state/ instead of inside the roots"
    )]
    pub portable: bool,
    #[arg(
        long,
        env = "LANPARTY_FOLLOW_SYMLINKS",
        help = "Follow symlinks that stay inside the share root"
    )]
    pub follow_symlinks: bool,
    #[arg(
        long,
        env = "LANPARTY_DISABLE_ADMIN",
        help = "Disable the admin panel and admin API"
    )]
    pub disable_admin: bool,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Print a bcrypt hash for a password.
    Passwd {
        #[arg(short = 'p', long)]
        password: String,
        #[arg(long, default_value_t = bcrypt::DEFAULT_COST)]
        cost: u32,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn normalize_acls_cleans_paths_and_names() {
        let rules = normalize_acls(vec![
            AclRule {
                path: "photos/".into(),
                read: vec!["*".into(), " ".into()],
                write: vec![" alice ".into()],
                admin: vec![],
            },
            AclRule {
                path: "".into(),
                ..AclRule::default()
            },
        ]);
        assert_eq!(rules[0].path, "/photos");
        assert_eq!(rules[0].read, vec!["*"]);
        assert_eq!(rules[0].write, vec!["alice"]);
        assert_eq!(rules[1].path, "/");
    }

    #[test]
    fn normalize_acls_is_idempotent() {
        let rules = vec![AclRule {
            path: "/a/b/".into(),
            read: vec!["bob".into()],
            ..AclRule::default()
        }];
        let once = normalize_acls(rules);
        let twice = normalize_acls(once.clone());
        assert_eq!(once[0].path, twice[0].path);
        assert_eq!(once[0].read, twice[0].read);
    }

    #[test]
    fn normalize_requires_a_root_or_share() {
        let err = normalize(Config::default(), false).expect_err("must fail");
        assert!(err.to_string().contains("root"));
    }

    #[test]
    fn normalize_rejects_bad_share_names() {
        let temp = tempdir().expect("tempdir");
        for bad in ["a/b", "a\\b", "a#b", "a?b", "  "] {
            let mut cfg = Config::default();
            cfg.shares.insert(
                bad.into(),
                Share {
                    root: temp.path().to_string_lossy().into_owned(),
                    ..Share::default()
                },
            );
            assert!(normalize(cfg, false).is_err(), "share name {bad:?}");
        }
    }

    #[test]
    fn normalize_defaults_state_dir_under_root() {
        let temp = tempdir().expect("tempdir");
        let cfg = Config {
            root: temp.path().to_string_lossy().into_owned(),
            ..Config::default()
        };
        let cfg = normalize(cfg, false).expect("normalize");
        assert!(cfg.state_dir.ends_with(DEFAULT_STATE_DIR_NAME));
        assert!(Path::new(&cfg.state_dir).is_dir());
    }

    #[tokio::test]
    async fn persist_round_trips() {
        let temp = tempdir().expect("tempdir");
        let path = temp.path().join("config.json");
        let mut cfg = Config {
            root: "/srv/files".into(),
            auth_optional: true,
            ..Config::default()
        };
        cfg.users.insert(
            "alice".into(),
            User {
                bcrypt: "$2b$12$x".into(),
            },
        );
        persist(&path, &cfg).await.expect("persist");

        let raw = std::fs::read(&path).expect("read");
        let loaded: Config = serde_json::from_slice(&raw).expect("parse");
        assert_eq!(loaded.root, cfg.root);
        assert!(loaded.auth_optional);
        assert_eq!(loaded.users["alice"].bcrypt, "$2b$12$x");
    }
}
