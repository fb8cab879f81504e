//! In-memory WebDAV lock system, one instance per share.

use dav_server::davpath::DavPath;
use dav_server::ls::{DavLock, DavLockSystem, LsFuture};
use std::collections::HashMap;
use std::future::ready;
use std::sync::{Arc, Mutex};
use std::time::SystemTime;
use uuid::Uuid;

/// Lock table keyed by normalized URL path. Expired locks are pruned on
/// every operation.
#[derive(Debug, Clone, Default)]
pub struct ShareLockSystem {
    inner: Arc<Mutex<LockTable>>,
}

#[derive(Debug, Default)]
struct LockTable {
    by_path: HashMap<String, Vec<DavLock>>,
}

impl ShareLockSystem {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_table<T>(&self, f: impl FnOnce(&mut LockTable) -> T) -> T {
        let mut table = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        table.prune_expired();
        f(&mut table)
    }
}

impl DavLockSystem for ShareLockSystem {
    fn lock(
        &self,
        path: &DavPath,
        principal: Option<&str>,
        owner: Option<&xmltree::Element>,
        timeout: Option<std::time::Duration>,
        shared: bool,
        deep: bool,
    ) -> LsFuture<'_, Result<DavLock, DavLock>> {
        let key = normalize_path(path);
        let result = self.with_table(|table| {
            if let Some(conflict) = table.conflicting_ancestor(&key, principal, true, &[], shared) {
                return Err(conflict);
            }
            if deep
                && let Some(conflict) =
                    table.conflicting_descendant(&key, principal, true, &[], shared)
            {
                return Err(conflict);
            }
            let lock = DavLock {
                token: Uuid::new_v4().urn().to_string(),
                path: Box::new(path.clone()),
                principal: principal.map(str::to_string),
                owner: owner.cloned().map(Box::new),
                timeout_at: timeout.map(|d| SystemTime::now() + d),
                timeout,
                shared,
                deep,
            };
            table.by_path.entry(key).or_default().push(lock.clone());
            Ok(lock)
        });
        Box::pin(ready(result))
    }

    fn unlock(&self, path: &DavPath, token: &str) -> LsFuture<'_, Result<(), ()>> {
        let key = normalize_path(path);
        let result = self.with_table(|table| {
            let Some(locks) = table.by_path.get_mut(&key) else {
                return Err(());
            };
            let before = locks.len();
            locks.retain(|lock| lock.token != token);
            let removed = locks.len() != before;
            if locks.is_empty() {
                table.by_path.remove(&key);
            }
            if removed { Ok(()) } else { Err(()) }
        });
        Box::pin(ready(result))
    }

    fn refresh(
        &self,
        path: &DavPath,
        token: &str,
        timeout: Option<std::time::Duration>,
    ) -> LsFuture<'_, Result<DavLock, ()>> {
        let key = normalize_path(path);
        let result = self.with_table(|table| {
            let locks = table.by_path.get_mut(&key).ok_or(())?;
            for lock in locks {
                if lock.token == token {
                    lock.timeout = timeout;
                    lock.timeout_at = timeout.map(|d| SystemTime::now() + d);
                    return Ok(lock.clone());
                }
            }
            Err(())
        });
        Box::pin(ready(result))
    }

    fn check(
        &self,
        path: &DavPath,
        principal: Option<&str>,
        ignore_principal: bool,
        deep: bool,
        submitted_tokens: Vec<&str>,
    ) -> LsFuture<'_, Result<(), DavLock>> {
        let key = normalize_path(path);
        let result = self.with_table(|table| {
            if let Some(conflict) = table.conflicting_ancestor(
                &key,
                principal,
                ignore_principal,
                &submitted_tokens,
                false,
            ) {
                return Err(conflict);
            }
            if deep
                && let Some(conflict) = table.conflicting_descendant(
                    &key,
                    principal,
                    ignore_principal,
                    &submitted_tokens,
                    false,
                )
            {
                return Err(conflict);
            }
            Ok(())
        });
        Box::pin(ready(result))
    }

    fn discover(&self, path: &DavPath) -> LsFuture<'_, Vec<DavLock>> {
        let key = normalize_path(path);
        let result = self.with_table(|table| {
            table
                .iter_locks()
                .filter(|(lock_path, lock)| lock_applies(lock_path, lock, &key))
                .map(|(_, lock)| lock.clone())
                .collect()
        });
        Box::pin(ready(result))
    }

    fn delete(&self, path: &DavPath) -> LsFuture<'_, Result<(), ()>> {
        let key = normalize_path(path);
        self.with_table(|table| {
            table
                .by_path
                .retain(|lock_path, _| !is_descendant_or_same(&key, lock_path));
        });
        Box::pin(ready(Ok(())))
    }
}

impl LockTable {
    fn prune_expired(&mut self) {
        let now = SystemTime::now();
        self.by_path.retain(|_, locks| {
            locks.retain(|lock| match lock.timeout_at {
                Some(timeout_at) => timeout_at > now,
                None => true,
            });
            !locks.is_empty()
        });
    }

    fn iter_locks(&self) -> impl Iterator<Item = (&String, &DavLock)> {
        self.by_path
            .iter()
            .flat_map(|(path, locks)| locks.iter().map(move |lock| (path, lock)))
    }

    fn conflicting_ancestor(
        &self,
        key: &str,
        principal: Option<&str>,
        ignore_principal: bool,
        submitted_tokens: &[&str],
        shared_ok: bool,
    ) -> Option<DavLock> {
        self.iter_locks()
            .filter(|(lock_path, lock)| lock_applies(lock_path, lock, key))
            .find(|(_, lock)| {
                !holds_lock(lock, principal, ignore_principal, submitted_tokens)
                    && !(lock.shared && shared_ok)
            })
            .map(|(_, lock)| lock.clone())
    }

    fn conflicting_descendant(
        &self,
        key: &str,
        principal: Option<&str>,
        ignore_principal: bool,
        submitted_tokens: &[&str],
        shared_ok: bool,
    ) -> Option<DavLock> {
        self.iter_locks()
            .filter(|(lock_path, _)| is_descendant(key, lock_path))
            .find(|(_, lock)| {
                !holds_lock(lock, principal, ignore_principal, submitted_tokens)
                    && !(lock.shared && shared_ok)
            })
            .map(|(_, lock)| lock.clone())
    }
}

fn normalize_path(path: &DavPath) -> String {
    let mut value = path.as_url_string();
    if value.len() > 1 && value.ends_with('/') {
        value.pop();
    }
    value
}

fn is_descendant_or_same(ancestor: &str, path: &str) -> bool {
    if ancestor == "/" || ancestor == path {
        return true;
    }
    path.starts_with(ancestor) && path.as_bytes().get(ancestor.len()) == Some(&b'/')
}

fn is_descendant(ancestor: &str, path: &str) -> bool {
    ancestor != path && is_descendant_or_same(ancestor, path)
}

fn lock_applies(lock_path: &str, lock: &DavLock, key: &str) -> bool {
    lock_path == key || (lock.deep && is_descendant(lock_path, key))
}

fn holds_lock(
    lock: &DavLock,
    principal: Option<&str>,
    ignore_principal: bool,
    submitted_tokens: &[&str],
) -> bool {
    if !submitted_tokens.iter().any(|token| *token == lock.token) {
        return false;
    }
    ignore_principal || principal == lock.principal.as_deref()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn dav_path(p: &str) -> DavPath {
        DavPath::new(p).expect("dav path")
    }

    #[tokio::test]
    async fn exclusive_lock_blocks_second_locker() {
        let ls = ShareLockSystem::new();
        let lock = ls
            .lock(&dav_path("/a/b"), Some("alice"), None, None, false, false)
            .await
            .expect("first lock");

        let denied = ls
            .lock(&dav_path("/a/b"), Some("bob"), None, None, false, false)
            .await;
        assert!(denied.is_err());

        ls.unlock(&dav_path("/a/b"), &lock.token)
            .await
            .expect("unlock");
        ls.lock(&dav_path("/a/b"), Some("bob"), None, None, false, false)
            .await
            .expect("lock after unlock");
    }

    #[tokio::test]
    async fn deep_lock_covers_descendants() {
        let ls = ShareLockSystem::new();
        ls.lock(&dav_path("/dir"), Some("alice"), None, None, false, true)
            .await
            .expect("deep lock");

        let check = ls
            .check(&dav_path("/dir/file.txt"), Some("bob"), false, false, vec![])
            .await;
        assert!(check.is_err());
    }

    #[tokio::test]
    async fn check_passes_with_submitted_token() {
        let ls = ShareLockSystem::new();
        let lock = ls
            .lock(&dav_path("/f"), Some("alice"), None, None, false, false)
            .await
            .expect("lock");
        ls.check(
            &dav_path("/f"),
            Some("alice"),
            false,
            false,
            vec![lock.token.as_str()],
        )
        .await
        .expect("check with token");
    }

    #[tokio::test]
    async fn expired_locks_are_pruned() {
        let ls = ShareLockSystem::new();
        ls.lock(
            &dav_path("/t"),
            Some("alice"),
            None,
            Some(Duration::from_millis(10)),
            false,
            false,
        )
        .await
        .expect("lock");
        tokio::time::sleep(Duration::from_millis(30)).await;
        let discovered = ls.discover(&dav_path("/t")).await;
        assert!(discovered.is_empty());
    }
}
