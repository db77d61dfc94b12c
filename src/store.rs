//! Content store abstraction.
//!
//! The [`ContentStore`] trait is the version-controlled file store the admin
//! edits: get/put/delete by path with optimistic concurrency through revision
//! tokens (`sha`), plus directory listing. Every write returns the commit
//! identifier the deploy pipeline will build.
//!
//! [`crate::github::GitHubClient`] is the production implementation;
//! [`MemoryStore`] backs tests and local dry runs.

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, RwLock};

use crate::error::{CmsError, CmsResult};
use crate::models::{StoreEntry, StoredFile};

/// A version-controlled, path-addressed file store.
#[async_trait]
pub trait ContentStore: Send + Sync {
    /// Fetch a file and its current revision token. `NotFound` if absent.
    async fn get(&self, path: &str) -> CmsResult<StoredFile>;

    /// Create (`sha = None`) or update (`sha = Some(current)`) a file.
    ///
    /// Creating over an existing file, or updating with a stale token, fails
    /// with `Conflict`. Returns the commit sha.
    async fn put(
        &self,
        path: &str,
        content: &str,
        sha: Option<&str>,
        message: &str,
    ) -> CmsResult<String>;

    /// Delete a file at exactly the given revision. Returns the commit sha.
    async fn delete(&self, path: &str, sha: &str, message: &str) -> CmsResult<String>;

    /// List the files directly inside `dir`. `NotFound` if the directory is absent.
    async fn list(&self, dir: &str) -> CmsResult<Vec<StoreEntry>>;

    /// Whether `path` exists. Errors other than `NotFound` propagate.
    async fn exists(&self, path: &str) -> CmsResult<bool> {
        match self.get(path).await {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }
}

/// Store operations, used by [`MemoryStore`] failure injection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreOp {
    Get,
    Put,
    Delete,
    List,
}

struct StoredBlob {
    content: String,
    sha: String,
}

/// In-memory [`ContentStore`] for tests and offline runs.
///
/// Revision tokens are content hashes, as with git blobs. Commit shas come
/// from a monotonically increasing counter.
pub struct MemoryStore {
    files: RwLock<BTreeMap<String, StoredBlob>>,
    commits: AtomicU64,
    failures: Mutex<Vec<(StoreOp, String)>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            files: RwLock::new(BTreeMap::new()),
            commits: AtomicU64::new(0),
            failures: Mutex::new(Vec::new()),
        }
    }

    /// Seed a file without creating a commit. Returns its revision token.
    pub fn insert(&self, path: &str, content: &str) -> String {
        let sha = blob_sha(content);
        self.files.write().unwrap_or_else(|e| e.into_inner()).insert(
            path.to_string(),
            StoredBlob {
                content: content.to_string(),
                sha: sha.clone(),
            },
        );
        sha
    }

    /// Current content of `path`, bypassing failure injection.
    pub fn content(&self, path: &str) -> Option<String> {
        self.read_files().get(path).map(|b| b.content.clone())
    }

    pub fn sha(&self, path: &str) -> Option<String> {
        self.read_files().get(path).map(|b| b.sha.clone())
    }

    pub fn paths(&self) -> Vec<String> {
        self.read_files().keys().cloned().collect()
    }

    /// Number of commits created so far.
    pub fn commit_count(&self) -> u64 {
        self.commits.load(Ordering::SeqCst)
    }

    /// Make every `op` on `path` fail with an upstream 500 until cleared.
    pub fn fail(&self, op: StoreOp, path: &str) {
        self.failures
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((op, path.to_string()));
    }

    pub fn clear_failures(&self) {
        self.failures
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }

    fn read_files(&self) -> std::sync::RwLockReadGuard<'_, BTreeMap<String, StoredBlob>> {
        self.files.read().unwrap_or_else(|e| e.into_inner())
    }

    fn check_failure(&self, op: StoreOp, path: &str) -> CmsResult<()> {
        let failures = self.failures.lock().unwrap_or_else(|e| e.into_inner());
        if failures.iter().any(|(o, p)| *o == op && p == path) {
            return Err(CmsError::Upstream {
                service: "memory",
                status: 500,
                message: format!("injected {:?} failure for {}", op, path),
            });
        }
        Ok(())
    }

    fn next_commit(&self, path: &str) -> String {
        let n = self.commits.fetch_add(1, Ordering::SeqCst) + 1;
        let digest = Sha256::digest(format!("commit:{}:{}", n, path).as_bytes());
        hex::encode(&digest[..20])
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn blob_sha(content: &str) -> String {
    let digest = Sha256::digest(format!("blob {}\0{}", content.len(), content).as_bytes());
    hex::encode(&digest[..20])
}

#[async_trait]
impl ContentStore for MemoryStore {
    async fn get(&self, path: &str) -> CmsResult<StoredFile> {
        self.check_failure(StoreOp::Get, path)?;
        let files = self.read_files();
        let blob = files.get(path).ok_or_else(|| CmsError::not_found(path))?;
        Ok(StoredFile {
            path: path.to_string(),
            content: blob.content.clone(),
            sha: blob.sha.clone(),
        })
    }

    async fn put(
        &self,
        path: &str,
        content: &str,
        sha: Option<&str>,
        _message: &str,
    ) -> CmsResult<String> {
        self.check_failure(StoreOp::Put, path)?;
        let mut files = self.files.write().unwrap_or_else(|e| e.into_inner());
        match (files.get(path), sha) {
            (Some(_), None) => {
                return Err(CmsError::conflict(format!("{} already exists", path)));
            }
            (Some(existing), Some(sha)) if existing.sha != sha => {
                return Err(CmsError::conflict(format!("{} does not match {}", sha, path)));
            }
            (None, Some(_)) => return Err(CmsError::not_found(path)),
            _ => {}
        }
        files.insert(
            path.to_string(),
            StoredBlob {
                content: content.to_string(),
                sha: blob_sha(content),
            },
        );
        Ok(self.next_commit(path))
    }

    async fn delete(&self, path: &str, sha: &str, _message: &str) -> CmsResult<String> {
        self.check_failure(StoreOp::Delete, path)?;
        let mut files = self.files.write().unwrap_or_else(|e| e.into_inner());
        match files.get(path) {
            None => return Err(CmsError::not_found(path)),
            Some(existing) if existing.sha != sha => {
                return Err(CmsError::conflict(format!("{} does not match {}", sha, path)));
            }
            Some(_) => {}
        }
        files.remove(path);
        Ok(self.next_commit(path))
    }

    async fn list(&self, dir: &str) -> CmsResult<Vec<StoreEntry>> {
        self.check_failure(StoreOp::List, dir)?;
        let prefix = format!("{}/", dir.trim_end_matches('/'));
        let files = self.read_files();
        let mut found_dir = false;
        let mut entries = Vec::new();
        for (path, blob) in files.iter() {
            let Some(rest) = path.strip_prefix(&prefix) else {
                continue;
            };
            found_dir = true;
            if rest.contains('/') {
                continue;
            }
            entries.push(StoreEntry {
                name: rest.to_string(),
                path: path.clone(),
                sha: blob.sha.clone(),
                size: blob.content.len() as u64,
            });
        }
        if !found_dir {
            return Err(CmsError::not_found(dir));
        }
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_create_then_update_requires_current_sha() {
        let store = MemoryStore::new();
        store.put("_posts/a.md", "one", None, "create").await.unwrap();
        let first = store.get("_posts/a.md").await.unwrap();

        let err = store.put("_posts/a.md", "dup", None, "create").await.unwrap_err();
        assert!(matches!(err, CmsError::Conflict(_)));

        store
            .put("_posts/a.md", "two", Some(&first.sha), "update")
            .await
            .unwrap();
        let stale = store
            .put("_posts/a.md", "three", Some(&first.sha), "update")
            .await
            .unwrap_err();
        assert!(matches!(stale, CmsError::Conflict(_)));
        assert_eq!(store.content("_posts/a.md").as_deref(), Some("two"));
    }

    #[tokio::test]
    async fn test_delete_with_stale_sha_conflicts() {
        let store = MemoryStore::new();
        let old = store.insert("_bin/x.md", "v1");
        store.insert("_bin/x.md", "v2");
        let err = store.delete("_bin/x.md", &old, "purge").await.unwrap_err();
        assert!(matches!(err, CmsError::Conflict(_)));
        assert!(store.content("_bin/x.md").is_some());
    }

    #[tokio::test]
    async fn test_list_is_shallow_and_missing_dir_is_not_found() {
        let store = MemoryStore::new();
        store.insert("_posts/a.md", "a");
        store.insert("_posts/nested/b.md", "b");
        store.insert("_pages/c.md", "c");

        let names: Vec<String> = store
            .list("_posts")
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.name)
            .collect();
        assert_eq!(names, vec!["a.md".to_string()]);
        assert!(store.list("_bin").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_commit_shas_are_unique() {
        let store = MemoryStore::new();
        let a = store.put("a.md", "x", None, "m").await.unwrap();
        let sha = store.sha("a.md").unwrap();
        let b = store.delete("a.md", &sha, "m").await.unwrap();
        assert_ne!(a, b);
        assert_eq!(store.commit_count(), 2);
    }

    #[tokio::test]
    async fn test_injected_failure() {
        let store = MemoryStore::new();
        store.insert("a.md", "x");
        store.fail(StoreOp::Get, "a.md");
        assert!(store.get("a.md").await.is_err());
        store.clear_failures();
        assert!(store.get("a.md").await.is_ok());
    }
}
