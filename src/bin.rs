//! Bin Lifecycle Manager: soft delete for posts and pages.
//!
//! ```text
//! Live ──move_to_bin──▶ Binned ──restore──▶ Live
//!                         │
//!                         └──purge──▶ (gone)
//! ```
//!
//! A binned file carries a `binned_at` timestamp in its frontmatter; a live
//! file never does. Every multi-step operation writes the new copy before
//! deleting the old one, so a failure part-way leaves a duplicate to clean
//! up, never a lost file.

use serde::Serialize;
use std::sync::Arc;

use crate::clock::{filename_timestamp, iso_timestamp, Clock};
use crate::config::ContentConfig;
use crate::error::{CmsError, CmsResult};
use crate::fanout::map_settled;
use crate::frontmatter::{self, Frontmatter};
use crate::models::{check_filename, file_name, BinItem, ContentKind, WriteOutcome};
use crate::store::ContentStore;

pub const BINNED_AT: &str = "binned_at";

/// Collision retries before giving up on a free bin name.
const MAX_RENAMES: usize = 20;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MoveOutcome {
    pub bin_path: String,
    /// Commit of the final step (deleting the source).
    pub commit_sha: String,
    /// Whether the bin name had to be suffixed to avoid a collision.
    pub renamed: bool,
}

pub struct BinManager {
    store: Arc<dyn ContentStore>,
    clock: Arc<dyn Clock>,
    posts_dir: String,
    pages_dir: String,
    bin_dir: String,
}

impl BinManager {
    pub fn new(store: Arc<dyn ContentStore>, clock: Arc<dyn Clock>, content: &ContentConfig) -> Self {
        Self {
            store,
            clock,
            posts_dir: content.posts_dir.clone(),
            pages_dir: content.pages_dir.clone(),
            bin_dir: content.bin_dir.clone(),
        }
    }

    fn dir_for(&self, kind: ContentKind) -> &str {
        match kind {
            ContentKind::Post => &self.posts_dir,
            ContentKind::Page => &self.pages_dir,
        }
    }

    fn bin_path(&self, name: &str) -> String {
        format!("{}/{}", self.bin_dir, name)
    }

    /// Move a live item into the bin, stamping `binned_at`.
    ///
    /// The source is deleted with the revision fetched here, not the
    /// caller's `token`, which may be stale.
    pub async fn move_to_bin(
        &self,
        path: &str,
        token: Option<&str>,
        kind: ContentKind,
    ) -> CmsResult<MoveOutcome> {
        let name = file_name(path);
        check_filename(name)?;
        let source = format!("{}/{}", self.dir_for(kind), name);

        let file = self.store.get(&source).await?;
        if let Some(token) = token {
            if token != file.sha {
                tracing::debug!(path = %source, "client token is stale; using fetched revision");
            }
        }

        let now = self.clock.now();
        let (mut fm, body) = frontmatter::parse(&file.content);
        fm.insert(BINNED_AT, iso_timestamp(now));
        let binned = frontmatter::compose(&fm, &body);

        let (bin_path, renamed) = self.free_bin_path(name, now).await?;
        self.store
            .put(&bin_path, &binned, None, &format!("Move {} to bin", name))
            .await?;

        let commit_sha = self
            .store
            .delete(&source, &file.sha, &format!("Remove {} (moved to bin)", name))
            .await
            .map_err(|e| {
                tracing::warn!(
                    source = %source,
                    bin = %bin_path,
                    "copied to bin but source delete failed: {}",
                    e
                );
                e
            })?;

        tracing::info!(source = %source, bin = %bin_path, "moved to bin");
        Ok(MoveOutcome {
            bin_path,
            commit_sha,
            renamed,
        })
    }

    /// First bin path not already taken: the plain name, then
    /// `stem-<timestamp>.ext`, then `stem-<timestamp>-N.ext`.
    async fn free_bin_path(
        &self,
        name: &str,
        now: chrono::DateTime<chrono::Utc>,
    ) -> CmsResult<(String, bool)> {
        let plain = self.bin_path(name);
        if !self.store.exists(&plain).await? {
            return Ok((plain, false));
        }
        let (stem, ext) = match name.rsplit_once('.') {
            Some((stem, ext)) => (stem, format!(".{}", ext)),
            None => (name, String::new()),
        };
        let stamp = filename_timestamp(now);
        for attempt in 0..MAX_RENAMES {
            let candidate = if attempt == 0 {
                format!("{}-{}{}", stem, stamp, ext)
            } else {
                format!("{}-{}-{}{}", stem, stamp, attempt, ext)
            };
            let path = self.bin_path(&candidate);
            if !self.store.exists(&path).await? {
                return Ok((path, true));
            }
        }
        Err(CmsError::conflict(format!("no free bin name for {}", name)))
    }

    /// Restore a binned item to its live directory, stripping `binned_at`.
    ///
    /// `kind` defaults to the filename convention. Fails with `Conflict`,
    /// touching nothing, if the destination already exists.
    pub async fn restore(
        &self,
        path: &str,
        token: Option<&str>,
        kind: Option<ContentKind>,
    ) -> CmsResult<WriteOutcome> {
        let name = file_name(path);
        check_filename(name)?;
        let kind = kind.unwrap_or_else(|| ContentKind::infer(name));
        let dest = format!("{}/{}", self.dir_for(kind), name);
        let bin_path = self.bin_path(name);

        if self.store.exists(&dest).await? {
            return Err(CmsError::conflict(format!("{} already exists", dest)));
        }

        let file = self.store.get(&bin_path).await?;
        if let Some(token) = token {
            if token != file.sha {
                tracing::debug!(path = %bin_path, "client token is stale; using fetched revision");
            }
        }

        let (mut fm, body) = frontmatter::parse(&file.content);
        fm.remove(BINNED_AT);
        let restored = render_live(&fm, &body);

        let message = format!("Restore {} from bin", name);
        self.store.put(&dest, &restored, None, &message).await?;
        // The delete is the newest commit, so it is the one the deploy builds.
        let commit_sha = self
            .store
            .delete(&bin_path, &file.sha, &message)
            .await
            .map_err(|e| {
                tracing::warn!(dest = %dest, bin = %bin_path, "restored but bin delete failed: {}", e);
                e
            })?;

        tracing::info!(bin = %bin_path, dest = %dest, "restored from bin");
        Ok(WriteOutcome {
            path: dest,
            commit_sha,
        })
    }

    /// Permanently delete a bin entry at exactly revision `token`.
    pub async fn purge(&self, path: &str, token: &str) -> CmsResult<WriteOutcome> {
        let name = file_name(path);
        check_filename(name)?;
        if token.trim().is_empty() {
            return Err(CmsError::validation("sha is required to purge"));
        }
        let bin_path = self.bin_path(name);
        let commit_sha = self
            .store
            .delete(&bin_path, token, &format!("Permanently delete {}", name))
            .await?;
        tracing::info!(bin = %bin_path, "purged");
        Ok(WriteOutcome {
            path: bin_path,
            commit_sha,
        })
    }

    /// Everything in the bin, most recently binned first. Entries whose
    /// content cannot be read are listed with `binned_at: None`.
    pub async fn list(&self) -> CmsResult<Vec<BinItem>> {
        let entries = match self.store.list(&self.bin_dir).await {
            Ok(entries) => entries,
            Err(e) if e.is_not_found() => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        let entries: Vec<_> = entries
            .into_iter()
            .filter(|e| check_filename(&e.name).is_ok())
            .collect();

        let paths: Vec<String> = entries.iter().map(|e| e.path.clone()).collect();
        let stamps = map_settled(paths, |path| {
            let store = self.store.clone();
            async move {
                let file = store.get(&path).await?;
                let (fm, _) = frontmatter::parse(&file.content);
                Ok::<_, CmsError>(fm.get_str(BINNED_AT).map(String::from))
            }
        })
        .await;

        let mut items: Vec<BinItem> = entries
            .into_iter()
            .zip(stamps)
            .map(|(entry, stamp)| {
                let binned_at = stamp.unwrap_or_else(|e| {
                    tracing::warn!(path = %entry.path, "could not read bin entry: {}", e);
                    None
                });
                BinItem {
                    kind: ContentKind::infer(&entry.name),
                    name: entry.name,
                    path: entry.path,
                    sha: entry.sha,
                    size: entry.size,
                    binned_at,
                }
            })
            .collect();

        // ISO timestamps sort lexically; unknown stamps go last.
        items.sort_by(|a, b| match (&a.binned_at, &b.binned_at) {
            (Some(x), Some(y)) => y.cmp(x).then_with(|| a.name.cmp(&b.name)),
            (Some(_), None) => std::cmp::Ordering::Less,
            (None, Some(_)) => std::cmp::Ordering::Greater,
            (None, None) => a.name.cmp(&b.name),
        });
        Ok(items)
    }
}

/// A live file: header and body, or the bare body if no fields remain.
fn render_live(fm: &Frontmatter, body: &str) -> String {
    if !fm.is_empty() {
        return frontmatter::compose(fm, body);
    }
    let body = body.trim();
    if body.is_empty() {
        String::new()
    } else {
        format!("{}\n", body)
    }
}
