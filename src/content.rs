//! Post and page CRUD.
//!
//! Posts live in `posts_dir` and must be named `YYYY-MM-DD-slug.md`; pages
//! live in `pages_dir` and must not carry the date prefix, so the kind can
//! always be recovered from the name. Deleting routes through the bin.

use std::sync::Arc;

use crate::bin::{BinManager, MoveOutcome, BINNED_AT};
use crate::config::ContentConfig;
use crate::error::{CmsError, CmsResult};
use crate::frontmatter::{self, Frontmatter};
use crate::models::{check_filename, file_name, is_dated_filename, ContentItem, ContentKind, StoreEntry, WriteOutcome};
use crate::store::ContentStore;

pub struct ContentService {
    store: Arc<dyn ContentStore>,
    bin: Arc<BinManager>,
    config: ContentConfig,
}

fn check_name_for(kind: ContentKind, name: &str) -> CmsResult<()> {
    check_filename(name)?;
    match (kind, is_dated_filename(name)) {
        (ContentKind::Post, false) => Err(CmsError::validation(format!(
            "post filename '{}' must start with YYYY-MM-DD-",
            name
        ))),
        (ContentKind::Page, true) => Err(CmsError::validation(format!(
            "page filename '{}' must not start with a date",
            name
        ))),
        _ => Ok(()),
    }
}

/// Frontmatter rules for a live item.
pub fn validate_frontmatter(fm: &Frontmatter) -> CmsResult<()> {
    if fm.contains_key(BINNED_AT) {
        return Err(CmsError::validation(format!(
            "'{}' is reserved for binned items",
            BINNED_AT
        )));
    }
    match fm.get_str("title") {
        Some(title) if !title.trim().is_empty() => {}
        _ => return Err(CmsError::validation("title is required")),
    }
    for (key, value) in fm.iter() {
        frontmatter::check_value(key, value).map_err(CmsError::Validation)?;
    }
    Ok(())
}

impl ContentService {
    pub fn new(store: Arc<dyn ContentStore>, bin: Arc<BinManager>, config: &ContentConfig) -> Self {
        Self {
            store,
            bin,
            config: config.clone(),
        }
    }

    fn path_for(&self, kind: ContentKind, name: &str) -> String {
        format!("{}/{}", self.config.dir_for(kind), name)
    }

    /// Markdown files in the kind's directory. A missing directory is empty.
    pub async fn list(&self, kind: ContentKind) -> CmsResult<Vec<StoreEntry>> {
        let mut entries = match self.store.list(self.config.dir_for(kind)).await {
            Ok(entries) => entries,
            Err(e) if e.is_not_found() => Vec::new(),
            Err(e) => return Err(e),
        };
        entries.retain(|e| check_filename(&e.name).is_ok());
        // Newest posts first; pages alphabetically.
        match kind {
            ContentKind::Post => entries.sort_by(|a, b| b.name.cmp(&a.name)),
            ContentKind::Page => entries.sort_by(|a, b| a.name.cmp(&b.name)),
        }
        Ok(entries)
    }

    pub async fn get(&self, kind: ContentKind, name: &str) -> CmsResult<ContentItem> {
        let name = file_name(name);
        check_filename(name)?;
        let file = self.store.get(&self.path_for(kind, name)).await?;
        let (frontmatter, body) = frontmatter::parse(&file.content);
        Ok(ContentItem {
            path: file.path,
            kind,
            frontmatter,
            body,
            sha: file.sha,
        })
    }

    pub async fn create(
        &self,
        kind: ContentKind,
        name: &str,
        fm: &Frontmatter,
        body: &str,
    ) -> CmsResult<WriteOutcome> {
        check_name_for(kind, name)?;
        validate_frontmatter(fm)?;
        let path = self.path_for(kind, name);
        let commit_sha = self
            .store
            .put(&path, &frontmatter::compose(fm, body), None, &format!("Create {} {}", kind, name))
            .await?;
        tracing::info!(path = %path, commit = %commit_sha, "created");
        Ok(WriteOutcome { path, commit_sha })
    }

    pub async fn update(
        &self,
        kind: ContentKind,
        name: &str,
        fm: &Frontmatter,
        body: &str,
        sha: &str,
    ) -> CmsResult<WriteOutcome> {
        check_filename(name)?;
        if sha.trim().is_empty() {
            return Err(CmsError::validation("sha is required to update"));
        }
        validate_frontmatter(fm)?;
        let path = self.path_for(kind, name);
        let commit_sha = self
            .store
            .put(
                &path,
                &frontmatter::compose(fm, body),
                Some(sha),
                &format!("Update {} {}", kind, name),
            )
            .await?;
        tracing::info!(path = %path, commit = %commit_sha, "updated");
        Ok(WriteOutcome { path, commit_sha })
    }

    /// Soft delete: move the item to the bin.
    pub async fn delete(&self, kind: ContentKind, name: &str, sha: Option<&str>) -> CmsResult<MoveOutcome> {
        self.bin.move_to_bin(name, sha, kind).await
    }
}
