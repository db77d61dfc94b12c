//! Lazy-loading pass over post images.
//!
//! Adds `loading="lazy"` to every `<img>` tag in a post that does not
//! already carry a `loading` attribute. Tags that set one (to any value)
//! are left exactly as written. Each changed post is committed on its own,
//! against the revision fetched for this pass.

use regex::Regex;
use serde::Serialize;
use std::sync::Arc;

use crate::error::{CmsError, CmsResult};
use crate::fanout::map_settled;
use crate::models::file_name;
use crate::store::ContentStore;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LazyUpdate {
    pub name: String,
    /// Tags that gained the attribute.
    pub images: usize,
    /// `None` on a dry run.
    pub commit_sha: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct LazyLoadReport {
    pub posts_scanned: usize,
    pub posts_with_images: usize,
    pub already_lazy: usize,
    pub unreadable_posts: usize,
    pub updated: Vec<LazyUpdate>,
    /// Posts whose rewrite could not be committed.
    pub failed: Vec<String>,
}

impl LazyLoadReport {
    /// Commit of the last successful write, the one the deploy builds.
    pub fn last_commit(&self) -> Option<&str> {
        self.updated.iter().rev().find_map(|u| u.commit_sha.as_deref())
    }
}

pub struct LazyImages {
    store: Arc<dyn ContentStore>,
    posts_dir: String,
    img: Regex,
    loading: Regex,
}

impl LazyImages {
    pub fn new(store: Arc<dyn ContentStore>, posts_dir: &str) -> CmsResult<Self> {
        let img = Regex::new(r"(?i)<img\b[^>]*>")
            .map_err(|e| CmsError::Internal(format!("img pattern: {}", e)))?;
        let loading = Regex::new(r"(?i)\sloading\s*=")
            .map_err(|e| CmsError::Internal(format!("loading pattern: {}", e)))?;
        Ok(Self {
            store,
            posts_dir: posts_dir.to_string(),
            img,
            loading,
        })
    }

    /// Rewrite one post. Returns the new text and how many tags changed, or
    /// `None` when there is nothing to do.
    pub fn rewrite(&self, text: &str) -> Option<(String, usize)> {
        let mut changed = 0;
        let out = self.img.replace_all(text, |caps: &regex::Captures| {
            let tag = &caps[0];
            if self.loading.is_match(tag) {
                return tag.to_string();
            }
            changed += 1;
            match tag.strip_suffix("/>") {
                Some(head) => format!("{} loading=\"lazy\" />", head.trim_end()),
                None => {
                    let head = &tag[..tag.len() - 1];
                    format!("{} loading=\"lazy\">", head.trim_end())
                }
            }
        });
        if changed == 0 {
            None
        } else {
            Some((out.into_owned(), changed))
        }
    }

    fn has_images(&self, text: &str) -> bool {
        self.img.is_match(text)
    }

    /// Scan every post and commit the rewrites, unless `dry_run`.
    pub async fn run(&self, dry_run: bool) -> CmsResult<LazyLoadReport> {
        let entries = match self.store.list(&self.posts_dir).await {
            Ok(entries) => entries,
            Err(e) if e.is_not_found() => Vec::new(),
            Err(e) => return Err(e),
        };
        let posts: Vec<String> = entries
            .into_iter()
            .filter(|e| e.name.ends_with(".md") || e.name.ends_with(".markdown"))
            .map(|e| e.path)
            .collect();

        let fetched = map_settled(posts.clone(), |path| {
            let store = self.store.clone();
            async move { store.get(&path).await }
        })
        .await;

        let mut report = LazyLoadReport {
            posts_scanned: posts.len(),
            ..LazyLoadReport::default()
        };
        for (path, result) in posts.iter().zip(fetched) {
            let file = match result {
                Ok(file) => file,
                Err(e) => {
                    tracing::warn!(path = %path, "skipping unreadable post: {}", e);
                    report.unreadable_posts += 1;
                    continue;
                }
            };
            if !self.has_images(&file.content) {
                continue;
            }
            report.posts_with_images += 1;
            let Some((text, images)) = self.rewrite(&file.content) else {
                report.already_lazy += 1;
                continue;
            };

            let name = file_name(path).to_string();
            if dry_run {
                report.updated.push(LazyUpdate {
                    name,
                    images,
                    commit_sha: None,
                });
                continue;
            }
            // Sequential writes: each commit moves the branch head.
            let message = format!("Add lazy loading to images in {}", name);
            match self.store.put(path, &text, Some(&file.sha), &message).await {
                Ok(commit_sha) => {
                    tracing::info!(path = %path, images, commit = %commit_sha, "added lazy loading");
                    report.updated.push(LazyUpdate {
                        name,
                        images,
                        commit_sha: Some(commit_sha),
                    });
                }
                Err(e) => {
                    tracing::warn!(path = %path, "lazy-loading write failed: {}", e);
                    report.failed.push(name);
                }
            }
        }
        Ok(report)
    }
}
