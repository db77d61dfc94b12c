//! Image audit: Cloudinary references in posts against uploaded assets.
//!
//! References come from two places in each post:
//!
//! - delivery URLs anywhere in the file,
//!   `https://res.cloudinary.com/<cloud>/image/upload/<transform>/<public_id>`,
//!   with any `v123/` version segment and image extension dropped;
//! - the `featured_image` / `image` frontmatter fields, which hold either
//!   such a URL or a bare public ID.
//!
//! A post that cannot be fetched is counted and skipped.

use regex::Regex;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use crate::cloudinary::ImageStore;
use crate::error::{CmsError, CmsResult};
use crate::fanout::map_settled;
use crate::frontmatter;
use crate::models::file_name;
use crate::store::ContentStore;

const IMAGE_FIELDS: [&str; 2] = ["featured_image", "image"];

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MissingImage {
    pub public_id: String,
    /// Filenames of the posts that reference it.
    pub posts: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AuditReport {
    pub posts_scanned: usize,
    pub unreadable_posts: usize,
    pub cloudinary_assets: usize,
    pub unique_references: usize,
    pub total_references: usize,
    pub missing: Vec<MissingImage>,
    pub unused: Vec<String>,
}

pub struct ImageAuditor {
    store: Arc<dyn ContentStore>,
    images: Arc<dyn ImageStore>,
    posts_dir: String,
    pattern: Regex,
}

impl ImageAuditor {
    pub fn new(
        store: Arc<dyn ContentStore>,
        images: Arc<dyn ImageStore>,
        posts_dir: &str,
        cloud_name: &str,
    ) -> CmsResult<Self> {
        let pattern = Regex::new(&format!(
            r#"https://res\.cloudinary\.com/{}/image/upload/[^\s"'<>()]+"#,
            regex::escape(cloud_name)
        ))
        .map_err(|e| CmsError::Internal(format!("audit pattern: {}", e)))?;
        Ok(Self {
            store,
            images,
            posts_dir: posts_dir.to_string(),
            pattern,
        })
    }

    /// Public IDs referenced by one post, in order of appearance (duplicates kept).
    pub fn references(&self, text: &str) -> Vec<String> {
        let mut refs: Vec<String> = self
            .pattern
            .find_iter(text)
            .filter_map(|m| public_id_from_url(m.as_str()))
            .collect();

        let (fm, _) = frontmatter::parse(text);
        for field in IMAGE_FIELDS {
            if let Some(value) = fm.get_str(field) {
                let value = value.trim();
                if !value.is_empty() && !value.contains("://") {
                    refs.push(strip_extension(value).to_string());
                }
            }
        }
        refs
    }

    pub async fn run(&self) -> CmsResult<AuditReport> {
        let resources = self.images.list_resources().await?;
        let uploaded: BTreeSet<String> = resources.into_iter().map(|r| r.public_id).collect();

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

        let mut referenced: BTreeMap<String, Vec<String>> = BTreeMap::new();
        let mut unreadable = 0;
        let mut total = 0;
        for (path, result) in posts.iter().zip(fetched) {
            let file = match result {
                Ok(file) => file,
                Err(e) => {
                    tracing::warn!(path = %path, "skipping unreadable post: {}", e);
                    unreadable += 1;
                    continue;
                }
            };
            for public_id in self.references(&file.content) {
                total += 1;
                let posts = referenced.entry(public_id).or_default();
                let name = file_name(path).to_string();
                if !posts.contains(&name) {
                    posts.push(name);
                }
            }
        }

        let missing = referenced
            .iter()
            .filter(|(id, _)| !uploaded.contains(*id))
            .map(|(id, posts)| MissingImage {
                public_id: id.clone(),
                posts: posts.clone(),
            })
            .collect();
        let unused = uploaded
            .iter()
            .filter(|id| !referenced.contains_key(*id))
            .cloned()
            .collect();

        Ok(AuditReport {
            posts_scanned: posts.len() - unreadable,
            unreadable_posts: unreadable,
            cloudinary_assets: uploaded.len(),
            unique_references: referenced.len(),
            total_references: total,
            missing,
            unused,
        })
    }
}

fn public_id_from_url(url: &str) -> Option<String> {
    let marker = "/image/upload/";
    let rest = &url[url.find(marker)? + marker.len()..];
    let segments: Vec<&str> = rest.split('/').filter(|s| !s.is_empty()).collect();
    // Transformation segments contain commas or `x_` prefixes; the version
    // segment ends them. Without a version, the first segment is the
    // transformation when there are more than one.
    let start = match segments.iter().position(|s| is_version(s)) {
        Some(v) => v + 1,
        None if segments.len() > 1 && is_transformation(segments[0]) => 1,
        None => 0,
    };
    let id = segments.get(start..)?.join("/");
    if id.is_empty() {
        return None;
    }
    Some(strip_extension(&id).to_string())
}

fn is_version(segment: &str) -> bool {
    segment.len() > 1
        && segment.starts_with('v')
        && segment[1..].bytes().all(|b| b.is_ascii_digit())
}

fn is_transformation(segment: &str) -> bool {
    segment.contains(',')
        || segment
            .split_once('_')
            .is_some_and(|(k, _)| !k.is_empty() && k.len() <= 3 && k.bytes().all(|b| b.is_ascii_lowercase()))
}

fn strip_extension(id: &str) -> &str {
    for ext in [".jpg", ".jpeg", ".png", ".gif", ".webp", ".avif", ".svg"] {
        if id.len() > ext.len() && id[id.len() - ext.len()..].eq_ignore_ascii_case(ext) {
            return &id[..id.len() - ext.len()];
        }
    }
    id
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloudinary::MemoryImageStore;
    use crate::store::{MemoryStore, StoreOp};

    fn auditor(store: Arc<MemoryStore>, images: MemoryImageStore) -> ImageAuditor {
        ImageAuditor::new(store, Arc::new(images), "_posts", "demo").unwrap()
    }

    #[test]
    fn test_extracts_public_ids() {
        let a = auditor(Arc::new(MemoryStore::new()), MemoryImageStore::new());
        let text = r#"---
title: Hi
featured_image: 05/cover
---
![x](https://res.cloudinary.com/demo/image/upload/w_800,q_auto/v1699999/05/photo.jpg)
<img src="https://res.cloudinary.com/demo/image/upload/f_auto/diagram.png">
https://res.cloudinary.com/demo/image/upload/plain
https://res.cloudinary.com/other/image/upload/v1/elsewhere.jpg
"#;
        assert_eq!(a.references(text), vec!["05/photo", "diagram", "plain", "05/cover"]);
    }

    #[tokio::test]
    async fn test_reports_missing_and_unused() {
        let store = Arc::new(MemoryStore::new());
        store.insert(
            "_posts/2025-01-01-a.md",
            "---\ntitle: A\n---\nhttps://res.cloudinary.com/demo/image/upload/v1/one.jpg\nhttps://res.cloudinary.com/demo/image/upload/v1/gone.jpg",
        );
        store.insert(
            "_posts/2025-01-02-b.md",
            "---\ntitle: B\nfeatured_image: gone\n---\nno images",
        );
        store.insert("_posts/2025-01-03-c.md", "unreadable");
        store.insert("_posts/notes.txt", "https://res.cloudinary.com/demo/image/upload/v1/txt.jpg");
        store.fail(StoreOp::Get, "_posts/2025-01-03-c.md");

        let report = auditor(store, MemoryImageStore::with_public_ids(&["one", "spare"]))
            .run()
            .await
            .unwrap();

        assert_eq!(report.posts_scanned, 2);
        assert_eq!(report.unreadable_posts, 1);
        assert_eq!(report.total_references, 3);
        assert_eq!(report.unique_references, 2);
        assert_eq!(
            report.missing,
            vec![MissingImage {
                public_id: "gone".into(),
                posts: vec!["2025-01-01-a.md".into(), "2025-01-02-b.md".into()],
            }]
        );
        assert_eq!(report.unused, vec!["spare".to_string()]);
    }

    #[tokio::test]
    async fn test_missing_posts_dir_is_empty_audit() {
        let report = auditor(Arc::new(MemoryStore::new()), MemoryImageStore::with_public_ids(&["x"]))
            .run()
            .await
            .unwrap();
        assert_eq!(report.posts_scanned, 0);
        assert_eq!(report.unused, vec!["x".to_string()]);
    }
}
