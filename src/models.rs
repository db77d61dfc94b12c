//! Core data models shared by the content, bin and media modules.
//!
//! Deployment records live in [`crate::deployments`].

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;

use crate::error::{CmsError, CmsResult};
use crate::frontmatter::Frontmatter;

/// Whether a content file is a dated blog post or a standalone page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentKind {
    Post,
    Page,
}

impl ContentKind {
    /// Classify a file by name: a `YYYY-MM-DD-` prefix means a post.
    pub fn infer(filename: &str) -> Self {
        if is_dated_filename(filename) {
            ContentKind::Post
        } else {
            ContentKind::Page
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ContentKind::Post => "post",
            ContentKind::Page => "page",
        }
    }
}

impl std::fmt::Display for ContentKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ContentKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "post" | "posts" => Ok(ContentKind::Post),
            "page" | "pages" => Ok(ContentKind::Page),
            other => Err(format!("unknown content kind '{}': expected post or page", other)),
        }
    }
}

fn dated_prefix() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\d{4}-\d{2}-\d{2}-").expect("static regex"))
}

/// The single post-vs-page predicate. Accepts a bare filename or a path;
/// only the final path segment is inspected.
pub fn is_dated_filename(name: &str) -> bool {
    dated_prefix().is_match(file_name(name))
}

/// Final `/`-separated segment of a store path.
pub fn file_name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

/// Content filenames are a single path segment ending in `.md` or `.markdown`.
pub fn check_filename(name: &str) -> CmsResult<()> {
    if name.is_empty() || name.contains('/') || name.contains('\\') || name.starts_with('.') {
        return Err(CmsError::validation(format!("invalid filename '{}'", name)));
    }
    if !(name.ends_with(".md") || name.ends_with(".markdown")) {
        return Err(CmsError::validation(format!(
            "'{}' must end in .md or .markdown",
            name
        )));
    }
    Ok(())
}

/// A file fetched from the content store.
#[derive(Debug, Clone)]
pub struct StoredFile {
    pub path: String,
    pub content: String,
    /// Revision token required to update or delete this exact version.
    pub sha: String,
}

/// One entry of a directory listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreEntry {
    pub name: String,
    pub path: String,
    pub sha: String,
    pub size: u64,
}

/// A Markdown file split into its header and body.
#[derive(Debug, Clone, Serialize)]
pub struct ContentItem {
    pub path: String,
    pub kind: ContentKind,
    pub frontmatter: Frontmatter,
    pub body: String,
    pub sha: String,
}

/// A file parked in the bin directory, as shown in the bin listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BinItem {
    pub name: String,
    pub path: String,
    pub sha: String,
    pub size: u64,
    pub kind: ContentKind,
    /// `None` when the entry's content could not be fetched or lacks the field.
    pub binned_at: Option<String>,
}

/// Result of a write: the commit identifier the CI pipeline will build.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteOutcome {
    pub path: String,
    pub commit_sha: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dated_prefix_detects_posts() {
        assert!(is_dated_filename("2025-10-21-title.md"));
        assert!(is_dated_filename("_posts/2025-10-21-title.md"));
        assert!(is_dated_filename("_bin/2025-01-01-x-2025-03-04T05-06-07.md"));
        assert!(!is_dated_filename("about.md"));
        assert!(!is_dated_filename("2025-10-21.md"));
        assert!(!is_dated_filename("notes/2025-10-title.md"));
    }

    #[test]
    fn test_check_filename() {
        assert!(check_filename("2025-01-01-x.md").is_ok());
        assert!(check_filename("about.markdown").is_ok());
        assert!(check_filename("../etc/passwd.md").is_err());
        assert!(check_filename(".hidden.md").is_err());
        assert!(check_filename("notes.txt").is_err());
        assert!(check_filename("").is_err());
    }

    #[test]
    fn test_infer_kind() {
        assert_eq!(ContentKind::infer("2024-02-29-leap.md"), ContentKind::Post);
        assert_eq!(ContentKind::infer("contact.md"), ContentKind::Page);
    }

    #[test]
    fn test_kind_from_str() {
        assert_eq!("posts".parse::<ContentKind>().unwrap(), ContentKind::Post);
        assert_eq!("page".parse::<ContentKind>().unwrap(), ContentKind::Page);
        assert!("draft".parse::<ContentKind>().is_err());
    }
}
