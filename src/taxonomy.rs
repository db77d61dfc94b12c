//! Taxonomy document: categories (one level of children) and tags.
//!
//! ```yaml
//! categories:
//!   - item: Travel
//!     slug: travel
//!     children:
//!       - item: Japan
//!         slug: japan
//! tags:
//!   - item: Rust
//!     slug: rust
//! ```
//!
//! Older documents list bare strings instead of `{item, slug}` maps. Both
//! forms are accepted on read; writes always emit the map form. A missing
//! slug is derived from the item.

use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::error::{CmsError, CmsResult};
use crate::models::WriteOutcome;
use crate::store::ContentStore;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaxonomyEntry {
    pub item: String,
    pub slug: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<TaxonomyEntry>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawTaxonomy")]
pub struct Taxonomy {
    pub categories: Vec<TaxonomyEntry>,
    pub tags: Vec<TaxonomyEntry>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawEntry {
    Plain(String),
    Full {
        #[serde(default)]
        item: String,
        #[serde(default)]
        slug: Option<String>,
        #[serde(default)]
        children: Vec<RawEntry>,
    },
}

#[derive(Deserialize)]
struct RawTaxonomy {
    #[serde(default)]
    categories: Vec<RawEntry>,
    #[serde(default)]
    tags: Vec<RawEntry>,
}

impl RawEntry {
    fn normalise(self, what: &str, depth: usize, max_depth: usize) -> Result<TaxonomyEntry, String> {
        let (item, slug, children) = match self {
            RawEntry::Plain(item) => (item, None, Vec::new()),
            RawEntry::Full { item, slug, children } => (item, slug, children),
        };
        let item = item.trim().to_string();
        if item.is_empty() {
            return Err(format!("{} entry is missing 'item'", what));
        }
        if !children.is_empty() && depth >= max_depth {
            return Err(format!("{} '{}' is nested too deeply", what, item));
        }
        let slug = match slug.map(|s| s.trim().to_string()) {
            Some(s) if !s.is_empty() => s,
            _ => slugify(&item),
        };
        let children = children
            .into_iter()
            .map(|c| c.normalise(what, depth + 1, max_depth))
            .collect::<Result<_, _>>()?;
        Ok(TaxonomyEntry { item, slug, children })
    }
}

impl TryFrom<RawTaxonomy> for Taxonomy {
    type Error = String;

    fn try_from(raw: RawTaxonomy) -> Result<Self, Self::Error> {
        Ok(Taxonomy {
            categories: raw
                .categories
                .into_iter()
                .map(|e| e.normalise("category", 0, 1))
                .collect::<Result<_, _>>()?,
            tags: raw
                .tags
                .into_iter()
                .map(|e| e.normalise("tag", 0, 0))
                .collect::<Result<_, _>>()?,
        })
    }
}

/// Plain lists for consumers that predate hierarchical categories.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FlatTaxonomy {
    pub categories: Vec<String>,
    pub tags: Vec<String>,
}

impl Taxonomy {
    pub fn from_yaml(text: &str) -> CmsResult<Self> {
        if text.trim().is_empty() {
            return Ok(Taxonomy::default());
        }
        Ok(serde_yaml::from_str(text)?)
    }

    pub fn to_yaml(&self) -> CmsResult<String> {
        serde_yaml::to_string(self).map_err(|e| CmsError::Internal(format!("taxonomy yaml: {}", e)))
    }

    /// Parents then their children, depth first.
    pub fn flatten(&self) -> FlatTaxonomy {
        let mut categories = Vec::new();
        for parent in &self.categories {
            categories.push(parent.item.clone());
            categories.extend(parent.children.iter().map(|c| c.item.clone()));
        }
        FlatTaxonomy {
            categories,
            tags: self.tags.iter().map(|t| t.item.clone()).collect(),
        }
    }
}

/// Lowercase ASCII alphanumerics separated by single dashes.
pub fn slugify(text: &str) -> String {
    let mut slug = String::with_capacity(text.len());
    for c in text.chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c.to_ascii_lowercase());
        } else if !slug.is_empty() && !slug.ends_with('-') {
            slug.push('-');
        }
    }
    while slug.ends_with('-') {
        slug.pop();
    }
    slug
}

#[derive(Debug, Clone, Serialize)]
pub struct TaxonomyDocument {
    pub taxonomy: Taxonomy,
    /// `None` when the document does not exist yet.
    pub sha: Option<String>,
}

pub struct TaxonomyService {
    store: Arc<dyn ContentStore>,
    path: String,
}

impl TaxonomyService {
    pub fn new(store: Arc<dyn ContentStore>, path: impl Into<String>) -> Self {
        Self {
            store,
            path: path.into(),
        }
    }

    pub async fn get(&self) -> CmsResult<TaxonomyDocument> {
        match self.store.get(&self.path).await {
            Ok(file) => Ok(TaxonomyDocument {
                taxonomy: Taxonomy::from_yaml(&file.content)?,
                sha: Some(file.sha),
            }),
            Err(e) if e.is_not_found() => Ok(TaxonomyDocument {
                taxonomy: Taxonomy::default(),
                sha: None,
            }),
            Err(e) => Err(e),
        }
    }

    /// Write `taxonomy` back. With `sha` the write is conditional on it;
    /// without, the current revision is fetched and overwritten.
    pub async fn update(&self, taxonomy: &Taxonomy, sha: Option<&str>) -> CmsResult<WriteOutcome> {
        let yaml = taxonomy.to_yaml()?;
        let current = match sha {
            Some(sha) => Some(sha.to_string()),
            None => self.get().await?.sha,
        };
        let commit_sha = self
            .store
            .put(&self.path, &yaml, current.as_deref(), "Update taxonomy")
            .await?;
        tracing::info!(commit = %commit_sha, "taxonomy updated");
        Ok(WriteOutcome {
            path: self.path.clone(),
            commit_sha,
        })
    }
}
