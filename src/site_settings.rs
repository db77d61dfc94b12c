//! Site settings: whitelisted fields of the site config YAML.
//!
//! Only keys in `content.settings_fields` are ever returned or written.
//! Everything else in the document is carried through untouched (comments are
//! not: the file is re-serialised).

use serde::Serialize;
use serde_json::{Map, Value};
use serde_yaml::Mapping;
use std::sync::Arc;

use crate::error::{CmsError, CmsResult};
use crate::models::WriteOutcome;
use crate::store::ContentStore;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SiteSettings {
    pub settings: Map<String, Value>,
    pub sha: String,
}

pub struct SiteSettingsService {
    store: Arc<dyn ContentStore>,
    path: String,
    fields: Vec<String>,
}

impl SiteSettingsService {
    pub fn new(store: Arc<dyn ContentStore>, path: impl Into<String>, fields: &[String]) -> Self {
        Self {
            store,
            path: path.into(),
            fields: fields.to_vec(),
        }
    }

    async fn load(&self) -> CmsResult<(Mapping, String)> {
        let file = self.store.get(&self.path).await?;
        let doc: Mapping = if file.content.trim().is_empty() {
            Mapping::new()
        } else {
            serde_yaml::from_str(&file.content)?
        };
        Ok((doc, file.sha))
    }

    pub async fn get(&self) -> CmsResult<SiteSettings> {
        let (doc, sha) = self.load().await?;
        let mut settings = Map::new();
        for field in &self.fields {
            if let Some(value) = doc.get(field.as_str()) {
                let json = serde_json::to_value(value)
                    .map_err(|e| CmsError::Internal(format!("setting '{}': {}", field, e)))?;
                settings.insert(field.clone(), json);
            }
        }
        Ok(SiteSettings { settings, sha })
    }

    /// Merge `changes` into the document.
    ///
    /// Non-whitelisted keys are rejected before the store is contacted. When
    /// `sha` is given it must match the current revision.
    pub async fn update(&self, changes: &Map<String, Value>, sha: Option<&str>) -> CmsResult<WriteOutcome> {
        if changes.is_empty() {
            return Err(CmsError::validation("no settings to update"));
        }
        let rejected: Vec<&str> = changes
            .keys()
            .filter(|k| !self.fields.iter().any(|f| f == *k))
            .map(String::as_str)
            .collect();
        if !rejected.is_empty() {
            return Err(CmsError::validation(format!(
                "settings not allowed: {}",
                rejected.join(", ")
            )));
        }
        if let Some((key, _)) = changes.iter().find(|(_, v)| v.is_object()) {
            return Err(CmsError::validation(format!("setting '{}' must not be an object", key)));
        }

        let (mut doc, current) = self.load().await?;
        if let Some(sha) = sha {
            if sha != current {
                return Err(CmsError::conflict(format!("{} has changed since it was read", self.path)));
            }
        }
        for (key, value) in changes {
            let yaml = serde_yaml::to_value(value)?;
            doc.insert(serde_yaml::Value::String(key.clone()), yaml);
        }
        let text = serde_yaml::to_string(&doc)
            .map_err(|e| CmsError::Internal(format!("site config yaml: {}", e)))?;

        let keys: Vec<&str> = changes.keys().map(String::as_str).collect();
        let commit_sha = self
            .store
            .put(&self.path, &text, Some(&current), &format!("Update site settings: {}", keys.join(", ")))
            .await?;
        tracing::info!(commit = %commit_sha, fields = %keys.join(","), "site settings updated");
        Ok(WriteOutcome {
            path: self.path.clone(),
            commit_sha,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryStore, StoreOp};
    use serde_json::json;

    const CONFIG: &str = "title: My Blog\npaginate: 10\nplugins:\n  - jekyll-feed\nsecret_key: hidden\n";

    fn service() -> (SiteSettingsService, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        store.insert("_config.yml", CONFIG);
        let fields = vec!["title".to_string(), "paginate".to_string(), "description".to_string()];
        (SiteSettingsService::new(store.clone(), "_config.yml", &fields), store)
    }

    fn changes(v: Value) -> Map<String, Value> {
        v.as_object().cloned().unwrap()
    }

    #[tokio::test]
    async fn test_get_returns_only_whitelisted() {
        let (svc, _) = service();
        let s = svc.get().await.unwrap();
        assert_eq!(s.settings.len(), 2);
        assert_eq!(s.settings["title"], json!("My Blog"));
        assert_eq!(s.settings["paginate"], json!(10));
        assert!(!s.settings.contains_key("secret_key"));
    }

    #[tokio::test]
    async fn test_update_merges_and_keeps_other_keys() {
        let (svc, store) = service();
        svc.update(&changes(json!({"title": "Renamed", "description": "About"})), None)
            .await
            .unwrap();
        let text = store.content("_config.yml").unwrap();
        let doc: Mapping = serde_yaml::from_str(&text).unwrap();
        assert_eq!(doc.get("title").and_then(|v| v.as_str()), Some("Renamed"));
        assert_eq!(doc.get("description").and_then(|v| v.as_str()), Some("About"));
        assert_eq!(doc.get("secret_key").and_then(|v| v.as_str()), Some("hidden"));
    }

    #[tokio::test]
    async fn test_rejects_unlisted_keys_without_store_access() {
        let (svc, store) = service();
        store.fail(StoreOp::Get, "_config.yml");
        let err = svc
            .update(&changes(json!({"title": "x", "plugins": []})), None)
            .await
            .unwrap_err();
        assert!(matches!(err, CmsError::Validation(ref m) if m.contains("plugins")));
    }

    #[tokio::test]
    async fn test_stale_sha_conflicts() {
        let (svc, _) = service();
        let err = svc
            .update(&changes(json!({"title": "x"})), Some("old"))
            .await
            .unwrap_err();
        assert!(matches!(err, CmsError::Conflict(_)));
    }
}
