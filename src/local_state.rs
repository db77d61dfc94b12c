//! Persisted local state: a small JSON key-value file.
//!
//! Holds the finished-deployment log, the app settings blob (poll intervals
//! and timeouts) and the test-mode flag. Without a path the state lives in
//! memory for the lifetime of the process.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use crate::config::DeploymentsConfig;
use crate::error::{CmsError, CmsResult};

pub const DEPLOYMENTS_KEY: &str = "deployments";
pub const SETTINGS_KEY: &str = "app_settings";
pub const TEST_MODE_KEY: &str = "test_mode";

pub struct LocalState {
    path: Option<PathBuf>,
    values: Mutex<Map<String, Value>>,
}

impl LocalState {
    pub fn in_memory() -> Self {
        Self {
            path: None,
            values: Mutex::new(Map::new()),
        }
    }

    /// Open (or start) the state file at `path`. A corrupt file is logged and
    /// replaced on the next write rather than failing startup.
    pub fn open(path: &Path) -> CmsResult<Self> {
        let values = if path.exists() {
            let raw = std::fs::read_to_string(path)?;
            match serde_json::from_str::<Map<String, Value>>(&raw) {
                Ok(map) => map,
                Err(e) => {
                    tracing::warn!(path = %path.display(), "ignoring unreadable state file: {}", e);
                    Map::new()
                }
            }
        } else {
            Map::new()
        };
        Ok(Self {
            path: Some(path.to_path_buf()),
            values: Mutex::new(values),
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Typed read. A value that no longer matches `T` reads as absent.
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let value = self
            .values
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(key)
            .cloned()?;
        match serde_json::from_value(value) {
            Ok(v) => Some(v),
            Err(e) => {
                tracing::warn!(key, "discarding stale local state entry: {}", e);
                None
            }
        }
    }

    pub fn set<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> CmsResult<()> {
        let value = serde_json::to_value(value)?;
        let snapshot = {
            let mut values = self.values.lock().unwrap_or_else(|e| e.into_inner());
            values.insert(key.to_string(), value);
            values.clone()
        };
        self.flush(&snapshot)
    }

    pub fn remove(&self, key: &str) -> CmsResult<()> {
        let snapshot = {
            let mut values = self.values.lock().unwrap_or_else(|e| e.into_inner());
            values.remove(key);
            values.clone()
        };
        self.flush(&snapshot)
    }

    pub fn test_mode(&self) -> bool {
        self.get::<bool>(TEST_MODE_KEY).unwrap_or(false)
    }

    pub fn set_test_mode(&self, enabled: bool) -> CmsResult<()> {
        self.set(TEST_MODE_KEY, &enabled)
    }

    // Write to a sibling temp file and rename so a crash never leaves half a file.
    fn flush(&self, values: &Map<String, Value>) -> CmsResult<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_string_pretty(values)?)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }
}

/// Poll intervals and timeouts the admin can tune at runtime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppSettings {
    pub poll_interval_secs: u64,
    pub history_poll_interval_secs: u64,
    pub deployment_timeout_secs: u64,
    pub max_history: usize,
    pub history_limit: usize,
    pub success_dismiss_secs: u64,
    pub failure_dismiss_secs: u64,
}

impl From<&DeploymentsConfig> for AppSettings {
    fn from(cfg: &DeploymentsConfig) -> Self {
        Self {
            poll_interval_secs: cfg.poll_interval_secs,
            history_poll_interval_secs: cfg.history_poll_interval_secs,
            deployment_timeout_secs: cfg.timeout_secs,
            max_history: cfg.max_history,
            history_limit: cfg.history_limit,
            success_dismiss_secs: cfg.success_dismiss_secs,
            failure_dismiss_secs: cfg.failure_dismiss_secs,
        }
    }
}

impl AppSettings {
    /// Saved settings if present and valid, otherwise the configured defaults.
    pub fn resolve(state: &LocalState, defaults: &DeploymentsConfig) -> Self {
        match state.get::<AppSettings>(SETTINGS_KEY) {
            Some(saved) if saved.validate().is_ok() => saved,
            Some(_) => {
                tracing::warn!("saved app settings are invalid; using configured defaults");
                AppSettings::from(defaults)
            }
            None => AppSettings::from(defaults),
        }
    }

    pub fn validate(&self) -> CmsResult<()> {
        if self.poll_interval_secs == 0 {
            return Err(CmsError::validation("poll_interval_secs must be > 0"));
        }
        if self.history_poll_interval_secs < self.poll_interval_secs {
            return Err(CmsError::validation(
                "history_poll_interval_secs must be >= poll_interval_secs",
            ));
        }
        if self.deployment_timeout_secs <= self.poll_interval_secs {
            return Err(CmsError::validation(
                "deployment_timeout_secs must be > poll_interval_secs",
            ));
        }
        if self.max_history == 0 {
            return Err(CmsError::validation("max_history must be >= 1"));
        }
        if self.history_limit == 0 || self.history_limit > 100 {
            return Err(CmsError::validation("history_limit must be in [1, 100]"));
        }
        Ok(())
    }

    pub fn save(&self, state: &LocalState) -> CmsResult<()> {
        self.validate()?;
        state.set(SETTINGS_KEY, self)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn history_poll_interval(&self) -> Duration {
        Duration::from_secs(self.history_poll_interval_secs)
    }
}
