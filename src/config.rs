use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::models::ContentKind;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub github: GitHubConfig,
    #[serde(default)]
    pub content: ContentConfig,
    #[serde(default)]
    pub cloudinary: Option<CloudinaryConfig>,
    #[serde(default)]
    pub deployments: DeploymentsConfig,
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub state: StateConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct GitHubConfig {
    pub owner: String,
    pub repo: String,
    #[serde(default = "default_branch")]
    pub branch: String,
    #[serde(default = "default_github_api")]
    pub api_url: String,
    #[serde(default = "default_github_token_env")]
    pub token_env: String,
    /// Workflow file name (e.g. `jekyll.yml`) to restrict run history to.
    #[serde(default)]
    pub workflow: Option<String>,
}

fn default_branch() -> String {
    "main".to_string()
}
fn default_github_api() -> String {
    "https://api.github.com".to_string()
}
fn default_github_token_env() -> String {
    "GITHUB_TOKEN".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct ContentConfig {
    #[serde(default = "default_posts_dir")]
    pub posts_dir: String,
    #[serde(default = "default_pages_dir")]
    pub pages_dir: String,
    #[serde(default = "default_bin_dir")]
    pub bin_dir: String,
    #[serde(default = "default_taxonomy_path")]
    pub taxonomy_path: String,
    #[serde(default = "default_site_config_path")]
    pub site_config_path: String,
    /// Site config keys the admin may read and change.
    #[serde(default = "default_settings_fields")]
    pub settings_fields: Vec<String>,
}

impl Default for ContentConfig {
    fn default() -> Self {
        Self {
            posts_dir: default_posts_dir(),
            pages_dir: default_pages_dir(),
            bin_dir: default_bin_dir(),
            taxonomy_path: default_taxonomy_path(),
            site_config_path: default_site_config_path(),
            settings_fields: default_settings_fields(),
        }
    }
}

impl ContentConfig {
    pub fn dir_for(&self, kind: ContentKind) -> &str {
        match kind {
            ContentKind::Post => &self.posts_dir,
            ContentKind::Page => &self.pages_dir,
        }
    }
}

fn default_posts_dir() -> String {
    "_posts".to_string()
}
fn default_pages_dir() -> String {
    "_pages".to_string()
}
fn default_bin_dir() -> String {
    "_bin".to_string()
}
fn default_taxonomy_path() -> String {
    "_data/taxonomy.yml".to_string()
}
fn default_site_config_path() -> String {
    "_config.yml".to_string()
}
fn default_settings_fields() -> Vec<String> {
    [
        "title",
        "description",
        "author",
        "email",
        "url",
        "baseurl",
        "timezone",
        "paginate",
        "permalink",
        "github_username",
        "twitter_username",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

#[derive(Debug, Deserialize, Clone)]
pub struct CloudinaryConfig {
    pub cloud_name: String,
    #[serde(default = "default_cloudinary_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_cloudinary_secret_env")]
    pub api_secret_env: String,
    #[serde(default = "default_cloudinary_api")]
    pub api_url: String,
    #[serde(default)]
    pub upload_folder: Option<String>,
}

fn default_cloudinary_key_env() -> String {
    "CLOUDINARY_API_KEY".to_string()
}
fn default_cloudinary_secret_env() -> String {
    "CLOUDINARY_API_SECRET".to_string()
}
fn default_cloudinary_api() -> String {
    "https://api.cloudinary.com/v1_1".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct DeploymentsConfig {
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_history_poll_interval")]
    pub history_poll_interval_secs: u64,
    /// Give up on a tracked deployment after this long.
    #[serde(default = "default_deployment_timeout")]
    pub timeout_secs: u64,
    /// Finished deployments kept in local state. Oldest evicted first.
    #[serde(default = "default_max_history")]
    pub max_history: usize,
    /// Runs requested from the CI history per poll.
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
    #[serde(default = "default_success_dismiss")]
    pub success_dismiss_secs: u64,
    #[serde(default = "default_failure_dismiss")]
    pub failure_dismiss_secs: u64,
}

impl Default for DeploymentsConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval(),
            history_poll_interval_secs: default_history_poll_interval(),
            timeout_secs: default_deployment_timeout(),
            max_history: default_max_history(),
            history_limit: default_history_limit(),
            success_dismiss_secs: default_success_dismiss(),
            failure_dismiss_secs: default_failure_dismiss(),
        }
    }
}

fn default_poll_interval() -> u64 {
    5
}
fn default_history_poll_interval() -> u64 {
    30
}
fn default_deployment_timeout() -> u64 {
    600
}
fn default_max_history() -> usize {
    50
}
fn default_history_limit() -> usize {
    20
}
fn default_success_dismiss() -> u64 {
    5
}
fn default_failure_dismiss() -> u64 {
    15
}

#[derive(Debug, Deserialize, Clone)]
pub struct HttpConfig {
    /// Deadline for every outbound request.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout_secs(),
            user_agent: default_user_agent(),
        }
    }
}

impl HttpConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

fn default_timeout_secs() -> u64 {
    10
}
fn default_user_agent() -> String {
    format!("sitekeeper/{}", env!("CARGO_PKG_VERSION"))
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    /// In production, error responses omit the `detail` field.
    #[serde(default = "default_production")]
    pub production: bool,
    #[serde(default = "default_admin_token_env")]
    pub admin_token_env: String,
    /// Email reported for the signed-in administrator.
    #[serde(default = "default_admin_email")]
    pub admin_email: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            production: default_production(),
            admin_token_env: default_admin_token_env(),
            admin_email: default_admin_email(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:8787".to_string()
}
fn default_production() -> bool {
    true
}
fn default_admin_token_env() -> String {
    "SITEKEEPER_ADMIN_TOKEN".to_string()
}
fn default_admin_email() -> String {
    "admin@localhost".to_string()
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct StateConfig {
    /// JSON file for deployment history, app settings and the test-mode flag.
    /// Unset keeps state in memory only.
    #[serde(default)]
    pub path: Option<PathBuf>,
}

/// Read a credential from the environment, treating empty values as absent.
pub fn env_credential(var: &str) -> Option<String> {
    std::env::var(var).ok().filter(|v| !v.trim().is_empty())
}

fn check_dir(name: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        anyhow::bail!("content.{} must not be empty", name);
    }
    if value.starts_with('/') || value.ends_with('/') {
        anyhow::bail!("content.{} must not start or end with '/': '{}'", name, value);
    }
    Ok(())
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        if self.github.owner.trim().is_empty() || self.github.repo.trim().is_empty() {
            anyhow::bail!("github.owner and github.repo must be set");
        }

        check_dir("posts_dir", &self.content.posts_dir)?;
        check_dir("pages_dir", &self.content.pages_dir)?;
        check_dir("bin_dir", &self.content.bin_dir)?;
        let dirs = [
            &self.content.posts_dir,
            &self.content.pages_dir,
            &self.content.bin_dir,
        ];
        if dirs[0] == dirs[1] || dirs[0] == dirs[2] || dirs[1] == dirs[2] {
            anyhow::bail!("content.posts_dir, pages_dir and bin_dir must be distinct");
        }

        let d = &self.deployments;
        if d.poll_interval_secs == 0 {
            anyhow::bail!("deployments.poll_interval_secs must be > 0");
        }
        if d.history_poll_interval_secs < d.poll_interval_secs {
            anyhow::bail!("deployments.history_poll_interval_secs must be >= poll_interval_secs");
        }
        if d.timeout_secs <= d.poll_interval_secs {
            anyhow::bail!("deployments.timeout_secs must be > poll_interval_secs");
        }
        if d.max_history == 0 {
            anyhow::bail!("deployments.max_history must be >= 1");
        }
        if d.history_limit == 0 || d.history_limit > 100 {
            anyhow::bail!("deployments.history_limit must be in [1, 100]");
        }

        if self.http.timeout_secs == 0 {
            anyhow::bail!("http.timeout_secs must be > 0");
        }

        Ok(())
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    parse_config(&content)
}

pub fn parse_config(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).with_context(|| "Failed to parse config file")?;
    config.validate()?;
    Ok(config)
}
