//! GitHub backends: the Contents API as a [`ContentStore`] and the Actions
//! run list as a [`RunHistory`].
//!
//! Both share one authenticated client. Every request carries the bearer
//! token, the `application/vnd.github+json` media type and a pinned API
//! version, and is bounded by the configured HTTP deadline.
//!
//! Status mapping for the Contents API:
//!
//! | GitHub | Error |
//! |--------|-------|
//! | 404 | `NotFound` |
//! | 409 (sha mismatch) / 422 (create over existing file) | `Conflict` |
//! | other non-2xx | `Upstream` |

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, Utc};
use reqwest::{Client, Method, RequestBuilder, Response, Url};
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;

use crate::config::{env_credential, GitHubConfig, HttpConfig};
use crate::deployments::{RunHistory, WorkflowRun};
use crate::error::{CmsError, CmsResult};
use crate::http;
use crate::models::{StoreEntry, StoredFile};
use crate::store::ContentStore;

const SERVICE: &str = "github";
const API_VERSION: &str = "2022-11-28";

pub struct GitHubClient {
    http: Client,
    api_url: Url,
    owner: String,
    repo: String,
    branch: String,
    workflow: Option<String>,
    token: String,
    deadline: Duration,
}

#[derive(Deserialize)]
struct ContentsFile {
    path: String,
    sha: String,
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    encoding: Option<String>,
}

#[derive(Deserialize)]
struct ContentsEntry {
    name: String,
    path: String,
    sha: String,
    #[serde(default)]
    size: u64,
    #[serde(rename = "type")]
    kind: String,
}

#[derive(Deserialize)]
struct CommitResponse {
    commit: CommitRef,
}

#[derive(Deserialize)]
struct CommitRef {
    sha: String,
}

#[derive(Deserialize)]
struct RunsResponse {
    #[serde(default)]
    workflow_runs: Vec<RawRun>,
}

#[derive(Deserialize)]
struct RawRun {
    head_sha: String,
    #[serde(default)]
    display_title: Option<String>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    conclusion: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    #[serde(default)]
    html_url: Option<String>,
}

impl From<RawRun> for WorkflowRun {
    fn from(raw: RawRun) -> Self {
        WorkflowRun {
            commit_sha: raw.head_sha,
            display_title: raw.display_title.or(raw.name).unwrap_or_default(),
            status: raw.status.unwrap_or_else(|| "queued".to_string()),
            conclusion: raw.conclusion,
            created_at: raw.created_at,
            updated_at: raw.updated_at,
            url: raw.html_url,
        }
    }
}

impl GitHubClient {
    pub fn new(cfg: &GitHubConfig, http_cfg: &HttpConfig, token: String) -> CmsResult<Self> {
        let api_url = Url::parse(&cfg.api_url)
            .map_err(|e| CmsError::Internal(format!("invalid github.api_url '{}': {}", cfg.api_url, e)))?;
        Ok(Self {
            http: http::build_client(http_cfg)?,
            api_url,
            owner: cfg.owner.clone(),
            repo: cfg.repo.clone(),
            branch: cfg.branch.clone(),
            workflow: cfg.workflow.clone(),
            token,
            deadline: http_cfg.timeout(),
        })
    }

    /// Build a client with the token from `cfg.token_env`. `Unconfigured` if unset.
    pub fn from_config(cfg: &GitHubConfig, http_cfg: &HttpConfig) -> CmsResult<Self> {
        let token = env_credential(&cfg.token_env).ok_or_else(|| {
            CmsError::Unconfigured(format!("GitHub token (${}) is not set", cfg.token_env))
        })?;
        Self::new(cfg, http_cfg, token)
    }

    pub fn branch(&self) -> &str {
        &self.branch
    }

    fn repo_url<'a>(&self, segments: impl IntoIterator<Item = &'a str>) -> CmsResult<Url> {
        let mut url = self.api_url.clone();
        url.path_segments_mut()
            .map_err(|_| CmsError::Internal(format!("github.api_url cannot be a base: {}", self.api_url)))?
            .pop_if_empty()
            .extend(["repos", self.owner.as_str(), self.repo.as_str()])
            .extend(segments);
        Ok(url)
    }

    fn contents_url(&self, path: &str) -> CmsResult<Url> {
        let path = path.trim_matches('/');
        let mut segments = vec!["contents"];
        segments.extend(path.split('/').filter(|s| !s.is_empty()));
        self.repo_url(segments)
    }

    fn request(&self, method: Method, url: Url) -> RequestBuilder {
        self.http
            .request(method, url)
            .bearer_auth(&self.token)
            .header("Accept", "application/vnd.github+json")
            .header("X-GitHub-Api-Version", API_VERSION)
    }

    async fn send(&self, what: &str, req: RequestBuilder) -> CmsResult<Response> {
        tracing::debug!(what, "github request");
        http::send(SERVICE, what, req, self.deadline).await
    }

    /// Map a non-2xx Contents API response onto the error taxonomy.
    async fn contents_error(what: &str, resp: Response) -> CmsError {
        match resp.status().as_u16() {
            404 => CmsError::NotFound(what.to_string()),
            409 | 422 => {
                let body = resp.text().await.unwrap_or_default();
                CmsError::Conflict(format!("{}: {}", what, github_message(&body)))
            }
            _ => http::upstream_error(SERVICE, what, resp).await,
        }
    }

    async fn write(&self, method: Method, path: &str, body: serde_json::Value) -> CmsResult<String> {
        let what = format!("{} {}", method, path);
        let req = self.request(method, self.contents_url(path)?).json(&body);
        let resp = self.send(&what, req).await?;
        if !resp.status().is_success() {
            return Err(Self::contents_error(&what, resp).await);
        }
        let commit: CommitResponse = http::read_json(SERVICE, &what, resp).await?;
        Ok(commit.commit.sha)
    }

    fn runs_url(&self) -> CmsResult<Url> {
        match &self.workflow {
            Some(wf) => self.repo_url(["actions", "workflows", wf.as_str(), "runs"]),
            None => self.repo_url(["actions", "runs"]),
        }
    }

    async fn fetch_runs(&self, extra: &[(&str, &str)], per_page: usize) -> CmsResult<Vec<WorkflowRun>> {
        let what = "GET actions runs";
        let per_page = per_page.clamp(1, 100).to_string();
        let mut query = vec![("branch", self.branch.as_str()), ("per_page", per_page.as_str())];
        query.extend_from_slice(extra);
        let req = self.request(Method::GET, self.runs_url()?).query(&query);
        let resp = self.send(what, req).await?;
        if !resp.status().is_success() {
            return Err(http::upstream_error(SERVICE, what, resp).await);
        }
        let runs: RunsResponse = http::read_json(SERVICE, what, resp).await?;
        Ok(runs.workflow_runs.into_iter().map(WorkflowRun::from).collect())
    }
}

/// Pull `message` out of a GitHub error body, falling back to the raw text.
fn github_message(body: &str) -> String {
    serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|v| v.get("message").and_then(|m| m.as_str()).map(String::from))
        .unwrap_or_else(|| body.chars().take(200).collect())
}

/// Decode the Contents API payload. GitHub wraps base64 at 60 columns.
fn decode_content(path: &str, encoded: &str) -> CmsResult<String> {
    let compact: String = encoded.chars().filter(|c| !c.is_whitespace()).collect();
    let bytes = BASE64
        .decode(compact)
        .map_err(|e| CmsError::Internal(format!("{}: invalid base64 content: {}", path, e)))?;
    String::from_utf8(bytes).map_err(|_| CmsError::Internal(format!("{}: content is not UTF-8", path)))
}

#[async_trait]
impl ContentStore for GitHubClient {
    async fn get(&self, path: &str) -> CmsResult<StoredFile> {
        let what = format!("GET {}", path);
        let req = self
            .request(Method::GET, self.contents_url(path)?)
            .query(&[("ref", self.branch.as_str())]);
        let resp = self.send(&what, req).await?;
        if !resp.status().is_success() {
            return Err(Self::contents_error(&what, resp).await);
        }
        let value: serde_json::Value = http::read_json(SERVICE, &what, resp).await?;
        if value.is_array() {
            // A directory, not a file.
            return Err(CmsError::NotFound(format!("{} is a directory", path)));
        }
        let file: ContentsFile = serde_json::from_value(value)?;
        let content = match (file.encoding.as_deref(), file.content.as_deref()) {
            (Some("base64"), Some(encoded)) => decode_content(&file.path, encoded)?,
            (None, Some(raw)) => raw.to_string(),
            _ => {
                return Err(CmsError::Upstream {
                    service: SERVICE,
                    status: 200,
                    message: format!("{}: content not inlined (file too large?)", path),
                })
            }
        };
        Ok(StoredFile {
            path: file.path,
            content,
            sha: file.sha,
        })
    }

    async fn put(
        &self,
        path: &str,
        content: &str,
        sha: Option<&str>,
        message: &str,
    ) -> CmsResult<String> {
        let mut body = json!({
            "message": message,
            "content": BASE64.encode(content.as_bytes()),
            "branch": self.branch,
        });
        if let Some(sha) = sha {
            body["sha"] = json!(sha);
        }
        self.write(Method::PUT, path, body).await
    }

    async fn delete(&self, path: &str, sha: &str, message: &str) -> CmsResult<String> {
        let body = json!({
            "message": message,
            "sha": sha,
            "branch": self.branch,
        });
        self.write(Method::DELETE, path, body).await
    }

    async fn list(&self, dir: &str) -> CmsResult<Vec<StoreEntry>> {
        let what = format!("GET {}/", dir);
        let req = self
            .request(Method::GET, self.contents_url(dir)?)
            .query(&[("ref", self.branch.as_str())]);
        let resp = self.send(&what, req).await?;
        if !resp.status().is_success() {
            return Err(Self::contents_error(&what, resp).await);
        }
        let value: serde_json::Value = http::read_json(SERVICE, &what, resp).await?;
        if !value.is_array() {
            return Err(CmsError::NotFound(format!("{} is not a directory", dir)));
        }
        let entries: Vec<ContentsEntry> = serde_json::from_value(value)?;
        Ok(entries
            .into_iter()
            .filter(|e| e.kind == "file")
            .map(|e| StoreEntry {
                name: e.name,
                path: e.path,
                sha: e.sha,
                size: e.size,
            })
            .collect())
    }
}

#[async_trait]
impl RunHistory for GitHubClient {
    async fn recent_runs(&self, limit: usize) -> CmsResult<Vec<WorkflowRun>> {
        self.fetch_runs(&[], limit).await
    }

    async fn run_for_commit(&self, commit_sha: &str) -> CmsResult<Option<WorkflowRun>> {
        let runs = self.fetch_runs(&[("head_sha", commit_sha)], 1).await?;
        Ok(runs.into_iter().next())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::{Path, Query};
    use axum::http::{HeaderMap, StatusCode};
    use axum::routing::get;
    use axum::{Json, Router};
    use std::collections::HashMap;

    async fn fake_github() -> String {
        async fn contents(
            Path((_, _, path)): Path<(String, String, String)>,
            headers: HeaderMap,
        ) -> (StatusCode, Json<serde_json::Value>) {
            if headers.get("authorization").and_then(|v| v.to_str().ok()) != Some("Bearer tok") {
                return (StatusCode::UNAUTHORIZED, Json(json!({"message": "Bad credentials"})));
            }
            match path.as_str() {
                // "---\ntitle: Hi\n---\nBody" wrapped like GitHub does.
                "_posts/2025-01-01-hi.md" => (
                    StatusCode::OK,
                    Json(json!({
                        "type": "file",
                        "path": path,
                        "sha": "blob1",
                        "encoding": "base64",
                        "content": "LS0tCnRpdGxlOiBI\naQotLS0KQm9keQ==\n",
                    })),
                ),
                "_posts" => (
                    StatusCode::OK,
                    Json(json!([
                        {"type": "file", "name": "2025-01-01-hi.md", "path": "_posts/2025-01-01-hi.md", "sha": "blob1", "size": 24},
                        {"type": "dir", "name": "drafts", "path": "_posts/drafts", "sha": "tree1", "size": 0},
                    ])),
                ),
                _ => (StatusCode::NOT_FOUND, Json(json!({"message": "Not Found"}))),
            }
        }

        async fn put_contents() -> (StatusCode, Json<serde_json::Value>) {
            (
                StatusCode::CONFLICT,
                Json(json!({"message": "is at abc but expected def"})),
            )
        }

        async fn runs(Query(q): Query<HashMap<String, String>>) -> Json<serde_json::Value> {
            let all = vec![
                json!({"head_sha": "c2", "display_title": "Update post", "status": "in_progress",
                       "conclusion": null, "created_at": "2025-01-01T00:01:00Z",
                       "updated_at": "2025-01-01T00:02:00Z", "html_url": "https://ci/2"}),
                json!({"head_sha": "c1", "name": "pages build", "status": "completed",
                       "conclusion": "success", "created_at": "2025-01-01T00:00:00Z",
                       "updated_at": "2025-01-01T00:00:40Z"}),
            ];
            let runs: Vec<_> = match q.get("head_sha") {
                Some(sha) => all.into_iter().filter(|r| r["head_sha"] == sha.as_str()).collect(),
                None => all,
            };
            Json(json!({"total_count": runs.len(), "workflow_runs": runs}))
        }

        let app = Router::new()
            .route(
                "/repos/{owner}/{repo}/contents/{*path}",
                get(contents).put(put_contents),
            )
            .route("/repos/{owner}/{repo}/actions/workflows/{wf}/runs", get(runs));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}", addr)
    }

    fn client(api_url: String, token: &str) -> GitHubClient {
        let cfg = GitHubConfig {
            owner: "o".into(),
            repo: "r".into(),
            branch: "main".into(),
            api_url,
            token_env: "UNUSED".into(),
            workflow: Some("jekyll.yml".into()),
        };
        GitHubClient::new(&cfg, &HttpConfig::default(), token.into()).unwrap()
    }

    #[tokio::test]
    async fn test_get_decodes_wrapped_base64() {
        let gh = client(fake_github().await, "tok");
        let file = gh.get("_posts/2025-01-01-hi.md").await.unwrap();
        assert_eq!(file.content, "---\ntitle: Hi\n---\nBody");
        assert_eq!(file.sha, "blob1");
    }

    #[tokio::test]
    async fn test_status_mapping() {
        let gh = client(fake_github().await, "tok");
        assert!(gh.get("_posts/missing.md").await.unwrap_err().is_not_found());

        let err = gh
            .put("_posts/2025-01-01-hi.md", "x", Some("def"), "update")
            .await
            .unwrap_err();
        assert!(matches!(err, CmsError::Conflict(ref m) if m.contains("expected def")), "{:?}", err);

        let bad = client(gh.api_url.to_string(), "nope");
        let err = bad.get("_posts/2025-01-01-hi.md").await.unwrap_err();
        assert!(matches!(err, CmsError::Upstream { status: 401, .. }), "{:?}", err);
    }

    #[tokio::test]
    async fn test_list_skips_directories() {
        let gh = client(fake_github().await, "tok");
        let entries = gh.list("_posts").await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].name, "2025-01-01-hi.md");
        assert_eq!(entries[0].size, 24);
    }

    #[tokio::test]
    async fn test_run_history() {
        let gh = client(fake_github().await, "tok");
        let runs = gh.recent_runs(10).await.unwrap();
        assert_eq!(runs.len(), 2);
        assert_eq!(runs[0].display_title, "Update post");
        assert_eq!(runs[1].display_title, "pages build");

        let run = gh.run_for_commit("c1").await.unwrap().unwrap();
        assert_eq!(run.conclusion.as_deref(), Some("success"));
        assert!(gh.run_for_commit("nope").await.unwrap().is_none());
    }

    #[test]
    fn test_missing_token_is_unconfigured() {
        let cfg = GitHubConfig {
            owner: "o".into(),
            repo: "r".into(),
            branch: "main".into(),
            api_url: "https://api.github.com".into(),
            token_env: "SITEKEEPER_TEST_SURELY_UNSET_TOKEN".into(),
            workflow: None,
        };
        let err = GitHubClient::from_config(&cfg, &HttpConfig::default()).err().unwrap();
        assert!(matches!(err, CmsError::Unconfigured(_)));
    }
}
