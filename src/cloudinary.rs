//! Image store: Cloudinary resource listing and signed uploads.
//!
//! Listing uses the Admin API with Basic auth (`api_key:api_secret`) and
//! follows `next_cursor` until exhausted. Uploads use the Upload API with a
//! SHA-256 request signature: the parameters (except `file`, `api_key` and
//! the signature fields) are sorted by name, joined as `k=v&k=v`, suffixed
//! with the API secret and hashed.

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::clock::Clock;
use crate::config::{env_credential, CloudinaryConfig, HttpConfig};
use crate::error::{CmsError, CmsResult};
use crate::http;

const SERVICE: &str = "cloudinary";
const PAGE_SIZE: &str = "500";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageResource {
    pub public_id: String,
    #[serde(default)]
    pub format: String,
    #[serde(default)]
    pub width: u32,
    #[serde(default)]
    pub height: u32,
    #[serde(default)]
    pub bytes: u64,
    #[serde(alias = "secure_url")]
    pub url: String,
    pub created_at: DateTime<Utc>,
}

#[async_trait]
pub trait ImageStore: Send + Sync {
    /// Every uploaded image.
    async fn list_resources(&self) -> CmsResult<Vec<ImageResource>>;

    /// Upload `data` under `public_id` (or a name Cloudinary picks).
    async fn upload(
        &self,
        filename: &str,
        data: &[u8],
        public_id: Option<&str>,
    ) -> CmsResult<ImageResource>;
}

#[derive(Deserialize)]
struct ResourcePage {
    #[serde(default)]
    resources: Vec<RawResource>,
    #[serde(default)]
    next_cursor: Option<String>,
}

#[derive(Deserialize)]
struct RawResource {
    public_id: String,
    #[serde(default)]
    format: String,
    #[serde(default)]
    width: u32,
    #[serde(default)]
    height: u32,
    #[serde(default)]
    bytes: u64,
    #[serde(default)]
    secure_url: Option<String>,
    #[serde(default)]
    url: Option<String>,
    created_at: DateTime<Utc>,
}

impl From<RawResource> for ImageResource {
    fn from(raw: RawResource) -> Self {
        ImageResource {
            public_id: raw.public_id,
            format: raw.format,
            width: raw.width,
            height: raw.height,
            bytes: raw.bytes,
            url: raw.secure_url.or(raw.url).unwrap_or_default(),
            created_at: raw.created_at,
        }
    }
}

pub struct CloudinaryClient {
    http: Client,
    api_url: String,
    cloud_name: String,
    api_key: String,
    api_secret: String,
    upload_folder: Option<String>,
    clock: Arc<dyn Clock>,
    deadline: Duration,
}

impl CloudinaryClient {
    pub fn new(
        cfg: &CloudinaryConfig,
        http_cfg: &HttpConfig,
        api_key: String,
        api_secret: String,
        clock: Arc<dyn Clock>,
    ) -> CmsResult<Self> {
        Ok(Self {
            http: http::build_client(http_cfg)?,
            api_url: cfg.api_url.trim_end_matches('/').to_string(),
            cloud_name: cfg.cloud_name.clone(),
            api_key,
            api_secret,
            upload_folder: cfg.upload_folder.clone(),
            clock,
            deadline: http_cfg.timeout(),
        })
    }

    /// Credentials come from the configured env vars; either missing is `Unconfigured`.
    pub fn from_config(
        cfg: &CloudinaryConfig,
        http_cfg: &HttpConfig,
        clock: Arc<dyn Clock>,
    ) -> CmsResult<Self> {
        let key = env_credential(&cfg.api_key_env);
        let secret = env_credential(&cfg.api_secret_env);
        match (key, secret) {
            (Some(key), Some(secret)) => Self::new(cfg, http_cfg, key, secret, clock),
            _ => Err(CmsError::Unconfigured(format!(
                "Cloudinary credentials (${} / ${}) are not set",
                cfg.api_key_env, cfg.api_secret_env
            ))),
        }
    }

    pub fn cloud_name(&self) -> &str {
        &self.cloud_name
    }

    fn endpoint(&self, tail: &str) -> String {
        format!("{}/{}/{}", self.api_url, self.cloud_name, tail)
    }
}

/// Signature over sorted `params` as the Upload API expects.
pub fn sign_params(params: &BTreeMap<&str, String>, api_secret: &str) -> String {
    let to_sign = params
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join("&");
    let mut hasher = Sha256::new();
    hasher.update(to_sign.as_bytes());
    hasher.update(api_secret.as_bytes());
    hex::encode(hasher.finalize())
}

fn mime_for(filename: &str) -> &'static str {
    let ext = filename.rsplit('.').next().unwrap_or("").to_ascii_lowercase();
    match ext.as_str() {
        "png" => "image/png",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "svg" => "image/svg+xml",
        "avif" => "image/avif",
        _ => "image/jpeg",
    }
}

#[async_trait]
impl ImageStore for CloudinaryClient {
    async fn list_resources(&self) -> CmsResult<Vec<ImageResource>> {
        let url = self.endpoint("resources/image");
        let mut resources = Vec::new();
        let mut cursor: Option<String> = None;

        loop {
            let mut query = vec![("type", "upload".to_string()), ("max_results", PAGE_SIZE.to_string())];
            if let Some(c) = &cursor {
                query.push(("next_cursor", c.clone()));
            }
            let req = self
                .http
                .get(&url)
                .basic_auth(&self.api_key, Some(&self.api_secret))
                .query(&query);
            let resp = http::send(SERVICE, "list resources", req, self.deadline).await?;
            if !resp.status().is_success() {
                return Err(http::upstream_error(SERVICE, "list resources", resp).await);
            }
            let page: ResourcePage = http::read_json(SERVICE, "list resources", resp).await?;
            resources.extend(page.resources.into_iter().map(ImageResource::from));
            match page.next_cursor {
                Some(next) if !next.is_empty() => cursor = Some(next),
                _ => break,
            }
        }

        tracing::debug!(count = resources.len(), "fetched cloudinary resources");
        Ok(resources)
    }

    async fn upload(
        &self,
        filename: &str,
        data: &[u8],
        public_id: Option<&str>,
    ) -> CmsResult<ImageResource> {
        if data.is_empty() {
            return Err(CmsError::validation("image data is empty"));
        }

        let mut params: BTreeMap<&str, String> = BTreeMap::new();
        params.insert("timestamp", self.clock.now().timestamp().to_string());
        if let Some(folder) = &self.upload_folder {
            params.insert("folder", folder.clone());
        }
        if let Some(id) = public_id {
            params.insert("public_id", id.to_string());
        }
        let signature = sign_params(&params, &self.api_secret);

        let mut form: Vec<(&str, String)> = params.into_iter().collect();
        form.push(("api_key", self.api_key.clone()));
        form.push(("signature", signature));
        form.push(("signature_algorithm", "sha256".to_string()));
        form.push((
            "file",
            format!("data:{};base64,{}", mime_for(filename), BASE64.encode(data)),
        ));

        let req = self.http.post(self.endpoint("image/upload")).form(&form);
        let resp = http::send(SERVICE, "upload", req, self.deadline).await?;
        if !resp.status().is_success() {
            return Err(http::upstream_error(SERVICE, "upload", resp).await);
        }
        let raw: RawResource = http::read_json(SERVICE, "upload", resp).await?;
        tracing::info!(public_id = %raw.public_id, "uploaded image");
        Ok(raw.into())
    }
}

/// In-memory [`ImageStore`] for tests.
#[derive(Default)]
pub struct MemoryImageStore {
    resources: Mutex<Vec<ImageResource>>,
}

impl MemoryImageStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_public_ids(ids: &[&str]) -> Self {
        let store = Self::new();
        for id in ids {
            store.add(id);
        }
        store
    }

    pub fn add(&self, public_id: &str) {
        let resource = ImageResource {
            public_id: public_id.to_string(),
            format: "jpg".into(),
            width: 0,
            height: 0,
            bytes: 0,
            url: format!("https://res.cloudinary.com/test/image/upload/{}.jpg", public_id),
            created_at: DateTime::<Utc>::default(),
        };
        self.resources.lock().unwrap_or_else(|e| e.into_inner()).push(resource);
    }
}

#[async_trait]
impl ImageStore for MemoryImageStore {
    async fn list_resources(&self) -> CmsResult<Vec<ImageResource>> {
        Ok(self.resources.lock().unwrap_or_else(|e| e.into_inner()).clone())
    }

    async fn upload(
        &self,
        filename: &str,
        data: &[u8],
        public_id: Option<&str>,
    ) -> CmsResult<ImageResource> {
        if data.is_empty() {
            return Err(CmsError::validation("image data is empty"));
        }
        let id = public_id
            .map(String::from)
            .unwrap_or_else(|| filename.rsplit_once('.').map(|(s, _)| s).unwrap_or(filename).to_string());
        self.add(&id);
        let resources = self.resources.lock().unwrap_or_else(|e| e.into_inner());
        resources
            .last()
            .cloned()
            .ok_or_else(|| CmsError::Internal("upload vanished".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use axum::extract::Query;
    use axum::http::HeaderMap;
    use axum::routing::{get, post};
    use axum::{Form, Json, Router};
    use chrono::TimeZone;
    use serde_json::json;
    use std::collections::HashMap;

    #[test]
    fn test_signature_matches_documented_example() {
        // Cloudinary's documented "eager=...&public_id=sample_image&timestamp=1315060510" example, sha256 variant.
        let mut params = BTreeMap::new();
        params.insert("timestamp", "1315060510".to_string());
        params.insert("public_id", "sample_image".to_string());
        params.insert("eager", "w_400,h_300,c_pad|w_260,h_200,c_crop".to_string());
        let sig = sign_params(&params, "abcd");

        let expected = {
            let mut h = Sha256::new();
            h.update(b"eager=w_400,h_300,c_pad|w_260,h_200,c_crop&public_id=sample_image&timestamp=1315060510abcd");
            hex::encode(h.finalize())
        };
        assert_eq!(sig, expected);
        assert_eq!(sig.len(), 64);
    }

    async fn fake_cloudinary() -> String {
        async fn resources(
            Query(q): Query<HashMap<String, String>>,
            headers: HeaderMap,
        ) -> Json<serde_json::Value> {
            assert!(headers.get("authorization").is_some());
            assert_eq!(q.get("max_results").map(String::as_str), Some("500"));
            match q.get("next_cursor").map(String::as_str) {
                None => Json(json!({
                    "resources": [{"public_id": "a", "format": "jpg", "width": 10, "height": 20,
                                   "bytes": 300, "secure_url": "https://x/a.jpg",
                                   "created_at": "2025-01-01T00:00:00Z"}],
                    "next_cursor": "page2",
                })),
                Some(_) => Json(json!({
                    "resources": [{"public_id": "b", "format": "png",
                                   "secure_url": "https://x/b.png",
                                   "created_at": "2025-01-02T00:00:00Z"}],
                })),
            }
        }

        async fn upload(Form(form): Form<HashMap<String, String>>) -> Json<serde_json::Value> {
            assert_eq!(form.get("signature_algorithm").map(String::as_str), Some("sha256"));
            assert_eq!(form.get("timestamp").map(String::as_str), Some("1735689600"));
            assert!(form["file"].starts_with("data:image/png;base64,"));
            Json(json!({
                "public_id": form.get("public_id").cloned().unwrap_or_else(|| "generated".into()),
                "format": "png", "width": 1, "height": 1, "bytes": 4,
                "secure_url": "https://x/new.png", "created_at": "2025-01-01T00:00:00Z",
            }))
        }

        let app = Router::new()
            .route("/demo/resources/image", get(resources))
            .route("/demo/image/upload", post(upload));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}", addr)
    }

    fn client(api_url: String) -> CloudinaryClient {
        let cfg = CloudinaryConfig {
            cloud_name: "demo".into(),
            api_key_env: "UNUSED".into(),
            api_secret_env: "UNUSED".into(),
            api_url,
            upload_folder: None,
        };
        let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap()));
        CloudinaryClient::new(&cfg, &HttpConfig::default(), "key".into(), "secret".into(), clock).unwrap()
    }

    #[tokio::test]
    async fn test_list_follows_cursor() {
        let images = client(fake_cloudinary().await);
        let all = images.list_resources().await.unwrap();
        let ids: Vec<&str> = all.iter().map(|r| r.public_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
        assert_eq!(all[0].url, "https://x/a.jpg");
        assert_eq!(all[1].width, 0);
    }

    #[tokio::test]
    async fn test_signed_upload() {
        let images = client(fake_cloudinary().await);
        let uploaded = images.upload("pic.png", b"\x89PNG", Some("blog/pic")).await.unwrap();
        assert_eq!(uploaded.public_id, "blog/pic");

        let err = images.upload("pic.png", b"", None).await.unwrap_err();
        assert!(matches!(err, CmsError::Validation(_)));
    }
}
