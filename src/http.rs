//! Outbound HTTP plumbing shared by the GitHub and Cloudinary clients.
//!
//! Every request is bounded by the configured deadline. A request that runs
//! past it surfaces as [`CmsError::Timeout`], never as a generic upstream
//! failure.

use reqwest::{Client, RequestBuilder, Response};
use std::time::Duration;

use crate::config::HttpConfig;
use crate::error::{CmsError, CmsResult};

pub fn build_client(cfg: &HttpConfig) -> CmsResult<Client> {
    Client::builder()
        .user_agent(cfg.user_agent.clone())
        .timeout(cfg.timeout())
        .build()
        .map_err(|e| CmsError::Internal(format!("failed to build HTTP client: {}", e)))
}

/// Send `req`, aborting it once `deadline` passes.
pub async fn send(
    service: &'static str,
    what: &str,
    req: RequestBuilder,
    deadline: Duration,
) -> CmsResult<Response> {
    match tokio::time::timeout(deadline, req.send()).await {
        Err(_) => Err(CmsError::Timeout(format!("{} {}", service, what))),
        Ok(Err(e)) => Err(transport_error(service, what, e)),
        Ok(Ok(resp)) => Ok(resp),
    }
}

/// Map a reqwest failure, keeping timeouts distinguishable.
pub fn transport_error(service: &'static str, what: &str, err: reqwest::Error) -> CmsError {
    if err.is_timeout() {
        CmsError::Timeout(format!("{} {}", service, what))
    } else {
        CmsError::Upstream {
            service,
            status: err.status().map(|s| s.as_u16()).unwrap_or(0),
            message: format!("{}: {}", what, err),
        }
    }
}

/// Consume a non-2xx response into an upstream error carrying its status.
pub async fn upstream_error(service: &'static str, what: &str, resp: Response) -> CmsError {
    let status = resp.status().as_u16();
    let body = resp.text().await.unwrap_or_default();
    CmsError::Upstream {
        service,
        status,
        message: format!("{}: {}", what, body.chars().take(500).collect::<String>()),
    }
}

/// Deserialize a JSON response body.
pub async fn read_json<T: serde::de::DeserializeOwned>(
    service: &'static str,
    what: &str,
    resp: Response,
) -> CmsResult<T> {
    resp.json::<T>()
        .await
        .map_err(|e| transport_error(service, what, e))
}
