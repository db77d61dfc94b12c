//! Error taxonomy shared by every content, media and deployment operation.
//!
//! Each variant maps to one HTTP status at the server boundary:
//!
//! | Variant | Code | HTTP |
//! |---------|------|------|
//! | [`CmsError::NotFound`] | `not_found` | 404 |
//! | [`CmsError::Conflict`] | `conflict` | 409 |
//! | [`CmsError::Unconfigured`] | `unconfigured` | 503 |
//! | [`CmsError::Validation`] | `bad_request` | 400 |
//! | [`CmsError::Unauthorized`] | `unauthorized` | 401 |
//! | [`CmsError::Upstream`] | `upstream_error` | 500 |
//! | [`CmsError::Timeout`] | `timeout` | 504 |
//! | [`CmsError::Internal`] | `internal` | 500 |

use thiserror::Error;

pub type CmsResult<T> = Result<T, CmsError>;

#[derive(Debug, Error)]
pub enum CmsError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    /// A credential or token required by a backend was absent at startup.
    #[error("not configured: {0}")]
    Unconfigured(String),

    #[error("invalid request: {0}")]
    Validation(String),

    #[error("not signed in")]
    Unauthorized,

    #[error("upstream {service} returned HTTP {status}: {message}")]
    Upstream {
        service: &'static str,
        status: u16,
        message: String,
    },

    /// A bounded call exceeded its deadline. Distinct from `Upstream` so callers can retry.
    #[error("{0} timed out")]
    Timeout(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl CmsError {
    pub fn not_found(what: impl Into<String>) -> Self {
        CmsError::NotFound(what.into())
    }

    pub fn conflict(what: impl Into<String>) -> Self {
        CmsError::Conflict(what.into())
    }

    pub fn validation(what: impl Into<String>) -> Self {
        CmsError::Validation(what.into())
    }

    pub fn code(&self) -> &'static str {
        match self {
            CmsError::NotFound(_) => "not_found",
            CmsError::Conflict(_) => "conflict",
            CmsError::Unconfigured(_) => "unconfigured",
            CmsError::Validation(_) => "bad_request",
            CmsError::Unauthorized => "unauthorized",
            CmsError::Upstream { .. } => "upstream_error",
            CmsError::Timeout(_) => "timeout",
            CmsError::Internal(_) => "internal",
        }
    }

    pub fn status_code(&self) -> u16 {
        match self {
            CmsError::NotFound(_) => 404,
            CmsError::Conflict(_) => 409,
            CmsError::Unconfigured(_) => 503,
            CmsError::Validation(_) => 400,
            CmsError::Unauthorized => 401,
            CmsError::Upstream { .. } | CmsError::Internal(_) => 500,
            CmsError::Timeout(_) => 504,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, CmsError::NotFound(_))
    }

    /// Timeouts and upstream failures may succeed on a later attempt.
    pub fn is_transient(&self) -> bool {
        matches!(self, CmsError::Timeout(_) | CmsError::Upstream { .. })
    }
}

impl From<serde_json::Error> for CmsError {
    fn from(err: serde_json::Error) -> Self {
        CmsError::Internal(format!("json: {}", err))
    }
}

impl From<serde_yaml::Error> for CmsError {
    fn from(err: serde_yaml::Error) -> Self {
        CmsError::Validation(format!("yaml: {}", err))
    }
}

impl From<std::io::Error> for CmsError {
    fn from(err: std::io::Error) -> Self {
        CmsError::Internal(format!("io: {}", err))
    }
}
