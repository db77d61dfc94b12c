//! Admin HTTP API.
//!
//! Exposes content, bin, taxonomy, settings, media and deployment operations
//! as a JSON API for the admin front end.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET`  | `/health` | Health check (returns version) |
//! | `GET` / `POST` / `DELETE` | `/session` | Current user / sign in / sign out |
//! | `GET` / `POST` | `/posts`, `/pages` | List / create |
//! | `GET` / `PUT` / `DELETE` | `/posts/{file}`, `/pages/{file}` | Get / update / move to bin |
//! | `GET`  | `/bin` | List the bin |
//! | `POST` | `/bin/{file}/restore` | Restore from the bin |
//! | `DELETE` | `/bin/{file}` | Purge from the bin |
//! | `GET` / `PUT` | `/taxonomy` | Categories and tags |
//! | `GET` / `PUT` | `/settings` | Whitelisted site settings |
//! | `GET` / `PUT` | `/app-settings` | Poll intervals and timeouts |
//! | `GET` / `POST` | `/media` | List / upload images |
//! | `GET`  | `/media/audit` | Image audit |
//! | `POST` | `/maintenance/lazy-images` | Add `loading="lazy"` to post images |
//! | `GET`  | `/deployments` | Merged deployment history |
//! | `GET`  | `/deployments/active` | In-flight deployments and the banner |
//! | `GET`  | `/deployments/{sha}` | CI status for one commit |
//!
//! Mutating routes need a signed-in user. Every content write starts
//! tracking the deployment its commit triggers.
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "conflict", "message": "conflict: _pages/about.md already exists" } }
//! ```
//!
//! Codes and statuses follow [`CmsError`]. With `server.production = false`
//! the error object also carries a `detail` field with the debug form.
//!
//! # CORS
//!
//! All origins, methods, and headers are permitted so the front end can be
//! served from anywhere.

use axum::{
    extract::{rejection::JsonRejection, DefaultBodyLimit, FromRequest, Path, Request, State},
    http::{header, HeaderMap, StatusCode},
    middleware,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, RwLock};
use tower_http::cors::{Any, CorsLayer};

use crate::audit::{AuditReport, ImageAuditor};
use crate::auth::{AuthProvider, SessionAuth, User};
use crate::bin::{BinManager, MoveOutcome};
use crate::clock::{Clock, SystemClock};
use crate::cloudinary::{CloudinaryClient, ImageResource, ImageStore};
use crate::config::{env_credential, Config};
use crate::content::ContentService;
use crate::deployments::{Deployment, DeploymentLog, RunHistory};
use crate::error::{CmsError, CmsResult};
use crate::frontmatter::Frontmatter;
use crate::lazy_images::{LazyImages, LazyLoadReport};
use crate::github::GitHubClient;
use crate::local_state::{AppSettings, LocalState};
use crate::models::{BinItem, ContentItem, ContentKind, StoreEntry, WriteOutcome};
use crate::monitor::DeploymentMonitor;
use crate::site_settings::{SiteSettings, SiteSettingsService};
use crate::store::ContentStore;
use crate::taxonomy::{FlatTaxonomy, Taxonomy, TaxonomyDocument, TaxonomyService};
use crate::tracker::{Banner, DeploymentTracker, TrackerSettings};

const MAX_UPLOAD_BYTES: usize = 20 * 1024 * 1024;

/// Everything that needs the content repository and its CI.
pub struct ContentBackend {
    pub store: Arc<dyn ContentStore>,
    pub history: Arc<dyn RunHistory>,
    pub content: ContentService,
    pub bin: Arc<BinManager>,
    pub taxonomy: TaxonomyService,
    pub site_settings: SiteSettingsService,
    pub monitor: Arc<DeploymentMonitor>,
}

pub struct MediaBackend {
    pub images: Arc<dyn ImageStore>,
    pub cloud_name: String,
}

/// Shared application state passed to all route handlers.
///
/// A backend whose credentials are missing is kept as the reason it is
/// unavailable; routes that need it answer `503 unconfigured`.
pub struct AppContext {
    pub config: Arc<Config>,
    pub state: Arc<LocalState>,
    pub auth: Arc<SessionAuth>,
    pub clock: Arc<dyn Clock>,
    app_settings: RwLock<AppSettings>,
    content: Result<ContentBackend, String>,
    media: Result<MediaBackend, String>,
}

impl AppContext {
    /// Assemble a context from already-built backends. Must run inside a
    /// tokio runtime: test mode signs in immediately, which starts polling.
    pub fn new(
        config: Config,
        state: Arc<LocalState>,
        clock: Arc<dyn Clock>,
        github: CmsResult<(Arc<dyn ContentStore>, Arc<dyn RunHistory>)>,
        images: CmsResult<Arc<dyn ImageStore>>,
        admin_token: Option<String>,
    ) -> Arc<Self> {
        let app_settings = AppSettings::resolve(&state, &config.deployments);
        let auth = Arc::new(SessionAuth::new(admin_token, config.server.admin_email.clone()));

        let content = github
            .map(|(store, history)| {
                let bin = Arc::new(BinManager::new(store.clone(), clock.clone(), &config.content));
                let tracker = Arc::new(DeploymentTracker::new(
                    history.clone(),
                    clock.clone(),
                    DeploymentLog::load(state.clone(), app_settings.max_history),
                    TrackerSettings::from(&app_settings),
                ));
                let monitor = DeploymentMonitor::new(tracker, &app_settings);
                monitor.bind_auth(auth.as_ref());
                ContentBackend {
                    content: ContentService::new(store.clone(), bin.clone(), &config.content),
                    taxonomy: TaxonomyService::new(store.clone(), config.content.taxonomy_path.clone()),
                    site_settings: SiteSettingsService::new(
                        store.clone(),
                        config.content.site_config_path.clone(),
                        &config.content.settings_fields,
                    ),
                    store,
                    history,
                    bin,
                    monitor,
                }
            })
            .map_err(|e| e.to_string());
        if let Err(reason) = &content {
            tracing::warn!("content backend unavailable: {}", reason);
        }

        let cloud_name = config
            .cloudinary
            .as_ref()
            .map(|c| c.cloud_name.clone())
            .unwrap_or_default();
        let media = images
            .map(|images| MediaBackend { images, cloud_name })
            .map_err(|e| e.to_string());
        if let Err(reason) = &media {
            tracing::warn!("media backend unavailable: {}", reason);
        }

        if state.test_mode() {
            tracing::warn!("test mode is on; signing in the test user");
            auth.sign_in_test_user();
        }

        Arc::new(Self {
            config: Arc::new(config),
            state,
            auth,
            clock,
            app_settings: RwLock::new(app_settings),
            content,
            media,
        })
    }

    /// Build the production context: GitHub and Cloudinary clients with
    /// credentials from the environment, state from `[state].path`.
    pub fn from_config(config: &Config) -> anyhow::Result<Arc<Self>> {
        let state = Arc::new(match &config.state.path {
            Some(path) => LocalState::open(path)?,
            None => LocalState::in_memory(),
        });
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);

        let github = match GitHubClient::from_config(&config.github, &config.http) {
            Ok(client) => {
                let client = Arc::new(client);
                let store: Arc<dyn ContentStore> = client.clone();
                let history: Arc<dyn RunHistory> = client;
                Ok((store, history))
            }
            Err(e @ CmsError::Unconfigured(_)) => Err(e),
            Err(e) => return Err(e.into()),
        };

        let images = match &config.cloudinary {
            None => Err(CmsError::Unconfigured("no [cloudinary] section in config".into())),
            Some(cfg) => match CloudinaryClient::from_config(cfg, &config.http, clock.clone()) {
                Ok(client) => Ok(Arc::new(client) as Arc<dyn ImageStore>),
                Err(e @ CmsError::Unconfigured(_)) => Err(e),
                Err(e) => return Err(e.into()),
            },
        };

        let admin_token = env_credential(&config.server.admin_token_env);
        if admin_token.is_none() {
            tracing::warn!(
                var = %config.server.admin_token_env,
                "admin token is not set; sign-in is disabled"
            );
        }

        Ok(Self::new(config.clone(), state, clock, github, images, admin_token))
    }

    pub fn content(&self) -> CmsResult<&ContentBackend> {
        self.content
            .as_ref()
            .map_err(|reason| CmsError::Unconfigured(reason.clone()))
    }

    pub fn media(&self) -> CmsResult<&MediaBackend> {
        self.media
            .as_ref()
            .map_err(|reason| CmsError::Unconfigured(reason.clone()))
    }

    pub fn app_settings(&self) -> AppSettings {
        self.app_settings
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Persist new app settings. Polling picks them up on the next start.
    pub fn set_app_settings(&self, settings: AppSettings) -> CmsResult<()> {
        settings.save(&self.state)?;
        *self.app_settings.write().unwrap_or_else(|e| e.into_inner()) = settings;
        Ok(())
    }

    pub fn auditor(&self) -> CmsResult<ImageAuditor> {
        let content = self.content()?;
        let media = self.media()?;
        ImageAuditor::new(
            content.store.clone(),
            media.images.clone(),
            &self.config.content.posts_dir,
            &media.cloud_name,
        )
    }

    pub fn lazy_images(&self) -> CmsResult<LazyImages> {
        LazyImages::new(self.content()?.store.clone(), &self.config.content.posts_dir)
    }
}

/// Build the router. Exposed so tests can serve it on an ephemeral port.
pub fn router(ctx: Arc<AppContext>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let mut app = Router::new()
        .route("/health", get(handle_health))
        .route(
            "/session",
            get(handle_session).post(handle_sign_in).delete(handle_sign_out),
        );

    for kind in [ContentKind::Post, ContentKind::Page] {
        let base = format!("/{}s", kind);
        app = app
            .route(
                &base,
                get(move |s: State<Arc<AppContext>>| handle_list_items(s, kind)).post(
                    move |s: State<Arc<AppContext>>, body: ApiJson<CreateItem>| {
                        handle_create_item(s, kind, body)
                    },
                ),
            )
            .route(
                &format!("{}/{{file}}", base),
                get(move |s: State<Arc<AppContext>>, p: Path<String>| handle_get_item(s, kind, p))
                    .put(
                        move |s: State<Arc<AppContext>>, p: Path<String>, body: ApiJson<UpdateItem>| {
                            handle_update_item(s, kind, p, body)
                        },
                    )
                    .delete(
                        move |s: State<Arc<AppContext>>, p: Path<String>, body: ApiJson<DeleteItem>| {
                            handle_delete_item(s, kind, p, body)
                        },
                    ),
            );
    }

    app.route("/bin", get(handle_list_bin))
        .route("/bin/{file}/restore", post(handle_restore))
        .route("/bin/{file}", delete(handle_purge))
        .route("/taxonomy", get(handle_get_taxonomy).put(handle_put_taxonomy))
        .route("/settings", get(handle_get_settings).put(handle_put_settings))
        .route(
            "/app-settings",
            get(handle_get_app_settings).put(handle_put_app_settings),
        )
        .route(
            "/media",
            get(handle_list_media)
                .post(handle_upload_media)
                .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES)),
        )
        .route("/media/audit", get(handle_audit))
        .route("/maintenance/lazy-images", post(handle_lazy_images))
        .route("/deployments", get(handle_deployment_history))
        .route("/deployments/active", get(handle_active_deployments))
        .route("/deployments/{sha}", get(handle_deployment_status))
        .layer(middleware::map_response_with_state(ctx.clone(), add_error_detail))
        .layer(cors)
        .with_state(ctx)
}

/// Starts the admin server.
///
/// Binds to `[server].bind` and runs until Ctrl-C, then stops deployment
/// polling and drains in-flight requests.
pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    let ctx = AppContext::from_config(config)?;
    let listener = tokio::net::TcpListener::bind(&config.server.bind).await?;
    tracing::info!("admin API listening on http://{}", listener.local_addr()?);

    let shutdown_ctx = ctx.clone();
    axum::serve(listener, router(ctx))
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("failed to listen for shutdown signal: {}", e);
                std::future::pending::<()>().await;
            }
            tracing::info!("shutting down");
            if let Ok(content) = shutdown_ctx.content() {
                content.monitor.dispose();
            }
        })
        .await?;
    Ok(())
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: &'static str,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    detail: Option<String>,
}

/// Handler error: a [`CmsError`] rendered with the JSON error contract.
pub struct ApiError(pub CmsError);

impl From<CmsError> for ApiError {
    fn from(err: CmsError) -> Self {
        ApiError(err)
    }
}

/// Attached to error responses so [`add_error_detail`] can expand them
/// outside production.
#[derive(Clone)]
struct ErrorReport {
    code: &'static str,
    message: String,
    detail: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let err = self.0;
        let status =
            StatusCode::from_u16(err.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        if status.is_server_error() {
            tracing::error!(code = err.code(), "request failed: {}", err);
        } else {
            tracing::debug!(code = err.code(), "request rejected: {}", err);
        }
        let report = ErrorReport {
            code: err.code(),
            message: err.to_string(),
            detail: format!("{:?}", err),
        };
        let body = ErrorBody {
            error: ErrorDetail {
                code: report.code,
                message: report.message.clone(),
                detail: None,
            },
        };
        let mut response = (status, Json(body)).into_response();
        response.extensions_mut().insert(report);
        response
    }
}

async fn add_error_detail(State(ctx): State<Arc<AppContext>>, response: Response) -> Response {
    if ctx.config.server.production {
        return response;
    }
    let Some(report) = response.extensions().get::<ErrorReport>().cloned() else {
        return response;
    };
    let body = ErrorBody {
        error: ErrorDetail {
            code: report.code,
            message: report.message,
            detail: Some(report.detail),
        },
    };
    (response.status(), Json(body)).into_response()
}

type ApiResult<T> = Result<Json<T>, ApiError>;

/// JSON request body whose rejections (missing body, wrong content type,
/// bad fields) use the error contract instead of axum's plain text.
struct ApiJson<T>(T);

impl<S, T> FromRequest<S> for ApiJson<T>
where
    Json<T>: FromRequest<S, Rejection = JsonRejection>,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        match Json::<T>::from_request(req, state).await {
            Ok(Json(value)) => Ok(Self(value)),
            Err(rejection) => Err(ApiError(CmsError::validation(rejection.body_text()))),
        }
    }
}

// ============ Health and session ============

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

#[derive(Serialize)]
struct SessionResponse {
    user: Option<User>,
}

async fn handle_session(State(ctx): State<Arc<AppContext>>) -> Json<SessionResponse> {
    Json(SessionResponse {
        user: ctx.auth.current_user(),
    })
}

async fn handle_sign_in(
    State(ctx): State<Arc<AppContext>>,
    headers: HeaderMap,
) -> ApiResult<SessionResponse> {
    let token = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .ok_or(CmsError::Unauthorized)?;
    let user = ctx.auth.sign_in(token.trim())?;
    Ok(Json(SessionResponse { user: Some(user) }))
}

async fn handle_sign_out(State(ctx): State<Arc<AppContext>>) -> StatusCode {
    ctx.auth.sign_out();
    StatusCode::NO_CONTENT
}

// ============ Posts and pages ============

#[derive(Deserialize)]
struct CreateItem {
    filename: String,
    #[serde(default)]
    frontmatter: Frontmatter,
    #[serde(default)]
    body: String,
}

#[derive(Deserialize)]
struct UpdateItem {
    #[serde(default)]
    frontmatter: Frontmatter,
    #[serde(default)]
    body: String,
    sha: String,
}

#[derive(Deserialize)]
struct DeleteItem {
    #[serde(default)]
    sha: Option<String>,
}

/// A write plus the deployment tracking it.
#[derive(Serialize)]
struct Tracked<T> {
    #[serde(flatten)]
    outcome: T,
    deployment: Deployment,
}

async fn handle_list_items(
    State(ctx): State<Arc<AppContext>>,
    kind: ContentKind,
) -> ApiResult<Vec<StoreEntry>> {
    Ok(Json(ctx.content()?.content.list(kind).await?))
}

async fn handle_get_item(
    State(ctx): State<Arc<AppContext>>,
    kind: ContentKind,
    Path(file): Path<String>,
) -> ApiResult<ContentItem> {
    Ok(Json(ctx.content()?.content.get(kind, &file).await?))
}

async fn handle_create_item(
    State(ctx): State<Arc<AppContext>>,
    kind: ContentKind,
    ApiJson(req): ApiJson<CreateItem>,
) -> Result<(StatusCode, Json<Tracked<WriteOutcome>>), ApiError> {
    ctx.auth.require_user()?;
    let backend = ctx.content()?;
    let outcome = backend
        .content
        .create(kind, &req.filename, &req.frontmatter, &req.body)
        .await?;
    let deployment = backend
        .monitor
        .track(
            &outcome.commit_sha,
            &format!("Create {} {}", kind, req.filename),
            Some(req.filename.clone()),
        )
        .await;
    Ok((StatusCode::CREATED, Json(Tracked { outcome, deployment })))
}

async fn handle_update_item(
    State(ctx): State<Arc<AppContext>>,
    kind: ContentKind,
    Path(file): Path<String>,
    ApiJson(req): ApiJson<UpdateItem>,
) -> ApiResult<Tracked<WriteOutcome>> {
    ctx.auth.require_user()?;
    let backend = ctx.content()?;
    let outcome = backend
        .content
        .update(kind, &file, &req.frontmatter, &req.body, &req.sha)
        .await?;
    let deployment = backend
        .monitor
        .track(&outcome.commit_sha, &format!("Update {} {}", kind, file), Some(file.clone()))
        .await;
    Ok(Json(Tracked { outcome, deployment }))
}

async fn handle_delete_item(
    State(ctx): State<Arc<AppContext>>,
    kind: ContentKind,
    Path(file): Path<String>,
    ApiJson(req): ApiJson<DeleteItem>,
) -> ApiResult<Tracked<MoveOutcome>> {
    ctx.auth.require_user()?;
    let backend = ctx.content()?;
    let outcome = backend.content.delete(kind, &file, req.sha.as_deref()).await?;
    let deployment = backend
        .monitor
        .track(&outcome.commit_sha, &format!("Move {} to bin", file), Some(file.clone()))
        .await;
    Ok(Json(Tracked { outcome, deployment }))
}

// ============ Bin ============

#[derive(Deserialize)]
struct RestoreRequest {
    #[serde(default)]
    sha: Option<String>,
    #[serde(default)]
    kind: Option<ContentKind>,
}

#[derive(Deserialize)]
struct PurgeRequest {
    sha: String,
}

async fn handle_list_bin(State(ctx): State<Arc<AppContext>>) -> ApiResult<Vec<BinItem>> {
    Ok(Json(ctx.content()?.bin.list().await?))
}

async fn handle_restore(
    State(ctx): State<Arc<AppContext>>,
    Path(file): Path<String>,
    ApiJson(req): ApiJson<RestoreRequest>,
) -> ApiResult<Tracked<WriteOutcome>> {
    ctx.auth.require_user()?;
    let backend = ctx.content()?;
    let outcome = backend.bin.restore(&file, req.sha.as_deref(), req.kind).await?;
    let deployment = backend
        .monitor
        .track(&outcome.commit_sha, &format!("Restore {}", file), Some(file.clone()))
        .await;
    Ok(Json(Tracked { outcome, deployment }))
}

async fn handle_purge(
    State(ctx): State<Arc<AppContext>>,
    Path(file): Path<String>,
    ApiJson(req): ApiJson<PurgeRequest>,
) -> ApiResult<Tracked<WriteOutcome>> {
    ctx.auth.require_user()?;
    let backend = ctx.content()?;
    let outcome = backend.bin.purge(&file, &req.sha).await?;
    let deployment = backend
        .monitor
        .track(&outcome.commit_sha, &format!("Purge {}", file), None)
        .await;
    Ok(Json(Tracked { outcome, deployment }))
}

// ============ Taxonomy and settings ============

#[derive(Serialize)]
struct TaxonomyResponse {
    #[serde(flatten)]
    document: TaxonomyDocument,
    flat: FlatTaxonomy,
}

#[derive(Deserialize)]
struct TaxonomyUpdate {
    taxonomy: Taxonomy,
    #[serde(default)]
    sha: Option<String>,
}

async fn handle_get_taxonomy(State(ctx): State<Arc<AppContext>>) -> ApiResult<TaxonomyResponse> {
    let document = ctx.content()?.taxonomy.get().await?;
    let flat = document.taxonomy.flatten();
    Ok(Json(TaxonomyResponse { document, flat }))
}

async fn handle_put_taxonomy(
    State(ctx): State<Arc<AppContext>>,
    ApiJson(req): ApiJson<TaxonomyUpdate>,
) -> ApiResult<Tracked<WriteOutcome>> {
    ctx.auth.require_user()?;
    let backend = ctx.content()?;
    let outcome = backend.taxonomy.update(&req.taxonomy, req.sha.as_deref()).await?;
    let deployment = backend
        .monitor
        .track(&outcome.commit_sha, "Update taxonomy", None)
        .await;
    Ok(Json(Tracked { outcome, deployment }))
}

#[derive(Deserialize)]
struct SettingsUpdate {
    settings: serde_json::Map<String, serde_json::Value>,
    #[serde(default)]
    sha: Option<String>,
}

async fn handle_get_settings(State(ctx): State<Arc<AppContext>>) -> ApiResult<SiteSettings> {
    Ok(Json(ctx.content()?.site_settings.get().await?))
}

async fn handle_put_settings(
    State(ctx): State<Arc<AppContext>>,
    ApiJson(req): ApiJson<SettingsUpdate>,
) -> ApiResult<Tracked<WriteOutcome>> {
    ctx.auth.require_user()?;
    let backend = ctx.content()?;
    let outcome = backend
        .site_settings
        .update(&req.settings, req.sha.as_deref())
        .await?;
    let deployment = backend
        .monitor
        .track(&outcome.commit_sha, "Update site settings", None)
        .await;
    Ok(Json(Tracked { outcome, deployment }))
}

async fn handle_get_app_settings(State(ctx): State<Arc<AppContext>>) -> Json<AppSettings> {
    Json(ctx.app_settings())
}

async fn handle_put_app_settings(
    State(ctx): State<Arc<AppContext>>,
    ApiJson(settings): ApiJson<AppSettings>,
) -> ApiResult<AppSettings> {
    ctx.auth.require_user()?;
    ctx.set_app_settings(settings.clone())?;
    Ok(Json(settings))
}

// ============ Media ============

#[derive(Deserialize)]
struct UploadRequest {
    filename: String,
    data_base64: String,
    #[serde(default)]
    public_id: Option<String>,
}

async fn handle_list_media(State(ctx): State<Arc<AppContext>>) -> ApiResult<Vec<ImageResource>> {
    Ok(Json(ctx.media()?.images.list_resources().await?))
}

async fn handle_upload_media(
    State(ctx): State<Arc<AppContext>>,
    ApiJson(req): ApiJson<UploadRequest>,
) -> Result<(StatusCode, Json<ImageResource>), ApiError> {
    ctx.auth.require_user()?;
    let media = ctx.media()?;
    let data = BASE64
        .decode(req.data_base64.trim())
        .map_err(|e| CmsError::validation(format!("data_base64: {}", e)))?;
    let resource = media
        .images
        .upload(&req.filename, &data, req.public_id.as_deref())
        .await?;
    Ok((StatusCode::CREATED, Json(resource)))
}

async fn handle_audit(State(ctx): State<Arc<AppContext>>) -> ApiResult<AuditReport> {
    Ok(Json(ctx.auditor()?.run().await?))
}

#[derive(Deserialize)]
struct LazyImagesRequest {
    #[serde(default)]
    dry_run: bool,
}

#[derive(Serialize)]
struct LazyImagesResponse {
    #[serde(flatten)]
    report: LazyLoadReport,
    /// Tracks the last commit of the pass; absent when nothing was written.
    deployment: Option<Deployment>,
}

async fn handle_lazy_images(
    State(ctx): State<Arc<AppContext>>,
    ApiJson(req): ApiJson<LazyImagesRequest>,
) -> ApiResult<LazyImagesResponse> {
    ctx.auth.require_user()?;
    let backend = ctx.content()?;
    let report = ctx.lazy_images()?.run(req.dry_run).await?;
    let deployment = match report.last_commit() {
        Some(sha) => Some(
            backend
                .monitor
                .track(sha, "Add lazy loading to post images", None)
                .await,
        ),
        None => None,
    };
    Ok(Json(LazyImagesResponse { report, deployment }))
}

// ============ Deployments ============

#[derive(Serialize)]
struct ActiveResponse {
    active: Vec<Deployment>,
    banner: Option<Banner>,
}

async fn handle_deployment_history(State(ctx): State<Arc<AppContext>>) -> ApiResult<Vec<Deployment>> {
    Ok(Json(ctx.content()?.monitor.tracker().history().await?))
}

async fn handle_active_deployments(State(ctx): State<Arc<AppContext>>) -> ApiResult<ActiveResponse> {
    let tracker = ctx.content()?.monitor.tracker();
    Ok(Json(ActiveResponse {
        active: tracker.active().await,
        banner: tracker.current_banner().await,
    }))
}

async fn handle_deployment_status(
    State(ctx): State<Arc<AppContext>>,
    Path(sha): Path<String>,
) -> ApiResult<Deployment> {
    let run = ctx
        .content()?
        .history
        .run_for_commit(&sha)
        .await?
        .ok_or_else(|| CmsError::not_found(format!("no workflow run for {}", sha)))?;
    Ok(Json(run.to_deployment()))
}
