//! Main axum router and HTTP request handlers.
//!
//! Routes:
//! - `GET /{owner}/{repo}/` - VPM repository manifest (trailing slash optional)
//! - `GET /healthz`         - Health check
//! - `GET /metrics`         - Prometheus metrics
//!
//! Anything else gets a `400` with a usage hint.

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::{header, request::Parts, HeaderMap, StatusCode},
    middleware,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::Deserialize;
use serde_json::json;
use tracing::{error, info, instrument, warn};

use crate::cache::handler::{cached_handler, CachedHandler, CachedResponse};
use crate::forge::rate_limit::RateLimited;
use crate::manifest::{build_repo_manifest, ManifestRequest};
use crate::AppState;

const USAGE: &str = "GET: /{OWNER}/{REPO}/";

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

/// Build the axum [`Router`] with all HTTP routes and shared state.
pub fn create_router(state: Arc<AppState>) -> Router {
    // Only successful manifests are worth replaying.
    let response_cache = CachedHandler::new(Arc::clone(&state.responses))
        .on_hit(Arc::new(log_cache_hit))
        .cache_only(|status| status.is_success());

    let manifests = Router::new()
        .route("/{owner}/{repo}", get(handle_repo_manifest))
        .route("/{owner}/{repo}/", get(handle_repo_manifest))
        .route_layer(middleware::from_fn_with_state(
            response_cache,
            cached_handler,
        ));

    Router::new()
        .route("/healthz", get(handle_health))
        .route("/metrics", get(handle_metrics))
        .merge(manifests)
        .fallback(handle_fallback)
        .layer(middleware::from_fn_with_state(
            Arc::clone(&state.metrics.metrics),
            super::logging::log_requests,
        ))
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Query parameter types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct ManifestQuery {
    /// Package id override.
    id: Option<String>,
    /// Package manifest path override.
    path: Option<String>,
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// `GET /{owner}/{repo}/?id=&path=`
///
/// Lists the repository's releases, reads the package manifest at each
/// release tag and assembles them into a VPM repository manifest.
#[instrument(skip(state, query, headers), fields(%owner, %repo))]
async fn handle_repo_manifest(
    State(state): State<Arc<AppState>>,
    Path((owner, repo)): Path<(String, String)>,
    Query(query): Query<ManifestQuery>,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    if !is_valid_segment(&owner) || !is_valid_segment(&repo) {
        return Err(AppError::BadRequest);
    }

    let package_manifest_path = query
        .path
        .unwrap_or_else(|| state.config.manifest.package_manifest_path.clone());
    if !package_manifest_path.starts_with('/') {
        return Err(AppError::BadRequest);
    }

    let manifest_url = manifest_url(
        state.config.server.public_url.as_deref(),
        &headers,
        &owner,
        &repo,
    );
    let request = ManifestRequest {
        owner,
        repo,
        package_id: query.id.filter(|id| !id.is_empty()),
        package_manifest_path,
        id_prefix: state.config.manifest.id_prefix.clone(),
        manifest_url,
    };

    let manifest = build_repo_manifest(state.forge.as_ref(), &request).await?;

    let versions: usize = manifest.packages.values().map(|p| p.versions.len()).sum();
    info!(id = %manifest.id, versions, "repository manifest built");

    Ok(Json(manifest).into_response())
}

/// `GET /healthz`
async fn handle_health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let health_state = crate::health::HealthState {
        config: Arc::clone(&state.config),
        http_client: state.http_client.clone(),
    };
    crate::health::health_handler(State(health_state)).await
}

/// `GET /metrics`
///
/// Returns Prometheus metrics collected by the service.
async fn handle_metrics(State(state): State<Arc<AppState>>) -> Result<Response, AppError> {
    let buf = state
        .metrics
        .encode()
        .map_err(|e| AppError::Internal(anyhow::anyhow!("metrics encoding failed: {e}")))?;

    Ok((
        StatusCode::OK,
        [(
            header::CONTENT_TYPE,
            "application/openmetrics-text; version=1.0.0; charset=utf-8",
        )],
        buf,
    )
        .into_response())
}

async fn handle_fallback() -> AppError {
    AppError::BadRequest
}

// ---------------------------------------------------------------------------
// Internal helpers
// ---------------------------------------------------------------------------

/// Owner and repository names as GitHub allows them.
fn is_valid_segment(segment: &str) -> bool {
    !segment.is_empty()
        && !segment.contains("..")
        && segment
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'_' | b'.' | b'-'))
}

/// Public URL of the manifest for `owner/repo`.  Prefers the configured
/// base, then the request's `Host` header.
fn manifest_url(
    public_url: Option<&str>,
    headers: &HeaderMap,
    owner: &str,
    repo: &str,
) -> String {
    if let Some(base) = public_url {
        return format!("{}/{owner}/{repo}/", base.trim_end_matches('/'));
    }
    let value = |name: &str| headers.get(name).and_then(|v| v.to_str().ok());
    match value(header::HOST.as_str()) {
        Some(host) => {
            let scheme = value("x-forwarded-proto").unwrap_or("http");
            format!("{scheme}://{host}/{owner}/{repo}/")
        }
        None => format!("/{owner}/{repo}/"),
    }
}

fn log_cache_hit(parts: &Parts, entry: &CachedResponse) {
    info!(
        method = %parts.method,
        path = %parts.uri,
        status = entry.status.as_u16(),
        "served from response cache"
    );
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Application-level error type that maps cleanly to HTTP responses.
#[derive(Debug)]
pub enum AppError {
    /// The request does not name a repository.
    BadRequest,
    /// The upstream API budget is exhausted.
    RateLimited(RateLimited),
    /// Upstream could not provide what the manifest needs.
    Upstream(anyhow::Error),
    /// An unexpected internal error.
    Internal(anyhow::Error),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        match self {
            AppError::BadRequest => (
                StatusCode::BAD_REQUEST,
                Json(json!({ "message": "Bad Request", "usage": USAGE })),
            )
                .into_response(),
            AppError::RateLimited(limited) => {
                warn!(retry_after_secs = limited.retry_after_secs, "upstream rate limited");
                (
                    StatusCode::SERVICE_UNAVAILABLE,
                    [(header::RETRY_AFTER, limited.retry_after_secs.to_string())],
                    Json(json!({ "message": limited.to_string() })),
                )
                    .into_response()
            }
            AppError::Upstream(err) => {
                warn!(error = %err, "upstream error");
                (
                    StatusCode::BAD_GATEWAY,
                    Json(json!({ "message": format!("{err:#}") })),
                )
                    .into_response()
            }
            AppError::Internal(err) => {
                error!(error = %err, "internal server error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(json!({ "message": format!("Internal server error: {err:#}") })),
                )
                    .into_response()
            }
        }
    }
}

/// Failures while building a manifest come from upstream.
impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        match err.downcast_ref::<RateLimited>() {
            Some(limited) => AppError::RateLimited(*limited),
            None => AppError::Upstream(err),
        }
    }
}
