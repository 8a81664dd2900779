use std::path::{Path, PathBuf};
use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde::Serialize;

use crate::cache::BackendKind;
use crate::config::Config;

// ---------------------------------------------------------------------------
// Response types
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: HealthStatus,
    pub checks: HealthChecks,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Ok,
    Degraded,
    Unhealthy,
}

#[derive(Debug, Serialize)]
pub struct HealthChecks {
    pub upstream: CheckResult,
    pub cache_dirs: CheckResult,
}

#[derive(Debug, Serialize)]
pub struct CheckResult {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl CheckResult {
    fn healthy() -> Self {
        Self {
            ok: true,
            detail: None,
        }
    }

    fn unhealthy(detail: impl Into<String>) -> Self {
        Self {
            ok: false,
            detail: Some(detail.into()),
        }
    }
}

/// Subset of `AppState` the health check needs.
#[derive(Clone)]
pub struct HealthState {
    pub config: Arc<Config>,
    pub http_client: reqwest::Client,
}

// ---------------------------------------------------------------------------
// Individual checks
// ---------------------------------------------------------------------------

/// `GET /rate_limit` is free: it does not count against the API budget.
async fn check_upstream(client: &reqwest::Client, api_url: &str) -> CheckResult {
    let url = format!("{}/rate_limit", api_url.trim_end_matches('/'));
    match client.get(&url).send().await {
        Ok(resp) if resp.status().is_success() => CheckResult::healthy(),
        Ok(resp) => CheckResult::unhealthy(format!("GET {url} returned {}", resp.status())),
        Err(e) => CheckResult::unhealthy(format!("GET {url} failed: {e}")),
    }
}

/// Every disk-backed cache root must accept writes; a cache that cannot
/// store fails every uncached request.
async fn check_cache_dirs(dirs: &[PathBuf]) -> CheckResult {
    for dir in dirs {
        if let Err(e) = probe_writable(dir).await {
            return CheckResult::unhealthy(format!("{} is not writable: {e}", dir.display()));
        }
    }
    CheckResult::healthy()
}

async fn probe_writable(dir: &Path) -> std::io::Result<()> {
    tokio::fs::create_dir_all(dir).await?;
    let probe = dir.join(format!(".healthz.{}", std::process::id()));
    tokio::fs::write(&probe, b"ok").await?;
    tokio::fs::remove_file(&probe).await
}

fn disk_cache_dirs(config: &Config) -> Vec<PathBuf> {
    [&config.cache.api, &config.cache.files, &config.cache.responses]
        .into_iter()
        .filter(|c| c.backend == BackendKind::Disk)
        .filter_map(|c| c.path.clone())
        .collect()
}

// ---------------------------------------------------------------------------
// Aggregate status
// ---------------------------------------------------------------------------

fn aggregate_status(checks: &HealthChecks) -> HealthStatus {
    // Cached manifests can still be served while upstream is down.
    if !checks.cache_dirs.ok {
        HealthStatus::Unhealthy
    } else if !checks.upstream.ok {
        HealthStatus::Degraded
    } else {
        HealthStatus::Ok
    }
}

// ---------------------------------------------------------------------------
// Axum handler
// ---------------------------------------------------------------------------

/// `GET /healthz` handler.  Returns 200 on Ok/Degraded, 503 on Unhealthy.
pub async fn health_handler(State(state): State<HealthState>) -> impl IntoResponse {
    let dirs = disk_cache_dirs(&state.config);
    let (upstream, cache_dirs) = tokio::join!(
        check_upstream(&state.http_client, &state.config.upstream.api_url),
        check_cache_dirs(&dirs),
    );

    let checks = HealthChecks {
        upstream,
        cache_dirs,
    };
    let status = aggregate_status(&checks);
    let body = HealthResponse { status, checks };

    let http_status = match status {
        HealthStatus::Ok | HealthStatus::Degraded => StatusCode::OK,
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };

    (http_status, Json(body))
}
