//! Access logging.

use std::sync::Arc;
use std::time::Instant;

use axum::{
    extract::{Request, State},
    middleware::Next,
    response::Response,
};
use tracing::{info, warn};

use crate::metrics::{Metrics, StatusLabels};

/// Log method, path and status of every response and count it by status.
pub async fn log_requests(
    State(metrics): State<Arc<Metrics>>,
    request: Request,
    next: Next,
) -> Response {
    let method = request.method().clone();
    let path = request
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| request.uri().path().to_string());
    let started = Instant::now();

    let response = next.run(request).await;

    let status = response.status();
    let elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
    metrics
        .http_requests
        .get_or_create(&StatusLabels {
            status: status.as_str().to_string(),
        })
        .inc();

    if status.is_success() {
        info!(%method, %path, status = status.as_u16(), elapsed_ms, "request served");
    } else {
        warn!(
            %method,
            %path,
            status = status.as_u16(),
            reason = status.canonical_reason().unwrap_or_default(),
            elapsed_ms,
            "request failed"
        );
    }

    response
}
