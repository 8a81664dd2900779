//! Response caching middleware.
//!
//! [`cached_handler`] sits in front of a router and serves repeated requests
//! for the same URL out of a [`Cache<CachedResponse>`] without running the
//! inner handler again.

use std::fmt;
use std::sync::Arc;

use axum::{
    body::{self, Body},
    extract::{Request, State},
    http::{header, request::Parts, HeaderMap, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use bytes::Bytes;
use tracing::{debug, warn};

use super::Cache;

/// A fully buffered response.  Cloning shares the body bytes.
#[derive(Debug, Clone)]
pub struct CachedResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl CachedResponse {
    /// Build a fresh response carrying a copy of this entry.
    pub fn to_response(&self) -> Response {
        let mut response = Response::new(Body::from(self.body.clone()));
        *response.status_mut() = self.status;
        *response.headers_mut() = self.headers.clone();
        response
    }
}

/// Called with the incoming request and the cached entry on every hit.
pub type HitObserver = Arc<dyn Fn(&Parts, &CachedResponse) + Send + Sync>;

/// State for [`cached_handler`].
#[derive(Clone)]
pub struct CachedHandler {
    cache: Arc<Cache<CachedResponse>>,
    on_hit: Option<HitObserver>,
    should_cache: fn(StatusCode) -> bool,
}

impl CachedHandler {
    /// Cache every response, whatever its status.
    pub fn new(cache: Arc<Cache<CachedResponse>>) -> Self {
        Self {
            cache,
            on_hit: None,
            should_cache: |_| true,
        }
    }

    pub fn on_hit(mut self, observer: HitObserver) -> Self {
        self.on_hit = Some(observer);
        self
    }

    /// Only store responses whose status satisfies `predicate`.
    pub fn cache_only(mut self, predicate: fn(StatusCode) -> bool) -> Self {
        self.should_cache = predicate;
        self
    }
}

impl fmt::Debug for CachedHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CachedHandler")
            .field("cache", &self.cache.name())
            .field("on_hit", &self.on_hit.is_some())
            .finish()
    }
}

/// Cache key for a request: its full URL as the client sees it.  The scheme
/// comes from `X-Forwarded-Proto`, then the URI, defaulting to `http`.
pub fn request_url(parts: &Parts) -> String {
    let scheme = parts
        .headers
        .get("x-forwarded-proto")
        .and_then(|v| v.to_str().ok())
        .or_else(|| parts.uri.scheme_str())
        .unwrap_or("http");
    let host = parts
        .headers
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .or_else(|| parts.uri.authority().map(|a| a.as_str()))
        .unwrap_or_default();
    let path = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    format!("{scheme}://{host}{path}")
}

/// Middleware for `axum::middleware::from_fn_with_state`.
pub async fn cached_handler(
    State(handler): State<CachedHandler>,
    request: Request,
    next: Next,
) -> Response {
    let (parts, body) = request.into_parts();
    let key = request_url(&parts);

    if let Some(hit) = handler.cache.get(&key).await {
        if let Some(observer) = &handler.on_hit {
            observer(&parts, &hit);
        }
        return hit.to_response();
    }

    let response = next.run(Request::from_parts(parts, body)).await;
    let (parts, body) = response.into_parts();
    let bytes = match body::to_bytes(body, usize::MAX).await {
        Ok(bytes) => bytes,
        Err(e) => {
            warn!(%key, error = %e, "failed to buffer response body");
            return StatusCode::BAD_GATEWAY.into_response();
        }
    };

    if (handler.should_cache)(parts.status) {
        let entry = CachedResponse {
            status: parts.status,
            headers: parts.headers.clone(),
            body: bytes.clone(),
        };
        match handler.cache.set(&key, entry).await {
            Ok(()) => debug!(%key, status = %parts.status, "response cached"),
            Err(e) => warn!(%key, error = %e, "failed to cache response"),
        }
    }

    Response::from_parts(parts, Body::from(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use axum::http::Request;
    use axum::{middleware, routing::get, Router};
    use tower::ServiceExt;

    use crate::cache::{InMemoryCache, NoCache};

    struct Harness {
        router: Router,
        handler_calls: Arc<AtomicUsize>,
        hits: Arc<AtomicUsize>,
    }

    fn harness(cache: Cache<CachedResponse>, should_cache: fn(StatusCode) -> bool) -> Harness {
        let handler_calls = Arc::new(AtomicUsize::new(0));
        let hits = Arc::new(AtomicUsize::new(0));

        let calls = Arc::clone(&handler_calls);
        let ok = move || {
            let calls = Arc::clone(&calls);
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                "X"
            }
        };
        let calls = Arc::clone(&handler_calls);
        let missing = move || {
            let calls = Arc::clone(&calls);
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                (StatusCode::NOT_FOUND, "gone")
            }
        };

        let seen = Arc::clone(&hits);
        let state = CachedHandler::new(Arc::new(cache))
            .on_hit(Arc::new(move |_: &Parts, _: &CachedResponse| {
                seen.fetch_add(1, Ordering::SeqCst);
            }))
            .cache_only(should_cache);

        let router = Router::new()
            .route("/r", get(ok))
            .route("/missing", get(missing))
            .layer(middleware::from_fn_with_state(state, cached_handler));

        Harness {
            router,
            handler_calls,
            hits,
        }
    }

    fn memory() -> Cache<CachedResponse> {
        Cache::new("responses", Arc::new(InMemoryCache::new(None)))
    }

    async fn call(router: &Router, uri: &str) -> (StatusCode, Bytes) {
        let request = Request::builder()
            .uri(uri)
            .header(header::HOST, "vpm.example.test")
            .body(Body::empty())
            .unwrap();
        let response = router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let body = body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, body)
    }

    #[tokio::test]
    async fn second_request_is_served_from_cache() {
        let h = harness(memory(), |_| true);

        let (status, body) = call(&h.router, "/r").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, Bytes::from_static(b"X"));
        assert_eq!(h.handler_calls.load(Ordering::SeqCst), 1);
        assert_eq!(h.hits.load(Ordering::SeqCst), 0);

        let (status, body) = call(&h.router, "/r").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, Bytes::from_static(b"X"));
        assert_eq!(h.handler_calls.load(Ordering::SeqCst), 1);
        assert_eq!(h.hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn query_string_is_part_of_the_key() {
        let h = harness(memory(), |_| true);

        call(&h.router, "/r?id=a").await;
        call(&h.router, "/r?id=b").await;
        call(&h.router, "/r?id=a").await;

        assert_eq!(h.handler_calls.load(Ordering::SeqCst), 2);
        assert_eq!(h.hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn error_responses_are_cached_by_default() {
        let h = harness(memory(), |_| true);

        let (status, _) = call(&h.router, "/missing").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let (status, body) = call(&h.router, "/missing").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body, Bytes::from_static(b"gone"));
        assert_eq!(h.handler_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn predicate_filters_what_is_stored() {
        let h = harness(memory(), |status| status.is_success());

        call(&h.router, "/missing").await;
        call(&h.router, "/missing").await;
        assert_eq!(h.handler_calls.load(Ordering::SeqCst), 2);

        call(&h.router, "/r").await;
        call(&h.router, "/r").await;
        assert_eq!(h.handler_calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn no_cache_backend_passes_through() {
        let h = harness(Cache::new("responses", Arc::new(NoCache::new())), |_| true);

        for _ in 0..3 {
            let (_, body) = call(&h.router, "/r").await;
            assert_eq!(body, Bytes::from_static(b"X"));
        }
        assert_eq!(h.handler_calls.load(Ordering::SeqCst), 3);
        assert_eq!(h.hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn request_url_prefers_host_header() {
        let (parts, _) = Request::builder()
            .uri("http://authority.test/a/b?c=d")
            .header(header::HOST, "host.test")
            .body(())
            .unwrap()
            .into_parts();
        assert_eq!(request_url(&parts), "http://host.test/a/b?c=d");

        let (parts, _) = Request::builder()
            .uri("http://authority.test/a")
            .body(())
            .unwrap()
            .into_parts();
        assert_eq!(request_url(&parts), "http://authority.test/a");
    }

    #[test]
    fn request_url_carries_the_scheme() {
        let (parts, _) = Request::builder()
            .uri("https://authority.test/a")
            .body(())
            .unwrap()
            .into_parts();
        assert_eq!(request_url(&parts), "https://authority.test/a");

        let (parts, _) = Request::builder()
            .uri("/a")
            .header(header::HOST, "host.test")
            .header("x-forwarded-proto", "https")
            .body(())
            .unwrap()
            .into_parts();
        assert_eq!(request_url(&parts), "https://host.test/a");

        let (parts, _) = Request::builder()
            .uri("/a")
            .header(header::HOST, "host.test")
            .body(())
            .unwrap()
            .into_parts();
        assert_eq!(request_url(&parts), "http://host.test/a");
    }
}
