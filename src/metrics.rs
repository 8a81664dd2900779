use std::sync::Arc;

use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::registry::Registry;

// ---------------------------------------------------------------------------
// Label types
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct CacheLabels {
    pub cache: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct EndpointLabels {
    pub endpoint: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct StatusLabels {
    pub status: String,
}

// ---------------------------------------------------------------------------
// Metrics struct
// ---------------------------------------------------------------------------

/// Central container for every Prometheus metric exposed by the service.
pub struct Metrics {
    // -- caches --
    pub cache_hits: Family<CacheLabels, Counter>,
    pub cache_misses: Family<CacheLabels, Counter>,
    pub cache_evictions: Family<CacheLabels, Counter>,

    // -- upstream API --
    pub upstream_api_calls: Family<EndpointLabels, Counter>,
    pub upstream_api_rate_limit_remaining: Gauge,

    // -- http --
    pub http_requests: Family<StatusLabels, Counter>,
}

impl Metrics {
    /// Create a new [`Metrics`] instance and register every metric with the
    /// supplied `registry`.
    pub fn new(registry: &mut Registry) -> Self {
        let cache_hits = Family::<CacheLabels, Counter>::default();
        registry.register(
            "vpmpkg_cache_hits",
            "Cache lookups that found a live entry",
            cache_hits.clone(),
        );

        let cache_misses = Family::<CacheLabels, Counter>::default();
        registry.register(
            "vpmpkg_cache_misses",
            "Cache lookups that found nothing or an expired entry",
            cache_misses.clone(),
        );

        let cache_evictions = Family::<CacheLabels, Counter>::default();
        registry.register(
            "vpmpkg_cache_evictions",
            "Expired entries removed by the periodic sweep",
            cache_evictions.clone(),
        );

        let upstream_api_calls = Family::<EndpointLabels, Counter>::default();
        registry.register(
            "vpmpkg_upstream_api_calls",
            "Upstream API call count by endpoint",
            upstream_api_calls.clone(),
        );

        let upstream_api_rate_limit_remaining: Gauge = Gauge::default();
        registry.register(
            "vpmpkg_upstream_api_rate_limit_remaining",
            "Remaining upstream API calls before rate limit",
            upstream_api_rate_limit_remaining.clone(),
        );

        let http_requests = Family::<StatusLabels, Counter>::default();
        registry.register(
            "vpmpkg_http_requests",
            "HTTP responses served by status code",
            http_requests.clone(),
        );

        Self {
            cache_hits,
            cache_misses,
            cache_evictions,
            upstream_api_calls,
            upstream_api_rate_limit_remaining,
            http_requests,
        }
    }
}

// ---------------------------------------------------------------------------
// Shared handle
// ---------------------------------------------------------------------------

/// Thread-safe wrapper for the metrics registry, used in [`AppState`].
///
/// [`AppState`]: crate::AppState
#[derive(Clone)]
pub struct MetricsRegistry {
    pub registry: Arc<Registry>,
    pub metrics: Arc<Metrics>,
}

impl MetricsRegistry {
    /// Build a fresh registry and pre-register all service metrics.
    pub fn new() -> Self {
        let mut registry = Registry::default();
        let metrics = Metrics::new(&mut registry);
        Self {
            registry: Arc::new(registry),
            metrics: Arc::new(metrics),
        }
    }

    /// Render the registry in the OpenMetrics text format.
    pub fn encode(&self) -> Result<String, std::fmt::Error> {
        let mut buf = String::new();
        prometheus_client::encoding::text::encode(&mut buf, &self.registry)?;
        Ok(buf)
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_are_exported_with_total_suffix() {
        let registry = MetricsRegistry::new();
        registry
            .metrics
            .cache_hits
            .get_or_create(&CacheLabels {
                cache: "api".to_string(),
            })
            .inc();
        registry
            .metrics
            .http_requests
            .get_or_create(&StatusLabels {
                status: "200".to_string(),
            })
            .inc_by(3);
        registry.metrics.upstream_api_rate_limit_remaining.set(42);

        let text = registry.encode().unwrap();
        assert!(text.contains("vpmpkg_cache_hits_total{cache=\"api\"} 1"));
        assert!(text.contains("vpmpkg_http_requests_total{status=\"200\"} 3"));
        assert!(text.contains("vpmpkg_upstream_api_rate_limit_remaining 42"));
    }
}
