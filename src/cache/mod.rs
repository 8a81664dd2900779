//! Generic cache subsystem.
//!
//! Three interchangeable backends ([`DiskCache`], [`InMemoryCache`],
//! [`NoCache`]) implement [`CacheBackend`].  Callers never talk to a backend
//! directly: they hold a [`Cache`], which adds `get_or_else` with
//! single-flight de-duplication and hit/miss accounting on top of whichever
//! backend the configuration selected.
//!
//! Lookups never fail: any problem reading an entry is reported as a miss.
//! Writes do fail, and those failures reach the caller as [`CacheError`].

pub mod cleaner;
pub mod clock;
pub mod disk;
pub mod handler;
pub mod key;
pub mod memory;
pub mod noop;
pub mod single_flight;

use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use serde::Deserialize;
use tracing::{debug, trace};

use crate::config::CacheConfig;
use crate::metrics::{CacheLabels, Metrics};

pub use disk::DiskCache;
pub use memory::InMemoryCache;
pub use noop::NoCache;
use single_flight::SingleFlight;

// ---------------------------------------------------------------------------
// Backend contract
// ---------------------------------------------------------------------------

/// Which storage a cache instance uses.  Fixed at construction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Disk,
    #[default]
    Memory,
    None,
}

/// Capability set shared by every cache backend.
#[async_trait]
pub trait CacheBackend<T: Send + 'static>: Send + Sync {
    /// Return the live value for `key`, or `None` on a miss.  Expired
    /// entries are removed and reported as misses.
    async fn get(&self, key: &str) -> Option<T>;

    /// Store `value` under `key`, replacing any previous entry.
    async fn set(&self, key: &str, value: T) -> Result<(), CacheError>;

    /// Remove every expired entry and return how many were removed.
    async fn clean(&self) -> usize;

    fn kind(&self) -> BackendKind;
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Failures a cache caller can observe.
///
/// `Clone` so that a single producer outcome can be handed to every caller
/// waiting on the same key.
#[derive(Debug, Clone, thiserror::Error)]
pub enum CacheError {
    /// Persisting an entry failed (directory not creatable, disk full, ...).
    #[error("failed to write cache entry {}: {source}", path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: Arc<std::io::Error>,
    },

    /// The producer passed to `get_or_else` failed.  Nothing was cached.
    #[error("{0:#}")]
    Producer(Arc<anyhow::Error>),
}

impl CacheError {
    pub(crate) fn write(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Write {
            path: path.into(),
            source: Arc::new(source),
        }
    }

    fn producer(err: anyhow::Error) -> Self {
        Self::Producer(Arc::new(err))
    }

    /// The producer's original error, if this is a producer failure.
    pub fn producer_error(&self) -> Option<&anyhow::Error> {
        match self {
            Self::Producer(err) => Some(err),
            Self::Write { .. } => None,
        }
    }

    /// Convert into an [`anyhow::Error`], handing back the producer's own
    /// error untouched when no other caller shares it.
    pub fn into_anyhow(self) -> anyhow::Error {
        match self {
            Self::Producer(err) => {
                Arc::try_unwrap(err).unwrap_or_else(|shared| anyhow::anyhow!("{shared:#}"))
            }
            other => anyhow::Error::new(other),
        }
    }
}

// ---------------------------------------------------------------------------
// Cache front
// ---------------------------------------------------------------------------

/// A named cache instance over one backend.
pub struct Cache<T: Send + 'static> {
    name: String,
    backend: Arc<dyn CacheBackend<T>>,
    flights: SingleFlight<T>,
    metrics: Option<Arc<Metrics>>,
}

impl<T> Cache<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new(name: impl Into<String>, backend: Arc<dyn CacheBackend<T>>) -> Self {
        Self {
            name: name.into(),
            backend,
            flights: SingleFlight::new(),
            metrics: None,
        }
    }

    /// Record hits, misses and evictions in `metrics` under this cache's name.
    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> BackendKind {
        self.backend.kind()
    }

    pub async fn get(&self, key: &str) -> Option<T> {
        let value = self.backend.get(key).await;
        self.record_lookup(key, value.is_some());
        value
    }

    pub async fn set(&self, key: &str, value: T) -> Result<(), CacheError> {
        self.backend.set(key, value).await
    }

    /// Return the cached value for `key`, or run `producer`, cache its
    /// output and return it.
    ///
    /// Concurrent misses for the same key share one `producer` run.  A
    /// producer failure is returned as [`CacheError::Producer`] and nothing
    /// is stored.  A failure to store the produced value fails the call.
    pub async fn get_or_else<F, Fut>(&self, key: &str, producer: F) -> Result<T, CacheError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        if let Some(value) = self.get(key).await {
            return Ok(value);
        }

        if self.backend.kind() == BackendKind::None {
            return producer().await.map_err(CacheError::producer);
        }

        self.flights
            .run(key, move || async move {
                // Another leader may have filled the entry since our miss.
                if let Some(value) = self.backend.get(key).await {
                    return Ok(value);
                }
                let value = producer().await.map_err(CacheError::producer)?;
                self.backend.set(key, value.clone()).await?;
                debug!(cache = %self.name, key, "cache populated");
                Ok(value)
            })
            .await
    }

    /// Sweep expired entries out of the backend.
    pub async fn clean(&self) -> usize {
        let removed = self.backend.clean().await;
        if let Some(metrics) = &self.metrics {
            metrics
                .cache_evictions
                .get_or_create(&self.labels())
                .inc_by(removed as u64);
        }
        removed
    }

    fn record_lookup(&self, key: &str, hit: bool) {
        trace!(cache = %self.name, key, hit, "cache lookup");
        if let Some(metrics) = &self.metrics {
            let family = if hit {
                &metrics.cache_hits
            } else {
                &metrics.cache_misses
            };
            family.get_or_create(&self.labels()).inc();
        }
    }

    fn labels(&self) -> CacheLabels {
        CacheLabels {
            cache: self.name.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// Construction from configuration
// ---------------------------------------------------------------------------

fn ttl_of(config: &CacheConfig) -> Option<Duration> {
    config.ttl_secs.map(Duration::from_secs)
}

/// Build a byte cache; any backend is allowed.
pub fn open_bytes_cache(name: &str, config: &CacheConfig) -> Result<Cache<Bytes>> {
    let ttl = ttl_of(config);
    let backend: Arc<dyn CacheBackend<Bytes>> = match config.backend {
        BackendKind::Disk => {
            let path = config
                .path
                .as_ref()
                .with_context(|| format!("cache `{name}` uses the disk backend but has no path"))?;
            Arc::new(DiskCache::new(path, ttl))
        }
        BackendKind::Memory => Arc::new(InMemoryCache::new(ttl)),
        BackendKind::None => Arc::new(NoCache::new()),
    };
    debug!(cache = name, backend = ?config.backend, ?ttl, "cache opened");
    Ok(Cache::new(name, backend))
}

/// Build a cache for values that only live in process memory.
pub fn open_volatile_cache<T>(name: &str, config: &CacheConfig) -> Result<Cache<T>>
where
    T: Clone + Send + Sync + 'static,
{
    let ttl = ttl_of(config);
    let backend: Arc<dyn CacheBackend<T>> = match config.backend {
        BackendKind::Disk => bail!("cache `{name}` cannot use the disk backend"),
        BackendKind::Memory => Arc::new(InMemoryCache::new(ttl)),
        BackendKind::None => Arc::new(NoCache::new()),
    };
    debug!(cache = name, backend = ?config.backend, ?ttl, "cache opened");
    Ok(Cache::new(name, backend))
}
