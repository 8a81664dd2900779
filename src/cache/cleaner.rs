//! Periodic sweeping of expired cache entries.
//!
//! Lazy expiry on `get` only reclaims entries that are asked for again.  The
//! cleaner is a background task that calls `clean()` on every registered
//! cache at a fixed interval so abandoned entries do not pile up on disk.
//! It is owned by a [`CleanerHandle`] and stopped when the service shuts
//! down.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use super::Cache;

/// A cache the cleaner can sweep, independent of its value type.
#[async_trait]
pub trait Sweep: Send + Sync {
    fn name(&self) -> &str;

    /// Remove expired entries, returning how many were removed.
    async fn sweep(&self) -> usize;
}

#[async_trait]
impl<T> Sweep for Cache<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn name(&self) -> &str {
        Cache::name(self)
    }

    async fn sweep(&self) -> usize {
        self.clean().await
    }
}

/// Owner of the running sweep task.
pub struct CleanerHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl CleanerHandle {
    /// Stop the sweep loop and wait for an in-progress sweep to finish.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.task.await {
            warn!(error = %e, "cache cleaner task ended abnormally");
        }
    }
}

/// Spawn the sweep loop.  The first sweep runs one `interval` after start.
pub fn spawn_cleaner(caches: Vec<Arc<dyn Sweep>>, interval: Duration) -> CleanerHandle {
    let (shutdown, mut stop) = watch::channel(false);

    let task = tokio::spawn(async move {
        let start = tokio::time::Instant::now() + interval;
        let mut ticker = tokio::time::interval_at(start, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            caches = caches.len(),
            interval_secs = interval.as_secs(),
            "cache cleaner started"
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    sweep_all(&caches).await;
                }
                changed = stop.changed() => {
                    if changed.is_err() || *stop.borrow() {
                        break;
                    }
                }
            }
        }

        info!("cache cleaner stopped");
    });

    CleanerHandle { shutdown, task }
}

/// Sweep every cache once.
pub async fn sweep_all(caches: &[Arc<dyn Sweep>]) -> usize {
    let mut total = 0;
    for cache in caches {
        let removed = cache.sweep().await;
        if removed > 0 {
            debug!(cache = cache.name(), removed, "expired cache entries removed");
        }
        total += removed;
    }
    total
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::clock::ManualClock;
    use crate::cache::InMemoryCache;

    fn ttl_cache(name: &str, clock: &ManualClock) -> (Arc<Cache<u32>>, Arc<InMemoryCache<u32>>) {
        let backend = Arc::new(InMemoryCache::with_clock(
            Some(Duration::from_secs(1)),
            Arc::new(clock.clone()),
        ));
        let cache = Arc::new(Cache::new(name, backend.clone()));
        (cache, backend)
    }

    #[tokio::test]
    async fn sweep_all_covers_every_cache() {
        let clock = ManualClock::new(0);
        let (a, _) = ttl_cache("a", &clock);
        let (b, _) = ttl_cache("b", &clock);
        a.set("x", 1).await.unwrap();
        b.set("y", 2).await.unwrap();
        b.set("z", 3).await.unwrap();
        clock.advance(Duration::from_secs(2));

        let caches: Vec<Arc<dyn Sweep>> = vec![a as Arc<dyn Sweep>, b as Arc<dyn Sweep>];
        assert_eq!(sweep_all(&caches).await, 3);
        assert_eq!(sweep_all(&caches).await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn background_task_sweeps_on_interval() {
        let clock = ManualClock::new(0);
        let (cache, backend) = ttl_cache("a", &clock);
        cache.set("x", 1).await.unwrap();
        clock.advance(Duration::from_secs(2));

        let handle = spawn_cleaner(vec![cache as Arc<dyn Sweep>], Duration::from_secs(30));

        tokio::time::sleep(Duration::from_secs(29)).await;
        assert_eq!(backend.len(), 1, "no sweep before the first interval");

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(backend.is_empty());

        handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_stops_the_loop() {
        let handle = spawn_cleaner(Vec::new(), Duration::from_secs(30));
        tokio::time::sleep(Duration::from_secs(1)).await;
        tokio::time::timeout(Duration::from_secs(5), handle.shutdown())
            .await
            .expect("cleaner should stop promptly");
    }
}
