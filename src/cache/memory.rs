//! Process-local volatile cache.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;

use super::clock::{self, Clock};
use super::{BackendKind, CacheBackend, CacheError};

struct Entry<T> {
    value: T,
    created_at: i64,
}

/// `HashMap`-backed cache keyed by the raw key string.
///
/// The map lock is never held across an await point, so a plain
/// `std::sync::Mutex` is enough.
pub struct InMemoryCache<T> {
    entries: Mutex<HashMap<String, Entry<T>>>,
    ttl: Option<Duration>,
    clock: Arc<dyn Clock>,
}

impl<T> InMemoryCache<T> {
    pub fn new(ttl: Option<Duration>) -> Self {
        Self::with_clock(ttl, clock::system())
    }

    pub fn with_clock(ttl: Option<Duration>, clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            ttl,
            clock,
        }
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.entries().len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<String, Entry<T>>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl<T> CacheBackend<T> for InMemoryCache<T>
where
    T: Clone + Send + Sync + 'static,
{
    async fn get(&self, key: &str) -> Option<T> {
        let now = self.clock.now_millis();
        let mut entries = self.entries();
        let entry = entries.get(key)?;
        if clock::is_expired(entry.created_at, now, self.ttl) {
            entries.remove(key);
            return None;
        }
        Some(entry.value.clone())
    }

    async fn set(&self, key: &str, value: T) -> Result<(), CacheError> {
        let created_at = self.clock.now_millis();
        self.entries()
            .insert(key.to_string(), Entry { value, created_at });
        Ok(())
    }

    async fn clean(&self) -> usize {
        if self.ttl.is_none() {
            return 0;
        }
        let now = self.clock.now_millis();
        let mut entries = self.entries();
        let before = entries.len();
        entries.retain(|_, entry| !clock::is_expired(entry.created_at, now, self.ttl));
        before - entries.len()
    }

    fn kind(&self) -> BackendKind {
        BackendKind::Memory
    }
}
