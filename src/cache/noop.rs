//! Null-object backend: caching switched off without touching call sites.

use std::marker::PhantomData;

use async_trait::async_trait;

use super::{BackendKind, CacheBackend, CacheError};

pub struct NoCache<T> {
    _marker: PhantomData<fn() -> T>,
}

impl<T> NoCache<T> {
    pub fn new() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

impl<T> Default for NoCache<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<T: Send + 'static> CacheBackend<T> for NoCache<T> {
    async fn get(&self, _key: &str) -> Option<T> {
        None
    }

    async fn set(&self, _key: &str, _value: T) -> Result<(), CacheError> {
        Ok(())
    }

    async fn clean(&self) -> usize {
        0
    }

    fn kind(&self) -> BackendKind {
        BackendKind::None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn never_hits() {
        let cache = NoCache::<u32>::new();
        cache.set("k", 1).await.unwrap();
        assert!(cache.get("k").await.is_none());
        assert_eq!(cache.clean().await, 0);
        assert_eq!(cache.kind(), BackendKind::None);
    }
}
