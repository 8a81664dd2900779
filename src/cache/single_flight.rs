//! Per-key de-duplication of concurrent cache fills.
//!
//! The first caller to miss on a key becomes the leader and registers a
//! `watch` channel in the in-flight table.  Later callers for the same key
//! subscribe to that channel instead of running their own producer, and all
//! of them receive a clone of the leader's outcome.
//!
//! If the leader is dropped before it publishes (its request was cancelled),
//! the channel closes empty and the waiters race to become the next leader.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Mutex, PoisonError};

use tokio::sync::watch;
use tracing::trace;

use super::CacheError;

type Outcome<T> = Option<Result<T, CacheError>>;

pub struct SingleFlight<T> {
    in_flight: Mutex<HashMap<String, watch::Receiver<Outcome<T>>>>,
}

enum Role<T> {
    Leader(watch::Sender<Outcome<T>>),
    Follower(watch::Receiver<Outcome<T>>),
}

impl<T: Clone> Default for SingleFlight<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone> SingleFlight<T> {
    pub fn new() -> Self {
        Self {
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    /// Run `work` for `key` unless another caller is already running it, in
    /// which case wait for and return that caller's result.
    pub async fn run<F, Fut>(&self, key: &str, work: F) -> Result<T, CacheError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, CacheError>>,
    {
        let tx = loop {
            match self.join(key) {
                Role::Leader(tx) => break tx,
                Role::Follower(rx) => {
                    trace!(key, "waiting on in-flight fill");
                    if let Some(outcome) = wait_for_outcome(rx).await {
                        return outcome;
                    }
                    trace!(key, "in-flight leader went away; retrying");
                }
            }
        };

        let _entry = InFlightEntry { table: self, key };
        let outcome = work().await;
        tx.send_replace(Some(outcome.clone()));
        outcome
    }

    /// Number of keys currently being filled.
    #[cfg(test)]
    pub fn pending(&self) -> usize {
        self.table().len()
    }

    fn join(&self, key: &str) -> Role<T> {
        let mut table = self.table();
        if let Some(rx) = table.get(key) {
            return Role::Follower(rx.clone());
        }
        let (tx, rx) = watch::channel(None);
        table.insert(key.to_string(), rx);
        Role::Leader(tx)
    }

    fn table(&self) -> std::sync::MutexGuard<'_, HashMap<String, watch::Receiver<Outcome<T>>>> {
        self.in_flight.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Removes the leader's table entry when the leader finishes or is dropped.
struct InFlightEntry<'a, T: Clone> {
    table: &'a SingleFlight<T>,
    key: &'a str,
}

impl<T: Clone> Drop for InFlightEntry<'_, T> {
    fn drop(&mut self) {
        self.table.table().remove(self.key);
    }
}

/// `None` means the leader was dropped without publishing.
async fn wait_for_outcome<T: Clone>(mut rx: watch::Receiver<Outcome<T>>) -> Outcome<T> {
    loop {
        let current = rx.borrow_and_update().clone();
        if current.is_some() {
            return current;
        }
        if rx.changed().await.is_err() {
            return rx.borrow().clone();
        }
    }
}
