//! Time source used for entry ages.
//!
//! Backends never read the wall clock directly so that expiry can be tested
//! deterministically with [`ManualClock`].

#[cfg(test)]
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Source of "now" as milliseconds since the Unix epoch.
pub trait Clock: Send + Sync {
    fn now_millis(&self) -> i64;
}

/// Wall-clock time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> i64 {
        chrono::Utc::now().timestamp_millis()
    }
}

/// A clock that only moves when told to.
#[cfg(test)]
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    now: Arc<AtomicI64>,
}

#[cfg(test)]
impl ManualClock {
    pub fn new(start_millis: i64) -> Self {
        Self {
            now: Arc::new(AtomicI64::new(start_millis)),
        }
    }

    pub fn advance(&self, by: Duration) {
        self.now.fetch_add(duration_millis(by), Ordering::SeqCst);
    }

    pub fn set(&self, millis: i64) {
        self.now.store(millis, Ordering::SeqCst);
    }
}

#[cfg(test)]
impl Clock for ManualClock {
    fn now_millis(&self) -> i64 {
        self.now.load(Ordering::SeqCst)
    }
}

/// Shared default clock handle.
pub fn system() -> Arc<dyn Clock> {
    Arc::new(SystemClock)
}

/// Convert a duration to whole milliseconds, saturating at `i64::MAX`.
pub fn duration_millis(d: Duration) -> i64 {
    i64::try_from(d.as_millis()).unwrap_or(i64::MAX)
}

/// Whether an entry created at `created_at` is past `ttl` at `now`.
///
/// `None` never expires.  The comparison is strict: an entry whose age is
/// exactly the TTL is still live.
pub fn is_expired(created_at: i64, now: i64, ttl: Option<Duration>) -> bool {
    match ttl {
        Some(ttl) => now.saturating_sub(created_at) > duration_millis(ttl),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_clock_advances() {
        let clock = ManualClock::new(1_000);
        clock.advance(Duration::from_millis(250));
        assert_eq!(clock.now_millis(), 1_250);
        clock.set(5);
        assert_eq!(clock.now_millis(), 5);
    }

    #[test]
    fn expiry_boundary_is_strict() {
        let ttl = Some(Duration::from_millis(100));
        assert!(!is_expired(0, 99, ttl));
        assert!(!is_expired(0, 100, ttl));
        assert!(is_expired(0, 101, ttl));
    }

    #[test]
    fn no_ttl_never_expires() {
        assert!(!is_expired(0, i64::MAX, None));
    }

    #[test]
    fn huge_ttl_saturates() {
        assert!(!is_expired(0, i64::MAX, Some(Duration::MAX)));
    }
}
