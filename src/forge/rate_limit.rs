//! GitHub API rate-limit tracking.
//!
//! Every API response carries `X-RateLimit-Remaining` / `X-RateLimit-Reset`.
//! Once the remaining budget drops below the configured buffer, further API
//! calls are refused until the window resets rather than queued behind it,
//! so a burst of uncached requests cannot exhaust the token.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use reqwest::header::HeaderMap;
use tracing::{debug, info};

/// Returned instead of calling upstream while the budget is exhausted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("upstream API rate limit reached; retry in {retry_after_secs}s")]
pub struct RateLimited {
    pub retry_after_secs: u64,
}

/// Shared rate-limit state updated after every API response.
#[derive(Debug, Clone)]
pub struct RateLimitState {
    remaining: Arc<AtomicU64>,
    /// Unix timestamp (seconds) at which the window resets.
    reset_at: Arc<AtomicU64>,
}

impl Default for RateLimitState {
    fn default() -> Self {
        Self::new()
    }
}

impl RateLimitState {
    pub fn new() -> Self {
        Self {
            remaining: Arc::new(AtomicU64::new(u64::MAX)),
            reset_at: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Remaining calls, or `None` before the first response was seen.
    pub fn remaining(&self) -> Option<u64> {
        match self.remaining.load(Ordering::Relaxed) {
            u64::MAX => None,
            n => Some(n),
        }
    }

    pub fn reset_at(&self) -> u64 {
        self.reset_at.load(Ordering::Relaxed)
    }

    /// Record the budget reported by a response.  Returns the new remaining
    /// count when the response carried one.
    pub fn update_from_headers(&self, headers: &HeaderMap) -> Option<u64> {
        let read = |name: &str| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse::<u64>().ok())
        };

        if let Some(reset) = read("x-ratelimit-reset") {
            self.reset_at.store(reset, Ordering::Relaxed);
        }
        let remaining = read("x-ratelimit-remaining")?;
        self.remaining.store(remaining, Ordering::Relaxed);
        debug!(remaining, reset_at = self.reset_at(), "rate limit updated");
        Some(remaining)
    }

    /// Refuse a call when fewer than `buffer` calls remain in the current
    /// window.
    pub fn check(&self, buffer: u32) -> Result<(), RateLimited> {
        self.check_at(buffer, chrono::Utc::now().timestamp().max(0) as u64)
    }

    fn check_at(&self, buffer: u32, now: u64) -> Result<(), RateLimited> {
        let Some(remaining) = self.remaining() else {
            return Ok(());
        };
        let reset = self.reset_at();
        if remaining >= u64::from(buffer) || reset <= now {
            return Ok(());
        }
        let retry_after_secs = reset - now;
        info!(
            remaining,
            buffer,
            retry_after_secs,
            "refusing upstream call: rate limit buffer reached"
        );
        Err(RateLimited { retry_after_secs })
    }
}
