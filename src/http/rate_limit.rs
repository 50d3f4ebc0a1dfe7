//! Per-caller rate limiting — fixed window over the shared bounded cache.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{ConnectInfo, Request, State};
use axum::middleware::Next;
use axum::response::Response;
use tracing::warn;

use crate::cache::TtlCache;

use super::routes::{ApiError, AppState};

/// Fixed-window request counter keyed by caller address.
pub struct RateLimiter {
    max_requests: u32,
    windows: TtlCache<String, u32>,
}

impl RateLimiter {
    pub fn new(max_requests: u32, window: Duration) -> Arc<Self> {
        Arc::new(Self {
            max_requests,
            // The cache TTL is the window: entries reset when they expire.
            windows: TtlCache::new("rate_limit", 4096, window),
        })
    }

    /// Count a request from `caller`. Returns false once the caller is
    /// over the window budget.
    pub fn check(&self, caller: &str) -> bool {
        let count = self.windows.update(caller.to_string(), 0, |c| {
            *c += 1;
            *c
        });
        if count > self.max_requests {
            warn!(caller, count, max = self.max_requests, "Rate limit exceeded");
            false
        } else {
            true
        }
    }

    /// Drop expired windows (periodic cleanup job).
    pub fn purge_expired(&self) -> usize {
        self.windows.purge_expired()
    }
}

/// Route-level middleware applying the rate limit. Runs after auth so only
/// authenticated (or public-by-design) traffic consumes budget.
pub async fn rate_limit(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let caller = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| info.0.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string());

    if !state.rate_limiter.check(&caller) {
        return Err(ApiError::too_many_requests("too many requests, slow down"));
    }

    Ok(next.run(request).await)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allows_up_to_max_then_rejects() {
        let limiter = RateLimiter::new(3, Duration::from_secs(60));
        assert!(limiter.check("1.2.3.4"));
        assert!(limiter.check("1.2.3.4"));
        assert!(limiter.check("1.2.3.4"));
        assert!(!limiter.check("1.2.3.4"));
    }

    #[test]
    fn callers_are_independent() {
        let limiter = RateLimiter::new(1, Duration::from_secs(60));
        assert!(limiter.check("1.2.3.4"));
        assert!(!limiter.check("1.2.3.4"));
        assert!(limiter.check("5.6.7.8"));
    }

    #[test]
    fn window_expiry_resets_the_count() {
        let limiter = RateLimiter::new(1, Duration::ZERO);
        assert!(limiter.check("1.2.3.4"));
        // The zero-length window has already expired; the next request
        // starts a fresh count.
        assert!(limiter.check("1.2.3.4"));
    }
}
