//! Resource guard — connection and payload limits, first in the chain.
//!
//! Runs before everything else so an overloaded server sheds traffic
//! without touching parsing, auth, or the store. The connection counter is
//! RAII-released when the response future settles, including on panic
//! unwind through the drop.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use axum::extract::{Request, State};
use axum::http::{StatusCode, header::CONTENT_LENGTH};
use axum::middleware::Next;
use axum::response::Response;
use tracing::warn;

use super::routes::{ApiError, AppState};

/// Shared live-request counter.
pub struct ResourceGuard {
    max_connections: usize,
    max_body_bytes: usize,
    live: AtomicUsize,
}

/// RAII permit for one in-flight request.
struct Permit(Arc<ResourceGuard>);

impl Drop for Permit {
    fn drop(&mut self) {
        self.0.live.fetch_sub(1, Ordering::Relaxed);
    }
}

impl ResourceGuard {
    pub fn new(max_connections: usize, max_body_bytes: usize) -> Arc<Self> {
        Arc::new(Self {
            max_connections,
            max_body_bytes,
            live: AtomicUsize::new(0),
        })
    }

    /// Current in-flight request count.
    pub fn live(&self) -> usize {
        self.live.load(Ordering::Relaxed)
    }

    fn try_acquire(self: &Arc<Self>) -> Option<Permit> {
        let prev = self.live.fetch_add(1, Ordering::Relaxed);
        if prev >= self.max_connections {
            self.live.fetch_sub(1, Ordering::Relaxed);
            return None;
        }
        Some(Permit(Arc::clone(self)))
    }
}

/// Outermost middleware: connection cap plus an advisory declared-length
/// check. The hard body cap is the size-limit layer behind it; this
/// rejects obviously oversized uploads before any byte is read.
pub async fn resource_guard(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let Some(_permit) = state.guard.try_acquire() else {
        warn!(live = state.guard.live(), "Connection limit reached, shedding request");
        return Err(ApiError::overloaded("server is at its connection limit"));
    };

    if let Some(declared) = request
        .headers()
        .get(CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<usize>().ok())
    {
        if declared > state.guard.max_body_bytes {
            return Err(ApiError::new(
                StatusCode::PAYLOAD_TOO_LARGE,
                "PAYLOAD_TOO_LARGE",
                format!(
                    "declared body of {declared} bytes exceeds the {} byte limit",
                    state.guard.max_body_bytes
                ),
            ));
        }
    }

    Ok(next.run(request).await)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn permits_release_on_drop() {
        let guard = ResourceGuard::new(2, 1024);
        let a = guard.try_acquire().unwrap();
        let b = guard.try_acquire().unwrap();
        assert!(guard.try_acquire().is_none());
        assert_eq!(guard.live(), 2);

        drop(a);
        assert_eq!(guard.live(), 1);
        let c = guard.try_acquire();
        assert!(c.is_some());
        drop(b);
        drop(c);
        assert_eq!(guard.live(), 0);
    }
}
