//! CSRF token issuance and validation.
//!
//! Double-submit scheme: every response carries a freshly issued token in
//! the `x-csrf-token` header; state-changing requests must echo a live one
//! back (header preferred, `csrf_token` body field as fallback). Tokens
//! are single use — validation consumes the token and the response carries
//! its replacement.
//!
//! Bearer-authenticated requests skip validation: Bearer tokens are not
//! browser-auto-sent, so they carry no CSRF risk.

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::HeaderValue;
use axum::middleware::Next;
use axum::response::Response;
use rand::RngCore;
use tracing::debug;

use crate::cache::TtlCache;
use crate::error::CsrfError;

use super::auth::AuthMethod;
use super::routes::{ApiError, AppState};

/// Request/response header carrying the token.
pub const CSRF_HEADER: &str = "x-csrf-token";

/// Body field checked when the header is absent.
const CSRF_BODY_FIELD: &str = "csrf_token";

/// Cache of live CSRF tokens.
pub struct CsrfCache {
    tokens: TtlCache<String, ()>,
}

impl CsrfCache {
    pub fn new(capacity: usize, ttl: Duration) -> Arc<Self> {
        Arc::new(Self {
            tokens: TtlCache::new("csrf", capacity, ttl),
        })
    }

    /// Issue a fresh token.
    pub fn issue(&self) -> String {
        let mut bytes = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut bytes);
        let token: String = bytes.iter().map(|b| format!("{b:02x}")).collect();
        self.tokens.insert(token.clone(), ());
        token
    }

    /// Validate and consume a token.
    ///
    /// The non-mutating peek runs first so "never issued / already used /
    /// evicted" and "issued but expired" surface as different errors; a
    /// consuming lookup would delete on read and collapse the two.
    pub fn validate(&self, token: &str) -> Result<(), CsrfError> {
        match self.tokens.peek(&token.to_string()) {
            None => Err(CsrfError::TokenInvalid),
            Some((_, true)) => Err(CsrfError::TokenExpired),
            Some((_, false)) => {
                // Single use: consume now.
                match self.tokens.take(&token.to_string()) {
                    Some(()) => Ok(()),
                    None => Err(CsrfError::TokenInvalid),
                }
            }
        }
    }

    /// Drop expired tokens (periodic cleanup job).
    pub fn purge_expired(&self) -> usize {
        self.tokens.purge_expired()
    }
}

/// Common-chain middleware: attach a freshly issued token to every
/// response.
pub async fn issue_csrf_token(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    let mut response = next.run(request).await;
    let token = state.csrf.issue();
    if let Ok(value) = HeaderValue::from_str(&token) {
        response.headers_mut().insert(CSRF_HEADER, value);
    }
    response
}

/// Route-level middleware validating CSRF on state-changing routes.
/// Runs after auth; Bearer-authenticated requests pass through untouched.
pub async fn validate_csrf(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    if request.extensions().get::<AuthMethod>() == Some(&AuthMethod::Bearer) {
        return Ok(next.run(request).await);
    }

    // Header first; fall back to the body field. The body was already
    // capped by the size-limit layer, so buffering it here is bounded.
    if let Some(token) = request
        .headers()
        .get(CSRF_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
    {
        state.csrf.validate(&token)?;
        debug!("CSRF token validated from header");
        return Ok(next.run(request).await);
    }

    let (parts, body) = request.into_parts();
    let bytes = axum::body::to_bytes(body, state.config.max_body_bytes)
        .await
        .map_err(|_| ApiError::from(CsrfError::TokenMissing))?;

    let token = serde_json::from_slice::<serde_json::Value>(&bytes)
        .ok()
        .and_then(|v| {
            v.get(CSRF_BODY_FIELD)
                .and_then(|t| t.as_str())
                .map(str::to_string)
        });

    let request = Request::from_parts(parts, Body::from(bytes));

    match token {
        Some(token) => {
            state.csrf.validate(&token)?;
            debug!("CSRF token validated from body");
            Ok(next.run(request).await)
        }
        None => Err(CsrfError::TokenMissing.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn issued_token_validates_once() {
        let cache = CsrfCache::new(16, Duration::from_secs(60));
        let token = cache.issue();
        assert!(cache.validate(&token).is_ok());

        // Second use is invalid, not expired.
        assert!(matches!(
            cache.validate(&token),
            Err(CsrfError::TokenInvalid)
        ));
    }

    #[test]
    fn unknown_token_is_invalid() {
        let cache = CsrfCache::new(16, Duration::from_secs(60));
        assert!(matches!(
            cache.validate("deadbeef"),
            Err(CsrfError::TokenInvalid)
        ));
    }

    #[test]
    fn expired_token_is_expired_not_invalid() {
        let cache = CsrfCache::new(16, Duration::ZERO);
        let token = cache.issue();
        assert!(matches!(
            cache.validate(&token),
            Err(CsrfError::TokenExpired)
        ));
    }

    #[test]
    fn tokens_are_unique_and_long() {
        let cache = CsrfCache::new(16, Duration::from_secs(60));
        let a = cache.issue();
        let b = cache.issue();
        assert_ne!(a, b);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn purge_clears_expired_tokens() {
        let cache = CsrfCache::new(16, Duration::ZERO);
        cache.issue();
        cache.issue();
        assert_eq!(cache.purge_expired(), 2);
    }
}
