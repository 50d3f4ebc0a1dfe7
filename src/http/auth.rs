//! Bearer authentication middleware.
//!
//! Compares the caller's token against the server-configured shared
//! secret. A missing header and a wrong token are distinct failures
//! (`AUTH_MISSING` vs `AUTH_INVALID`). When no secret is configured the
//! check is skipped entirely (dev mode; a warning is logged at startup).

use axum::extract::{Request, State};
use axum::http::header::AUTHORIZATION;
use axum::middleware::Next;
use axum::response::Response;
use secrecy::ExposeSecret;
use tracing::warn;

use crate::error::AuthError;

use super::routes::{ApiError, AppState};

/// How the request authenticated. Attached as a request extension so the
/// CSRF stage can tell Bearer callers apart from everyone else.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMethod {
    /// Valid Bearer token presented.
    Bearer,
    /// No secret configured; nothing was checked.
    Open,
}

/// Route-level middleware enforcing Bearer auth on protected routes.
pub async fn require_auth(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let Some(ref secret) = state.config.shared_secret else {
        request.extensions_mut().insert(AuthMethod::Open);
        return Ok(next.run(request).await);
    };

    let header = request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok());

    let token = match header.and_then(|h| h.strip_prefix("Bearer ")) {
        Some(token) => token,
        None => {
            return Err(AuthError::Missing.into());
        }
    };

    if token != secret.expose_secret() {
        warn!("Rejected request with invalid Bearer token");
        return Err(AuthError::Invalid.into());
    }

    request.extensions_mut().insert(AuthMethod::Bearer);
    Ok(next.run(request).await)
}
