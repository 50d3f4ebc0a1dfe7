//! HTTP+SSE protocol front-end.

pub mod auth;
pub mod csrf;
pub mod guard;
pub mod rate_limit;
pub mod routes;
pub mod sse;

pub use routes::{AppState, a2a_routes};
