//! Router assembly and request handlers for the A2A surface.

use std::sync::Arc;

use axum::{
    Json, Router, middleware,
    extract::{DefaultBodyLimit, Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::Deserialize;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;
use tracing::info;
use uuid::Uuid;

use crate::config::ServerConfig;
use crate::delegate::Delegator;
use crate::error::{AuthError, CsrfError, DatabaseError, DelegateError, Error, TaskError, ValidationError};
use crate::events::{EventBus, EventKind, EventPayload};
use crate::http::{auth, csrf, guard, rate_limit, sse};
use crate::store::{TaskFilter, TaskStore};
use crate::tasks::{StatusBucket, Task, TaskState};

use super::csrf::CsrfCache;
use super::guard::ResourceGuard;
use super::rate_limit::RateLimiter;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn TaskStore>,
    pub delegator: Arc<Delegator>,
    pub bus: Arc<EventBus>,
    pub csrf: Arc<CsrfCache>,
    pub rate_limiter: Arc<RateLimiter>,
    pub guard: Arc<ResourceGuard>,
    pub config: Arc<ServerConfig>,
}

/// Build the router with the full middleware chain.
///
/// Common chain, outermost first: resource guard, body-size cap, CORS,
/// trace-context attachment, per-request timeout, request logging, CSRF
/// issuance. Route-specific, inside that: Bearer auth, CSRF validation
/// (state-changing routes only), rate limit.
pub fn a2a_routes(state: AppState) -> Router {
    let public = Router::new()
        .route("/health", get(health))
        .route("/a2a/agent-card", get(agent_card));

    let read = Router::new()
        .route("/a2a/tasks", get(list_tasks))
        .route("/a2a/tasks/{id}", get(get_task))
        .route("/a2a/pending", get(list_pending))
        .route("/a2a/events", get(sse::events))
        .route_layer(
            ServiceBuilder::new()
                .layer(middleware::from_fn_with_state(
                    state.clone(),
                    auth::require_auth,
                ))
                .layer(middleware::from_fn_with_state(
                    state.clone(),
                    rate_limit::rate_limit,
                )),
        );

    let write = Router::new()
        .route("/a2a/send-message", post(send_message))
        .route("/a2a/tasks/{id}/cancel", post(cancel_task))
        .route("/a2a/tasks/{id}/claim", post(claim_task))
        .route("/a2a/tasks/{id}/result", post(report_result))
        .route_layer(
            ServiceBuilder::new()
                .layer(middleware::from_fn_with_state(
                    state.clone(),
                    auth::require_auth,
                ))
                .layer(middleware::from_fn_with_state(
                    state.clone(),
                    csrf::validate_csrf,
                ))
                .layer(middleware::from_fn_with_state(
                    state.clone(),
                    rate_limit::rate_limit,
                )),
        );

    // The common chain is split across two `.layer()` calls at the
    // timeout/logging boundary. `TimeoutLayer` requires its inner service's
    // response body to be `Default`, which `TraceLayer`'s wrapped body is
    // not; applying the trace/CSRF group in a separate `.layer()` call makes
    // axum re-box it into a `Route` (whose body is the `Default` `axum::body::Body`)
    // before the timeout wraps it. Because each `.layer()` call wraps the
    // previous one, the later call is the outer layer, so the resulting onion
    // is unchanged: guard, body-size cap, CORS, trace-context, timeout,
    // request logging, CSRF issuance, then the routes.
    Router::new()
        .merge(public)
        .merge(read)
        .merge(write)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(middleware::from_fn_with_state(
                    state.clone(),
                    csrf::issue_csrf_token,
                )),
        )
        .layer(
            ServiceBuilder::new()
                .layer(middleware::from_fn_with_state(
                    state.clone(),
                    guard::resource_guard,
                ))
                .layer(DefaultBodyLimit::max(state.config.max_body_bytes))
                .layer(CorsLayer::permissive())
                .layer(middleware::from_fn(attach_trace_context))
                .layer(TimeoutLayer::new(state.config.request_timeout)),
        )
        .with_state(state)
}

/// Attach a request ID for trace correlation, honoring one supplied by the
/// caller, and echo it on the response.
async fn attach_trace_context(
    mut request: axum::extract::Request,
    next: middleware::Next,
) -> Response {
    let request_id = request
        .headers()
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    request
        .extensions_mut()
        .insert(RequestId(request_id.clone()));

    let mut response = next.run(request).await;
    if let Ok(value) = axum::http::HeaderValue::from_str(&request_id) {
        response.headers_mut().insert("x-request-id", value);
    }
    response
}

/// Request-scoped trace correlation ID.
#[derive(Debug, Clone)]
pub struct RequestId(pub String);

// ── Error envelope ──────────────────────────────────────────────────────

/// Structured error rendered as `{"success":false,"error":{code,message}}`.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub code: &'static str,
    pub message: String,
}

impl ApiError {
    pub fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
        }
    }

    pub fn overloaded(message: impl Into<String>) -> Self {
        Self::new(StatusCode::SERVICE_UNAVAILABLE, "OVERLOADED", message)
    }

    pub fn too_many_requests(message: impl Into<String>) -> Self {
        Self::new(StatusCode::TOO_MANY_REQUESTS, "RATE_LIMITED", message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, "NOT_FOUND", message)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(serde_json::json!({
            "success": false,
            "error": { "code": self.code, "message": self.message }
        }));
        (self.status, body).into_response()
    }
}

impl From<AuthError> for ApiError {
    fn from(err: AuthError) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, err.code(), err.to_string())
    }
}

impl From<CsrfError> for ApiError {
    fn from(err: CsrfError) -> Self {
        Self::new(StatusCode::FORBIDDEN, err.code(), err.to_string())
    }
}

impl From<ValidationError> for ApiError {
    fn from(err: ValidationError) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "VALIDATION", err.to_string())
    }
}

impl From<DelegateError> for ApiError {
    fn from(err: DelegateError) -> Self {
        match &err {
            DelegateError::AgentBusy { .. } => {
                Self::new(StatusCode::CONFLICT, "AGENT_BUSY", err.to_string())
            }
            DelegateError::NotPending { .. } => {
                Self::new(StatusCode::NOT_FOUND, "NOT_PENDING", err.to_string())
            }
        }
    }
}

impl From<TaskError> for ApiError {
    fn from(err: TaskError) -> Self {
        match &err {
            TaskError::NotFound { .. } => Self::not_found(err.to_string()),
            TaskError::InvalidTransition { .. } => {
                Self::new(StatusCode::CONFLICT, "INVALID_TRANSITION", err.to_string())
            }
        }
    }
}

impl From<DatabaseError> for ApiError {
    fn from(err: DatabaseError) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL", err.to_string())
    }
}

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        match err {
            Error::Auth(e) => e.into(),
            Error::Csrf(e) => e.into(),
            Error::Validation(e) => e.into(),
            Error::Delegate(e) => e.into(),
            Error::Task(e) => e.into(),
            Error::Database(e) => e.into(),
            other => Self::new(
                StatusCode::INTERNAL_SERVER_ERROR,
                "INTERNAL",
                other.to_string(),
            ),
        }
    }
}

// ── Health / discovery ──────────────────────────────────────────────────

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "service": "a2a-relay"
    }))
}

/// Public capability/discovery metadata.
async fn agent_card(State(state): State<AppState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "name": state.config.agent_name,
        "version": env!("CARGO_PKG_VERSION"),
        "protocol": "a2a",
        "capabilities": {
            "streaming": true,
            "replay": true,
            "one_task_per_agent": true
        },
        "endpoints": {
            "send_message": "/a2a/send-message",
            "tasks": "/a2a/tasks",
            "events": "/a2a/events"
        }
    }))
}

// ── Task submission ─────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct MessagePart {
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct MessageBody {
    #[serde(default)]
    parts: Vec<MessagePart>,
}

#[derive(Debug, Deserialize)]
struct SendMessageRequest {
    #[serde(default)]
    agent_id: Option<String>,
    #[serde(default)]
    message: Option<MessageBody>,
    #[serde(default)]
    priority: Option<i32>,
    #[serde(default)]
    platform: Option<String>,
    #[serde(default)]
    skills: Option<Vec<String>>,
    #[serde(default)]
    active_form: Option<String>,
    /// Consumed by the CSRF stage when present; ignored here.
    #[serde(default)]
    #[allow(dead_code)]
    csrf_token: Option<String>,
}

/// POST /a2a/send-message — submit a task for an agent.
async fn send_message(
    State(state): State<AppState>,
    body: axum::body::Bytes,
) -> Result<Json<serde_json::Value>, ApiError> {
    let request: SendMessageRequest = serde_json::from_slice(&body).map_err(|e| {
        ApiError::from(ValidationError::InvalidField {
            field: "body".into(),
            message: format!("malformed JSON: {e}"),
        })
    })?;

    let agent_id = request
        .agent_id
        .filter(|s| !s.trim().is_empty())
        .ok_or_else(|| {
            ApiError::from(ValidationError::MissingField {
                field: "agent_id".into(),
            })
        })?;

    let parts: Vec<String> = request
        .message
        .map(|m| {
            m.parts
                .into_iter()
                .filter_map(|p| p.text)
                .filter(|t| !t.trim().is_empty())
                .collect()
        })
        .unwrap_or_default();

    if parts.is_empty() {
        return Err(ValidationError::MissingField {
            field: "message.parts".into(),
        }
        .into());
    }

    let subject = parts[0].clone();
    let text = parts.join("\n");
    let platform = request
        .platform
        .unwrap_or_else(|| state.config.platform.clone());

    let mut task = Task::new(subject, platform)
        .with_description(text.clone())
        .with_owner(agent_id.clone());
    if let Some(active_form) = request.active_form {
        task = task.with_active_form(active_form);
    }
    if let Some(skills) = request.skills {
        task.metadata
            .insert("skills".into(), serde_json::json!(skills));
    }

    state.store.create(&task).await.map_err(ApiError::from)?;

    let priority = request.priority.unwrap_or(0);
    if let Err(err) = state
        .delegator
        .admit(task.id, text, priority, agent_id.clone())
    {
        // The row exists but no slot was taken; settle it as rejected so
        // it does not linger as pending work.
        let mut patch = serde_json::Map::new();
        patch.insert(
            "reject_reason".into(),
            serde_json::Value::String(err.to_string()),
        );
        let _ = state
            .store
            .transition(task.id, TaskState::Rejected, Some(patch))
            .await;
        return Err(err.into());
    }

    let event_task = state
        .store
        .get(task.id)
        .await
        .map_err(ApiError::from)?
        .unwrap_or(task);
    state.bus.publish(
        EventKind::TaskCreated,
        EventPayload::Task {
            task: event_task.clone(),
        },
    );

    info!(task_id = %event_task.id, agent_id = %agent_id, "Task submitted");

    Ok(Json(serde_json::json!({
        "success": true,
        "task_id": event_task.id,
        "state": event_task.state,
    })))
}

// ── Task queries ────────────────────────────────────────────────────────

/// GET /a2a/tasks/{id} — task snapshot.
async fn get_task(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let task = state
        .store
        .get(id)
        .await
        .map_err(ApiError::from)?
        .ok_or_else(|| ApiError::not_found(format!("no task with id {id}")))?;

    Ok(Json(serde_json::json!({ "success": true, "task": task })))
}

#[derive(Debug, Deserialize)]
struct ListTasksQuery {
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    owner: Option<String>,
    #[serde(default)]
    platform: Option<String>,
}

/// GET /a2a/tasks — list with optional status/owner/platform filters.
async fn list_tasks(
    State(state): State<AppState>,
    Query(query): Query<ListTasksQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let status = match query.status.as_deref() {
        Some(s) => Some(StatusBucket::parse(s).ok_or_else(|| {
            ApiError::from(ValidationError::InvalidField {
                field: "status".into(),
                message: format!("unknown status bucket: {s}"),
            })
        })?),
        None => None,
    };

    let tasks = state
        .store
        .list(&TaskFilter {
            status,
            owner: query.owner,
            platform: query.platform,
        })
        .await
        .map_err(ApiError::from)?;

    Ok(Json(serde_json::json!({ "success": true, "tasks": tasks })))
}

// ── Delegation surface (receiving side) ─────────────────────────────────

#[derive(Debug, Deserialize)]
struct PendingQuery {
    agent: String,
}

/// GET /a2a/pending?agent=X — entries awaiting pickup, for polling agents.
async fn list_pending(
    State(state): State<AppState>,
    Query(query): Query<PendingQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let pending = state.delegator.list_pending(&query.agent);
    Ok(Json(serde_json::json!({ "success": true, "pending": pending })))
}

#[derive(Debug, Deserialize)]
struct ClaimRequest {
    agent_id: String,
}

/// POST /a2a/tasks/{id}/claim — acknowledge pickup.
async fn claim_task(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(request): Json<ClaimRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let task = state
        .delegator
        .claim(id, &request.agent_id)
        .await
        .map_err(ApiError::from)?;
    Ok(Json(serde_json::json!({ "success": true, "task": task })))
}

#[derive(Debug, Deserialize)]
struct ResultRequest {
    #[serde(default)]
    result: Option<serde_json::Value>,
    #[serde(default)]
    error: Option<String>,
}

/// POST /a2a/tasks/{id}/result — report the outcome. Late or duplicate
/// reports succeed as no-ops.
async fn report_result(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(request): Json<ResultRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let outcome = match request.error {
        Some(message) => Err(message),
        None => Ok(request.result.unwrap_or(serde_json::Value::Null)),
    };

    let task = state
        .delegator
        .report_result(id, outcome)
        .await
        .map_err(ApiError::from)?;
    Ok(Json(serde_json::json!({ "success": true, "task": task })))
}

/// POST /a2a/tasks/{id}/cancel — best-effort cancellation.
async fn cancel_task(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let task = state.delegator.cancel(id).await.map_err(ApiError::from)?;
    Ok(Json(serde_json::json!({ "success": true, "task": task })))
}
