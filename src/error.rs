//! Error types for the A2A relay.

use uuid::Uuid;

/// Top-level error type for the server.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Task error: {0}")]
    Task(#[from] TaskError),

    #[error("Delegation error: {0}")]
    Delegate(#[from] DelegateError),

    #[error("Auth error: {0}")]
    Auth(#[from] AuthError),

    #[error("CSRF error: {0}")]
    Csrf(#[from] CsrfError),

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Directory error: {0}")]
    Directory(#[from] DirectoryError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("No free port in range {start}-{end}")]
    NoFreePort { start: u16, end: u16 },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: String, id: String },

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Task lifecycle errors.
#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    #[error("Task {id} not found")]
    NotFound { id: Uuid },

    #[error("Task {id} cannot move from {from} to {to}")]
    InvalidTransition { id: Uuid, from: String, to: String },
}

/// Delegation errors.
#[derive(Debug, thiserror::Error)]
pub enum DelegateError {
    #[error("Agent {agent_id} already has a task in flight")]
    AgentBusy { agent_id: String },

    #[error("No pending entry for task {task_id}")]
    NotPending { task_id: Uuid },
}

/// Bearer authentication failures. Missing and invalid are distinct codes.
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("Authorization header missing")]
    Missing,

    #[error("Bearer token invalid")]
    Invalid,
}

impl AuthError {
    /// Stable wire code for the JSON error envelope.
    pub fn code(&self) -> &'static str {
        match self {
            AuthError::Missing => "AUTH_MISSING",
            AuthError::Invalid => "AUTH_INVALID",
        }
    }
}

/// CSRF validation failures, one code per cause.
#[derive(Debug, thiserror::Error)]
pub enum CsrfError {
    #[error("CSRF token missing from request")]
    TokenMissing,

    #[error("CSRF token unknown, already used, or evicted")]
    TokenInvalid,

    #[error("CSRF token expired")]
    TokenExpired,
}

impl CsrfError {
    /// Stable wire code for the JSON error envelope.
    pub fn code(&self) -> &'static str {
        match self {
            CsrfError::TokenMissing => "CSRF_TOKEN_MISSING",
            CsrfError::TokenInvalid => "CSRF_TOKEN_INVALID",
            CsrfError::TokenExpired => "CSRF_TOKEN_EXPIRED",
        }
    }
}

/// Request body validation errors.
#[derive(Debug, thiserror::Error)]
pub enum ValidationError {
    #[error("Missing required field: {field}")]
    MissingField { field: String },

    #[error("Invalid value for {field}: {message}")]
    InvalidField { field: String, message: String },
}

/// Agent-directory client errors.
#[derive(Debug, thiserror::Error)]
pub enum DirectoryError {
    #[error("Directory request failed: {0}")]
    Request(String),

    #[error("Agent {agent_id} not found in directory")]
    UnknownAgent { agent_id: String },
}

/// Result type alias for the server.
pub type Result<T> = std::result::Result<T, Error>;
