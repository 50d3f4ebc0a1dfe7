//! `TaskStore` trait — the single async interface over task persistence.
//!
//! The store is the sole source of truth for task state. The delegator,
//! the sweeper, and the HTTP handlers all go through this trait; nothing
//! caches task rows beyond a single request or sweep pass.

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::{DatabaseError, TaskError};
use crate::tasks::{StatusBucket, Task, TaskState};

/// Errors from [`TaskStore::transition`] — a lifecycle rule violation or an
/// underlying storage failure.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error(transparent)]
    Task(#[from] TaskError),

    #[error(transparent)]
    Database(#[from] DatabaseError),
}

/// Filter for [`TaskStore::list`]. All provided dimensions are ANDed.
#[derive(Debug, Clone, Default)]
pub struct TaskFilter {
    /// Match tasks whose state projects into this bucket.
    pub status: Option<StatusBucket>,
    /// Match tasks owned by this agent.
    pub owner: Option<String>,
    /// Match tasks created by this platform.
    pub platform: Option<String>,
}

/// Backend-agnostic task persistence.
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Run all pending schema migrations.
    async fn run_migrations(&self) -> Result<(), DatabaseError>;

    /// Insert a new task (state `submitted`).
    async fn create(&self, task: &Task) -> Result<(), DatabaseError>;

    /// Get a task by ID.
    async fn get(&self, id: Uuid) -> Result<Option<Task>, DatabaseError>;

    /// List tasks matching the filter, newest first.
    async fn list(&self, filter: &TaskFilter) -> Result<Vec<Task>, DatabaseError>;

    /// Transition a task to `new_state`, optionally merging a metadata patch.
    ///
    /// Returns the updated record. If the task is already terminal this is
    /// an idempotent no-op returning the stored record unchanged, so
    /// duplicate completion reports stay harmless. Unreachable transitions
    /// fail with [`TaskError::InvalidTransition`].
    async fn transition(
        &self,
        id: Uuid,
        new_state: TaskState,
        metadata_patch: Option<serde_json::Map<String, serde_json::Value>>,
    ) -> Result<Task, StoreError>;

    /// Set the owning agent on a task.
    async fn set_owner(&self, id: Uuid, owner: &str) -> Result<(), DatabaseError>;

    /// Administrative delete. Distinct from reaching a terminal state.
    async fn delete(&self, id: Uuid) -> Result<bool, DatabaseError>;
}
