//! libSQL backend — async `TaskStore` implementation.
//!
//! Supports local file and in-memory databases. A single connection is
//! reused for all operations; `libsql::Connection` is `Send + Sync` and
//! safe for concurrent async use.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{DatabaseError, TaskError};
use crate::store::migrations;
use crate::store::traits::{StoreError, TaskFilter, TaskStore};
use crate::tasks::{Task, TaskState};

/// libSQL task store backend.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Connection(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Connection(format!("Failed to open database: {e}")))?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Connection(format!("Failed to create connection: {e}")))?;

        let backend = Self { db: Arc::new(db), conn };
        migrations::run(&backend.conn).await?;
        info!(path = %path.display(), "Task database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Connection(format!("Failed to create in-memory database: {e}"))
            })?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Connection(format!("Failed to create connection: {e}")))?;

        let backend = Self { db: Arc::new(db), conn };
        migrations::run(&backend.conn).await?;
        Ok(backend)
    }

    /// Import a legacy per-agent database into the unified layout.
    pub async fn import_legacy(
        &self,
        legacy_path: &Path,
        agent_id: &str,
    ) -> Result<usize, DatabaseError> {
        let legacy = libsql::Builder::new_local(legacy_path)
            .build()
            .await
            .map_err(|e| DatabaseError::Connection(format!("Failed to open legacy db: {e}")))?;
        let legacy_conn = legacy
            .connect()
            .map_err(|e| DatabaseError::Connection(format!("Failed to connect legacy db: {e}")))?;
        migrations::import_legacy_agent_db(&self.conn, &legacy_conn, agent_id).await
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Convert `Option<String>` to a libsql Value (NULL when absent).
fn opt_text(s: Option<String>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s),
        None => libsql::Value::Null,
    }
}

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

/// Column order shared by every task SELECT.
const TASK_COLUMNS: &str =
    "id, subject, description, active_form, status, owner, creator_platform, \
     created_at, updated_at, metadata";

/// Map a libsql Row to a Task. Column order matches TASK_COLUMNS.
fn row_to_task(row: &libsql::Row) -> Result<Task, libsql::Error> {
    let id_str: String = row.get(0)?;
    let subject: String = row.get(1)?;
    let description: Option<String> = row.get(2).ok();
    let active_form: Option<String> = row.get(3).ok();
    let status_str: String = row.get(4)?;
    let owner: Option<String> = row.get(5).ok();
    let creator_platform: String = row.get(6)?;
    let created_str: String = row.get(7)?;
    let updated_str: String = row.get(8)?;
    let metadata_str: String = row.get::<String>(9).unwrap_or_else(|_| "{}".into());

    let metadata = serde_json::from_str::<serde_json::Value>(&metadata_str)
        .ok()
        .and_then(|v| match v {
            serde_json::Value::Object(map) => Some(map),
            _ => None,
        })
        .unwrap_or_default();

    Ok(Task {
        id: Uuid::parse_str(&id_str).unwrap_or_else(|_| Uuid::nil()),
        subject,
        description,
        active_form,
        state: TaskState::parse(&status_str),
        owner,
        creator_platform,
        created_at: parse_datetime(&created_str),
        updated_at: parse_datetime(&updated_str),
        metadata,
    })
}

#[async_trait]
impl TaskStore for LibSqlBackend {
    async fn run_migrations(&self) -> Result<(), DatabaseError> {
        migrations::run(&self.conn).await
    }

    async fn create(&self, task: &Task) -> Result<(), DatabaseError> {
        let metadata = serde_json::to_string(&task.metadata)
            .map_err(|e| DatabaseError::Serialization(e.to_string()))?;

        self.conn
            .execute(
                r#"
                INSERT INTO tasks
                    (id, subject, description, active_form, status, owner,
                     creator_platform, created_at, updated_at, metadata)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
                "#,
                params![
                    task.id.to_string(),
                    task.subject.clone(),
                    opt_text(task.description.clone()),
                    opt_text(task.active_form.clone()),
                    task.state.as_str(),
                    opt_text(task.owner.clone()),
                    task.creator_platform.clone(),
                    task.created_at.to_rfc3339(),
                    task.updated_at.to_rfc3339(),
                    metadata
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("Insert task failed: {e}")))?;

        debug!(task_id = %task.id, subject = %task.subject, "Task created");
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<Task>, DatabaseError> {
        let mut rows = self
            .conn
            .query(
                &format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?1"),
                params![id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("Get task failed: {e}")))?;

        match rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(e.to_string()))?
        {
            Some(row) => {
                let task = row_to_task(&row)
                    .map_err(|e| DatabaseError::Serialization(e.to_string()))?;
                Ok(Some(task))
            }
            None => Ok(None),
        }
    }

    async fn list(&self, filter: &TaskFilter) -> Result<Vec<Task>, DatabaseError> {
        // Status filters on the derived bucket, so expand it into the set
        // of authoritative states that project into it.
        let mut clauses: Vec<String> = Vec::new();
        let mut args: Vec<libsql::Value> = Vec::new();

        if let Some(bucket) = filter.status {
            let states: Vec<&'static str> = [
                TaskState::Submitted,
                TaskState::Working,
                TaskState::InputRequired,
                TaskState::Completed,
                TaskState::Failed,
                TaskState::Canceled,
                TaskState::Rejected,
                TaskState::Timeout,
            ]
            .into_iter()
            .filter(|s| s.bucket() == bucket)
            .map(TaskState::as_str)
            .collect();
            let placeholders: Vec<String> = states
                .iter()
                .enumerate()
                .map(|(i, _)| format!("?{}", args.len() + i + 1))
                .collect();
            clauses.push(format!("status IN ({})", placeholders.join(", ")));
            args.extend(states.into_iter().map(|s| libsql::Value::Text(s.to_string())));
        }
        if let Some(ref owner) = filter.owner {
            clauses.push(format!("owner = ?{}", args.len() + 1));
            args.push(libsql::Value::Text(owner.clone()));
        }
        if let Some(ref platform) = filter.platform {
            clauses.push(format!("creator_platform = ?{}", args.len() + 1));
            args.push(libsql::Value::Text(platform.clone()));
        }

        let where_sql = if clauses.is_empty() {
            String::new()
        } else {
            format!(" WHERE {}", clauses.join(" AND "))
        };

        let mut rows = self
            .conn
            .query(
                &format!("SELECT {TASK_COLUMNS} FROM tasks{where_sql} ORDER BY created_at DESC"),
                args,
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("List tasks failed: {e}")))?;

        let mut tasks = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(e.to_string()))?
        {
            tasks.push(
                row_to_task(&row).map_err(|e| DatabaseError::Serialization(e.to_string()))?,
            );
        }
        Ok(tasks)
    }

    async fn transition(
        &self,
        id: Uuid,
        new_state: TaskState,
        metadata_patch: Option<serde_json::Map<String, serde_json::Value>>,
    ) -> Result<Task, StoreError> {
        let Some(current) = self.get(id).await? else {
            return Err(TaskError::NotFound { id }.into());
        };

        // Idempotent completion: terminal tasks return unchanged.
        if current.state.is_terminal() {
            debug!(task_id = %id, state = %current.state, "Transition on terminal task is a no-op");
            return Ok(current);
        }

        if !current.state.reachable(new_state) {
            return Err(TaskError::InvalidTransition {
                id,
                from: current.state.to_string(),
                to: new_state.to_string(),
            }
            .into());
        }

        let mut metadata = current.metadata.clone();
        if let Some(patch) = metadata_patch {
            for (k, v) in patch {
                metadata.insert(k, v);
            }
        }
        let metadata_str = serde_json::to_string(&metadata)
            .map_err(|e| DatabaseError::Serialization(e.to_string()))?;
        let now = Utc::now();

        self.conn
            .execute(
                "UPDATE tasks SET status = ?1, updated_at = ?2, metadata = ?3 WHERE id = ?4",
                params![
                    new_state.as_str(),
                    now.to_rfc3339(),
                    metadata_str,
                    id.to_string()
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("Transition failed: {e}")))?;

        info!(task_id = %id, from = %current.state, to = %new_state, "Task transitioned");

        Ok(Task {
            state: new_state,
            updated_at: now,
            metadata,
            ..current
        })
    }

    async fn set_owner(&self, id: Uuid, owner: &str) -> Result<(), DatabaseError> {
        self.conn
            .execute(
                "UPDATE tasks SET owner = ?1, updated_at = ?2 WHERE id = ?3",
                params![owner, Utc::now().to_rfc3339(), id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("Set owner failed: {e}")))?;
        Ok(())
    }

    async fn delete(&self, id: Uuid) -> Result<bool, DatabaseError> {
        let affected = self
            .conn
            .execute("DELETE FROM tasks WHERE id = ?1", params![id.to_string()])
            .await
            .map_err(|e| DatabaseError::Query(format!("Delete task failed: {e}")))?;
        Ok(affected > 0)
    }
}
