//! Version-tracked database migrations for the libSQL backend.
//!
//! Each migration has a version number and SQL. `run_migrations()` checks
//! the current version and applies only the new ones sequentially.

use libsql::Connection;
use tracing::{info, warn};

use crate::error::DatabaseError;
use crate::tasks::TaskState;

/// A single migration step.
struct Migration {
    version: i64,
    name: &'static str,
    sql: &'static str,
}

/// All migrations in order. Add new versions to the end.
static MIGRATIONS: &[Migration] = &[Migration {
    version: 1,
    name: "unified_tasks",
    sql: r#"
        CREATE TABLE IF NOT EXISTS tasks (
            id TEXT PRIMARY KEY,
            subject TEXT NOT NULL,
            description TEXT,
            active_form TEXT,
            status TEXT NOT NULL DEFAULT 'submitted',
            owner TEXT,
            creator_platform TEXT NOT NULL,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            metadata TEXT NOT NULL DEFAULT '{}'
        );
        CREATE INDEX IF NOT EXISTS idx_tasks_status ON tasks(status);
        CREATE INDEX IF NOT EXISTS idx_tasks_owner ON tasks(owner);
        CREATE INDEX IF NOT EXISTS idx_tasks_platform ON tasks(creator_platform);
    "#,
}];

/// Run all migrations newer than the recorded version.
pub async fn run(conn: &Connection) -> Result<(), DatabaseError> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS _migrations (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        );
        "#,
    )
    .await
    .map_err(|e| DatabaseError::Migration(format!("Failed to create _migrations: {e}")))?;

    let current = current_version(conn).await?;

    for migration in MIGRATIONS.iter().filter(|m| m.version > current) {
        conn.execute_batch(migration.sql)
            .await
            .map_err(|e| {
                DatabaseError::Migration(format!(
                    "Migration V{} ({}) failed: {e}",
                    migration.version, migration.name
                ))
            })?;
        conn.execute(
            "INSERT INTO _migrations (version, name) VALUES (?1, ?2)",
            libsql::params![migration.version, migration.name],
        )
        .await
        .map_err(|e| {
            DatabaseError::Migration(format!(
                "Failed to record migration V{}: {e}",
                migration.version
            ))
        })?;
        info!(version = migration.version, name = migration.name, "Applied migration");
    }

    Ok(())
}

async fn current_version(conn: &Connection) -> Result<i64, DatabaseError> {
    let mut rows = conn
        .query("SELECT COALESCE(MAX(version), 0) FROM _migrations", ())
        .await
        .map_err(|e| DatabaseError::Migration(format!("Failed to read version: {e}")))?;

    match rows
        .next()
        .await
        .map_err(|e| DatabaseError::Migration(e.to_string()))?
    {
        Some(row) => row
            .get::<i64>(0)
            .map_err(|e| DatabaseError::Migration(e.to_string())),
        None => Ok(0),
    }
}

/// Import rows from the legacy per-agent layout into the unified `tasks`
/// table.
///
/// The old layout kept one database per agent with an `agent_tasks` table
/// holding only the four-bucket status. Imported rows keep their bucket by
/// mapping it onto a representative authoritative state: pending→submitted,
/// in_progress→working, completed→completed, deleted→canceled. The bucket
/// projection in [`TaskState::bucket`] is the inverse contract — the
/// round-trip must preserve the bucket exactly.
///
/// Returns the number of rows imported. Rows whose ID already exists in the
/// unified table are skipped.
pub async fn import_legacy_agent_db(
    conn: &Connection,
    legacy: &Connection,
    agent_id: &str,
) -> Result<usize, DatabaseError> {
    let mut rows = legacy
        .query(
            "SELECT id, title, detail, status, created_at, updated_at FROM agent_tasks",
            (),
        )
        .await
        .map_err(|e| DatabaseError::Migration(format!("Legacy read failed: {e}")))?;

    let mut imported = 0usize;
    while let Some(row) = rows
        .next()
        .await
        .map_err(|e| DatabaseError::Migration(e.to_string()))?
    {
        let id: String = row.get(0).map_err(|e| DatabaseError::Migration(e.to_string()))?;
        let title: String = row.get(1).map_err(|e| DatabaseError::Migration(e.to_string()))?;
        let detail: Option<String> = row.get(2).ok();
        let bucket: String = row.get(3).map_err(|e| DatabaseError::Migration(e.to_string()))?;
        let created_at: String = row.get(4).map_err(|e| DatabaseError::Migration(e.to_string()))?;
        let updated_at: String = row.get(5).map_err(|e| DatabaseError::Migration(e.to_string()))?;

        let state = match bucket.as_str() {
            "in_progress" => TaskState::Working,
            "completed" => TaskState::Completed,
            "deleted" => TaskState::Canceled,
            _ => TaskState::Submitted,
        };

        let inserted = conn
            .execute(
                r#"
                INSERT OR IGNORE INTO tasks
                    (id, subject, description, status, owner, creator_platform,
                     created_at, updated_at, metadata)
                VALUES (?1, ?2, ?3, ?4, ?5, 'legacy', ?6, ?7, '{}')
                "#,
                libsql::params![
                    id,
                    title,
                    match detail {
                        Some(d) => libsql::Value::Text(d),
                        None => libsql::Value::Null,
                    },
                    state.as_str(),
                    agent_id,
                    created_at,
                    updated_at
                ],
            )
            .await
            .map_err(|e| DatabaseError::Migration(format!("Legacy insert failed: {e}")))?;
        imported += inserted as usize;
    }

    if imported > 0 {
        info!(agent_id, imported, "Imported legacy agent tasks");
    } else {
        warn!(agent_id, "Legacy import found no new rows");
    }
    Ok(imported)
}
