use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{sqlite::SqlitePoolOptions, SqlitePool};
use std::path::Path;

use super::models::{ExecutionState, ExecutionStatus};
use super::ExecutionStore;
use crate::error::{EngineError, Result};

type ExecutionRow = (
    String,
    Option<String>,
    String,
    String,
    String,
    String,
    i64,
    i64,
    Option<String>,
    String,
    String,
);

const SELECT_COLUMNS: &str = r#"
    SELECT id, session_id, status, plan_steps, accumulated_context, execution_history,
           current_step_index, recovery_attempts, failure_reason, created_at, updated_at
    FROM executions
"#;

/// SQLite-backed execution store
pub struct SqliteExecutionStore {
    pool: SqlitePool,
}

impl SqliteExecutionStore {
    /// Open (creating if needed) the database file at `path`
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                EngineError::Persistence(format!(
                    "failed to create {}: {}",
                    parent.display(),
                    e
                ))
            })?;
        }

        // Use ?mode=rwc to create the database file if it doesn't exist
        let database_url = format!("sqlite:{}?mode=rwc", path.display());
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&database_url)
            .await?;

        Self::migrate(&pool).await?;
        tracing::debug!(path = %path.display(), "execution store opened");

        Ok(Self { pool })
    }

    /// Private in-memory database; one connection so every query sees it
    pub async fn in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        Self::migrate(&pool).await?;
        Ok(Self { pool })
    }

    async fn migrate(pool: &SqlitePool) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS executions (
                id TEXT PRIMARY KEY,
                session_id TEXT,
                status TEXT NOT NULL,
                plan_steps TEXT NOT NULL,
                accumulated_context TEXT NOT NULL,
                execution_history TEXT NOT NULL,
                current_step_index INTEGER NOT NULL,
                recovery_attempts INTEGER NOT NULL DEFAULT 0,
                failure_reason TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )
            "#,
        )
        .execute(pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_executions_status
            ON executions(status)
            "#,
        )
        .execute(pool)
        .await?;

        Ok(())
    }

    fn from_row(row: ExecutionRow) -> Result<ExecutionState> {
        Ok(ExecutionState {
            id: row.0,
            session_id: row.1,
            status: row.2.parse()?,
            plan_steps: serde_json::from_str(&row.3)?,
            accumulated_context: serde_json::from_str(&row.4)?,
            execution_history: serde_json::from_str(&row.5)?,
            current_step_index: usize::try_from(row.6).map_err(|_| {
                EngineError::Persistence(format!("invalid step index {}", row.6))
            })?,
            recovery_attempts: u32::try_from(row.7).map_err(|_| {
                EngineError::Persistence(format!("invalid recovery attempts {}", row.7))
            })?,
            failure_reason: row.8,
            created_at: parse_timestamp(&row.9)?,
            updated_at: parse_timestamp(&row.10)?,
        })
    }
}

fn parse_timestamp(value: &str) -> Result<DateTime<Utc>> {
    value
        .parse()
        .map_err(|e| EngineError::Persistence(format!("invalid timestamp '{}': {}", value, e)))
}

#[async_trait]
impl ExecutionStore for SqliteExecutionStore {
    async fn save(&self, state: &ExecutionState) -> Result<()> {
        // The conditional upsert leaves terminal rows untouched
        let result = sqlx::query(
            r#"
            INSERT INTO executions (
                id, session_id, status, plan_steps, accumulated_context, execution_history,
                current_step_index, recovery_attempts, failure_reason, created_at, updated_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                session_id = excluded.session_id,
                status = excluded.status,
                plan_steps = excluded.plan_steps,
                accumulated_context = excluded.accumulated_context,
                execution_history = excluded.execution_history,
                current_step_index = excluded.current_step_index,
                recovery_attempts = excluded.recovery_attempts,
                failure_reason = excluded.failure_reason,
                updated_at = excluded.updated_at
            WHERE executions.status NOT IN ('COMPLETED', 'FAILED', 'CANCELLED')
            "#,
        )
        .bind(&state.id)
        .bind(&state.session_id)
        .bind(state.status.as_str())
        .bind(serde_json::to_string(&state.plan_steps)?)
        .bind(serde_json::to_string(&state.accumulated_context)?)
        .bind(serde_json::to_string(&state.execution_history)?)
        .bind(state.current_step_index as i64)
        .bind(state.recovery_attempts as i64)
        .bind(&state.failure_reason)
        .bind(state.created_at.to_rfc3339())
        .bind(state.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(EngineError::TerminalStateMutation(state.id.clone()));
        }
        Ok(())
    }

    async fn load(&self, id: &str) -> Result<Option<ExecutionState>> {
        let row = sqlx::query_as::<_, ExecutionRow>(&format!("{} WHERE id = ?", SELECT_COLUMNS))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(Self::from_row).transpose()
    }

    async fn delete(&self, id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM executions WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn list(&self) -> Result<Vec<ExecutionState>> {
        let rows = sqlx::query_as::<_, ExecutionRow>(&format!(
            "{} ORDER BY updated_at DESC",
            SELECT_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Self::from_row).collect()
    }

    async fn list_by_status(&self, statuses: &[ExecutionStatus]) -> Result<Vec<ExecutionState>> {
        if statuses.is_empty() {
            return Ok(Vec::new());
        }
        let placeholders = vec!["?"; statuses.len()].join(", ");
        let sql = format!(
            "{} WHERE status IN ({}) ORDER BY updated_at DESC",
            SELECT_COLUMNS, placeholders
        );

        let mut query = sqlx::query_as::<_, ExecutionRow>(&sql);
        for status in statuses {
            query = query.bind(status.as_str());
        }
        let rows = query.fetch_all(&self.pool).await?;

        rows.into_iter().map(Self::from_row).collect()
    }
}
