use crate::context::OperationContext;
use crate::error::{OrchestratorError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use uuid::Uuid;

/// Audit row for one lifecycle call against a service instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Operation {
    pub id: String,
    pub instance_id: i64,
    pub operation_type: OperationType,
    pub action_name: Option<String>,
    pub request_id: String,
    pub status: OperationStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum OperationType {
    Create,
    Update,
    Delete,
    Action,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum OperationStatus {
    Running,
    Success,
    Failed,
}

#[derive(Clone)]
pub struct OperationLog {
    pool: SqlitePool,
}

impl OperationLog {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Record the start of an operation and return its id.
    pub async fn start(
        &self,
        ctx: &OperationContext,
        instance_id: i64,
        operation_type: OperationType,
        action_name: Option<&str>,
    ) -> Result<String> {
        let id = Uuid::new_v4().to_string();

        sqlx::query(
            "INSERT INTO operations (id, instance_id, operation_type, action_name, request_id, status, started_at)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&id)
        .bind(instance_id)
        .bind(operation_type)
        .bind(action_name)
        .bind(&ctx.request_id)
        .bind(OperationStatus::Running)
        .bind(Utc::now().timestamp())
        .execute(&self.pool)
        .await?;

        Ok(id)
    }

    pub async fn finish(&self, id: &str, error: Option<&OrchestratorError>) -> Result<()> {
        let status = if error.is_some() {
            OperationStatus::Failed
        } else {
            OperationStatus::Success
        };

        sqlx::query("UPDATE operations SET status = ?, completed_at = ?, error = ? WHERE id = ?")
            .bind(status)
            .bind(Utc::now().timestamp())
            .bind(error.map(|e| e.to_string()))
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    /// Operations of one instance, oldest first.
    pub async fn for_instance(&self, instance_id: i64) -> Result<Vec<Operation>> {
        let rows = sqlx::query_as::<_, OperationRow>(
            "SELECT * FROM operations WHERE instance_id = ? ORDER BY started_at, rowid",
        )
        .bind(instance_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(Operation::from).collect())
    }
}

#[derive(sqlx::FromRow)]
struct OperationRow {
    id: String,
    instance_id: i64,
    operation_type: OperationType,
    action_name: Option<String>,
    request_id: String,
    status: OperationStatus,
    started_at: i64,
    completed_at: Option<i64>,
    error: Option<String>,
}

impl From<OperationRow> for Operation {
    fn from(row: OperationRow) -> Self {
        Self {
            id: row.id,
            instance_id: row.instance_id,
            operation_type: row.operation_type,
            action_name: row.action_name,
            request_id: row.request_id,
            status: row.status,
            started_at: DateTime::from_timestamp(row.started_at, 0).unwrap_or_default(),
            completed_at: row
                .completed_at
                .and_then(|ts| DateTime::from_timestamp(ts, 0)),
            error: row.error,
        }
    }
}
