use crate::capability::Backend;
use crate::error::{OrchestratorError, Result};
use crate::quota::{self, QuotaRequest};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{SqliteConnection, SqlitePool};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceInstance {
    pub id: i64,
    pub uuid: String,
    pub name: String,
    pub description: Option<String>,
    pub account_id: String,
    pub service_definition_id: String,
    pub plugin_type: PluginType,
    pub backend: Backend,
    pub parent_id: Option<i64>,
    pub status: InstanceStatus,
    pub resource_uuid: Option<String>,
    pub config: serde_json::Value,
    pub quota_held: QuotaRequest,
    pub last_error: Option<String>,
    pub active_task: Option<String>,

    #[serde(serialize_with = "serialize_datetime")]
    pub created_at: DateTime<Utc>,

    #[serde(serialize_with = "serialize_datetime")]
    pub updated_at: DateTime<Utc>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[serde(serialize_with = "serialize_optional_datetime")]
    pub deleted_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum PluginType {
    ComputeInstance,
    StorageEfs,
    LoggingInstance,
}

impl PluginType {
    pub fn as_str(&self) -> &'static str {
        match self {
            PluginType::ComputeInstance => "compute_instance",
            PluginType::StorageEfs => "storage_efs",
            PluginType::LoggingInstance => "logging_instance",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum InstanceStatus {
    Draft,
    Pending,
    Building,
    Active,
    Updating,
    Stopping,
    Stopped,
    Starting,
    Deleting,
    Deleted,
    Error,
}

impl InstanceStatus {
    pub const ALL: [InstanceStatus; 11] = [
        InstanceStatus::Draft,
        InstanceStatus::Pending,
        InstanceStatus::Building,
        InstanceStatus::Active,
        InstanceStatus::Updating,
        InstanceStatus::Stopping,
        InstanceStatus::Stopped,
        InstanceStatus::Starting,
        InstanceStatus::Deleting,
        InstanceStatus::Deleted,
        InstanceStatus::Error,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            InstanceStatus::Draft => "draft",
            InstanceStatus::Pending => "pending",
            InstanceStatus::Building => "building",
            InstanceStatus::Active => "active",
            InstanceStatus::Updating => "updating",
            InstanceStatus::Stopping => "stopping",
            InstanceStatus::Stopped => "stopped",
            InstanceStatus::Starting => "starting",
            InstanceStatus::Deleting => "deleting",
            InstanceStatus::Deleted => "deleted",
            InstanceStatus::Error => "error",
        }
    }

    /// States a record may be in immediately before entering `self`.
    pub fn predecessors(&self) -> &'static [InstanceStatus] {
        use InstanceStatus::*;
        match self {
            Draft => &[],
            Pending => &[Draft],
            Building => &[Pending],
            Active => &[Building, Updating, Starting],
            Updating => &[Active],
            Stopping => &[Active],
            Stopped => &[Stopping],
            Starting => &[Stopped],
            Deleting => &[Active, Stopped, Error, Deleting],
            Deleted => &[Deleting],
            Error => &[
                Draft, Pending, Building, Active, Updating, Stopping, Stopped, Starting, Deleting,
                Error,
            ],
        }
    }

    pub fn can_transition_to(&self, next: InstanceStatus) -> bool {
        next.predecessors().contains(self)
    }

    /// Whether a record in this state may reference a remote resource.
    pub fn may_hold_resource(&self) -> bool {
        !matches!(
            self,
            InstanceStatus::Draft | InstanceStatus::Pending | InstanceStatus::Deleted
        )
    }
}

impl std::fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Fields of a record before it is first written.
#[derive(Debug, Clone)]
pub struct NewInstance {
    pub name: String,
    pub description: Option<String>,
    pub account_id: String,
    pub service_definition_id: String,
    pub plugin_type: PluginType,
    pub backend: Backend,
    pub parent_id: Option<i64>,
    pub config: serde_json::Value,
    pub quota_held: QuotaRequest,
}

#[derive(Debug, Clone, Default)]
pub struct InstanceFilters {
    pub account_id: Option<String>,
    pub status: Option<InstanceStatus>,
    pub plugin_type: Option<PluginType>,
    pub parent_id: Option<i64>,
}

/// Persistence of service-instance records.
///
/// Status changes go through [`InstanceStore::transition`], a compare-and-set
/// on the stored predecessor, so an illegal move never half-applies.
#[derive(Clone)]
pub struct InstanceStore {
    pool: SqlitePool,
}

impl InstanceStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Persist a new record in `draft`.
    pub async fn insert(&self, new: &NewInstance) -> Result<ServiceInstance> {
        let uuid = Uuid::new_v4().to_string();
        let now = Utc::now().timestamp();

        let id = sqlx::query(
            r#"
            INSERT INTO service_instances (uuid, name, description, account_id, service_definition_id,
                plugin_type, backend, parent_id, status, config, quota_held, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&uuid)
        .bind(&new.name)
        .bind(&new.description)
        .bind(&new.account_id)
        .bind(&new.service_definition_id)
        .bind(new.plugin_type)
        .bind(new.backend)
        .bind(new.parent_id)
        .bind(InstanceStatus::Draft)
        .bind(serde_json::to_string(&new.config)?)
        .bind(serde_json::to_string(&new.quota_held)?)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?
        .last_insert_rowid();

        self.get(id).await
    }

    pub async fn get(&self, id: i64) -> Result<ServiceInstance> {
        sqlx::query_as::<_, InstanceRow>("SELECT * FROM service_instances WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| OrchestratorError::NotFound(format!("service instance {id}")))?
            .try_into()
    }

    pub async fn get_by_uuid(&self, uuid: &str) -> Result<ServiceInstance> {
        sqlx::query_as::<_, InstanceRow>("SELECT * FROM service_instances WHERE uuid = ?")
            .bind(uuid)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| OrchestratorError::NotFound(format!("service instance {uuid}")))?
            .try_into()
    }

    pub async fn list(&self, filters: &InstanceFilters) -> Result<Vec<ServiceInstance>> {
        let mut query = "SELECT * FROM service_instances WHERE 1=1".to_string();

        if filters.account_id.is_some() {
            query.push_str(" AND account_id = ?");
        }
        if filters.status.is_some() {
            query.push_str(" AND status = ?");
        }
        if filters.plugin_type.is_some() {
            query.push_str(" AND plugin_type = ?");
        }
        if filters.parent_id.is_some() {
            query.push_str(" AND parent_id = ?");
        }

        query.push_str(" ORDER BY id");

        let mut q = sqlx::query_as::<_, InstanceRow>(&query);

        if let Some(account_id) = &filters.account_id {
            q = q.bind(account_id);
        }
        if let Some(status) = filters.status {
            q = q.bind(status);
        }
        if let Some(plugin_type) = filters.plugin_type {
            q = q.bind(plugin_type);
        }
        if let Some(parent_id) = filters.parent_id {
            q = q.bind(parent_id);
        }

        let rows = q.fetch_all(&self.pool).await?;

        rows.into_iter().map(ServiceInstance::try_from).collect()
    }

    /// Move a record to `next` if its current status allows it.
    pub async fn transition(&self, id: i64, next: InstanceStatus) -> Result<()> {
        let mut conn = self.pool.acquire().await?;
        transition_on(&mut conn, id, next).await
    }

    /// Record the remote resource produced by a create and move to `building`.
    /// Both land or neither does.
    pub async fn set_building(&self, id: i64, resource_uuid: &str) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        transition_on(&mut tx, id, InstanceStatus::Building).await?;

        sqlx::query("UPDATE service_instances SET resource_uuid = ?, updated_at = ? WHERE id = ?")
            .bind(resource_uuid)
            .bind(Utc::now().timestamp())
            .bind(id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    /// Move to `error`, keeping `resource_uuid` and `active_task` as they are.
    pub async fn mark_error(&self, id: i64, message: &str) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        transition_on(&mut tx, id, InstanceStatus::Error).await?;

        sqlx::query("UPDATE service_instances SET last_error = ?, updated_at = ? WHERE id = ?")
            .bind(message)
            .bind(Utc::now().timestamp())
            .bind(id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    /// The remote resource is confirmed gone: soft-delete the record, clear
    /// its resource and hand back the quota it holds, in one transaction.
    pub async fn mark_deleted(&self, id: i64) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        transition_on(&mut tx, id, InstanceStatus::Deleted).await?;

        let (account_id, quota_held): (String, String) =
            sqlx::query_as("SELECT account_id, quota_held FROM service_instances WHERE id = ?")
                .bind(id)
                .fetch_one(&mut *tx)
                .await?;
        let quota_held: QuotaRequest = serde_json::from_str(&quota_held)?;

        let now = Utc::now().timestamp();
        sqlx::query(
            "UPDATE service_instances
             SET resource_uuid = NULL, active_task = NULL, quota_held = '{}', deleted_at = ?, updated_at = ?
             WHERE id = ?",
        )
        .bind(now)
        .bind(now)
        .bind(id)
        .execute(&mut *tx)
        .await?;

        quota::release_on(&mut tx, &account_id, &quota_held).await?;

        tx.commit().await?;
        Ok(())
    }

    pub async fn set_config(&self, id: i64, config: &serde_json::Value) -> Result<()> {
        sqlx::query("UPDATE service_instances SET config = ?, updated_at = ? WHERE id = ?")
            .bind(serde_json::to_string(config)?)
            .bind(Utc::now().timestamp())
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    pub async fn set_active_task(&self, id: i64, task_id: Option<&str>) -> Result<()> {
        sqlx::query("UPDATE service_instances SET active_task = ?, updated_at = ? WHERE id = ?")
            .bind(task_id)
            .bind(Utc::now().timestamp())
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    pub async fn set_quota_held(&self, id: i64, held: &QuotaRequest) -> Result<()> {
        sqlx::query("UPDATE service_instances SET quota_held = ?, updated_at = ? WHERE id = ?")
            .bind(serde_json::to_string(held)?)
            .bind(Utc::now().timestamp())
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    /// Hard-delete records soft-deleted before `before`, with their audit rows.
    pub async fn purge_deleted(&self, before: DateTime<Utc>) -> Result<u64> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "DELETE FROM operations WHERE instance_id IN (
                SELECT id FROM service_instances
                WHERE status = ? AND deleted_at IS NOT NULL AND deleted_at < ?)",
        )
        .bind(InstanceStatus::Deleted)
        .bind(before.timestamp())
        .execute(&mut *tx)
        .await?;

        let purged = sqlx::query(
            "DELETE FROM service_instances
             WHERE status = ? AND deleted_at IS NOT NULL AND deleted_at < ?",
        )
        .bind(InstanceStatus::Deleted)
        .bind(before.timestamp())
        .execute(&mut *tx)
        .await?
        .rows_affected();

        tx.commit().await?;

        Ok(purged)
    }
}

/// Guarded status change on `conn`. The `WHERE status IN (...)` clause keeps
/// an illegal move from applying even under concurrent writers.
async fn transition_on(conn: &mut SqliteConnection, id: i64, next: InstanceStatus) -> Result<()> {
    let allowed = next.predecessors();
    if allowed.is_empty() {
        return Err(OrchestratorError::InvalidStateTransition(format!(
            "no state may move to {next}"
        )));
    }

    let placeholders = vec!["?"; allowed.len()].join(", ");
    let sql = format!(
        "UPDATE service_instances SET status = ?, updated_at = ?
         WHERE id = ? AND status IN ({placeholders})"
    );

    let mut q = sqlx::query(&sql)
        .bind(next)
        .bind(Utc::now().timestamp())
        .bind(id);
    for status in allowed {
        q = q.bind(*status);
    }

    if q.execute(&mut *conn).await?.rows_affected() == 0 {
        let current: Option<InstanceStatus> =
            sqlx::query_scalar("SELECT status FROM service_instances WHERE id = ?")
                .bind(id)
                .fetch_optional(&mut *conn)
                .await?;
        return match current {
            Some(current) => Err(OrchestratorError::InvalidStateTransition(format!(
                "service instance {id} cannot move from {current} to {next}"
            ))),
            None => Err(OrchestratorError::NotFound(format!("service instance {id}"))),
        };
    }

    Ok(())
}

// Internal row type for sqlx
#[derive(sqlx::FromRow)]
struct InstanceRow {
    id: i64,
    uuid: String,
    name: String,
    description: Option<String>,
    account_id: String,
    service_definition_id: String,
    plugin_type: PluginType,
    backend: Backend,
    parent_id: Option<i64>,
    status: InstanceStatus,
    resource_uuid: Option<String>,
    config: String,
    quota_held: String,
    last_error: Option<String>,
    active_task: Option<String>,
    created_at: i64,
    updated_at: i64,
    deleted_at: Option<i64>,
}

impl TryFrom<InstanceRow> for ServiceInstance {
    type Error = OrchestratorError;

    fn try_from(row: InstanceRow) -> Result<Self> {
        Ok(Self {
            id: row.id,
            uuid: row.uuid,
            name: row.name,
            description: row.description,
            account_id: row.account_id,
            service_definition_id: row.service_definition_id,
            plugin_type: row.plugin_type,
            backend: row.backend,
            parent_id: row.parent_id,
            status: row.status,
            resource_uuid: row.resource_uuid,
            config: serde_json::from_str(&row.config)?,
            quota_held: serde_json::from_str(&row.quota_held)?,
            last_error: row.last_error,
            active_task: row.active_task,
            created_at: DateTime::from_timestamp(row.created_at, 0).unwrap_or_default(),
            updated_at: DateTime::from_timestamp(row.updated_at, 0).unwrap_or_default(),
            deleted_at: row.deleted_at.and_then(|ts| DateTime::from_timestamp(ts, 0)),
        })
    }
}

// Serialize DateTime as RFC 3339 / ISO 8601 string
fn serialize_datetime<S>(dt: &DateTime<Utc>, serializer: S) -> std::result::Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    serializer.serialize_str(&dt.to_rfc3339())
}

fn serialize_optional_datetime<S>(
    dt: &Option<DateTime<Utc>>,
    serializer: S,
) -> std::result::Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    match dt {
        Some(dt) => serializer.serialize_str(&dt.to_rfc3339()),
        None => serializer.serialize_none(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_path_is_linear() {
        use InstanceStatus::*;
        assert!(Draft.can_transition_to(Pending));
        assert!(Pending.can_transition_to(Building));
        assert!(Building.can_transition_to(Active));
        assert!(!Draft.can_transition_to(Active));
        assert!(!Pending.can_transition_to(Active));
    }

    #[test]
    fn test_error_reachable_from_every_live_state() {
        for status in InstanceStatus::ALL {
            let expected = status != InstanceStatus::Deleted;
            assert_eq!(
                status.can_transition_to(InstanceStatus::Error),
                expected,
                "{status} -> error"
            );
        }
    }

    #[test]
    fn test_deleted_is_terminal() {
        for status in InstanceStatus::ALL {
            assert!(!InstanceStatus::Deleted.can_transition_to(status));
        }
        assert!(InstanceStatus::Deleting.can_transition_to(InstanceStatus::Deleted));
        assert!(!InstanceStatus::Active.can_transition_to(InstanceStatus::Deleted));
    }

    #[test]
    fn test_power_cycle() {
        use InstanceStatus::*;
        assert!(Active.can_transition_to(Stopping));
        assert!(Stopping.can_transition_to(Stopped));
        assert!(Stopped.can_transition_to(Starting));
        assert!(Starting.can_transition_to(Active));
        assert!(!Stopped.can_transition_to(Updating));
    }

    #[test]
    fn test_resource_holding_states() {
        assert!(!InstanceStatus::Pending.may_hold_resource());
        assert!(!InstanceStatus::Deleted.may_hold_resource());
        assert!(InstanceStatus::Building.may_hold_resource());
        assert!(InstanceStatus::Error.may_hold_resource());
    }
}
