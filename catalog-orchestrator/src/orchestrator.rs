//! Controller-facing entry point tying plugins, quotas, the remote API and
//! the record store together.
//!
//! Every operation runs to completion on the calling task. Callers serialize
//! operations on the same instance.

use crate::action::{ActionReport, ActionRouter, Settle, StepOutput};
use crate::capability::CapabilitySet;
use crate::config::OrchestratorConfig;
use crate::context::OperationContext;
use crate::error::{OrchestratorError, Result};
use crate::gateway::{HttpResourceGateway, ResourceGateway};
use crate::operation::{Operation, OperationLog, OperationType};
use crate::plugin::storage::GrantOperation;
use crate::plugin::{require_resource, Anchor, ServiceDefinition, ServicePlugin};
use crate::quota::{QuotaGuard, QuotaRequest};
use crate::record::{InstanceFilters, InstanceStatus, InstanceStore, NewInstance, ServiceInstance};
use crate::task::{RemoteTask, TaskOutcome, TaskPolicy, TaskTracker};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::SqlitePool;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, instrument, warn};

/// Parent chains deeper than this are rejected.
const MAX_PARENT_DEPTH: usize = 16;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateInstanceRequest {
    pub service_definition_id: String,
    pub account_id: String,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub parent_id: Option<i64>,
    pub config: Value,
}

pub struct Orchestrator {
    store: InstanceStore,
    quotas: QuotaGuard,
    operations: OperationLog,
    gateway: Arc<dyn ResourceGateway>,
    tracker: TaskTracker,
    router: ActionRouter,
    plugins: HashMap<String, ServicePlugin>,
}

impl Orchestrator {
    pub fn new(pool: SqlitePool, gateway: Arc<dyn ResourceGateway>) -> Self {
        let store = InstanceStore::new(pool.clone());

        Self {
            quotas: QuotaGuard::new(pool.clone()),
            operations: OperationLog::new(pool),
            tracker: TaskTracker::new(gateway.clone()),
            router: ActionRouter::new(gateway.clone(), store.clone()),
            store,
            gateway,
            plugins: HashMap::new(),
        }
    }

    pub fn with_quota_defaults(mut self, defaults: BTreeMap<String, i64>) -> Self {
        self.quotas = QuotaGuard::with_defaults(self.store.pool().clone(), defaults);
        self
    }

    /// Poll every remote task with `policy` instead of the plugin defaults.
    pub fn with_task_policy(mut self, policy: TaskPolicy) -> Self {
        self.router = self.router.with_policy_override(policy);
        self
    }

    /// Build an orchestrator talking HTTP to the admin API, with every
    /// configured service definition registered.
    pub fn from_config(pool: SqlitePool, config: &OrchestratorConfig) -> Result<Self> {
        let gateway = Arc::new(HttpResourceGateway::new(&config.gateway)?);
        let mut orchestrator =
            Self::new(pool, gateway).with_quota_defaults(config.quota_defaults.clone());

        for definition in &config.definitions {
            orchestrator.add_service_type_plugin(definition.clone());
        }

        Ok(orchestrator)
    }

    pub fn pool(&self) -> &SqlitePool {
        self.store.pool()
    }

    pub fn quotas(&self) -> &QuotaGuard {
        &self.quotas
    }

    /// Register the plugin serving `definition`, returning the one it replaces.
    pub fn add_service_type_plugin(&mut self, definition: ServiceDefinition) -> Option<ServicePlugin> {
        let plugin = ServicePlugin::for_definition(&definition);
        info!(
            definition = %definition.id,
            plugin_type = %definition.plugin_type.as_str(),
            backend = %definition.backend,
            "Registered service definition"
        );
        self.plugins.insert(definition.id, plugin)
    }

    pub fn get_service_type_plugin(&self, service_definition_id: &str) -> Result<ServicePlugin> {
        self.plugins
            .get(service_definition_id)
            .copied()
            .ok_or_else(|| {
                OrchestratorError::NotFound(format!("service definition {service_definition_id}"))
            })
    }

    pub async fn get(&self, id: i64) -> Result<ServiceInstance> {
        self.store.get(id).await
    }

    pub async fn get_by_uuid(&self, uuid: &str) -> Result<ServiceInstance> {
        self.store.get_by_uuid(uuid).await
    }

    pub async fn list(&self, filters: &InstanceFilters) -> Result<Vec<ServiceInstance>> {
        self.store.list(filters).await
    }

    pub async fn available_capabilities(&self, id: i64) -> Result<CapabilitySet> {
        let instance = self.store.get(id).await?;
        Ok(ServicePlugin::for_instance(&instance).available_capabilities())
    }

    /// Audit trail of an instance, oldest first.
    pub async fn operations(&self, id: i64) -> Result<Vec<Operation>> {
        self.operations.for_instance(id).await
    }

    /// Wait on a task handed out by an earlier operation.
    pub async fn wait(&self, ctx: &OperationContext, task: &RemoteTask) -> TaskOutcome {
        self.tracker.wait(ctx, task).await
    }

    /// Hard-delete records that have been DELETED for longer than `retention`.
    pub async fn purge_deleted(&self, retention: Duration) -> Result<u64> {
        let retention = chrono::Duration::from_std(retention)
            .map_err(|e| OrchestratorError::InvalidInput(format!("retention: {e}")))?;
        self.store.purge_deleted(Utc::now() - retention).await
    }

    /// Provision a new service instance.
    ///
    /// Nothing is written and no remote call is made until the config is
    /// valid and the quota is reserved.
    #[instrument(
        skip(self, ctx, request),
        fields(
            request_id = %ctx.request_id,
            definition = %request.service_definition_id,
            account_id = %request.account_id
        )
    )]
    pub async fn create(
        &self,
        ctx: &OperationContext,
        request: CreateInstanceRequest,
    ) -> Result<(ServiceInstance, Option<RemoteTask>)> {
        let plugin = self.get_service_type_plugin(&request.service_definition_id)?;

        if request.name.trim().is_empty() {
            return Err(OrchestratorError::InvalidInput(
                "instance name must not be empty".to_string(),
            ));
        }

        let anchor = self.resolve_anchor(request.parent_id).await?;
        let prepared = plugin.pre_create(&request.name, &request.config, &anchor)?;

        self.quotas
            .check_and_reserve(&request.account_id, &prepared.quota)
            .await?;

        let new = NewInstance {
            name: request.name,
            description: request.description,
            account_id: request.account_id,
            service_definition_id: request.service_definition_id,
            plugin_type: plugin.plugin_type(),
            backend: plugin.backend(),
            parent_id: request.parent_id,
            config: prepared.config,
            quota_held: prepared.quota.clone(),
        };

        let instance = match self.store.insert(&new).await {
            Ok(instance) => instance,
            Err(e) => {
                self.release_quietly(&new.account_id, &prepared.quota).await;
                return Err(e);
            }
        };

        info!(instance_id = instance.id, uuid = %instance.uuid, "Service instance recorded");

        let op = self
            .begin(ctx, instance.id, OperationType::Create, None)
            .await;

        let mut remote = None;
        let result = match self
            .drive_create(ctx, plugin, &instance, &prepared.descriptor, &mut remote)
            .await
        {
            Ok(task) => self.store.get(instance.id).await.map(|i| (i, task)),
            Err(e) => Err(self.abort_create(&instance, remote.as_deref(), e).await),
        };

        self.end(op, result.as_ref().err()).await;
        result
    }

    async fn drive_create(
        &self,
        ctx: &OperationContext,
        plugin: ServicePlugin,
        instance: &ServiceInstance,
        descriptor: &Value,
        remote: &mut Option<String>,
    ) -> Result<Option<RemoteTask>> {
        let id = instance.id;

        self.store.transition(id, InstanceStatus::Pending).await?;

        let created = self
            .gateway
            .create(ctx, plugin.collection(), descriptor)
            .await?;
        *remote = Some(created.uuid.clone());
        self.store.set_building(id, &created.uuid).await?;
        info!(instance_id = id, resource_uuid = %created.uuid, "Remote resource created");

        let task = match created.task_id {
            Some(task_id) => Some(
                self.router
                    .await_task(ctx, id, task_id, plugin.policies().create)
                    .await?,
            ),
            None => None,
        };

        self.store.transition(id, InstanceStatus::Active).await?;

        let active = self.store.get(id).await?;
        let steps = plugin.post_create(&active)?;
        if !steps.is_empty() {
            let report = self.router.execute(ctx, id, &steps).await;
            self.apply_outputs(plugin, id, &report.completed).await?;
            if let Some(failure) = report.failure {
                return Err(failure);
            }
        }

        Ok(task)
    }

    /// Compensate a create that failed after its record was written. The
    /// quota is only handed back when no remote resource was ever created.
    async fn abort_create(
        &self,
        instance: &ServiceInstance,
        remote: Option<&str>,
        err: OrchestratorError,
    ) -> OrchestratorError {
        let recorded = match self.store.get(instance.id).await {
            Ok(current) => current.resource_uuid.is_some(),
            Err(e) => {
                error!(instance_id = instance.id, "Could not reload record after failed create: {}", e);
                true
            }
        };

        if let (Some(resource_uuid), false) = (remote, recorded) {
            error!(
                instance_id = instance.id,
                resource_uuid,
                "Remote resource exists but was never recorded, keeping its quota"
            );
        }
        let resource_created = recorded || remote.is_some();

        if !resource_created {
            self.release_quietly(&instance.account_id, &instance.quota_held)
                .await;
            if let Err(e) = self
                .store
                .set_quota_held(instance.id, &QuotaRequest::new())
                .await
            {
                error!(instance_id = instance.id, "Failed to clear held quota: {}", e);
            }
        }

        self.fail(instance.id, err).await
    }

    /// Delete an instance and its remote resource.
    #[instrument(skip(self, ctx), fields(request_id = %ctx.request_id))]
    pub async fn delete(
        &self,
        ctx: &OperationContext,
        id: i64,
    ) -> Result<(ServiceInstance, Option<RemoteTask>)> {
        let instance = self.store.get(id).await?;
        let plugin = ServicePlugin::for_instance(&instance);

        plugin.pre_delete(&instance)?;
        self.store.transition(id, InstanceStatus::Deleting).await?;

        let op = self.begin(ctx, id, OperationType::Delete, None).await;

        let result = match self.drive_delete(ctx, plugin, &instance).await {
            Ok(task) => self.store.get(id).await.map(|i| (i, task)),
            Err(e) => Err(self.fail(id, e).await),
        };

        self.end(op, result.as_ref().err()).await;
        result
    }

    async fn drive_delete(
        &self,
        ctx: &OperationContext,
        plugin: ServicePlugin,
        instance: &ServiceInstance,
    ) -> Result<Option<RemoteTask>> {
        let task = match &instance.resource_uuid {
            Some(resource_uuid) => {
                let accepted = self
                    .gateway
                    .delete(ctx, plugin.collection(), resource_uuid)
                    .await?;
                match accepted.task_id {
                    Some(task_id) => Some(
                        self.router
                            .await_task(ctx, instance.id, task_id, plugin.policies().delete)
                            .await?,
                    ),
                    None => None,
                }
            }
            None => {
                info!(instance_id = instance.id, "No remote resource, skipping remote delete");
                None
            }
        };

        self.finish_delete(instance).await?;

        Ok(task)
    }

    /// The remote side confirmed removal: soft-delete and hand back quota.
    async fn finish_delete(&self, instance: &ServiceInstance) -> Result<()> {
        self.store.mark_deleted(instance.id).await?;

        info!(instance_id = instance.id, "Service instance deleted");
        Ok(())
    }

    /// Change an active instance's configuration on the remote side.
    #[instrument(skip(self, ctx, params), fields(request_id = %ctx.request_id))]
    pub async fn update(
        &self,
        ctx: &OperationContext,
        id: i64,
        params: Value,
    ) -> Result<(ServiceInstance, Option<RemoteTask>)> {
        let instance = self.store.get(id).await?;
        let plugin = ServicePlugin::for_instance(&instance);

        if let Some(capability) = plugin.update_capability(&params) {
            plugin.require(capability)?;
        }

        if instance.status != InstanceStatus::Active {
            return Err(OrchestratorError::InvalidStateTransition(format!(
                "service instance {id} is {}, updates need active",
                instance.status
            )));
        }

        let prepared = plugin.prepare_update(&instance, &params)?;
        let resource_uuid = require_resource(&instance)?.to_string();
        let (grow, shrink) = prepared.quota_delta.split_delta();

        self.quotas
            .check_and_reserve(&instance.account_id, &grow)
            .await?;

        if let Err(e) = self.store.transition(id, InstanceStatus::Updating).await {
            self.release_quietly(&instance.account_id, &grow).await;
            return Err(e);
        }

        let op = self.begin(ctx, id, OperationType::Update, None).await;

        let mut held = instance.quota_held.clone();
        held.merge(&grow);

        let result = async {
            self.store.set_quota_held(id, &held).await?;

            let accepted = self
                .gateway
                .update(ctx, plugin.collection(), &resource_uuid, &prepared.descriptor)
                .await?;
            let task = match accepted.task_id {
                Some(task_id) => Some(
                    self.router
                        .await_task(ctx, id, task_id, plugin.policies().update)
                        .await?,
                ),
                None => None,
            };

            self.store.set_config(id, &prepared.config).await?;

            if !shrink.is_empty() {
                self.quotas.release(&instance.account_id, &shrink).await?;
                held.subtract(&shrink);
                self.store.set_quota_held(id, &held).await?;
            }

            self.store.transition(id, InstanceStatus::Active).await?;
            Ok::<_, OrchestratorError>(task)
        }
        .await;

        let result = match result {
            Ok(task) => self.store.get(id).await.map(|i| (i, task)),
            Err(e) => Err(self.fail(id, e).await),
        };

        self.end(op, result.as_ref().err()).await;
        result
    }

    /// Run a named multi-step action.
    #[instrument(skip(self, ctx, data), fields(request_id = %ctx.request_id))]
    pub async fn action(
        &self,
        ctx: &OperationContext,
        id: i64,
        name: &str,
        data: Value,
    ) -> Result<(ServiceInstance, Option<RemoteTask>)> {
        let instance = self.store.get(id).await?;
        let plugin = ServicePlugin::for_instance(&instance);

        if let Some(capability) = plugin.action_capability(name)? {
            plugin.require(capability)?;
        }

        let spec = plugin.plan_action(&instance, name, &data)?;
        self.store.transition(id, spec.in_flight).await?;

        let op = self.begin(ctx, id, OperationType::Action, Some(name)).await;

        let report = self.router.execute(ctx, id, &spec.steps).await;
        let task = report.last_task();
        let ActionReport { completed, failure } = report;

        let settled = async {
            self.apply_outputs(plugin, id, &completed).await?;
            if let Some(failure) = failure {
                return Err(failure);
            }
            match spec.settle {
                Settle::Status(status) => self.store.transition(id, status).await,
                Settle::Deleted => self.finish_delete(&instance).await,
            }
        }
        .await;

        let result = match settled {
            Ok(()) => self.store.get(id).await.map(|i| (i, task)),
            Err(e) => Err(self.fail(id, e).await),
        };

        self.end(op, result.as_ref().err()).await;
        result
    }

    /// Add or remove an access grant on a share's mount target.
    pub async fn grant_operation(
        &self,
        ctx: &OperationContext,
        id: i64,
        operation: &GrantOperation,
    ) -> Result<(ServiceInstance, Option<RemoteTask>)> {
        let data = serde_json::to_value(operation)?;
        self.action(ctx, id, "mount_target_grant", data).await
    }

    /// Zone and network inherited from the parent chain, nearest first.
    async fn resolve_anchor(&self, parent_id: Option<i64>) -> Result<Anchor> {
        let mut anchor = Anchor::default();
        let mut next = parent_id;
        let mut depth = 0;

        while let Some(ancestor_id) = next {
            if depth == MAX_PARENT_DEPTH {
                return Err(OrchestratorError::InvalidInput(format!(
                    "parent chain exceeds {MAX_PARENT_DEPTH} levels"
                )));
            }

            let ancestor = self.store.get(ancestor_id).await?;
            if depth == 0 && ancestor.status != InstanceStatus::Active {
                return Err(OrchestratorError::InvalidStateTransition(format!(
                    "parent {ancestor_id} is {}, expected active",
                    ancestor.status
                )));
            }

            anchor.inherit(&Anchor::from_config(&ancestor.config));
            next = ancestor.parent_id;
            depth += 1;
        }

        Ok(anchor)
    }

    async fn apply_outputs(
        &self,
        plugin: ServicePlugin,
        id: i64,
        outputs: &[StepOutput],
    ) -> Result<()> {
        if outputs.is_empty() {
            return Ok(());
        }

        let current = self.store.get(id).await?;
        let config = plugin.apply_effects(&current, outputs)?;
        self.store.set_config(id, &config).await
    }

    /// Move the record to ERROR with `err` as its last error, then hand `err` back.
    async fn fail(&self, id: i64, err: OrchestratorError) -> OrchestratorError {
        warn!(instance_id = id, "Operation failed: {}", err);

        if let Err(e) = self.store.mark_error(id, &err.to_string()).await {
            error!(instance_id = id, "Failed to record error state: {}", e);
        }

        err
    }

    async fn release_quietly(&self, account_id: &str, request: &QuotaRequest) {
        if let Err(e) = self.quotas.release(account_id, request).await {
            error!(account_id, "Failed to release quota: {}", e);
        }
    }

    async fn begin(
        &self,
        ctx: &OperationContext,
        id: i64,
        operation_type: OperationType,
        action_name: Option<&str>,
    ) -> Option<String> {
        match self
            .operations
            .start(ctx, id, operation_type, action_name)
            .await
        {
            Ok(op) => Some(op),
            Err(e) => {
                warn!(instance_id = id, "Failed to record operation start: {}", e);
                None
            }
        }
    }

    async fn end(&self, op: Option<String>, error: Option<&OrchestratorError>) {
        if let Some(op) = op {
            if let Err(e) = self.operations.finish(&op, error).await {
                warn!(operation = %op, "Failed to record operation result: {}", e);
            }
        }
    }
}
