//! Shared helpers for catalog-orchestrator integration tests
//!
//! `StubGateway` stands in for the remote admin API. Responses are scripted
//! per collection or per resource uuid, and every call is recorded so tests
//! can assert on exactly what reached the remote side.

#![allow(dead_code)]

use async_trait::async_trait;
use catalog_orchestrator::capability::Backend;
use catalog_orchestrator::gateway::{Accepted, CreatedResource, ResourceGateway, TaskStatus};
use catalog_orchestrator::plugin::ServiceDefinition;
use catalog_orchestrator::{
    CreateInstanceRequest, OperationContext, Orchestrator, OrchestratorError, PluginType,
    TaskPolicy,
};
use serde_json::Value;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::SqlitePool;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

/// Polling policy used by every test orchestrator.
pub const FAST_POLL: TaskPolicy = TaskPolicy::from_millis(5, 250);

/// In-memory database with migrations applied. One connection keeps every
/// query on the same in-memory database.
pub async fn create_test_db() -> SqlitePool {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect("sqlite::memory:")
        .await
        .expect("Failed to create in-memory database");

    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .expect("Failed to run migrations");

    pool
}

pub fn definition(id: &str, plugin_type: PluginType, backend: Backend) -> ServiceDefinition {
    ServiceDefinition {
        id: id.to_string(),
        name: id.to_string(),
        plugin_type,
        backend,
    }
}

/// Orchestrator over `gateway` with one definition per plugin/backend pair
/// the tests use.
pub async fn create_test_orchestrator(gateway: Arc<StubGateway>) -> Orchestrator {
    let pool = create_test_db().await;
    let mut orchestrator = Orchestrator::new(pool, gateway).with_task_policy(FAST_POLL);

    for def in [
        definition("efs-openstack", PluginType::StorageEfs, Backend::OpenStack),
        definition("efs-ontap", PluginType::StorageEfs, Backend::Ontap),
        definition("vm-openstack", PluginType::ComputeInstance, Backend::OpenStack),
        definition("vm-kvm", PluginType::ComputeInstance, Backend::Kvm),
        definition("logs-opensearch", PluginType::LoggingInstance, Backend::OpenSearch),
        definition("logs-kvm", PluginType::LoggingInstance, Backend::Kvm),
    ] {
        orchestrator.add_service_type_plugin(def);
    }

    orchestrator
}

pub fn ctx() -> OperationContext {
    OperationContext::with_request_id("req-test")
}

pub fn share_request(definition: &str, account: &str, size_gb: i64) -> CreateInstanceRequest {
    CreateInstanceRequest {
        service_definition_id: definition.to_string(),
        account_id: account.to_string(),
        name: format!("share-{size_gb}"),
        description: None,
        parent_id: None,
        config: serde_json::json!({ "share_data": { "size_gb": size_gb, "protocol": "nfs" } }),
    }
}

pub fn server_request(definition: &str, account: &str, config: Value) -> CreateInstanceRequest {
    CreateInstanceRequest {
        service_definition_id: definition.to_string(),
        account_id: account.to_string(),
        name: "server".to_string(),
        description: Some("test server".to_string()),
        parent_id: None,
        config,
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum GatewayCall {
    Create { collection: String, body: Value },
    Get { collection: String, uuid: String },
    Update { collection: String, uuid: String, body: Value },
    Delete { collection: String, uuid: String },
    TaskStatus { task_id: String },
}

type Scripted<T> = VecDeque<Result<T, String>>;

#[derive(Default)]
struct StubState {
    calls: Vec<(GatewayCall, String)>,
    creates: HashMap<String, Scripted<CreatedResource>>,
    updates: HashMap<String, Scripted<Accepted>>,
    deletes: HashMap<String, Scripted<Accepted>>,
    tasks: HashMap<String, VecDeque<TaskStatus>>,
    resources: HashMap<String, Value>,
    next_uuid: u64,
}

/// Scripted in-process `ResourceGateway`.
///
/// Unscripted creates succeed immediately with a generated uuid, unscripted
/// updates and deletes finish without a task, and unscripted tasks succeed.
/// The last status scripted for a task repeats forever.
#[derive(Default)]
pub struct StubGateway {
    state: Mutex<StubState>,
}

impl StubGateway {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn script_create(&self, collection: &str, uuid: &str, task_id: Option<&str>) {
        self.state
            .lock()
            .unwrap()
            .creates
            .entry(collection.to_string())
            .or_default()
            .push_back(Ok(CreatedResource {
                uuid: uuid.to_string(),
                task_id: task_id.map(str::to_string),
            }));
    }

    pub fn fail_create(&self, collection: &str, message: &str) {
        self.state
            .lock()
            .unwrap()
            .creates
            .entry(collection.to_string())
            .or_default()
            .push_back(Err(message.to_string()));
    }

    pub fn script_update(&self, uuid: &str, task_id: Option<&str>) {
        self.state
            .lock()
            .unwrap()
            .updates
            .entry(uuid.to_string())
            .or_default()
            .push_back(Ok(Accepted {
                task_id: task_id.map(str::to_string),
            }));
    }

    pub fn fail_update(&self, uuid: &str, message: &str) {
        self.state
            .lock()
            .unwrap()
            .updates
            .entry(uuid.to_string())
            .or_default()
            .push_back(Err(message.to_string()));
    }

    pub fn script_delete(&self, uuid: &str, task_id: Option<&str>) {
        self.state
            .lock()
            .unwrap()
            .deletes
            .entry(uuid.to_string())
            .or_default()
            .push_back(Ok(Accepted {
                task_id: task_id.map(str::to_string),
            }));
    }

    pub fn fail_delete(&self, uuid: &str, message: &str) {
        self.state
            .lock()
            .unwrap()
            .deletes
            .entry(uuid.to_string())
            .or_default()
            .push_back(Err(message.to_string()));
    }

    pub fn script_task(&self, task_id: &str, statuses: Vec<TaskStatus>) {
        self.state
            .lock()
            .unwrap()
            .tasks
            .insert(task_id.to_string(), statuses.into());
    }

    pub fn put_resource(&self, collection: &str, uuid: &str, body: Value) {
        self.state
            .lock()
            .unwrap()
            .resources
            .insert(format!("{collection}/{uuid}"), body);
    }

    pub fn calls(&self) -> Vec<GatewayCall> {
        self.state
            .lock()
            .unwrap()
            .calls
            .iter()
            .map(|(call, _)| call.clone())
            .collect()
    }

    pub fn request_ids(&self) -> Vec<String> {
        self.state
            .lock()
            .unwrap()
            .calls
            .iter()
            .map(|(_, request_id)| request_id.clone())
            .collect()
    }

    /// Calls other than task polls.
    pub fn mutating_calls(&self) -> Vec<GatewayCall> {
        self.calls()
            .into_iter()
            .filter(|c| !matches!(c, GatewayCall::TaskStatus { .. } | GatewayCall::Get { .. }))
            .collect()
    }

    pub fn create_count(&self, collection: &str) -> usize {
        self.calls()
            .iter()
            .filter(|c| matches!(c, GatewayCall::Create { collection: name, .. } if name == collection))
            .count()
    }

    pub fn delete_count(&self, collection: &str) -> usize {
        self.calls()
            .iter()
            .filter(|c| matches!(c, GatewayCall::Delete { collection: name, .. } if name == collection))
            .count()
    }

    pub fn poll_count(&self, task_id: &str) -> usize {
        self.calls()
            .iter()
            .filter(|c| matches!(c, GatewayCall::TaskStatus { task_id: t } if t == task_id))
            .count()
    }

    fn record(&self, ctx: &OperationContext, call: GatewayCall) {
        self.state
            .lock()
            .unwrap()
            .calls
            .push((call, ctx.request_id.clone()));
    }
}

fn remote_failure(message: String) -> OrchestratorError {
    OrchestratorError::RemoteCallFailed(message)
}

#[async_trait]
impl ResourceGateway for StubGateway {
    async fn create(
        &self,
        ctx: &OperationContext,
        collection: &str,
        descriptor: &Value,
    ) -> catalog_orchestrator::Result<CreatedResource> {
        self.record(
            ctx,
            GatewayCall::Create {
                collection: collection.to_string(),
                body: descriptor.clone(),
            },
        );

        let mut state = self.state.lock().unwrap();
        let scripted = state
            .creates
            .get_mut(collection)
            .and_then(|queue| queue.pop_front());

        match scripted {
            Some(response) => response.map_err(remote_failure),
            None => {
                state.next_uuid += 1;
                Ok(CreatedResource {
                    uuid: format!("{collection}-{}", state.next_uuid),
                    task_id: None,
                })
            }
        }
    }

    async fn get(
        &self,
        ctx: &OperationContext,
        collection: &str,
        uuid: &str,
    ) -> catalog_orchestrator::Result<Option<Value>> {
        self.record(
            ctx,
            GatewayCall::Get {
                collection: collection.to_string(),
                uuid: uuid.to_string(),
            },
        );

        let state = self.state.lock().unwrap();
        Ok(Some(
            state
                .resources
                .get(&format!("{collection}/{uuid}"))
                .cloned()
                .unwrap_or_else(|| serde_json::json!({ "uuid": uuid })),
        ))
    }

    async fn update(
        &self,
        ctx: &OperationContext,
        collection: &str,
        uuid: &str,
        descriptor: &Value,
    ) -> catalog_orchestrator::Result<Accepted> {
        self.record(
            ctx,
            GatewayCall::Update {
                collection: collection.to_string(),
                uuid: uuid.to_string(),
                body: descriptor.clone(),
            },
        );

        let mut state = self.state.lock().unwrap();
        match state.updates.get_mut(uuid).and_then(|q| q.pop_front()) {
            Some(response) => response.map_err(remote_failure),
            None => Ok(Accepted::default()),
        }
    }

    async fn delete(
        &self,
        ctx: &OperationContext,
        collection: &str,
        uuid: &str,
    ) -> catalog_orchestrator::Result<Accepted> {
        self.record(
            ctx,
            GatewayCall::Delete {
                collection: collection.to_string(),
                uuid: uuid.to_string(),
            },
        );

        let mut state = self.state.lock().unwrap();
        match state.deletes.get_mut(uuid).and_then(|q| q.pop_front()) {
            Some(response) => response.map_err(remote_failure),
            None => Ok(Accepted::default()),
        }
    }

    async fn task_status(
        &self,
        ctx: &OperationContext,
        task_id: &str,
    ) -> catalog_orchestrator::Result<TaskStatus> {
        self.record(
            ctx,
            GatewayCall::TaskStatus {
                task_id: task_id.to_string(),
            },
        );

        let mut state = self.state.lock().unwrap();
        let status = match state.tasks.get_mut(task_id) {
            Some(queue) if queue.len() > 1 => queue.pop_front(),
            Some(queue) => queue.front().cloned(),
            None => None,
        };

        Ok(status.unwrap_or_else(TaskStatus::success))
    }
}
