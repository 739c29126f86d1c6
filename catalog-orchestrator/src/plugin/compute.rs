//! Virtual machine instances.

use super::{
    decode, encode, require_resource, unknown_action, Anchor, LifecyclePlugin, LifecyclePolicies,
    PreparedCreate, PreparedUpdate,
};
use crate::action::{ActionSpec, RemoteCall, Settle, StepDescriptor, StepEffect, StepOutput};
use crate::capability::{Backend, Capability};
use crate::error::{OrchestratorError, Result};
use crate::quota::QuotaRequest;
use crate::record::{InstanceStatus, PluginType, ServiceInstance};
use crate::task::TaskPolicy;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

pub const SERVERS: &str = "servers";
pub const SERVER_RULES: &str = "server-rules";

pub const QUOTA_INSTANCES: &str = "compute.instances";
pub const QUOTA_CORES: &str = "compute.cores";
pub const QUOTA_RAM_MB: &str = "compute.ram_mb";

const MAX_CPU: i64 = 128;
const MIN_RAM_MB: i64 = 128;

const CREATE_POLICY: TaskPolicy = TaskPolicy::from_secs(4, 600);
const UPDATE_POLICY: TaskPolicy = TaskPolicy::from_secs(4, 600);
const DELETE_POLICY: TaskPolicy = TaskPolicy::from_secs(4, 300);
const POWER_POLICY: TaskPolicy = TaskPolicy::from_secs(2, 180);
const RULE_POLICY: TaskPolicy = TaskPolicy::from_secs(2, 180);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleType {
    Ip,
    SecurityGroup,
}

/// Inbound access rule on a server. Rules without a uuid are pending and get
/// applied once the server is active.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerRule {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uuid: Option<String>,
    pub access_type: RuleType,
    pub access_to: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComputeConfig {
    pub flavor: String,
    pub image: String,
    pub cpu: i64,
    pub ram_mb: i64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub grants: Vec<ServerRule>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub addresses: Vec<String>,
    #[serde(flatten)]
    pub anchor: Anchor,
}

impl ComputeConfig {
    fn validate(&self) -> Result<()> {
        if self.flavor.trim().is_empty() || self.image.trim().is_empty() {
            return Err(OrchestratorError::InvalidInput(
                "flavor and image are required".to_string(),
            ));
        }
        validate_shape(self.cpu, self.ram_mb)
    }

    fn quota(&self) -> QuotaRequest {
        QuotaRequest::new()
            .with(QUOTA_INSTANCES, 1)
            .with(QUOTA_CORES, self.cpu)
            .with(QUOTA_RAM_MB, self.ram_mb)
    }
}

fn validate_shape(cpu: i64, ram_mb: i64) -> Result<()> {
    if !(1..=MAX_CPU).contains(&cpu) {
        return Err(OrchestratorError::InvalidInput(format!(
            "cpu must be between 1 and {MAX_CPU}, got {cpu}"
        )));
    }
    if ram_mb < MIN_RAM_MB {
        return Err(OrchestratorError::InvalidInput(format!(
            "ram_mb must be at least {MIN_RAM_MB}, got {ram_mb}"
        )));
    }
    Ok(())
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ComputeUpdate {
    flavor: Option<String>,
    cpu: Option<i64>,
    ram_mb: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct RuleRequest {
    access_type: RuleType,
    access_to: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ComputeInstance {
    backend: Backend,
}

impl ComputeInstance {
    pub fn new(backend: Backend) -> Self {
        Self { backend }
    }

    fn config(&self, instance: &ServiceInstance) -> Result<ComputeConfig> {
        decode("compute config", &instance.config)
    }

    fn add_rule_step(&self, server_uuid: &str, access_type: RuleType, access_to: &str) -> StepDescriptor {
        StepDescriptor::new(
            format!("add_rule:{access_to}"),
            RemoteCall::Create {
                collection: SERVER_RULES,
                body: json!({
                    "server_uuid": server_uuid,
                    "access_type": access_type,
                    "access_to": access_to,
                }),
            },
            RULE_POLICY,
        )
        .with_effect(StepEffect::ServerRuleAdded {
            access_type,
            access_to: access_to.to_string(),
        })
    }

    fn power_step(&self, server_uuid: &str, power_state: &str) -> StepDescriptor {
        StepDescriptor::new(
            format!("power_{power_state}"),
            RemoteCall::Update {
                collection: SERVERS,
                uuid: server_uuid.to_string(),
                body: json!({ "power_state": power_state }),
            },
            POWER_POLICY,
        )
    }
}

impl LifecyclePlugin for ComputeInstance {
    fn plugin_type(&self) -> PluginType {
        PluginType::ComputeInstance
    }

    fn backend(&self) -> Backend {
        self.backend
    }

    fn collection(&self) -> &'static str {
        SERVERS
    }

    fn policies(&self) -> LifecyclePolicies {
        LifecyclePolicies {
            create: CREATE_POLICY,
            update: UPDATE_POLICY,
            delete: DELETE_POLICY,
        }
    }

    fn pre_create(&self, name: &str, config: &Value, anchor: &Anchor) -> Result<PreparedCreate> {
        let mut config: ComputeConfig = decode("compute config", config)?;

        if !config.grants.is_empty() {
            self.require(Capability::Grant)?;
        }
        config.validate()?;
        config.anchor.inherit(anchor);

        let zone = config.anchor.zone.clone().ok_or_else(|| {
            OrchestratorError::InvalidInput(
                "compute instances need a zone, directly or from a parent".to_string(),
            )
        })?;

        // Rules are applied after creation; any uuid supplied up front is ignored.
        for rule in &mut config.grants {
            rule.uuid = None;
        }
        config.addresses.clear();

        let mut descriptor = json!({
            "name": name,
            "flavor": config.flavor,
            "image": config.image,
            "vcpus": config.cpu,
            "ram_mb": config.ram_mb,
            "availability_zone": zone,
        });
        if let Some(network_id) = &config.anchor.network_id {
            descriptor["network_id"] = json!(network_id);
        }

        Ok(PreparedCreate {
            quota: config.quota(),
            descriptor,
            config: encode(&config)?,
        })
    }

    fn post_create(&self, instance: &ServiceInstance) -> Result<Vec<StepDescriptor>> {
        let server_uuid = require_resource(instance)?;
        let config = self.config(instance)?;

        let mut steps = vec![StepDescriptor::new(
            "fetch_server",
            RemoteCall::Fetch {
                collection: SERVERS,
                uuid: server_uuid.to_string(),
            },
            CREATE_POLICY,
        )
        .with_effect(StepEffect::DetailsFetched)];

        steps.extend(
            config
                .grants
                .iter()
                .filter(|rule| rule.uuid.is_none())
                .map(|rule| self.add_rule_step(server_uuid, rule.access_type, &rule.access_to)),
        );

        Ok(steps)
    }

    fn update_capability(&self, params: &Value) -> Option<Capability> {
        ["cpu", "ram_mb", "flavor"]
            .iter()
            .any(|key| params.get(key).is_some())
            .then_some(Capability::Resize)
    }

    fn prepare_update(&self, instance: &ServiceInstance, params: &Value) -> Result<PreparedUpdate> {
        let update: ComputeUpdate = decode("compute update", params)?;
        if update.flavor.is_none() && update.cpu.is_none() && update.ram_mb.is_none() {
            return Err(OrchestratorError::InvalidInput("nothing to update".to_string()));
        }

        let mut config = self.config(instance)?;
        let before = config.quota();

        if let Some(flavor) = update.flavor {
            config.flavor = flavor;
        }
        if let Some(cpu) = update.cpu {
            config.cpu = cpu;
        }
        if let Some(ram_mb) = update.ram_mb {
            config.ram_mb = ram_mb;
        }
        config.validate()?;

        let mut quota_delta = config.quota();
        quota_delta.subtract(&before);

        Ok(PreparedUpdate {
            descriptor: json!({
                "flavor": config.flavor,
                "vcpus": config.cpu,
                "ram_mb": config.ram_mb,
            }),
            config: encode(&config)?,
            quota_delta,
        })
    }

    fn action_capability(&self, action: &str) -> Result<Option<Capability>> {
        match action {
            "stop" | "start" | "reboot" => Ok(None),
            "add_grant" | "remove_grant" => Ok(Some(Capability::Grant)),
            _ => Err(unknown_action(self.plugin_type(), action)),
        }
    }

    fn plan_action(
        &self,
        instance: &ServiceInstance,
        action: &str,
        data: &Value,
    ) -> Result<ActionSpec> {
        let server_uuid = require_resource(instance)?;

        let (steps, in_flight, settle) = match action {
            "stop" => (
                vec![self.power_step(server_uuid, "off")],
                InstanceStatus::Stopping,
                Settle::Status(InstanceStatus::Stopped),
            ),
            "start" => (
                vec![self.power_step(server_uuid, "on")],
                InstanceStatus::Starting,
                Settle::Status(InstanceStatus::Active),
            ),
            "reboot" => (
                vec![self.power_step(server_uuid, "reboot")],
                InstanceStatus::Updating,
                Settle::Status(InstanceStatus::Active),
            ),
            "add_grant" => {
                let request: RuleRequest = decode("rule", data)?;
                let config = self.config(instance)?;
                if config
                    .grants
                    .iter()
                    .any(|r| r.access_type == request.access_type && r.access_to == request.access_to)
                {
                    return Err(OrchestratorError::InvalidInput(format!(
                        "{} is already allowed",
                        request.access_to
                    )));
                }
                (
                    vec![self.add_rule_step(server_uuid, request.access_type, &request.access_to)],
                    InstanceStatus::Updating,
                    Settle::Status(InstanceStatus::Active),
                )
            }
            "remove_grant" => {
                let request: RuleRequest = decode("rule", data)?;
                let config = self.config(instance)?;
                let rule_uuid = config
                    .grants
                    .iter()
                    .find(|r| r.access_type == request.access_type && r.access_to == request.access_to)
                    .and_then(|r| r.uuid.clone())
                    .ok_or_else(|| {
                        OrchestratorError::NotFound(format!("rule for {}", request.access_to))
                    })?;
                (
                    vec![StepDescriptor::new(
                        format!("delete_rule:{rule_uuid}"),
                        RemoteCall::Delete {
                            collection: SERVER_RULES,
                            uuid: rule_uuid.clone(),
                        },
                        RULE_POLICY,
                    )
                    .with_effect(StepEffect::ServerRuleRemoved { rule_uuid })],
                    InstanceStatus::Updating,
                    Settle::Status(InstanceStatus::Active),
                )
            }
            _ => return Err(unknown_action(self.plugin_type(), action)),
        };

        Ok(ActionSpec {
            name: action.to_string(),
            data: data.clone(),
            steps,
            in_flight,
            settle,
        })
    }

    fn apply_effects(&self, instance: &ServiceInstance, outputs: &[StepOutput]) -> Result<Value> {
        let mut config = self.config(instance)?;

        for output in outputs {
            match &output.effect {
                StepEffect::DetailsFetched => {
                    if let Some(addresses) = output
                        .body
                        .as_ref()
                        .and_then(|body| body.get("addresses"))
                        .and_then(Value::as_array)
                    {
                        config.addresses = addresses
                            .iter()
                            .filter_map(Value::as_str)
                            .map(str::to_string)
                            .collect();
                    }
                }
                StepEffect::ServerRuleAdded {
                    access_type,
                    access_to,
                } => {
                    let access_type = *access_type;
                    let uuid = output.created_uuid.clone();
                    match config.grants.iter_mut().find(|r| {
                        r.uuid.is_none() && r.access_type == access_type && &r.access_to == access_to
                    }) {
                        Some(pending) => pending.uuid = uuid,
                        None => config.grants.push(ServerRule {
                            uuid,
                            access_type,
                            access_to: access_to.clone(),
                        }),
                    }
                }
                StepEffect::ServerRuleRemoved { rule_uuid } => config
                    .grants
                    .retain(|r| r.uuid.as_deref() != Some(rule_uuid.as_str())),
                _ => {}
            }
        }

        encode(&config)
    }
}
