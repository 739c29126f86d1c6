//! Elastic file storage: a share, an optional mount target, and grants on it.
//!
//! Teardown always runs grants first, then the mount target, then the share.

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

pub const SHARES: &str = "shares";
pub const MOUNT_TARGETS: &str = "mount-targets";
pub const SHARE_GRANTS: &str = "share-grants";

pub const QUOTA_INSTANCES: &str = "share.instances";
pub const QUOTA_BLOCKS: &str = "share.blocks";

const MAX_SIZE_GB: i64 = 16_384;

const SHARE_POLICY: TaskPolicy = TaskPolicy::from_secs(4, 600);
const MOUNT_TARGET_POLICY: TaskPolicy = TaskPolicy::from_secs(2, 180);
const GRANT_POLICY: TaskPolicy = TaskPolicy::from_secs(2, 180);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ShareProtocol {
    #[default]
    Nfs,
    Cifs,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccessType {
    Ip,
    User,
    Cert,
}

impl AccessType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccessType::Ip => "ip",
            AccessType::User => "user",
            AccessType::Cert => "cert",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum AccessLevel {
    #[default]
    Rw,
    Ro,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShareData {
    pub size_gb: i64,
    #[serde(default)]
    pub protocol: ShareProtocol,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub export_location: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MountTargetData {
    pub uuid: String,
    pub subnet_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip_address: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShareGrant {
    pub uuid: String,
    pub access_type: AccessType,
    pub access_to: String,
    #[serde(default)]
    pub access_level: AccessLevel,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageConfig {
    pub share_data: ShareData,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mount_target_data: Option<MountTargetData>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub grants: Vec<ShareGrant>,
    #[serde(flatten)]
    pub anchor: Anchor,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GrantAction {
    Add,
    Remove,
}

/// Payload of the `mount_target_grant` action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GrantOperation {
    pub action: GrantAction,
    pub access_type: AccessType,
    pub access_to: String,
    #[serde(default)]
    pub access_level: AccessLevel,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct StorageUpdate {
    size_gb: Option<i64>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct MountTargetRequest {
    #[serde(default)]
    subnet_id: Option<String>,
    #[serde(default)]
    ip_address: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StorageEfs {
    backend: Backend,
}

impl StorageEfs {
    pub fn new(backend: Backend) -> Self {
        Self { backend }
    }

    fn config(&self, instance: &ServiceInstance) -> Result<StorageConfig> {
        decode("storage config", &instance.config)
    }

    fn mount_target<'a>(&self, config: &'a StorageConfig) -> Result<&'a MountTargetData> {
        config.mount_target_data.as_ref().ok_or_else(|| {
            OrchestratorError::InvalidStateTransition("share has no mount target".to_string())
        })
    }

    /// Grant removals followed by the mount target removal, if there is one.
    fn mount_target_teardown(&self, config: &StorageConfig) -> Vec<StepDescriptor> {
        let mut steps: Vec<StepDescriptor> = config
            .grants
            .iter()
            .map(|grant| {
                StepDescriptor::new(
                    format!("delete_grant:{}", grant.uuid),
                    RemoteCall::Delete {
                        collection: SHARE_GRANTS,
                        uuid: grant.uuid.clone(),
                    },
                    GRANT_POLICY,
                )
                .with_effect(StepEffect::GrantRemoved {
                    grant_uuid: grant.uuid.clone(),
                })
            })
            .collect();

        if let Some(mount_target) = &config.mount_target_data {
            steps.push(
                StepDescriptor::new(
                    format!("delete_mount_target:{}", mount_target.uuid),
                    RemoteCall::Delete {
                        collection: MOUNT_TARGETS,
                        uuid: mount_target.uuid.clone(),
                    },
                    MOUNT_TARGET_POLICY,
                )
                .with_effect(StepEffect::MountTargetDeleted),
            );
        }

        steps
    }

    fn plan_create_mount_target(
        &self,
        instance: &ServiceInstance,
        config: &StorageConfig,
        data: &Value,
    ) -> Result<Vec<StepDescriptor>> {
        if config.mount_target_data.is_some() {
            return Err(OrchestratorError::InvalidStateTransition(
                "share already has a mount target".to_string(),
            ));
        }

        let share_uuid = require_resource(instance)?;
        let request: MountTargetRequest = decode("mount target request", &non_null(data))?;
        let subnet_id = request
            .subnet_id
            .or_else(|| config.anchor.network_id.clone())
            .ok_or_else(|| {
                OrchestratorError::InvalidInput(
                    "mount target needs a subnet_id or an inherited network".to_string(),
                )
            })?;

        let mut body = json!({
            "share_uuid": share_uuid,
            "subnet_id": subnet_id,
        });
        if let Some(ip_address) = &request.ip_address {
            body["ip_address"] = json!(ip_address);
        }

        Ok(vec![StepDescriptor::new(
            "create_mount_target",
            RemoteCall::Create {
                collection: MOUNT_TARGETS,
                body,
            },
            MOUNT_TARGET_POLICY,
        )
        .with_effect(StepEffect::MountTargetCreated {
            subnet_id,
            ip_address: request.ip_address,
        })])
    }

    fn plan_grant(&self, config: &StorageConfig, data: &Value) -> Result<Vec<StepDescriptor>> {
        let operation: GrantOperation = decode("grant operation", data)?;
        let mount_target = self.mount_target(config)?;

        let existing = config
            .grants
            .iter()
            .find(|g| g.access_type == operation.access_type && g.access_to == operation.access_to);

        let step = match operation.action {
            GrantAction::Add => {
                if existing.is_some() {
                    return Err(OrchestratorError::InvalidInput(format!(
                        "{} {} is already granted",
                        operation.access_type.as_str(),
                        operation.access_to
                    )));
                }
                StepDescriptor::new(
                    format!("add_grant:{}", operation.access_to),
                    RemoteCall::Create {
                        collection: SHARE_GRANTS,
                        body: json!({
                            "mount_target_uuid": mount_target.uuid,
                            "access_type": operation.access_type,
                            "access_to": operation.access_to,
                            "access_level": operation.access_level,
                        }),
                    },
                    GRANT_POLICY,
                )
                .with_effect(StepEffect::GrantAdded {
                    access_type: operation.access_type,
                    access_to: operation.access_to.clone(),
                    access_level: operation.access_level,
                })
            }
            GrantAction::Remove => {
                let grant = existing.ok_or_else(|| {
                    OrchestratorError::NotFound(format!(
                        "grant {} {}",
                        operation.access_type.as_str(),
                        operation.access_to
                    ))
                })?;
                StepDescriptor::new(
                    format!("delete_grant:{}", grant.uuid),
                    RemoteCall::Delete {
                        collection: SHARE_GRANTS,
                        uuid: grant.uuid.clone(),
                    },
                    GRANT_POLICY,
                )
                .with_effect(StepEffect::GrantRemoved {
                    grant_uuid: grant.uuid.clone(),
                })
            }
        };

        Ok(vec![step])
    }
}

fn non_null(data: &Value) -> Value {
    if data.is_null() {
        json!({})
    } else {
        data.clone()
    }
}

fn created_uuid(output: &StepOutput) -> Result<String> {
    output.created_uuid.clone().ok_or_else(|| {
        OrchestratorError::RemoteCallFailed(format!(
            "step {} did not return a resource uuid",
            output.step_id
        ))
    })
}

impl LifecyclePlugin for StorageEfs {
    fn plugin_type(&self) -> PluginType {
        PluginType::StorageEfs
    }

    fn backend(&self) -> Backend {
        self.backend
    }

    fn collection(&self) -> &'static str {
        SHARES
    }

    fn policies(&self) -> LifecyclePolicies {
        LifecyclePolicies {
            create: SHARE_POLICY,
            update: SHARE_POLICY,
            delete: SHARE_POLICY,
        }
    }

    fn pre_create(&self, name: &str, config: &Value, anchor: &Anchor) -> Result<PreparedCreate> {
        let mut config: StorageConfig = decode("storage config", config)?;

        if config.share_data.size_gb <= 0 || config.share_data.size_gb > MAX_SIZE_GB {
            return Err(OrchestratorError::InvalidInput(format!(
                "size_gb must be between 1 and {MAX_SIZE_GB}, got {}",
                config.share_data.size_gb
            )));
        }
        if config.mount_target_data.is_some() || !config.grants.is_empty() {
            return Err(OrchestratorError::InvalidInput(
                "mount targets and grants are added with actions after the share exists".to_string(),
            ));
        }

        config.share_data.export_location = None;
        config.anchor.inherit(anchor);

        let mut descriptor = json!({
            "name": name,
            "size_gb": config.share_data.size_gb,
            "protocol": config.share_data.protocol,
        });
        if let Some(zone) = &config.anchor.zone {
            descriptor["availability_zone"] = json!(zone);
        }

        let quota = QuotaRequest::new()
            .with(QUOTA_INSTANCES, 1)
            .with(QUOTA_BLOCKS, config.share_data.size_gb);

        Ok(PreparedCreate {
            config: encode(&config)?,
            descriptor,
            quota,
        })
    }

    fn post_create(&self, instance: &ServiceInstance) -> Result<Vec<StepDescriptor>> {
        let share_uuid = require_resource(instance)?;

        Ok(vec![StepDescriptor::new(
            "fetch_share",
            RemoteCall::Fetch {
                collection: SHARES,
                uuid: share_uuid.to_string(),
            },
            SHARE_POLICY,
        )
        .with_effect(StepEffect::DetailsFetched)])
    }

    fn pre_delete(&self, instance: &ServiceInstance) -> Result<()> {
        let config = self.config(instance)?;
        if config.mount_target_data.is_some() {
            return Err(OrchestratorError::InvalidStateTransition(format!(
                "share {} has an active mount target; use delete_share",
                instance.id
            )));
        }
        Ok(())
    }

    fn update_capability(&self, params: &Value) -> Option<Capability> {
        params.get("size_gb").map(|_| Capability::Resize)
    }

    fn prepare_update(&self, instance: &ServiceInstance, params: &Value) -> Result<PreparedUpdate> {
        let update: StorageUpdate = decode("storage update", params)?;
        let mut config = self.config(instance)?;

        let size_gb = update
            .size_gb
            .ok_or_else(|| OrchestratorError::InvalidInput("nothing to update".to_string()))?;
        let current = config.share_data.size_gb;

        if size_gb <= current {
            return Err(OrchestratorError::InvalidInput(format!(
                "shares can only grow: {current} GB -> {size_gb} GB"
            )));
        }
        if size_gb > MAX_SIZE_GB {
            return Err(OrchestratorError::InvalidInput(format!(
                "size_gb must be at most {MAX_SIZE_GB}"
            )));
        }

        config.share_data.size_gb = size_gb;

        Ok(PreparedUpdate {
            config: encode(&config)?,
            descriptor: json!({ "size_gb": size_gb }),
            quota_delta: QuotaRequest::new().with(QUOTA_BLOCKS, size_gb - current),
        })
    }

    fn action_capability(&self, action: &str) -> Result<Option<Capability>> {
        match action {
            "create_mount_target" | "delete_mount_target" | "delete_share" => Ok(None),
            "mount_target_grant" => Ok(Some(Capability::Grant)),
            _ => Err(unknown_action(self.plugin_type(), action)),
        }
    }

    fn plan_action(
        &self,
        instance: &ServiceInstance,
        action: &str,
        data: &Value,
    ) -> Result<ActionSpec> {
        let config = self.config(instance)?;

        let (steps, in_flight, settle) = match action {
            "create_mount_target" => (
                self.plan_create_mount_target(instance, &config, data)?,
                InstanceStatus::Updating,
                Settle::Status(InstanceStatus::Active),
            ),
            "delete_mount_target" => {
                self.mount_target(&config)?;
                (
                    self.mount_target_teardown(&config),
                    InstanceStatus::Updating,
                    Settle::Status(InstanceStatus::Active),
                )
            }
            "mount_target_grant" => (
                self.plan_grant(&config, data)?,
                InstanceStatus::Updating,
                Settle::Status(InstanceStatus::Active),
            ),
            "delete_share" => {
                let mut steps = self.mount_target_teardown(&config);
                if let Some(share_uuid) = &instance.resource_uuid {
                    steps.push(
                        StepDescriptor::new(
                            format!("delete_share:{share_uuid}"),
                            RemoteCall::Delete {
                                collection: SHARES,
                                uuid: share_uuid.clone(),
                            },
                            SHARE_POLICY,
                        )
                        .with_effect(StepEffect::ShareDeleted),
                    );
                }
                (steps, InstanceStatus::Deleting, Settle::Deleted)
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
                    if let Some(location) = output
                        .body
                        .as_ref()
                        .and_then(|body| body.get("export_location"))
                        .and_then(Value::as_str)
                    {
                        config.share_data.export_location = Some(location.to_string());
                    }
                }
                StepEffect::MountTargetCreated {
                    subnet_id,
                    ip_address,
                } => {
                    config.mount_target_data = Some(MountTargetData {
                        uuid: created_uuid(output)?,
                        subnet_id: subnet_id.clone(),
                        ip_address: ip_address.clone(),
                    });
                }
                StepEffect::MountTargetDeleted => config.mount_target_data = None,
                StepEffect::GrantAdded {
                    access_type,
                    access_to,
                    access_level,
                } => config.grants.push(ShareGrant {
                    uuid: created_uuid(output)?,
                    access_type: *access_type,
                    access_to: access_to.clone(),
                    access_level: *access_level,
                }),
                StepEffect::GrantRemoved { grant_uuid } => {
                    config.grants.retain(|grant| &grant.uuid != grant_uuid)
                }
                StepEffect::ShareDeleted => config.share_data.export_location = None,
                _ => {}
            }
        }

        encode(&config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugin::test_support::{instance, output};

    fn plugin() -> StorageEfs {
        StorageEfs::new(Backend::OpenStack)
    }

    fn share_with_mount_target() -> ServiceInstance {
        instance(
            PluginType::StorageEfs,
            Backend::OpenStack,
            json!({
                "share_data": {"size_gb": 100, "protocol": "nfs"},
                "mount_target_data": {"uuid": "mt-1", "subnet_id": "sub-1"},
                "grants": [
                    {"uuid": "g-1", "access_type": "ip", "access_to": "10.0.0.0/24", "access_level": "rw"},
                    {"uuid": "g-2", "access_type": "ip", "access_to": "10.0.1.0/24", "access_level": "ro"}
                ]
            }),
        )
    }

    #[test]
    fn test_pre_create_computes_quota_and_descriptor() {
        let prepared = plugin()
            .pre_create(
                "team-share",
                &json!({"share_data": {"size_gb": 100}}),
                &Anchor {
                    zone: Some("az-1".into()),
                    network_id: None,
                },
            )
            .unwrap();

        assert_eq!(prepared.quota.amount(QUOTA_INSTANCES), 1);
        assert_eq!(prepared.quota.amount(QUOTA_BLOCKS), 100);
        assert_eq!(prepared.descriptor["availability_zone"], "az-1");
        assert_eq!(prepared.descriptor["protocol"], "nfs");
        assert_eq!(prepared.config["zone"], "az-1");
    }

    #[test]
    fn test_pre_create_rejects_bad_size() {
        let err = plugin()
            .pre_create("s", &json!({"share_data": {"size_gb": 0}}), &Anchor::default())
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::InvalidInput(_)));

        let err = plugin()
            .pre_create("s", &json!({"protocol": "nfs"}), &Anchor::default())
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::InvalidInput(_)));
    }

    #[test]
    fn test_delete_share_orders_grants_mount_target_share() {
        let spec = plugin()
            .plan_action(&share_with_mount_target(), "delete_share", &Value::Null)
            .unwrap();

        let ids: Vec<&str> = spec.steps.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(
            ids,
            vec![
                "delete_grant:g-1",
                "delete_grant:g-2",
                "delete_mount_target:mt-1",
                "delete_share:res-7"
            ]
        );
        assert_eq!(spec.in_flight, InstanceStatus::Deleting);
        assert_eq!(spec.settle, Settle::Deleted);
        assert_eq!(spec.steps[3].policy, SHARE_POLICY);
    }

    #[test]
    fn test_pre_delete_refuses_share_with_mount_target() {
        let err = plugin().pre_delete(&share_with_mount_target()).unwrap_err();
        assert!(matches!(err, OrchestratorError::InvalidStateTransition(_)));
    }

    #[test]
    fn test_grant_requires_mount_target() {
        let bare = instance(
            PluginType::StorageEfs,
            Backend::OpenStack,
            json!({"share_data": {"size_gb": 10}}),
        );
        let err = plugin()
            .plan_action(
                &bare,
                "mount_target_grant",
                &json!({"action": "add", "access_type": "ip", "access_to": "10.0.0.1"}),
            )
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::InvalidStateTransition(_)));
    }

    #[test]
    fn test_grant_capability_and_unknown_action() {
        assert_eq!(
            plugin().action_capability("mount_target_grant").unwrap(),
            Some(Capability::Grant)
        );
        assert!(plugin().action_capability("snapshot").is_err());
    }

    #[test]
    fn test_effects_track_mount_target_and_grants() {
        let plugin = plugin();
        let mut record = instance(
            PluginType::StorageEfs,
            Backend::OpenStack,
            json!({"share_data": {"size_gb": 10}, "network_id": "net-1"}),
        );

        let spec = plugin
            .plan_action(&record, "create_mount_target", &Value::Null)
            .unwrap();
        assert_eq!(
            spec.steps[0].call,
            RemoteCall::Create {
                collection: MOUNT_TARGETS,
                body: json!({"share_uuid": "res-7", "subnet_id": "net-1"}),
            }
        );
        record.config = plugin
            .apply_effects(&record, &[output(&spec.steps[0], Some("mt-9"))])
            .unwrap();
        assert_eq!(record.config["mount_target_data"]["uuid"], "mt-9");

        let spec = plugin
            .plan_action(
                &record,
                "mount_target_grant",
                &json!({"action": "add", "access_type": "ip", "access_to": "10.0.0.5"}),
            )
            .unwrap();
        record.config = plugin
            .apply_effects(&record, &[output(&spec.steps[0], Some("g-5"))])
            .unwrap();
        assert_eq!(record.config["grants"][0]["uuid"], "g-5");
        assert_eq!(record.config["grants"][0]["access_level"], "rw");

        let spec = plugin
            .plan_action(&record, "delete_mount_target", &Value::Null)
            .unwrap();
        assert_eq!(spec.steps.len(), 2);
        let outputs: Vec<StepOutput> = spec.steps.iter().map(|s| output(s, None)).collect();
        record.config = plugin.apply_effects(&record, &outputs).unwrap();
        assert!(record.config.get("mount_target_data").is_none());
        assert!(record.config.get("grants").is_none());
    }

    #[test]
    fn test_grant_effect_carries_typed_access() {
        let plugin = plugin();
        let record = share_with_mount_target();

        let spec = plugin
            .plan_action(
                &record,
                "mount_target_grant",
                &json!({"action": "add", "access_type": "user", "access_to": "alice", "access_level": "ro"}),
            )
            .unwrap();
        assert_eq!(
            spec.steps[0].effect,
            StepEffect::GrantAdded {
                access_type: AccessType::User,
                access_to: "alice".to_string(),
                access_level: AccessLevel::Ro,
            }
        );

        let config = plugin
            .apply_effects(&record, &[output(&spec.steps[0], Some("g-3"))])
            .unwrap();
        let added = &config["grants"][2];
        assert_eq!(added["uuid"], "g-3");
        assert_eq!(added["access_type"], "user");
        assert_eq!(added["access_level"], "ro");
    }

    #[test]
    fn test_update_grows_only() {
        let record = instance(
            PluginType::StorageEfs,
            Backend::OpenStack,
            json!({"share_data": {"size_gb": 100}}),
        );

        let prepared = plugin()
            .prepare_update(&record, &json!({"size_gb": 150}))
            .unwrap();
        assert_eq!(prepared.quota_delta.amount(QUOTA_BLOCKS), 50);
        assert_eq!(prepared.config["share_data"]["size_gb"], 150);

        assert!(plugin()
            .prepare_update(&record, &json!({"size_gb": 50}))
            .is_err());
        assert_eq!(
            plugin().update_capability(&json!({"size_gb": 150})),
            Some(Capability::Resize)
        );
    }
}
