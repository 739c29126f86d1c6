//! Per-service-type lifecycle plugins.
//!
//! A plugin never talks to the remote API or the database itself. It validates
//! and decodes config, computes quota requests and resource descriptors, and
//! plans action pipelines; the [`Orchestrator`](crate::Orchestrator) runs the
//! shared control flow around those hooks.

pub mod compute;
pub mod logging;
pub mod storage;

use crate::action::{ActionSpec, StepDescriptor, StepOutput};
use crate::capability::{self, Backend, Capability, CapabilitySet};
use crate::error::{OrchestratorError, Result};
use crate::quota::QuotaRequest;
use crate::record::{PluginType, ServiceInstance};
use crate::task::TaskPolicy;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub use compute::ComputeInstance;
pub use logging::LoggingInstance;
pub use storage::StorageEfs;

/// A catalog entry tenants instantiate: which plugin runs it on which backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceDefinition {
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub plugin_type: PluginType,
    pub backend: Backend,
}

/// Placement identity inherited down the parent chain.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Anchor {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub zone: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network_id: Option<String>,
}

impl Anchor {
    /// Read the anchor fields out of any record's config.
    pub fn from_config(config: &Value) -> Self {
        serde_json::from_value(config.clone()).unwrap_or_default()
    }

    /// Fill fields still unset from a more distant ancestor.
    pub fn inherit(&mut self, ancestor: &Anchor) {
        if self.zone.is_none() {
            self.zone = ancestor.zone.clone();
        }
        if self.network_id.is_none() {
            self.network_id = ancestor.network_id.clone();
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LifecyclePolicies {
    pub create: TaskPolicy,
    pub update: TaskPolicy,
    pub delete: TaskPolicy,
}

/// Output of `pre_create`: everything needed before the first remote call.
#[derive(Debug, Clone, PartialEq)]
pub struct PreparedCreate {
    /// Normalised typed config, re-encoded for storage.
    pub config: Value,
    pub descriptor: Value,
    pub quota: QuotaRequest,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PreparedUpdate {
    pub config: Value,
    pub descriptor: Value,
    /// Signed change of the instance's quota footprint.
    pub quota_delta: QuotaRequest,
}

/// Hooks every plugin type implements.
pub trait LifecyclePlugin: Send + Sync {
    fn plugin_type(&self) -> PluginType;

    fn backend(&self) -> Backend;

    /// Remote collection holding the instance's primary resource.
    fn collection(&self) -> &'static str;

    fn policies(&self) -> LifecyclePolicies;

    fn available_capabilities(&self) -> CapabilitySet {
        self.backend().capabilities()
    }

    fn require(&self, capability: Capability) -> Result<()> {
        capability::require(self.backend(), capability)
    }

    /// Validate config and compute the descriptor and quota request. Must not
    /// have side effects; it runs before any row or remote resource exists.
    fn pre_create(&self, name: &str, config: &Value, anchor: &Anchor) -> Result<PreparedCreate>;

    /// Finalisation steps run once the instance is active.
    fn post_create(&self, _instance: &ServiceInstance) -> Result<Vec<StepDescriptor>> {
        Ok(Vec::new())
    }

    fn pre_delete(&self, _instance: &ServiceInstance) -> Result<()> {
        Ok(())
    }

    fn update_capability(&self, _params: &Value) -> Option<Capability> {
        None
    }

    fn prepare_update(&self, instance: &ServiceInstance, params: &Value) -> Result<PreparedUpdate>;

    /// Capability gating `action`, or `InvalidInput` for an unknown action.
    fn action_capability(&self, action: &str) -> Result<Option<Capability>>;

    fn plan_action(&self, instance: &ServiceInstance, action: &str, data: &Value)
        -> Result<ActionSpec>;

    /// Fold completed step outputs into the instance config.
    fn apply_effects(&self, instance: &ServiceInstance, outputs: &[StepOutput]) -> Result<Value>;
}

/// The closed set of plugin variants, selected by the record's plugin type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServicePlugin {
    Compute(ComputeInstance),
    Storage(StorageEfs),
    Logging(LoggingInstance),
}

impl ServicePlugin {
    pub fn new(plugin_type: PluginType, backend: Backend) -> Self {
        match plugin_type {
            PluginType::ComputeInstance => ServicePlugin::Compute(ComputeInstance::new(backend)),
            PluginType::StorageEfs => ServicePlugin::Storage(StorageEfs::new(backend)),
            PluginType::LoggingInstance => ServicePlugin::Logging(LoggingInstance::new(backend)),
        }
    }

    pub fn for_definition(definition: &ServiceDefinition) -> Self {
        Self::new(definition.plugin_type, definition.backend)
    }

    /// The plugin that owns an existing record, chosen by its stored type tag.
    pub fn for_instance(instance: &ServiceInstance) -> Self {
        Self::new(instance.plugin_type, instance.backend)
    }

    pub fn hooks(&self) -> &(dyn LifecyclePlugin + 'static) {
        match self {
            ServicePlugin::Compute(plugin) => plugin,
            ServicePlugin::Storage(plugin) => plugin,
            ServicePlugin::Logging(plugin) => plugin,
        }
    }
}

impl std::ops::Deref for ServicePlugin {
    type Target = dyn LifecyclePlugin;

    fn deref(&self) -> &Self::Target {
        self.hooks()
    }
}

/// Decode a JSON document into a plugin's typed config.
pub(crate) fn decode<T: DeserializeOwned>(what: &str, value: &Value) -> Result<T> {
    serde_json::from_value(value.clone())
        .map_err(|e| OrchestratorError::InvalidInput(format!("invalid {what}: {e}")))
}

pub(crate) fn encode<T: Serialize>(value: &T) -> Result<Value> {
    Ok(serde_json::to_value(value)?)
}

pub(crate) fn require_resource(instance: &ServiceInstance) -> Result<&str> {
    instance.resource_uuid.as_deref().ok_or_else(|| {
        OrchestratorError::InvalidStateTransition(format!(
            "service instance {} has no remote resource",
            instance.id
        ))
    })
}

pub(crate) fn unknown_action(plugin: PluginType, action: &str) -> OrchestratorError {
    OrchestratorError::InvalidInput(format!(
        "unknown action '{action}' for {}",
        plugin.as_str()
    ))
}


#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_anchor_inherits_only_missing_fields() {
        let mut anchor = Anchor::from_config(&json!({"zone": "az-2", "size_gb": 10}));
        anchor.inherit(&Anchor {
            zone: Some("az-1".into()),
            network_id: Some("net-1".into()),
        });

        assert_eq!(anchor.zone.as_deref(), Some("az-2"));
        assert_eq!(anchor.network_id.as_deref(), Some("net-1"));
    }

    #[test]
    fn test_definition_selects_variant() {
        let plugin = ServicePlugin::for_definition(&ServiceDefinition {
            id: "efs-ontap".into(),
            name: "Shared storage".into(),
            plugin_type: PluginType::StorageEfs,
            backend: Backend::Ontap,
        });

        assert!(matches!(plugin, ServicePlugin::Storage(_)));
        assert_eq!(plugin.plugin_type(), PluginType::StorageEfs);
        assert!(plugin.available_capabilities().is_empty());
    }
}
