//! Log pipelines with optional monitoring.

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

pub const LOG_PIPELINES: &str = "log-pipelines";

pub const QUOTA_INSTANCES: &str = "logging.instances";

const MAX_RETENTION_DAYS: u32 = 365;

const PIPELINE_POLICY: TaskPolicy = TaskPolicy::from_secs(3, 300);
const MONITORING_POLICY: TaskPolicy = TaskPolicy::from_secs(2, 120);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub retention_days: u32,
    pub sources: Vec<String>,
    #[serde(default)]
    pub monitoring_enabled: bool,
    #[serde(flatten)]
    pub anchor: Anchor,
}

impl LoggingConfig {
    fn validate(&self) -> Result<()> {
        if !(1..=MAX_RETENTION_DAYS).contains(&self.retention_days) {
            return Err(OrchestratorError::InvalidInput(format!(
                "retention_days must be between 1 and {MAX_RETENTION_DAYS}"
            )));
        }
        if self.sources.is_empty() || self.sources.iter().any(|s| s.trim().is_empty()) {
            return Err(OrchestratorError::InvalidInput(
                "at least one non-empty log source is required".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct LoggingUpdate {
    retention_days: Option<u32>,
    sources: Option<Vec<String>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoggingInstance {
    backend: Backend,
}

impl LoggingInstance {
    pub fn new(backend: Backend) -> Self {
        Self { backend }
    }

    fn config(&self, instance: &ServiceInstance) -> Result<LoggingConfig> {
        decode("logging config", &instance.config)
    }
}

impl LifecyclePlugin for LoggingInstance {
    fn plugin_type(&self) -> PluginType {
        PluginType::LoggingInstance
    }

    fn backend(&self) -> Backend {
        self.backend
    }

    fn collection(&self) -> &'static str {
        LOG_PIPELINES
    }

    fn policies(&self) -> LifecyclePolicies {
        LifecyclePolicies {
            create: PIPELINE_POLICY,
            update: PIPELINE_POLICY,
            delete: PIPELINE_POLICY,
        }
    }

    fn pre_create(&self, name: &str, config: &Value, anchor: &Anchor) -> Result<PreparedCreate> {
        let mut config: LoggingConfig = decode("logging config", config)?;

        if config.monitoring_enabled {
            self.require(Capability::Monitoring)?;
        }
        config.validate()?;
        config.anchor.inherit(anchor);

        let mut descriptor = json!({
            "name": name,
            "retention_days": config.retention_days,
            "sources": config.sources,
            "monitoring": config.monitoring_enabled,
        });
        if let Some(zone) = &config.anchor.zone {
            descriptor["availability_zone"] = json!(zone);
        }

        Ok(PreparedCreate {
            config: encode(&config)?,
            descriptor,
            quota: QuotaRequest::new().with(QUOTA_INSTANCES, 1),
        })
    }

    fn prepare_update(&self, instance: &ServiceInstance, params: &Value) -> Result<PreparedUpdate> {
        let update: LoggingUpdate = decode("logging update", params)?;
        let mut config = self.config(instance)?;

        let mut descriptor = json!({});
        if let Some(retention_days) = update.retention_days {
            config.retention_days = retention_days;
            descriptor["retention_days"] = json!(retention_days);
        }
        if let Some(sources) = update.sources {
            descriptor["sources"] = json!(sources);
            config.sources = sources;
        }
        if descriptor.as_object().is_some_and(|fields| fields.is_empty()) {
            return Err(OrchestratorError::InvalidInput("nothing to update".to_string()));
        }
        config.validate()?;

        Ok(PreparedUpdate {
            config: encode(&config)?,
            descriptor,
            quota_delta: QuotaRequest::new(),
        })
    }

    fn action_capability(&self, action: &str) -> Result<Option<Capability>> {
        match action {
            "enable_monitoring" | "disable_monitoring" => Ok(Some(Capability::Monitoring)),
            _ => Err(unknown_action(self.plugin_type(), action)),
        }
    }

    fn plan_action(
        &self,
        instance: &ServiceInstance,
        action: &str,
        data: &Value,
    ) -> Result<ActionSpec> {
        let enabled = match action {
            "enable_monitoring" => true,
            "disable_monitoring" => false,
            _ => return Err(unknown_action(self.plugin_type(), action)),
        };

        let config = self.config(instance)?;
        if config.monitoring_enabled == enabled {
            return Err(OrchestratorError::InvalidStateTransition(format!(
                "monitoring is already {}",
                if enabled { "enabled" } else { "disabled" }
            )));
        }

        let pipeline_uuid = require_resource(instance)?;

        Ok(ActionSpec {
            name: action.to_string(),
            data: data.clone(),
            steps: vec![StepDescriptor::new(
                action,
                RemoteCall::Update {
                    collection: LOG_PIPELINES,
                    uuid: pipeline_uuid.to_string(),
                    body: json!({ "monitoring": enabled }),
                },
                MONITORING_POLICY,
            )
            .with_effect(StepEffect::MonitoringSet { enabled })],
            in_flight: InstanceStatus::Updating,
            settle: Settle::Status(InstanceStatus::Active),
        })
    }

    fn apply_effects(&self, instance: &ServiceInstance, outputs: &[StepOutput]) -> Result<Value> {
        let mut config = self.config(instance)?;

        for output in outputs {
            if let StepEffect::MonitoringSet { enabled } = output.effect {
                config.monitoring_enabled = enabled;
            }
        }

        encode(&config)
    }
}
