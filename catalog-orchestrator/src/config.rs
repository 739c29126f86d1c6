use crate::gateway::GatewayConfig;
use crate::plugin::ServiceDefinition;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Everything the orchestrator needs besides a database pool.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    #[serde(default)]
    pub gateway: GatewayConfig,

    /// Limit applied the first time an account touches a quota name. Names
    /// missing here start out unlimited.
    #[serde(default)]
    pub quota_defaults: BTreeMap<String, i64>,

    /// Service definitions registered at startup.
    #[serde(default)]
    pub definitions: Vec<ServiceDefinition>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::Backend;
    use crate::record::PluginType;

    #[test]
    fn test_deserialize_partial_config() {
        let config: OrchestratorConfig = serde_json::from_value(serde_json::json!({
            "quota_defaults": {"share.blocks": 500},
            "definitions": [
                {"id": "efs", "plugin_type": "storage_efs", "backend": "ontap"}
            ]
        }))
        .unwrap();

        assert_eq!(config.quota_defaults.get("share.blocks"), Some(&500));
        assert_eq!(config.definitions[0].plugin_type, PluginType::StorageEfs);
        assert_eq!(config.definitions[0].backend, Backend::Ontap);
        assert!(config.gateway.request_timeout_secs > 0);
    }
}
