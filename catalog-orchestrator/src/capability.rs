//! Backend types and the optional features they support.

use crate::error::{OrchestratorError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Capability {
    Resize,
    Grant,
    Monitoring,
}

impl Capability {
    pub fn as_str(&self) -> &'static str {
        match self {
            Capability::Resize => "resize",
            Capability::Grant => "grant",
            Capability::Monitoring => "monitoring",
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The orchestrator type behind a service definition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum Backend {
    OpenStack,
    Ontap,
    Kvm,
    OpenSearch,
}

impl Backend {
    pub fn as_str(&self) -> &'static str {
        match self {
            Backend::OpenStack => "openstack",
            Backend::Ontap => "ontap",
            Backend::Kvm => "kvm",
            Backend::OpenSearch => "opensearch",
        }
    }

    pub fn capabilities(&self) -> CapabilitySet {
        let caps: &[Capability] = match self {
            Backend::OpenStack => &[Capability::Resize, Capability::Grant],
            Backend::Ontap => &[],
            Backend::Kvm => &[Capability::Resize],
            Backend::OpenSearch => &[Capability::Monitoring],
        };
        CapabilitySet(caps.iter().copied().collect())
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Backend {
    type Err = OrchestratorError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "openstack" => Ok(Backend::OpenStack),
            "ontap" => Ok(Backend::Ontap),
            "kvm" => Ok(Backend::Kvm),
            "opensearch" => Ok(Backend::OpenSearch),
            other => Err(OrchestratorError::InvalidInput(format!(
                "unknown backend '{other}'"
            ))),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CapabilitySet(BTreeSet<Capability>);

impl CapabilitySet {
    pub fn contains(&self, capability: Capability) -> bool {
        self.0.contains(&capability)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = Capability> + '_ {
        self.0.iter().copied()
    }
}

/// Local, network-free gate evaluated before any gated remote call.
pub fn require(backend: Backend, capability: Capability) -> Result<()> {
    if backend.capabilities().contains(capability) {
        Ok(())
    } else {
        Err(OrchestratorError::CapabilityUnavailable {
            capability,
            backend,
        })
    }
}
