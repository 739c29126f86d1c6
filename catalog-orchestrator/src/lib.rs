//! Service-instance lifecycle orchestration
//!
//! Tenants request service instances (compute, shared storage, log pipelines)
//! that are realised by a remote resource-orchestration system behind an
//! admin HTTP API. This crate reserves quota, drives the remote calls, tracks
//! the resulting long-running tasks and keeps each instance's local status
//! consistent with what the remote side reports.

pub mod action;
pub mod capability;
pub mod config;
pub mod context;
pub mod db;
pub mod error;
pub mod gateway;
pub mod operation;
pub mod orchestrator;
pub mod plugin;
pub mod quota;
pub mod record;
pub mod task;

pub use capability::{Backend, Capability, CapabilitySet};
pub use config::OrchestratorConfig;
pub use context::OperationContext;
pub use error::{OrchestratorError, Result};
pub use gateway::{GatewayConfig, HttpResourceGateway, ResourceGateway};
pub use operation::{Operation, OperationStatus, OperationType};
pub use orchestrator::{CreateInstanceRequest, Orchestrator};
pub use plugin::{LifecyclePlugin, ServiceDefinition, ServicePlugin};
pub use quota::{QuotaGuard, QuotaRequest};
pub use record::{InstanceFilters, InstanceStatus, PluginType, ServiceInstance};
pub use task::{RemoteTask, TaskOutcome, TaskPolicy, TaskTracker};
