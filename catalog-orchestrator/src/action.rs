//! Named multi-step actions and the executor that runs their remote steps.
//!
//! A plugin plans an [`ActionSpec`]; the [`ActionRouter`] runs its steps one at
//! a time, in order, waiting on every task a step hands back. The first failing
//! step stops the pipeline. Steps that already completed are not rolled back.

use crate::context::OperationContext;
use crate::error::{OrchestratorError, Result};
use crate::gateway::ResourceGateway;
use crate::plugin::compute::RuleType;
use crate::plugin::storage::{AccessLevel, AccessType};
use crate::record::{InstanceStatus, InstanceStore};
use crate::task::{RemoteTask, TaskPolicy, TaskTracker};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// One call against the remote admin API.
#[derive(Debug, Clone, PartialEq)]
pub enum RemoteCall {
    Create {
        collection: &'static str,
        body: Value,
    },
    Fetch {
        collection: &'static str,
        uuid: String,
    },
    Update {
        collection: &'static str,
        uuid: String,
        body: Value,
    },
    Delete {
        collection: &'static str,
        uuid: String,
    },
}

/// What a completed step changes in the owning record's config.
#[derive(Debug, Clone, PartialEq)]
pub enum StepEffect {
    None,
    DetailsFetched,
    MountTargetCreated {
        subnet_id: String,
        ip_address: Option<String>,
    },
    MountTargetDeleted,
    GrantAdded {
        access_type: AccessType,
        access_to: String,
        access_level: AccessLevel,
    },
    GrantRemoved {
        grant_uuid: String,
    },
    ShareDeleted,
    ServerRuleAdded {
        access_type: RuleType,
        access_to: String,
    },
    ServerRuleRemoved {
        rule_uuid: String,
    },
    MonitoringSet {
        enabled: bool,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct StepDescriptor {
    /// Stable identity used in logs and in `StepFailed`, e.g. `delete_grant:<uuid>`.
    pub id: String,
    pub call: RemoteCall,
    /// Bounds the wait on a task the call returns; every such task is
    /// awaited before the next step runs.
    pub policy: TaskPolicy,
    pub effect: StepEffect,
}

impl StepDescriptor {
    pub fn new(id: impl Into<String>, call: RemoteCall, policy: TaskPolicy) -> Self {
        Self {
            id: id.into(),
            call,
            policy,
            effect: StepEffect::None,
        }
    }

    pub fn with_effect(mut self, effect: StepEffect) -> Self {
        self.effect = effect;
        self
    }

    /// Whether the call may hand back a task id to wait on. Reads never do.
    pub fn awaits_task(&self) -> bool {
        !matches!(self.call, RemoteCall::Fetch { .. })
    }
}

/// Where the record ends up once every step succeeded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settle {
    Status(InstanceStatus),
    Deleted,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ActionSpec {
    pub name: String,
    pub data: Value,
    pub steps: Vec<StepDescriptor>,
    /// Status held while the steps run.
    pub in_flight: InstanceStatus,
    pub settle: Settle,
}

#[derive(Debug, Clone)]
pub struct StepOutput {
    pub step_id: String,
    pub effect: StepEffect,
    pub created_uuid: Option<String>,
    pub body: Option<Value>,
    pub task: Option<RemoteTask>,
}

#[derive(Debug)]
pub struct ActionReport {
    pub completed: Vec<StepOutput>,
    /// `StepFailed` naming the first step that did not complete.
    pub failure: Option<OrchestratorError>,
}

impl ActionReport {
    pub fn last_task(&self) -> Option<RemoteTask> {
        self.completed.iter().rev().find_map(|step| step.task.clone())
    }
}

#[derive(Clone)]
pub struct ActionRouter {
    gateway: Arc<dyn ResourceGateway>,
    tracker: TaskTracker,
    store: InstanceStore,
    policy_override: Option<TaskPolicy>,
}

impl ActionRouter {
    pub fn new(gateway: Arc<dyn ResourceGateway>, store: InstanceStore) -> Self {
        Self {
            tracker: TaskTracker::new(gateway.clone()),
            gateway,
            store,
            policy_override: None,
        }
    }

    /// Use `policy` for every wait instead of the one each step declares.
    pub fn with_policy_override(mut self, policy: TaskPolicy) -> Self {
        self.policy_override = Some(policy);
        self
    }

    /// Run `steps` strictly in order against the instance's remote resources.
    #[instrument(skip(self, ctx, steps), fields(request_id = %ctx.request_id, steps = steps.len()))]
    pub async fn execute(
        &self,
        ctx: &OperationContext,
        instance_id: i64,
        steps: &[StepDescriptor],
    ) -> ActionReport {
        let mut completed = Vec::with_capacity(steps.len());

        for step in steps {
            match self.run_step(ctx, instance_id, step).await {
                Ok(output) => {
                    info!(step = %step.id, "Step completed");
                    completed.push(output);
                }
                Err(e) => {
                    warn!(step = %step.id, "Step failed, skipping remaining steps: {}", e);
                    return ActionReport {
                        completed,
                        failure: Some(OrchestratorError::StepFailed {
                            step: step.id.clone(),
                            source: Box::new(e),
                        }),
                    };
                }
            }
        }

        ActionReport {
            completed,
            failure: None,
        }
    }

    async fn run_step(
        &self,
        ctx: &OperationContext,
        instance_id: i64,
        step: &StepDescriptor,
    ) -> Result<StepOutput> {
        debug!(step = %step.id, awaits_task = step.awaits_task(), "Running step");

        let mut created_uuid = None;
        let mut body = None;

        let task_id = match &step.call {
            RemoteCall::Create { collection, body: descriptor } => {
                let created = self.gateway.create(ctx, collection, descriptor).await?;
                created_uuid = Some(created.uuid);
                created.task_id
            }
            RemoteCall::Fetch { collection, uuid } => {
                let fetched = self.gateway.get(ctx, collection, uuid).await?.ok_or_else(|| {
                    OrchestratorError::RemoteCallFailed(format!("{collection}/{uuid} not found"))
                })?;
                body = Some(fetched);
                None
            }
            RemoteCall::Update {
                collection,
                uuid,
                body: descriptor,
            } => self.gateway.update(ctx, collection, uuid, descriptor).await?.task_id,
            RemoteCall::Delete { collection, uuid } => {
                self.gateway.delete(ctx, collection, uuid).await?.task_id
            }
        };

        let task = match task_id {
            Some(task_id) => Some(self.await_task(ctx, instance_id, task_id, step.policy).await?),
            None => None,
        };

        Ok(StepOutput {
            step_id: step.id.clone(),
            effect: step.effect.clone(),
            created_uuid,
            body,
            task,
        })
    }

    /// Record `task_id` as the instance's active task and wait for it.
    ///
    /// On failure or timeout `active_task` is left in place as the durable
    /// trace of what was in flight.
    pub async fn await_task(
        &self,
        ctx: &OperationContext,
        instance_id: i64,
        task_id: String,
        policy: TaskPolicy,
    ) -> Result<RemoteTask> {
        let task = RemoteTask {
            task_id,
            instance_id,
            policy: self.policy_override.unwrap_or(policy),
        };

        self.store
            .set_active_task(instance_id, Some(&task.task_id))
            .await?;

        self.tracker
            .wait(ctx, &task)
            .await
            .into_result(&task.task_id)?;

        self.store.set_active_task(instance_id, None).await?;

        Ok(task)
    }
}
