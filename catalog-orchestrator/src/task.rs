//! Polling of remote long-running tasks.

use crate::context::OperationContext;
use crate::error::{OrchestratorError, Result};
use crate::gateway::{ResourceGateway, TaskState};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

/// How often to poll a task and how long to wait for it in total.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TaskPolicy {
    pub interval: Duration,
    pub max_wait: Duration,
}

impl TaskPolicy {
    pub const fn from_secs(interval_secs: u64, max_wait_secs: u64) -> Self {
        Self {
            interval: Duration::from_secs(interval_secs),
            max_wait: Duration::from_secs(max_wait_secs),
        }
    }

    pub const fn from_millis(interval_ms: u64, max_wait_ms: u64) -> Self {
        Self {
            interval: Duration::from_millis(interval_ms),
            max_wait: Duration::from_millis(max_wait_ms),
        }
    }
}

/// Handle to asynchronous work on the remote side.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RemoteTask {
    pub task_id: String,
    pub instance_id: i64,
    pub policy: TaskPolicy,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    Success,
    /// Terminal failure, carrying the remote error message verbatim.
    Failed(String),
    Timeout { waited: Duration },
}

impl TaskOutcome {
    pub fn into_result(self, task_id: &str) -> Result<()> {
        match self {
            TaskOutcome::Success => Ok(()),
            TaskOutcome::Failed(message) => Err(OrchestratorError::TaskFailed {
                task_id: task_id.to_string(),
                message,
            }),
            TaskOutcome::Timeout { waited } => Err(OrchestratorError::TaskTimeout {
                task_id: task_id.to_string(),
                waited,
            }),
        }
    }
}

#[derive(Clone)]
pub struct TaskTracker {
    gateway: Arc<dyn ResourceGateway>,
}

impl TaskTracker {
    pub fn new(gateway: Arc<dyn ResourceGateway>) -> Self {
        Self { gateway }
    }

    /// Poll `task` until the remote side reports a terminal state or
    /// `max_wait` elapses.
    ///
    /// Only the status endpoint is ever retried here; a poll that errors is
    /// logged and the next tick tries again. Dropping the returned future
    /// abandons the wait without touching the remote task.
    #[instrument(
        skip(self, ctx, task),
        fields(request_id = %ctx.request_id, task_id = %task.task_id, instance_id = task.instance_id)
    )]
    pub async fn wait(&self, ctx: &OperationContext, task: &RemoteTask) -> TaskOutcome {
        let started = Instant::now();
        let mut polls = 0u32;

        let poll_until_terminal = async {
            loop {
                polls += 1;
                match self.gateway.task_status(ctx, &task.task_id).await {
                    Ok(status) => match status.status {
                        TaskState::Success => return TaskOutcome::Success,
                        TaskState::Failed => {
                            return TaskOutcome::Failed(status.error.unwrap_or_else(|| {
                                "remote task failed without an error message".to_string()
                            }))
                        }
                        TaskState::Running => debug!(polls, "Task still running"),
                    },
                    Err(e) => warn!(polls, "Polling task failed, will retry: {}", e),
                }

                tokio::time::sleep(task.policy.interval).await;
            }
        };

        let outcome = match tokio::time::timeout(task.policy.max_wait, poll_until_terminal).await {
            Ok(outcome) => outcome,
            Err(_) => TaskOutcome::Timeout {
                waited: started.elapsed(),
            },
        };

        info!(polls, outcome = ?outcome, "Finished waiting on task");
        outcome
    }
}
