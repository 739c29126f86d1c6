use crate::capability::{Backend, Capability};
use std::time::Duration;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, OrchestratorError>;

#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error(
        "Quota exceeded for account {account_id}: {quota} requested {requested}, \
         {allocated} of {limit} already allocated"
    )]
    QuotaExceeded {
        account_id: String,
        quota: String,
        requested: i64,
        allocated: i64,
        limit: i64,
    },

    #[error("Capability '{capability}' is not available on backend '{backend}'")]
    CapabilityUnavailable {
        capability: Capability,
        backend: Backend,
    },

    #[error("Invalid state transition: {0}")]
    InvalidStateTransition(String),

    #[error("Remote call failed: {0}")]
    RemoteCallFailed(String),

    #[error("Remote task {task_id} failed: {message}")]
    TaskFailed { task_id: String, message: String },

    #[error("Remote task {task_id} did not finish within {waited:?}")]
    TaskTimeout { task_id: String, waited: Duration },

    #[error("Step '{step}' failed: {source}")]
    StepFailed {
        step: String,
        #[source]
        source: Box<OrchestratorError>,
    },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl OrchestratorError {
    /// Errors raised before any remote call was issued. The record they
    /// concern is left exactly as it was.
    pub fn is_precondition(&self) -> bool {
        matches!(
            self,
            OrchestratorError::QuotaExceeded { .. }
                | OrchestratorError::CapabilityUnavailable { .. }
                | OrchestratorError::InvalidStateTransition(_)
                | OrchestratorError::InvalidInput(_)
                | OrchestratorError::NotFound(_)
        )
    }

    /// Identity of the failed action step, if this error came out of a pipeline.
    pub fn failed_step(&self) -> Option<&str> {
        match self {
            OrchestratorError::StepFailed { step, .. } => Some(step),
            _ => None,
        }
    }
}
