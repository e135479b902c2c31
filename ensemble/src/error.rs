//! Orchestrator error types

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors that can occur while planning or driving cluster operations
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum OrchestratorError {
    /// Malformed or unsafe topology delta (negative count, duplicate role, bad blob)
    #[error("Configuration rejected: {0}")]
    ConfigRejected(String),

    /// Target instance already owned by another in-flight operation
    #[error("Conflicting operation: {instance} is owned by plan {owner}")]
    ConflictingOperation { instance: String, owner: String },

    #[error("External call timed out: {0}")]
    ExternalTimeout(String),

    #[error("External failure: {0}")]
    ExternalFailure(String),

    /// A mode transition sub-step failed; completed sub-steps are not rolled back
    #[error("Sequence '{sequence}' aborted at step {step} ({step_name}): {reason}")]
    SequenceAborted {
        sequence: String,
        step: usize,
        step_name: String,
        completed: Vec<String>,
        reason: String,
    },

    #[error("Plan not found: {0}")]
    PlanNotFound(String),

    #[error("Instance not found: {0}")]
    InstanceNotFound(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl OrchestratorError {
    /// Get the error type as a string for metrics labeling
    pub fn error_type(&self) -> &'static str {
        match self {
            OrchestratorError::ConfigRejected(_) => "config_rejected",
            OrchestratorError::ConflictingOperation { .. } => "conflicting_operation",
            OrchestratorError::ExternalTimeout(_) => "external_timeout",
            OrchestratorError::ExternalFailure(_) => "external_failure",
            OrchestratorError::SequenceAborted { .. } => "sequence_aborted",
            OrchestratorError::PlanNotFound(_) => "plan_not_found",
            OrchestratorError::InstanceNotFound(_) => "instance_not_found",
            OrchestratorError::Config(_) => "config",
            OrchestratorError::Internal(_) => "internal",
        }
    }

    /// Whether the engine may retry the failed call on its own
    pub fn is_timeout(&self) -> bool {
        matches!(self, OrchestratorError::ExternalTimeout(_))
    }
}

impl From<std::io::Error> for OrchestratorError {
    fn from(err: std::io::Error) -> Self {
        OrchestratorError::Config(err.to_string())
    }
}

impl From<serde_yaml::Error> for OrchestratorError {
    fn from(err: serde_yaml::Error) -> Self {
        OrchestratorError::ConfigRejected(err.to_string())
    }
}

impl From<toml::de::Error> for OrchestratorError {
    fn from(err: toml::de::Error) -> Self {
        OrchestratorError::Config(err.to_string())
    }
}

impl From<serde_json::Error> for OrchestratorError {
    fn from(err: serde_json::Error) -> Self {
        OrchestratorError::Internal(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, OrchestratorError>;
