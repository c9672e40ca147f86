use crate::{ExecutionId, ValidationReport};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum FlowError {
    #[error(transparent)]
    NotFound(#[from] NotFoundError),

    #[error("Validation failed: {0}")]
    Validation(ValidationReport),

    #[error("Workflow already exists: {0}")]
    Duplicate(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Action error: {0}")]
    Action(#[from] ActionError),

    #[error("Timed out after {seconds}s")]
    Timeout { seconds: u64 },

    #[error("Execution error: {0}")]
    Execution(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl FlowError {
    /// Stable machine-readable name, used in API error bodies.
    pub fn kind(&self) -> &'static str {
        match self {
            FlowError::NotFound(_) => "not_found",
            FlowError::Validation(_) => "validation_error",
            FlowError::Duplicate(_) => "duplicate",
            FlowError::Conflict(_) => "conflict",
            FlowError::Action(_) => "action_error",
            FlowError::Timeout { .. } => "timeout",
            FlowError::Execution(_) => "execution_error",
            FlowError::Config(_) => "config_error",
            FlowError::Serialization(_) => "serialization_error",
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NotFoundError {
    #[error("Workflow not found: {0}")]
    Workflow(String),

    #[error("Execution not found: {0}")]
    Execution(ExecutionId),

    #[error("Step not found: {0}")]
    Step(String),
}

/// Failure reported by a single step's action.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ActionError {
    #[error("Missing required config: {0}")]
    MissingConfig(String),

    #[error("Invalid config for '{field}': {reason}")]
    InvalidConfig { field: String, reason: String },

    #[error("Action failed: {0}")]
    Failed(String),

    #[error("Timeout after {seconds}s")]
    Timeout { seconds: u64 },

    #[error("Cancelled")]
    Cancelled,

    #[error("Unknown action type: {0}")]
    UnknownAction(String),
}

impl ActionError {
    pub fn failed(message: impl Into<String>) -> Self {
        ActionError::Failed(message.into())
    }

    /// Configuration problems and cancellation never improve on a second attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ActionError::Failed(_) | ActionError::Timeout { .. })
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ActionError::MissingConfig(_) => "missing_config",
            ActionError::InvalidConfig { .. } => "invalid_config",
            ActionError::Failed(_) => "action_error",
            ActionError::Timeout { .. } => "timeout",
            ActionError::Cancelled => "cancelled",
            ActionError::UnknownAction(_) => "unknown_action",
        }
    }
}
