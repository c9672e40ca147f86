//! Core abstractions for the step orchestration engine
//!
//! This crate provides the data model (workflow definitions, executions,
//! events), the [`Action`] contract every step implementation satisfies,
//! the error taxonomy and message sanitization. Scheduling lives in
//! `stepruntime`.

mod action;
mod error;
pub mod events;
mod execution;
pub mod sanitize;
mod validation;
mod workflow;

pub use action::{require_str, Action, ActionContext, ActionOutput};
pub use error::{ActionError, FlowError, NotFoundError};
pub use events::*;
pub use execution::{
    Execution, ExecutionFailure, ExecutionId, ExecutionStatus, ExecutionSummary, StepRun,
    StepStatus,
};
pub use sanitize::sanitize;
pub use validation::{IssueKind, ValidationIssue, ValidationReport};
pub use workflow::{
    StepConfig, StepDefinition, StepId, TriggerKind, WorkflowConfig, WorkflowDefinition,
    WorkflowId,
};

/// Result type for engine operations
pub type Result<T> = std::result::Result<T, FlowError>;
