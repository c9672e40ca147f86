//! Workflow execution runtime
//!
//! This crate provides the engine around the `stepcore` data model: the
//! action registry, the graph validator, level planning, the scheduler that
//! drives executions, the metrics and history store, and the supervisor
//! that ties them together behind one façade.

mod config;
mod graph;
mod handle;
mod metrics;
mod plan;
mod registry;
mod scheduler;
mod store;
mod supervisor;
mod validator;

pub use config::{ConfigError, EngineConfig, ValidationLimits};
pub use handle::ExecutionHandle;
pub use metrics::{MetricsSnapshot, MetricsStore, StepTypeMetrics};
pub use plan::ExecutionPlan;
pub use registry::{ActionMetadata, ActionRegistry};
pub use scheduler::StepScheduler;
pub use store::{MemoryWorkflowStore, StoredWorkflow, WorkflowStore};
pub use supervisor::{EngineMetrics, ExecutionSupervisor};
pub use validator::WorkflowValidator;
