use crate::{StepId, WorkflowDefinition, WorkflowId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

pub type ExecutionId = Uuid;

/// `queued -> running -> {completed | failed | timeout | cancelled}`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Queued,
    Running,
    Completed,
    Failed,
    Timeout,
    Cancelled,
}

impl ExecutionStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, ExecutionStatus::Queued | ExecutionStatus::Running)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ExecutionStatus::Queued => "queued",
            ExecutionStatus::Running => "running",
            ExecutionStatus::Completed => "completed",
            ExecutionStatus::Failed => "failed",
            ExecutionStatus::Timeout => "timeout",
            ExecutionStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// `pending -> running -> {completed | failed | skipped}`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

impl StepStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            StepStatus::Completed | StepStatus::Failed | StepStatus::Skipped
        )
    }

    /// A predecessor in this state prevents ordinary dependents from running.
    pub fn blocks_dependents(self) -> bool {
        matches!(self, StepStatus::Failed | StepStatus::Skipped)
    }
}

/// Per-step progress inside an execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepRun {
    pub status: StepStatus,
    pub step_type: String,
    pub attempts: u32,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl StepRun {
    pub fn pending(step_type: impl Into<String>) -> Self {
        Self {
            status: StepStatus::Pending,
            step_type: step_type.into(),
            attempts: 0,
            started_at: None,
            completed_at: None,
            duration_ms: None,
            output: None,
            error: None,
        }
    }
}

/// Why an execution did not complete.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionFailure {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_id: Option<StepId>,
    pub error_type: String,
    pub message: String,
}

/// One run of a workflow. Holds a snapshot of the definition it ran, so
/// later edits or deletion of the workflow do not affect it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Execution {
    pub id: ExecutionId,
    pub workflow_id: WorkflowId,
    pub status: ExecutionStatus,
    /// Submission time.
    pub started_at: DateTime<Utc>,
    /// When the execution left the queue and began running steps.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dispatched_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub steps: BTreeMap<StepId, StepRun>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ExecutionFailure>,
    pub retry_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_execution_id: Option<ExecutionId>,
    pub context: Value,
    pub parameters: Map<String, Value>,
    pub definition: Arc<WorkflowDefinition>,
}

impl Execution {
    pub fn new(definition: Arc<WorkflowDefinition>, context: Value, parameters: Map<String, Value>) -> Self {
        let steps = definition
            .steps
            .iter()
            .map(|s| (s.id.clone(), StepRun::pending(s.step_type.clone())))
            .collect();

        Self {
            id: Uuid::new_v4(),
            workflow_id: definition.name.clone(),
            status: ExecutionStatus::Queued,
            started_at: Utc::now(),
            dispatched_at: None,
            completed_at: None,
            steps,
            result: None,
            error: None,
            retry_count: 0,
            parent_execution_id: None,
            context,
            parameters,
            definition,
        }
    }

    /// A fresh execution of the same snapshot, linked to `self` as its parent.
    pub fn retry_of(parent: &Execution) -> Self {
        let mut exec = Execution::new(
            parent.definition.clone(),
            parent.context.clone(),
            parent.parameters.clone(),
        );
        exec.retry_count = parent.retry_count + 1;
        exec.parent_execution_id = Some(parent.id);
        exec
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn step(&self, id: &str) -> Option<&StepRun> {
        self.steps.get(id)
    }

    pub fn step_status(&self, id: &str) -> Option<StepStatus> {
        self.steps.get(id).map(|s| s.status)
    }

    pub fn mark_running(&mut self) {
        self.status = ExecutionStatus::Running;
        self.dispatched_at = Some(Utc::now());
    }

    /// Moves to a terminal state. `completed_at` never precedes `started_at`.
    pub fn finish(&mut self, status: ExecutionStatus, error: Option<ExecutionFailure>) {
        debug_assert!(status.is_terminal());
        let now = Utc::now();
        self.status = status;
        self.completed_at = Some(now.max(self.started_at));
        self.error = error;
    }

    pub fn duration_ms(&self) -> Option<u64> {
        let end = self.completed_at?;
        Some((end - self.started_at).num_milliseconds().max(0) as u64)
    }

    pub fn summary(&self) -> ExecutionSummary {
        ExecutionSummary {
            id: self.id,
            workflow_id: self.workflow_id.clone(),
            status: self.status,
            started_at: self.started_at,
            completed_at: self.completed_at,
            duration_ms: self.duration_ms(),
            retry_count: self.retry_count,
            parent_execution_id: self.parent_execution_id,
            error: self.error.clone(),
        }
    }
}

/// Compact view used by history listings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionSummary {
    pub id: ExecutionId,
    pub workflow_id: WorkflowId,
    pub status: ExecutionStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<u64>,
    pub retry_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_execution_id: Option<ExecutionId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ExecutionFailure>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::StepDefinition;

    fn snapshot() -> Arc<WorkflowDefinition> {
        Arc::new(
            WorkflowDefinition::new("triage")
                .with_step(StepDefinition::new("fetch", "tracker.fetch"))
                .with_step(StepDefinition::new("label", "ai.classify").after("fetch")),
        )
    }

    #[test]
    fn new_execution_is_queued_with_pending_steps() {
        let exec = Execution::new(snapshot(), Value::Null, Map::new());
        assert_eq!(exec.status, ExecutionStatus::Queued);
        assert_eq!(exec.workflow_id, "triage");
        assert_eq!(exec.steps.len(), 2);
        assert!(exec.steps.values().all(|s| s.status == StepStatus::Pending));
        assert!(exec.completed_at.is_none());
    }

    #[test]
    fn finish_orders_timestamps() {
        let mut exec = Execution::new(snapshot(), Value::Null, Map::new());
        exec.mark_running();
        exec.finish(ExecutionStatus::Completed, None);
        assert!(exec.completed_at.unwrap() >= exec.started_at);
        assert!(exec.is_terminal());
    }

    #[test]
    fn retry_links_to_parent() {
        let mut parent = Execution::new(snapshot(), serde_json::json!({"pr": 7}), Map::new());
        parent.finish(ExecutionStatus::Failed, None);
        let child = Execution::retry_of(&parent);
        assert_eq!(child.parent_execution_id, Some(parent.id));
        assert_eq!(child.retry_count, 1);
        assert_eq!(child.context, parent.context);
        assert_eq!(child.status, ExecutionStatus::Queued);
    }

    #[test]
    fn terminal_states() {
        assert!(!ExecutionStatus::Queued.is_terminal());
        assert!(!ExecutionStatus::Running.is_terminal());
        assert!(ExecutionStatus::Timeout.is_terminal());
        assert!(StepStatus::Skipped.blocks_dependents());
        assert!(!StepStatus::Completed.blocks_dependents());
    }
}
