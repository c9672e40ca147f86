use crate::{ActionError, EventEmitter, ExecutionId, StepConfig, StepId, WorkflowId};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use tokio_util::sync::CancellationToken;

/// Core trait that every step implementation satisfies.
///
/// Actions are registered under a string key (e.g. `"chat.notify"`) and the
/// engine only ever talks to them through this trait.
#[async_trait]
pub trait Action: Send + Sync {
    /// Unique type identifier (e.g., "http.webhook", "time.delay")
    fn action_type(&self) -> &str;

    /// Run the step. Long-running actions should watch
    /// `ctx.cancellation` and return [`ActionError::Cancelled`] promptly.
    async fn run(&self, config: &StepConfig, ctx: ActionContext) -> Result<ActionOutput, ActionError>;

    /// Whether a failed attempt may be repeated without harm.
    fn retry_safe(&self) -> bool {
        true
    }

    /// Optional: Validate configuration when a workflow is registered
    fn validate_config(&self, _config: &StepConfig) -> Result<(), ActionError> {
        Ok(())
    }
}

/// Execution context passed to each action invocation
#[derive(Clone)]
pub struct ActionContext {
    pub execution_id: ExecutionId,
    pub workflow_id: WorkflowId,
    pub step_id: StepId,

    /// 1-based attempt number
    pub attempt: u32,

    /// Trigger context supplied by the caller (webhook payload, event, ...)
    pub trigger: Value,

    /// Caller-supplied execution parameters
    pub parameters: Map<String, Value>,

    /// Outputs of the step's `depends_on` predecessors that completed
    pub inputs: HashMap<StepId, Value>,

    /// Event emitter for real-time updates
    pub events: EventEmitter,

    /// Cancelled when the execution times out or is cancelled
    pub cancellation: CancellationToken,
}

impl ActionContext {
    pub fn new(
        execution_id: ExecutionId,
        workflow_id: impl Into<WorkflowId>,
        step_id: impl Into<StepId>,
        events: EventEmitter,
    ) -> Self {
        Self {
            execution_id,
            workflow_id: workflow_id.into(),
            step_id: step_id.into(),
            attempt: 1,
            trigger: Value::Null,
            parameters: Map::new(),
            inputs: HashMap::new(),
            events,
            cancellation: CancellationToken::new(),
        }
    }

    pub fn input(&self, step_id: &str) -> Option<&Value> {
        self.inputs.get(step_id)
    }

    pub fn parameter(&self, name: &str) -> Option<&Value> {
        self.parameters.get(name)
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }
}

/// Get a required string config value or return error
pub fn require_str<'a>(config: &'a StepConfig, name: &str) -> Result<&'a str, ActionError> {
    match config.get(name) {
        Some(Value::String(s)) => Ok(s),
        Some(_) => Err(ActionError::InvalidConfig {
            field: name.to_string(),
            reason: "expected a string".to_string(),
        }),
        None => Err(ActionError::MissingConfig(name.to_string())),
    }
}

/// Output from a step's action
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ActionOutput {
    pub value: Value,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, Value>,
}

impl ActionOutput {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn json(value: impl Into<Value>) -> Self {
        Self {
            value: value.into(),
            metadata: HashMap::new(),
        }
    }

    /// Sets `key` on an object-valued output, turning a null output into an object.
    pub fn with_output(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        if !self.value.is_object() {
            self.value = Value::Object(Map::new());
        }
        if let Value::Object(map) = &mut self.value {
            map.insert(key.into(), value.into());
        }
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}
