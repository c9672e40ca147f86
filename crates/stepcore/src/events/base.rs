use crate::{ExecutionId, ExecutionStatus, StepId, WorkflowId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Events emitted during workflow execution
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ExecutionEvent {
    ExecutionQueued {
        execution_id: ExecutionId,
        workflow_id: WorkflowId,
        timestamp: DateTime<Utc>,
    },
    ExecutionStarted {
        execution_id: ExecutionId,
        workflow_id: WorkflowId,
        timestamp: DateTime<Utc>,
    },
    StepStarted {
        execution_id: ExecutionId,
        step_id: StepId,
        step_type: String,
        attempt: u32,
        timestamp: DateTime<Utc>,
    },
    StepRetrying {
        execution_id: ExecutionId,
        step_id: StepId,
        attempt: u32,
        delay_ms: u64,
        error: String,
        timestamp: DateTime<Utc>,
    },
    StepCompleted {
        execution_id: ExecutionId,
        step_id: StepId,
        duration_ms: u64,
        timestamp: DateTime<Utc>,
    },
    StepFailed {
        execution_id: ExecutionId,
        step_id: StepId,
        error: String,
        timestamp: DateTime<Utc>,
    },
    StepSkipped {
        execution_id: ExecutionId,
        step_id: StepId,
        reason: String,
        timestamp: DateTime<Utc>,
    },
    ExecutionFinished {
        execution_id: ExecutionId,
        status: ExecutionStatus,
        duration_ms: u64,
        timestamp: DateTime<Utc>,
    },
    StepEvent {
        execution_id: ExecutionId,
        step_id: StepId,
        event: StepEvent,
        timestamp: DateTime<Utc>,
    },
}

impl ExecutionEvent {
    pub fn execution_id(&self) -> ExecutionId {
        match self {
            ExecutionEvent::ExecutionQueued { execution_id, .. }
            | ExecutionEvent::ExecutionStarted { execution_id, .. }
            | ExecutionEvent::StepStarted { execution_id, .. }
            | ExecutionEvent::StepRetrying { execution_id, .. }
            | ExecutionEvent::StepCompleted { execution_id, .. }
            | ExecutionEvent::StepFailed { execution_id, .. }
            | ExecutionEvent::StepSkipped { execution_id, .. }
            | ExecutionEvent::ExecutionFinished { execution_id, .. }
            | ExecutionEvent::StepEvent { execution_id, .. } => *execution_id,
        }
    }
}

/// Events reported by an action while it runs
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event_type")]
pub enum StepEvent {
    Info { message: String },
    Warning { message: String },
    Progress { percent: f64, message: Option<String> },
}

/// Event emitter handed to actions through their context
#[derive(Clone)]
pub struct EventEmitter {
    execution_id: ExecutionId,
    step_id: StepId,
    sender: broadcast::Sender<ExecutionEvent>,
}

impl EventEmitter {
    pub fn new(
        execution_id: ExecutionId,
        step_id: StepId,
        sender: broadcast::Sender<ExecutionEvent>,
    ) -> Self {
        Self {
            execution_id,
            step_id,
            sender,
        }
    }

    pub fn emit(&self, event: StepEvent) {
        let _ = self.sender.send(ExecutionEvent::StepEvent {
            execution_id: self.execution_id,
            step_id: self.step_id.clone(),
            event,
            timestamp: Utc::now(),
        });
    }

    pub fn info(&self, message: impl Into<String>) {
        self.emit(StepEvent::Info {
            message: message.into(),
        });
    }

    pub fn warn(&self, message: impl Into<String>) {
        self.emit(StepEvent::Warning {
            message: message.into(),
        });
    }

    pub fn progress(&self, percent: f64, message: Option<String>) {
        self.emit(StepEvent::Progress { percent, message });
    }
}

/// Broadcast bus shared by the scheduler and every subscriber.
/// Sending never blocks; lagging receivers drop the oldest events.
pub struct EventBus {
    sender: broadcast::Sender<ExecutionEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ExecutionEvent> {
        self.sender.subscribe()
    }

    pub fn emit(&self, event: ExecutionEvent) {
        let _ = self.sender.send(event);
    }

    pub fn create_emitter(&self, execution_id: ExecutionId, step_id: impl Into<StepId>) -> EventEmitter {
        EventEmitter::new(execution_id, step_id.into(), self.sender.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[tokio::test]
    async fn emitter_tags_events_with_step() {
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe();
        let execution_id = Uuid::new_v4();

        bus.create_emitter(execution_id, "lint").info("running ruff");

        match rx.recv().await.unwrap() {
            ExecutionEvent::StepEvent { execution_id: id, step_id, event, .. } => {
                assert_eq!(id, execution_id);
                assert_eq!(step_id, "lint");
                assert!(matches!(event, StepEvent::Info { message } if message == "running ruff"));
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn emitting_without_subscribers_is_harmless() {
        let bus = EventBus::new(4);
        bus.emit(ExecutionEvent::ExecutionQueued {
            execution_id: Uuid::new_v4(),
            workflow_id: "wf".into(),
            timestamp: Utc::now(),
        });
    }
}
