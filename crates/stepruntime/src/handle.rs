use parking_lot::RwLock;
use std::sync::Arc;
use stepcore::{Execution, ExecutionId, ExecutionStatus, WorkflowDefinition};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// Shared handle on a live execution, used for status queries and
/// cancellation while the scheduler drives it.
pub struct ExecutionHandle {
    id: ExecutionId,
    record: RwLock<Execution>,
    cancellation: CancellationToken,
    status_tx: watch::Sender<ExecutionStatus>,
}

impl ExecutionHandle {
    pub fn new(execution: Execution) -> Arc<Self> {
        let (status_tx, _) = watch::channel(execution.status);
        Arc::new(Self {
            id: execution.id,
            record: RwLock::new(execution),
            cancellation: CancellationToken::new(),
            status_tx,
        })
    }

    pub fn id(&self) -> ExecutionId {
        self.id
    }

    /// Copy of the current record.
    pub fn snapshot(&self) -> Execution {
        self.record.read().clone()
    }

    pub fn status(&self) -> ExecutionStatus {
        self.record.read().status
    }

    pub fn definition(&self) -> Arc<WorkflowDefinition> {
        self.record.read().definition.clone()
    }

    /// Mutate the record under its write lock. Status changes are published
    /// before the lock is released so watchers never see them out of order.
    pub fn update<R>(&self, f: impl FnOnce(&mut Execution) -> R) -> R {
        let mut record = self.record.write();
        let result = f(&mut record);
        let status = record.status;
        self.status_tx.send_if_modified(|current| {
            if *current != status {
                *current = status;
                true
            } else {
                false
            }
        });
        result
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }

    pub fn subscribe(&self) -> watch::Receiver<ExecutionStatus> {
        self.status_tx.subscribe()
    }

    /// Resolves once the execution reaches a terminal status.
    pub async fn wait(&self) -> ExecutionStatus {
        let mut rx = self.subscribe();
        let status = match rx.wait_for(|status| status.is_terminal()).await {
            Ok(status) => *status,
            Err(_) => self.status(),
        };
        status
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{Map, Value};
    use std::time::Duration;
    use stepcore::StepDefinition;

    fn handle() -> Arc<ExecutionHandle> {
        let def = Arc::new(WorkflowDefinition::new("wf").with_step(StepDefinition::new("a", "debug.log")));
        ExecutionHandle::new(Execution::new(def, Value::Null, Map::new()))
    }

    #[tokio::test]
    async fn wait_resolves_on_terminal_update() {
        let handle = handle();
        let waiter = {
            let handle = handle.clone();
            tokio::spawn(async move { handle.wait().await })
        };

        handle.update(|e| e.mark_running());
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!waiter.is_finished());

        handle.update(|e| e.finish(ExecutionStatus::Cancelled, None));
        assert_eq!(waiter.await.unwrap(), ExecutionStatus::Cancelled);
        assert_eq!(handle.status(), ExecutionStatus::Cancelled);
    }

    #[tokio::test]
    async fn wait_on_finished_execution_returns_immediately() {
        let handle = handle();
        handle.update(|e| e.finish(ExecutionStatus::Completed, None));
        assert_eq!(handle.wait().await, ExecutionStatus::Completed);
    }

    #[test]
    fn snapshot_is_detached() {
        let handle = handle();
        let before = handle.snapshot();
        handle.update(|e| e.mark_running());
        assert_eq!(before.status, ExecutionStatus::Queued);
        assert_eq!(handle.snapshot().status, ExecutionStatus::Running);
    }
}
