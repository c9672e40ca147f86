use crate::config::EngineConfig;
use crate::handle::ExecutionHandle;
use crate::metrics::{MetricsSnapshot, MetricsStore};
use crate::registry::ActionRegistry;
use crate::scheduler::StepScheduler;
use crate::store::{MemoryWorkflowStore, StoredWorkflow, WorkflowStore};
use crate::validator::WorkflowValidator;
use chrono::Utc;
use parking_lot::RwLock;
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use stepcore::{
    EventBus, Execution, ExecutionEvent, ExecutionFailure, ExecutionId, ExecutionStatus,
    ExecutionSummary, FlowError, NotFoundError, StepDefinition, StepStatus, ValidationReport,
    WorkflowDefinition,
};
use tokio::sync::{broadcast, mpsc, Semaphore};

/// Metrics plus the live queue depth.
#[derive(Debug, Clone, Serialize)]
pub struct EngineMetrics {
    #[serde(flatten)]
    pub metrics: MetricsSnapshot,
    pub running: usize,
    pub queued: usize,
}

/// Live executions and the history they retire into.
///
/// An execution is always in exactly one of the two. Retiring holds the
/// live write lock while appending to history, so lookups that check live
/// first and history second never miss a record in between.
struct ExecutionTable {
    live: RwLock<HashMap<ExecutionId, Arc<ExecutionHandle>>>,
    metrics: Arc<MetricsStore>,
}

impl ExecutionTable {
    fn admit(&self, handle: Arc<ExecutionHandle>) {
        self.live.write().insert(handle.id(), handle);
        self.metrics.record_execution_start();
    }

    fn get(&self, id: &ExecutionId) -> Option<Arc<ExecutionHandle>> {
        self.live.read().get(id).cloned()
    }

    fn lookup(&self, id: &ExecutionId) -> Option<Execution> {
        if let Some(handle) = self.get(id) {
            return Some(handle.snapshot());
        }
        self.metrics.find(id)
    }

    /// Move a terminal execution into history. Safe to call more than once.
    fn retire(&self, handle: &ExecutionHandle) {
        let mut live = self.live.write();
        if live.remove(&handle.id()).is_some() {
            self.metrics.record_completion(handle.snapshot());
        }
    }

    fn count(&self, status: ExecutionStatus) -> usize {
        self.live
            .read()
            .values()
            .filter(|h| h.status() == status)
            .count()
    }
}

/// Entry point of the engine: owns workflow definitions, admits executions
/// and hands them to the scheduler in submission order.
pub struct ExecutionSupervisor {
    config: Arc<EngineConfig>,
    registry: Arc<ActionRegistry>,
    validator: WorkflowValidator,
    store: Arc<dyn WorkflowStore>,
    events: Arc<EventBus>,
    table: Arc<ExecutionTable>,
    queue: mpsc::UnboundedSender<Arc<ExecutionHandle>>,
}

impl ExecutionSupervisor {
    /// Create a supervisor with an in-memory workflow store.
    ///
    /// Spawns the dispatcher, so it must be called inside a Tokio runtime.
    pub fn new(config: EngineConfig, registry: Arc<ActionRegistry>) -> Self {
        Self::with_store(config, registry, Arc::new(MemoryWorkflowStore::new()))
    }

    pub fn with_store(
        config: EngineConfig,
        registry: Arc<ActionRegistry>,
        store: Arc<dyn WorkflowStore>,
    ) -> Self {
        let config = Arc::new(config);
        let events = Arc::new(EventBus::new(config.event_buffer_size));
        let metrics = Arc::new(MetricsStore::new(config.max_history));
        let table = Arc::new(ExecutionTable {
            live: RwLock::new(HashMap::new()),
            metrics: metrics.clone(),
        });
        let scheduler = Arc::new(StepScheduler::new(
            registry.clone(),
            events.clone(),
            metrics,
            config.clone(),
        ));

        let (queue, rx) = mpsc::unbounded_channel();
        let slots = Arc::new(Semaphore::new(config.max_concurrent_executions.max(1)));
        tokio::spawn(dispatch(rx, scheduler, slots, table.clone()));

        Self {
            validator: WorkflowValidator::new(config.limits.clone()),
            config,
            registry,
            store,
            events,
            table,
            queue,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<ActionRegistry> {
        &self.registry
    }

    /// Graph, policy and registry checks combined.
    pub fn validate(&self, definition: &WorkflowDefinition) -> ValidationReport {
        let mut report = self.validator.validate(definition);
        report.merge(self.registry.check_definition(definition));
        report
    }

    /// Validate and register a workflow. Returns the report so callers can
    /// surface warnings.
    pub fn create_workflow(&self, definition: WorkflowDefinition) -> Result<ValidationReport, FlowError> {
        if self.store.get(&definition.name).is_some() {
            return Err(FlowError::Duplicate(definition.name));
        }
        let report = self.validate(&definition);
        if !report.is_valid() {
            return Err(FlowError::Validation(report));
        }

        let name = definition.name.clone();
        self.store.insert(definition, true)?;
        tracing::info!(workflow_id = %name, warnings = report.warnings.len(), "Workflow registered");
        Ok(report)
    }

    pub fn get_workflow(&self, name: &str) -> Result<StoredWorkflow, FlowError> {
        self.store
            .get(name)
            .ok_or_else(|| NotFoundError::Workflow(name.to_string()).into())
    }

    pub fn list_workflows(&self) -> Vec<StoredWorkflow> {
        self.store.list()
    }

    /// Past executions keep their own snapshot and are unaffected.
    pub fn delete_workflow(&self, name: &str) -> Result<(), FlowError> {
        self.store
            .remove(name)
            .ok_or_else(|| NotFoundError::Workflow(name.to_string()))?;
        tracing::info!(workflow_id = %name, "Workflow deleted");
        Ok(())
    }

    /// Add a step and re-validate the whole graph. The stored definition is
    /// replaced only if the result is valid.
    pub fn add_step(&self, name: &str, step: StepDefinition) -> Result<ValidationReport, FlowError> {
        let step_id = step.id.clone();
        let report = self.edit_workflow(name, |def| {
            def.add_step(step);
            Ok(())
        })?;
        tracing::info!(workflow_id = %name, step_id = %step_id, "Step added");
        Ok(report)
    }

    /// Remove a step and re-validate. Removing a step others depend on
    /// leaves dangling references, so it is rejected.
    pub fn remove_step(&self, name: &str, step_id: &str) -> Result<ValidationReport, FlowError> {
        let report = self.edit_workflow(name, |def| {
            def.remove_step(step_id)
                .map(|_| ())
                .ok_or_else(|| NotFoundError::Step(step_id.to_string()).into())
        })?;
        tracing::info!(workflow_id = %name, step_id = %step_id, "Step removed");
        Ok(report)
    }

    fn edit_workflow<F>(&self, name: &str, edit: F) -> Result<ValidationReport, FlowError>
    where
        F: FnOnce(&mut WorkflowDefinition) -> Result<(), FlowError>,
    {
        let stored = self.get_workflow(name)?;
        let mut updated = (*stored.definition).clone();
        edit(&mut updated)?;

        let report = self.validate(&updated);
        if !report.is_valid() {
            return Err(FlowError::Validation(report));
        }
        self.store.replace(updated, stored.revision, true)?;
        Ok(report)
    }

    /// Queue an execution of a registered workflow and return its id
    /// without waiting for it to start.
    pub fn execute(
        &self,
        workflow_id: &str,
        context: Value,
        parameters: Map<String, Value>,
    ) -> Result<ExecutionId, FlowError> {
        let stored = self.get_workflow(workflow_id)?;
        if !stored.validated {
            let report = self.validate(&stored.definition);
            if !report.is_valid() {
                return Err(FlowError::Validation(report));
            }
            self.store.mark_validated(workflow_id, stored.revision);
        }

        self.submit(Execution::new(stored.definition, context, parameters))
    }

    /// Run a failed, timed-out or cancelled execution again from the same
    /// snapshot, context and parameters.
    pub fn retry(&self, execution_id: ExecutionId) -> Result<ExecutionId, FlowError> {
        let parent = self.status(execution_id)?;
        if !parent.is_terminal() {
            return Err(FlowError::Conflict(format!(
                "execution {execution_id} is still {}",
                parent.status
            )));
        }
        if parent.status == ExecutionStatus::Completed {
            return Err(FlowError::Conflict(format!(
                "execution {execution_id} already completed"
            )));
        }
        let child = Execution::retry_of(&parent);
        tracing::info!(
            execution_id = %child.id,
            parent_execution_id = %execution_id,
            retry_count = child.retry_count,
            "Retrying execution"
        );
        self.submit(child)
    }

    fn submit(&self, execution: Execution) -> Result<ExecutionId, FlowError> {
        let execution_id = execution.id;
        let workflow_id = execution.workflow_id.clone();
        let handle = ExecutionHandle::new(execution);
        self.table.admit(handle.clone());

        tracing::info!(execution_id = %execution_id, workflow_id = %workflow_id, "Execution queued");
        self.events.emit(ExecutionEvent::ExecutionQueued {
            execution_id,
            workflow_id,
            timestamp: Utc::now(),
        });

        if self.queue.send(handle.clone()).is_err() {
            handle.update(|e| {
                e.finish(
                    ExecutionStatus::Failed,
                    Some(ExecutionFailure {
                        step_id: None,
                        error_type: "execution_error".into(),
                        message: "dispatcher is not running".into(),
                    }),
                )
            });
            self.table.retire(&handle);
            return Err(FlowError::Execution("dispatcher is not running".into()));
        }
        Ok(execution_id)
    }

    /// Current record of a live or historical execution.
    pub fn status(&self, execution_id: ExecutionId) -> Result<Execution, FlowError> {
        self.table
            .lookup(&execution_id)
            .ok_or_else(|| NotFoundError::Execution(execution_id).into())
    }

    /// Request cooperative cancellation. Queued executions are finished
    /// immediately; terminal ones are left alone.
    pub fn cancel(&self, execution_id: ExecutionId) -> Result<(), FlowError> {
        let Some(handle) = self.table.get(&execution_id) else {
            return match self.table.metrics.find(&execution_id) {
                Some(_) => Ok(()),
                None => Err(NotFoundError::Execution(execution_id).into()),
            };
        };

        let was_queued = handle.update(|e| {
            if e.status != ExecutionStatus::Queued {
                return false;
            }
            for run in e.steps.values_mut() {
                run.status = StepStatus::Skipped;
                run.error = Some("execution cancelled before it started".into());
            }
            e.finish(
                ExecutionStatus::Cancelled,
                Some(ExecutionFailure {
                    step_id: None,
                    error_type: "cancelled".into(),
                    message: "execution cancelled before it started".into(),
                }),
            );
            true
        });
        handle.cancellation().cancel();
        tracing::info!(execution_id = %execution_id, queued = was_queued, "Cancellation requested");

        if was_queued {
            self.events.emit(ExecutionEvent::ExecutionFinished {
                execution_id,
                status: ExecutionStatus::Cancelled,
                duration_ms: handle.snapshot().duration_ms().unwrap_or(0),
                timestamp: Utc::now(),
            });
            self.table.retire(&handle);
        }
        Ok(())
    }

    /// Resolve once the execution is terminal and return its final record.
    pub async fn wait(&self, execution_id: ExecutionId) -> Result<Execution, FlowError> {
        if let Some(handle) = self.table.get(&execution_id) {
            handle.wait().await;
            return Ok(handle.snapshot());
        }
        self.status(execution_id)
    }

    pub fn active_executions(&self) -> Vec<ExecutionSummary> {
        let mut active: Vec<ExecutionSummary> = self
            .table
            .live
            .read()
            .values()
            .map(|h| h.snapshot().summary())
            .collect();
        active.sort_by_key(|s| s.started_at);
        active
    }

    /// Terminal executions, newest first.
    pub fn recent_history(&self, limit: usize) -> Vec<ExecutionSummary> {
        self.table.metrics.recent_history(limit)
    }

    pub fn metrics(&self) -> EngineMetrics {
        EngineMetrics {
            metrics: self.table.metrics.snapshot(),
            running: self.running_count(),
            queued: self.queued_count(),
        }
    }

    pub fn running_count(&self) -> usize {
        self.table.count(ExecutionStatus::Running)
    }

    pub fn queued_count(&self) -> usize {
        self.table.count(ExecutionStatus::Queued)
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ExecutionEvent> {
        self.events.subscribe()
    }

    pub fn event_bus(&self) -> &Arc<EventBus> {
        &self.events
    }
}

/// Single consumer of the submission queue. Taking slots one at a time in
/// arrival order keeps admission FIFO.
async fn dispatch(
    mut rx: mpsc::UnboundedReceiver<Arc<ExecutionHandle>>,
    scheduler: Arc<StepScheduler>,
    slots: Arc<Semaphore>,
    table: Arc<ExecutionTable>,
) {
    while let Some(handle) = rx.recv().await {
        if handle.status().is_terminal() {
            continue;
        }
        let permit = match slots.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => break,
        };
        if handle.status().is_terminal() {
            continue;
        }

        let scheduler = scheduler.clone();
        let table = table.clone();
        tokio::spawn(async move {
            let _permit = permit;
            scheduler.run(handle.clone()).await;
            table.retire(&handle);
        });
    }
    tracing::debug!("Dispatcher stopped");
}
