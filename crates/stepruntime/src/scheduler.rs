use crate::config::EngineConfig;
use crate::handle::ExecutionHandle;
use crate::metrics::MetricsStore;
use crate::plan::ExecutionPlan;
use crate::registry::ActionRegistry;
use chrono::Utc;
use futures::stream::{FuturesUnordered, StreamExt};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use stepcore::{
    sanitize, Action, ActionContext, ActionError, EventBus, Execution, ExecutionEvent,
    ExecutionFailure, ExecutionStatus, StepConfig, StepDefinition, StepId, StepStatus,
};
use tokio::sync::Semaphore;
use tokio::task::JoinError;
use tokio::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// Drives one execution through its dependency levels.
///
/// Steps of a level run as spawned tasks that only report back; every
/// change to the execution record is applied here, by the task driving
/// the execution.
pub struct StepScheduler {
    registry: Arc<ActionRegistry>,
    events: Arc<EventBus>,
    metrics: Arc<MetricsStore>,
    step_permits: Arc<Semaphore>,
    config: Arc<EngineConfig>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Interrupt {
    Cancelled,
    TimedOut,
}

struct StepOutcome {
    attempts: u32,
    duration_ms: u64,
    result: Result<Value, ActionError>,
}

/// Everything a spawned step task owns.
struct Invocation {
    action: Arc<dyn Action>,
    config: StepConfig,
    ctx: ActionContext,
    step_type: String,
    max_attempts: u32,
    timeout_seconds: u64,
    deadline: Instant,
    permits: Arc<Semaphore>,
    events: Arc<EventBus>,
    engine: Arc<EngineConfig>,
}

impl StepScheduler {
    pub fn new(
        registry: Arc<ActionRegistry>,
        events: Arc<EventBus>,
        metrics: Arc<MetricsStore>,
        config: Arc<EngineConfig>,
    ) -> Self {
        Self {
            registry,
            events,
            metrics,
            step_permits: Arc::new(Semaphore::new(config.max_concurrent_steps.max(1))),
            config,
        }
    }

    /// Run a queued execution to a terminal state and return that state.
    /// An execution that is no longer queued (cancelled while waiting) is
    /// left untouched.
    pub async fn run(&self, handle: Arc<ExecutionHandle>) -> ExecutionStatus {
        let started = handle.update(|e| {
            if e.status == ExecutionStatus::Queued {
                e.mark_running();
                true
            } else {
                false
            }
        });
        if !started {
            return handle.status();
        }

        let execution_id = handle.id();
        let definition = handle.definition();
        let timeout_seconds = definition.config.timeout_seconds;
        let deadline = Instant::now() + Duration::from_secs(timeout_seconds);

        tracing::info!(
            execution_id = %execution_id,
            workflow_id = %definition.name,
            steps = definition.steps.len(),
            "Starting workflow execution"
        );
        self.events.emit(ExecutionEvent::ExecutionStarted {
            execution_id,
            workflow_id: definition.name.clone(),
            timestamp: Utc::now(),
        });

        let plan = match ExecutionPlan::build(&definition) {
            Ok(plan) => plan,
            Err(e) => {
                let failure = ExecutionFailure {
                    step_id: None,
                    error_type: e.kind().to_string(),
                    message: sanitize(&e.to_string()),
                };
                return self.finalize(&handle, None, Some(failure));
            }
        };

        let steps_token = handle.cancellation().child_token();
        let interrupt = tokio::select! {
            biased;
            _ = handle.cancellation().cancelled() => Some(Interrupt::Cancelled),
            _ = tokio::time::sleep_until(deadline) => Some(Interrupt::TimedOut),
            _ = self.run_levels(&handle, &plan, deadline, &steps_token) => None,
        };
        steps_token.cancel();

        if interrupt == Some(Interrupt::TimedOut) {
            tracing::error!(
                execution_id = %execution_id,
                timeout_seconds,
                "Execution exceeded its timeout"
            );
        }
        self.finalize(&handle, interrupt, None)
    }

    async fn run_levels(
        &self,
        handle: &ExecutionHandle,
        plan: &ExecutionPlan,
        deadline: Instant,
        token: &CancellationToken,
    ) {
        let definition = handle.definition();
        let parallel = definition.config.parallel;

        for (depth, level) in plan.levels().iter().enumerate() {
            tracing::debug!(
                execution_id = %handle.id(),
                level = depth,
                steps = level.len(),
                parallel,
                "Processing level"
            );

            let mut running = FuturesUnordered::new();
            for step_id in level {
                let Some(step) = definition.find_step(step_id) else {
                    continue;
                };
                if let Some(blocker) = self.blocking_predecessor(handle, step) {
                    self.skip_step(handle, step, &blocker);
                    continue;
                }

                let Some(task) = self.start_step(handle, step, deadline, token) else {
                    continue;
                };
                if parallel {
                    running.push(task);
                } else {
                    let (id, joined) = task.await;
                    self.apply_outcome(handle, &id, joined);
                }
            }

            while let Some((id, joined)) = running.next().await {
                self.apply_outcome(handle, &id, joined);
            }
        }
    }

    /// First predecessor whose state prevents `step` from running, unless
    /// the step runs regardless.
    fn blocking_predecessor(&self, handle: &ExecutionHandle, step: &StepDefinition) -> Option<StepId> {
        if step.always_run {
            return None;
        }
        let record = handle.snapshot();
        step.depends_on
            .iter()
            .find(|dep| {
                record
                    .step_status(dep)
                    .map_or(true, |status| status.blocks_dependents() || !status.is_terminal())
            })
            .cloned()
    }

    fn skip_step(&self, handle: &ExecutionHandle, step: &StepDefinition, blocker: &str) {
        let reason = format!("dependency '{blocker}' did not complete");
        handle.update(|e| {
            if let Some(run) = e.steps.get_mut(&step.id) {
                run.status = StepStatus::Skipped;
                run.completed_at = Some(Utc::now());
                run.error = Some(reason.clone());
            }
        });
        tracing::warn!(
            execution_id = %handle.id(),
            step_id = %step.id,
            blocker = %blocker,
            "Skipping step"
        );
        self.metrics.record_step(&step.step_type, StepStatus::Skipped, 0, 0);
        self.events.emit(ExecutionEvent::StepSkipped {
            execution_id: handle.id(),
            step_id: step.id.clone(),
            reason,
            timestamp: Utc::now(),
        });
    }

    /// Mark `step` running and spawn its invocation. Returns `None` when the
    /// step failed before it could be spawned.
    fn start_step(
        &self,
        handle: &ExecutionHandle,
        step: &StepDefinition,
        deadline: Instant,
        token: &CancellationToken,
    ) -> Option<impl Future<Output = (StepId, Result<StepOutcome, JoinError>)>> {
        let execution_id = handle.id();

        let action = match self.registry.get(&step.step_type) {
            Ok(action) => action,
            Err(e) => {
                handle.update(|rec| {
                    if let Some(run) = rec.steps.get_mut(&step.id) {
                        run.status = StepStatus::Running;
                        run.started_at = Some(Utc::now());
                    }
                });
                self.apply_outcome(
                    handle,
                    &step.id,
                    Ok(StepOutcome {
                        attempts: 0,
                        duration_ms: 0,
                        result: Err(e),
                    }),
                );
                return None;
            }
        };

        let seed = handle.update(|rec| {
            if let Some(run) = rec.steps.get_mut(&step.id) {
                run.status = StepStatus::Running;
                run.started_at = Some(Utc::now());
            }
            ContextSeed::from_record(rec, step)
        });

        let mut ctx = ActionContext::new(
            execution_id,
            seed.workflow_id,
            step.id.clone(),
            self.events.create_emitter(execution_id, step.id.clone()),
        );
        ctx.trigger = seed.trigger;
        ctx.parameters = seed.parameters;
        ctx.inputs = seed.inputs;
        ctx.cancellation = token.child_token();

        let definition = handle.definition();
        let policy = &definition.config;
        let max_attempts = if policy.retry_on_failure && action.retry_safe() {
            1 + policy.max_retries
        } else {
            1
        };

        tracing::debug!(
            execution_id = %execution_id,
            step_id = %step.id,
            step_type = %step.step_type,
            max_attempts,
            "Dispatching step"
        );

        let invocation = Invocation {
            action,
            config: step.config.clone(),
            ctx,
            step_type: step.step_type.clone(),
            max_attempts,
            timeout_seconds: policy.timeout_seconds,
            deadline,
            permits: self.step_permits.clone(),
            events: self.events.clone(),
            engine: self.config.clone(),
        };

        let step_id = step.id.clone();
        let task = tokio::spawn(invoke_with_retry(invocation));
        Some(async move { (step_id, task.await) })
    }

    fn apply_outcome(&self, handle: &ExecutionHandle, step_id: &str, joined: Result<StepOutcome, JoinError>) {
        let execution_id = handle.id();
        let outcome = joined.unwrap_or_else(|e| StepOutcome {
            attempts: 1,
            duration_ms: 0,
            result: Err(ActionError::failed(format!("step task aborted: {e}"))),
        });

        let applied = handle.update(|rec| {
            let run = rec.steps.get_mut(step_id)?;
            if run.status != StepStatus::Running {
                return None;
            }
            run.attempts = outcome.attempts;
            run.completed_at = Some(Utc::now());
            run.duration_ms = Some(outcome.duration_ms);
            let step_type = run.step_type.clone();

            match &outcome.result {
                Ok(value) => {
                    run.status = StepStatus::Completed;
                    run.output = Some(value.clone());
                    Some((step_type, StepStatus::Completed, None))
                }
                Err(err) => {
                    let message = sanitize(&err.to_string());
                    run.status = StepStatus::Failed;
                    run.error = Some(message.clone());
                    if rec.error.is_none() {
                        rec.error = Some(ExecutionFailure {
                            step_id: Some(step_id.to_string()),
                            error_type: err.kind().to_string(),
                            message: message.clone(),
                        });
                    }
                    Some((step_type, StepStatus::Failed, Some(message)))
                }
            }
        });

        let Some((step_type, status, error)) = applied else {
            return;
        };
        self.metrics
            .record_step(&step_type, status, outcome.attempts, outcome.duration_ms);

        match error {
            None => {
                tracing::info!(
                    execution_id = %execution_id,
                    step_id = %step_id,
                    duration_ms = outcome.duration_ms,
                    "Step completed"
                );
                self.events.emit(ExecutionEvent::StepCompleted {
                    execution_id,
                    step_id: step_id.to_string(),
                    duration_ms: outcome.duration_ms,
                    timestamp: Utc::now(),
                });
            }
            Some(error) => {
                tracing::error!(
                    execution_id = %execution_id,
                    step_id = %step_id,
                    attempts = outcome.attempts,
                    error = %error,
                    "Step failed"
                );
                self.events.emit(ExecutionEvent::StepFailed {
                    execution_id,
                    step_id: step_id.to_string(),
                    error,
                    timestamp: Utc::now(),
                });
            }
        }
    }

    /// Settle every non-terminal step, compute the final status and result
    /// payload, and publish the terminal state.
    fn finalize(
        &self,
        handle: &ExecutionHandle,
        interrupt: Option<Interrupt>,
        failure: Option<ExecutionFailure>,
    ) -> ExecutionStatus {
        let mut settled = Vec::new();
        let (status, duration_ms) = handle.update(|rec| {
            let reason = match interrupt {
                Some(Interrupt::Cancelled) => "execution cancelled".to_string(),
                Some(Interrupt::TimedOut) => format!(
                    "execution timed out after {}s",
                    rec.definition.config.timeout_seconds
                ),
                None => "execution ended before the step ran".to_string(),
            };

            for (id, run) in rec.steps.iter_mut() {
                match run.status {
                    StepStatus::Running => {
                        run.status = StepStatus::Failed;
                        run.completed_at = Some(Utc::now());
                        run.error = Some(reason.clone());
                        let ms = run
                            .started_at
                            .map(|t| (Utc::now() - t).num_milliseconds().max(0) as u64)
                            .unwrap_or(0);
                        run.duration_ms = Some(ms);
                        settled.push((id.clone(), run.step_type.clone(), StepStatus::Failed, run.attempts.max(1), ms));
                    }
                    StepStatus::Pending => {
                        run.status = StepStatus::Skipped;
                        run.completed_at = Some(Utc::now());
                        run.error = Some(reason.clone());
                        settled.push((id.clone(), run.step_type.clone(), StepStatus::Skipped, 0, 0));
                    }
                    _ => {}
                }
            }

            let status = match interrupt {
                Some(Interrupt::Cancelled) => ExecutionStatus::Cancelled,
                Some(Interrupt::TimedOut) => ExecutionStatus::Timeout,
                None => final_status(rec, failure.is_some()),
            };

            let error = match (interrupt, rec.error.take(), failure) {
                (_, _, Some(f)) => Some(f),
                (Some(kind), _, None) => Some(ExecutionFailure {
                    step_id: None,
                    error_type: match kind {
                        Interrupt::Cancelled => "cancelled".to_string(),
                        Interrupt::TimedOut => "timeout".to_string(),
                    },
                    message: reason,
                }),
                (None, existing, None) => existing,
            };

            rec.result = Some(Value::Object(completed_outputs(rec)));
            rec.finish(status, error);
            (status, rec.duration_ms().unwrap_or(0))
        });

        for (step_id, step_type, step_status, attempts, ms) in settled {
            self.metrics.record_step(&step_type, step_status, attempts, ms);
            if step_status == StepStatus::Skipped {
                self.events.emit(ExecutionEvent::StepSkipped {
                    execution_id: handle.id(),
                    step_id,
                    reason: format!("execution {status}"),
                    timestamp: Utc::now(),
                });
            }
        }

        match status {
            ExecutionStatus::Completed => tracing::info!(
                execution_id = %handle.id(),
                duration_ms,
                "Workflow execution completed"
            ),
            _ => tracing::error!(
                execution_id = %handle.id(),
                status = %status,
                duration_ms,
                "Workflow execution did not complete"
            ),
        }
        self.events.emit(ExecutionEvent::ExecutionFinished {
            execution_id: handle.id(),
            status,
            duration_ms,
            timestamp: Utc::now(),
        });
        status
    }
}

/// Data copied out of the record to build a step's context.
struct ContextSeed {
    workflow_id: String,
    trigger: Value,
    parameters: Map<String, Value>,
    inputs: HashMap<StepId, Value>,
}

impl ContextSeed {
    fn from_record(record: &Execution, step: &StepDefinition) -> Self {
        let inputs = step
            .depends_on
            .iter()
            .filter_map(|dep| {
                let run = record.step(dep)?;
                match (&run.status, &run.output) {
                    (StepStatus::Completed, Some(output)) => Some((dep.clone(), output.clone())),
                    _ => None,
                }
            })
            .collect();
        Self {
            workflow_id: record.workflow_id.clone(),
            trigger: record.context.clone(),
            parameters: record.parameters.clone(),
            inputs,
        }
    }
}

fn final_status(record: &Execution, plan_failed: bool) -> ExecutionStatus {
    if plan_failed {
        return ExecutionStatus::Failed;
    }
    match &record.error {
        Some(failure) if failure.error_type == "timeout" => ExecutionStatus::Timeout,
        Some(_) => ExecutionStatus::Failed,
        None if record.steps.values().any(|s| s.status == StepStatus::Failed) => ExecutionStatus::Failed,
        None => ExecutionStatus::Completed,
    }
}

fn completed_outputs(record: &Execution) -> Map<String, Value> {
    record
        .steps
        .iter()
        .filter(|(_, run)| run.status == StepStatus::Completed)
        .map(|(id, run)| (id.clone(), run.output.clone().unwrap_or(Value::Null)))
        .collect()
}

/// Invoke an action up to `max_attempts` times. Every attempt holds a step
/// permit only while the action runs, is bounded by the remaining execution
/// budget, and stops as soon as the execution is cancelled.
async fn invoke_with_retry(inv: Invocation) -> StepOutcome {
    let started = Instant::now();
    let execution_id = inv.ctx.execution_id;
    let step_id = inv.ctx.step_id.clone();
    let token = inv.ctx.cancellation.clone();
    let mut attempt = 0;

    loop {
        attempt += 1;
        let mut ctx = inv.ctx.clone();
        ctx.attempt = attempt;

        inv.events.emit(ExecutionEvent::StepStarted {
            execution_id,
            step_id: step_id.clone(),
            step_type: inv.step_type.clone(),
            attempt,
            timestamp: Utc::now(),
        });

        let result = tokio::select! {
            biased;
            _ = token.cancelled() => Err(ActionError::Cancelled),
            r = run_attempt(&inv, ctx) => r,
        };

        let err = match result {
            Ok(output) => {
                return StepOutcome {
                    attempts: attempt,
                    duration_ms: started.elapsed().as_millis() as u64,
                    result: Ok(output),
                }
            }
            Err(err) => err,
        };

        let remaining = inv.deadline.saturating_duration_since(Instant::now());
        let retry = attempt < inv.max_attempts
            && err.is_retryable()
            && !token.is_cancelled()
            && !remaining.is_zero();
        if !retry {
            return StepOutcome {
                attempts: attempt,
                duration_ms: started.elapsed().as_millis() as u64,
                result: Err(err),
            };
        }

        let delay = inv.engine.backoff_delay(attempt).min(remaining);
        let message = sanitize(&err.to_string());
        tracing::warn!(
            execution_id = %execution_id,
            step_id = %step_id,
            attempt,
            delay_ms = delay.as_millis() as u64,
            error = %message,
            "Step attempt failed, retrying"
        );
        inv.events.emit(ExecutionEvent::StepRetrying {
            execution_id,
            step_id: step_id.clone(),
            attempt,
            delay_ms: delay.as_millis() as u64,
            error: message,
            timestamp: Utc::now(),
        });

        tokio::select! {
            biased;
            _ = token.cancelled() => {
                return StepOutcome {
                    attempts: attempt,
                    duration_ms: started.elapsed().as_millis() as u64,
                    result: Err(ActionError::Cancelled),
                };
            }
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

async fn run_attempt(inv: &Invocation, ctx: ActionContext) -> Result<Value, ActionError> {
    let _permit = inv
        .permits
        .clone()
        .acquire_owned()
        .await
        .map_err(|_| ActionError::Cancelled)?;

    match tokio::time::timeout_at(inv.deadline, inv.action.run(&inv.config, ctx)).await {
        Ok(result) => result.map(|output| output.value),
        Err(_) => Err(ActionError::Timeout {
            seconds: inv.timeout_seconds,
        }),
    }
}
