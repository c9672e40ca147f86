#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::json;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use stepcore::{Action, ActionContext, ActionError, ActionOutput, StepConfig};
use stepruntime::{ActionRegistry, EngineConfig, ExecutionSupervisor};

/// Start and end instants of one step run.
#[derive(Debug, Clone)]
pub struct Span {
    pub step_id: String,
    pub execution_id: uuid::Uuid,
    pub start: Instant,
    pub end: Instant,
}

/// Sleeps for `sleep`, records its span, tracks peak concurrency.
pub struct Record {
    pub sleep: Duration,
    pub spans: Mutex<Vec<Span>>,
    current: AtomicUsize,
    pub peak: AtomicUsize,
}

impl Record {
    pub fn new(sleep: Duration) -> Arc<Self> {
        Arc::new(Self {
            sleep,
            spans: Mutex::new(Vec::new()),
            current: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        })
    }

    pub fn span(&self, step_id: &str) -> Span {
        self.spans
            .lock()
            .iter()
            .find(|s| s.step_id == step_id)
            .cloned()
            .unwrap_or_else(|| panic!("step {step_id} never ran"))
    }
}

#[async_trait]
impl Action for Record {
    fn action_type(&self) -> &str {
        "test.record"
    }

    async fn run(&self, _config: &StepConfig, ctx: ActionContext) -> Result<ActionOutput, ActionError> {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        let start = Instant::now();
        tokio::time::sleep(self.sleep).await;
        self.current.fetch_sub(1, Ordering::SeqCst);
        self.spans.lock().push(Span {
            step_id: ctx.step_id.clone(),
            execution_id: ctx.execution_id,
            start,
            end: Instant::now(),
        });
        Ok(ActionOutput::json(json!({ "step": ctx.step_id })))
    }
}

/// Fails until it has been called `failures` times, then succeeds.
pub struct Flaky {
    pub failures: u32,
    pub calls: AtomicU32,
    pub retry_safe: bool,
}

impl Flaky {
    pub fn new(failures: u32) -> Arc<Self> {
        Arc::new(Self {
            failures,
            calls: AtomicU32::new(0),
            retry_safe: true,
        })
    }

    pub fn not_retry_safe(failures: u32) -> Arc<Self> {
        Arc::new(Self {
            failures,
            calls: AtomicU32::new(0),
            retry_safe: false,
        })
    }
}

#[async_trait]
impl Action for Flaky {
    fn action_type(&self) -> &str {
        if self.retry_safe {
            "test.flaky"
        } else {
            "test.flaky_unsafe"
        }
    }

    async fn run(&self, _config: &StepConfig, ctx: ActionContext) -> Result<ActionOutput, ActionError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if call <= self.failures {
            return Err(ActionError::failed(format!("attempt {} refused by upstream", ctx.attempt)));
        }
        Ok(ActionOutput::json(json!({ "calls": call })))
    }

    fn retry_safe(&self) -> bool {
        self.retry_safe
    }
}

/// Always fails, echoing a credential so redaction can be observed.
pub struct Fail;

#[async_trait]
impl Action for Fail {
    fn action_type(&self) -> &str {
        "test.fail"
    }

    async fn run(&self, _config: &StepConfig, _ctx: ActionContext) -> Result<ActionOutput, ActionError> {
        Err(ActionError::failed("upstream rejected token=abc123secret"))
    }
}

/// Never finishes on its own.
pub struct Hang;

#[async_trait]
impl Action for Hang {
    fn action_type(&self) -> &str {
        "test.hang"
    }

    async fn run(&self, _config: &StepConfig, _ctx: ActionContext) -> Result<ActionOutput, ActionError> {
        std::future::pending::<()>().await;
        Ok(ActionOutput::new())
    }
}

/// Returns its inputs and parameters.
pub struct Echo;

#[async_trait]
impl Action for Echo {
    fn action_type(&self) -> &str {
        "test.echo"
    }

    async fn run(&self, _config: &StepConfig, ctx: ActionContext) -> Result<ActionOutput, ActionError> {
        Ok(ActionOutput::new()
            .with_output("inputs", json!(ctx.inputs))
            .with_output("parameters", ctx.parameters.clone())
            .with_output("trigger", ctx.trigger.clone()))
    }
}

pub struct Harness {
    pub supervisor: ExecutionSupervisor,
    pub record: Arc<Record>,
    pub flaky: Arc<Flaky>,
    pub flaky_unsafe: Arc<Flaky>,
}

pub fn test_config() -> EngineConfig {
    EngineConfig {
        retry_backoff_ms: 5,
        max_backoff_ms: 20,
        ..EngineConfig::default()
    }
}

pub fn test_config_with(f: impl FnOnce(&mut EngineConfig)) -> EngineConfig {
    let mut config = test_config();
    f(&mut config);
    config
}

pub fn registry(record: Arc<Record>, flaky: Arc<Flaky>, flaky_unsafe: Arc<Flaky>) -> ActionRegistry {
    let mut registry = ActionRegistry::new();
    registry.register(record);
    registry.register(flaky);
    registry.register(flaky_unsafe);
    registry.register(Arc::new(Fail));
    registry.register(Arc::new(Hang));
    registry.register(Arc::new(Echo));
    registry
}

pub fn harness(config: EngineConfig) -> Harness {
    let record = Record::new(Duration::from_millis(50));
    let flaky = Flaky::new(2);
    let flaky_unsafe = Flaky::not_retry_safe(1);
    let registry = registry(record.clone(), flaky.clone(), flaky_unsafe.clone());
    Harness {
        supervisor: ExecutionSupervisor::new(config, Arc::new(registry)),
        record,
        flaky,
        flaky_unsafe,
    }
}

/// Poll until `check` holds or two seconds pass.
pub async fn eventually(mut check: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(2);
    while !check() {
        assert!(Instant::now() < deadline, "condition not reached in time");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
