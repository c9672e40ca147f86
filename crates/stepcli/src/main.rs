use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use stepcore::{
    ExecutionEvent, ExecutionId, ExecutionStatus, FlowError, StepDefinition, StepEvent,
    StepStatus, ValidationReport, WorkflowConfig, WorkflowDefinition,
};
use stepruntime::{ActionRegistry, EngineConfig, ExecutionSupervisor};
use tokio::sync::broadcast;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "stepwise")]
#[command(about = "Stepwise workflow runner", long_about = None)]
struct Cli {
    /// Engine config file (TOML); STEPWISE_* variables override it
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute a workflow file
    Run {
        /// Path to workflow JSON file
        #[arg(short, long)]
        file: PathBuf,

        /// Execution context as a JSON value
        #[arg(short, long)]
        input: Option<String>,

        /// Execution parameters as a JSON object
        #[arg(short, long)]
        parameters: Option<String>,

        /// Show debug logging
        #[arg(short, long)]
        verbose: bool,
    },

    /// Validate a workflow file
    Validate {
        /// Path to workflow JSON file
        file: PathBuf,
    },

    /// List available action types
    Actions,

    /// Create a new example workflow
    Init {
        /// Output file path
        #[arg(short, long, default_value = "workflow.json")]
        output: PathBuf,
    },
}

fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = if verbose {
        EnvFilter::new(default)
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default))
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn engine_config(path: Option<&Path>) -> Result<EngineConfig> {
    let config = match path {
        Some(path) => EngineConfig::load(path).with_context(|| format!("loading {}", path.display()))?,
        None => EngineConfig::default(),
    };
    let config = config.apply_env()?;
    config.validate()?;
    Ok(config)
}

fn registry() -> ActionRegistry {
    let mut registry = ActionRegistry::new();
    stepactions::register_all(&mut registry);
    registry
}

fn load_workflow(file: &Path) -> Result<WorkflowDefinition> {
    let content = std::fs::read_to_string(file).with_context(|| format!("reading {}", file.display()))?;
    let workflow = serde_json::from_str(&content).with_context(|| format!("parsing {}", file.display()))?;
    Ok(workflow)
}

fn parse_parameters(raw: Option<&str>) -> Result<Map<String, Value>> {
    match raw {
        None => Ok(Map::new()),
        Some(raw) => match serde_json::from_str(raw)? {
            Value::Object(map) => Ok(map),
            _ => Err(anyhow!("Parameters must be a JSON object")),
        },
    }
}

fn print_report(report: &ValidationReport) {
    for error in &report.errors {
        println!("  ❌ {}", error);
    }
    for warning in &report.warnings {
        println!("  ⚠️  {}", warning);
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            file,
            input,
            parameters,
            verbose,
        } => {
            init_logging(verbose);
            let config = engine_config(cli.config.as_deref())?;
            run_workflow(config, &file, input.as_deref(), parameters.as_deref()).await?;
        }

        Commands::Validate { file } => {
            let config = engine_config(cli.config.as_deref())?;
            if !validate_workflow(config, &file)? {
                std::process::exit(1);
            }
        }

        Commands::Actions => {
            list_actions();
        }

        Commands::Init { output } => {
            create_example_workflow(&output)?;
        }
    }

    Ok(())
}

async fn run_workflow(
    config: EngineConfig,
    file: &Path,
    input: Option<&str>,
    parameters: Option<&str>,
) -> Result<()> {
    println!("🚀 Loading workflow from: {}", file.display());

    let workflow = load_workflow(file)?;
    let workflow_id = workflow.name.clone();

    println!("📋 Workflow: {}", workflow.name);
    println!("   Steps: {}", workflow.steps.len());
    println!();

    let context = match input {
        Some(raw) => serde_json::from_str(raw).context("Input must be valid JSON")?,
        None => Value::Null,
    };
    let parameters = parse_parameters(parameters)?;

    let supervisor = ExecutionSupervisor::new(config, Arc::new(registry()));

    match supervisor.create_workflow(workflow) {
        Ok(report) => print_report(&report),
        Err(FlowError::Validation(report)) => {
            println!("❌ Workflow is invalid:");
            print_report(&report);
            bail!("workflow {} failed validation", workflow_id);
        }
        Err(e) => return Err(e.into()),
    }

    // Subscribe before executing so no event is missed.
    let events = supervisor.subscribe_events();
    let execution_id = supervisor.execute(&workflow_id, context, parameters)?;
    let printer = tokio::spawn(print_events(events, execution_id));

    let execution = supervisor.wait(execution_id).await?;
    let _ = tokio::time::timeout(Duration::from_secs(1), printer).await;

    println!();
    println!("📊 Execution Summary:");
    println!("   Execution ID: {}", execution.id);
    println!("   Status: {}", execution.status);
    if let Some(ms) = execution.duration_ms() {
        println!("   Duration: {}ms", ms);
    }

    let completed = execution
        .steps
        .values()
        .filter(|s| s.status == StepStatus::Completed)
        .count();
    println!("   Completed: {}/{} steps", completed, execution.steps.len());

    if let Some(Value::Object(outputs)) = &execution.result {
        if !outputs.is_empty() {
            println!();
            println!("📤 Outputs:");
            for (step_id, output) in outputs {
                println!("   {}: {}", step_id, output);
            }
        }
    }

    if let Some(error) = &execution.error {
        println!();
        match &error.step_id {
            Some(step_id) => println!("💥 {} in step {}: {}", error.error_type, step_id, error.message),
            None => println!("💥 {}: {}", error.error_type, error.message),
        }
    }

    if execution.status != ExecutionStatus::Completed {
        bail!("execution {} finished as {}", execution.id, execution.status);
    }
    Ok(())
}

/// Print events for one execution until it finishes.
async fn print_events(mut events: broadcast::Receiver<ExecutionEvent>, execution_id: ExecutionId) {
    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(broadcast::error::RecvError::Lagged(_)) => continue,
            Err(broadcast::error::RecvError::Closed) => break,
        };
        if event.execution_id() != execution_id {
            continue;
        }
        match event {
            ExecutionEvent::ExecutionQueued { .. } => {}
            ExecutionEvent::ExecutionStarted { .. } => {
                println!("▶️  Execution started");
            }
            ExecutionEvent::StepStarted {
                step_id,
                step_type,
                attempt,
                ..
            } => {
                if attempt > 1 {
                    println!("  ⚡ Starting step: {} ({}), attempt {}", step_id, step_type, attempt);
                } else {
                    println!("  ⚡ Starting step: {} ({})", step_id, step_type);
                }
            }
            ExecutionEvent::StepRetrying {
                step_id, delay_ms, error, ..
            } => {
                println!("  🔁 Step {} failed ({}), retrying in {}ms", step_id, error, delay_ms);
            }
            ExecutionEvent::StepCompleted { step_id, duration_ms, .. } => {
                println!("  ✅ Step {} completed in {}ms", step_id, duration_ms);
            }
            ExecutionEvent::StepFailed { step_id, error, .. } => {
                println!("  ❌ Step {} failed: {}", step_id, error);
            }
            ExecutionEvent::StepSkipped { step_id, reason, .. } => {
                println!("  ⏭️  Step {} skipped: {}", step_id, reason);
            }
            ExecutionEvent::StepEvent { step_id, event, .. } => match event {
                StepEvent::Info { message } => {
                    println!("     ℹ️  [{}] {}", step_id, message);
                }
                StepEvent::Warning { message } => {
                    println!("     ⚠️  [{}] {}", step_id, message);
                }
                StepEvent::Progress { percent, message } => {
                    if let Some(msg) = message {
                        println!("     📊 [{}] {}% - {}", step_id, percent, msg);
                    } else {
                        println!("     📊 [{}] {}%", step_id, percent);
                    }
                }
            },
            ExecutionEvent::ExecutionFinished { status, duration_ms, .. } => {
                if status == ExecutionStatus::Completed {
                    println!("✨ Execution completed successfully in {}ms", duration_ms);
                } else {
                    println!("💥 Execution {} after {}ms", status, duration_ms);
                }
                break;
            }
        }
    }
}

/// Returns whether the workflow passed validation.
fn validate_workflow(config: EngineConfig, file: &Path) -> Result<bool> {
    println!("🔍 Validating workflow: {}", file.display());

    let workflow = load_workflow(file)?;
    let report = check(config, &workflow);

    if report.is_valid() {
        println!("✅ Workflow is valid:");
        println!("   Name: {}", workflow.name);
        println!("   Steps: {}", workflow.steps.len());
    } else {
        println!("❌ Workflow is invalid:");
    }
    print_report(&report);

    Ok(report.is_valid())
}

/// Graph, policy and action checks, without registering anything.
fn check(config: EngineConfig, workflow: &WorkflowDefinition) -> ValidationReport {
    let registry = registry();
    let mut report = stepruntime::WorkflowValidator::new(config.limits).validate(workflow);
    report.merge(registry.check_definition(workflow));
    report
}

fn list_actions() {
    println!("📦 Available Action Types:");
    println!();

    let registry = registry();

    for action_type in registry.list_action_types() {
        let retry = match registry.get(&action_type) {
            Ok(action) if action.retry_safe() => "",
            _ => ", not retried",
        };
        if let Some(metadata) = registry.get_metadata(&action_type) {
            println!("  • {} ({}{})", action_type, metadata.category, retry);
            println!("    {}", metadata.description);
        } else {
            println!("  • {}", action_type);
        }
    }
}

fn example_workflow() -> WorkflowDefinition {
    WorkflowDefinition::new("example-release")
        .with_description("Announces a release, waits briefly and summarizes the outputs")
        .with_config(WorkflowConfig {
            timeout_seconds: 60,
            ..WorkflowConfig::default()
        })
        .with_step(
            StepDefinition::new("announce", "debug.log")
                .with_name("Announce")
                .with_config("message", "release started"),
        )
        .with_step(
            StepDefinition::new("settle", "time.delay")
                .with_name("Settle")
                .with_config("delay_ms", 250)
                .after("announce"),
        )
        .with_step(
            StepDefinition::new("summary", "transform.merge")
                .with_name("Summarize")
                .with_config("include_parameters", true)
                .depends_on(["announce", "settle"]),
        )
}

fn create_example_workflow(output: &Path) -> Result<()> {
    let json = serde_json::to_string_pretty(&example_workflow())?;
    std::fs::write(output, json)?;

    println!("✨ Created example workflow: {}", output.display());
    println!();
    println!("Run it with:");
    println!(
        "  stepwise run --file {} --parameters '{{\"version\": \"1.0.0\"}}'",
        output.display()
    );

    Ok(())
}
