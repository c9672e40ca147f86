use serde_json::{json, Map, Value};
use std::sync::Arc;
use stepcore::{ExecutionStatus, StepDefinition, WorkflowDefinition};
use stepruntime::{ActionRegistry, EngineConfig, ExecutionSupervisor};

fn supervisor() -> ExecutionSupervisor {
    let mut registry = ActionRegistry::new();
    stepactions::register_all(&mut registry);
    ExecutionSupervisor::new(EngineConfig::default(), Arc::new(registry))
}

#[tokio::test]
async fn builtin_actions_compose() {
    let supervisor = supervisor();
    let def = WorkflowDefinition::new("release-notes")
        .with_step(StepDefinition::new("announce", "debug.log").with_config("message", "release started"))
        .with_step(
            StepDefinition::new("settle", "time.delay")
                .with_config("delay_ms", 10)
                .after("announce"),
        )
        .with_step(
            StepDefinition::new("summary", "transform.merge")
                .with_config("with", json!({"version": "1.4.0"}))
                .with_config("include_parameters", true)
                .depends_on(["announce", "settle"]),
        );
    supervisor.create_workflow(def).unwrap();

    let mut params = Map::new();
    params.insert("channel".into(), json!("#releases"));
    let id = supervisor.execute("release-notes", Value::Null, params).unwrap();
    let exec = supervisor.wait(id).await.unwrap();

    assert_eq!(exec.status, ExecutionStatus::Completed);
    let summary = exec.step("summary").unwrap().output.clone().unwrap();
    assert_eq!(summary["message"], json!("release started"));
    assert_eq!(summary["version"], json!("1.4.0"));
    assert_eq!(summary["parameters"]["channel"], json!("#releases"));
}

#[tokio::test]
async fn invalid_builtin_config_is_rejected_at_registration() {
    let supervisor = supervisor();
    let def = WorkflowDefinition::new("bad-hook")
        .with_step(StepDefinition::new("hook", "http.webhook").with_config("url", "ftp://example.com"));

    let err = supervisor.create_workflow(def).unwrap_err();
    assert_eq!(err.kind(), "validation_error");
}

#[tokio::test]
async fn delay_is_cut_short_by_the_execution_timeout() {
    let supervisor = supervisor();
    let def = WorkflowDefinition::new("slow")
        .with_timeout(1)
        .with_step(StepDefinition::new("nap", "time.delay").with_config("delay_ms", 30_000));
    supervisor.create_workflow(def).unwrap();

    let id = supervisor.execute("slow", Value::Null, Map::new()).unwrap();
    let exec = tokio::time::timeout(std::time::Duration::from_secs(3), supervisor.wait(id))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(exec.status, ExecutionStatus::Timeout);
}
