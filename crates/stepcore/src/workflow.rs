use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub type WorkflowId = String;
pub type StepId = String;

/// Free-form configuration handed to a step's action.
pub type StepConfig = Map<String, Value>;

/// Complete workflow definition. The name is the workflow's identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    pub name: WorkflowId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub trigger: TriggerKind,
    #[serde(default)]
    pub config: WorkflowConfig,
    #[serde(default)]
    pub steps: Vec<StepDefinition>,
}

impl WorkflowDefinition {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: None,
            trigger: TriggerKind::default(),
            config: WorkflowConfig::default(),
            steps: Vec::new(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_trigger(mut self, trigger: TriggerKind) -> Self {
        self.trigger = trigger;
        self
    }

    pub fn with_config(mut self, config: WorkflowConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_timeout(mut self, timeout_seconds: u64) -> Self {
        self.config.timeout_seconds = timeout_seconds;
        self
    }

    pub fn with_retries(mut self, max_retries: u32) -> Self {
        self.config.max_retries = max_retries;
        self.config.retry_on_failure = max_retries > 0;
        self
    }

    pub fn with_step(mut self, step: StepDefinition) -> Self {
        self.steps.push(step);
        self
    }

    pub fn add_step(&mut self, step: StepDefinition) -> StepId {
        let id = step.id.clone();
        self.steps.push(step);
        id
    }

    /// Removes a step and returns it. Other steps' `depends_on` are left
    /// untouched, so dangling references surface on re-validation.
    pub fn remove_step(&mut self, id: &str) -> Option<StepDefinition> {
        let pos = self.steps.iter().position(|s| s.id == id)?;
        Some(self.steps.remove(pos))
    }

    pub fn find_step(&self, id: &str) -> Option<&StepDefinition> {
        self.steps.iter().find(|s| s.id == id)
    }

    pub fn step_ids(&self) -> impl Iterator<Item = &str> {
        self.steps.iter().map(|s| s.id.as_str())
    }

    /// Steps that list `id` among their dependencies.
    pub fn dependents_of<'a>(&'a self, id: &'a str) -> impl Iterator<Item = &'a StepDefinition> {
        self.steps
            .iter()
            .filter(move |s| s.depends_on.iter().any(|d| d == id))
    }

    /// Length of the canonical JSON encoding, in characters.
    pub fn serialized_len(&self) -> Result<usize, serde_json::Error> {
        Ok(serde_json::to_string(self)?.chars().count())
    }
}

/// A single step within a workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepDefinition {
    pub id: StepId,
    #[serde(rename = "type", alias = "step_type")]
    pub step_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default)]
    pub config: StepConfig,
    #[serde(default)]
    pub depends_on: Vec<StepId>,
    /// Run even when a predecessor failed or was skipped.
    #[serde(default, skip_serializing_if = "is_false")]
    pub always_run: bool,
}

fn is_false(b: &bool) -> bool {
    !*b
}

impl StepDefinition {
    pub fn new(id: impl Into<String>, step_type: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            step_type: step_type.into(),
            name: None,
            config: Map::new(),
            depends_on: Vec::new(),
            always_run: false,
        }
    }

    pub fn with_config(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.config.insert(key.into(), value.into());
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn depends_on<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.depends_on.extend(ids.into_iter().map(Into::into));
        self
    }

    pub fn after(self, id: impl Into<String>) -> Self {
        self.depends_on([id.into()])
    }

    pub fn always_run(mut self) -> Self {
        self.always_run = true;
        self
    }
}

/// How a workflow gets started.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerKind {
    #[default]
    Manual,
    Event,
    Schedule,
    Webhook,
}

/// Execution policy shared by every step of a workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkflowConfig {
    pub timeout_seconds: u64,
    pub max_retries: u32,
    pub retry_on_failure: bool,
    pub parallel: bool,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            timeout_seconds: 300,
            max_retries: 3,
            retry_on_failure: true,
            parallel: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn review_workflow() -> WorkflowDefinition {
        WorkflowDefinition::new("code-review")
            .with_trigger(TriggerKind::Webhook)
            .with_step(StepDefinition::new("analyze", "ai.analyze").with_config("model", "gpt-4"))
            .with_step(StepDefinition::new("issue", "tracker.create_issue").after("analyze"))
            .with_step(
                StepDefinition::new("notify", "chat.notify")
                    .depends_on(["analyze", "issue"])
                    .always_run(),
            )
    }

    #[test]
    fn deserializes_with_defaults() {
        let json = r#"{
            "name": "nightly",
            "steps": [
                {"id": "lint", "type": "quality.lint"},
                {"id": "report", "type": "chat.notify", "depends_on": ["lint"]}
            ]
        }"#;
        let wf: WorkflowDefinition = serde_json::from_str(json).unwrap();
        assert_eq!(wf.trigger, TriggerKind::Manual);
        assert_eq!(wf.config, WorkflowConfig::default());
        assert_eq!(wf.steps[1].depends_on, vec!["lint".to_string()]);
        assert!(!wf.steps[1].always_run);
    }

    #[test]
    fn dependents_are_found_by_reference() {
        let wf = review_workflow();
        let dependents: Vec<_> = wf.dependents_of("analyze").map(|s| s.id.as_str()).collect();
        assert_eq!(dependents, vec!["issue", "notify"]);
    }

    #[test]
    fn remove_step_keeps_references() {
        let mut wf = review_workflow();
        let removed = wf.remove_step("issue").unwrap();
        assert_eq!(removed.step_type, "tracker.create_issue");
        assert!(wf.find_step("issue").is_none());
        assert!(wf.find_step("notify").unwrap().depends_on.contains(&"issue".to_string()));
    }

    proptest! {
        #[test]
        fn json_round_trip_preserves_graph(edges in proptest::collection::vec((0usize..8, 0usize..8), 0..16)) {
            let mut wf = WorkflowDefinition::new("generated");
            for i in 0..8 {
                wf.add_step(StepDefinition::new(format!("s{i}"), "debug.log"));
            }
            for (from, to) in edges {
                if from < to {
                    let dep = format!("s{from}");
                    wf.steps[to].depends_on.push(dep);
                }
            }

            let json = serde_json::to_string(&wf).unwrap();
            let back: WorkflowDefinition = serde_json::from_str(&json).unwrap();
            prop_assert_eq!(back, wf);
        }
    }
}
