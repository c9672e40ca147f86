use std::collections::HashMap;
use std::sync::Arc;
use stepcore::{Action, ActionError, IssueKind, ValidationIssue, ValidationReport, WorkflowDefinition};

/// Metadata about an action type
#[derive(Debug, Clone)]
pub struct ActionMetadata {
    pub description: String,
    pub category: String,
}

impl Default for ActionMetadata {
    fn default() -> Self {
        Self {
            description: String::new(),
            category: "general".to_string(),
        }
    }
}

impl ActionMetadata {
    pub fn new(category: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            category: category.into(),
        }
    }
}

struct Registered {
    action: Arc<dyn Action>,
    metadata: ActionMetadata,
}

/// Registry of available action types, keyed by step-type identifier
pub struct ActionRegistry {
    actions: HashMap<String, Registered>,
}

impl ActionRegistry {
    pub fn new() -> Self {
        Self {
            actions: HashMap::new(),
        }
    }

    /// Register an action under its own `action_type()`
    pub fn register(&mut self, action: Arc<dyn Action>) {
        self.register_with(action, ActionMetadata::default());
    }

    pub fn register_with(&mut self, action: Arc<dyn Action>, metadata: ActionMetadata) {
        let action_type = action.action_type().to_string();
        tracing::info!(action_type = %action_type, "Registering action type");
        if self
            .actions
            .insert(action_type.clone(), Registered { action, metadata })
            .is_some()
        {
            tracing::warn!(action_type = %action_type, "Replaced previously registered action");
        }
    }

    /// Resolve a step type to its action
    pub fn get(&self, action_type: &str) -> Result<Arc<dyn Action>, ActionError> {
        self.actions
            .get(action_type)
            .map(|r| r.action.clone())
            .ok_or_else(|| ActionError::UnknownAction(action_type.to_string()))
    }

    pub fn contains(&self, action_type: &str) -> bool {
        self.actions.contains_key(action_type)
    }

    /// Get all registered action types, sorted
    pub fn list_action_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.actions.keys().cloned().collect();
        types.sort();
        types
    }

    pub fn get_metadata(&self, action_type: &str) -> Option<ActionMetadata> {
        self.actions.get(action_type).map(|r| r.metadata.clone())
    }

    /// Check that every step resolves to a registered action that accepts
    /// its configuration.
    pub fn check_definition(&self, definition: &WorkflowDefinition) -> ValidationReport {
        let mut report = ValidationReport::default();

        for (i, step) in definition.steps.iter().enumerate() {
            let Some(registered) = self.actions.get(&step.step_type) else {
                if !step.step_type.is_empty() {
                    report.add_error(
                        ValidationIssue::new(
                            IssueKind::Structure,
                            format!("steps[{i}].type"),
                            format!("unknown step type '{}'", step.step_type),
                        )
                        .with_steps(vec![step.id.clone()]),
                    );
                }
                continue;
            };

            if let Err(e) = registered.action.validate_config(&step.config) {
                report.add_error(
                    ValidationIssue::new(
                        IssueKind::Configuration,
                        format!("steps[{i}].config"),
                        stepcore::sanitize(&e.to_string()),
                    )
                    .with_steps(vec![step.id.clone()]),
                );
            }
        }

        report
    }
}

impl Default for ActionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use stepcore::{require_str, ActionContext, ActionOutput, StepConfig, StepDefinition};

    struct Notify;

    #[async_trait]
    impl Action for Notify {
        fn action_type(&self) -> &str {
            "chat.notify"
        }

        async fn run(&self, _config: &StepConfig, _ctx: ActionContext) -> Result<ActionOutput, ActionError> {
            Ok(ActionOutput::new())
        }

        fn validate_config(&self, config: &StepConfig) -> Result<(), ActionError> {
            require_str(config, "channel").map(|_| ())
        }
    }

    fn registry() -> ActionRegistry {
        let mut registry = ActionRegistry::new();
        registry.register_with(Arc::new(Notify), ActionMetadata::new("chat", "Post a message"));
        registry
    }

    #[test]
    fn resolves_registered_types() {
        let registry = registry();
        assert!(registry.get("chat.notify").is_ok());
        assert_eq!(
            registry.get("ai.review").err(),
            Some(ActionError::UnknownAction("ai.review".into()))
        );
        assert_eq!(registry.list_action_types(), vec!["chat.notify".to_string()]);
        assert_eq!(registry.get_metadata("chat.notify").unwrap().category, "chat");
    }

    #[test]
    fn check_definition_flags_unknown_types_and_bad_config() {
        let def = WorkflowDefinition::new("wf")
            .with_step(StepDefinition::new("a", "chat.notify").with_config("channel", "#ops"))
            .with_step(StepDefinition::new("b", "chat.notify"))
            .with_step(StepDefinition::new("c", "ai.review"));

        let report = registry().check_definition(&def);
        assert!(!report.is_valid());
        assert_eq!(report.errors.len(), 2);
        assert_eq!(report.errors[0].kind, IssueKind::Configuration);
        assert_eq!(report.errors[0].step_ids, vec!["b".to_string()]);
        assert_eq!(report.errors[1].kind, IssueKind::Structure);
        assert_eq!(report.errors[1].path, "steps[2].type");
    }
}
