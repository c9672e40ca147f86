//! Workflow definition validation.
//!
//! Validation is pure: it never mutates the definition and the same input
//! always produces the same report.

use crate::config::ValidationLimits;
use crate::graph::DependencyGraph;
use serde_json::Value;
use std::collections::HashSet;
use stepcore::sanitize::{contains_secret, is_env_reference, is_secret_key};
use stepcore::{IssueKind, ValidationIssue, ValidationReport, WorkflowDefinition};

/// Graph and policy validator for workflow definitions.
#[derive(Debug, Clone, Default)]
pub struct WorkflowValidator {
    limits: ValidationLimits,
}

impl WorkflowValidator {
    pub fn new(limits: ValidationLimits) -> Self {
        Self { limits }
    }

    pub fn limits(&self) -> &ValidationLimits {
        &self.limits
    }

    pub fn validate(&self, definition: &WorkflowDefinition) -> ValidationReport {
        let mut report = ValidationReport::default();

        self.check_structure(definition, &mut report);
        self.check_dependencies(definition, &mut report);
        self.check_configuration(definition, &mut report);
        self.check_security(definition, &mut report);

        report
    }

    fn check_structure(&self, definition: &WorkflowDefinition, report: &mut ValidationReport) {
        let name_len = definition.name.trim().chars().count();
        if name_len == 0 {
            report.add_error(ValidationIssue::new(
                IssueKind::Structure,
                "name",
                "workflow name cannot be empty",
            ));
        } else if definition.name.chars().count() > self.limits.max_name_len {
            report.add_error(ValidationIssue::new(
                IssueKind::Structure,
                "name",
                format!("workflow name exceeds {} characters", self.limits.max_name_len),
            ));
        }

        if definition.steps.is_empty() {
            report.add_error(ValidationIssue::new(
                IssueKind::Structure,
                "steps",
                "workflow must define at least one step",
            ));
        }

        let mut seen = HashSet::new();
        for (i, step) in definition.steps.iter().enumerate() {
            if step.id.trim().is_empty() {
                report.add_error(ValidationIssue::new(
                    IssueKind::Structure,
                    format!("steps[{i}].id"),
                    "step id cannot be empty",
                ));
            } else if !seen.insert(step.id.as_str()) {
                report.add_error(
                    ValidationIssue::new(
                        IssueKind::Structure,
                        format!("steps[{i}].id"),
                        format!("duplicate step id '{}'", step.id),
                    )
                    .with_steps(vec![step.id.clone()]),
                );
            }

            if step.step_type.trim().is_empty() {
                report.add_error(
                    ValidationIssue::new(
                        IssueKind::Structure,
                        format!("steps[{i}].type"),
                        "step type cannot be empty",
                    )
                    .with_steps(vec![step.id.clone()]),
                );
            }

            let mut deps = HashSet::new();
            for dep in &step.depends_on {
                if !deps.insert(dep.as_str()) {
                    report.add_warning(
                        ValidationIssue::new(
                            IssueKind::Structure,
                            format!("steps[{i}].depends_on"),
                            format!("step '{}' lists dependency '{}' more than once", step.id, dep),
                        )
                        .with_steps(vec![step.id.clone()]),
                    );
                }
            }
        }
    }

    fn check_dependencies(&self, definition: &WorkflowDefinition, report: &mut ValidationReport) {
        let graph = DependencyGraph::build(definition);

        for (pos, dep) in &graph.dangling {
            let step = &definition.steps[*pos];
            report.add_error(
                ValidationIssue::new(
                    IssueKind::Structure,
                    format!("steps[{pos}].depends_on"),
                    format!("step '{}' depends on unknown step '{}'", step.id, dep),
                )
                .with_steps(vec![step.id.clone(), dep.to_string()]),
            );
        }

        let visited = graph.kahn_order().len();
        if visited == graph.graph.node_count() {
            return;
        }

        let cycles = graph.cycles();
        let Some(first) = cycles.first() else {
            return;
        };
        let members: Vec<String> = first
            .iter()
            .map(|n| definition.steps[graph.position(*n)].id.clone())
            .collect();

        let mut message = format!("circular dependency between steps: {}", members.join(", "));
        if cycles.len() > 1 {
            message.push_str(&format!(" (and {} more cycle(s))", cycles.len() - 1));
        }
        report.add_error(
            ValidationIssue::new(IssueKind::CircularDependency, "steps", message).with_steps(members),
        );
    }

    fn check_configuration(&self, definition: &WorkflowDefinition, report: &mut ValidationReport) {
        let limits = &self.limits;
        let config = &definition.config;

        if config.timeout_seconds < limits.min_timeout_seconds
            || config.timeout_seconds > limits.max_timeout_seconds
        {
            report.add_error(ValidationIssue::new(
                IssueKind::Configuration,
                "config.timeout_seconds",
                format!(
                    "timeout_seconds must be between {} and {}, got {}",
                    limits.min_timeout_seconds, limits.max_timeout_seconds, config.timeout_seconds
                ),
            ));
        } else if config.timeout_seconds > limits.soft_timeout_seconds {
            report.add_warning(ValidationIssue::new(
                IssueKind::Performance,
                "config.timeout_seconds",
                format!(
                    "timeout_seconds of {} exceeds {}s, long-running workflows hold execution slots",
                    config.timeout_seconds, limits.soft_timeout_seconds
                ),
            ));
        }

        if config.max_retries > limits.max_retries {
            report.add_error(ValidationIssue::new(
                IssueKind::Configuration,
                "config.max_retries",
                format!(
                    "max_retries must be between 0 and {}, got {}",
                    limits.max_retries, config.max_retries
                ),
            ));
        }

        if definition.steps.len() > limits.max_steps {
            report.add_error(ValidationIssue::new(
                IssueKind::Configuration,
                "steps",
                format!(
                    "workflow has {} steps, the maximum is {}",
                    definition.steps.len(),
                    limits.max_steps
                ),
            ));
        }

        match definition.serialized_len() {
            Ok(len) if len > limits.max_serialized_chars => {
                report.add_error(ValidationIssue::new(
                    IssueKind::Configuration,
                    "",
                    format!(
                        "serialized workflow is {} characters, the maximum is {}",
                        len, limits.max_serialized_chars
                    ),
                ));
            }
            Ok(_) => {}
            Err(e) => {
                report.add_error(ValidationIssue::new(
                    IssueKind::Configuration,
                    "",
                    format!("workflow cannot be serialized: {e}"),
                ));
            }
        }
    }

    fn check_security(&self, definition: &WorkflowDefinition, report: &mut ValidationReport) {
        for (i, step) in definition.steps.iter().enumerate() {
            for (key, value) in &step.config {
                let path = format!("steps[{i}].config.{key}");
                scan_value(&step.id, key, value, &path, report);
            }
        }
    }
}

/// Walks a config value, flagging credential-shaped strings and literal
/// values stored under secret-named keys. Never echoes the value itself.
fn scan_value(step_id: &str, key: &str, value: &Value, path: &str, report: &mut ValidationReport) {
    match value {
        Value::String(s) => {
            let literal_secret = is_secret_key(key) && !s.trim().is_empty() && !is_env_reference(s);
            if contains_secret(s) || literal_secret {
                report.add_error(
                    ValidationIssue::new(
                        IssueKind::Security,
                        path,
                        format!(
                            "step '{step_id}' embeds a raw credential in '{key}', reference an environment variable instead"
                        ),
                    )
                    .with_steps(vec![step_id.to_string()]),
                );
            }
        }
        Value::Object(map) => {
            for (k, v) in map {
                scan_value(step_id, k, v, &format!("{path}.{k}"), report);
            }
        }
        Value::Array(items) => {
            for (idx, v) in items.iter().enumerate() {
                scan_value(step_id, key, v, &format!("{path}[{idx}]"), report);
            }
        }
        _ => {}
    }
}
