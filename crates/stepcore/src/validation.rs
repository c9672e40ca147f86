use crate::StepId;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Category of a validation finding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueKind {
    Structure,
    CircularDependency,
    Configuration,
    Security,
    Performance,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationIssue {
    pub kind: IssueKind,
    /// Location inside the definition, e.g. `steps[2].depends_on`.
    pub path: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub step_ids: Vec<StepId>,
}

impl ValidationIssue {
    pub fn new(kind: IssueKind, path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind,
            path: path.into(),
            message: message.into(),
            step_ids: Vec::new(),
        }
    }

    pub fn with_steps(mut self, step_ids: Vec<StepId>) -> Self {
        self.step_ids = step_ids;
        self
    }
}

impl fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.path, self.message)
    }
}

/// Outcome of validating a workflow definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationReport {
    pub valid: bool,
    pub errors: Vec<ValidationIssue>,
    pub warnings: Vec<ValidationIssue>,
}

impl Default for ValidationReport {
    fn default() -> Self {
        Self {
            valid: true,
            errors: Vec::new(),
            warnings: Vec::new(),
        }
    }
}

impl ValidationReport {
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn add_error(&mut self, issue: ValidationIssue) {
        self.errors.push(issue);
        self.valid = false;
    }

    pub fn add_warning(&mut self, issue: ValidationIssue) {
        self.warnings.push(issue);
    }

    pub fn merge(&mut self, other: ValidationReport) {
        for issue in other.errors {
            self.add_error(issue);
        }
        self.warnings.extend(other.warnings);
    }

    pub fn errors_of(&self, kind: IssueKind) -> impl Iterator<Item = &ValidationIssue> {
        self.errors.iter().filter(move |e| e.kind == kind)
    }

    pub fn has_error(&self, kind: IssueKind) -> bool {
        self.errors_of(kind).next().is_some()
    }
}

impl fmt::Display for ValidationReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.errors.is_empty() {
            return write!(f, "valid");
        }
        write!(f, "{} error(s)", self.errors.len())?;
        for (i, issue) in self.errors.iter().enumerate() {
            let sep = if i == 0 { ": " } else { "; " };
            write!(f, "{sep}{issue}")?;
        }
        Ok(())
    }
}
