use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use stepcore::{FlowError, NotFoundError, WorkflowDefinition};

/// A registered workflow together with its bookkeeping.
#[derive(Debug, Clone, Serialize)]
pub struct StoredWorkflow {
    pub definition: Arc<WorkflowDefinition>,
    /// The last validation of this exact definition passed.
    pub validated: bool,
    /// Bumped on every replace; used for optimistic updates.
    pub revision: u64,
    pub updated_at: DateTime<Utc>,
}

/// Storage for workflow definitions, keyed by name.
pub trait WorkflowStore: Send + Sync {
    /// Fails with [`FlowError::Duplicate`] if the name is taken.
    fn insert(&self, definition: WorkflowDefinition, validated: bool) -> Result<StoredWorkflow, FlowError>;

    fn get(&self, name: &str) -> Option<StoredWorkflow>;

    /// Swap in a new definition if nobody replaced it since `expected_revision`.
    fn replace(
        &self,
        definition: WorkflowDefinition,
        expected_revision: u64,
        validated: bool,
    ) -> Result<StoredWorkflow, FlowError>;

    /// Record a passing validation, unless the definition changed meanwhile.
    fn mark_validated(&self, name: &str, revision: u64) -> bool;

    fn remove(&self, name: &str) -> Option<StoredWorkflow>;

    /// All workflows, sorted by name.
    fn list(&self) -> Vec<StoredWorkflow>;
}

/// In-memory store behind a read-write lock.
#[derive(Default)]
pub struct MemoryWorkflowStore {
    workflows: RwLock<HashMap<String, StoredWorkflow>>,
}

impl MemoryWorkflowStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl WorkflowStore for MemoryWorkflowStore {
    fn insert(&self, definition: WorkflowDefinition, validated: bool) -> Result<StoredWorkflow, FlowError> {
        let mut workflows = self.workflows.write();
        if workflows.contains_key(&definition.name) {
            return Err(FlowError::Duplicate(definition.name));
        }
        let stored = StoredWorkflow {
            definition: Arc::new(definition),
            validated,
            revision: 1,
            updated_at: Utc::now(),
        };
        workflows.insert(stored.definition.name.clone(), stored.clone());
        Ok(stored)
    }

    fn get(&self, name: &str) -> Option<StoredWorkflow> {
        self.workflows.read().get(name).cloned()
    }

    fn replace(
        &self,
        definition: WorkflowDefinition,
        expected_revision: u64,
        validated: bool,
    ) -> Result<StoredWorkflow, FlowError> {
        let mut workflows = self.workflows.write();
        let current = workflows
            .get_mut(&definition.name)
            .ok_or_else(|| NotFoundError::Workflow(definition.name.clone()))?;
        if current.revision != expected_revision {
            return Err(FlowError::Conflict(format!(
                "workflow '{}' was modified concurrently (revision {} != {})",
                definition.name, current.revision, expected_revision
            )));
        }
        current.definition = Arc::new(definition);
        current.validated = validated;
        current.revision += 1;
        current.updated_at = Utc::now();
        Ok(current.clone())
    }

    fn mark_validated(&self, name: &str, revision: u64) -> bool {
        match self.workflows.write().get_mut(name) {
            Some(stored) if stored.revision == revision => {
                stored.validated = true;
                true
            }
            _ => false,
        }
    }

    fn remove(&self, name: &str) -> Option<StoredWorkflow> {
        self.workflows.write().remove(name)
    }

    fn list(&self) -> Vec<StoredWorkflow> {
        let mut all: Vec<StoredWorkflow> = self.workflows.read().values().cloned().collect();
        all.sort_by(|a, b| a.definition.name.cmp(&b.definition.name));
        all
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stepcore::StepDefinition;

    fn def(name: &str) -> WorkflowDefinition {
        WorkflowDefinition::new(name).with_step(StepDefinition::new("a", "debug.log"))
    }

    #[test]
    fn insert_rejects_duplicates() {
        let store = MemoryWorkflowStore::new();
        store.insert(def("deploy"), true).unwrap();
        let err = store.insert(def("deploy"), true).unwrap_err();
        assert_eq!(err.kind(), "duplicate");
        assert_eq!(store.list().len(), 1);
    }

    #[test]
    fn replace_is_optimistic() {
        let store = MemoryWorkflowStore::new();
        let stored = store.insert(def("deploy"), true).unwrap();

        let updated = def("deploy").with_step(StepDefinition::new("b", "debug.log").after("a"));
        let replaced = store.replace(updated.clone(), stored.revision, true).unwrap();
        assert_eq!(replaced.revision, 2);
        assert_eq!(replaced.definition.steps.len(), 2);

        let err = store.replace(updated, stored.revision, true).unwrap_err();
        assert_eq!(err.kind(), "conflict");

        let err = store.replace(def("missing"), 1, true).unwrap_err();
        assert_eq!(err.kind(), "not_found");
    }

    #[test]
    fn mark_validated_respects_revision() {
        let store = MemoryWorkflowStore::new();
        let stored = store.insert(def("nightly"), false).unwrap();
        assert!(!store.mark_validated("nightly", stored.revision + 1));
        assert!(!store.get("nightly").unwrap().validated);
        assert!(store.mark_validated("nightly", stored.revision));
        assert!(store.get("nightly").unwrap().validated);
    }

    #[test]
    fn list_is_sorted_and_remove_returns_entry() {
        let store = MemoryWorkflowStore::new();
        for name in ["zeta", "alpha", "mid"] {
            store.insert(def(name), true).unwrap();
        }
        let names: Vec<_> = store.list().into_iter().map(|s| s.definition.name.clone()).collect();
        assert_eq!(names, vec!["alpha", "mid", "zeta"]);
        assert!(store.remove("mid").is_some());
        assert!(store.remove("mid").is_none());
    }
}
