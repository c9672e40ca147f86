use crate::graph::DependencyGraph;
use std::collections::HashMap;
use stepcore::{
    FlowError, IssueKind, StepId, ValidationIssue, ValidationReport, WorkflowDefinition,
};

/// Dependency levels of a validated definition.
///
/// A step's level is one more than the highest level among its
/// predecessors; roots sit at level 0. Steps inside a level keep their
/// declaration order.
#[derive(Debug, Clone)]
pub struct ExecutionPlan {
    levels: Vec<Vec<StepId>>,
    level_of: HashMap<StepId, usize>,
}

impl ExecutionPlan {
    pub fn build(definition: &WorkflowDefinition) -> Result<Self, FlowError> {
        let graph = DependencyGraph::build(definition);
        let order = graph.kahn_order();

        if order.len() < graph.graph.node_count() {
            let mut report = ValidationReport::default();
            let members: Vec<StepId> = graph
                .cycles()
                .first()
                .map(|scc| {
                    scc.iter()
                        .map(|n| definition.steps[graph.position(*n)].id.clone())
                        .collect()
                })
                .unwrap_or_default();
            report.add_error(
                ValidationIssue::new(
                    IssueKind::CircularDependency,
                    "steps",
                    format!("circular dependency between steps: {}", members.join(", ")),
                )
                .with_steps(members),
            );
            return Err(FlowError::Validation(report));
        }

        let mut depth = vec![0usize; graph.graph.node_count()];
        for node in &order {
            let level = graph
                .graph
                .neighbors_directed(*node, petgraph::Direction::Incoming)
                .map(|pred| depth[pred.index()] + 1)
                .max()
                .unwrap_or(0);
            depth[node.index()] = level;
        }

        let mut levels: Vec<Vec<StepId>> = Vec::new();
        let mut level_of = HashMap::new();
        for node in graph.graph.node_indices() {
            let level = depth[node.index()];
            if levels.len() <= level {
                levels.resize_with(level + 1, Vec::new);
            }
            let id = definition.steps[graph.position(node)].id.clone();
            levels[level].push(id.clone());
            level_of.insert(id, level);
        }

        Ok(Self { levels, level_of })
    }

    pub fn levels(&self) -> &[Vec<StepId>] {
        &self.levels
    }

    pub fn level_of(&self, step_id: &str) -> Option<usize> {
        self.level_of.get(step_id).copied()
    }

    pub fn step_count(&self) -> usize {
        self.level_of.len()
    }
}
