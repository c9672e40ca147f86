use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use std::collections::{HashMap, VecDeque};
use stepcore::WorkflowDefinition;

/// `depends_on` edges of a definition as a petgraph DAG candidate.
///
/// Node weights are declaration positions, and node indices are assigned in
/// declaration order, so iterating indices walks steps as written. Duplicate
/// step ids keep their first declaration; references to unknown steps are
/// collected in `dangling` instead of becoming edges.
pub(crate) struct DependencyGraph<'a> {
    pub graph: DiGraph<usize, ()>,
    pub index: HashMap<&'a str, NodeIndex>,
    pub dangling: Vec<(usize, &'a str)>,
}

impl<'a> DependencyGraph<'a> {
    pub fn build(definition: &'a WorkflowDefinition) -> Self {
        let mut graph = DiGraph::new();
        let mut index = HashMap::new();

        for (pos, step) in definition.steps.iter().enumerate() {
            index.entry(step.id.as_str()).or_insert_with(|| graph.add_node(pos));
        }

        let mut dangling = Vec::new();
        for (pos, step) in definition.steps.iter().enumerate() {
            let to = index[step.id.as_str()];
            if graph[to] != pos {
                continue;
            }
            for dep in &step.depends_on {
                match index.get(dep.as_str()) {
                    Some(&from) => {
                        graph.update_edge(from, to, ());
                    }
                    None => dangling.push((pos, dep.as_str())),
                }
            }
        }

        Self {
            graph,
            index,
            dangling,
        }
    }

    /// Kahn's algorithm, seeded and drained in declaration order. Returns
    /// the visit order; nodes on or behind a cycle are never visited.
    pub fn kahn_order(&self) -> Vec<NodeIndex> {
        let mut in_degree: Vec<usize> = self
            .graph
            .node_indices()
            .map(|n| self.graph.neighbors_directed(n, Direction::Incoming).count())
            .collect();

        let mut queue: VecDeque<NodeIndex> = self
            .graph
            .node_indices()
            .filter(|n| in_degree[n.index()] == 0)
            .collect();

        let mut order = Vec::with_capacity(self.graph.node_count());
        while let Some(node) = queue.pop_front() {
            order.push(node);
            let mut successors: Vec<NodeIndex> =
                self.graph.neighbors_directed(node, Direction::Outgoing).collect();
            successors.sort();
            for next in successors {
                in_degree[next.index()] -= 1;
                if in_degree[next.index()] == 0 {
                    queue.push_back(next);
                }
            }
        }
        order
    }

    /// Strongly connected components that contain a cycle, each sorted by
    /// declaration order, ordered by their first-declared member.
    pub fn cycles(&self) -> Vec<Vec<NodeIndex>> {
        let mut cycles: Vec<Vec<NodeIndex>> = petgraph::algo::tarjan_scc(&self.graph)
            .into_iter()
            .filter(|scc| scc.len() > 1 || self.graph.contains_edge(scc[0], scc[0]))
            .map(|mut scc| {
                scc.sort();
                scc
            })
            .collect();
        cycles.sort_by_key(|scc| scc[0]);
        cycles
    }

    pub fn position(&self, node: NodeIndex) -> usize {
        self.graph[node]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stepcore::StepDefinition;

    fn ids(def: &WorkflowDefinition, g: &DependencyGraph<'_>, nodes: &[NodeIndex]) -> Vec<String> {
        nodes.iter().map(|n| def.steps[g.position(*n)].id.clone()).collect()
    }

    #[test]
    fn kahn_visits_all_nodes_of_a_dag() {
        let def = WorkflowDefinition::new("wf")
            .with_step(StepDefinition::new("c", "x").depends_on(["a", "b"]))
            .with_step(StepDefinition::new("a", "x"))
            .with_step(StepDefinition::new("b", "x").after("a"));
        let g = DependencyGraph::build(&def);
        assert_eq!(ids(&def, &g, &g.kahn_order()), vec!["a", "b", "c"]);
        assert!(g.cycles().is_empty());
    }

    #[test]
    fn cycles_are_reported_in_declaration_order() {
        let def = WorkflowDefinition::new("wf")
            .with_step(StepDefinition::new("start", "x"))
            .with_step(StepDefinition::new("p", "x").depends_on(["start", "r"]))
            .with_step(StepDefinition::new("q", "x").after("p"))
            .with_step(StepDefinition::new("r", "x").after("q"))
            .with_step(StepDefinition::new("tail", "x").after("r"));
        let g = DependencyGraph::build(&def);

        assert_eq!(ids(&def, &g, &g.kahn_order()), vec!["start"]);
        let cycles = g.cycles();
        assert_eq!(cycles.len(), 1);
        assert_eq!(ids(&def, &g, &cycles[0]), vec!["p", "q", "r"]);
    }

    #[test]
    fn self_dependency_is_a_cycle_and_unknown_refs_dangle() {
        let def = WorkflowDefinition::new("wf")
            .with_step(StepDefinition::new("loop", "x").after("loop"))
            .with_step(StepDefinition::new("orphan", "x").after("ghost"));
        let g = DependencyGraph::build(&def);
        assert_eq!(g.cycles().len(), 1);
        assert_eq!(g.dangling, vec![(1, "ghost")]);
    }
}
