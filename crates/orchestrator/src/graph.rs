//! Dependency graph for units
//!
//! Edges point from a dependency to the unit that needs it, so a
//! topological order is an execution order. Uses petgraph for storage and
//! traversal.

use crate::error::{Error, Result};
use crate::unit::UnitId;
use petgraph::Direction;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::Dfs;
use std::collections::{BTreeSet, HashMap};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mark {
    Visiting,
    Done,
}

/// A dependency graph over unit ids
#[derive(Debug, Default)]
pub struct DependencyGraph {
    graph: DiGraph<UnitId, ()>,
    node_map: HashMap<UnitId, NodeIndex>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a graph from `(unit, its dependencies)` pairs.
    ///
    /// Fails with the offending path if the graph has a cycle. `label` names
    /// units in error messages.
    pub fn build<I, L>(edges: I, label: L) -> Result<Self>
    where
        I: IntoIterator<Item = (UnitId, Vec<UnitId>)>,
        L: Fn(UnitId) -> String,
    {
        let edges: Vec<(UnitId, Vec<UnitId>)> = edges.into_iter().collect();
        let mut graph = Self::new();
        for (id, _) in &edges {
            graph.add_unit(*id);
        }
        for (id, deps) in &edges {
            for dep in deps {
                graph.add_dependency(*id, *dep);
            }
        }
        graph.check_acyclic(&label)?;
        Ok(graph)
    }

    pub fn add_unit(&mut self, id: UnitId) {
        if !self.node_map.contains_key(&id) {
            let idx = self.graph.add_node(id);
            self.node_map.insert(id, idx);
        }
    }

    /// Record that `unit` depends on `dependency`
    pub fn add_dependency(&mut self, unit: UnitId, dependency: UnitId) {
        self.add_unit(unit);
        self.add_unit(dependency);
        let from = self.node_map[&dependency];
        let to = self.node_map[&unit];
        if self.graph.find_edge(from, to).is_none() {
            self.graph.add_edge(from, to, ());
        }
    }

    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    /// Reject cycles, reporting the first one found as `a -> b -> a`.
    ///
    /// Depth-first with an explicit stack; depth never exceeds the unit count.
    pub fn check_acyclic(&self, label: &dyn Fn(UnitId) -> String) -> Result<()> {
        let mut marks: HashMap<NodeIndex, Mark> = HashMap::new();
        let limit = self.graph.node_count();

        let mut starts: Vec<NodeIndex> = self.graph.node_indices().collect();
        starts.sort_by_key(|n| self.graph[*n]);

        for start in starts {
            if marks.contains_key(&start) {
                continue;
            }
            // (node, remaining dependencies to visit)
            let mut stack: Vec<(NodeIndex, Vec<NodeIndex>)> = vec![(start, self.dependencies_of(start))];
            marks.insert(start, Mark::Visiting);

            while let Some((node, pending)) = stack.last_mut() {
                let node = *node;
                let Some(next) = pending.pop() else {
                    marks.insert(node, Mark::Done);
                    stack.pop();
                    continue;
                };
                match marks.get(&next) {
                    Some(Mark::Done) => {}
                    Some(Mark::Visiting) => {
                        let pos = stack.iter().position(|(n, _)| *n == next).unwrap_or(0);
                        let mut path: Vec<String> =
                            stack[pos..].iter().map(|(n, _)| label(self.graph[*n])).collect();
                        path.push(label(self.graph[next]));
                        return Err(Error::DependencyCycle {
                            path: path.join(" -> "),
                        });
                    }
                    None => {
                        if stack.len() >= limit {
                            return Err(Error::internal("dependency traversal exceeded unit count"));
                        }
                        marks.insert(next, Mark::Visiting);
                        stack.push((next, self.dependencies_of(next)));
                    }
                }
            }
        }
        Ok(())
    }

    fn dependencies_of(&self, node: NodeIndex) -> Vec<NodeIndex> {
        let mut deps: Vec<NodeIndex> = self
            .graph
            .neighbors_directed(node, Direction::Incoming)
            .collect();
        // Popped from the end, so reverse id order gives ascending visits.
        deps.sort_by_key(|n| std::cmp::Reverse(self.graph[*n]));
        deps
    }

    /// Units grouped into waves: every unit comes after all its dependencies.
    ///
    /// Within a wave units are sorted by id.
    pub fn waves(&self) -> Vec<Vec<UnitId>> {
        let mut level: HashMap<NodeIndex, usize> = HashMap::new();
        let order = match petgraph::algo::toposort(&self.graph, None) {
            Ok(order) => order,
            Err(_) => return Vec::new(),
        };

        let mut waves: Vec<Vec<UnitId>> = Vec::new();
        for node in order {
            let depth = self
                .graph
                .neighbors_directed(node, Direction::Incoming)
                .filter_map(|dep| level.get(&dep))
                .map(|d| d + 1)
                .max()
                .unwrap_or(0);
            level.insert(node, depth);
            if waves.len() <= depth {
                waves.resize_with(depth + 1, Vec::new);
            }
            waves[depth].push(self.graph[node]);
        }
        for wave in &mut waves {
            wave.sort_unstable();
        }
        waves
    }

    /// Every unit that transitively depends on `id`
    pub fn dependents(&self, id: UnitId) -> BTreeSet<UnitId> {
        let Some(&start) = self.node_map.get(&id) else {
            return BTreeSet::new();
        };
        let mut found = BTreeSet::new();
        let mut dfs = Dfs::new(&self.graph, start);
        while let Some(node) = dfs.next(&self.graph) {
            found.insert(self.graph[node]);
        }
        found.remove(&id);
        found
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn label(id: UnitId) -> String {
        ["net.vpc", "net.subnet", "app.web", "app.db"][id].to_string()
    }

    #[test]
    fn test_waves_respect_dependencies() {
        // subnet -> vpc, web -> subnet, db -> vpc
        let graph =
            DependencyGraph::build(vec![(0, vec![]), (1, vec![0]), (2, vec![1, 3]), (3, vec![0])], label)
                .unwrap();
        assert_eq!(graph.waves(), vec![vec![0], vec![1, 3], vec![2]]);
    }

    #[test]
    fn test_cycle_rejected_with_path() {
        let err = DependencyGraph::build(vec![(0, vec![1]), (1, vec![0])], label).unwrap_err();
        assert_eq!(err.to_string(), "dependency cycle detected: net.vpc -> net.subnet -> net.vpc");
    }

    #[test]
    fn test_self_dependency_is_cycle() {
        let err = DependencyGraph::build(vec![(2, vec![2])], label).unwrap_err();
        assert!(matches!(err, Error::DependencyCycle { .. }));
    }

    #[test]
    fn test_shared_ancestor_is_not_cycle() {
        let graph =
            DependencyGraph::build(vec![(0, vec![]), (1, vec![0]), (3, vec![0]), (2, vec![1, 3])], label)
                .unwrap();
        assert_eq!(graph.len(), 4);
    }

    #[test]
    fn test_transitive_dependents() {
        let graph =
            DependencyGraph::build(vec![(0, vec![]), (1, vec![0]), (2, vec![1]), (3, vec![])], label)
                .unwrap();
        assert_eq!(graph.dependents(0), BTreeSet::from([1, 2]));
        assert_eq!(graph.dependents(1), BTreeSet::from([2]));
        assert!(graph.dependents(3).is_empty());
    }
}
