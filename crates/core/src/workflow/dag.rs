use crate::error::{EngineError, EngineResult};
use crate::task::TaskDefinition;
use petgraph::algo::{tarjan_scc, toposort};
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use std::collections::HashMap;
use std::sync::Arc;

/// A task's place in a compiled graph
pub struct GraphNode<P> {
    task: Arc<TaskDefinition<P>>,
}

impl<P> GraphNode<P> {
    pub fn task(&self) -> &Arc<TaskDefinition<P>> {
        &self.task
    }

    pub fn name(&self) -> &str {
        self.task.name()
    }
}

/// Compiled, validated dependency graph of one rule
///
/// Immutable once built; concurrent invocations share it read-only.
pub struct DependencyGraph<P> {
    name: String,
    graph: DiGraph<GraphNode<P>, ()>,
    indices: HashMap<String, NodeIndex>,
    entries: Vec<NodeIndex>,
}

impl<P> DependencyGraph<P> {
    pub(crate) fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            graph: DiGraph::new(),
            indices: HashMap::new(),
            entries: Vec::new(),
        }
    }

    /// Add a task node; adding the same task twice returns the existing node
    pub(crate) fn add_task(&mut self, task: Arc<TaskDefinition<P>>) -> NodeIndex {
        if let Some(&idx) = self.indices.get(task.name()) {
            return idx;
        }
        let name = task.name().to_string();
        let idx = self.graph.add_node(GraphNode { task });
        self.indices.insert(name, idx);
        idx
    }

    /// Add an edge `from -> to`; re-declaring an edge is a no-op
    pub(crate) fn add_edge(&mut self, from: NodeIndex, to: NodeIndex) {
        self.graph.update_edge(from, to, ());
    }

    /// Reject cycles and compute the entry nodes
    pub(crate) fn finish(mut self) -> EngineResult<Self> {
        if self.graph.node_count() == 0 {
            return Err(EngineError::EmptyRule(self.name));
        }

        if toposort(&self.graph, None).is_err() {
            let mut tasks: Vec<String> = tarjan_scc(&self.graph)
                .into_iter()
                .filter(|component| {
                    component.len() > 1
                        || self.graph.find_edge(component[0], component[0]).is_some()
                })
                .flatten()
                .map(|idx| self.graph[idx].name().to_string())
                .collect();
            tasks.sort();
            return Err(EngineError::CyclicDependency {
                rule: self.name,
                tasks,
            });
        }

        self.entries = self
            .graph
            .node_indices()
            .filter(|&idx| self.in_degree(idx) == 0)
            .collect();

        Ok(self)
    }

    /// Rule name this graph was compiled from
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    pub fn contains(&self, task: &str) -> bool {
        self.indices.contains_key(task)
    }

    pub fn node(&self, task: &str) -> Option<&GraphNode<P>> {
        self.indices.get(task).map(|&idx| &self.graph[idx])
    }

    pub fn edge_count(&self) -> usize {
        self.graph.edge_count()
    }

    /// Tasks with no predecessors, in declaration order
    pub fn entry_names(&self) -> Vec<&str> {
        self.entries
            .iter()
            .map(|&idx| self.graph[idx].name())
            .collect()
    }

    /// Direct predecessors of a task
    pub fn predecessors(&self, task: &str) -> Vec<&str> {
        self.neighbors_by_name(task, Direction::Incoming)
    }

    /// Direct successors of a task
    pub fn successors(&self, task: &str) -> Vec<&str> {
        self.neighbors_by_name(task, Direction::Outgoing)
    }

    /// Task names in a dependency-respecting order
    pub fn topological_order(&self) -> Vec<&str> {
        toposort(&self.graph, None)
            .map(|order| order.into_iter().map(|idx| self.graph[idx].name()).collect())
            .unwrap_or_default()
    }

    /// All task names, in declaration order
    pub fn task_names(&self) -> Vec<&str> {
        self.graph
            .node_indices()
            .map(|idx| self.graph[idx].name())
            .collect()
    }

    fn neighbors_by_name(&self, task: &str, direction: Direction) -> Vec<&str> {
        let Some(&idx) = self.indices.get(task) else {
            return Vec::new();
        };
        let mut names: Vec<&str> = self
            .graph
            .neighbors_directed(idx, direction)
            .map(|n| self.graph[n].name())
            .collect();
        names.sort_unstable();
        names
    }

    pub(crate) fn index_of(&self, task: &str) -> Option<NodeIndex> {
        self.indices.get(task).copied()
    }

    pub(crate) fn entries(&self) -> &[NodeIndex] {
        &self.entries
    }

    pub(crate) fn node_indices(&self) -> impl Iterator<Item = NodeIndex> + '_ {
        self.graph.node_indices()
    }

    pub(crate) fn task_at(&self, idx: NodeIndex) -> &Arc<TaskDefinition<P>> {
        &self.graph[idx].task
    }

    pub(crate) fn in_degree(&self, idx: NodeIndex) -> usize {
        self.graph.neighbors_directed(idx, Direction::Incoming).count()
    }

    pub(crate) fn successor_indices(&self, idx: NodeIndex) -> impl Iterator<Item = NodeIndex> + '_ {
        self.graph.neighbors_directed(idx, Direction::Outgoing)
    }
}

impl<P> std::fmt::Debug for DependencyGraph<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DependencyGraph")
            .field("name", &self.name)
            .field("tasks", &self.task_names())
            .field("edges", &self.graph.edge_count())
            .finish()
    }
}
