//! Rule parsing: turns `A->B->C;B->D` into a validated [`DependencyGraph`].
//!
//! A rule is a list of statements separated by the statement delimiter. Each statement is a
//! chain of positions separated by the edge delimiter; each position holds one task name or a
//! comma-separated group of names. Every task at one position precedes every task at the next.

use super::dag::DependencyGraph;
use crate::config::{EngineConfig, PARALLEL_MARKER};
use crate::error::{EngineError, EngineResult};
use crate::registry::TaskRegistry;

/// One statement: positions in chain order, each a group of task names
pub type Chain = Vec<Vec<String>>;

#[derive(Debug, Clone)]
pub struct RuleParser {
    split: String,
    point: String,
}

impl RuleParser {
    pub fn new(split: impl Into<String>, point: impl Into<String>) -> Self {
        Self {
            split: split.into(),
            point: point.into(),
        }
    }

    pub fn from_config(config: &EngineConfig) -> Self {
        Self::new(config.split.clone(), config.point.clone())
    }

    /// Split rule text into chains; blank statements and blank names are dropped
    pub fn parse(&self, content: &str) -> Vec<Chain> {
        content
            .split(self.split.as_str())
            .map(|statement| {
                statement
                    .split(self.point.as_str())
                    .map(|position| {
                        position
                            .split(PARALLEL_MARKER)
                            .map(str::trim)
                            .filter(|name| !name.is_empty())
                            .map(str::to_string)
                            .collect::<Vec<_>>()
                    })
                    .filter(|group| !group.is_empty())
                    .collect::<Chain>()
            })
            .filter(|chain| !chain.is_empty())
            .collect()
    }

    /// Compile rule text against the registry
    pub fn compile<P>(
        &self,
        rule: &str,
        content: &str,
        registry: &TaskRegistry<P>,
    ) -> EngineResult<DependencyGraph<P>> {
        let mut graph = DependencyGraph::new(rule);

        for chain in self.parse(content) {
            let mut previous = Vec::new();
            for group in chain {
                let mut current = Vec::with_capacity(group.len());
                for name in group {
                    let task = registry.get(&name).ok_or_else(|| EngineError::UnknownTask {
                        rule: rule.to_string(),
                        task: name.clone(),
                    })?;
                    current.push(graph.add_task(task));
                }
                for &from in &previous {
                    for &to in &current {
                        graph.add_edge(from, to);
                    }
                }
                previous = current;
            }
        }

        let graph = graph.finish()?;
        tracing::debug!(
            rule = %rule,
            tasks = graph.len(),
            edges = graph.edge_count(),
            "compiled rule"
        );
        Ok(graph)
    }
}

impl Default for RuleParser {
    fn default() -> Self {
        Self::from_config(&EngineConfig::default())
    }
}
