// Rule compilation and DAG execution

pub mod dag;
pub mod executor;
pub mod rule;
pub mod support;
pub(crate) mod task_executor;

pub use dag::{DependencyGraph, GraphNode};
pub use executor::{AggregateResult, ExecuteOptions, FlowExecutor, Outcome};
pub use rule::RuleParser;
pub use support::{identity_key, ResultKeyFn, TaskResult, TaskSupport};
