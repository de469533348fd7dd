//! Error types for the orchestration engine.

use std::time::Duration;

/// Result type for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;

/// Errors raised while compiling rules, registering tasks or running flows.
///
/// Compile and registration errors abort startup or reload. Task-level errors are
/// recorded in the invocation's results and never cross a worker boundary as panics.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EngineError {
    /// A rule references a task that was never registered.
    #[error("rule '{rule}' references unknown task '{task}'")]
    UnknownTask { rule: String, task: String },

    /// A rule's edges form a cycle.
    #[error("rule '{rule}' contains a dependency cycle through: {}", tasks.join(", "))]
    CyclicDependency { rule: String, tasks: Vec<String> },

    /// Two task definitions share the same name.
    #[error("task '{0}' is already registered")]
    DuplicateTaskName(String),

    /// A rule declares no task at all.
    #[error("rule '{0}' declares no tasks")]
    EmptyRule(String),

    /// No rule with this name is loaded.
    #[error("no flow named '{0}'")]
    UnknownFlow(String),

    /// More than one implementation was supplied for an interceptor point.
    #[error("more than one {0} interceptor registered")]
    DuplicateInterceptor(&'static str),

    /// The task's pool was saturated or shut down.
    #[error("pool '{pool}' rejected task '{task}'")]
    DispatchRejected { pool: String, task: String },

    /// The task body returned an error or panicked.
    #[error("task '{task}' failed: {message}")]
    TaskExecution { task: String, message: String },

    /// A single attempt exceeded the task's timeout.
    #[error("task '{task}' timed out after {timeout:?}")]
    TaskTimeout { task: String, timeout: Duration },

    /// The whole invocation exceeded its timeout.
    #[error("flow '{flow}' did not finish within {timeout:?}")]
    WholeFlowTimeout { flow: String, timeout: Duration },

    /// A task or interceptor called `stop()`.
    #[error("flow interrupted by task '{task}': {reason}")]
    InterruptedByCallback { task: String, reason: String },

    /// A worker pool runtime could not be created.
    #[error("failed to start pool '{pool}': {message}")]
    PoolSetup { pool: String, message: String },

    /// Invalid engine or task configuration.
    #[error("configuration error: {0}")]
    Config(String),
}

impl EngineError {
    /// Errors that abort engine startup or rule reload.
    pub fn is_compile_error(&self) -> bool {
        matches!(
            self,
            Self::UnknownTask { .. }
                | Self::CyclicDependency { .. }
                | Self::DuplicateTaskName(_)
                | Self::EmptyRule(_)
                | Self::DuplicateInterceptor(_)
                | Self::Config(_)
        )
    }

    /// Errors that end an invocation as interrupted.
    pub fn is_interruption(&self) -> bool {
        matches!(
            self,
            Self::WholeFlowTimeout { .. } | Self::InterruptedByCallback { .. }
        )
    }

    /// Build a task execution error from a task body failure, keeping the cause chain.
    pub(crate) fn task_failed(task: &str, error: &anyhow::Error) -> Self {
        Self::TaskExecution {
            task: task.to_string(),
            message: format!("{:#}", error),
        }
    }
}
