use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for one flow invocation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ExecutionId(pub Uuid);

impl ExecutionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ExecutionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ExecutionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Status of a flow invocation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvocationState {
    Pending,
    Running,
    /// Every task reached a terminal state and none failed
    Completed,
    /// Every task reached a terminal state, at least one failed
    Failed,
    /// Stopped by a callback or by the whole-flow timeout
    Interrupted,
}

/// Why a task was skipped instead of executed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// The task's necessity predicate returned false
    NotNecessary,
    /// A pre-interceptor vetoed the task
    Vetoed,
    /// An upstream task failed with `fail_sub_exec` set
    UpstreamFailed,
}

/// Status of a single task within an invocation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Pending,
    Running,
    Succeeded,
    Failed,
    Skipped(SkipReason),
    /// Dispatched, but the invocation was interrupted before the task started
    Cancelled,
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, TaskState::Pending | TaskState::Running)
    }

    pub fn is_skipped(&self) -> bool {
        matches!(self, TaskState::Skipped(_))
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskState::Pending => write!(f, "pending"),
            TaskState::Running => write!(f, "running"),
            TaskState::Succeeded => write!(f, "succeeded"),
            TaskState::Failed => write!(f, "failed"),
            TaskState::Skipped(reason) => write!(f, "skipped ({:?})", reason),
            TaskState::Cancelled => write!(f, "cancelled"),
        }
    }
}
