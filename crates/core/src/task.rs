//! Task trait and task definitions.
//!
//! Implement [`AsyncTask`] for a unit of work, wrap it in a [`TaskDefinition`] with its
//! retry/timeout/exclusivity settings, and register the definition with the engine's
//! [`TaskRegistry`](crate::registry::TaskRegistry).

use crate::error::{EngineError, EngineResult};
use crate::workflow::support::TaskSupport;
use async_trait::async_trait;
use std::any::Any;
use std::sync::Arc;
use std::time::Duration;

/// Type-erased task output as stored in the execution context.
pub type TaskValue = Arc<dyn Any + Send + Sync>;

/// Kind assigned to definitions that do not declare one.
pub const DEFAULT_KIND: &str = "default";

/// A unit of work run by the engine.
///
/// `P` is the invocation parameter shared by every task of a flow.
///
/// # Example
///
/// ```ignore
/// struct LoadUser;
///
/// #[async_trait]
/// impl AsyncTask<OrderRequest> for LoadUser {
///     type Output = User;
///
///     async fn task(&self, param: &OrderRequest, _support: &TaskSupport<OrderRequest>) -> anyhow::Result<User> {
///         load_user(param.user_id).await
///     }
/// }
/// ```
#[async_trait]
pub trait AsyncTask<P>: Send + Sync + 'static
where
    P: Send + Sync + 'static,
{
    type Output: Send + Sync + 'static;

    /// Called once before the first attempt.
    fn prepare(&self, _param: &P) {}

    /// The work itself. Long-running bodies should watch `support.cancelled()`.
    async fn task(&self, param: &P, support: &TaskSupport<P>) -> anyhow::Result<Self::Output>;

    /// Whether the task needs to run at all. A `false` skips it; successors still run.
    fn necessary(&self, _param: &P, _support: &TaskSupport<P>) -> bool {
        true
    }

    fn on_success(&self, _support: &TaskSupport<P>) {}

    fn on_fail(&self, _support: &TaskSupport<P>, _error: &EngineError) {}
}

/// Object-safe view of an [`AsyncTask`] with its output erased.
#[async_trait]
pub(crate) trait ErasedTask<P>: Send + Sync {
    fn prepare(&self, param: &P);

    async fn run(&self, param: &P, support: &TaskSupport<P>) -> anyhow::Result<TaskValue>;

    fn necessary(&self, param: &P, support: &TaskSupport<P>) -> bool;

    fn on_success(&self, support: &TaskSupport<P>);

    fn on_fail(&self, support: &TaskSupport<P>, error: &EngineError);
}

struct Erased<T>(T);

#[async_trait]
impl<P, T> ErasedTask<P> for Erased<T>
where
    P: Send + Sync + 'static,
    T: AsyncTask<P>,
{
    fn prepare(&self, param: &P) {
        self.0.prepare(param)
    }

    async fn run(&self, param: &P, support: &TaskSupport<P>) -> anyhow::Result<TaskValue> {
        let output = self.0.task(param, support).await?;
        Ok(Arc::new(output) as TaskValue)
    }

    fn necessary(&self, param: &P, support: &TaskSupport<P>) -> bool {
        self.0.necessary(param, support)
    }

    fn on_success(&self, support: &TaskSupport<P>) {
        self.0.on_success(support)
    }

    fn on_fail(&self, support: &TaskSupport<P>, error: &EngineError) {
        self.0.on_fail(support, error)
    }
}

/// Execution settings of a task.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskConfig {
    /// Retries after the first failed attempt
    pub retry_count: u32,
    /// Pause between attempts
    pub retry_delay: Duration,
    /// Per-attempt limit; `None` leaves only the whole-flow timeout
    pub timeout: Option<Duration>,
    /// Never overlaps another exclusive task of the same invocation
    pub exclusive: bool,
    /// A failure of this task skips every descendant instead of running it degraded
    pub fail_sub_exec: bool,
    pub desc: String,
    /// Dedicated pool name; `None` runs on the shared pool
    pub pool: Option<String>,
}

/// A registered task: identity, behavior and settings.
///
/// Immutable once built; graphs and invocations share it through `Arc`.
pub struct TaskDefinition<P> {
    name: String,
    kind: String,
    result_key: Option<String>,
    config: TaskConfig,
    pub(crate) behavior: Arc<dyn ErasedTask<P>>,
}

impl<P> TaskDefinition<P>
where
    P: Send + Sync + 'static,
{
    pub fn builder<T>(name: impl Into<String>, task: T) -> TaskDefinitionBuilder<P>
    where
        T: AsyncTask<P>,
    {
        TaskDefinitionBuilder {
            name: name.into(),
            kind: DEFAULT_KIND.to_string(),
            result_key: None,
            config: TaskConfig::default(),
            behavior: Arc::new(Erased(task)),
        }
    }
}

impl<P> TaskDefinition<P> {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    /// The key this task declared for its result, if any.
    pub fn result_key(&self) -> Option<&str> {
        self.result_key.as_deref()
    }

    pub fn config(&self) -> &TaskConfig {
        &self.config
    }

    pub fn retry_count(&self) -> u32 {
        self.config.retry_count
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.config.timeout
    }

    pub fn is_exclusive(&self) -> bool {
        self.config.exclusive
    }

    pub fn fail_sub_exec(&self) -> bool {
        self.config.fail_sub_exec
    }

    pub fn desc(&self) -> &str {
        &self.config.desc
    }

    pub fn pool(&self) -> Option<&str> {
        self.config.pool.as_deref()
    }
}

impl<P> std::fmt::Debug for TaskDefinition<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskDefinition")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("result_key", &self.result_key)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

pub struct TaskDefinitionBuilder<P> {
    name: String,
    kind: String,
    result_key: Option<String>,
    config: TaskConfig,
    behavior: Arc<dyn ErasedTask<P>>,
}

impl<P> TaskDefinitionBuilder<P> {
    pub fn kind(mut self, kind: impl Into<String>) -> Self {
        self.kind = kind.into();
        self
    }

    /// Key under which the task's result is stored. Defaults to the engine's naming function.
    pub fn result_key(mut self, key: impl Into<String>) -> Self {
        self.result_key = Some(key.into());
        self
    }

    pub fn retry(mut self, retry_count: u32) -> Self {
        self.config.retry_count = retry_count;
        self
    }

    pub fn retry_delay(mut self, delay: Duration) -> Self {
        self.config.retry_delay = delay;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.config.timeout = Some(timeout);
        self
    }

    pub fn exclusive(mut self, exclusive: bool) -> Self {
        self.config.exclusive = exclusive;
        self
    }

    pub fn fail_sub_exec(mut self, fail_sub_exec: bool) -> Self {
        self.config.fail_sub_exec = fail_sub_exec;
        self
    }

    pub fn desc(mut self, desc: impl Into<String>) -> Self {
        self.config.desc = desc.into();
        self
    }

    pub fn pool(mut self, pool: impl Into<String>) -> Self {
        self.config.pool = Some(pool.into());
        self
    }

    pub fn build(self) -> EngineResult<TaskDefinition<P>> {
        let name = self.name.trim().to_string();
        if name.is_empty() {
            return Err(EngineError::Config("task name must not be empty".to_string()));
        }
        if self.kind.trim().is_empty() {
            return Err(EngineError::Config(format!(
                "task '{}' has an empty kind",
                name
            )));
        }
        if self.config.timeout == Some(Duration::ZERO) {
            return Err(EngineError::Config(format!(
                "task '{}' has a zero timeout",
                name
            )));
        }
        if matches!(self.result_key.as_deref(), Some(key) if key.trim().is_empty()) {
            return Err(EngineError::Config(format!(
                "task '{}' declares an empty result key",
                name
            )));
        }

        Ok(TaskDefinition {
            name,
            kind: self.kind,
            result_key: self.result_key,
            config: self.config,
            behavior: self.behavior,
        })
    }
}
