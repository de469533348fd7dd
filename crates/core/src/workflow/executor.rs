use super::dag::DependencyGraph;
use super::support::{ExecutionContext, ResultKeyFn, TaskResult};
use super::task_executor::NodeJob;
use crate::config::LogConfig;
use crate::error::{EngineError, EngineResult};
use crate::interceptor::InterceptorChain;
use crate::pool::ThreadPoolFactory;
use crate::task::TaskValue;
use crate::types::{ExecutionId, InvocationState, TaskState};
use petgraph::graph::NodeIndex;
use std::any::Any;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::Instrument;

/// Per-call overrides for one invocation.
#[derive(Clone, Default)]
pub struct ExecuteOptions {
    /// Whole-flow timeout; `None` uses the rule's or the engine's
    pub timeout: Option<Duration>,
    pub(crate) task_params: HashMap<String, TaskValue>,
}

impl ExecuteOptions {
    pub fn with_timeout(timeout: Duration) -> Self {
        Self::default().timeout(timeout)
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Give one task its own parameter, read back with [`TaskSupport::task_param`]
    ///
    /// [`TaskSupport::task_param`]: super::support::TaskSupport::task_param
    pub fn task_param<V: Any + Send + Sync>(mut self, task: impl Into<String>, value: V) -> Self {
        self.task_params.insert(task.into(), Arc::new(value));
        self
    }
}

impl std::fmt::Debug for ExecuteOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut tasks: Vec<&String> = self.task_params.keys().collect();
        tasks.sort();
        f.debug_struct("ExecuteOptions")
            .field("timeout", &self.timeout)
            .field("task_params", &tasks)
            .finish()
    }
}

/// How an invocation ended, as a caller usually wants to branch on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Completed,
    /// Every task reached a terminal state, at least one of them failed
    CompletedWithFailures,
    /// Stopped by a task or interceptor
    Interrupted,
    /// Stopped by the whole-flow timeout
    TimedOut,
}

/// Everything one invocation produced.
#[derive(Debug, Clone)]
pub struct AggregateResult {
    execution_id: ExecutionId,
    flow: String,
    state: InvocationState,
    cause: Option<EngineError>,
    first_failure: Option<EngineError>,
    task_states: BTreeMap<String, TaskState>,
    results: HashMap<String, TaskResult>,
    declared_keys: HashMap<String, String>,
    key_fn: KeyFn,
    elapsed: Duration,
}

#[derive(Clone)]
struct KeyFn(ResultKeyFn);

impl std::fmt::Debug for KeyFn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ResultKeyFn")
    }
}

impl AggregateResult {
    fn collect<P>(ctx: &ExecutionContext<P>, key_fn: ResultKeyFn, elapsed: Duration) -> Self {
        let states = ctx.states_snapshot();
        let mut task_states = BTreeMap::new();
        let mut declared_keys = HashMap::new();
        for idx in ctx.graph.node_indices() {
            let task = ctx.graph.task_at(idx);
            task_states.insert(task.name().to_string(), states[idx.index()]);
            if let Some(key) = task.result_key() {
                declared_keys.insert(task.name().to_string(), key.to_string());
            }
        }

        let cause = ctx.cause().cloned();
        let state = if cause.is_some() {
            InvocationState::Interrupted
        } else if task_states.values().any(|s| *s == TaskState::Failed) {
            InvocationState::Failed
        } else {
            InvocationState::Completed
        };

        Self {
            execution_id: ctx.id,
            flow: ctx.flow().to_string(),
            state,
            cause,
            first_failure: ctx.first_failure().cloned(),
            task_states,
            results: ctx.results_snapshot(),
            declared_keys,
            key_fn: KeyFn(key_fn),
            elapsed,
        }
    }

    pub fn execution_id(&self) -> ExecutionId {
        self.execution_id
    }

    pub fn flow(&self) -> &str {
        &self.flow
    }

    pub fn state(&self) -> InvocationState {
        self.state
    }

    /// Why the invocation was interrupted, if it was
    pub fn cause(&self) -> Option<&EngineError> {
        self.cause.as_ref()
    }

    /// The earliest task failure, if any task failed
    pub fn first_failure(&self) -> Option<&EngineError> {
        self.first_failure.as_ref()
    }

    pub fn outcome(&self) -> Outcome {
        match (&self.state, &self.cause) {
            (_, Some(EngineError::WholeFlowTimeout { .. })) => Outcome::TimedOut,
            (InvocationState::Interrupted, _) => Outcome::Interrupted,
            (InvocationState::Failed, _) => Outcome::CompletedWithFailures,
            _ => Outcome::Completed,
        }
    }

    pub fn is_success(&self) -> bool {
        self.state == InvocationState::Completed
    }

    pub fn elapsed(&self) -> Duration {
        self.elapsed
    }

    pub fn task_state(&self, task: &str) -> Option<TaskState> {
        self.task_states.get(task).copied()
    }

    /// Every task of the flow with its final state, sorted by name
    pub fn task_states(&self) -> &BTreeMap<String, TaskState> {
        &self.task_states
    }

    /// Tasks that ended in `Failed`
    pub fn failed_tasks(&self) -> Vec<&str> {
        self.task_states
            .iter()
            .filter(|(_, state)| **state == TaskState::Failed)
            .map(|(name, _)| name.as_str())
            .collect()
    }

    /// Recorded result by task name or result key
    pub fn result(&self, identity: &str) -> Option<&TaskResult> {
        if let Some(result) = self.results.get(identity) {
            return Some(result);
        }
        if let Some(result) = self
            .declared_keys
            .get(identity)
            .and_then(|key| self.results.get(key))
        {
            return Some(result);
        }
        self.results.get(&(self.key_fn.0)(identity))
    }

    /// Typed value of a successful task
    pub fn get<T: Any + Send + Sync>(&self, identity: &str) -> Option<Arc<T>> {
        self.result(identity)?.value::<T>()
    }

    pub fn results(&self) -> &HashMap<String, TaskResult> {
        &self.results
    }

    /// The result itself, or the interruption cause
    pub fn into_result(self) -> EngineResult<Self> {
        match self.cause {
            Some(cause) => Err(cause),
            None => Ok(self),
        }
    }
}

/// Runs compiled graphs on the engine's pools.
pub struct FlowExecutor<P> {
    pools: Arc<ThreadPoolFactory>,
    interceptors: InterceptorChain<P>,
    key_fn: ResultKeyFn,
}

impl<P> FlowExecutor<P>
where
    P: Send + Sync + 'static,
{
    pub fn new(
        pools: Arc<ThreadPoolFactory>,
        interceptors: InterceptorChain<P>,
        key_fn: ResultKeyFn,
    ) -> Self {
        Self {
            pools,
            interceptors,
            key_fn,
        }
    }

    pub fn pools(&self) -> &Arc<ThreadPoolFactory> {
        &self.pools
    }

    /// Run one invocation of `graph` to completion, interruption or timeout
    pub async fn execute(
        &self,
        graph: Arc<DependencyGraph<P>>,
        param: Arc<P>,
        timeout: Duration,
        log: LogConfig,
    ) -> AggregateResult {
        self.execute_with_params(graph, param, HashMap::new(), timeout, log)
            .await
    }

    /// Like [`execute`](Self::execute), with parameters addressed to single tasks
    pub async fn execute_with_params(
        &self,
        graph: Arc<DependencyGraph<P>>,
        param: Arc<P>,
        task_params: HashMap<String, TaskValue>,
        timeout: Duration,
        log: LogConfig,
    ) -> AggregateResult {
        let ctx = Arc::new(
            ExecutionContext::new(graph, param, Arc::clone(&self.key_fn))
                .with_task_params(task_params),
        );
        let span = tracing::info_span!(
            "flow",
            flow = %ctx.flow(),
            execution_id = %ctx.id,
        );

        let invocation = Arc::new(Invocation {
            ctx: Arc::clone(&ctx),
            pools: Arc::clone(&self.pools),
            interceptors: self.interceptors.clone(),
            log,
        });

        async move {
            let started = Instant::now();
            tracing::debug!(tasks = ctx.graph.len(), "starting flow");

            for &entry in ctx.graph.entries() {
                invocation.dispatch(entry);
            }
            ctx.leave();

            if tokio::time::timeout(timeout, ctx.finished()).await.is_err() {
                let cause = EngineError::WholeFlowTimeout {
                    flow: ctx.flow().to_string(),
                    timeout,
                };
                if ctx.interrupt(cause) {
                    tracing::warn!(timeout_ms = timeout.as_millis() as u64, "flow timed out");
                }
            }

            let result = AggregateResult::collect(&ctx, Arc::clone(&self.key_fn), started.elapsed());
            tracing::info!(
                state = ?result.state(),
                elapsed_ms = result.elapsed().as_millis() as u64,
                "flow finished"
            );
            result
        }
        .instrument(span)
        .await
    }
}

/// Shared state of one running invocation
pub(crate) struct Invocation<P> {
    pub(crate) ctx: Arc<ExecutionContext<P>>,
    pub(crate) pools: Arc<ThreadPoolFactory>,
    pub(crate) interceptors: InterceptorChain<P>,
    pub(crate) log: LogConfig,
}

impl<P> Invocation<P>
where
    P: Send + Sync + 'static,
{
    /// Hand a ready node to its pool. Nothing is dispatched once the invocation is interrupted.
    pub(crate) fn dispatch(self: &Arc<Self>, node: NodeIndex) {
        if self.ctx.is_interrupted() {
            return;
        }
        self.ctx.enter();

        let task = self.ctx.graph.task_at(node);
        match self.pools.pool_for(task.pool()) {
            Ok(pool) => pool.submit(Box::new(NodeJob::new(Arc::clone(self), node))),
            Err(error) => self.fail_undispatched(node, error),
        }
    }

    /// Record a node that never reached a worker as failed, then move on
    pub(crate) fn fail_undispatched(self: &Arc<Self>, node: NodeIndex, error: EngineError) {
        let task = Arc::clone(self.ctx.graph.task_at(node));
        let support = super::support::TaskSupport::new(Arc::clone(&self.ctx), node);

        self.ctx.record_failure(&error);
        self.ctx.put_result(
            self.ctx.result_key_of(task.name()),
            TaskResult::failure(error.clone()),
        );
        self.ctx.set_state(node, TaskState::Failed);
        task.behavior.on_fail(&support, &error);
        self.interceptors.on_error(&self.ctx.param, &support, &error);
        if self.log.err_log {
            tracing::error!(flow = %self.ctx.flow(), task = %task.name(), error = %error, "task was not dispatched");
        }

        self.complete(node, true);
    }

    /// Propagate a terminal node to its successors and release its in-flight slot
    pub(crate) fn complete(self: &Arc<Self>, node: NodeIndex, failed: bool) {
        let ctx = &self.ctx;
        let task = ctx.graph.task_at(node);
        let block = ctx.is_blocked(node) || (failed && task.fail_sub_exec());
        let degrade = failed || ctx.is_degraded(node);

        let successors: Vec<NodeIndex> = ctx.graph.successor_indices(node).collect();
        for &next in &successors {
            if block {
                ctx.mark_blocked(next);
            } else if degrade {
                ctx.mark_degraded(next);
            }
        }
        for next in successors {
            if ctx.release_predecessor(next) {
                self.dispatch(next);
            }
        }

        ctx.leave();
    }
}
