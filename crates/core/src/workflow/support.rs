//! Per-invocation execution state and the handle tasks use to reach it.
//!
//! - [`ExecutionContext`]: parameter, results, task states and the atomic
//!   remaining-predecessor counters of one invocation
//! - [`TaskSupport`]: what a running task sees; reads upstream results, writes its own,
//!   and can interrupt the whole invocation
//! - [`TaskResult`]: a recorded task outcome with its type-erased value

use super::dag::DependencyGraph;
use crate::error::EngineError;
use crate::task::TaskValue;
use crate::types::{ExecutionId, TaskState};
use chrono::{DateTime, Utc};
use petgraph::graph::NodeIndex;
use std::any::Any;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError, RwLock};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

/// Derives the default result key of a task from its name.
pub type ResultKeyFn = Arc<dyn Fn(&str) -> String + Send + Sync>;

/// The default naming function: a task's result is stored under its own name.
pub fn identity_key() -> ResultKeyFn {
    Arc::new(|name: &str| name.to_string())
}

/// Outcome of one task, as recorded in the execution context.
#[derive(Clone)]
pub struct TaskResult {
    value: Option<TaskValue>,
    state: TaskState,
    error: Option<EngineError>,
    attempts: u32,
    degraded: bool,
    started_at: Option<DateTime<Utc>>,
    finished_at: DateTime<Utc>,
}

impl TaskResult {
    /// A successful result carrying `value`.
    pub fn success<V: Any + Send + Sync>(value: V) -> Self {
        Self::from_value(Arc::new(value))
    }

    pub(crate) fn from_value(value: TaskValue) -> Self {
        Self {
            value: Some(value),
            state: TaskState::Succeeded,
            error: None,
            attempts: 1,
            degraded: false,
            started_at: None,
            finished_at: Utc::now(),
        }
    }

    /// A failed result.
    pub fn failure(error: EngineError) -> Self {
        Self {
            value: None,
            state: TaskState::Failed,
            error: Some(error),
            attempts: 1,
            degraded: false,
            started_at: None,
            finished_at: Utc::now(),
        }
    }

    pub(crate) fn with_run(
        mut self,
        attempts: u32,
        degraded: bool,
        started_at: DateTime<Utc>,
    ) -> Self {
        self.attempts = attempts;
        self.degraded = degraded;
        self.started_at = Some(started_at);
        self
    }

    /// The value, if the task succeeded with an output of type `T`.
    pub fn value<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        self.value.clone()?.downcast::<T>().ok()
    }

    pub fn raw_value(&self) -> Option<&TaskValue> {
        self.value.as_ref()
    }

    pub fn state(&self) -> TaskState {
        self.state
    }

    pub fn is_success(&self) -> bool {
        self.state == TaskState::Succeeded
    }

    pub fn error(&self) -> Option<&EngineError> {
        self.error.as_ref()
    }

    /// Attempts made, including the successful or final one.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Whether an upstream task had failed when this task ran.
    pub fn is_degraded(&self) -> bool {
        self.degraded
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.started_at
    }

    pub fn finished_at(&self) -> DateTime<Utc> {
        self.finished_at
    }
}

impl std::fmt::Debug for TaskResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskResult")
            .field("state", &self.state)
            .field("has_value", &self.value.is_some())
            .field("error", &self.error)
            .field("attempts", &self.attempts)
            .field("degraded", &self.degraded)
            .finish()
    }
}

/// Mutable state of one invocation.
///
/// Owned by exactly one invocation; worker jobs hold it through `Arc`.
pub(crate) struct ExecutionContext<P> {
    pub(crate) id: ExecutionId,
    pub(crate) param: Arc<P>,
    pub(crate) graph: Arc<DependencyGraph<P>>,
    key_fn: ResultKeyFn,
    results: RwLock<HashMap<String, TaskResult>>,
    states: Mutex<Vec<TaskState>>,
    remaining: Vec<AtomicUsize>,
    degraded: Vec<AtomicBool>,
    blocked: Vec<AtomicBool>,
    /// Dispatched nodes not yet terminal, plus one launch guard held while entries dispatch
    in_flight: AtomicUsize,
    task_params: HashMap<String, TaskValue>,
    interrupted: CancellationToken,
    cause: OnceLock<EngineError>,
    first_failure: OnceLock<EngineError>,
    done: CancellationToken,
    pub(crate) exclusive: Semaphore,
}

impl<P> ExecutionContext<P> {
    pub(crate) fn new(graph: Arc<DependencyGraph<P>>, param: Arc<P>, key_fn: ResultKeyFn) -> Self {
        let len = graph.len();
        let remaining = graph
            .node_indices()
            .map(|idx| AtomicUsize::new(graph.in_degree(idx)))
            .collect();

        Self {
            id: ExecutionId::new(),
            param,
            key_fn,
            results: RwLock::new(HashMap::new()),
            states: Mutex::new(vec![TaskState::Pending; len]),
            remaining,
            degraded: (0..len).map(|_| AtomicBool::new(false)).collect(),
            blocked: (0..len).map(|_| AtomicBool::new(false)).collect(),
            in_flight: AtomicUsize::new(1),
            task_params: HashMap::new(),
            interrupted: CancellationToken::new(),
            cause: OnceLock::new(),
            first_failure: OnceLock::new(),
            done: CancellationToken::new(),
            exclusive: Semaphore::new(1),
            graph,
        }
    }

    /// Parameters addressed to single tasks by name
    pub(crate) fn with_task_params(mut self, task_params: HashMap<String, TaskValue>) -> Self {
        self.task_params = task_params;
        self
    }

    pub(crate) fn flow(&self) -> &str {
        self.graph.name()
    }

    /// Key under which `task` stores its result.
    pub(crate) fn result_key_of(&self, task: &str) -> String {
        match self.graph.node(task).and_then(|node| node.task().result_key()) {
            Some(key) => key.to_string(),
            None => (self.key_fn)(task),
        }
    }

    /// Resolve an identity to a stored result: exact key, then the task's declared key,
    /// then the naming function's default key.
    pub(crate) fn get_result(&self, identity: &str) -> Option<TaskResult> {
        let results = self.results.read().unwrap_or_else(PoisonError::into_inner);
        if let Some(result) = results.get(identity) {
            return Some(result.clone());
        }
        if let Some(key) = self.graph.node(identity).and_then(|node| node.task().result_key()) {
            if let Some(result) = results.get(key) {
                return Some(result.clone());
            }
        }
        results.get(&(self.key_fn)(identity)).cloned()
    }

    pub(crate) fn put_result(&self, key: String, result: TaskResult) {
        let mut results = self.results.write().unwrap_or_else(PoisonError::into_inner);
        results.insert(key, result);
    }

    pub(crate) fn results_snapshot(&self) -> HashMap<String, TaskResult> {
        self.results
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub(crate) fn set_state(&self, node: NodeIndex, state: TaskState) {
        let mut states = self.states.lock().unwrap_or_else(PoisonError::into_inner);
        states[node.index()] = state;
    }

    pub(crate) fn state(&self, node: NodeIndex) -> TaskState {
        let states = self.states.lock().unwrap_or_else(PoisonError::into_inner);
        states[node.index()]
    }

    pub(crate) fn states_snapshot(&self) -> Vec<TaskState> {
        self.states
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Count down one finished predecessor; true exactly once, when the last one finishes.
    pub(crate) fn release_predecessor(&self, node: NodeIndex) -> bool {
        self.remaining[node.index()].fetch_sub(1, Ordering::AcqRel) == 1
    }

    pub(crate) fn mark_degraded(&self, node: NodeIndex) {
        self.degraded[node.index()].store(true, Ordering::Release);
    }

    pub(crate) fn is_degraded(&self, node: NodeIndex) -> bool {
        self.degraded[node.index()].load(Ordering::Acquire)
    }

    pub(crate) fn mark_blocked(&self, node: NodeIndex) {
        self.blocked[node.index()].store(true, Ordering::Release);
    }

    pub(crate) fn is_blocked(&self, node: NodeIndex) -> bool {
        self.blocked[node.index()].load(Ordering::Acquire)
    }

    pub(crate) fn enter(&self) {
        self.in_flight.fetch_add(1, Ordering::AcqRel);
    }

    /// Leave one in-flight slot; the last one out signals completion.
    pub(crate) fn leave(&self) {
        if self.in_flight.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.done.cancel();
        }
    }

    pub(crate) async fn finished(&self) {
        self.done.cancelled().await
    }

    /// Stop dispatching. Returns false if the invocation was already interrupted.
    pub(crate) fn interrupt(&self, cause: EngineError) -> bool {
        if self.cause.set(cause).is_ok() {
            self.interrupted.cancel();
            true
        } else {
            false
        }
    }

    pub(crate) fn is_interrupted(&self) -> bool {
        self.interrupted.is_cancelled()
    }

    pub(crate) fn cause(&self) -> Option<&EngineError> {
        self.cause.get()
    }

    /// Keep the earliest task failure of the invocation
    pub(crate) fn record_failure(&self, error: &EngineError) {
        let _ = self.first_failure.set(error.clone());
    }

    pub(crate) fn first_failure(&self) -> Option<&EngineError> {
        self.first_failure.get()
    }

    pub(crate) fn attempt_token(&self) -> CancellationToken {
        self.interrupted.child_token()
    }
}

/// Handle given to tasks and interceptors for one task of one invocation.
pub struct TaskSupport<P> {
    ctx: Arc<ExecutionContext<P>>,
    node: NodeIndex,
    attempt: u32,
    cancel: CancellationToken,
}

impl<P> Clone for TaskSupport<P> {
    fn clone(&self) -> Self {
        Self {
            ctx: Arc::clone(&self.ctx),
            node: self.node,
            attempt: self.attempt,
            cancel: self.cancel.clone(),
        }
    }
}

impl<P> TaskSupport<P> {
    pub(crate) fn new(ctx: Arc<ExecutionContext<P>>, node: NodeIndex) -> Self {
        let cancel = ctx.attempt_token();
        Self {
            ctx,
            node,
            attempt: 0,
            cancel,
        }
    }

    /// A handle for the next attempt, with its own cancellation token.
    pub(crate) fn for_attempt(&self, attempt: u32) -> Self {
        Self {
            ctx: Arc::clone(&self.ctx),
            node: self.node,
            attempt,
            cancel: self.ctx.attempt_token(),
        }
    }

    pub(crate) fn cancel_attempt(&self) {
        self.cancel.cancel();
    }

    /// The invocation parameter
    pub fn param(&self) -> &P {
        &self.ctx.param
    }

    /// Parameter passed to this task alone, if the caller supplied one of type `T`
    pub fn task_param<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        self.ctx
            .task_params
            .get(self.task_name())?
            .clone()
            .downcast::<T>()
            .ok()
    }

    /// Name of the task this handle belongs to
    pub fn task_name(&self) -> &str {
        self.ctx.graph.task_at(self.node).name()
    }

    pub fn flow(&self) -> &str {
        self.ctx.flow()
    }

    pub fn execution_id(&self) -> ExecutionId {
        self.ctx.id
    }

    /// Current attempt, starting at 1; 0 before the first attempt
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Typed result of an upstream task, by task name or result key
    pub fn get_result<T: Any + Send + Sync>(&self, identity: &str) -> Option<Arc<T>> {
        self.ctx.get_result(identity)?.value::<T>()
    }

    /// Recorded result of a task, successful or not
    pub fn result(&self, identity: &str) -> Option<TaskResult> {
        self.ctx.get_result(identity)
    }

    /// Store a result under an explicit key
    pub fn put_result(&self, key: impl Into<String>, result: TaskResult) {
        self.ctx.put_result(key.into(), result);
    }

    /// Current state of any task of this invocation
    pub fn task_state(&self, task: &str) -> Option<TaskState> {
        let node = self.ctx.graph.index_of(task)?;
        Some(self.ctx.state(node))
    }

    /// Whether an upstream task failed before this one was dispatched
    pub fn is_degraded(&self) -> bool {
        self.ctx.is_degraded(self.node)
    }

    /// Interrupt the whole invocation: running tasks finish, nothing new is dispatched.
    ///
    /// Returns false if the invocation was already interrupted.
    pub fn stop(&self, reason: impl Into<String>) -> bool {
        let stopped = self.ctx.interrupt(EngineError::InterruptedByCallback {
            task: self.task_name().to_string(),
            reason: reason.into(),
        });
        if stopped {
            tracing::warn!(
                flow = %self.flow(),
                task = %self.task_name(),
                "flow interrupted by callback"
            );
        }
        stopped
    }

    pub fn is_interrupted(&self) -> bool {
        self.ctx.is_interrupted()
    }

    /// Whether this attempt should give up: it timed out or the invocation was interrupted
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves when this attempt is cancelled
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }
}
