use super::executor::Invocation;
use super::support::{TaskResult, TaskSupport};
use crate::error::EngineError;
use crate::interceptor::PreDecision;
use crate::pool::{JobFuture, PoolJob, Rejection};
use crate::task::{TaskDefinition, TaskValue};
use crate::types::{SkipReason, TaskState};
use chrono::Utc;
use petgraph::graph::NodeIndex;
use std::sync::Arc;
use std::time::Instant;
use tokio::runtime::Handle;
use tokio::task::JoinError;
use tracing::Instrument;

/// One node of one invocation, as submitted to a worker pool
pub(crate) struct NodeJob<P> {
    invocation: Arc<Invocation<P>>,
    node: NodeIndex,
    rejections: u32,
}

impl<P> NodeJob<P>
where
    P: Send + Sync + 'static,
{
    pub(crate) fn new(invocation: Arc<Invocation<P>>, node: NodeIndex) -> Self {
        Self {
            invocation,
            node,
            rejections: 0,
        }
    }
}

impl<P> PoolJob for NodeJob<P>
where
    P: Send + Sync + 'static,
{
    fn run(self: Box<Self>) -> JobFuture {
        let span = tracing::info_span!(
            "task",
            flow = %self.invocation.ctx.flow(),
            task = %self.invocation.ctx.graph.task_at(self.node).name(),
        );
        Box::pin(
            async move {
                let invocation = Arc::clone(&self.invocation);
                let node = self.node;
                let lifecycle =
                    tokio::spawn(async move { invocation.run_node(node).await }.in_current_span());
                let failed = match lifecycle.await {
                    Ok(failed) => failed,
                    Err(join_error) => self.invocation.fail_crashed(self.node, join_error),
                };
                self.invocation.complete(self.node, failed);
            }
            .instrument(span),
        )
    }

    fn reject(mut self: Box<Self>, pool: &str, rejection: Rejection) {
        let task = Arc::clone(self.invocation.ctx.graph.task_at(self.node));
        let error = EngineError::DispatchRejected {
            pool: pool.to_string(),
            task: task.name().to_string(),
        };

        let retryable = rejection == Rejection::Aborted
            && self.rejections < task.retry_count()
            && !self.invocation.ctx.is_interrupted();
        if retryable {
            if let Ok(handle) = Handle::try_current() {
                self.rejections += 1;
                tracing::warn!(
                    pool = %pool,
                    task = %task.name(),
                    redispatch = self.rejections,
                    "dispatch rejected, retrying"
                );
                let delay = task.config().retry_delay;
                let pools = Arc::clone(&self.invocation.pools);
                let pool_name = task.pool().map(str::to_string);
                handle.spawn(async move {
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                    match pools.pool_for(pool_name.as_deref()) {
                        Ok(pool) => pool.submit(self),
                        Err(error) => {
                            let invocation = Arc::clone(&self.invocation);
                            invocation.fail_undispatched(self.node, error);
                        }
                    }
                });
                return;
            }
        }

        self.invocation.fail_undispatched(self.node, error);
    }
}

impl<P> Invocation<P>
where
    P: Send + Sync + 'static,
{
    /// Run one node through its lifecycle. Returns whether it ended in failure.
    pub(crate) async fn run_node(&self, node: NodeIndex) -> bool {
        let ctx = &self.ctx;
        let task = Arc::clone(ctx.graph.task_at(node));
        let support = TaskSupport::new(Arc::clone(ctx), node);
        let param = &*ctx.param;

        if ctx.is_interrupted() {
            ctx.set_state(node, TaskState::Cancelled);
            tracing::debug!("flow interrupted before task started");
            return false;
        }
        if ctx.is_blocked(node) {
            ctx.set_state(node, TaskState::Skipped(SkipReason::UpstreamFailed));
            tracing::debug!("skipped, an upstream task failed");
            return false;
        }

        let mut current = support.for_attempt(1);
        if let PreDecision::Veto(reason) = self.interceptors.before(param, &current) {
            ctx.set_state(node, TaskState::Skipped(SkipReason::Vetoed));
            tracing::info!(reason = %reason, "task vetoed");
            return false;
        }
        if !task.behavior.necessary(param, &support) {
            ctx.set_state(node, TaskState::Skipped(SkipReason::NotNecessary));
            tracing::debug!("task not necessary, skipped");
            return false;
        }

        let _permit = if task.is_exclusive() {
            let permit = ctx.exclusive.acquire().await.ok();
            if ctx.is_interrupted() {
                ctx.set_state(node, TaskState::Cancelled);
                return false;
            }
            permit
        } else {
            None
        };

        ctx.set_state(node, TaskState::Running);
        let started_at = Utc::now();
        let started = Instant::now();
        task.behavior.prepare(param);

        // Every attempt passes the pre-interceptor before its timeout and body
        let max_attempts = task.retry_count().saturating_add(1);
        let mut attempt = 1;
        let outcome = loop {
            let error = match self.attempt(&task, &current).await {
                Ok(value) => break Ok(value),
                Err(error) => error,
            };
            if attempt >= max_attempts || ctx.is_interrupted() {
                break Err(error);
            }
            tracing::warn!(attempt, error = %error, "attempt failed, retrying");
            let delay = task.config().retry_delay;
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }

            let next = support.for_attempt(attempt + 1);
            if let PreDecision::Veto(reason) = self.interceptors.before(param, &next) {
                tracing::info!(reason = %reason, "retry vetoed");
                break Err(error);
            }
            attempt += 1;
            current = next;
        };
        let last = current;

        let degraded = ctx.is_degraded(node);
        let key = ctx.result_key_of(task.name());
        match outcome {
            Ok(value) => {
                ctx.put_result(
                    key,
                    TaskResult::from_value(value).with_run(attempt, degraded, started_at),
                );
                ctx.set_state(node, TaskState::Succeeded);
                task.behavior.on_success(&last);
                self.interceptors.after(param, &last);
                if self.log.cost_log {
                    tracing::info!(
                        attempts = attempt,
                        cost_ms = started.elapsed().as_millis() as u64,
                        "task succeeded"
                    );
                }
                false
            }
            Err(error) => {
                ctx.record_failure(&error);
                ctx.put_result(
                    key,
                    TaskResult::failure(error.clone()).with_run(attempt, degraded, started_at),
                );
                ctx.set_state(node, TaskState::Failed);
                task.behavior.on_fail(&last, &error);
                self.interceptors.on_error(param, &last, &error);
                if self.log.err_log {
                    tracing::error!(
                        attempts = attempt,
                        cost_ms = started.elapsed().as_millis() as u64,
                        error = %error,
                        "task failed"
                    );
                }
                true
            }
        }
    }

    /// Record a node whose lifecycle panicked or was torn down outside the task body
    pub(crate) fn fail_crashed(&self, node: NodeIndex, join_error: JoinError) -> bool {
        let ctx = &self.ctx;
        let task = ctx.graph.task_at(node);
        let error = EngineError::TaskExecution {
            task: task.name().to_string(),
            message: if join_error.is_panic() {
                "task lifecycle panicked".to_string()
            } else {
                join_error.to_string()
            },
        };

        ctx.record_failure(&error);
        ctx.put_result(ctx.result_key_of(task.name()), TaskResult::failure(error.clone()));
        ctx.set_state(node, TaskState::Failed);
        if self.log.err_log {
            tracing::error!(error = %error, "task failed");
        }
        true
    }

    /// One attempt of the task body, bounded by the task's timeout.
    ///
    /// The body runs as its own tokio task so a panic surfaces as an error. On timeout the
    /// attempt's token is cancelled and the body is left to notice it.
    async fn attempt(
        &self,
        task: &Arc<TaskDefinition<P>>,
        support: &TaskSupport<P>,
    ) -> Result<TaskValue, EngineError> {
        let behavior = Arc::clone(&task.behavior);
        let body_support = support.clone();
        let body = tokio::spawn(
            async move { behavior.run(body_support.param(), &body_support).await }
                .in_current_span(),
        );

        let joined = match task.timeout() {
            Some(limit) => match tokio::time::timeout(limit, body).await {
                Ok(joined) => joined,
                Err(_) => {
                    support.cancel_attempt();
                    return Err(EngineError::TaskTimeout {
                        task: task.name().to_string(),
                        timeout: limit,
                    });
                }
            },
            None => body.await,
        };

        match joined {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(error)) => Err(EngineError::task_failed(task.name(), &error)),
            Err(join_error) => Err(EngineError::TaskExecution {
                task: task.name().to_string(),
                message: if join_error.is_panic() {
                    "task panicked".to_string()
                } else {
                    join_error.to_string()
                },
            }),
        }
    }
}
