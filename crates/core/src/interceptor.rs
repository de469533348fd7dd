//! Interceptors around every task run.
//!
//! At most one implementation per point. The pre-interceptor runs once before a task's first
//! attempt and may veto it; the post-interceptor runs after a success; the error interceptor
//! runs once after the final failed attempt.

use crate::error::{EngineError, EngineResult};
use crate::workflow::support::TaskSupport;
use std::sync::Arc;

/// What a pre-interceptor decided for a task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PreDecision {
    Proceed,
    /// Skip the task; successors still run
    Veto(String),
}

pub trait PreInterceptor<P>: Send + Sync {
    fn before(&self, param: &P, support: &TaskSupport<P>) -> PreDecision;
}

pub trait PostInterceptor<P>: Send + Sync {
    fn after(&self, param: &P, support: &TaskSupport<P>);
}

pub trait ErrorInterceptor<P>: Send + Sync {
    fn on_error(&self, param: &P, support: &TaskSupport<P>, error: &EngineError);
}

pub struct NoopPreInterceptor;

impl<P> PreInterceptor<P> for NoopPreInterceptor {
    fn before(&self, _param: &P, _support: &TaskSupport<P>) -> PreDecision {
        PreDecision::Proceed
    }
}

pub struct NoopPostInterceptor;

impl<P> PostInterceptor<P> for NoopPostInterceptor {
    fn after(&self, _param: &P, _support: &TaskSupport<P>) {}
}

/// Logs final failures; with `interrupt` set, also stops the flow.
pub struct DefaultErrorInterceptor {
    interrupt: bool,
}

impl DefaultErrorInterceptor {
    pub fn new(interrupt: bool) -> Self {
        Self { interrupt }
    }
}

impl<P> ErrorInterceptor<P> for DefaultErrorInterceptor {
    fn on_error(&self, _param: &P, support: &TaskSupport<P>, error: &EngineError) {
        tracing::debug!(
            flow = %support.flow(),
            task = %support.task_name(),
            error = %error,
            interrupt = self.interrupt,
            "task failed"
        );
        if self.interrupt {
            support.stop(error.to_string());
        }
    }
}

/// The installed interceptors, one per point.
pub struct InterceptorChain<P> {
    pre: Arc<dyn PreInterceptor<P>>,
    post: Arc<dyn PostInterceptor<P>>,
    error: Arc<dyn ErrorInterceptor<P>>,
}

impl<P> Clone for InterceptorChain<P> {
    fn clone(&self) -> Self {
        Self {
            pre: Arc::clone(&self.pre),
            post: Arc::clone(&self.post),
            error: Arc::clone(&self.error),
        }
    }
}

impl<P: 'static> InterceptorChain<P> {
    pub fn builder() -> InterceptorChainBuilder<P> {
        InterceptorChainBuilder::default()
    }

    /// Chain of defaults: proceed, do nothing, log (and stop when `interrupt_on_error`)
    pub fn defaults(interrupt_on_error: bool) -> Self {
        Self {
            pre: Arc::new(NoopPreInterceptor),
            post: Arc::new(NoopPostInterceptor),
            error: Arc::new(DefaultErrorInterceptor::new(interrupt_on_error)),
        }
    }
}

impl<P> InterceptorChain<P> {
    pub(crate) fn before(&self, param: &P, support: &TaskSupport<P>) -> PreDecision {
        self.pre.before(param, support)
    }

    pub(crate) fn after(&self, param: &P, support: &TaskSupport<P>) {
        self.post.after(param, support)
    }

    pub(crate) fn on_error(&self, param: &P, support: &TaskSupport<P>, error: &EngineError) {
        self.error.on_error(param, support, error)
    }
}

/// Collects interceptors; a second implementation for one point fails at [`build`](Self::build).
pub struct InterceptorChainBuilder<P> {
    pre: Option<Arc<dyn PreInterceptor<P>>>,
    post: Option<Arc<dyn PostInterceptor<P>>>,
    error: Option<Arc<dyn ErrorInterceptor<P>>>,
    interrupt_on_error: bool,
    duplicate: Option<&'static str>,
}

impl<P> Default for InterceptorChainBuilder<P> {
    fn default() -> Self {
        Self {
            pre: None,
            post: None,
            error: None,
            interrupt_on_error: false,
            duplicate: None,
        }
    }
}

impl<P: 'static> InterceptorChainBuilder<P> {
    pub fn pre(mut self, interceptor: impl PreInterceptor<P> + 'static) -> Self {
        if self.pre.is_some() {
            self.duplicate.get_or_insert("pre");
        }
        self.pre = Some(Arc::new(interceptor));
        self
    }

    pub fn post(mut self, interceptor: impl PostInterceptor<P> + 'static) -> Self {
        if self.post.is_some() {
            self.duplicate.get_or_insert("post");
        }
        self.post = Some(Arc::new(interceptor));
        self
    }

    pub fn error(mut self, interceptor: impl ErrorInterceptor<P> + 'static) -> Self {
        if self.error.is_some() {
            self.duplicate.get_or_insert("error");
        }
        self.error = Some(Arc::new(interceptor));
        self
    }

    /// Whether the default error interceptor stops the flow
    pub fn interrupt_on_error(mut self, interrupt: bool) -> Self {
        self.interrupt_on_error = interrupt;
        self
    }

    pub fn build(self) -> EngineResult<InterceptorChain<P>> {
        if let Some(point) = self.duplicate {
            return Err(EngineError::DuplicateInterceptor(point));
        }
        let defaults = InterceptorChain::defaults(self.interrupt_on_error);
        Ok(InterceptorChain {
            pre: self.pre.unwrap_or(defaults.pre),
            post: self.post.unwrap_or(defaults.post),
            error: self.error.unwrap_or(defaults.error),
        })
    }
}
