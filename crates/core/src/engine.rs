//! The engine facade: registry, compiled flows, pools and interceptors behind one handle.

use crate::config::{EngineConfig, LogConfig, RuleConfig};
use crate::error::{EngineError, EngineResult};
use crate::interceptor::{
    ErrorInterceptor, InterceptorChain, InterceptorChainBuilder, PostInterceptor, PreInterceptor,
};
use crate::pool::{PoolStats, ThreadPoolFactory};
use crate::registry::TaskRegistry;
use crate::task::TaskDefinition;
use crate::workflow::{
    AggregateResult, DependencyGraph, ExecuteOptions, FlowExecutor, ResultKeyFn, RuleParser,
};
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tokio::task::JoinHandle;

/// A compiled flow with its per-rule overrides
struct CompiledRule<P> {
    graph: Arc<DependencyGraph<P>>,
    timeout: Duration,
    log: LogConfig,
    timeout_override: Option<u64>,
    log_override: Option<LogConfig>,
}

pub struct Engine<P> {
    config: EngineConfig,
    registry: Arc<TaskRegistry<P>>,
    parser: RuleParser,
    rules: RwLock<HashMap<String, Arc<CompiledRule<P>>>>,
    executor: FlowExecutor<P>,
}

impl<P> Engine<P>
where
    P: Send + Sync + 'static,
{
    pub fn builder(config: EngineConfig) -> EngineBuilder<P> {
        EngineBuilder::new(config)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<TaskRegistry<P>> {
        &self.registry
    }

    /// Compiled graph of a flow
    pub fn graph(&self, flow: &str) -> Option<Arc<DependencyGraph<P>>> {
        self.read_rules()
            .get(flow)
            .map(|rule| Arc::clone(&rule.graph))
    }

    pub fn rule_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.read_rules().keys().cloned().collect();
        names.sort();
        names
    }

    /// Compile and install a rule, replacing any rule of the same name
    pub fn add_rule(&self, rule: RuleConfig) -> EngineResult<()> {
        let compiled = self.compile(&rule)?;
        self.write_rules().insert(rule.name.clone(), Arc::new(compiled));
        tracing::info!(rule = %rule.name, "installed rule");
        Ok(())
    }

    /// Recompile a flow from new rule text and swap it in.
    ///
    /// Per-rule overrides of the existing flow are kept. On error the previous graph stays.
    pub fn reload_rule(&self, name: &str, content: &str) -> EngineResult<()> {
        let mut rule = RuleConfig::new(name, content);
        if let Some(existing) = self.read_rules().get(name) {
            rule.timeout_ms = existing.timeout_override;
            rule.log = existing.log_override;
        }

        let compiled = match self.compile(&rule) {
            Ok(compiled) => compiled,
            Err(e) => {
                tracing::error!(rule = %name, error = %e, "rule reload failed, keeping previous graph");
                return Err(e);
            }
        };
        self.write_rules().insert(name.to_string(), Arc::new(compiled));
        tracing::info!(rule = %name, "reloaded rule");
        Ok(())
    }

    /// Remove a flow; invocations already running keep their graph
    pub fn remove_rule(&self, name: &str) -> bool {
        let removed = self.write_rules().remove(name).is_some();
        if removed {
            tracing::info!(rule = %name, "removed rule");
        }
        removed
    }

    /// Run a flow with the rule's or the engine's whole-flow timeout
    pub async fn execute(&self, flow: &str, param: P) -> EngineResult<AggregateResult> {
        self.execute_with(flow, param, ExecuteOptions::default()).await
    }

    /// Run a flow with per-call overrides.
    ///
    /// With `catchable` configured, the first task failure is returned as the error.
    pub async fn execute_with(
        &self,
        flow: &str,
        param: P,
        options: ExecuteOptions,
    ) -> EngineResult<AggregateResult> {
        let rule = self
            .read_rules()
            .get(flow)
            .cloned()
            .ok_or_else(|| EngineError::UnknownFlow(flow.to_string()))?;

        let timeout = options.timeout.unwrap_or(rule.timeout);
        let result = self
            .executor
            .execute_with_params(
                Arc::clone(&rule.graph),
                Arc::new(param),
                options.task_params,
                timeout,
                rule.log,
            )
            .await;

        match result.first_failure() {
            Some(failure) if self.config.catchable => Err(failure.clone()),
            _ => Ok(result),
        }
    }

    /// Run a flow in the background on the caller's runtime
    pub fn submit(
        self: &Arc<Self>,
        flow: impl Into<String>,
        param: P,
    ) -> JoinHandle<EngineResult<AggregateResult>> {
        let engine = Arc::clone(self);
        let flow = flow.into();
        tokio::spawn(async move { engine.execute(&flow, param).await })
    }

    /// Admission counters of a pool; `None` is the shared pool
    pub fn pool_stats(&self, pool: Option<&str>) -> EngineResult<PoolStats> {
        Ok(self.executor.pools().pool_for(pool)?.stats())
    }

    /// Shut down every worker pool. Later invocations record their tasks as rejected.
    pub fn shutdown(&self) {
        self.executor.pools().shutdown();
    }

    fn compile(&self, rule: &RuleConfig) -> EngineResult<CompiledRule<P>> {
        let graph = self.parser.compile(&rule.name, &rule.content, &self.registry)?;
        Ok(CompiledRule {
            graph: Arc::new(graph),
            timeout: rule
                .timeout_ms
                .map(Duration::from_millis)
                .unwrap_or_else(|| self.config.timeout()),
            log: rule.log.unwrap_or(self.config.log),
            timeout_override: rule.timeout_ms,
            log_override: rule.log,
        })
    }

    fn read_rules(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, Arc<CompiledRule<P>>>> {
        self.rules.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_rules(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, Arc<CompiledRule<P>>>> {
        self.rules.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<P> std::fmt::Debug for Engine<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let rules: Vec<String> = self
            .rules
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        f.debug_struct("Engine")
            .field("rules", &rules)
            .field("tasks", &self.registry.len())
            .finish_non_exhaustive()
    }
}

/// Assembles an [`Engine`]; every startup error surfaces from [`build`](Self::build).
pub struct EngineBuilder<P> {
    config: EngineConfig,
    registry: Option<Arc<TaskRegistry<P>>>,
    tasks: Vec<TaskDefinition<P>>,
    interceptors: InterceptorChainBuilder<P>,
    key_fn: ResultKeyFn,
}

impl<P> EngineBuilder<P>
where
    P: Send + Sync + 'static,
{
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            registry: None,
            tasks: Vec::new(),
            interceptors: InterceptorChain::builder(),
            key_fn: crate::workflow::support::identity_key(),
        }
    }

    /// Use a registry populated elsewhere
    pub fn registry(mut self, registry: Arc<TaskRegistry<P>>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Register a task when the engine is built
    pub fn task(mut self, definition: TaskDefinition<P>) -> Self {
        self.tasks.push(definition);
        self
    }

    /// Add a rule on top of those in the configuration
    pub fn rule(mut self, name: impl Into<String>, content: impl Into<String>) -> Self {
        self.config.rules.push(RuleConfig::new(name, content));
        self
    }

    pub fn pre_interceptor(mut self, interceptor: impl PreInterceptor<P> + 'static) -> Self {
        self.interceptors = self.interceptors.pre(interceptor);
        self
    }

    pub fn post_interceptor(mut self, interceptor: impl PostInterceptor<P> + 'static) -> Self {
        self.interceptors = self.interceptors.post(interceptor);
        self
    }

    pub fn error_interceptor(mut self, interceptor: impl ErrorInterceptor<P> + 'static) -> Self {
        self.interceptors = self.interceptors.error(interceptor);
        self
    }

    /// Default result key of a task that declares none
    pub fn result_key_fn(mut self, key_fn: impl Fn(&str) -> String + Send + Sync + 'static) -> Self {
        self.key_fn = Arc::new(key_fn);
        self
    }

    pub fn build(self) -> EngineResult<Engine<P>> {
        self.config.validate()?;

        let interceptors = self
            .interceptors
            .interrupt_on_error(self.config.interrupt_on_error)
            .build()?;

        let registry = self.registry.unwrap_or_default();
        for definition in self.tasks {
            registry.register(definition)?;
        }

        let parser = RuleParser::from_config(&self.config);
        let pools = ThreadPoolFactory::new(self.config.thread_pool.clone(), self.config.pools.clone())?;
        let executor = FlowExecutor::new(Arc::new(pools), interceptors, self.key_fn);

        let engine = Engine {
            registry,
            parser,
            rules: RwLock::new(HashMap::new()),
            executor,
            config: self.config,
        };
        for rule in engine.config.rules.clone() {
            engine.add_rule(rule)?;
        }

        tracing::info!(
            rules = engine.rule_names().len(),
            tasks = engine.registry.len(),
            "engine ready"
        );
        Ok(engine)
    }
}
