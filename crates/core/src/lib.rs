// Core of the Conflux task orchestration engine

pub mod config;
pub mod engine;
pub mod error;
pub mod interceptor;
pub mod pool;
pub mod registry;
pub mod task;
pub mod types;
pub mod workflow;

pub use config::{EngineConfig, LogConfig, PoolConfig, RejectionPolicy, RuleConfig, TimeUnit};
pub use engine::{Engine, EngineBuilder};
pub use error::{EngineError, EngineResult};
pub use interceptor::{
    DefaultErrorInterceptor, ErrorInterceptor, InterceptorChain, PostInterceptor, PreDecision,
    PreInterceptor,
};
pub use pool::{PoolStats, ThreadPoolFactory, WorkerPool};
pub use registry::TaskRegistry;
pub use task::{AsyncTask, TaskConfig, TaskDefinition, TaskDefinitionBuilder};
pub use types::*;
pub use workflow::{
    AggregateResult, DependencyGraph, ExecuteOptions, Outcome, RuleParser, TaskResult, TaskSupport,
};
