//! Worker pools.
//!
//! Each [`WorkerPool`] owns a dedicated multi-thread tokio runtime and an admission gate:
//! at most `max_size` jobs run at once and at most `queue_capacity` wait in FIFO order.
//! Beyond that the pool's [`RejectionPolicy`] decides what happens to the new job.

use crate::config::{PoolConfig, RejectionPolicy};
use crate::error::{EngineError, EngineResult};
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use tokio::runtime::{Handle, Runtime};

/// Name of the shared pool.
pub const DEFAULT_POOL: &str = "default";

pub type JobFuture = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// Why a pool refused a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    /// Refused under the abort policy, or the pool is shut down
    Aborted,
    /// Dropped under the discard or discard-oldest policy
    Discarded,
}

/// Work submitted to a pool.
pub trait PoolJob: Send + 'static {
    fn run(self: Box<Self>) -> JobFuture;

    /// Called instead of `run` when the pool refuses or drops the job.
    fn reject(self: Box<Self>, pool: &str, rejection: Rejection);
}

/// Point-in-time admission counters of a pool.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub running: usize,
    pub queued: usize,
}

struct PoolState {
    running: usize,
    queue: VecDeque<Box<dyn PoolJob>>,
    shutdown: bool,
}

pub struct WorkerPool {
    name: String,
    config: PoolConfig,
    handle: Handle,
    runtime: Mutex<Option<Runtime>>,
    state: Mutex<PoolState>,
}

impl WorkerPool {
    /// Start a pool runtime with the given settings
    pub fn new(name: impl Into<String>, config: PoolConfig) -> EngineResult<Arc<Self>> {
        let name = name.into();
        config.validate(&name)?;

        let prefix = config.thread_name_prefix.clone();
        let counter = AtomicUsize::new(0);
        let mut builder = tokio::runtime::Builder::new_multi_thread();
        builder
            .worker_threads(config.core_size)
            .thread_name_fn(move || {
                format!("{}{}", prefix, counter.fetch_add(1, Ordering::Relaxed))
            })
            .enable_all();
        // Worker threads live as long as the runtime; only spare blocking threads time out
        if config.allow_core_thread_timeout {
            builder.thread_keep_alive(config.keep_alive_duration());
        }

        let runtime = builder.build().map_err(|e| EngineError::PoolSetup {
            pool: name.clone(),
            message: e.to_string(),
        })?;

        tracing::debug!(
            pool = %name,
            core_size = config.core_size,
            max_size = config.max_size,
            queue_capacity = config.queue_capacity,
            rejection = ?config.rejection,
            "started worker pool"
        );

        Ok(Arc::new(Self {
            name,
            handle: runtime.handle().clone(),
            runtime: Mutex::new(Some(runtime)),
            state: Mutex::new(PoolState {
                running: 0,
                queue: VecDeque::new(),
                shutdown: false,
            }),
            config,
        }))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.lock_state();
        PoolStats {
            running: state.running,
            queued: state.queue.len(),
        }
    }

    /// Admit, queue or reject a job
    pub fn submit(self: &Arc<Self>, job: Box<dyn PoolJob>) {
        let mut state = self.lock_state();

        if state.shutdown {
            drop(state);
            job.reject(&self.name, Rejection::Aborted);
            return;
        }

        if state.running < self.config.max_size {
            state.running += 1;
            drop(state);
            self.spawn(job);
            return;
        }

        if state.queue.len() < self.config.queue_capacity {
            state.queue.push_back(job);
            return;
        }

        match self.config.rejection {
            RejectionPolicy::Abort => {
                drop(state);
                tracing::warn!(pool = %self.name, "pool saturated, aborting job");
                job.reject(&self.name, Rejection::Aborted);
            }
            RejectionPolicy::Discard => {
                drop(state);
                tracing::warn!(pool = %self.name, "pool saturated, discarding job");
                job.reject(&self.name, Rejection::Discarded);
            }
            RejectionPolicy::DiscardOldest => {
                let oldest = state.queue.pop_front();
                match oldest {
                    Some(oldest) => {
                        state.queue.push_back(job);
                        drop(state);
                        tracing::warn!(pool = %self.name, "pool saturated, discarding oldest job");
                        oldest.reject(&self.name, Rejection::Discarded);
                    }
                    None => {
                        drop(state);
                        job.reject(&self.name, Rejection::Discarded);
                    }
                }
            }
            RejectionPolicy::CallerRuns => {
                drop(state);
                match Handle::try_current() {
                    Ok(caller) => {
                        tracing::debug!(pool = %self.name, "pool saturated, running job on caller");
                        caller.spawn(job.run());
                    }
                    Err(_) => job.reject(&self.name, Rejection::Aborted),
                }
            }
        }
    }

    /// Stop the runtime; queued jobs are rejected, running jobs are abandoned at their next await
    pub fn shutdown(&self) {
        let queued: Vec<Box<dyn PoolJob>> = {
            let mut state = self.lock_state();
            if state.shutdown {
                return;
            }
            state.shutdown = true;
            state.queue.drain(..).collect()
        };
        for job in queued {
            job.reject(&self.name, Rejection::Aborted);
        }

        let runtime = self
            .runtime
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(runtime) = runtime {
            runtime.shutdown_background();
        }
        tracing::debug!(pool = %self.name, "worker pool shut down");
    }

    pub fn is_shutdown(&self) -> bool {
        self.lock_state().shutdown
    }

    fn spawn(self: &Arc<Self>, job: Box<dyn PoolJob>) {
        let slot = Slot(Arc::clone(self));
        self.handle.spawn(async move {
            let _slot = slot;
            job.run().await;
        });
    }

    /// Hand the slot to the next queued job, or free it
    fn job_finished(self: &Arc<Self>) {
        let next = {
            let mut state = self.lock_state();
            match state.queue.pop_front() {
                Some(job) => Some(job),
                None => {
                    state.running = state.running.saturating_sub(1);
                    None
                }
            }
        };
        if let Some(job) = next {
            self.spawn(job);
        }
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// An admitted job's running slot, handed on when the job ends, panics or is dropped
struct Slot(Arc<WorkerPool>);

impl Drop for Slot {
    fn drop(&mut self) {
        self.0.job_finished();
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        let runtime = self
            .runtime
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(runtime) = runtime {
            runtime.shutdown_background();
        }
    }
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("name", &self.name)
            .field("config", &self.config)
            .field("stats", &self.stats())
            .finish()
    }
}

/// Owns the shared pool and every dedicated pool
pub struct ThreadPoolFactory {
    default: Arc<WorkerPool>,
    configs: HashMap<String, PoolConfig>,
    dedicated: RwLock<HashMap<String, Arc<WorkerPool>>>,
}

impl ThreadPoolFactory {
    /// Start the shared pool and every configured dedicated pool
    pub fn new(default: PoolConfig, dedicated: HashMap<String, PoolConfig>) -> EngineResult<Self> {
        let default_pool = WorkerPool::new(DEFAULT_POOL, default)?;

        let mut pools = HashMap::new();
        for (name, config) in &dedicated {
            pools.insert(name.clone(), WorkerPool::new(name.clone(), config.clone())?);
        }

        Ok(Self {
            default: default_pool,
            configs: dedicated,
            dedicated: RwLock::new(pools),
        })
    }

    pub fn default_pool(&self) -> &Arc<WorkerPool> {
        &self.default
    }

    /// The pool a task runs on; unknown names get a pool built from the shared configuration
    pub fn pool_for(&self, name: Option<&str>) -> EngineResult<Arc<WorkerPool>> {
        let Some(name) = name else {
            return Ok(Arc::clone(&self.default));
        };
        if name == DEFAULT_POOL {
            return Ok(Arc::clone(&self.default));
        }

        if let Some(pool) = self
            .dedicated
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
        {
            return Ok(Arc::clone(pool));
        }

        let mut pools = self.dedicated.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(pool) = pools.get(name) {
            return Ok(Arc::clone(pool));
        }
        let config = self
            .configs
            .get(name)
            .cloned()
            .unwrap_or_else(|| self.default.config().clone());
        tracing::info!(pool = %name, "creating dedicated pool on demand");
        let pool = WorkerPool::new(name, config)?;
        pools.insert(name.to_string(), Arc::clone(&pool));
        Ok(pool)
    }

    pub fn pool_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .dedicated
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        names.push(DEFAULT_POOL.to_string());
        names.sort();
        names
    }

    /// Shut down every pool
    pub fn shutdown(&self) {
        self.default.shutdown();
        let pools: Vec<Arc<WorkerPool>> = self
            .dedicated
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        for pool in pools {
            pool.shutdown();
        }
    }
}

impl Drop for ThreadPoolFactory {
    fn drop(&mut self) {
        self.shutdown();
    }
}
