use crate::error::{EngineError, EngineResult};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

/// Marker separating tasks that share a position in a chain (`A,B->C`)
pub const PARALLEL_MARKER: char = ',';

/// Engine-wide configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Statement delimiter between chains
    #[serde(default = "default_split")]
    pub split: String,

    /// Edge delimiter inside a chain
    #[serde(default = "default_point")]
    pub point: String,

    /// Whole-flow timeout in milliseconds
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// Whether the default error interceptor interrupts the flow
    #[serde(default)]
    pub interrupt_on_error: bool,

    /// Whether a task failure surfaces to the caller of `execute` as an error
    #[serde(default)]
    pub catchable: bool,

    /// Shared worker pool
    #[serde(default)]
    pub thread_pool: PoolConfig,

    /// Dedicated pools by name
    #[serde(default)]
    pub pools: HashMap<String, PoolConfig>,

    #[serde(default)]
    pub rules: Vec<RuleConfig>,

    #[serde(default)]
    pub log: LogConfig,
}

fn default_split() -> String {
    ";".to_string()
}

fn default_point() -> String {
    "->".to_string()
}

fn default_timeout_ms() -> u64 {
    3000
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            split: default_split(),
            point: default_point(),
            timeout_ms: default_timeout_ms(),
            interrupt_on_error: false,
            catchable: false,
            thread_pool: PoolConfig::default(),
            pools: HashMap::new(),
            rules: Vec::new(),
            log: LogConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from a TOML file, falling back to defaults when it is absent
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::info!("Configuration file {} not found, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read configuration file {}", path.display()))?;
        Self::from_toml_str(&content)
            .with_context(|| format!("Failed to load configuration file {}", path.display()))
    }

    /// Parse and validate configuration from TOML text
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content).context("Failed to parse configuration")?;
        config.validate()?;
        Ok(config)
    }

    /// Whole-flow timeout
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Check structural constraints the parser and pools rely on
    pub fn validate(&self) -> EngineResult<()> {
        if self.split.trim().is_empty() || self.point.trim().is_empty() {
            return Err(EngineError::Config(
                "rule delimiters must not be empty".to_string(),
            ));
        }
        if self.split == self.point {
            return Err(EngineError::Config(format!(
                "statement and edge delimiters are both '{}'",
                self.split
            )));
        }
        if self.split.contains(PARALLEL_MARKER) || self.point.contains(PARALLEL_MARKER) {
            return Err(EngineError::Config(format!(
                "rule delimiters must not contain '{}'",
                PARALLEL_MARKER
            )));
        }
        if self.timeout_ms == 0 {
            return Err(EngineError::Config("timeout_ms must be positive".to_string()));
        }

        self.thread_pool.validate("default")?;
        for (name, pool) in &self.pools {
            pool.validate(name)?;
        }
        for rule in &self.rules {
            if rule.timeout_ms == Some(0) {
                return Err(EngineError::Config(format!(
                    "rule '{}' has a zero timeout",
                    rule.name
                )));
            }
        }

        Ok(())
    }
}

/// A named dependency rule (one flow)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleConfig {
    pub name: String,

    /// Rule text, e.g. `A->B->C;B->D`
    pub content: String,

    /// Overrides the engine's whole-flow timeout
    #[serde(default)]
    pub timeout_ms: Option<u64>,

    /// Overrides the engine's log switches
    #[serde(default)]
    pub log: Option<LogConfig>,
}

impl RuleConfig {
    pub fn new(name: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            content: content.into(),
            timeout_ms: None,
            log: None,
        }
    }
}

/// Log switches for task execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogConfig {
    /// Log task failures with their cause
    #[serde(default = "default_true")]
    pub err_log: bool,

    /// Log the elapsed time of each task
    #[serde(default = "default_true")]
    pub cost_log: bool,
}

fn default_true() -> bool {
    true
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            err_log: true,
            cost_log: true,
        }
    }
}

/// What a saturated pool does with a new job
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum RejectionPolicy {
    #[default]
    #[serde(alias = "AbortPolicy", alias = "abort")]
    Abort,
    #[serde(alias = "DiscardPolicy", alias = "discard")]
    Discard,
    #[serde(alias = "CallerRunsPolicy", alias = "caller_runs")]
    CallerRuns,
    #[serde(alias = "DiscardOldestPolicy", alias = "discard_oldest")]
    DiscardOldest,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeUnit {
    #[default]
    Milliseconds,
    Seconds,
    Minutes,
}

impl TimeUnit {
    pub fn duration(&self, amount: u64) -> Duration {
        match self {
            TimeUnit::Milliseconds => Duration::from_millis(amount),
            TimeUnit::Seconds => Duration::from_secs(amount),
            TimeUnit::Minutes => Duration::from_secs(amount.saturating_mul(60)),
        }
    }
}

/// Worker pool sizing and admission settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Worker threads of the pool's runtime
    #[serde(default = "default_core_size")]
    pub core_size: usize,

    /// Jobs allowed to run at once
    #[serde(default = "default_max_size")]
    pub max_size: usize,

    #[serde(default = "default_keep_alive")]
    pub keep_alive: u64,

    #[serde(default)]
    pub time_unit: TimeUnit,

    /// Jobs allowed to wait for a running slot
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    #[serde(default)]
    pub rejection: RejectionPolicy,

    #[serde(default = "default_thread_name_prefix")]
    pub thread_name_prefix: String,

    /// Retire the runtime's idle blocking threads after `keep_alive`.
    ///
    /// Async worker threads (`core_size`) are never retired, and `max_size` is enforced by the
    /// pool's admission gate rather than by thread count.
    #[serde(default)]
    pub allow_core_thread_timeout: bool,
}

fn default_core_size() -> usize {
    let cpus = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    cpus * 5
}

fn default_max_size() -> usize {
    let core = default_core_size();
    core + (core >> 1)
}

fn default_keep_alive() -> u64 {
    30_000
}

fn default_queue_capacity() -> usize {
    10_000
}

fn default_thread_name_prefix() -> String {
    "conflux-".to_string()
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            core_size: default_core_size(),
            max_size: default_max_size(),
            keep_alive: default_keep_alive(),
            time_unit: TimeUnit::default(),
            queue_capacity: default_queue_capacity(),
            rejection: RejectionPolicy::default(),
            thread_name_prefix: default_thread_name_prefix(),
            allow_core_thread_timeout: false,
        }
    }
}

impl PoolConfig {
    /// A small pool, handy for tests and dedicated pools
    pub fn fixed(size: usize, queue_capacity: usize) -> Self {
        Self {
            core_size: size,
            max_size: size,
            queue_capacity,
            ..Default::default()
        }
    }

    pub fn with_rejection(mut self, rejection: RejectionPolicy) -> Self {
        self.rejection = rejection;
        self
    }

    pub fn keep_alive_duration(&self) -> Duration {
        self.time_unit.duration(self.keep_alive)
    }

    pub fn validate(&self, name: &str) -> EngineResult<()> {
        if self.core_size == 0 {
            return Err(EngineError::Config(format!(
                "pool '{}' needs at least one core thread",
                name
            )));
        }
        if self.max_size < self.core_size {
            return Err(EngineError::Config(format!(
                "pool '{}' has max_size {} below core_size {}",
                name, self.max_size, self.core_size
            )));
        }
        Ok(())
    }
}
