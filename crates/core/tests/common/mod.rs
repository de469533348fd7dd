#![allow(dead_code)]

use async_trait::async_trait;
use conflux_core::{
    AsyncTask, Engine, EngineConfig, ExecutionId, PoolConfig, TaskDefinition, TaskSupport,
};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, Once};
use std::time::{Duration, Instant};
use tracing_subscriber::{fmt, EnvFilter};

static INIT: Once = Once::new();

/// Captured per test; shown for failing tests or with `--nocapture`.
pub fn init_tracing() {
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
        let _ = fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init();
    });
}

/// One observed execution window of a task body
#[derive(Debug, Clone)]
pub struct Window {
    pub execution: ExecutionId,
    pub task: String,
    pub attempt: u32,
    pub start: Instant,
    pub end: Instant,
}

#[derive(Default)]
pub struct Recorder {
    windows: Mutex<Vec<Window>>,
}

impl Recorder {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn record(&self, window: Window) {
        self.windows.lock().unwrap().push(window);
    }

    /// Record a zero-length window for tasks that are not [`Scripted`]
    pub fn record_run<P>(&self, support: &TaskSupport<P>, at: Instant) {
        self.record(Window {
            execution: support.execution_id(),
            task: support.task_name().to_string(),
            attempt: support.attempt(),
            start: at,
            end: at,
        });
    }

    pub fn windows(&self) -> Vec<Window> {
        self.windows.lock().unwrap().clone()
    }

    pub fn runs(&self, task: &str) -> usize {
        self.windows().iter().filter(|w| w.task == task).count()
    }

    pub fn ran(&self, task: &str) -> bool {
        self.runs(task) > 0
    }

    /// Last window of a task
    pub fn window(&self, task: &str) -> Window {
        self.windows()
            .into_iter()
            .filter(|w| w.task == task)
            .last()
            .unwrap_or_else(|| panic!("task {} never ran", task))
    }

    /// Windows of one invocation only
    pub fn windows_of(&self, execution: ExecutionId) -> Vec<Window> {
        self.windows()
            .into_iter()
            .filter(|w| w.execution == execution)
            .collect()
    }

    pub fn counts(&self) -> HashMap<String, usize> {
        let mut counts = HashMap::new();
        for window in self.windows() {
            *counts.entry(window.task).or_insert(0) += 1;
        }
        counts
    }
}

/// Configurable test task: sleeps, records its window, fails its first `failures` attempts
pub struct Scripted {
    recorder: Arc<Recorder>,
    delay: Duration,
    failures: u32,
    necessary: bool,
}

impl Scripted {
    pub fn new(recorder: &Arc<Recorder>) -> Self {
        Self {
            recorder: Arc::clone(recorder),
            delay: Duration::ZERO,
            failures: 0,
            necessary: true,
        }
    }

    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn failing(mut self, failures: u32) -> Self {
        self.failures = failures;
        self
    }

    pub fn always_failing(self) -> Self {
        self.failing(u32::MAX)
    }

    pub fn unnecessary(mut self) -> Self {
        self.necessary = false;
        self
    }
}

#[async_trait]
impl AsyncTask<()> for Scripted {
    type Output = String;

    async fn task(&self, _param: &(), support: &TaskSupport<()>) -> anyhow::Result<String> {
        let start = Instant::now();
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.recorder.record(Window {
            execution: support.execution_id(),
            task: support.task_name().to_string(),
            attempt: support.attempt(),
            start,
            end: Instant::now(),
        });

        if support.attempt() <= self.failures {
            anyhow::bail!("attempt {} failed", support.attempt());
        }
        Ok(format!("{}-done", support.task_name()))
    }

    fn necessary(&self, _param: &(), _support: &TaskSupport<()>) -> bool {
        self.necessary
    }
}

pub fn config() -> EngineConfig {
    EngineConfig {
        thread_pool: PoolConfig::fixed(4, 256),
        timeout_ms: 5_000,
        ..Default::default()
    }
}

pub fn engine(tasks: Vec<TaskDefinition<()>>, rule: &str) -> Engine<()> {
    init_tracing();
    let mut builder = Engine::<()>::builder(config()).rule("flow", rule);
    for task in tasks {
        builder = builder.task(task);
    }
    builder.build().unwrap()
}

pub fn scripted(name: &str, recorder: &Arc<Recorder>) -> TaskDefinition<()> {
    TaskDefinition::builder(name, Scripted::new(recorder)).build().unwrap()
}
