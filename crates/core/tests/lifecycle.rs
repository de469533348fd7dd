mod common;

use async_trait::async_trait;
use common::{config, init_tracing, scripted, Recorder, Scripted};
use conflux_core::{
    AsyncTask, Engine, EngineConfig, EngineError, ExecuteOptions, InvocationState, Outcome,
    PoolConfig, PoolStats, PostInterceptor, PreDecision, PreInterceptor, TaskDefinition, TaskState,
    TaskSupport,
};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Panics while preparing, before any attempt
struct BrokenSetup;

#[async_trait]
impl AsyncTask<()> for BrokenSetup {
    type Output = ();

    fn prepare(&self, _param: &()) {
        panic!("setup exploded");
    }

    async fn task(&self, _param: &(), _support: &TaskSupport<()>) -> anyhow::Result<()> {
        Ok(())
    }
}

struct PanicsAfter(&'static str);

impl PostInterceptor<()> for PanicsAfter {
    fn after(&self, _param: &(), support: &TaskSupport<()>) {
        if support.task_name() == self.0 {
            panic!("post hook exploded");
        }
    }
}

/// Counts calls; vetoes every retry when `veto_retries` is set
#[derive(Default)]
struct CountingPre {
    calls: Arc<AtomicU32>,
    veto_retries: bool,
}

impl PreInterceptor<()> for CountingPre {
    fn before(&self, _param: &(), support: &TaskSupport<()>) -> PreDecision {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.veto_retries && support.attempt() > 1 {
            PreDecision::Veto("no retries today".to_string())
        } else {
            PreDecision::Proceed
        }
    }
}

fn single_slot() -> EngineConfig {
    EngineConfig {
        thread_pool: PoolConfig::fixed(1, 16),
        ..config()
    }
}

fn lifecycle_panicked(task: &str) -> EngineError {
    EngineError::TaskExecution {
        task: task.to_string(),
        message: "task lifecycle panicked".to_string(),
    }
}

async fn wait_until_idle(engine: &Engine<()>) {
    for _ in 0..100 {
        if engine.pool_stats(None).unwrap() == (PoolStats { running: 0, queued: 0 }) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("shared pool never drained");
}

#[tokio::test]
async fn test_panic_in_prepare_fails_task_and_frees_pool() {
    init_tracing();
    let recorder = Recorder::new();
    let engine = Engine::<()>::builder(single_slot())
        .task(TaskDefinition::builder("A", BrokenSetup).build().unwrap())
        .task(scripted("B", &recorder))
        .rule("flow", "A->B")
        .build()
        .unwrap();
    let options = || ExecuteOptions::with_timeout(Duration::from_secs(2));

    let result = engine.execute_with("flow", (), options()).await.unwrap();

    assert_eq!(result.outcome(), Outcome::CompletedWithFailures);
    assert_eq!(result.task_state("A"), Some(TaskState::Failed));
    assert_eq!(result.result("A").and_then(|r| r.error()), Some(&lifecycle_panicked("A")));
    assert_eq!(result.task_state("B"), Some(TaskState::Succeeded));
    assert!(result.result("B").unwrap().is_degraded());
    assert!(result.elapsed() < Duration::from_secs(1));
    wait_until_idle(&engine).await;

    // The single pool slot survived the panic
    let again = engine.execute_with("flow", (), options()).await.unwrap();
    assert_eq!(again.outcome(), Outcome::CompletedWithFailures);
    assert_eq!(recorder.runs("B"), 2);
}

#[tokio::test]
async fn test_panic_in_post_interceptor_fails_task() {
    init_tracing();
    let recorder = Recorder::new();
    let engine = Engine::<()>::builder(single_slot())
        .task(scripted("A", &recorder))
        .task(scripted("B", &recorder))
        .rule("flow", "A->B")
        .post_interceptor(PanicsAfter("A"))
        .build()
        .unwrap();

    let result = engine.execute("flow", ()).await.unwrap();

    assert_eq!(result.state(), InvocationState::Failed);
    assert_eq!(result.first_failure(), Some(&lifecycle_panicked("A")));
    assert_eq!(result.task_state("B"), Some(TaskState::Succeeded));
    wait_until_idle(&engine).await;
}

#[tokio::test]
async fn test_pre_interceptor_runs_before_every_attempt() {
    init_tracing();
    let recorder = Recorder::new();
    let pre = CountingPre::default();
    let calls = Arc::clone(&pre.calls);
    let engine = Engine::<()>::builder(config())
        .task(
            TaskDefinition::builder("A", Scripted::new(&recorder).failing(2))
                .retry(2)
                .build()
                .unwrap(),
        )
        .rule("flow", "A")
        .pre_interceptor(pre)
        .build()
        .unwrap();

    let result = engine.execute("flow", ()).await.unwrap();

    let a = result.result("A").unwrap();
    assert!(a.is_success());
    assert_eq!(a.attempts(), 3);
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_vetoed_retry_ends_with_last_failure() {
    init_tracing();
    let recorder = Recorder::new();
    let pre = CountingPre {
        veto_retries: true,
        ..Default::default()
    };
    let calls = Arc::clone(&pre.calls);
    let engine = Engine::<()>::builder(config())
        .task(
            TaskDefinition::builder("A", Scripted::new(&recorder).always_failing())
                .retry(3)
                .build()
                .unwrap(),
        )
        .rule("flow", "A")
        .pre_interceptor(pre)
        .build()
        .unwrap();

    let result = engine.execute("flow", ()).await.unwrap();

    assert_eq!(result.task_state("A"), Some(TaskState::Failed));
    assert_eq!(result.result("A").unwrap().attempts(), 1);
    assert_eq!(recorder.runs("A"), 1);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}
