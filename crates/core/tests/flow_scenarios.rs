mod common;

use common::{engine, scripted, Recorder, Scripted};
use conflux_core::{
    AsyncTask, Engine, InvocationState, Outcome, SkipReason, TaskDefinition, TaskState, TaskSupport,
};
use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_branching_flow_respects_dependencies() {
    let recorder = Recorder::new();
    let tasks = ["A", "B", "C", "D"]
        .iter()
        .map(|name| {
            TaskDefinition::builder(*name, Scripted::new(&recorder).delay(Duration::from_millis(5)))
                .build()
                .unwrap()
        })
        .collect();
    let engine = engine(tasks, "A->B->C;A->D");

    let result = engine.execute("flow", ()).await.unwrap();

    assert_eq!(result.state(), InvocationState::Completed);
    for name in ["A", "B", "C", "D"] {
        assert_eq!(
            result.get::<String>(name).unwrap().as_str(),
            format!("{}-done", name)
        );
        assert_eq!(recorder.runs(name), 1);
    }
    assert!(recorder.window("B").start >= recorder.window("A").end);
    assert!(recorder.window("D").start >= recorder.window("A").end);
    assert!(recorder.window("C").start >= recorder.window("B").end);
}

#[tokio::test]
async fn test_unnecessary_task_is_skipped_and_successors_run() {
    let recorder = Recorder::new();
    let engine = engine(
        vec![
            scripted("A", &recorder),
            TaskDefinition::builder("B", Scripted::new(&recorder).unnecessary())
                .build()
                .unwrap(),
            scripted("C", &recorder),
        ],
        "A->B->C",
    );

    let result = engine.execute("flow", ()).await.unwrap();

    assert_eq!(result.state(), InvocationState::Completed);
    assert!(result.get::<String>("A").is_some());
    assert!(result.result("B").is_none());
    assert_eq!(
        result.task_state("B"),
        Some(TaskState::Skipped(SkipReason::NotNecessary))
    );
    assert!(!recorder.ran("B"));
    assert!(recorder.ran("C"));
}

#[tokio::test]
async fn test_failed_task_keeps_flow_going_degraded() {
    let recorder = Recorder::new();
    let engine = engine(
        vec![
            TaskDefinition::builder("A", Scripted::new(&recorder).always_failing())
                .retry(2)
                .build()
                .unwrap(),
            scripted("B", &recorder),
        ],
        "A->B",
    );

    let result = engine.execute("flow", ()).await.unwrap();

    assert_eq!(result.state(), InvocationState::Failed);
    assert_eq!(result.outcome(), Outcome::CompletedWithFailures);
    assert_eq!(result.task_state("A"), Some(TaskState::Failed));
    assert_eq!(result.failed_tasks(), vec!["A"]);
    assert_eq!(recorder.runs("A"), 3);

    let a = result.result("A").unwrap();
    assert_eq!(a.attempts(), 3);
    assert!(a.error().is_some());

    let b = result.result("B").unwrap();
    assert!(b.is_success());
    assert!(b.is_degraded());
    assert!(result.cause().is_none());
}

#[tokio::test]
async fn test_retry_then_success() {
    let recorder = Recorder::new();
    let engine = engine(
        vec![TaskDefinition::builder("flaky", Scripted::new(&recorder).failing(2))
            .retry(2)
            .retry_delay(Duration::from_millis(5))
            .build()
            .unwrap()],
        "flaky",
    );

    let result = engine.execute("flow", ()).await.unwrap();

    assert_eq!(result.state(), InvocationState::Completed);
    let flaky = result.result("flaky").unwrap();
    assert!(flaky.is_success());
    assert_eq!(flaky.attempts(), 3);
    let attempts: Vec<u32> = recorder.windows().iter().map(|w| w.attempt).collect();
    assert_eq!(attempts, vec![1, 2, 3]);
}

#[tokio::test]
async fn test_fail_sub_exec_skips_every_descendant() {
    let recorder = Recorder::new();
    let engine = engine(
        vec![
            TaskDefinition::builder("A", Scripted::new(&recorder).always_failing())
                .fail_sub_exec(true)
                .build()
                .unwrap(),
            scripted("B", &recorder),
            scripted("C", &recorder),
            scripted("D", &recorder),
        ],
        "A->B->C;D",
    );

    let result = engine.execute("flow", ()).await.unwrap();

    assert_eq!(result.state(), InvocationState::Failed);
    for name in ["B", "C"] {
        assert_eq!(
            result.task_state(name),
            Some(TaskState::Skipped(SkipReason::UpstreamFailed))
        );
        assert!(!recorder.ran(name));
    }
    assert_eq!(result.task_state("D"), Some(TaskState::Succeeded));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_exclusive_tasks_never_overlap() {
    let recorder = Recorder::new();
    let mut tasks: Vec<TaskDefinition<()>> = ["X1", "X2", "X3"]
        .iter()
        .map(|name| {
            TaskDefinition::builder(*name, Scripted::new(&recorder).delay(Duration::from_millis(20)))
                .exclusive(true)
                .build()
                .unwrap()
        })
        .collect();
    tasks.push(
        TaskDefinition::builder("free", Scripted::new(&recorder).delay(Duration::from_millis(20)))
            .build()
            .unwrap(),
    );
    let engine = engine(tasks, "X1,X2,X3,free");

    let result = engine.execute("flow", ()).await.unwrap();
    assert_eq!(result.state(), InvocationState::Completed);

    let mut exclusive: Vec<_> = recorder
        .windows()
        .into_iter()
        .filter(|w| w.task.starts_with('X'))
        .collect();
    exclusive.sort_by_key(|w| w.start);
    assert_eq!(exclusive.len(), 3);
    for pair in exclusive.windows(2) {
        assert!(
            pair[1].start >= pair[0].end,
            "{} overlapped {}",
            pair[1].task,
            pair[0].task
        );
    }
}

/// Exclusive task that is never needed; would hold the gate for a while if it ran
struct NeverNeeded {
    checked: Arc<Mutex<Option<Instant>>>,
}

#[async_trait]
impl AsyncTask<()> for NeverNeeded {
    type Output = ();

    async fn task(&self, _param: &(), _support: &TaskSupport<()>) -> anyhow::Result<()> {
        tokio::time::sleep(Duration::from_millis(200)).await;
        Ok(())
    }

    fn necessary(&self, _param: &(), _support: &TaskSupport<()>) -> bool {
        *self.checked.lock().unwrap() = Some(Instant::now());
        false
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_unnecessary_exclusive_task_skips_without_the_gate() {
    let recorder = Recorder::new();
    let checked = Arc::new(Mutex::new(None));
    let engine = engine(
        vec![
            TaskDefinition::builder("Y", Scripted::new(&recorder).delay(Duration::from_millis(200)))
                .exclusive(true)
                .build()
                .unwrap(),
            TaskDefinition::builder(
                "X",
                NeverNeeded {
                    checked: Arc::clone(&checked),
                },
            )
            .exclusive(true)
            .build()
            .unwrap(),
        ],
        "Y,X",
    );

    let result = engine.execute("flow", ()).await.unwrap();

    assert_eq!(result.state(), InvocationState::Completed);
    assert_eq!(
        result.task_state("X"),
        Some(TaskState::Skipped(SkipReason::NotNecessary))
    );
    let checked = checked.lock().unwrap().expect("necessity was never checked");
    assert!(checked < recorder.window("Y").end);
}

/// Holds the exclusive gate briefly, then interrupts the flow
struct StopsWhileHolding(Arc<Recorder>);

#[async_trait]
impl AsyncTask<()> for StopsWhileHolding {
    type Output = ();

    async fn task(&self, _param: &(), support: &TaskSupport<()>) -> anyhow::Result<()> {
        tokio::time::sleep(Duration::from_millis(100)).await;
        support.stop("gate holder done");
        let now = Instant::now();
        self.0.record_run(support, now);
        Ok(())
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_task_waiting_on_exclusive_gate_is_cancelled_by_stop() {
    let recorder = Recorder::new();
    let tasks = ["E1", "E2"]
        .iter()
        .map(|name| {
            TaskDefinition::builder(*name, StopsWhileHolding(Arc::clone(&recorder)))
                .exclusive(true)
                .build()
                .unwrap()
        })
        .collect();
    let engine = engine(tasks, "E1,E2");

    let result = engine.execute("flow", ()).await.unwrap();

    assert_eq!(result.outcome(), Outcome::Interrupted);
    let mut states: Vec<TaskState> = ["E1", "E2"]
        .iter()
        .map(|name| result.task_state(name).unwrap())
        .collect();
    states.sort_by_key(|state| *state == TaskState::Cancelled);
    assert_eq!(states, vec![TaskState::Succeeded, TaskState::Cancelled]);
    assert_eq!(recorder.windows().len(), 1);
}

struct ReadsUser;

#[async_trait]
impl AsyncTask<()> for ReadsUser {
    type Output = String;

    async fn task(&self, _param: &(), support: &TaskSupport<()>) -> anyhow::Result<String> {
        let user = support
            .get_result::<String>("loadUser")
            .ok_or_else(|| anyhow::anyhow!("user missing"))?;
        Ok(format!("greeting {}", user))
    }
}

#[tokio::test]
async fn test_default_result_key_function() {
    let recorder = Recorder::new();
    let engine = Engine::<()>::builder(common::config())
        .task(scripted("LoadUser", &recorder))
        .task(TaskDefinition::builder("Greet", ReadsUser).build().unwrap())
        .rule("greet", "LoadUser->Greet")
        .result_key_fn(|name| {
            let mut chars = name.chars();
            match chars.next() {
                Some(first) => first.to_lowercase().chain(chars).collect(),
                None => String::new(),
            }
        })
        .build()
        .unwrap();

    let result = engine.execute("greet", ()).await.unwrap();

    assert_eq!(result.state(), InvocationState::Completed);
    assert_eq!(
        result.get::<String>("Greet").unwrap().as_str(),
        "greeting LoadUser-done"
    );
    assert!(result.results().contains_key("loadUser"));
    assert!(result.get::<String>("LoadUser").is_some());
}

#[tokio::test]
async fn test_concurrent_invocations_are_isolated() {
    let recorder = Recorder::new();
    let engine = std::sync::Arc::new(engine(
        vec![scripted("A", &recorder), scripted("B", &recorder)],
        "A->B",
    ));

    let handles: Vec<_> = (0..8).map(|_| engine.submit("flow", ())).collect();
    let mut ids = std::collections::HashSet::new();
    for handle in handles {
        let result = handle.await.unwrap().unwrap();
        assert_eq!(result.state(), InvocationState::Completed);
        ids.insert(result.execution_id());
    }

    assert_eq!(ids.len(), 8);
    assert_eq!(recorder.runs("A"), 8);
    assert_eq!(recorder.runs("B"), 8);
}
