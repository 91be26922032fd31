use std::io::Read;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use jobflow::batch::{BatchSystem, ExitStatus};
use jobflow::dag::{Job, JobGraph, JobState};
use jobflow::engine::{LeaderCommand, RecoveredRun, RunOutcome, recover_run, start_run};
use jobflow::errors::{JobflowError, StoreError, StoreResult};
use jobflow::execute;
use jobflow::store::checkpoint::{load_job, load_run, save_job, save_run};
use jobflow::store::{FileId, JobStore, MemoryJobStore, keys};
use jobflow_test_utils::{FakeBatchSystem, JobBuilder, WorkflowBuilder, wait_until, with_timeout};

use crate::common::{TestResult, init_tracing, plan, run_to_end};

/// Memory store that refuses to record one job as completed, like a leader
/// dying halfway through a checkpoint.
#[derive(Debug)]
struct TornCompletionStore {
    inner: MemoryJobStore,
    key: String,
}

impl JobStore for TornCompletionStore {
    fn put(&self, key: &str, value: &[u8]) -> StoreResult<()> {
        self.inner.put(key, value)
    }

    fn get(&self, key: &str) -> StoreResult<Vec<u8>> {
        self.inner.get(key)
    }

    fn update(&self, key: &str, value: &[u8]) -> StoreResult<()> {
        if key == self.key && String::from_utf8_lossy(value).contains("\"Completed\"") {
            return Err(StoreError::Io(std::io::Error::other("disk went away")));
        }
        self.inner.update(key, value)
    }

    fn delete(&self, key: &str) -> StoreResult<()> {
        self.inner.delete(key)
    }

    fn exists(&self, key: &str) -> StoreResult<bool> {
        self.inner.exists(key)
    }

    fn list(&self, prefix: &str) -> StoreResult<Vec<String>> {
        self.inner.list(prefix)
    }

    fn put_file(&self, contents: &[u8]) -> StoreResult<FileId> {
        self.inner.put_file(contents)
    }

    fn read_file(&self, id: &str) -> StoreResult<Box<dyn Read + Send>> {
        self.inner.read_file(id)
    }

    fn delete_file(&self, id: &str) -> StoreResult<()> {
        self.inner.delete_file(id)
    }
}

/// Materialize A -> B and leave A issued as `batch_job_id`, as a leader that
/// crashed right after issuing would.
fn crashed_with_a_in_flight(run_id: &str, a_retries: u32, batch_job_id: u64) -> MemoryJobStore {
    let store = MemoryJobStore::new();
    let jobs = WorkflowBuilder::new()
        .job(JobBuilder::new("A", "true").retries(a_retries))
        .simple("B", &["A"])
        .build();
    let (mut scheduler, _record) = start_run(&store, run_id, &jobs).expect("start");
    let step = scheduler.mark_issued("A", batch_job_id).expect("issue");
    for id in &step.checkpoint {
        let job = scheduler.graph().get(id).expect("job");
        save_job(&store, run_id, job).expect("checkpoint");
    }
    store
}

fn restart_plan(run_id: &str) -> jobflow::RunPlan {
    let mut plan = plan(run_id, Vec::new());
    plan.restart = true;
    plan
}

fn jobs_of(store: &MemoryJobStore, run_id: &str) -> Vec<Job> {
    let (graph, _) = JobGraph::load(store, run_id).expect("load");
    graph.jobs_in_order().cloned().collect()
}

#[tokio::test]
async fn restart_readopts_attempt_the_backend_still_runs() -> TestResult {
    init_tracing();
    let store = crashed_with_a_in_flight("adopt", 0, 7);
    let batch = FakeBatchSystem::new();
    batch.adopt(7, "A");

    let report = run_to_end(&store, batch.clone(), restart_plan("adopt")).await?;

    assert!(report.succeeded());
    assert_eq!(report.jobs["A"].attempts, 1);
    assert_eq!(batch.issue_order(), vec!["B"]);
    assert!(batch.killed().is_empty());
    Ok(())
}

#[tokio::test]
async fn restart_fails_attempt_unknown_to_the_backend() -> TestResult {
    init_tracing();
    let store = crashed_with_a_in_flight("lost", 1, 7);
    let batch = FakeBatchSystem::new();
    // Left behind by someone else: no record refers to it.
    batch.adopt(99, "ghost");

    let report = run_to_end(&store, batch.clone(), restart_plan("lost")).await?;

    assert!(report.succeeded());
    assert_eq!(report.jobs["A"].attempts, 2);
    assert_eq!(batch.issue_order(), vec!["A", "B"]);
    assert_eq!(batch.specs()[0].attempt, 2);
    assert_eq!(batch.killed(), vec![99]);
    Ok(())
}

#[tokio::test]
async fn lost_attempt_without_budget_blocks_descendants() -> TestResult {
    init_tracing();
    let store = crashed_with_a_in_flight("nobudget", 0, 3);

    let report = run_to_end(&store, FakeBatchSystem::new(), restart_plan("nobudget")).await?;

    assert_eq!(report.outcome, RunOutcome::Failed);
    assert_eq!(report.jobs["A"].status, JobState::Permafailed);
    assert_eq!(report.jobs["B"].status, JobState::Blocked);
    Ok(())
}

#[tokio::test]
async fn recovering_twice_changes_nothing_the_second_time() -> TestResult {
    init_tracing();
    let store = crashed_with_a_in_flight("twice", 1, 5);

    let mut batch = FakeBatchSystem::new();
    let first = recover_run(&store, "twice", &mut batch).await?;
    assert!(matches!(first, RecoveredRun::Active { .. }));
    let after_first = jobs_of(&store, "twice");

    let mut batch = FakeBatchSystem::new();
    recover_run(&store, "twice", &mut batch).await?;
    let after_second = jobs_of(&store, "twice");

    assert_eq!(after_first, after_second);
    assert_eq!(load_job(&store, "twice", "A")?.state, JobState::Retrying);
    assert!(batch.get_issued_batch_job_ids().await?.is_empty());
    Ok(())
}

#[tokio::test]
async fn half_applied_completion_is_propagated_on_restart() -> TestResult {
    init_tracing();
    let store = MemoryJobStore::new();
    let jobs = WorkflowBuilder::new().simple("A", &[]).simple("B", &["A"]).build();
    start_run(&store, "half", &jobs)?;

    // A's completion reached the store, B's promotion did not.
    let mut a = load_job(&store, "half", "A")?;
    a.state = JobState::Completed;
    a.attempts = 1;
    save_job(&store, "half", &a)?;

    let batch = FakeBatchSystem::new();
    let report = run_to_end(&store, batch.clone(), restart_plan("half")).await?;

    assert!(report.succeeded());
    assert_eq!(batch.issue_order(), vec!["B"]);
    Ok(())
}

#[tokio::test]
async fn interrupted_cancellation_is_finished_on_restart() -> TestResult {
    init_tracing();
    let store = crashed_with_a_in_flight("recancel", 0, 11);
    let mut record = load_run(&store, "recancel")?;
    record.cancelled = true;
    save_run(&store, &record)?;

    let batch = FakeBatchSystem::new();
    batch.hold("A");
    batch.adopt(11, "A");

    let report = run_to_end(&store, batch.clone(), restart_plan("recancel")).await?;

    assert_eq!(report.outcome, RunOutcome::Cancelled);
    assert_eq!(batch.killed(), vec![11]);
    assert!(batch.issue_order().is_empty());
    Ok(())
}

#[tokio::test]
async fn restarting_a_finished_run_returns_its_report() -> TestResult {
    init_tracing();
    let store = MemoryJobStore::new();
    let jobs = WorkflowBuilder::new().simple("A", &[]).build();
    let first = run_to_end(&store, FakeBatchSystem::new(), plan("done", jobs)).await?;

    let batch = FakeBatchSystem::new();
    let second = run_to_end(&store, batch.clone(), restart_plan("done")).await?;

    assert_eq!(first, second);
    assert!(batch.issue_order().is_empty());
    Ok(())
}

#[tokio::test]
async fn restarting_an_unknown_run_fails() -> TestResult {
    init_tracing();
    let store = MemoryJobStore::new();
    let err = run_to_end(&store, FakeBatchSystem::new(), restart_plan("missing"))
        .await
        .expect_err("unknown run");
    assert!(matches!(err, JobflowError::RunNotFound(ref id) if id == "missing"));
    Ok(())
}

#[tokio::test]
async fn crash_while_recording_a_completion_keeps_dependents_waiting() -> TestResult {
    init_tracing();
    let memory = MemoryJobStore::new();
    let torn: Arc<dyn JobStore> = Arc::new(TornCompletionStore {
        inner: memory.clone(),
        key: keys::job("torn", "A"),
    });
    let jobs = WorkflowBuilder::new()
        .job(JobBuilder::new("A", "true").retries(1))
        .simple("B", &["A"])
        .build();

    let (_control_tx, control_rx) = mpsc::channel::<LeaderCommand>(1);
    let first = with_timeout(execute(plan("torn", jobs), torn, FakeBatchSystem::new(), None, control_rx)).await;
    assert!(first.is_err());

    // B's promotion must not be durable while A's completion is not.
    assert_eq!(load_job(&memory, "torn", "A")?.state, JobState::Issued);
    assert_eq!(load_job(&memory, "torn", "B")?.state, JobState::Unscheduled);

    let batch = FakeBatchSystem::new();
    batch.hold("A");
    let run = tokio::spawn({
        let store = memory.clone();
        let batch = batch.clone();
        async move { run_to_end(&store, batch, restart_plan("torn")).await }
    });

    wait_until(|| batch.is_live("A")).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(batch.issue_order(), vec!["A"]);

    batch.release("A", ExitStatus::Code(0));
    let report = run.await??;

    assert!(report.succeeded());
    assert_eq!(report.jobs["A"].attempts, 2);
    assert_eq!(batch.issue_order(), vec!["A", "B"]);
    Ok(())
}

#[tokio::test]
async fn ready_record_ahead_of_its_predecessor_waits_again() -> TestResult {
    init_tracing();
    let store = crashed_with_a_in_flight("ahead", 1, 7);
    let mut b = load_job(&store, "ahead", "B")?;
    b.state = JobState::Ready;
    save_job(&store, "ahead", &b)?;

    let batch = FakeBatchSystem::new();
    batch.hold("A");
    let run = tokio::spawn({
        let store = store.clone();
        let batch = batch.clone();
        async move { run_to_end(&store, batch, restart_plan("ahead")).await }
    });

    wait_until(|| batch.is_live("A")).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(batch.issue_order(), vec!["A"]);
    assert_eq!(load_job(&store, "ahead", "B")?.state, JobState::Unscheduled);

    batch.release("A", ExitStatus::Code(0));
    let report = run.await??;

    assert!(report.succeeded());
    assert_eq!(batch.issue_order(), vec!["A", "B"]);
    Ok(())
}
