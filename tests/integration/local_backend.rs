use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use jobflow::batch::{LocalBatchSystem, LocalCapacity};
use jobflow::dag::JobState;
use jobflow::engine::{LeaderCommand, RunOutcome, RunReport};
use jobflow::execute;
use jobflow::store::{FileJobStore, JobStore};
use jobflow_test_utils::{JobBuilder, WorkflowBuilder, with_timeout};

use crate::common::{TestResult, init_tracing, plan};

struct Local {
    _dir: tempfile::TempDir,
    store: Arc<dyn JobStore>,
    batch: LocalBatchSystem,
}

fn local() -> Local {
    let dir = tempfile::tempdir().expect("tempdir");
    let store: Arc<dyn JobStore> =
        Arc::new(FileJobStore::open(dir.path().join("store")).expect("open store"));
    let capacity = LocalCapacity {
        cores: 2.0,
        memory_bytes: None,
    };
    let batch = LocalBatchSystem::new(Arc::clone(&store), dir.path().join("work"), capacity);
    Local {
        _dir: dir,
        store,
        batch,
    }
}

async fn run(
    store: &Arc<dyn JobStore>,
    batch: LocalBatchSystem,
    run_plan: jobflow::RunPlan,
) -> jobflow::errors::Result<RunReport> {
    let (_control_tx, control_rx) = mpsc::channel::<LeaderCommand>(1);
    with_timeout(execute(run_plan, Arc::clone(store), batch, None, control_rx)).await
}

#[tokio::test]
async fn shell_jobs_run_in_order_and_outputs_land_in_the_store() -> TestResult {
    init_tracing();
    let Local { _dir, store, batch } = local();
    let jobs = WorkflowBuilder::new()
        .job(JobBuilder::new("A", "echo hello > a.txt").output("a.txt"))
        .job(JobBuilder::new("B", "echo second > b.txt").output("b.txt").after("A"))
        .build();

    let report = run(&store, batch, plan("local", jobs)).await?;

    assert!(report.succeeded(), "{report:?}");
    let a = &report.jobs["A"].outputs["a.txt"];
    assert_eq!(store.read_file_to_vec(a)?, b"hello\n");
    let b = &report.jobs["B"].outputs["b.txt"];
    assert_eq!(store.read_file_to_vec(b)?, b"second\n");
    Ok(())
}

#[tokio::test]
async fn attempt_sees_its_identity_in_the_environment() -> TestResult {
    init_tracing();
    let Local { _dir, store, batch } = local();
    let jobs = WorkflowBuilder::new()
        .job(JobBuilder::new(
            "envcheck",
            r#"test "$JOBFLOW_JOB_ID" = envcheck && test "$JOBFLOW_RUN_ID" = envrun && test "$JOBFLOW_ATTEMPT" = 1"#,
        ))
        .build();

    let report = run(&store, batch, plan("envrun", jobs)).await?;

    assert!(report.succeeded(), "{report:?}");
    Ok(())
}

#[tokio::test]
async fn non_zero_exit_is_retried_then_permafails() -> TestResult {
    init_tracing();
    let Local { _dir, store, batch } = local();
    let jobs = WorkflowBuilder::new()
        .job(JobBuilder::new("bad", "exit 3").retries(1))
        .simple("child", &["bad"])
        .build();

    let report = run(&store, batch, plan("exit", jobs)).await?;

    assert_eq!(report.outcome, RunOutcome::Failed);
    assert_eq!(report.jobs["bad"].status, JobState::Permafailed);
    assert_eq!(report.jobs["bad"].attempts, 2);
    assert!(
        report.jobs["bad"]
            .last_failure
            .as_deref()
            .is_some_and(|r| r.contains("exit code 3"))
    );
    assert_eq!(report.jobs["child"].status, JobState::Blocked);
    Ok(())
}

#[tokio::test]
async fn missing_declared_output_fails_the_attempt() -> TestResult {
    init_tracing();
    let Local { _dir, store, batch } = local();
    let jobs = WorkflowBuilder::new()
        .job(JobBuilder::new("lazy", "true").output("never.txt"))
        .build();

    let report = run(&store, batch, plan("missing", jobs)).await?;

    assert_eq!(report.jobs["lazy"].status, JobState::Permafailed);
    assert!(
        report.jobs["lazy"]
            .last_failure
            .as_deref()
            .is_some_and(|r| r.contains("was not produced")),
        "{:?}",
        report.jobs["lazy"].last_failure
    );
    Ok(())
}

#[tokio::test]
async fn job_larger_than_the_machine_fails_instead_of_waiting_forever() -> TestResult {
    init_tracing();
    let Local { _dir, store, batch } = local();
    let jobs = WorkflowBuilder::new()
        .job(JobBuilder::new("huge", "true").cores(8.0).retries(2))
        .simple("after_huge", &["huge"])
        .job(JobBuilder::new("small", "echo ok > ok.txt").output("ok.txt"))
        .build();

    let report = run(&store, batch, plan("oversized", jobs)).await?;

    assert_eq!(report.outcome, RunOutcome::Failed);
    assert_eq!(report.jobs["huge"].status, JobState::Permafailed);
    assert_eq!(report.jobs["huge"].attempts, 0);
    assert!(
        report.jobs["huge"]
            .last_failure
            .as_deref()
            .is_some_and(|r| r.contains("needs 8 cores")),
        "{:?}",
        report.jobs["huge"].last_failure
    );
    assert_eq!(report.jobs["after_huge"].status, JobState::Blocked);
    assert_eq!(report.jobs["small"].status, JobState::Completed);
    Ok(())
}

#[tokio::test]
async fn cancel_kills_a_long_running_process() -> TestResult {
    init_tracing();
    let Local { _dir, store, batch } = local();
    let jobs = WorkflowBuilder::new().job(JobBuilder::new("slow", "sleep 30")).build();

    let (control_tx, control_rx) = mpsc::channel::<LeaderCommand>(1);
    let run = tokio::spawn(execute(plan("slow", jobs), store, batch, None, control_rx));
    tokio::time::sleep(Duration::from_millis(200)).await;
    control_tx.send(LeaderCommand::Cancel).await?;

    let report = with_timeout(run).await??;
    assert_eq!(report.outcome, RunOutcome::Cancelled);
    assert_eq!(report.jobs["slow"].status, JobState::Blocked);
    Ok(())
}
