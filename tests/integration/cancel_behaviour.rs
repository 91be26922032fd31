use std::sync::Arc;

use tokio::sync::mpsc;

use jobflow::dag::JobState;
use jobflow::engine::{LeaderCommand, RunOutcome};
use jobflow::execute;
use jobflow::store::checkpoint::load_run;
use jobflow::store::{JobStore, MemoryJobStore};
use jobflow_test_utils::{FakeBatchSystem, WorkflowBuilder, wait_until, with_timeout};

use crate::common::{TestResult, init_tracing, plan};

#[tokio::test]
async fn cancel_kills_running_jobs_and_blocks_the_rest() -> TestResult {
    init_tracing();
    let jobs = WorkflowBuilder::new()
        .simple("A", &[])
        .simple("B", &["A"])
        .simple("side", &[])
        .build();
    let store = MemoryJobStore::new();
    let batch = FakeBatchSystem::new();
    batch.hold("A");

    let (control_tx, control_rx) = mpsc::channel::<LeaderCommand>(4);
    let shared: Arc<dyn JobStore> = Arc::new(store.clone());
    let run = tokio::spawn(execute(plan("cancel", jobs), shared, batch.clone(), None, control_rx));

    wait_until(|| batch.is_live("A") && batch.was_delivered("side")).await;
    control_tx.send(LeaderCommand::Cancel).await?;
    let report = with_timeout(run).await??;

    assert_eq!(report.outcome, RunOutcome::Cancelled);
    assert_eq!(report.jobs["A"].status, JobState::Blocked);
    assert_eq!(report.jobs["B"].status, JobState::Blocked);
    assert_eq!(report.jobs["B"].attempts, 0);
    assert_eq!(report.jobs["side"].status, JobState::Completed);
    assert_eq!(batch.killed().len(), 1);
    assert!(!batch.is_live("A"));

    let record = load_run(&store, "cancel")?;
    assert!(record.cancelled);
    assert_eq!(record.outcome, Some(RunOutcome::Cancelled));
    Ok(())
}

#[tokio::test]
async fn cancel_while_capacity_is_refused_still_terminates() -> TestResult {
    init_tracing();
    let jobs = WorkflowBuilder::new()
        .simple("huge", &[])
        .simple("small", &[])
        .build();
    let store = MemoryJobStore::new();
    let batch = FakeBatchSystem::new();
    batch.reject_for_capacity("huge");

    let (control_tx, control_rx) = mpsc::channel::<LeaderCommand>(4);
    let shared: Arc<dyn JobStore> = Arc::new(store.clone());
    let run = tokio::spawn(execute(plan("capacity", jobs), shared, batch.clone(), None, control_rx));

    // The refused job stays ready without holding up the other one.
    wait_until(|| batch.was_delivered("small")).await;
    control_tx.send(LeaderCommand::Cancel).await?;
    let report = with_timeout(run).await??;

    assert_eq!(report.jobs["small"].status, JobState::Completed);
    assert_eq!(report.jobs["huge"].status, JobState::Blocked);
    assert_eq!(report.jobs["huge"].attempts, 0);
    assert_eq!(report.outcome, RunOutcome::Cancelled);
    Ok(())
}

#[tokio::test]
async fn lost_kill_reports_do_not_stall_cancellation() -> TestResult {
    init_tracing();
    let jobs = WorkflowBuilder::new().simple("A", &[]).build();
    let batch = FakeBatchSystem::new();
    batch.hold("A");
    batch.drop_kill_reports();

    let (control_tx, control_rx) = mpsc::channel::<LeaderCommand>(4);
    let store: Arc<dyn JobStore> = Arc::new(MemoryJobStore::new());
    let run = tokio::spawn(execute(plan("silent", jobs), store, batch.clone(), None, control_rx));

    wait_until(|| batch.is_live("A")).await;
    control_tx.send(LeaderCommand::Cancel).await?;
    let report = with_timeout(run).await??;

    assert_eq!(report.outcome, RunOutcome::Cancelled);
    assert_eq!(report.jobs["A"].status, JobState::Blocked);
    assert_eq!(batch.killed().len(), 1);
    Ok(())
}
