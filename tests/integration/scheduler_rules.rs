use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use jobflow::batch::{ExitStatus, UpdatedBatchJob};
use jobflow::dag::{Job, JobGraph, JobState, ReconcilePolicy, Scheduler};
use jobflow_test_utils::{JobBuilder, WorkflowBuilder};

use crate::common::{TestResult, scheduler_for};

fn done(id: u64) -> UpdatedBatchJob {
    UpdatedBatchJob::new(id, ExitStatus::Code(0), Duration::from_millis(5))
}

fn failed(id: u64, code: i32) -> UpdatedBatchJob {
    UpdatedBatchJob::new(id, ExitStatus::Code(code), Duration::from_millis(5))
}

#[test]
fn duplicate_completion_is_discarded() -> TestResult {
    let jobs = WorkflowBuilder::new().simple("A", &[]).simple("B", &["A"]).build();
    let mut scheduler = scheduler_for(&jobs);

    scheduler.mark_issued("A", 1)?;
    let first = scheduler.handle_update(done(1))?;
    assert_eq!(first.completed, vec!["A"]);
    assert_eq!(first.newly_ready, vec!["B"]);

    let second = scheduler.handle_update(done(1))?;
    assert_eq!(second.discarded, vec![1]);
    assert!(second.checkpoint.is_empty());
    assert_eq!(scheduler.state_of("B"), Some(JobState::Ready));
    Ok(())
}

#[test]
fn completion_after_cancel_never_completes_the_job() -> TestResult {
    let jobs = WorkflowBuilder::new().simple("A", &[]).simple("B", &["A"]).build();
    let mut scheduler = scheduler_for(&jobs);
    scheduler.mark_issued("A", 1)?;

    let step = scheduler.cancel()?;
    assert_eq!(step.to_kill, vec![1]);
    assert_eq!(step.blocked, vec!["A", "B"]);

    let late = scheduler.handle_update(done(1))?;
    assert_eq!(late.discarded, vec![1]);
    assert_eq!(scheduler.state_of("A"), Some(JobState::Blocked));
    assert!(scheduler.issuable_jobs().is_empty());
    assert!(scheduler.is_finished());
    Ok(())
}

#[test]
fn issuing_after_cancel_kills_the_new_attempt() -> TestResult {
    let jobs = WorkflowBuilder::new().simple("A", &[]).build();
    let mut scheduler = scheduler_for(&jobs);
    scheduler.cancel()?;

    let step = scheduler.mark_issued("A", 4)?;
    assert_eq!(step.to_kill, vec![4]);
    assert_eq!(scheduler.state_of("A"), Some(JobState::Blocked));
    Ok(())
}

#[test]
fn failure_retries_until_budget_is_spent() -> TestResult {
    let jobs = WorkflowBuilder::new()
        .job(JobBuilder::new("A", "false").retries(1))
        .simple("B", &["A"])
        .build();
    let mut scheduler = scheduler_for(&jobs);

    scheduler.mark_issued("A", 1)?;
    let step = scheduler.handle_update(failed(1, 2))?;
    assert_eq!(step.retrying, vec!["A"]);
    assert_eq!(scheduler.issuable_jobs(), vec!["A"]);

    scheduler.mark_issued("A", 2)?;
    let step = scheduler.handle_update(failed(2, 2))?;
    assert_eq!(step.permafailed, vec!["A"]);
    assert_eq!(step.blocked, vec!["B"]);
    assert_eq!(scheduler.graph().get("A").map(|j| j.attempts), Some(2));
    assert!(scheduler.is_finished());
    assert!(!scheduler.all_completed());
    Ok(())
}

#[test]
fn jobs_blocking_more_work_are_issued_first() {
    let jobs = WorkflowBuilder::new()
        .simple("leaf", &[])
        .simple("hub", &[])
        .simple("x", &["hub"])
        .simple("y", &["hub"])
        .build();
    let scheduler = scheduler_for(&jobs);

    assert_eq!(scheduler.issuable_jobs(), vec!["hub", "leaf"]);
}

#[test]
fn reconcile_marks_issued_jobs_running() -> TestResult {
    let jobs = WorkflowBuilder::new().simple("A", &[]).build();
    let mut scheduler = scheduler_for(&jobs);
    scheduler.mark_issued("A", 1)?;

    let running = BTreeMap::from([(1, Duration::from_secs(1))]);
    let step = scheduler.reconcile(&BTreeSet::from([1]), &running, ReconcilePolicy::default())?;

    assert_eq!(step.checkpoint, vec!["A"]);
    assert_eq!(scheduler.state_of("A"), Some(JobState::Running));
    Ok(())
}

#[test]
fn job_missing_from_backend_fails_after_threshold() -> TestResult {
    let jobs = WorkflowBuilder::new().job(JobBuilder::new("A", "true").retries(1)).build();
    let mut scheduler = scheduler_for(&jobs);
    scheduler.mark_issued("A", 1)?;
    let policy = ReconcilePolicy {
        missing_job_threshold: 2,
        max_job_duration: None,
    };
    let none = BTreeSet::new();
    let no_running = BTreeMap::new();

    scheduler.reconcile(&none, &no_running, policy)?;
    assert_eq!(scheduler.state_of("A"), Some(JobState::Issued));

    let step = scheduler.reconcile(&none, &no_running, policy)?;
    assert_eq!(step.retrying, vec!["A"]);
    assert_eq!(scheduler.state_of("A"), Some(JobState::Retrying));

    // Its completion, if it ever arrives, is stale.
    let late = scheduler.handle_update(done(1))?;
    assert_eq!(late.discarded, vec![1]);
    Ok(())
}

#[test]
fn overdue_job_is_killed_and_failed() -> TestResult {
    let jobs = WorkflowBuilder::new().simple("A", &[]).build();
    let mut scheduler = scheduler_for(&jobs);
    scheduler.mark_issued("A", 1)?;
    let policy = ReconcilePolicy {
        missing_job_threshold: 3,
        max_job_duration: Some(Duration::from_secs(60)),
    };

    let running = BTreeMap::from([(1, Duration::from_secs(61))]);
    let step = scheduler.reconcile(&BTreeSet::from([1]), &running, policy)?;

    assert_eq!(step.to_kill, vec![1]);
    assert_eq!(step.permafailed, vec!["A"]);
    assert!(
        scheduler
            .graph()
            .get("A")
            .and_then(|j| j.last_failure.as_deref())
            .is_some_and(|r| r.contains("maximum job duration"))
    );
    Ok(())
}

#[test]
fn backend_jobs_without_a_record_are_killed() -> TestResult {
    let jobs = WorkflowBuilder::new().simple("A", &[]).build();
    let mut scheduler = scheduler_for(&jobs);
    scheduler.mark_issued("A", 1)?;

    let step = scheduler.reconcile(
        &BTreeSet::from([1, 42]),
        &BTreeMap::new(),
        ReconcilePolicy::default(),
    )?;
    assert_eq!(step.to_kill, vec![42]);
    Ok(())
}

#[test]
fn recover_on_consistent_graph_is_a_noop() -> TestResult {
    let jobs = WorkflowBuilder::new()
        .simple("A", &[])
        .simple("B", &["A"])
        .simple("C", &["B"])
        .build();
    let mut scheduler = scheduler_for(&jobs);
    scheduler.mark_issued("A", 1)?;
    scheduler.handle_update(done(1))?;
    scheduler.mark_issued("B", 2)?;

    let running = BTreeMap::from([(2, Duration::from_secs(3))]);
    let issued = BTreeSet::from([2]);
    let first = scheduler.recover(&issued, &running)?;
    assert_eq!(first.checkpoint, vec!["B"]);

    let second = scheduler.recover(&issued, &running)?;
    assert!(second.is_noop(), "unexpected changes: {second:?}");
    Ok(())
}

#[test]
fn demand_covers_ready_and_unstarted_jobs() -> TestResult {
    let jobs = WorkflowBuilder::new()
        .job(JobBuilder::new("A", "true").cores(2.0))
        .job(JobBuilder::new("B", "true").cores(4.0))
        .job(JobBuilder::new("C", "true").cores(8.0).after("A"))
        .build();
    let mut scheduler = scheduler_for(&jobs);
    scheduler.mark_issued("A", 1)?;

    let cores: Vec<f64> = scheduler.demand().iter().map(|r| r.cores).collect();
    assert_eq!(cores, vec![2.0, 4.0]);

    let running = BTreeMap::from([(1, Duration::ZERO)]);
    scheduler.reconcile(&BTreeSet::from([1]), &running, ReconcilePolicy::default())?;
    let cores: Vec<f64> = scheduler.demand().iter().map(|r| r.cores).collect();
    assert_eq!(cores, vec![4.0]);
    Ok(())
}

#[test]
fn recover_demotes_ready_job_whose_predecessor_never_completed() -> TestResult {
    let jobs = WorkflowBuilder::new().simple("A", &[]).simple("B", &["A"]).build();
    let mut scheduler = scheduler_for(&jobs);
    scheduler.mark_issued("A", 1)?;

    let mut records: Vec<Job> = scheduler.graph().jobs().cloned().collect();
    for record in &mut records {
        if record.id == "B" {
            record.state = JobState::Ready;
        }
    }
    let mut restarted = Scheduler::new(JobGraph::from_jobs("test", records)?);

    let step = restarted.recover(&BTreeSet::from([1]), &BTreeMap::new())?;
    assert_eq!(step.checkpoint, vec!["B"]);
    assert_eq!(restarted.state_of("B"), Some(JobState::Unscheduled));
    assert!(restarted.issuable_jobs().is_empty());
    Ok(())
}

#[test]
fn rejected_job_fails_at_once_and_blocks_descendants() -> TestResult {
    let jobs = WorkflowBuilder::new()
        .job(JobBuilder::new("big", "true").retries(3))
        .simple("child", &["big"])
        .simple("side", &[])
        .build();
    let mut scheduler = scheduler_for(&jobs);

    let step = scheduler.reject("big", "needs 64 cores")?;

    assert_eq!(step.permafailed, vec!["big"]);
    assert_eq!(step.blocked, vec!["child"]);
    assert_eq!(step.checkpoint, vec!["big", "child"]);
    let big = scheduler.graph().get("big").expect("big");
    assert_eq!(big.attempts, 0);
    assert_eq!(big.last_failure.as_deref(), Some("needs 64 cores"));
    assert_eq!(scheduler.issuable_jobs(), vec!["side"]);
    Ok(())
}
