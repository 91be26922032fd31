use jobflow::batch::ExitStatus;
use jobflow::dag::{JobDescriptor, JobState};
use jobflow::engine::RunOutcome;
use jobflow::store::checkpoint::{load_job, load_run};
use jobflow::store::{JobStore, MemoryJobStore, keys};
use jobflow::types::CleanPolicy;
use jobflow_test_utils::{FakeBatchSystem, FakeEvent, JobBuilder, WorkflowBuilder};

use crate::common::{TestResult, init_tracing, plan, run_to_end};

/// Index of the first event matching `pred`.
fn position(events: &[FakeEvent], pred: impl Fn(&FakeEvent) -> bool) -> Option<usize> {
    events.iter().position(pred)
}

fn assert_issued_after_predecessors(events: &[FakeEvent], jobs: &[JobDescriptor]) {
    for job in jobs {
        let issued = position(events, |e| matches!(e, FakeEvent::Issued { job: j, .. } if *j == job.id))
            .unwrap_or_else(|| panic!("{} was never issued", job.id));
        for dep in &job.after {
            let done = position(events, |e| {
                matches!(e, FakeEvent::Delivered { job: j, exit_status, .. }
                    if j == dep && exit_status.success())
            })
            .unwrap_or_else(|| panic!("{dep} never completed"));
            assert!(done < issued, "{} issued before its predecessor {dep} completed", job.id);
        }
    }
}

#[tokio::test]
async fn linear_chain_runs_in_dependency_order() -> TestResult {
    init_tracing();
    let jobs = WorkflowBuilder::new()
        .simple("A", &[])
        .simple("B", &["A"])
        .simple("C", &["B"])
        .build();
    let store = MemoryJobStore::new();
    let batch = FakeBatchSystem::new();

    let report = run_to_end(&store, batch.clone(), plan("linear", jobs.clone())).await?;

    assert_eq!(report.outcome, RunOutcome::Succeeded);
    assert_eq!(batch.issue_order(), vec!["A", "B", "C"]);
    for id in ["A", "B", "C"] {
        assert_eq!(report.jobs[id].status, JobState::Completed);
        assert_eq!(report.jobs[id].attempts, 1);
    }
    assert_issued_after_predecessors(&batch.events(), &jobs);
    Ok(())
}

#[tokio::test]
async fn diamond_issues_jobs_only_after_all_predecessors() -> TestResult {
    init_tracing();
    let jobs = WorkflowBuilder::new()
        .simple("A", &[])
        .simple("B", &["A"])
        .simple("C", &["A"])
        .simple("D", &["B", "C"])
        .build();
    let store = MemoryJobStore::new();
    let batch = FakeBatchSystem::new();
    batch.hold("C");

    let run = tokio::spawn({
        let store = store.clone();
        let batch = batch.clone();
        let jobs = jobs.clone();
        async move { run_to_end(&store, batch, plan("diamond", jobs)).await }
    });

    // B finishes while C is held: D must keep waiting.
    jobflow_test_utils::wait_until(|| batch.was_delivered("B") && batch.is_live("C")).await;
    assert!(!batch.issue_order().contains(&"D".to_string()));

    batch.release("C", ExitStatus::Code(0));
    let report = run.await??;

    assert!(report.succeeded());
    assert_eq!(batch.issue_order().last().map(String::as_str), Some("D"));
    assert_issued_after_predecessors(&batch.events(), &jobs);
    Ok(())
}

#[tokio::test]
async fn permanent_failure_blocks_only_descendants() -> TestResult {
    init_tracing();
    let jobs = WorkflowBuilder::new()
        .simple("A", &[])
        .simple("B", &["A"])
        .simple("C", &["A"])
        .simple("D", &["B"])
        .build();
    let store = MemoryJobStore::new();
    let batch = FakeBatchSystem::new();
    batch.always_fail("B", 1);

    let report = run_to_end(&store, batch.clone(), plan("fanout", jobs)).await?;

    assert_eq!(report.outcome, RunOutcome::Failed);
    assert_eq!(report.jobs["A"].status, JobState::Completed);
    assert_eq!(report.jobs["B"].status, JobState::Permafailed);
    assert_eq!(report.jobs["C"].status, JobState::Completed);
    assert_eq!(report.jobs["D"].status, JobState::Blocked);
    assert_eq!(report.jobs["D"].attempts, 0);
    assert!(!batch.issue_order().contains(&"D".to_string()));
    assert!(
        report.jobs["B"]
            .last_failure
            .as_deref()
            .is_some_and(|r| r.contains("exit code 1"))
    );
    Ok(())
}

#[tokio::test]
async fn retry_budget_allows_exactly_n_plus_one_attempts() -> TestResult {
    init_tracing();
    let jobs = WorkflowBuilder::new()
        .job(JobBuilder::new("flaky", "true").retries(1))
        .job(JobBuilder::new("broken", "true").retries(2))
        .build();
    let store = MemoryJobStore::new();
    let batch = FakeBatchSystem::new();
    batch.script("flaky", [ExitStatus::Code(3)]);
    batch.always_fail("broken", 2);

    let report = run_to_end(&store, batch.clone(), plan("retries", jobs)).await?;

    assert_eq!(report.jobs["flaky"].status, JobState::Completed);
    assert_eq!(report.jobs["flaky"].attempts, 2);
    assert_eq!(report.jobs["broken"].status, JobState::Permafailed);
    assert_eq!(report.jobs["broken"].attempts, 3);
    assert_eq!(batch.attempts_of("broken"), 3);

    let attempts: Vec<u32> = batch
        .specs()
        .iter()
        .filter(|s| s.job_id == "broken")
        .map(|s| s.attempt)
        .collect();
    assert_eq!(attempts, vec![1, 2, 3]);
    Ok(())
}

#[tokio::test]
async fn backend_outages_delay_but_do_not_lose_jobs() -> TestResult {
    init_tracing();
    let jobs = WorkflowBuilder::new()
        .simple("A", &[])
        .simple("B", &["A"])
        .build();
    let store = MemoryJobStore::new();
    let batch = FakeBatchSystem::new();
    batch.fail_next_issues(2);
    batch.fail_next_polls(2);

    let report = run_to_end(&store, batch.clone(), plan("outage", jobs)).await?;

    assert!(report.succeeded());
    assert_eq!(batch.issue_order(), vec!["A", "B"]);
    assert_eq!(report.jobs["A"].attempts, 1);
    Ok(())
}

#[tokio::test]
async fn final_state_is_checkpointed_with_report() -> TestResult {
    init_tracing();
    let jobs = WorkflowBuilder::new()
        .simple("A", &[])
        .job(JobBuilder::new("B", "false").after("A"))
        .build();
    let store = MemoryJobStore::new();
    let batch = FakeBatchSystem::new();
    batch.always_fail("B", 1);

    let report = run_to_end(&store, batch, plan("ckpt", jobs)).await?;

    assert_eq!(load_job(&store, "ckpt", "A")?.state, JobState::Completed);
    assert_eq!(load_job(&store, "ckpt", "B")?.state, JobState::Permafailed);
    assert_eq!(load_run(&store, "ckpt")?.outcome, Some(RunOutcome::Failed));
    assert_eq!(jobflow::engine::RunReport::load(&store, "ckpt")?, report);
    Ok(())
}

#[tokio::test]
async fn clean_always_removes_job_records_but_keeps_report() -> TestResult {
    init_tracing();
    let jobs = WorkflowBuilder::new().simple("A", &[]).simple("B", &["A"]).build();
    let store = MemoryJobStore::new();
    let mut run = plan("clean", jobs);
    run.leader.clean = CleanPolicy::Always;

    let report = run_to_end(&store, FakeBatchSystem::new(), run).await?;

    assert!(report.succeeded());
    assert!(!store.exists(&keys::job("clean", "A"))?);
    assert!(!store.exists(&keys::job("clean", "B"))?);
    assert!(store.exists(&keys::run_report("clean"))?);
    assert!(store.keys().iter().all(|k| !k.starts_with("files/")));
    Ok(())
}

#[tokio::test]
async fn clean_on_success_keeps_records_of_failed_run() -> TestResult {
    init_tracing();
    let jobs = WorkflowBuilder::new().simple("A", &[]).build();
    let store = MemoryJobStore::new();
    let batch = FakeBatchSystem::new();
    batch.always_fail("A", 9);
    let mut run = plan("keep", jobs);
    run.leader.clean = CleanPolicy::OnSuccess;

    let report = run_to_end(&store, batch, run).await?;

    assert!(!report.succeeded());
    assert!(store.exists(&keys::job("keep", "A"))?);
    Ok(())
}

#[tokio::test]
async fn payload_reaches_the_backend_unchanged() -> TestResult {
    init_tracing();
    let jobs = WorkflowBuilder::new()
        .job(JobBuilder::new("A", "echo hello && exit 0").cores(2.0).output("out.txt"))
        .build();
    let store = MemoryJobStore::new();
    let batch = FakeBatchSystem::new();

    run_to_end(&store, batch.clone(), plan("payload", jobs)).await?;

    let specs = batch.specs();
    assert_eq!(specs.len(), 1);
    assert_eq!(specs[0].run_id, "payload");
    assert_eq!(specs[0].requirement.cores, 2.0);
    assert_eq!(specs[0].outputs, vec!["out.txt"]);
    assert_eq!(store.read_file_to_vec(&specs[0].payload)?, b"echo hello && exit 0");
    Ok(())
}

#[tokio::test]
async fn starting_an_existing_run_is_refused() -> TestResult {
    init_tracing();
    let jobs = WorkflowBuilder::new().simple("A", &[]).build();
    let store = MemoryJobStore::new();
    run_to_end(&store, FakeBatchSystem::new(), plan("twice", jobs.clone())).await?;

    let err = run_to_end(&store, FakeBatchSystem::new(), plan("twice", jobs))
        .await
        .expect_err("second start must fail");
    assert!(matches!(err, jobflow::errors::JobflowError::RunExists(ref id) if id == "twice"));
    Ok(())
}
