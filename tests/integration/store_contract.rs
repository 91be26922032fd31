use std::sync::Arc;

use tokio::sync::mpsc;

use jobflow::dag::JobState;
use jobflow::engine::{LeaderCommand, start_run};
use jobflow::errors::StoreError;
use jobflow::execute;
use jobflow::store::checkpoint::save_job;
use jobflow::store::{FileJobStore, JobStore, MemoryJobStore, keys};
use jobflow_test_utils::{FakeBatchSystem, WorkflowBuilder, with_timeout};

use crate::common::{TestResult, init_tracing, plan};

/// Behaviour every `JobStore` implementation must share.
fn check_contract(store: &dyn JobStore) -> TestResult {
    let key = keys::job("r", "a");

    assert!(matches!(store.get(&key), Err(StoreError::NotFound(_))));
    assert!(matches!(store.update(&key, b"x"), Err(StoreError::Conflict { .. })));
    assert!(!store.exists(&key)?);

    store.put(&key, b"v1")?;
    assert!(matches!(store.put(&key, b"v2"), Err(StoreError::Conflict { .. })));
    store.update(&key, b"v3")?;
    assert_eq!(store.get(&key)?, b"v3");

    store.put(&keys::job("r", "b"), b"")?;
    store.put(&keys::job("other", "c"), b"")?;
    assert_eq!(store.list("runs/r/jobs/")?, vec![keys::job("r", "a"), keys::job("r", "b")]);

    store.delete(&key)?;
    store.delete(&key)?;
    assert!(!store.exists(&key)?);

    let id = store.put_file(b"blob")?;
    assert_ne!(store.put_file(b"blob")?, id, "blob ids are never reused");
    assert_eq!(store.read_file_to_vec(&id)?, b"blob");
    store.delete_file(&id)?;
    assert!(store.read_file(&id).is_err());

    assert!(matches!(store.put("runs/../x", b""), Err(StoreError::InvalidKey(_))));
    assert!(store.list("runs/r/jobs").is_err());
    Ok(())
}

#[test]
fn memory_store_honours_the_contract() -> TestResult {
    check_contract(&MemoryJobStore::new())
}

#[test]
fn file_store_honours_the_contract() -> TestResult {
    let dir = tempfile::tempdir()?;
    check_contract(&FileJobStore::open(dir.path())?)
}

#[tokio::test]
async fn run_resumes_from_a_reopened_file_store() -> TestResult {
    init_tracing();
    let dir = tempfile::tempdir()?;
    let jobs = WorkflowBuilder::new()
        .simple("A", &[])
        .simple("B", &["A"])
        .build();

    // First leader: materializes the run, issues A, then dies.
    {
        let store = FileJobStore::open(dir.path())?;
        let (mut scheduler, _) = start_run(&store, "durable", &jobs)?;
        let step = scheduler.mark_issued("A", 1)?;
        for id in &step.checkpoint {
            if let Some(job) = scheduler.graph().get(id) {
                save_job(&store, "durable", job)?;
            }
        }
    }

    let store: Arc<dyn JobStore> = Arc::new(FileJobStore::open(dir.path())?);
    let batch = FakeBatchSystem::new();
    batch.adopt(1, "A");
    let mut restart = plan("durable", Vec::new());
    restart.restart = true;

    let (_control_tx, control_rx) = mpsc::channel::<LeaderCommand>(1);
    let report = with_timeout(execute(restart, Arc::clone(&store), batch.clone(), None, control_rx)).await?;

    assert!(report.succeeded());
    assert_eq!(report.jobs["A"].status, JobState::Completed);
    assert_eq!(batch.issue_order(), vec!["B"]);
    Ok(())
}
