// src/engine/recovery.rs

//! Starting a fresh run and rebuilding an interrupted one.

use tracing::{info, warn};

use crate::batch::BatchSystem;
use crate::dag::{JobDescriptor, JobGraph, Scheduler, SchedulerStep};
use crate::engine::report::RunReport;
use crate::errors::{JobflowError, Result, StoreError};
use crate::store::checkpoint::{load_run, save_job};
use crate::store::{JobStore, RunRecord};

/// What `recover_run` found in the store.
#[derive(Debug)]
pub enum RecoveredRun {
    /// The run still has work to do; hand the scheduler to a leader.
    Active {
        scheduler: Scheduler,
        record: RunRecord,
    },
    /// The run already ended; its report is returned as-is.
    Finished(RunReport),
}

/// Materialize `descriptors` as a new run and wrap it in a scheduler.
pub fn start_run(
    store: &dyn JobStore,
    run_id: &str,
    descriptors: &[JobDescriptor],
) -> Result<(Scheduler, RunRecord)> {
    let graph = JobGraph::materialize(store, run_id, descriptors)?;
    let record = load_run(store, run_id)?;
    Ok((Scheduler::new(graph), record))
}

/// Rebuild `run_id` from the store and reconcile it with `batch`.
///
/// In-flight attempts the backend still tracks are re-adopted, the others
/// fail and go through retry logic, backend jobs no record refers to are
/// killed. A run that was being cancelled when the previous leader stopped
/// is cancelled again. Every touched record is checkpointed before this
/// returns.
pub async fn recover_run<B: BatchSystem + ?Sized>(
    store: &dyn JobStore,
    run_id: &str,
    batch: &mut B,
) -> Result<RecoveredRun> {
    let record = match load_run(store, run_id) {
        Ok(r) => r,
        Err(StoreError::NotFound(_)) => return Err(JobflowError::RunNotFound(run_id.to_string())),
        Err(e) => return Err(e.into()),
    };
    if let Some(outcome) = record.outcome {
        info!(run_id, %outcome, "run already finished; returning stored report");
        return Ok(RecoveredRun::Finished(RunReport::load(store, run_id)?));
    }

    let (graph, record) = JobGraph::load(store, run_id)?;
    let mut scheduler = Scheduler::new(graph);

    let issued = batch.get_issued_batch_job_ids().await?;
    let running = batch.get_running_batch_job_ids().await?;
    let mut step = scheduler.recover(&issued, &running)?;

    if record.cancelled {
        warn!(run_id, "run was being cancelled; finishing the cancellation");
        step.merge(scheduler.cancel()?);
    }

    apply_recovery_step(store, &scheduler, batch, step).await?;
    info!(
        run_id,
        jobs = scheduler.graph().len(),
        in_flight = scheduler.in_flight_batch_ids().len(),
        "recovered run"
    );
    Ok(RecoveredRun::Active { scheduler, record })
}

async fn apply_recovery_step<B: BatchSystem + ?Sized>(
    store: &dyn JobStore,
    scheduler: &Scheduler,
    batch: &mut B,
    step: SchedulerStep,
) -> Result<()> {
    let run_id = scheduler.graph().run_id();
    for id in &step.checkpoint {
        if let Some(job) = scheduler.graph().get(id) {
            save_job(store, run_id, job)?;
        }
    }
    if !step.to_kill.is_empty() {
        if let Err(e) = batch.kill_batch_jobs(step.to_kill).await {
            warn!(run_id, error = %e, "failed to kill stale batch jobs during recovery");
        }
    }
    Ok(())
}
