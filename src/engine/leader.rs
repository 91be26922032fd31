// src/engine/leader.rs

//! Async shell that drives one run.
//!
//! The [`Leader`] owns the pure [`Scheduler`] and performs all IO on its
//! behalf: issuing attempts, polling completions, reconciling with the batch
//! system, checkpointing touched records and publishing demand to the
//! cluster scaler.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::anyhow;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::batch::{BatchJobId, BatchJobSpec, BatchSystem, UpdatedBatchJob};
use crate::dag::{JobId, JobState, Scheduler, SchedulerStep};
use crate::engine::report::{RunReport, clean_run};
use crate::engine::{LeaderCommand, LeaderOptions};
use crate::errors::{BatchError, JobflowError, Result, StoreResult};
use crate::scaler::DemandReport;
use crate::store::checkpoint::{save_job, save_run};
use crate::store::{JobStore, RunRecord};

pub struct Leader<B: BatchSystem> {
    scheduler: Scheduler,
    record: RunRecord,
    store: Arc<dyn JobStore>,
    batch: B,
    options: LeaderOptions,
    control_rx: mpsc::Receiver<LeaderCommand>,
    demand_tx: Option<watch::Sender<DemandReport>>,
    /// Jobs whose record changed since the last flush, in the order the
    /// scheduler touched them.
    dirty: Vec<JobId>,
    /// Issuance is paused until this instant after a backend outage.
    backoff_until: Option<Instant>,
    last_reconcile: Instant,
}

impl<B: BatchSystem> fmt::Debug for Leader<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Leader")
            .field("run_id", &self.record.run_id)
            .field("scheduler", &self.scheduler)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl<B: BatchSystem> Leader<B> {
    pub fn new(
        scheduler: Scheduler,
        record: RunRecord,
        store: Arc<dyn JobStore>,
        batch: B,
        options: LeaderOptions,
        control_rx: mpsc::Receiver<LeaderCommand>,
    ) -> Self {
        Self {
            scheduler,
            record,
            store,
            batch,
            options,
            control_rx,
            demand_tx: None,
            dirty: Vec::new(),
            backoff_until: None,
            last_reconcile: Instant::now(),
        }
    }

    /// Publish demand reports on `tx` after every iteration.
    pub fn with_demand_channel(mut self, tx: watch::Sender<DemandReport>) -> Self {
        self.demand_tx = Some(tx);
        self
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn run_id(&self) -> &str {
        &self.record.run_id
    }

    /// Main loop. Returns the final report once no job can make progress.
    pub async fn run(mut self) -> Result<RunReport> {
        info!(
            run_id = %self.record.run_id,
            jobs = self.scheduler.graph().len(),
            "leader started"
        );

        loop {
            self.drain_commands().await?;
            if self.scheduler.is_finished() {
                break;
            }

            self.issue_ready().await?;
            self.flush_checkpoints().await?;

            self.poll_updates().await?;
            self.flush_checkpoints().await?;

            if self.last_reconcile.elapsed() >= self.options.reconcile_interval {
                self.reconcile().await?;
                self.flush_checkpoints().await?;
            }

            self.publish_demand(false).await;
        }

        self.finish().await
    }

    /// Handle commands that arrived without blocking.
    async fn drain_commands(&mut self) -> Result<()> {
        loop {
            match self.control_rx.try_recv() {
                Ok(command) => self.handle_command(command).await?,
                Err(mpsc::error::TryRecvError::Empty)
                | Err(mpsc::error::TryRecvError::Disconnected) => return Ok(()),
            }
        }
    }

    async fn handle_command(&mut self, command: LeaderCommand) -> Result<()> {
        match command {
            LeaderCommand::Cancel => self.cancel().await,
        }
    }

    async fn cancel(&mut self) -> Result<()> {
        if self.scheduler.is_cancelled() {
            return Ok(());
        }
        warn!(run_id = %self.record.run_id, "cancelling run");

        self.record.cancelled = true;
        save_run(self.store.as_ref(), &self.record)?;

        let step = self.scheduler.cancel()?;
        self.apply(step).await;
        self.flush_checkpoints().await
    }

    /// Issue every issuable job in priority order.
    async fn issue_ready(&mut self) -> Result<()> {
        if let Some(until) = self.backoff_until {
            if Instant::now() < until {
                return Ok(());
            }
            self.backoff_until = None;
        }

        for job_id in self.scheduler.issuable_jobs() {
            let spec = self.spec_for(&job_id)?;
            match self.batch.issue_batch_job(spec).await {
                Ok(batch_job_id) => {
                    let step = self.scheduler.mark_issued(&job_id, batch_job_id)?;
                    self.apply(step).await;
                }
                Err(BatchError::InsufficientCapacity(reason)) => {
                    debug!(job = %job_id, %reason, "backend lacks capacity; job stays ready");
                }
                Err(BatchError::Unsatisfiable(reason)) => {
                    let step = self.scheduler.reject(&job_id, &reason)?;
                    self.apply(step).await;
                }
                Err(e) => {
                    warn!(
                        job = %job_id,
                        error = %e,
                        backoff = ?self.options.issue_backoff,
                        "issuing failed; backing off"
                    );
                    self.backoff_until = Some(Instant::now() + self.options.issue_backoff);
                    break;
                }
            }
        }
        Ok(())
    }

    fn spec_for(&self, job_id: &str) -> Result<BatchJobSpec> {
        let job = self
            .scheduler
            .graph()
            .get(job_id)
            .ok_or_else(|| JobflowError::JobNotFound(job_id.to_string()))?;
        Ok(BatchJobSpec {
            run_id: self.record.run_id.clone(),
            job_id: job.id.clone(),
            attempt: job.attempts + 1,
            requirement: job.requirement.clone(),
            payload: job.payload.clone(),
            outputs: job.declared_outputs.clone(),
        })
    }

    /// Wait for one completion event, then drain what is already available.
    async fn poll_updates(&mut self) -> Result<()> {
        let first = tokio::select! {
            polled = self.batch.get_updated_batch_job(self.options.poll_timeout) => polled,
            Some(command) = self.control_rx.recv() => {
                return self.handle_command(command).await;
            }
        };

        let mut handled = 0;
        let mut next = first;
        loop {
            match next {
                Ok(Some(update)) => {
                    self.handle_update(update).await?;
                    handled += 1;
                }
                Ok(None) => break,
                Err(e) => {
                    warn!(error = %e, backoff = ?self.options.issue_backoff, "polling the batch system failed");
                    self.backoff_until = Some(Instant::now() + self.options.issue_backoff);
                    tokio::time::sleep(self.options.issue_backoff).await;
                    break;
                }
            }
            if handled >= self.options.max_updates_per_iteration.max(1) {
                break;
            }
            next = self.batch.get_updated_batch_job(Duration::ZERO).await;
        }

        if handled > 0 {
            debug!(handled, "processed batch updates");
        }
        Ok(())
    }

    async fn handle_update(&mut self, update: UpdatedBatchJob) -> Result<()> {
        let step = self.scheduler.handle_update(update)?;
        self.apply(step).await;
        Ok(())
    }

    async fn reconcile(&mut self) -> Result<()> {
        self.last_reconcile = Instant::now();

        let issued = match self.batch.get_issued_batch_job_ids().await {
            Ok(ids) => ids,
            Err(e) => {
                warn!(error = %e, "reconcile skipped: cannot list issued jobs");
                return Ok(());
            }
        };
        let running = match self.batch.get_running_batch_job_ids().await {
            Ok(ids) => ids,
            Err(e) => {
                warn!(error = %e, "reconcile skipped: cannot list running jobs");
                return Ok(());
            }
        };

        let step = self
            .scheduler
            .reconcile(&issued, &running, self.options.reconcile)?;
        self.apply(step).await;
        Ok(())
    }

    /// Queue checkpoints and perform kills requested by a scheduler step.
    async fn apply(&mut self, step: SchedulerStep) {
        for id in step.checkpoint {
            if !self.dirty.contains(&id) {
                self.dirty.push(id);
            }
        }
        if !step.to_kill.is_empty() {
            self.kill(step.to_kill).await;
        }
    }

    async fn kill(&mut self, ids: Vec<BatchJobId>) {
        debug!(?ids, "killing batch jobs");
        if let Err(e) = self.batch.kill_batch_jobs(ids).await {
            warn!(error = %e, "kill request failed");
        }
    }

    /// Write every dirty record in two phases.
    ///
    /// Jobs that made progress of their own (issued, finished, failed) are
    /// written first. Jobs that only follow from that progress (promoted to
    /// `Ready`, `Blocked`) are written once the first phase is durable, so a
    /// crash never leaves a dependent visible ahead of its predecessor.
    async fn flush_checkpoints(&mut self) -> Result<()> {
        if self.dirty.is_empty() {
            return Ok(());
        }

        let (dependents, progressed): (Vec<JobId>, Vec<JobId>) = std::mem::take(&mut self.dirty)
            .into_iter()
            .partition(|id| {
                matches!(
                    self.scheduler.state_of(id),
                    Some(JobState::Unscheduled | JobState::Ready | JobState::Blocked)
                )
            });

        self.write_jobs(progressed).await?;
        self.write_jobs(dependents).await
    }

    /// Write `ids` concurrently on the blocking pool; all writes finish
    /// before this returns.
    async fn write_jobs(&mut self, ids: Vec<JobId>) -> Result<()> {
        let mut writes: JoinSet<StoreResult<()>> = JoinSet::new();
        for id in ids {
            let Some(job) = self.scheduler.graph().get(&id).cloned() else {
                continue;
            };
            let store = Arc::clone(&self.store);
            let run_id = self.record.run_id.clone();
            writes.spawn_blocking(move || save_job(store.as_ref(), &run_id, &job));
        }

        let mut first_error = None;
        while let Some(joined) = writes.join_next().await {
            let result = joined
                .map_err(|e| JobflowError::Other(anyhow!("checkpoint task failed: {e}")))
                .and_then(|r| r.map_err(JobflowError::from));
            if let Err(e) = result {
                error!(run_id = %self.record.run_id, error = %e, "checkpoint failed");
                first_error.get_or_insert(e);
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn publish_demand(&mut self, finished: bool) {
        let Some(tx) = &self.demand_tx else {
            return;
        };
        let busy_nodes = match self.batch.busy_nodes().await {
            Ok(nodes) => nodes,
            Err(e) => {
                debug!(error = %e, "cannot list busy nodes");
                BTreeSet::new()
            }
        };
        tx.send_replace(DemandReport {
            queued: if finished { Vec::new() } else { self.scheduler.demand() },
            busy_nodes,
            finished,
        });
    }

    /// Write the report, mark the run record, apply the clean policy.
    async fn finish(mut self) -> Result<RunReport> {
        self.flush_checkpoints().await?;

        let outcome = RunReport::outcome_of(self.scheduler.graph(), self.scheduler.is_cancelled());
        let report = RunReport::from_graph(self.scheduler.graph(), outcome);
        report.save(self.store.as_ref())?;

        self.record.outcome = Some(outcome);
        save_run(self.store.as_ref(), &self.record)?;
        self.publish_demand(true).await;

        clean_run(
            self.store.as_ref(),
            self.scheduler.graph(),
            self.options.clean,
            report.succeeded(),
        )?;

        info!(
            run_id = %self.record.run_id,
            %outcome,
            completed = report.jobs_in(JobState::Completed).len(),
            permafailed = report.jobs_in(JobState::Permafailed).len(),
            blocked = report.jobs_in(JobState::Blocked).len(),
            "run finished"
        );
        Ok(report)
    }
}
