use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::batch::{BatchJobId, UpdatedBatchJob};
use crate::dag::graph::JobGraph;
use crate::dag::job::{JobId, JobState, ResourceRequirement};
use crate::dag::scheduler_step::SchedulerStep;
use crate::dag::state_manager::{ReadOnlyStateManager, StateManager};
use crate::errors::{JobflowError, Result};

/// Reason recorded on jobs that were still pending when the run was killed.
pub const CANCELLED_REASON: &str = "run cancelled";

/// Limits applied when reconciling against the batch system.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconcilePolicy {
    /// Consecutive passes an attempt may be unknown to the backend before it
    /// is considered lost.
    pub missing_job_threshold: u32,
    /// Attempts running longer than this are killed and count as failures.
    pub max_job_duration: Option<Duration>,
}

impl Default for ReconcilePolicy {
    fn default() -> Self {
        Self {
            missing_job_threshold: 3,
            max_job_duration: None,
        }
    }
}

/// Scheduler holds the job graph plus the mapping from live batch attempts
/// to jobs.
///
/// It is synchronous and deterministic: it performs no IO. Every operation
/// returns a [`SchedulerStep`] describing which records the caller must
/// checkpoint and which backend jobs to kill.
///
/// It is responsible for:
/// - choosing which jobs to issue, and in which order
/// - applying completion events, retries and permanent failures
/// - blocking the descendants of permanently failed jobs
/// - reconciling its view with what the backend reports
/// - cancelling the run
#[derive(Debug)]
pub struct Scheduler {
    graph: JobGraph,
    /// Live attempts: batch id -> job id.
    in_flight: HashMap<BatchJobId, JobId>,
    cancelled: bool,
}

impl Scheduler {
    /// Wrap a graph (freshly materialized or loaded from the store).
    ///
    /// Jobs recorded as `Issued`/`Running` are remembered as in flight; call
    /// [`Scheduler::recover`] to reconcile them with the backend.
    pub fn new(graph: JobGraph) -> Self {
        let in_flight = graph
            .jobs()
            .filter(|j| j.state.is_in_flight())
            .filter_map(|j| j.batch_job_id.map(|b| (b, j.id.clone())))
            .collect();

        Self {
            graph,
            in_flight,
            cancelled: false,
        }
    }

    pub fn graph(&self) -> &JobGraph {
        &self.graph
    }

    pub fn into_graph(self) -> JobGraph {
        self.graph
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled
    }

    pub fn state_of(&self, job: &str) -> Option<JobState> {
        self.graph.state_of(job)
    }

    /// Batch ids of every live attempt.
    pub fn in_flight_batch_ids(&self) -> BTreeSet<BatchJobId> {
        self.in_flight.keys().copied().collect()
    }

    /// Whether nothing can make progress any more.
    pub fn is_finished(&self) -> bool {
        !self
            .graph
            .jobs()
            .any(|j| j.state.is_issuable() || j.state.is_in_flight())
    }

    /// Whether every job completed.
    pub fn all_completed(&self) -> bool {
        self.graph.jobs().all(|j| j.state == JobState::Completed)
    }

    /// Jobs that can be issued now, highest priority first.
    pub fn issuable_jobs(&self) -> Vec<JobId> {
        if self.cancelled {
            return Vec::new();
        }
        ReadOnlyStateManager::new(&self.graph).issuable_in_priority_order()
    }

    /// Requirements of work that is waiting for capacity: issuable jobs plus
    /// issued jobs the backend has not started yet.
    pub fn demand(&self) -> Vec<ResourceRequirement> {
        let mut jobs: Vec<_> = self
            .graph
            .jobs()
            .filter(|j| j.state.is_issuable() || j.state == JobState::Issued)
            .collect();
        jobs.sort_by_key(|j| j.seq);
        jobs.into_iter().map(|j| j.requirement.clone()).collect()
    }

    /// Record that `job` was handed to the backend as `batch_job_id`.
    pub fn mark_issued(&mut self, job: &str, batch_job_id: BatchJobId) -> Result<SchedulerStep> {
        let mut step = SchedulerStep::default();
        if self.cancelled {
            // The caller raced a cancellation; kill the attempt straight away.
            step.to_kill.push(batch_job_id);
            return Ok(step);
        }

        StateManager::new(&mut self.graph).transition(job, JobState::Issued)?;

        let info = self.job_mut(job)?;
        info.attempts += 1;
        info.batch_job_id = Some(batch_job_id);
        info.missed_reconciles = 0;

        if info.attempts > 1 {
            info!(job = %job, batch_job_id, attempt = info.attempts, "issued job for retry");
        } else {
            info!(job = %job, batch_job_id, "issued job for first attempt");
        }

        self.in_flight.insert(batch_job_id, job.to_string());
        step.touch(job);
        Ok(step)
    }

    /// Apply a completion event from the backend.
    ///
    /// Events for unknown, already-finished or killed attempts are discarded.
    pub fn handle_update(&mut self, update: UpdatedBatchJob) -> Result<SchedulerStep> {
        let mut step = SchedulerStep::default();

        let Some(job_id) = self.in_flight.remove(&update.batch_job_id) else {
            debug!(
                batch_job_id = update.batch_job_id,
                exit_status = ?update.exit_status,
                "discarding update for unknown or finished attempt"
            );
            step.discarded.push(update.batch_job_id);
            return Ok(step);
        };

        if self.graph.state_of(&job_id) == Some(JobState::Issued) {
            StateManager::new(&mut self.graph).transition(&job_id, JobState::Running)?;
        }

        if update.exit_status.success() {
            StateManager::new(&mut self.graph).transition(&job_id, JobState::Completed)?;
            let info = self.job_mut(&job_id)?;
            info.batch_job_id = None;
            info.last_failure = None;
            info.outputs.extend(update.outputs);
            info!(
                job = %job_id,
                batch_job_id = update.batch_job_id,
                wall_time = ?update.wall_time,
                "job completed"
            );

            step.touch(&job_id);
            step.completed.push(job_id.clone());

            let promoted = StateManager::new(&mut self.graph).promote_ready_successors(&job_id)?;
            for id in &promoted {
                step.touch(id);
            }
            step.newly_ready = promoted;
        } else {
            let reason = update.failure.clone().unwrap_or_else(|| {
                format!("attempt exited with {}", update.exit_status)
            });
            step.merge(self.fail_attempt(&job_id, &reason)?);
        }

        Ok(step)
    }

    /// Compare live attempts with what the backend reports.
    ///
    /// - `Issued` attempts the backend runs become `Running`.
    /// - Attempts running longer than the policy allows are killed and fail.
    /// - Attempts the backend no longer tracks for enough consecutive passes
    ///   are treated as lost and fail.
    /// - Backend jobs no attempt refers to are killed.
    pub fn reconcile(
        &mut self,
        issued: &BTreeSet<BatchJobId>,
        running: &BTreeMap<BatchJobId, Duration>,
        policy: ReconcilePolicy,
    ) -> Result<SchedulerStep> {
        let mut step = SchedulerStep::default();
        let orphans = self.unknown_backend_jobs(issued, running);

        let mut live: Vec<(BatchJobId, JobId)> =
            self.in_flight.iter().map(|(b, j)| (*b, j.clone())).collect();
        live.sort();

        for (batch_id, job_id) in live {
            if let Some(elapsed) = running.get(&batch_id) {
                if self.graph.state_of(&job_id) == Some(JobState::Issued) {
                    StateManager::new(&mut self.graph).transition(&job_id, JobState::Running)?;
                    debug!(job = %job_id, batch_job_id = batch_id, "job observed running");
                    step.touch(&job_id);
                }
                self.reset_missed(&job_id, &mut step)?;

                if let Some(limit) = policy.max_job_duration {
                    if *elapsed > limit {
                        warn!(
                            job = %job_id,
                            batch_job_id = batch_id,
                            elapsed = ?elapsed,
                            limit = ?limit,
                            "job exceeded maximum duration; killing it"
                        );
                        self.in_flight.remove(&batch_id);
                        step.to_kill.push(batch_id);
                        let reason = format!("exceeded maximum job duration of {limit:?}");
                        step.merge(self.fail_attempt(&job_id, &reason)?);
                    }
                }
            } else if issued.contains(&batch_id) {
                self.reset_missed(&job_id, &mut step)?;
            } else {
                let info = self.job_mut(&job_id)?;
                info.missed_reconciles += 1;
                let missed = info.missed_reconciles;
                step.touch(&job_id);

                if missed >= policy.missing_job_threshold.max(1) {
                    warn!(
                        job = %job_id,
                        batch_job_id = batch_id,
                        missed,
                        "batch system lost track of job; treating it as failed"
                    );
                    self.in_flight.remove(&batch_id);
                    step.merge(self.fail_attempt(&job_id, "lost by the batch system")?);
                } else {
                    debug!(job = %job_id, batch_job_id = batch_id, missed, "job missing from batch system");
                }
            }
        }

        step.to_kill.extend(orphans);
        Ok(step)
    }

    /// Reconcile a graph rebuilt from the store after a leader restart.
    ///
    /// In-flight attempts the backend still tracks are re-adopted; the rest
    /// failed with the old leader. Half-applied propagation (a completed job
    /// whose successors were never promoted, a permafailed job whose
    /// descendants were never blocked) is re-applied, and a `Ready` job whose
    /// predecessor never reached `Completed` goes back to `Unscheduled`.
    /// Running this on an already-consistent graph changes nothing.
    pub fn recover(
        &mut self,
        issued: &BTreeSet<BatchJobId>,
        running: &BTreeMap<BatchJobId, Duration>,
    ) -> Result<SchedulerStep> {
        let mut step = SchedulerStep::default();

        for id in StateManager::new(&mut self.graph).demote_premature_ready() {
            step.touch(&id);
        }

        let mut in_flight_jobs: Vec<(u64, JobId, Option<BatchJobId>)> = self
            .graph
            .jobs()
            .filter(|j| j.state.is_in_flight())
            .map(|j| (j.seq, j.id.clone(), j.batch_job_id))
            .collect();
        in_flight_jobs.sort();

        for (_, job_id, batch_id) in in_flight_jobs {
            match batch_id {
                Some(b) if running.contains_key(&b) || issued.contains(&b) => {
                    if running.contains_key(&b)
                        && self.graph.state_of(&job_id) == Some(JobState::Issued)
                    {
                        StateManager::new(&mut self.graph).transition(&job_id, JobState::Running)?;
                        step.touch(&job_id);
                    }
                    info!(job = %job_id, batch_job_id = b, "re-adopted job still known to the batch system");
                    self.in_flight.insert(b, job_id);
                }
                _ => {
                    warn!(job = %job_id, batch_job_id = ?batch_id, "in-flight job unknown to the batch system after restart");
                    if let Some(b) = batch_id {
                        self.in_flight.remove(&b);
                    }
                    step.merge(self.fail_attempt(&job_id, "lost across leader restart")?);
                }
            }
        }

        let mut ids: Vec<(u64, JobId)> =
            self.graph.jobs().map(|j| (j.seq, j.id.clone())).collect();
        ids.sort();
        for (_, id) in ids {
            match self.graph.state_of(&id) {
                Some(JobState::Completed) => {
                    let promoted = StateManager::new(&mut self.graph).promote_ready_successors(&id)?;
                    for p in &promoted {
                        step.touch(p);
                    }
                    step.newly_ready.extend(promoted);
                }
                Some(JobState::Permafailed) | Some(JobState::Blocked) => {
                    let reason = self.blocked_reason(&id);
                    let blocked = StateManager::new(&mut self.graph).block_descendants(&id, &reason)?;
                    for b in &blocked {
                        step.touch(b);
                    }
                    step.blocked.extend(blocked);
                }
                _ => {}
            }
        }

        step.to_kill.extend(self.unknown_backend_jobs(issued, running));
        Ok(step)
    }

    /// Fail `job` without an attempt: the backend refused it for good, so no
    /// retry can help. Its descendants are blocked.
    pub fn reject(&mut self, job: &str, reason: &str) -> Result<SchedulerStep> {
        let mut step = SchedulerStep::default();
        StateManager::new(&mut self.graph).transition(job, JobState::Permafailed)?;

        let info = self.job_mut(job)?;
        info.batch_job_id = None;
        info.last_failure = Some(reason.to_string());
        warn!(job = %job, reason, "batch system can never run job; blocking dependents");
        step.touch(job);
        step.permafailed.push(job.to_string());

        let blocked = StateManager::new(&mut self.graph)
            .block_descendants(job, &format!("upstream job '{job}' failed"))?;
        for b in &blocked {
            step.touch(b);
        }
        step.blocked = blocked;
        Ok(step)
    }

    /// Cancel the run: every live attempt is to be killed and every
    /// non-terminal job becomes `Blocked`. Later completions are discarded.
    pub fn cancel(&mut self) -> Result<SchedulerStep> {
        let mut step = SchedulerStep::default();
        self.cancelled = true;

        let mut kills: Vec<BatchJobId> = self.in_flight.drain().map(|(b, _)| b).collect();
        kills.sort();
        step.to_kill = kills;

        let mut pending: Vec<(u64, JobId)> = self
            .graph
            .jobs()
            .filter(|j| !j.state.is_terminal())
            .map(|j| (j.seq, j.id.clone()))
            .collect();
        pending.sort();

        for (_, id) in pending {
            StateManager::new(&mut self.graph).transition(&id, JobState::Blocked)?;
            let info = self.job_mut(&id)?;
            info.batch_job_id = None;
            info.last_failure = Some(CANCELLED_REASON.to_string());
            step.touch(&id);
            step.blocked.push(id);
        }

        info!(
            killed = step.to_kill.len(),
            blocked = step.blocked.len(),
            "run cancelled"
        );
        Ok(step)
    }

    /// Fail the current attempt of `job`: retry it while budget remains,
    /// otherwise make it permanent and block its descendants.
    ///
    /// The caller must already have removed the attempt from `in_flight`.
    fn fail_attempt(&mut self, job: &str, reason: &str) -> Result<SchedulerStep> {
        let mut step = SchedulerStep::default();
        StateManager::new(&mut self.graph).transition(job, JobState::Failed)?;

        let info = self.job_mut(job)?;
        info.batch_job_id = None;
        info.missed_reconciles = 0;
        info.last_failure = Some(reason.to_string());

        if info.retries_remaining > 0 {
            info.retries_remaining -= 1;
            let remaining = info.retries_remaining;
            StateManager::new(&mut self.graph).transition(job, JobState::Retrying)?;
            warn!(job = %job, reason, retries_remaining = remaining, "job failed; will retry");
            step.touch(job);
            step.retrying.push(job.to_string());
        } else {
            StateManager::new(&mut self.graph).transition(job, JobState::Permafailed)?;
            warn!(job = %job, reason, "job failed with no retries left; blocking dependents");
            step.touch(job);
            step.permafailed.push(job.to_string());

            let blocked = StateManager::new(&mut self.graph)
                .block_descendants(job, &format!("upstream job '{job}' failed"))?;
            for b in &blocked {
                step.touch(b);
            }
            step.blocked = blocked;
        }

        Ok(step)
    }

    fn reset_missed(&mut self, job: &str, step: &mut SchedulerStep) -> Result<()> {
        let info = self.job_mut(job)?;
        if info.missed_reconciles != 0 {
            info.missed_reconciles = 0;
            step.touch(job);
        }
        Ok(())
    }

    /// Reason to record on descendants of a job that can no longer complete.
    fn blocked_reason(&self, id: &str) -> String {
        match self.graph.state_of(id) {
            Some(JobState::Blocked) => self
                .graph
                .get(id)
                .and_then(|j| j.last_failure.clone())
                .unwrap_or_else(|| format!("upstream job '{id}' blocked")),
            _ => format!("upstream job '{id}' failed"),
        }
    }

    fn unknown_backend_jobs(
        &self,
        issued: &BTreeSet<BatchJobId>,
        running: &BTreeMap<BatchJobId, Duration>,
    ) -> Vec<BatchJobId> {
        let known: BTreeSet<BatchJobId> = issued
            .iter()
            .chain(running.keys())
            .copied()
            .collect();

        known
            .into_iter()
            .filter(|b| !self.in_flight.contains_key(b))
            .inspect(|b| {
                warn!(batch_job_id = *b, "batch system runs a job no record refers to; killing it")
            })
            .collect()
    }

    fn job_mut(&mut self, id: &str) -> Result<&mut crate::dag::Job> {
        self.graph
            .get_mut(id)
            .ok_or_else(|| JobflowError::JobNotFound(id.to_string()))
    }
}
