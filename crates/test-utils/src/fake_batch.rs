use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use jobflow::batch::{
    BatchFuture, BatchJobId, BatchJobSpec, BatchSystem, ExitStatus, NodeId, UpdatedBatchJob,
};
use jobflow::dag::JobId;
use jobflow::errors::BatchError;

/// Something the fake observed or delivered, in order.
#[derive(Debug, Clone, PartialEq)]
pub enum FakeEvent {
    Issued { job: JobId, attempt: u32, batch_job_id: BatchJobId },
    Delivered { job: JobId, batch_job_id: BatchJobId, exit_status: ExitStatus },
    Killed { batch_job_id: BatchJobId },
}

#[derive(Debug)]
struct LiveJob {
    job: JobId,
    started: Instant,
}

#[derive(Debug, Default)]
struct FakeState {
    next_id: BatchJobId,
    /// Exit statuses for successive attempts of a job; `Code(0)` once empty.
    script: HashMap<JobId, VecDeque<ExitStatus>>,
    /// Jobs that stay running until `release` is called.
    held: BTreeSet<JobId>,
    /// Jobs rejected with `InsufficientCapacity` on every issue.
    no_capacity: BTreeSet<JobId>,
    unavailable_issues: u32,
    failing_polls: u32,
    report_kills: bool,
    live: BTreeMap<BatchJobId, LiveJob>,
    pending: VecDeque<(JobId, UpdatedBatchJob)>,
    busy_nodes: BTreeSet<NodeId>,
    events: Vec<FakeEvent>,
    specs: Vec<BatchJobSpec>,
}

/// A scriptable in-memory batch system.
///
/// Clones share state, so a test keeps one handle to script and inspect the
/// fake while the leader owns another. Attempts complete on the next poll
/// with the scripted exit status unless their job is held.
#[derive(Debug, Clone)]
pub struct FakeBatchSystem {
    state: Arc<Mutex<FakeState>>,
}

impl Default for FakeBatchSystem {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeBatchSystem {
    pub fn new() -> Self {
        let state = FakeState {
            next_id: 1,
            report_kills: true,
            ..FakeState::default()
        };
        Self {
            state: Arc::new(Mutex::new(state)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap()
    }

    /// Script the exit statuses of the next attempts of `job`.
    pub fn script(&self, job: &str, statuses: impl IntoIterator<Item = ExitStatus>) {
        self.lock()
            .script
            .entry(job.to_string())
            .or_default()
            .extend(statuses);
    }

    /// Make every attempt of `job` exit with `code`.
    pub fn always_fail(&self, job: &str, code: i32) {
        self.script(job, std::iter::repeat_n(ExitStatus::Code(code), 64));
    }

    pub fn hold(&self, job: &str) {
        self.lock().held.insert(job.to_string());
    }

    /// Let a held job finish with `status`.
    pub fn release(&self, job: &str, status: ExitStatus) {
        let mut state = self.lock();
        state.held.remove(job);
        let ids: Vec<BatchJobId> = state
            .live
            .iter()
            .filter(|(_, live)| live.job == job)
            .map(|(id, _)| *id)
            .collect();
        for id in ids {
            state
                .pending
                .push_back((job.to_string(), UpdatedBatchJob::new(id, status, Duration::ZERO)));
        }
    }

    pub fn reject_for_capacity(&self, job: &str) {
        self.lock().no_capacity.insert(job.to_string());
    }

    /// The next `n` issue calls fail with `BackendUnavailable`.
    pub fn fail_next_issues(&self, n: u32) {
        self.lock().unavailable_issues = n;
    }

    /// The next `n` polls fail with `Transient`.
    pub fn fail_next_polls(&self, n: u32) {
        self.lock().failing_polls = n;
    }

    /// Killed attempts vanish without a completion event.
    pub fn drop_kill_reports(&self) {
        self.lock().report_kills = false;
    }

    pub fn set_busy_nodes(&self, nodes: impl IntoIterator<Item = NodeId>) {
        self.lock().busy_nodes = nodes.into_iter().collect();
    }

    /// Pretend an attempt of `job` was issued by a previous leader and is
    /// still running here.
    pub fn adopt(&self, batch_job_id: BatchJobId, job: &str) {
        let mut state = self.lock();
        state.next_id = state.next_id.max(batch_job_id + 1);
        state.live.insert(
            batch_job_id,
            LiveJob {
                job: job.to_string(),
                started: Instant::now(),
            },
        );
        if !state.held.contains(job) {
            let status = next_status(&mut state, job);
            state.pending.push_back((
                job.to_string(),
                UpdatedBatchJob::new(batch_job_id, status, Duration::ZERO),
            ));
        }
    }

    /// Forget an attempt without ever reporting it.
    pub fn lose(&self, batch_job_id: BatchJobId) {
        let mut state = self.lock();
        state.live.remove(&batch_job_id);
        state.pending.retain(|(_, u)| u.batch_job_id != batch_job_id);
    }

    /// Queue a completion for an id whether or not it is live.
    pub fn inject(&self, job: &str, update: UpdatedBatchJob) {
        self.lock().pending.push_back((job.to_string(), update));
    }

    pub fn events(&self) -> Vec<FakeEvent> {
        self.lock().events.clone()
    }

    pub fn specs(&self) -> Vec<BatchJobSpec> {
        self.lock().specs.clone()
    }

    /// Job ids in the order they were issued, one entry per attempt.
    pub fn issue_order(&self) -> Vec<JobId> {
        self.lock()
            .events
            .iter()
            .filter_map(|e| match e {
                FakeEvent::Issued { job, .. } => Some(job.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn attempts_of(&self, job: &str) -> usize {
        self.issue_order().iter().filter(|j| *j == job).count()
    }

    pub fn killed(&self) -> Vec<BatchJobId> {
        self.lock()
            .events
            .iter()
            .filter_map(|e| match e {
                FakeEvent::Killed { batch_job_id } => Some(*batch_job_id),
                _ => None,
            })
            .collect()
    }

    /// Whether a completion of `job` has been handed to the leader.
    pub fn was_delivered(&self, job: &str) -> bool {
        self.lock()
            .events
            .iter()
            .any(|e| matches!(e, FakeEvent::Delivered { job: j, .. } if j == job))
    }

    pub fn live_jobs(&self) -> Vec<JobId> {
        self.lock().live.values().map(|l| l.job.clone()).collect()
    }

    pub fn is_live(&self, job: &str) -> bool {
        self.lock().live.values().any(|l| l.job == job)
    }
}

fn next_status(state: &mut FakeState, job: &str) -> ExitStatus {
    state
        .script
        .get_mut(job)
        .and_then(VecDeque::pop_front)
        .unwrap_or(ExitStatus::Code(0))
}

impl BatchSystem for FakeBatchSystem {
    fn issue_batch_job(&mut self, spec: BatchJobSpec) -> BatchFuture<'_, BatchJobId> {
        let mut state = self.lock();
        let result = if state.unavailable_issues > 0 {
            state.unavailable_issues -= 1;
            Err(BatchError::BackendUnavailable("scripted outage".to_string()))
        } else if state.no_capacity.contains(&spec.job_id) {
            Err(BatchError::InsufficientCapacity(format!(
                "no room for {}",
                spec.job_id
            )))
        } else {
            let id = state.next_id;
            state.next_id += 1;
            let job = spec.job_id.clone();
            state.events.push(FakeEvent::Issued {
                job: job.clone(),
                attempt: spec.attempt,
                batch_job_id: id,
            });
            state.live.insert(
                id,
                LiveJob {
                    job: job.clone(),
                    started: Instant::now(),
                },
            );
            if !state.held.contains(&job) {
                let status = next_status(&mut state, &job);
                state
                    .pending
                    .push_back((job, UpdatedBatchJob::new(id, status, Duration::from_millis(1))));
            }
            state.specs.push(spec);
            Ok(id)
        };
        drop(state);
        Box::pin(async move { result })
    }

    fn get_updated_batch_job(
        &mut self,
        timeout: Duration,
    ) -> BatchFuture<'_, Option<UpdatedBatchJob>> {
        Box::pin(async move {
            let deadline = Instant::now() + timeout;
            loop {
                {
                    let mut state = self.lock();
                    if state.failing_polls > 0 {
                        state.failing_polls -= 1;
                        return Err(BatchError::Transient("scripted poll failure".to_string()));
                    }
                    if let Some((job, update)) = state.pending.pop_front() {
                        state.live.remove(&update.batch_job_id);
                        state.events.push(FakeEvent::Delivered {
                            job,
                            batch_job_id: update.batch_job_id,
                            exit_status: update.exit_status,
                        });
                        return Ok(Some(update));
                    }
                }
                let now = Instant::now();
                if now >= deadline {
                    return Ok(None);
                }
                tokio::time::sleep((deadline - now).min(Duration::from_millis(2))).await;
            }
        })
    }

    fn kill_batch_jobs(&mut self, ids: Vec<BatchJobId>) -> BatchFuture<'_, ()> {
        let mut state = self.lock();
        for id in ids {
            let Some(live) = state.live.remove(&id) else {
                continue;
            };
            state.pending.retain(|(_, u)| u.batch_job_id != id);
            state.events.push(FakeEvent::Killed { batch_job_id: id });
            if state.report_kills {
                state.pending.push_back((
                    live.job,
                    UpdatedBatchJob::new(id, ExitStatus::Killed, Duration::ZERO),
                ));
            }
        }
        drop(state);
        Box::pin(async { Ok(()) })
    }

    fn get_running_batch_job_ids(&mut self) -> BatchFuture<'_, BTreeMap<BatchJobId, Duration>> {
        let running = self
            .lock()
            .live
            .iter()
            .map(|(id, live)| (*id, live.started.elapsed()))
            .collect();
        Box::pin(async move { Ok(running) })
    }

    fn get_issued_batch_job_ids(&mut self) -> BatchFuture<'_, BTreeSet<BatchJobId>> {
        let issued = self.lock().live.keys().copied().collect();
        Box::pin(async move { Ok(issued) })
    }

    fn busy_nodes(&mut self) -> BatchFuture<'_, BTreeSet<NodeId>> {
        let busy = self.lock().busy_nodes.clone();
        Box::pin(async move { Ok(busy) })
    }
}
