// src/batch/local.rs

//! Reference backend that runs attempts as processes on the local machine.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::batch::runner::{Attempt, run_attempt};
use crate::batch::{
    BatchFuture, BatchJobId, BatchJobSpec, BatchSystem, ExitStatus, NodeId, UpdatedBatchJob,
};
use crate::errors::BatchError;
use crate::store::JobStore;

/// Node id reported as busy while anything runs locally.
pub const LOCAL_NODE_ID: &str = "local";

/// Resources the local machine offers to jobs.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LocalCapacity {
    pub cores: f64,
    /// `None` leaves memory unaccounted.
    pub memory_bytes: Option<u64>,
}

impl Default for LocalCapacity {
    fn default() -> Self {
        let cores = std::thread::available_parallelism()
            .map(|n| n.get() as f64)
            .unwrap_or(1.0);
        Self {
            cores,
            memory_bytes: None,
        }
    }
}

/// Internal handle for a running attempt.
struct ActiveAttempt {
    cancel: Option<oneshot::Sender<()>>,
    started: Instant,
    cores: f64,
    memory_bytes: u64,
}

/// Single-machine batch system.
///
/// Attempts are queued in submission order and started whenever enough
/// cores (and memory, if limited) are free. Requests larger than the whole
/// machine are rejected synchronously with `Unsatisfiable`.
pub struct LocalBatchSystem {
    store: Arc<dyn JobStore>,
    work_root: PathBuf,
    capacity: LocalCapacity,
    next_id: BatchJobId,
    queued: VecDeque<(BatchJobId, BatchJobSpec)>,
    active: HashMap<BatchJobId, ActiveAttempt>,
    used_cores: f64,
    used_memory: u64,
    /// Kills of attempts that never started, reported on the next poll.
    pending_updates: VecDeque<UpdatedBatchJob>,
    updates_tx: mpsc::Sender<UpdatedBatchJob>,
    updates_rx: mpsc::Receiver<UpdatedBatchJob>,
}

impl LocalBatchSystem {
    pub fn new(store: Arc<dyn JobStore>, work_root: impl Into<PathBuf>, capacity: LocalCapacity) -> Self {
        let (updates_tx, updates_rx) = mpsc::channel(256);
        let work_root = work_root.into();
        info!(
            cores = capacity.cores,
            memory_bytes = ?capacity.memory_bytes,
            work_root = %work_root.display(),
            "local batch system started"
        );

        Self {
            store,
            work_root,
            capacity,
            next_id: 1,
            queued: VecDeque::new(),
            active: HashMap::new(),
            used_cores: 0.0,
            used_memory: 0,
            pending_updates: VecDeque::new(),
            updates_tx,
            updates_rx,
        }
    }

    fn fits_machine(&self, spec: &BatchJobSpec) -> bool {
        spec.requirement.cores <= self.capacity.cores
            && self
                .capacity
                .memory_bytes
                .is_none_or(|mem| spec.requirement.memory_bytes <= mem)
    }

    fn fits_now(&self, spec: &BatchJobSpec) -> bool {
        self.used_cores + spec.requirement.cores <= self.capacity.cores + f64::EPSILON
            && self
                .capacity
                .memory_bytes
                .is_none_or(|mem| self.used_memory + spec.requirement.memory_bytes <= mem)
    }

    /// Start queued attempts in FIFO order while they fit.
    fn start_queued(&mut self) {
        while let Some((_, spec)) = self.queued.front() {
            if !self.fits_now(spec) {
                break;
            }
            if let Some((id, spec)) = self.queued.pop_front() {
                self.start(id, spec);
            }
        }
    }

    fn start(&mut self, batch_job_id: BatchJobId, spec: BatchJobSpec) {
        let (cancel_tx, cancel_rx) = oneshot::channel::<()>();
        let work_dir = self
            .work_root
            .join(&spec.run_id)
            .join(format!("{}-{}", spec.job_id, spec.attempt));

        self.used_cores += spec.requirement.cores;
        self.used_memory += spec.requirement.memory_bytes;
        self.active.insert(
            batch_job_id,
            ActiveAttempt {
                cancel: Some(cancel_tx),
                started: Instant::now(),
                cores: spec.requirement.cores,
                memory_bytes: spec.requirement.memory_bytes,
            },
        );

        debug!(job = %spec.job_id, batch_job_id, "starting attempt");
        let attempt = Attempt {
            batch_job_id,
            spec,
            work_dir,
        };
        tokio::spawn(run_attempt(
            attempt,
            Arc::clone(&self.store),
            self.updates_tx.clone(),
            cancel_rx,
        ));
    }

    /// Release the resources of a finished attempt and start more.
    fn finish(&mut self, batch_job_id: BatchJobId) {
        if let Some(done) = self.active.remove(&batch_job_id) {
            self.used_cores = (self.used_cores - done.cores).max(0.0);
            self.used_memory = self.used_memory.saturating_sub(done.memory_bytes);
        }
        self.start_queued();
    }
}

impl BatchSystem for LocalBatchSystem {
    fn issue_batch_job(&mut self, spec: BatchJobSpec) -> BatchFuture<'_, BatchJobId> {
        Box::pin(async move {
            if !self.fits_machine(&spec) {
                return Err(BatchError::Unsatisfiable(format!(
                    "job '{}' needs {} cores / {} bytes; machine offers {} cores / {:?} bytes",
                    spec.job_id,
                    spec.requirement.cores,
                    spec.requirement.memory_bytes,
                    self.capacity.cores,
                    self.capacity.memory_bytes
                )));
            }

            let id = self.next_id;
            self.next_id += 1;
            self.queued.push_back((id, spec));
            self.start_queued();
            Ok(id)
        })
    }

    fn get_updated_batch_job(
        &mut self,
        timeout: Duration,
    ) -> BatchFuture<'_, Option<UpdatedBatchJob>> {
        Box::pin(async move {
            if let Some(update) = self.pending_updates.pop_front() {
                return Ok(Some(update));
            }

            let received = if timeout.is_zero() {
                match self.updates_rx.try_recv() {
                    Ok(u) => Some(u),
                    Err(mpsc::error::TryRecvError::Empty) => None,
                    Err(mpsc::error::TryRecvError::Disconnected) => {
                        return Err(BatchError::BackendUnavailable(
                            "local update channel closed".to_string(),
                        ));
                    }
                }
            } else {
                match tokio::time::timeout(timeout, self.updates_rx.recv()).await {
                    Ok(Some(u)) => Some(u),
                    Ok(None) => {
                        return Err(BatchError::BackendUnavailable(
                            "local update channel closed".to_string(),
                        ));
                    }
                    Err(_elapsed) => None,
                }
            };

            if let Some(update) = &received {
                self.finish(update.batch_job_id);
            }
            Ok(received)
        })
    }

    fn kill_batch_jobs(&mut self, ids: Vec<BatchJobId>) -> BatchFuture<'_, ()> {
        Box::pin(async move {
            for id in ids {
                if let Some(pos) = self.queued.iter().position(|(q, _)| *q == id) {
                    self.queued.remove(pos);
                    self.pending_updates
                        .push_back(UpdatedBatchJob::new(id, ExitStatus::Killed, Duration::ZERO));
                    debug!(batch_job_id = id, "killed queued attempt");
                } else if let Some(active) = self.active.get_mut(&id) {
                    if let Some(cancel) = active.cancel.take() {
                        if cancel.send(()).is_err() {
                            debug!(batch_job_id = id, "attempt already finished while killing");
                        }
                    }
                } else {
                    warn!(batch_job_id = id, "kill requested for unknown attempt");
                }
            }
            Ok(())
        })
    }

    fn get_running_batch_job_ids(&mut self) -> BatchFuture<'_, BTreeMap<BatchJobId, Duration>> {
        Box::pin(async move {
            Ok(self
                .active
                .iter()
                .map(|(id, a)| (*id, a.started.elapsed()))
                .collect())
        })
    }

    fn get_issued_batch_job_ids(&mut self) -> BatchFuture<'_, BTreeSet<BatchJobId>> {
        Box::pin(async move {
            Ok(self
                .queued
                .iter()
                .map(|(id, _)| *id)
                .chain(self.active.keys().copied())
                .collect())
        })
    }

    fn busy_nodes(&mut self) -> BatchFuture<'_, BTreeSet<NodeId>> {
        Box::pin(async move {
            let mut nodes = BTreeSet::new();
            if !self.active.is_empty() {
                nodes.insert(LOCAL_NODE_ID.to_string());
            }
            Ok(nodes)
        })
    }
}
