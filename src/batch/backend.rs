// src/batch/backend.rs

//! Pluggable execution backend abstraction.
//!
//! The leader talks to a `BatchSystem` instead of a concrete scheduler API.
//! This keeps backend protocol details in one adapter per backend, and makes
//! it easy to swap in a scripted fake in tests.
//!
//! The interface is pull-based and lossy on purpose: completions are fetched
//! with a bounded wait, at most one per call, in no particular order, and a
//! killed job may never be reported at all.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use crate::dag::{JobId, ResourceRequirement, RunId};
use crate::errors::BatchResult;
use crate::store::FileId;

/// Identifier the backend assigns to one attempt of one job.
pub type BatchJobId = u64;

/// Identifier of a worker node, shared with the cluster scaler.
pub type NodeId = String;

pub type BatchFuture<'a, T> = Pin<Box<dyn Future<Output = BatchResult<T>> + Send + 'a>>;

/// Everything a backend needs to run one attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchJobSpec {
    pub run_id: RunId,
    pub job_id: JobId,
    /// 1-based attempt number.
    pub attempt: u32,
    pub requirement: ResourceRequirement,
    /// Blob holding the opaque payload.
    pub payload: FileId,
    /// Output names the attempt is expected to produce.
    pub outputs: Vec<String>,
}

/// How an attempt ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitStatus {
    /// The payload exited with this code.
    Code(i32),
    /// The attempt was killed on request.
    Killed,
    /// The backend could not run the attempt or collect its results.
    Error,
}

impl ExitStatus {
    pub fn success(self) -> bool {
        self == ExitStatus::Code(0)
    }
}

impl fmt::Display for ExitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitStatus::Code(c) => write!(f, "exit code {c}"),
            ExitStatus::Killed => write!(f, "killed"),
            ExitStatus::Error => write!(f, "backend error"),
        }
    }
}

/// A completion event.
#[derive(Debug, Clone, PartialEq)]
pub struct UpdatedBatchJob {
    pub batch_job_id: BatchJobId,
    pub exit_status: ExitStatus,
    pub wall_time: Duration,
    /// Declared outputs imported into the job store, by name.
    pub outputs: Vec<(String, FileId)>,
    /// Backend-side explanation for a failure, if any.
    pub failure: Option<String>,
}

impl UpdatedBatchJob {
    pub fn new(batch_job_id: BatchJobId, exit_status: ExitStatus, wall_time: Duration) -> Self {
        Self {
            batch_job_id,
            exit_status,
            wall_time,
            outputs: Vec::new(),
            failure: None,
        }
    }
}

/// Trait abstracting an execution backend.
///
/// Methods return boxed futures so the trait stays object safe; the leader
/// only ever holds the trait type.
pub trait BatchSystem: Send {
    /// Submit one attempt.
    ///
    /// Fails with `InsufficientCapacity` if the backend rejects the request
    /// synchronously for now, `Unsatisfiable` if it can never run it, and
    /// `BackendUnavailable` if it cannot be reached. Most backends queue
    /// instead of rejecting.
    fn issue_batch_job(&mut self, spec: BatchJobSpec) -> BatchFuture<'_, BatchJobId>;

    /// Wait up to `timeout` for one completion event. `None` means nothing
    /// finished in time.
    fn get_updated_batch_job(
        &mut self,
        timeout: Duration,
    ) -> BatchFuture<'_, Option<UpdatedBatchJob>>;

    /// Best-effort kill. A killed attempt is later reported with
    /// [`ExitStatus::Killed`], or never.
    fn kill_batch_jobs(&mut self, ids: Vec<BatchJobId>) -> BatchFuture<'_, ()>;

    /// Attempts currently executing, with how long each has been running.
    fn get_running_batch_job_ids(&mut self) -> BatchFuture<'_, BTreeMap<BatchJobId, Duration>>;

    /// Attempts the backend still tracks, queued or running.
    fn get_issued_batch_job_ids(&mut self) -> BatchFuture<'_, BTreeSet<BatchJobId>>;

    /// Nodes that currently run at least one attempt.
    fn busy_nodes(&mut self) -> BatchFuture<'_, BTreeSet<NodeId>> {
        Box::pin(async { Ok(BTreeSet::new()) })
    }
}

impl<B: BatchSystem + ?Sized> BatchSystem for Box<B> {
    fn issue_batch_job(&mut self, spec: BatchJobSpec) -> BatchFuture<'_, BatchJobId> {
        (**self).issue_batch_job(spec)
    }

    fn get_updated_batch_job(
        &mut self,
        timeout: Duration,
    ) -> BatchFuture<'_, Option<UpdatedBatchJob>> {
        (**self).get_updated_batch_job(timeout)
    }

    fn kill_batch_jobs(&mut self, ids: Vec<BatchJobId>) -> BatchFuture<'_, ()> {
        (**self).kill_batch_jobs(ids)
    }

    fn get_running_batch_job_ids(&mut self) -> BatchFuture<'_, BTreeMap<BatchJobId, Duration>> {
        (**self).get_running_batch_job_ids()
    }

    fn get_issued_batch_job_ids(&mut self) -> BatchFuture<'_, BTreeSet<BatchJobId>> {
        (**self).get_issued_batch_job_ids()
    }

    fn busy_nodes(&mut self) -> BatchFuture<'_, BTreeSet<NodeId>> {
        (**self).busy_nodes()
    }
}
