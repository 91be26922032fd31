// src/dag/job.rs

//! Job metadata, resource requirements and the per-job state machine.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::batch::BatchJobId;
use crate::store::FileId;

/// Canonical job identifier used throughout the engine.
pub type JobId = String;

/// Identifier of one workflow run; namespaces every store key.
pub type RunId = String;

/// Resources a job asks for.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceRequirement {
    pub cores: f64,
    pub memory_bytes: u64,
    pub disk_bytes: u64,
    /// `true` means the job may only run on preemptible capacity, `false`
    /// means it must never be placed on preemptible capacity.
    pub preemptible: bool,
    #[serde(default)]
    pub wall_time_estimate: Option<Duration>,
}

impl Default for ResourceRequirement {
    fn default() -> Self {
        Self {
            cores: 1.0,
            memory_bytes: 256 * 1024 * 1024,
            disk_bytes: 256 * 1024 * 1024,
            preemptible: false,
            wall_time_estimate: None,
        }
    }
}

/// Per-job state.
///
/// ```text
/// Unscheduled -> Ready -> Issued -> Running -> Completed
/// Running -> Failed -> Retrying -> Issued
/// Failed -> Permafailed
/// Ready | Retrying -> Permafailed   (rejected by the backend for good)
/// ```
///
/// `Completed`, `Permafailed` and `Blocked` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobState {
    /// Waiting on at least one predecessor.
    Unscheduled,
    /// Every predecessor completed; waiting to be issued.
    Ready,
    /// Submitted to the batch system, not yet observed running.
    Issued,
    Running,
    Completed,
    /// Transient: the last attempt failed, retry decision pending.
    Failed,
    /// Failed with budget left; issuable again.
    Retrying,
    /// Failed with no retry budget left.
    Permafailed,
    /// Unreachable because an upstream job permafailed or the run was
    /// cancelled. Never issued.
    Blocked,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobState::Completed | JobState::Permafailed | JobState::Blocked
        )
    }

    /// Jobs that can be handed to the batch system right now.
    pub fn is_issuable(self) -> bool {
        matches!(self, JobState::Ready | JobState::Retrying)
    }

    /// Jobs with a live attempt in the batch system.
    pub fn is_in_flight(self) -> bool {
        matches!(self, JobState::Issued | JobState::Running)
    }

    pub fn can_transition_to(self, next: JobState) -> bool {
        use JobState::*;
        matches!(
            (self, next),
            (Unscheduled, Ready)
                | (Ready, Issued)
                | (Issued, Running)
                | (Issued, Failed)
                | (Running, Completed)
                | (Running, Failed)
                | (Failed, Retrying)
                | (Failed, Permafailed)
                | (Ready, Permafailed)
                | (Retrying, Permafailed)
                | (Retrying, Issued)
                | (Unscheduled, Blocked)
                | (Ready, Blocked)
                | (Retrying, Blocked)
                | (Issued, Blocked)
                | (Running, Blocked)
        )
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// A job as handed over by a workflow front end.
#[derive(Debug, Clone, PartialEq)]
pub struct JobDescriptor {
    pub id: JobId,
    /// Opaque to the engine; stored as a blob and passed to the backend.
    pub payload: Vec<u8>,
    pub requirement: ResourceRequirement,
    /// Number of retries after the first failed attempt.
    pub retries: u32,
    /// Predecessors: this job waits for all of them to complete.
    pub after: Vec<JobId>,
    /// Names of output files the job is expected to produce.
    pub outputs: Vec<String>,
}

impl JobDescriptor {
    /// Descriptor for a shell command with default resources.
    pub fn command(id: impl Into<JobId>, cmd: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            payload: cmd.into().into_bytes(),
            requirement: ResourceRequirement::default(),
            retries: 0,
            after: Vec::new(),
            outputs: Vec::new(),
        }
    }
}

/// A job inside a [`JobGraph`](super::JobGraph).
///
/// This is also the durable checkpoint record: the graph can be rebuilt from
/// nothing but the serialized jobs of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    /// Creation order within the run; FIFO tie-breaker when issuing.
    pub seq: u64,
    pub payload: FileId,
    #[serde(default)]
    pub declared_outputs: Vec<String>,
    pub requirement: ResourceRequirement,
    pub retries_remaining: u32,
    /// Number of attempts handed to the batch system so far.
    pub attempts: u32,
    pub state: JobState,
    pub predecessors: BTreeSet<JobId>,
    pub successors: BTreeSet<JobId>,
    /// Batch system id of the current attempt while `Issued`/`Running`.
    #[serde(default)]
    pub batch_job_id: Option<BatchJobId>,
    #[serde(default)]
    pub last_failure: Option<String>,
    #[serde(default)]
    pub outputs: BTreeMap<String, FileId>,
    /// Consecutive reconcile passes in which the batch system did not know
    /// the current attempt.
    #[serde(default)]
    pub missed_reconciles: u32,
}

impl Job {
    pub fn from_descriptor(desc: &JobDescriptor, seq: u64, payload: FileId) -> Self {
        let state = if desc.after.is_empty() {
            JobState::Ready
        } else {
            JobState::Unscheduled
        };

        Self {
            id: desc.id.clone(),
            seq,
            payload,
            declared_outputs: desc.outputs.clone(),
            requirement: desc.requirement.clone(),
            retries_remaining: desc.retries,
            attempts: 0,
            state,
            predecessors: desc.after.iter().cloned().collect(),
            successors: BTreeSet::new(),
            batch_job_id: None,
            last_failure: None,
            outputs: BTreeMap::new(),
            missed_reconciles: 0,
        }
    }
}
