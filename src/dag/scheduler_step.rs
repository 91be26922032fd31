// src/dag/scheduler_step.rs

//! Step-by-step result type for the scheduler.

use crate::batch::BatchJobId;
use crate::dag::JobId;

/// Structured result of a single scheduler operation.
///
/// The leader uses it to decide what to checkpoint and which backend jobs to
/// kill; tests use it to assert on what changed.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SchedulerStep {
    /// Jobs whose records changed and must be checkpointed, in the order the
    /// changes happened.
    pub checkpoint: Vec<JobId>,
    /// Jobs that became `Ready` in this step.
    pub newly_ready: Vec<JobId>,
    pub completed: Vec<JobId>,
    /// Jobs that failed and have budget left.
    pub retrying: Vec<JobId>,
    pub permafailed: Vec<JobId>,
    /// Jobs made unreachable in this step.
    pub blocked: Vec<JobId>,
    /// Backend jobs the leader should kill.
    pub to_kill: Vec<BatchJobId>,
    /// Completion events that matched no live attempt and were ignored.
    pub discarded: Vec<BatchJobId>,
}

impl SchedulerStep {
    /// Record that `job` must be checkpointed (once).
    pub(crate) fn touch(&mut self, job: &str) {
        if !self.checkpoint.iter().any(|j| j == job) {
            self.checkpoint.push(job.to_string());
        }
    }

    pub(crate) fn merge(&mut self, other: SchedulerStep) {
        for job in &other.checkpoint {
            self.touch(job);
        }
        self.newly_ready.extend(other.newly_ready);
        self.completed.extend(other.completed);
        self.retrying.extend(other.retrying);
        self.permafailed.extend(other.permafailed);
        self.blocked.extend(other.blocked);
        self.to_kill.extend(other.to_kill);
        self.discarded.extend(other.discarded);
    }

    pub fn is_noop(&self) -> bool {
        *self == SchedulerStep::default()
    }
}
