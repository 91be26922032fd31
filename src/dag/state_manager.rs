// src/dag/state_manager.rs

//! State transitions and graph-wide propagation for jobs in the scheduler.

use std::cmp::Reverse;

use tracing::{debug, warn};

use crate::dag::JobGraph;
use crate::dag::job::{JobId, JobState};
use crate::errors::{JobflowError, Result};

/// Applies validated state transitions to a [`JobGraph`].
pub struct StateManager<'a> {
    graph: &'a mut JobGraph,
}

impl<'a> StateManager<'a> {
    pub fn new(graph: &'a mut JobGraph) -> Self {
        Self { graph }
    }

    /// Move `id` to `to`, rejecting anything the state machine forbids.
    pub fn transition(&mut self, id: &str, to: JobState) -> Result<()> {
        let job = self
            .graph
            .get_mut(id)
            .ok_or_else(|| JobflowError::JobNotFound(id.to_string()))?;

        if !job.state.can_transition_to(to) {
            return Err(JobflowError::InvalidTransition {
                job: id.to_string(),
                from: job.state,
                to,
            });
        }

        debug!(job = %id, from = %job.state, to = %to, "job state transition");
        job.state = to;
        Ok(())
    }

    /// Mark every `Unscheduled` successor of `id` whose predecessors are now
    /// all `Completed` as `Ready`. Returns the promoted ids in creation order.
    pub fn promote_ready_successors(&mut self, id: &str) -> Result<Vec<JobId>> {
        let candidates: Vec<JobId> = self
            .graph
            .dependents_of(id)
            .into_iter()
            .filter(|s| {
                self.graph.state_of(s) == Some(JobState::Unscheduled)
                    && self.graph.predecessors_completed(s)
            })
            .map(|s| s.to_string())
            .collect();

        let mut promoted = Vec::with_capacity(candidates.len());
        for succ in sort_by_seq(self.graph, candidates) {
            self.transition(&succ, JobState::Ready)?;
            promoted.push(succ);
        }
        Ok(promoted)
    }

    /// Mark every not-yet-started descendant of a permafailed (or blocked)
    /// job as `Blocked`.
    ///
    /// Returns the newly blocked jobs (excluding `root`).
    pub fn block_descendants(&mut self, root: &str, reason: &str) -> Result<Vec<JobId>> {
        let mut stack: Vec<JobId> = self
            .graph
            .dependents_of(root)
            .into_iter()
            .map(|s| s.to_string())
            .collect();
        let mut newly_blocked = Vec::new();

        while let Some(name) = stack.pop() {
            match self.graph.state_of(&name) {
                Some(JobState::Unscheduled) => {
                    self.transition(&name, JobState::Blocked)?;
                    if let Some(job) = self.graph.get_mut(&name) {
                        job.last_failure = Some(reason.to_string());
                    }
                    debug!(job = %name, upstream = %root, "blocking job due to upstream failure");
                    newly_blocked.push(name.clone());
                    stack.extend(self.graph.dependents_of(&name).into_iter().map(|s| s.to_string()));
                }
                Some(JobState::Blocked) | Some(JobState::Permafailed) => {
                    // Already unreachable; its own descendants were handled then.
                }
                Some(other) => {
                    // A descendant of a failed job can only be Unscheduled.
                    warn!(
                        job = %name,
                        state = %other,
                        upstream = %root,
                        "descendant of failed job is not Unscheduled; leaving it alone"
                    );
                }
                None => {}
            }
        }

        Ok(sort_by_seq(self.graph, newly_blocked))
    }

    /// Put every `Ready` job with a predecessor that is not `Completed` back
    /// to `Unscheduled`. Returns the demoted ids in creation order.
    ///
    /// Only a store left behind by an interrupted checkpoint holds such jobs.
    /// Bypasses the state machine.
    pub fn demote_premature_ready(&mut self) -> Vec<JobId> {
        let premature: Vec<JobId> = self
            .graph
            .jobs()
            .filter(|j| j.state == JobState::Ready && !self.graph.predecessors_completed(&j.id))
            .map(|j| j.id.clone())
            .collect();

        for id in &premature {
            if let Some(job) = self.graph.get_mut(id) {
                warn!(job = %id, "ready job has an unfinished predecessor; it waits again");
                job.state = JobState::Unscheduled;
            }
        }
        sort_by_seq(self.graph, premature)
    }
}

/// A read-only view used for ordering and demand computation.
pub struct ReadOnlyStateManager<'a> {
    graph: &'a JobGraph,
}

impl<'a> ReadOnlyStateManager<'a> {
    pub fn new(graph: &'a JobGraph) -> Self {
        Self { graph }
    }

    /// Successors of `id` that may still run and are therefore waiting on it.
    pub fn unsatisfied_successors(&self, id: &str) -> usize {
        self.graph
            .dependents_of(id)
            .into_iter()
            .filter(|s| self.graph.state_of(s).is_some_and(|st| !st.is_terminal()))
            .count()
    }

    /// Issuable jobs (`Ready` or `Retrying`) in issue order: jobs blocking
    /// more successors first, then creation order.
    pub fn issuable_in_priority_order(&self) -> Vec<JobId> {
        let mut jobs: Vec<(usize, u64, JobId)> = self
            .graph
            .jobs()
            .filter(|j| j.state.is_issuable())
            .map(|j| (self.unsatisfied_successors(&j.id), j.seq, j.id.clone()))
            .collect();

        jobs.sort_by_key(|(succ, seq, _)| (Reverse(*succ), *seq));
        jobs.into_iter().map(|(_, _, id)| id).collect()
    }
}

fn sort_by_seq(graph: &JobGraph, mut ids: Vec<JobId>) -> Vec<JobId> {
    ids.sort_by_key(|id| graph.get(id).map(|j| j.seq).unwrap_or(u64::MAX));
    ids
}
