// src/engine/report.rs

//! Final run report and post-run cleanup.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::dag::{JobGraph, JobId, JobState, RunId};
use crate::errors::StoreResult;
use crate::store::checkpoint::{get_json, upsert_json};
use crate::store::{FileId, JobStore, keys};
use crate::types::CleanPolicy;

/// How a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    Succeeded,
    Failed,
    Cancelled,
}

impl fmt::Display for RunOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RunOutcome::Succeeded => "succeeded",
            RunOutcome::Failed => "failed",
            RunOutcome::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobReport {
    pub status: JobState,
    pub attempts: u32,
    pub last_failure: Option<String>,
    pub outputs: BTreeMap<String, FileId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: RunId,
    pub outcome: RunOutcome,
    pub jobs: BTreeMap<JobId, JobReport>,
}

impl RunReport {
    pub fn from_graph(graph: &JobGraph, outcome: RunOutcome) -> Self {
        let jobs = graph
            .jobs()
            .map(|job| {
                (
                    job.id.clone(),
                    JobReport {
                        status: job.state,
                        attempts: job.attempts,
                        last_failure: job.last_failure.clone(),
                        outputs: job.outputs.clone(),
                    },
                )
            })
            .collect();

        Self {
            run_id: graph.run_id().to_string(),
            outcome,
            jobs,
        }
    }

    /// Outcome implied by the final graph.
    pub fn outcome_of(graph: &JobGraph, cancelled: bool) -> RunOutcome {
        if cancelled {
            RunOutcome::Cancelled
        } else if graph.jobs().all(|j| j.state == JobState::Completed) {
            RunOutcome::Succeeded
        } else {
            RunOutcome::Failed
        }
    }

    pub fn succeeded(&self) -> bool {
        self.outcome == RunOutcome::Succeeded
    }

    /// Jobs that ended in `state`, sorted by id.
    pub fn jobs_in(&self, state: JobState) -> Vec<&str> {
        self.jobs
            .iter()
            .filter(|(_, r)| r.status == state)
            .map(|(id, _)| id.as_str())
            .collect()
    }

    pub fn save(&self, store: &dyn JobStore) -> StoreResult<()> {
        upsert_json(store, &keys::run_report(&self.run_id), self)
    }

    pub fn load(store: &dyn JobStore, run_id: &str) -> StoreResult<Self> {
        get_json(store, &keys::run_report(run_id))
    }
}

/// Delete the job records and payload blobs of a finished run when the
/// policy asks for it. The run record, the report and output blobs stay.
///
/// Returns whether anything was cleaned.
pub fn clean_run(
    store: &dyn JobStore,
    graph: &JobGraph,
    policy: CleanPolicy,
    succeeded: bool,
) -> StoreResult<bool> {
    if !policy.should_clean(succeeded) {
        debug!(run_id = graph.run_id(), ?policy, "keeping job records");
        return Ok(false);
    }

    for job in graph.jobs_in_order() {
        store.delete(&keys::job(graph.run_id(), &job.id))?;
        store.delete_file(&job.payload)?;
    }
    info!(run_id = graph.run_id(), jobs = graph.len(), ?policy, "cleaned job records");
    Ok(true)
}
