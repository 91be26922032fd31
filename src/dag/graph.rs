// src/dag/graph.rs

use std::collections::{BTreeMap, HashSet};

use petgraph::algo::toposort;
use petgraph::graphmap::DiGraphMap;
use tracing::{debug, info};

use crate::dag::job::{Job, JobDescriptor, JobId, JobState, RunId};
use crate::errors::{JobflowError, Result, StoreError};
use crate::store::checkpoint::{self, RunRecord};
use crate::store::{JobStore, is_valid_key_segment, keys};

/// The jobs of one workflow run plus their dependency edges.
///
/// Jobs are kept in a `BTreeMap` so iteration (and therefore logging,
/// reports and equality) is deterministic; creation order is carried by
/// [`Job::seq`].
#[derive(Debug, Clone, PartialEq)]
pub struct JobGraph {
    run_id: RunId,
    jobs: BTreeMap<JobId, Job>,
}

/// Check ids, dependency references and acyclicity of a set of descriptors.
pub fn validate_descriptors(descriptors: &[JobDescriptor]) -> Result<()> {
    if descriptors.is_empty() {
        return Err(JobflowError::InvalidGraph(
            "a workflow needs at least one job".to_string(),
        ));
    }

    let mut ids = HashSet::new();
    for desc in descriptors {
        if !is_valid_key_segment(&desc.id) {
            return Err(JobflowError::InvalidGraph(format!(
                "job id '{}' is not usable as a store key",
                desc.id
            )));
        }
        if !ids.insert(desc.id.as_str()) {
            return Err(JobflowError::InvalidGraph(format!(
                "duplicate job id '{}'",
                desc.id
            )));
        }
    }

    for desc in descriptors {
        for dep in &desc.after {
            if dep == &desc.id {
                return Err(JobflowError::InvalidGraph(format!(
                    "job '{}' cannot depend on itself",
                    desc.id
                )));
            }
            if !ids.contains(dep.as_str()) {
                return Err(JobflowError::InvalidGraph(format!(
                    "job '{}' has unknown dependency '{}'",
                    desc.id, dep
                )));
            }
        }
    }

    check_acyclic(
        descriptors
            .iter()
            .flat_map(|d| d.after.iter().map(move |dep| (dep.as_str(), d.id.as_str()))),
        descriptors.iter().map(|d| d.id.as_str()),
    )
}

/// Fail with [`JobflowError::GraphCycle`] if the edges `dep -> job` form a
/// cycle.
pub fn check_acyclic<'a>(
    edges: impl Iterator<Item = (&'a str, &'a str)>,
    nodes: impl Iterator<Item = &'a str>,
) -> Result<()> {
    topological_order(edges, nodes).map(|_| ())
}

/// Nodes ordered so that every `dep -> job` edge points forward.
pub fn topological_order<'a>(
    edges: impl Iterator<Item = (&'a str, &'a str)>,
    nodes: impl Iterator<Item = &'a str>,
) -> Result<Vec<&'a str>> {
    let mut graph: DiGraphMap<&str, ()> = DiGraphMap::new();
    for node in nodes {
        graph.add_node(node);
    }
    for (from, to) in edges {
        graph.add_edge(from, to, ());
    }

    toposort(&graph, None).map_err(|cycle| {
        JobflowError::GraphCycle(format!(
            "cycle detected in job graph involving job '{}'",
            cycle.node_id()
        ))
    })
}

impl JobGraph {
    /// Build an in-memory graph from already-created jobs, filling in
    /// successor sets from predecessor sets.
    pub fn from_jobs(run_id: impl Into<RunId>, jobs: Vec<Job>) -> Result<Self> {
        let mut map: BTreeMap<JobId, Job> = BTreeMap::new();
        for job in jobs {
            map.insert(job.id.clone(), job);
        }

        let edges: Vec<(JobId, JobId)> = map
            .values()
            .flat_map(|job| {
                job.predecessors
                    .iter()
                    .map(move |pred| (pred.clone(), job.id.clone()))
            })
            .collect();

        for (pred, succ) in &edges {
            match map.get_mut(pred) {
                Some(p) => {
                    p.successors.insert(succ.clone());
                }
                None => {
                    return Err(JobflowError::InvalidGraph(format!(
                        "job '{succ}' depends on missing job '{pred}'"
                    )));
                }
            }
        }

        check_acyclic(
            edges.iter().map(|(a, b)| (a.as_str(), b.as_str())),
            map.keys().map(|k| k.as_str()),
        )?;

        Ok(Self {
            run_id: run_id.into(),
            jobs: map,
        })
    }

    /// Create a new run in the store from front-end descriptors.
    ///
    /// Writes payload blobs, then job records, then the run record last.
    /// Job records left behind by an earlier, interrupted materialization of
    /// the same run are overwritten; a run whose record already exists is
    /// refused with [`JobflowError::RunExists`].
    pub fn materialize(
        store: &dyn JobStore,
        run_id: &str,
        descriptors: &[JobDescriptor],
    ) -> Result<Self> {
        validate_descriptors(descriptors)?;

        if store.exists(&keys::run_meta(run_id))? {
            return Err(JobflowError::RunExists(run_id.to_string()));
        }

        let mut jobs = Vec::with_capacity(descriptors.len());
        for (seq, desc) in descriptors.iter().enumerate() {
            let payload = store.put_file(&desc.payload)?;
            jobs.push(Job::from_descriptor(desc, seq as u64, payload));
        }

        let graph = Self::from_jobs(run_id, jobs)?;

        for job in graph.jobs_in_order() {
            checkpoint::upsert_json(store, &keys::job(run_id, &job.id), job)?;
        }

        let record = RunRecord {
            run_id: run_id.to_string(),
            job_ids: graph.jobs_in_order().map(|j| j.id.clone()).collect(),
            cancelled: false,
            outcome: None,
        };
        checkpoint::put_json(store, &keys::run_meta(run_id), &record)?;

        info!(run_id, jobs = graph.len(), "materialized job graph");
        Ok(graph)
    }

    /// Rebuild a run's graph purely from its checkpoint records.
    pub fn load(store: &dyn JobStore, run_id: &str) -> Result<(Self, RunRecord)> {
        let record = match checkpoint::load_run(store, run_id) {
            Ok(r) => r,
            Err(StoreError::NotFound(_)) => {
                return Err(JobflowError::RunNotFound(run_id.to_string()));
            }
            Err(e) => return Err(e.into()),
        };

        let mut jobs = Vec::with_capacity(record.job_ids.len());
        for id in &record.job_ids {
            let mut job = checkpoint::load_job(store, run_id, id)?;
            // Successors are derived, never trusted from disk.
            job.successors.clear();
            jobs.push(job);
        }

        let graph = Self::from_jobs(run_id, jobs)?;
        debug!(run_id, jobs = graph.len(), "loaded job graph from store");
        Ok((graph, record))
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&Job> {
        self.jobs.get(id)
    }

    pub(crate) fn get_mut(&mut self, id: &str) -> Option<&mut Job> {
        self.jobs.get_mut(id)
    }

    /// All jobs, in creation order.
    pub fn jobs_in_order(&self) -> impl Iterator<Item = &Job> {
        let mut jobs: Vec<&Job> = self.jobs.values().collect();
        jobs.sort_by_key(|j| j.seq);
        jobs.into_iter()
    }

    pub fn jobs(&self) -> impl Iterator<Item = &Job> {
        self.jobs.values()
    }

    pub fn state_of(&self, id: &str) -> Option<JobState> {
        self.jobs.get(id).map(|j| j.state)
    }

    /// Immediate predecessors of a job.
    pub fn dependencies_of(&self, id: &str) -> Vec<&str> {
        self.jobs
            .get(id)
            .map(|j| j.predecessors.iter().map(|s| s.as_str()).collect())
            .unwrap_or_default()
    }

    /// Immediate successors of a job.
    pub fn dependents_of(&self, id: &str) -> Vec<&str> {
        self.jobs
            .get(id)
            .map(|j| j.successors.iter().map(|s| s.as_str()).collect())
            .unwrap_or_default()
    }

    /// Whether every predecessor of `id` is `Completed`.
    pub fn predecessors_completed(&self, id: &str) -> bool {
        self.dependencies_of(id)
            .into_iter()
            .all(|p| self.state_of(p) == Some(JobState::Completed))
    }
}
