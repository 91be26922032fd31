#![allow(dead_code)]

use std::time::Duration;

use jobflow::dag::{JobDescriptor, ReconcilePolicy, ResourceRequirement};
use jobflow::engine::LeaderOptions;
use jobflow::scaler::NodeType;
use jobflow::types::CleanPolicy;

/// Builder for a list of `JobDescriptor`s, kept in insertion order.
#[derive(Debug, Default)]
pub struct WorkflowBuilder {
    jobs: Vec<JobDescriptor>,
}

impl WorkflowBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn job(mut self, job: JobBuilder) -> Self {
        self.jobs.push(job.build());
        self
    }

    /// Shorthand for a job with default settings.
    pub fn simple(self, id: &str, after: &[&str]) -> Self {
        let mut job = JobBuilder::new(id, "true");
        for dep in after {
            job = job.after(dep);
        }
        self.job(job)
    }

    pub fn build(self) -> Vec<JobDescriptor> {
        self.jobs
    }
}

/// Builder for one `JobDescriptor`.
#[derive(Debug)]
pub struct JobBuilder {
    job: JobDescriptor,
}

impl JobBuilder {
    pub fn new(id: &str, cmd: &str) -> Self {
        Self {
            job: JobDescriptor::command(id, cmd),
        }
    }

    pub fn after(mut self, dep: &str) -> Self {
        self.job.after.push(dep.to_string());
        self
    }

    pub fn retries(mut self, retries: u32) -> Self {
        self.job.retries = retries;
        self
    }

    pub fn cores(mut self, cores: f64) -> Self {
        self.job.requirement.cores = cores;
        self
    }

    pub fn memory(mut self, bytes: u64) -> Self {
        self.job.requirement.memory_bytes = bytes;
        self
    }

    pub fn preemptible(mut self, preemptible: bool) -> Self {
        self.job.requirement.preemptible = preemptible;
        self
    }

    pub fn output(mut self, name: &str) -> Self {
        self.job.outputs.push(name.to_string());
        self
    }

    pub fn requirement(mut self, requirement: ResourceRequirement) -> Self {
        self.job.requirement = requirement;
        self
    }

    pub fn build(self) -> JobDescriptor {
        self.job
    }
}

/// Leader options tuned for tests: short polls, frequent reconciles, records
/// kept after the run.
pub fn fast_leader_options() -> LeaderOptions {
    LeaderOptions {
        poll_timeout: Duration::from_millis(10),
        max_updates_per_iteration: 16,
        reconcile_interval: Duration::from_millis(50),
        reconcile: ReconcilePolicy::default(),
        issue_backoff: Duration::from_millis(10),
        clean: CleanPolicy::Never,
    }
}

pub fn node_type(name: &str, cores: f64, preemptible: bool, cost: f64) -> NodeType {
    NodeType {
        name: name.to_string(),
        cores,
        memory_bytes: 64 << 30,
        disk_bytes: 1 << 40,
        preemptible,
        hourly_cost: cost,
        max_nodes: 16,
    }
}
