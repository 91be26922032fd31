// src/config/model.rs

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::Deserialize;

use crate::batch::LocalCapacity;
use crate::config::units::SizeValue;
use crate::dag::{JobDescriptor, RunId};
use crate::engine::LeaderOptions;
use crate::scaler::{NodeType, ScalerOptions};
use crate::types::CleanPolicy;

/// Top-level configuration as read from a TOML file.
///
/// ```toml
/// [leader]
/// job_store = ".jobflow"
/// poll_timeout = "500ms"
///
/// [scaler]
/// enabled = true
/// idle_timeout = "5m"
///
/// [node_type.c4]
/// cores = 4
/// memory = "16Gi"
/// disk = "100G"
/// cost = 0.2
///
/// [job.A]
/// cmd = "echo A > a.txt"
/// outputs = ["a.txt"]
///
/// [job.B]
/// cmd = "cat a.txt"
/// after = ["A"]
/// cores = 2
/// retries = 3
/// ```
///
/// All sections except `[job.<id>]` are optional.
#[derive(Debug, Clone, Deserialize)]
pub struct RawConfigFile {
    #[serde(default)]
    pub leader: LeaderSection,

    #[serde(default)]
    pub scaler: ScalerSection,

    /// Node shapes from `[node_type.<name>]`.
    #[serde(default)]
    pub node_type: BTreeMap<String, NodeTypeConfig>,

    /// Jobs from `[job.<id>]`, keyed by job id.
    #[serde(default)]
    pub job: BTreeMap<String, JobConfig>,
}

/// `[leader]` section. Durations are strings like `"3s"`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct LeaderSection {
    #[serde(default)]
    pub run_id: Option<String>,
    /// Directory backing the file job store.
    #[serde(default)]
    pub job_store: Option<PathBuf>,
    #[serde(default)]
    pub poll_timeout: Option<String>,
    #[serde(default)]
    pub max_updates_per_iteration: Option<usize>,
    #[serde(default)]
    pub reconcile_interval: Option<String>,
    #[serde(default)]
    pub missing_job_threshold: Option<u32>,
    #[serde(default)]
    pub max_job_duration: Option<String>,
    #[serde(default)]
    pub issue_backoff: Option<String>,
    /// Retry budget for jobs that do not set `retries`.
    #[serde(default)]
    pub default_retries: Option<u32>,
    #[serde(default)]
    pub clean: Option<CleanPolicy>,
    /// Cores offered by the local batch system (default: host cores).
    #[serde(default)]
    pub local_cores: Option<f64>,
    #[serde(default)]
    pub local_memory: Option<SizeValue>,
    /// Scratch directory for local attempts.
    #[serde(default)]
    pub work_dir: Option<PathBuf>,
}

/// `[scaler]` section.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ScalerSection {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub interval: Option<String>,
    #[serde(default)]
    pub idle_timeout: Option<String>,
    #[serde(default)]
    pub cooldown: Option<String>,
    #[serde(default)]
    pub preemptible_compensation: bool,
    #[serde(default)]
    pub compensation_threshold: Option<u32>,
    #[serde(default)]
    pub provisioner_timeout: Option<String>,
    #[serde(default)]
    pub provisioner_max_attempts: Option<u32>,
    #[serde(default)]
    pub provisioner_backoff: Option<String>,
}

/// `[node_type.<name>]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct NodeTypeConfig {
    pub cores: f64,
    pub memory: SizeValue,
    pub disk: SizeValue,
    #[serde(default)]
    pub preemptible: bool,
    /// Hourly cost; only compared between types.
    #[serde(default)]
    pub cost: f64,
    #[serde(default = "default_max_nodes")]
    pub max_nodes: usize,
}

fn default_max_nodes() -> usize {
    10
}

/// `[job.<id>]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct JobConfig {
    /// Shell command run with `sh -c`.
    pub cmd: String,

    /// This job waits for every job listed here.
    #[serde(default)]
    pub after: Vec<String>,

    #[serde(default)]
    pub cores: Option<f64>,
    #[serde(default)]
    pub memory: Option<SizeValue>,
    #[serde(default)]
    pub disk: Option<SizeValue>,
    #[serde(default)]
    pub preemptible: bool,
    /// Expected wall time, e.g. `"10m"`. Informational.
    #[serde(default)]
    pub wall_time: Option<String>,
    /// Retry budget; falls back to `[leader].default_retries`.
    #[serde(default)]
    pub retries: Option<u32>,
    /// Files the command leaves in its working directory, imported into the
    /// job store on success.
    #[serde(default)]
    pub outputs: Vec<String>,
}

/// Validated configuration with every value resolved to its typed form.
///
/// Built from [`RawConfigFile`] via `TryFrom` (see `config::validate`).
#[derive(Debug, Clone)]
pub struct ConfigFile {
    pub run_id: RunId,
    pub job_store: PathBuf,
    /// Scratch directory for local attempts; `<job_store>/work` when unset.
    pub work_dir: Option<PathBuf>,
    pub leader: LeaderOptions,
    pub local: LocalCapacity,
    pub scaler_enabled: bool,
    pub scaler: ScalerOptions,
    /// Node types in name order.
    pub node_types: Vec<NodeType>,
    /// Jobs in id order; that order is also their creation order.
    pub jobs: Vec<JobDescriptor>,
}

pub const DEFAULT_RUN_ID: &str = "default";
pub const DEFAULT_JOB_STORE: &str = ".jobflow";
pub const DEFAULT_RETRIES: u32 = 1;

impl ConfigFile {
    pub fn work_dir(&self) -> PathBuf {
        self.work_dir
            .clone()
            .unwrap_or_else(|| self.job_store.join("work"))
    }

    pub fn job(&self, id: &str) -> Option<&JobDescriptor> {
        self.jobs.iter().find(|j| j.id == id)
    }
}
