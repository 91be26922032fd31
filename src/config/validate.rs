// src/config/validate.rs

use std::path::PathBuf;
use std::time::Duration;

use crate::batch::LocalCapacity;
use crate::config::model::{
    ConfigFile, DEFAULT_JOB_STORE, DEFAULT_RETRIES, DEFAULT_RUN_ID, JobConfig, NodeTypeConfig,
    RawConfigFile,
};
use crate::config::units::{SizeValue, parse_duration};
use crate::dag::{JobDescriptor, ReconcilePolicy, ResourceRequirement, check_acyclic};
use crate::engine::LeaderOptions;
use crate::errors::{JobflowError, Result};
use crate::scaler::{NodeType, ScalerOptions};
use crate::store::is_valid_key_segment;

impl TryFrom<RawConfigFile> for ConfigFile {
    type Error = JobflowError;

    fn try_from(raw: RawConfigFile) -> std::result::Result<Self, Self::Error> {
        validate_raw_config(&raw)?;
        resolve(raw)
    }
}

/// Structural checks that do not need any value converted.
pub fn validate_raw_config(cfg: &RawConfigFile) -> Result<()> {
    ensure_has_jobs(cfg)?;
    validate_job_dependencies(cfg)?;
    validate_dag(cfg)?;
    Ok(())
}

fn ensure_has_jobs(cfg: &RawConfigFile) -> Result<()> {
    if cfg.job.is_empty() {
        return Err(config_error(
            "config must contain at least one [job.<id>] section",
        ));
    }
    Ok(())
}

fn validate_job_dependencies(cfg: &RawConfigFile) -> Result<()> {
    for (id, job) in cfg.job.iter() {
        if !is_valid_key_segment(id) {
            return Err(config_error(format!(
                "job id '{id}' must be non-empty, must not start with '.' and must not contain '/'"
            )));
        }
        for dep in job.after.iter() {
            if dep == id {
                return Err(config_error(format!(
                    "job '{id}' cannot depend on itself in `after`"
                )));
            }
            if !cfg.job.contains_key(dep) {
                return Err(config_error(format!(
                    "job '{id}' has unknown dependency '{dep}' in `after`"
                )));
            }
        }
    }
    Ok(())
}

fn validate_dag(cfg: &RawConfigFile) -> Result<()> {
    // Edge direction: dep -> job.
    check_acyclic(
        cfg.job
            .iter()
            .flat_map(|(id, job)| job.after.iter().map(move |dep| (dep.as_str(), id.as_str()))),
        cfg.job.keys().map(String::as_str),
    )
}

fn resolve(raw: RawConfigFile) -> Result<ConfigFile> {
    let leader_section = &raw.leader;

    let reconcile = ReconcilePolicy {
        missing_job_threshold: leader_section
            .missing_job_threshold
            .unwrap_or(ReconcilePolicy::default().missing_job_threshold),
        max_job_duration: opt_duration("leader.max_job_duration", &leader_section.max_job_duration)?,
    };
    if reconcile.missing_job_threshold == 0 {
        return Err(config_error("[leader].missing_job_threshold must be >= 1 (got 0)"));
    }

    let defaults = LeaderOptions::default();
    let leader = LeaderOptions {
        poll_timeout: duration_or("leader.poll_timeout", &leader_section.poll_timeout, defaults.poll_timeout)?,
        max_updates_per_iteration: leader_section
            .max_updates_per_iteration
            .unwrap_or(defaults.max_updates_per_iteration),
        reconcile_interval: duration_or(
            "leader.reconcile_interval",
            &leader_section.reconcile_interval,
            defaults.reconcile_interval,
        )?,
        reconcile,
        issue_backoff: duration_or("leader.issue_backoff", &leader_section.issue_backoff, defaults.issue_backoff)?,
        clean: leader_section.clean.unwrap_or_default(),
    };
    if leader.max_updates_per_iteration == 0 {
        return Err(config_error("[leader].max_updates_per_iteration must be >= 1 (got 0)"));
    }

    let mut local = LocalCapacity::default();
    if let Some(cores) = leader_section.local_cores {
        if !cores.is_finite() || cores <= 0.0 {
            return Err(config_error(format!("[leader].local_cores must be positive (got {cores})")));
        }
        local.cores = cores;
    }
    if let Some(memory) = &leader_section.local_memory {
        local.memory_bytes = Some(size("leader.local_memory", memory)?);
    }

    let scaler = resolve_scaler(&raw)?;
    let node_types = raw
        .node_type
        .iter()
        .map(|(name, cfg)| resolve_node_type(name, cfg))
        .collect::<Result<Vec<_>>>()?;
    if raw.scaler.enabled && node_types.is_empty() {
        return Err(config_error(
            "[scaler].enabled requires at least one [node_type.<name>] section",
        ));
    }

    let default_retries = leader_section.default_retries.unwrap_or(DEFAULT_RETRIES);
    let jobs = raw
        .job
        .iter()
        .map(|(id, cfg)| resolve_job(id, cfg, default_retries))
        .collect::<Result<Vec<_>>>()?;

    let job_store = leader_section
        .job_store
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_JOB_STORE));
    let work_dir = leader_section.work_dir.clone();

    let run_id = leader_section
        .run_id
        .clone()
        .unwrap_or_else(|| DEFAULT_RUN_ID.to_string());
    if !is_valid_key_segment(&run_id) {
        return Err(config_error(format!("[leader].run_id '{run_id}' is not a valid identifier")));
    }

    Ok(ConfigFile {
        run_id,
        job_store,
        work_dir,
        leader,
        local,
        scaler_enabled: raw.scaler.enabled,
        scaler,
        node_types,
        jobs,
    })
}

fn resolve_scaler(raw: &RawConfigFile) -> Result<ScalerOptions> {
    let section = &raw.scaler;
    let defaults = ScalerOptions::default();
    let options = ScalerOptions {
        interval: duration_or("scaler.interval", &section.interval, defaults.interval)?,
        idle_timeout: duration_or("scaler.idle_timeout", &section.idle_timeout, defaults.idle_timeout)?,
        cooldown: duration_or("scaler.cooldown", &section.cooldown, defaults.cooldown)?,
        preemptible_compensation: section.preemptible_compensation,
        compensation_threshold: section
            .compensation_threshold
            .unwrap_or(defaults.compensation_threshold),
        provisioner_timeout: duration_or(
            "scaler.provisioner_timeout",
            &section.provisioner_timeout,
            defaults.provisioner_timeout,
        )?,
        provisioner_max_attempts: section
            .provisioner_max_attempts
            .unwrap_or(defaults.provisioner_max_attempts),
        provisioner_backoff: duration_or(
            "scaler.provisioner_backoff",
            &section.provisioner_backoff,
            defaults.provisioner_backoff,
        )?,
    };

    if options.interval.is_zero() {
        return Err(config_error("[scaler].interval must be greater than zero"));
    }
    if options.compensation_threshold == 0 {
        return Err(config_error("[scaler].compensation_threshold must be >= 1 (got 0)"));
    }
    if options.provisioner_max_attempts == 0 {
        return Err(config_error("[scaler].provisioner_max_attempts must be >= 1 (got 0)"));
    }
    Ok(options)
}

fn resolve_node_type(name: &str, cfg: &NodeTypeConfig) -> Result<NodeType> {
    let field = |f: &str| format!("node_type.{name}.{f}");

    if !cfg.cores.is_finite() || cfg.cores <= 0.0 {
        return Err(config_error(format!(
            "{} must be positive (got {})",
            field("cores"),
            cfg.cores
        )));
    }
    let memory_bytes = size(&field("memory"), &cfg.memory)?;
    let disk_bytes = size(&field("disk"), &cfg.disk)?;
    if memory_bytes == 0 || disk_bytes == 0 {
        return Err(config_error(format!(
            "node type '{name}' needs positive memory and disk"
        )));
    }
    if !cfg.cost.is_finite() || cfg.cost < 0.0 {
        return Err(config_error(format!(
            "{} must be a non-negative number (got {})",
            field("cost"),
            cfg.cost
        )));
    }

    Ok(NodeType {
        name: name.to_string(),
        cores: cfg.cores,
        memory_bytes,
        disk_bytes,
        preemptible: cfg.preemptible,
        hourly_cost: cfg.cost,
        max_nodes: cfg.max_nodes,
    })
}

fn resolve_job(id: &str, cfg: &JobConfig, default_retries: u32) -> Result<JobDescriptor> {
    let field = |f: &str| format!("job.{id}.{f}");
    let defaults = ResourceRequirement::default();

    let cores = cfg.cores.unwrap_or(defaults.cores);
    if !cores.is_finite() || cores < 0.0 {
        return Err(config_error(format!(
            "{} must be a non-negative number (got {cores})",
            field("cores")
        )));
    }

    let requirement = ResourceRequirement {
        cores,
        memory_bytes: match &cfg.memory {
            Some(v) => size(&field("memory"), v)?,
            None => defaults.memory_bytes,
        },
        disk_bytes: match &cfg.disk {
            Some(v) => size(&field("disk"), v)?,
            None => defaults.disk_bytes,
        },
        preemptible: cfg.preemptible,
        wall_time_estimate: opt_duration(&field("wall_time"), &cfg.wall_time)?,
    };

    for output in &cfg.outputs {
        if output.is_empty() || output.starts_with('/') || output.split('/').any(|p| p == "..") {
            return Err(config_error(format!(
                "{}: '{output}' must be a relative path inside the job's working directory",
                field("outputs")
            )));
        }
    }

    Ok(JobDescriptor {
        id: id.to_string(),
        payload: cfg.cmd.clone().into_bytes(),
        requirement,
        retries: cfg.retries.unwrap_or(default_retries),
        after: cfg.after.clone(),
        outputs: cfg.outputs.clone(),
    })
}

fn config_error(msg: impl Into<String>) -> JobflowError {
    JobflowError::ConfigError(msg.into())
}

fn duration_or(field: &str, value: &Option<String>, default: Duration) -> Result<Duration> {
    Ok(opt_duration(field, value)?.unwrap_or(default))
}

fn opt_duration(field: &str, value: &Option<String>) -> Result<Option<Duration>> {
    value
        .as_deref()
        .map(|s| parse_duration(s).map_err(|e| config_error(format!("{field}: {e}"))))
        .transpose()
}

fn size(field: &str, value: &SizeValue) -> Result<u64> {
    value
        .to_bytes()
        .map_err(|e| config_error(format!("{field}: {e}")))
}
