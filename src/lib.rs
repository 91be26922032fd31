// src/lib.rs

pub mod batch;
pub mod cli;
pub mod config;
pub mod dag;
pub mod engine;
pub mod errors;
pub mod logging;
pub mod scaler;
pub mod store;
pub mod types;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::batch::{BatchSystem, LocalBatchSystem};
use crate::cli::CliArgs;
use crate::config::ConfigFile;
use crate::config::loader::load_and_validate;
use crate::dag::{JobDescriptor, RunId, topological_order};
use crate::engine::{
    Leader, LeaderCommand, LeaderOptions, RecoveredRun, RunReport, recover_run, start_run,
};
use crate::scaler::{ClusterScaler, DemandReport, NodeType, Provisioner, ScalerOptions};
use crate::store::{FileJobStore, JobStore};

/// What to run: a fresh workflow, or the recovery of an existing run.
#[derive(Debug, Clone)]
pub struct RunPlan {
    pub run_id: RunId,
    /// Recover `run_id` from the store instead of materializing `jobs`.
    pub restart: bool,
    pub jobs: Vec<JobDescriptor>,
    pub leader: LeaderOptions,
}

/// Autoscaling for a run.
pub struct ScalerSetup {
    pub provisioner: Box<dyn Provisioner>,
    pub node_types: Vec<NodeType>,
    pub options: ScalerOptions,
}

/// High-level entry point used by `main.rs`.
///
/// Loads the workflow, applies CLI overrides and runs it on the local batch
/// system. Returns whether every job completed.
pub async fn run(args: CliArgs) -> Result<bool> {
    let config_path = PathBuf::from(&args.config);
    let mut cfg = load_and_validate(&config_path)
        .with_context(|| format!("loading workflow {}", config_path.display()))?;
    apply_overrides(&mut cfg, &args)?;

    if args.dry_run {
        print_dry_run(&cfg)?;
        return Ok(true);
    }

    let store: Arc<dyn JobStore> = Arc::new(
        FileJobStore::open(&cfg.job_store)
            .with_context(|| format!("opening job store {}", cfg.job_store.display()))?,
    );
    let batch = LocalBatchSystem::new(Arc::clone(&store), cfg.work_dir(), cfg.local);

    if cfg.scaler_enabled {
        warn!("[scaler] is enabled but the local batch system has no provisioner; running without autoscaling");
    }

    // Ctrl-C -> cancel the run.
    let (control_tx, control_rx) = mpsc::channel::<LeaderCommand>(4);
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for Ctrl+C");
            return;
        }
        info!("Ctrl+C received; cancelling run");
        let _ = control_tx.send(LeaderCommand::Cancel).await;
    });

    let plan = RunPlan {
        run_id: cfg.run_id.clone(),
        restart: args.restart,
        jobs: cfg.jobs.clone(),
        leader: cfg.leader,
    };
    let report = execute(plan, store, batch, None, control_rx).await?;
    print_summary(&report);
    Ok(report.succeeded())
}

/// Run `plan` to completion against `batch`, optionally with a cluster
/// scaler in its own task, and return the final report.
pub async fn execute<B: BatchSystem>(
    plan: RunPlan,
    store: Arc<dyn JobStore>,
    mut batch: B,
    scaler: Option<ScalerSetup>,
    control_rx: mpsc::Receiver<LeaderCommand>,
) -> errors::Result<RunReport> {
    let (scheduler, record) = if plan.restart {
        match recover_run(store.as_ref(), &plan.run_id, &mut batch).await? {
            RecoveredRun::Finished(report) => return Ok(report),
            RecoveredRun::Active { scheduler, record } => (scheduler, record),
        }
    } else {
        start_run(store.as_ref(), &plan.run_id, &plan.jobs)?
    };

    let mut leader = Leader::new(
        scheduler,
        record,
        Arc::clone(&store),
        batch,
        plan.leader,
        control_rx,
    );

    let scaler_task = match scaler {
        Some(setup) => {
            let (demand_tx, demand_rx) = watch::channel(DemandReport::default());
            let (scaler, _status_rx) = ClusterScaler::new(
                setup.node_types,
                setup.options,
                setup.provisioner,
                Arc::clone(&store),
                plan.run_id.clone(),
                demand_rx,
            );
            leader = leader.with_demand_channel(demand_tx);
            Some(tokio::spawn(scaler.run()))
        }
        None => None,
    };

    let result = leader.run().await;

    if let Some(task) = scaler_task {
        match task.await {
            Ok(Ok(status)) => debug!(?status, "cluster scaler finished"),
            Ok(Err(e)) => error!(error = %e, "cluster scaler failed"),
            Err(e) => error!(error = %e, "cluster scaler task panicked"),
        }
    }

    result
}

fn apply_overrides(cfg: &mut ConfigFile, args: &CliArgs) -> Result<()> {
    if let Some(dir) = &args.job_store {
        cfg.job_store = dir.clone();
    }
    if let Some(run_id) = &args.run_id {
        if !store::is_valid_key_segment(run_id) {
            anyhow::bail!("--run-id '{run_id}' is not a valid identifier");
        }
        cfg.run_id = run_id.clone();
    }
    if let Some(clean) = args.clean {
        cfg.leader.clean = clean;
    }
    Ok(())
}

/// Print run settings and jobs in a valid execution order.
fn print_dry_run(cfg: &ConfigFile) -> Result<()> {
    let order = topological_order(
        cfg.jobs
            .iter()
            .flat_map(|j| j.after.iter().map(move |dep| (dep.as_str(), j.id.as_str()))),
        cfg.jobs.iter().map(|j| j.id.as_str()),
    )?;

    println!("jobflow dry-run");
    println!("  run_id = {}", cfg.run_id);
    println!("  job_store = {}", cfg.job_store.display());
    println!("  clean = {:?}", cfg.leader.clean);
    println!();

    println!("jobs ({}), in execution order:", cfg.jobs.len());
    for id in order {
        let Some(job) = cfg.job(id) else { continue };
        println!("  - {id}");
        println!("      cmd: {}", String::from_utf8_lossy(&job.payload));
        if !job.after.is_empty() {
            println!("      after: {:?}", job.after);
        }
        println!(
            "      resources: cores={} memory={} disk={} preemptible={}",
            job.requirement.cores,
            job.requirement.memory_bytes,
            job.requirement.disk_bytes,
            job.requirement.preemptible
        );
        println!("      retries: {}", job.retries);
        if !job.outputs.is_empty() {
            println!("      outputs: {:?}", job.outputs);
        }
    }

    if !cfg.node_types.is_empty() {
        println!();
        println!("node types ({}):", cfg.node_types.len());
        for t in &cfg.node_types {
            println!(
                "  - {}: cores={} memory={} disk={} preemptible={} cost={} max_nodes={}",
                t.name, t.cores, t.memory_bytes, t.disk_bytes, t.preemptible, t.hourly_cost, t.max_nodes
            );
        }
    }

    debug!("dry-run complete (no execution)");
    Ok(())
}

fn print_summary(report: &RunReport) {
    println!("run {}: {}", report.run_id, report.outcome);
    for (id, job) in &report.jobs {
        match &job.last_failure {
            Some(reason) if job.status != dag::JobState::Completed => {
                println!("  {id}: {:?} after {} attempt(s): {reason}", job.status, job.attempts)
            }
            _ => println!("  {id}: {:?} after {} attempt(s)", job.status, job.attempts),
        }
    }
}
