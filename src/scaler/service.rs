// src/scaler/service.rs

//! Async shell around [`ScalerCore`].
//!
//! Runs one scaling pass per interval: reconcile the pool with the
//! provisioner's listing, plan against the latest demand report, apply the
//! plan, persist node records, publish a [`ScalerStatus`].

use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::batch::NodeId;
use crate::dag::RunId;
use crate::errors::{ProvisionerError, Result};
use crate::scaler::core::{ScalerCore, ScalingAction};
use crate::scaler::node::{NodeEntry, NodeType};
use crate::scaler::provisioner::{Provisioner, ProvisionerFuture};
use crate::scaler::{DemandReport, ScalerOptions, ScalerStatus};
use crate::store::checkpoint::{get_json, upsert_json};
use crate::store::{JobStore, NodeRecord, is_valid_key_segment, keys};

/// Call the provisioner with a per-attempt timeout, retrying failures with
/// a doubling backoff until `provisioner_max_attempts` is used up.
pub async fn with_retry<'p, T, F>(
    options: ScalerOptions,
    op: &'static str,
    mut call: F,
) -> std::result::Result<T, ProvisionerError>
where
    F: FnMut() -> ProvisionerFuture<'p, T>,
{
    let max_attempts = options.provisioner_max_attempts.max(1);
    let mut delay = options.provisioner_backoff;
    let mut attempt = 1;

    loop {
        let result = match tokio::time::timeout(options.provisioner_timeout, call()).await {
            Ok(result) => result,
            Err(_elapsed) => Err(ProvisionerError::Timeout(options.provisioner_timeout)),
        };

        match result {
            Ok(value) => return Ok(value),
            Err(e) if attempt < max_attempts => {
                warn!(op, attempt, error = %e, retry_in = ?delay, "provisioner call failed; retrying");
                tokio::time::sleep(delay).await;
                delay = delay.saturating_mul(2);
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

/// The cluster scaler task of one run.
pub struct ClusterScaler<P: Provisioner> {
    core: ScalerCore,
    provisioner: P,
    store: Arc<dyn JobStore>,
    run_id: RunId,
    demand_rx: watch::Receiver<DemandReport>,
    status_tx: watch::Sender<ScalerStatus>,
    status: ScalerStatus,
}

impl<P: Provisioner> fmt::Debug for ClusterScaler<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClusterScaler")
            .field("run_id", &self.run_id)
            .field("core", &self.core)
            .field("status", &self.status)
            .finish_non_exhaustive()
    }
}

impl<P: Provisioner> ClusterScaler<P> {
    /// Build the scaler and the receiver its status is published on.
    pub fn new(
        node_types: Vec<NodeType>,
        options: ScalerOptions,
        provisioner: P,
        store: Arc<dyn JobStore>,
        run_id: impl Into<RunId>,
        demand_rx: watch::Receiver<DemandReport>,
    ) -> (Self, watch::Receiver<ScalerStatus>) {
        let (status_tx, status_rx) = watch::channel(ScalerStatus::default());
        let scaler = Self {
            core: ScalerCore::new(node_types, options),
            provisioner,
            store,
            run_id: run_id.into(),
            demand_rx,
            status_tx,
            status: ScalerStatus::default(),
        };
        (scaler, status_rx)
    }

    pub fn core(&self) -> &ScalerCore {
        &self.core
    }

    pub fn status(&self) -> &ScalerStatus {
        &self.status
    }

    /// Reload the node pool persisted by a previous leader of this run.
    pub fn restore(&mut self) -> Result<usize> {
        let now = Instant::now();
        let mut restored = 0;
        for key in self.store.list(&keys::nodes_prefix(&self.run_id))? {
            let record: NodeRecord = get_json(self.store.as_ref(), &key)?;
            if self.core.adopt(NodeEntry::from_record(&record, now)) {
                restored += 1;
            }
        }
        if restored > 0 {
            info!(run_id = %self.run_id, restored, "restored node pool from job store");
        }
        Ok(restored)
    }

    /// Main loop: one pass per interval until the leader reports the run
    /// finished or drops its end of the demand channel.
    pub async fn run(mut self) -> Result<ScalerStatus> {
        self.restore()?;

        let mut ticker = tokio::time::interval(self.core.options().interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(run_id = %self.run_id, interval = ?self.core.options().interval, "cluster scaler started");

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if self.demand_rx.borrow().finished {
                        break;
                    }
                    self.tick(Instant::now()).await?;
                }
                changed = self.demand_rx.changed() => {
                    if changed.is_err() {
                        debug!("demand channel closed");
                        break;
                    }
                    if self.demand_rx.borrow().finished {
                        break;
                    }
                }
            }
        }

        self.shutdown().await?;
        info!(run_id = %self.run_id, "cluster scaler stopped");
        Ok(self.status)
    }

    /// One scaling pass at `now`.
    pub async fn tick(&mut self, now: Instant) -> Result<()> {
        let options = *self.core.options();
        let mut last_error: Option<String> = None;

        let provisioner = &self.provisioner;
        match with_retry(options, "list_nodes", move || provisioner.list_nodes()).await {
            Ok(listed) => {
                let delta = self.core.reconcile_listing(&listed, now);
                self.forget_nodes(&delta.dropped)?;
                for id in &delta.adopted {
                    self.persist_node(id)?;
                }
            }
            Err(e) => {
                error!(error = %e, "listing nodes failed; scaler degraded");
                last_error = Some(e.to_string());
            }
        }

        let report = self.demand_rx.borrow().clone();
        let plan = self.core.plan(&report.queued, &report.busy_nodes, now);
        self.status.unschedulable = plan.unschedulable.len();

        for action in plan.actions {
            let outcome = match action {
                ScalingAction::Create { node_type, count } => {
                    self.create(&node_type, count, now).await?
                }
                ScalingAction::Terminate { node_type, ids } => {
                    self.terminate(&node_type, ids).await?
                }
            };
            if let Err(e) = outcome {
                last_error = Some(e.to_string());
            }
        }

        self.publish(last_error);
        Ok(())
    }

    /// Create nodes; a provisioner failure is returned in the inner result
    /// so the pass can continue.
    async fn create(
        &mut self,
        node_type: &str,
        count: usize,
        now: Instant,
    ) -> Result<std::result::Result<(), ProvisionerError>> {
        let Some(shape) = self.core.node_type(node_type).cloned() else {
            return Ok(Ok(()));
        };

        let provisioner = &self.provisioner;
        let shape_ref = &shape;
        let created = with_retry(*self.core.options(), "create_nodes", move || {
            provisioner.create_nodes(shape_ref, count)
        })
        .await;

        match created {
            Ok(ids) => {
                info!(node_type, requested = count, created = ids.len(), "nodes created");
                self.core.record_created(node_type, count, &ids, now);
                for id in &ids {
                    self.persist_node(id)?;
                }
                Ok(Ok(()))
            }
            Err(e) => {
                error!(node_type, count, error = %e, "creating nodes failed; scaler degraded");
                self.core.record_create_failed(node_type);
                Ok(Err(e))
            }
        }
    }

    async fn terminate(
        &mut self,
        node_type: &str,
        ids: Vec<NodeId>,
    ) -> Result<std::result::Result<(), ProvisionerError>> {
        let provisioner = &self.provisioner;
        let request = ids.clone();
        let terminated = with_retry(*self.core.options(), "terminate_nodes", move || {
            provisioner.terminate_nodes(request.clone())
        })
        .await;

        match terminated {
            Ok(()) => {
                info!(node_type, count = ids.len(), "nodes terminated");
                self.core.record_terminated(&ids);
                self.forget_nodes(&ids)?;
                Ok(Ok(()))
            }
            Err(e) => {
                // Still in the pool; the next pass tries again.
                error!(node_type, ?ids, error = %e, "terminating nodes failed; scaler degraded");
                Ok(Err(e))
            }
        }
    }

    /// Release every node once the run is over.
    async fn shutdown(&mut self) -> Result<()> {
        let mut by_type: Vec<(String, Vec<NodeId>)> = Vec::new();
        for node in self.core.pool().iter() {
            match by_type.iter_mut().find(|(t, _)| *t == node.node_type) {
                Some((_, ids)) => ids.push(node.id.clone()),
                None => by_type.push((node.node_type.clone(), vec![node.id.clone()])),
            }
        }

        let mut last_error = None;
        for (node_type, ids) in by_type {
            if let Err(e) = self.terminate(&node_type, ids).await? {
                last_error = Some(e.to_string());
            }
        }
        self.publish(last_error);
        Ok(())
    }

    fn persist_node(&self, id: &str) -> Result<()> {
        let Some(entry) = self.core.pool().get(id) else {
            return Ok(());
        };
        if !is_valid_key_segment(id) {
            warn!(node = %id, "node id cannot be used as a store key; not persisting it");
            return Ok(());
        }
        upsert_json(
            self.store.as_ref(),
            &keys::node(&self.run_id, id),
            &entry.to_record(),
        )?;
        Ok(())
    }

    fn forget_nodes(&self, ids: &[NodeId]) -> Result<()> {
        for id in ids.iter().filter(|id| is_valid_key_segment(id)) {
            self.store.delete(&keys::node(&self.run_id, id))?;
        }
        Ok(())
    }

    fn publish(&mut self, last_error: Option<String>) {
        self.status.degraded = last_error.is_some();
        if last_error.is_some() {
            self.status.last_error = last_error;
        }
        self.status.nodes = self.core.pool().counts();
        self.status_tx.send_replace(self.status.clone());
    }
}
