// src/scaler/core.rs

//! Pure scaling decision logic.
//!
//! [`ScalerCore`] owns the node pool and decides, for a demand snapshot and
//! an explicit `now`, which nodes to create and which to terminate. It has no
//! channels, no provisioner and no clock of its own; the async shell
//! (`scaler::service`) feeds it observations and applies its plans.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::time::Instant;

use tracing::{debug, info, warn};

use crate::batch::NodeId;
use crate::dag::ResourceRequirement;
use crate::scaler::node::{NodeEntry, NodePool, NodeType};
use crate::scaler::packing::required_nodes;
use crate::scaler::provisioner::NodeInfo;
use crate::scaler::ScalerOptions;

/// One provisioner call the shell should make.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScalingAction {
    Create { node_type: String, count: usize },
    Terminate { node_type: String, ids: Vec<NodeId> },
}

/// Result of one planning pass.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScalingPlan {
    pub actions: Vec<ScalingAction>,
    pub unschedulable: Vec<ResourceRequirement>,
}

/// Changes applied to the pool by [`ScalerCore::reconcile_listing`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListingDelta {
    pub dropped: Vec<NodeId>,
    pub adopted: Vec<NodeId>,
}

#[derive(Debug)]
pub struct ScalerCore {
    node_types: Vec<NodeType>,
    options: ScalerOptions,
    pool: NodePool,
    /// Last time a create or terminate was decided, per node type.
    last_decision: HashMap<String, Instant>,
    /// Consecutive create requests that came back short, per node type.
    unfulfilled: HashMap<String, u32>,
}

impl ScalerCore {
    pub fn new(node_types: Vec<NodeType>, options: ScalerOptions) -> Self {
        Self {
            node_types,
            options,
            pool: NodePool::new(),
            last_decision: HashMap::new(),
            unfulfilled: HashMap::new(),
        }
    }

    pub fn node_types(&self) -> &[NodeType] {
        &self.node_types
    }

    pub fn node_type(&self, name: &str) -> Option<&NodeType> {
        self.node_types.iter().find(|t| t.name == name)
    }

    pub fn options(&self) -> &ScalerOptions {
        &self.options
    }

    pub fn pool(&self) -> &NodePool {
        &self.pool
    }

    /// Add a node known from elsewhere (restored record, adopted listing).
    /// Nodes of undeclared types are ignored.
    pub fn adopt(&mut self, entry: NodeEntry) -> bool {
        if self.node_type(&entry.node_type).is_none() {
            warn!(node = %entry.id, node_type = %entry.node_type, "ignoring node of undeclared type");
            return false;
        }
        self.pool.insert(entry);
        true
    }

    /// Decide what to create and terminate for `demand`.
    pub fn plan(
        &mut self,
        demand: &[ResourceRequirement],
        busy: &BTreeSet<NodeId>,
        now: Instant,
    ) -> ScalingPlan {
        self.pool.mark_busy(busy, now);

        let packing = required_nodes(demand, &self.node_types, &self.redirects());
        let mut plan = ScalingPlan {
            actions: Vec::new(),
            unschedulable: packing.unschedulable,
        };

        for node_type in &self.node_types {
            let name = node_type.name.as_str();
            let required = packing.required.get(name).copied().unwrap_or(0);
            let current = self.pool.count_of(name);
            if required == current {
                continue;
            }

            if let Some(last) = self.last_decision.get(name) {
                if now.saturating_duration_since(*last) < self.options.cooldown {
                    debug!(node_type = name, required, current, "node type in cooldown");
                    continue;
                }
            }

            if required > current {
                if required > node_type.max_nodes {
                    warn!(
                        node_type = name,
                        required,
                        max_nodes = node_type.max_nodes,
                        "demand exceeds node type ceiling; refusing the excess"
                    );
                }
                let target = required.min(node_type.max_nodes);
                if target > current {
                    let count = target - current;
                    info!(node_type = name, count, current, required, "scaling up");
                    plan.actions.push(ScalingAction::Create {
                        node_type: name.to_string(),
                        count,
                    });
                    self.last_decision.insert(name.to_string(), now);
                }
            } else {
                let excess = current - required;
                let ids: Vec<NodeId> = self
                    .pool
                    .idle_nodes(name, busy, now, self.options.idle_timeout)
                    .into_iter()
                    .take(excess)
                    .map(|n| n.id.clone())
                    .collect();
                if !ids.is_empty() {
                    info!(node_type = name, count = ids.len(), current, required, "scaling down");
                    plan.actions.push(ScalingAction::Terminate {
                        node_type: name.to_string(),
                        ids,
                    });
                    self.last_decision.insert(name.to_string(), now);
                }
            }
        }

        plan
    }

    /// Record the nodes a create request returned.
    pub fn record_created(
        &mut self,
        node_type: &str,
        requested: usize,
        ids: &[NodeId],
        now: Instant,
    ) {
        for id in ids {
            self.pool.insert(NodeEntry::new(id.clone(), node_type, now));
        }
        if ids.len() < requested {
            warn!(node_type, requested, created = ids.len(), "create request partially fulfilled");
            self.record_unfulfilled(node_type);
        } else {
            self.unfulfilled.remove(node_type);
        }
    }

    /// Record a create request that failed outright.
    pub fn record_create_failed(&mut self, node_type: &str) {
        self.record_unfulfilled(node_type);
    }

    pub fn record_terminated(&mut self, ids: &[NodeId]) {
        for id in ids {
            self.pool.remove(id);
        }
    }

    /// Align the pool with what the provisioner reports: vanished nodes are
    /// dropped, unknown nodes of declared types are adopted.
    pub fn reconcile_listing(&mut self, listed: &[NodeInfo], now: Instant) -> ListingDelta {
        let mut delta = ListingDelta::default();
        let listed_ids: BTreeSet<&str> = listed.iter().map(|n| n.id.as_str()).collect();

        for id in self.pool.ids() {
            if !listed_ids.contains(id.as_str()) {
                warn!(node = %id, "node vanished from the provisioner; dropping it");
                self.pool.remove(&id);
                delta.dropped.push(id);
            }
        }

        for info in listed {
            if self.pool.contains(&info.id) || self.node_type(&info.node_type).is_none() {
                continue;
            }
            info!(node = %info.id, node_type = %info.node_type, "adopting unknown node");
            let mut entry = NodeEntry::new(info.id.clone(), info.node_type.clone(), now);
            entry.allocated_wall = info.launch_time;
            self.pool.insert(entry);
            delta.adopted.push(info.id.clone());
        }

        delta
    }

    /// Preemptible types currently redirected to a non-preemptible type of
    /// the same shape.
    pub fn redirects(&self) -> BTreeMap<String, String> {
        let mut redirects = BTreeMap::new();
        if !self.options.preemptible_compensation {
            return redirects;
        }

        for node_type in self.node_types.iter().filter(|t| t.preemptible) {
            let misses = self.unfulfilled.get(&node_type.name).copied().unwrap_or(0);
            if misses < self.options.compensation_threshold.max(1) {
                continue;
            }
            if let Some(substitute) = self
                .node_types
                .iter()
                .find(|t| !t.preemptible && t.same_shape(node_type))
            {
                redirects.insert(node_type.name.clone(), substitute.name.clone());
            }
        }
        redirects
    }

    fn record_unfulfilled(&mut self, node_type: &str) {
        let entry = self.unfulfilled.entry(node_type.to_string()).or_insert(0);
        *entry += 1;
        let misses = *entry;
        let is_preemptible = self.node_type(node_type).is_some_and(|t| t.preemptible);
        if is_preemptible
            && self.options.preemptible_compensation
            && misses == self.options.compensation_threshold.max(1)
        {
            warn!(node_type, misses, "preemptible capacity keeps falling short; compensating");
        }
    }
}
