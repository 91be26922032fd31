// src/scaler/node.rs

//! Node shapes and the live node pool.

use std::collections::{BTreeMap, BTreeSet};
use std::time::{Duration, Instant, SystemTime};

use crate::batch::NodeId;
use crate::dag::ResourceRequirement;
use crate::store::NodeRecord;

/// A named compute shape the cluster can be scaled with.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeType {
    pub name: String,
    pub cores: f64,
    pub memory_bytes: u64,
    pub disk_bytes: u64,
    pub preemptible: bool,
    pub hourly_cost: f64,
    /// Hard ceiling on nodes of this type.
    pub max_nodes: usize,
}

impl NodeType {
    /// Whether one node of this shape can hold `req` at all.
    pub fn fits(&self, req: &ResourceRequirement) -> bool {
        req.cores <= self.cores + f64::EPSILON
            && req.memory_bytes <= self.memory_bytes
            && req.disk_bytes <= self.disk_bytes
    }

    /// Fits, and the preemptible flags agree.
    pub fn is_compatible(&self, req: &ResourceRequirement) -> bool {
        self.fits(req) && req.preemptible == self.preemptible
    }

    pub fn same_shape(&self, other: &NodeType) -> bool {
        (self.cores - other.cores).abs() < f64::EPSILON
            && self.memory_bytes == other.memory_bytes
            && self.disk_bytes == other.disk_bytes
    }
}

/// A live node owned by the cluster scaler.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeEntry {
    pub id: NodeId,
    pub node_type: String,
    pub allocated_at: Instant,
    /// Wall-clock allocation time, for the durable record.
    pub allocated_wall: SystemTime,
    pub last_seen_busy: Instant,
}

impl NodeEntry {
    pub fn new(id: NodeId, node_type: impl Into<String>, now: Instant) -> Self {
        Self {
            id,
            node_type: node_type.into(),
            allocated_at: now,
            allocated_wall: SystemTime::now(),
            last_seen_busy: now,
        }
    }

    pub fn to_record(&self) -> NodeRecord {
        NodeRecord {
            id: self.id.clone(),
            node_type: self.node_type.clone(),
            allocated_at: self.allocated_wall,
        }
    }

    /// Rebuild an entry from its record. Monotonic times restart at `now`,
    /// which gives restored nodes a full idle grace period.
    pub fn from_record(record: &NodeRecord, now: Instant) -> Self {
        let age = SystemTime::now()
            .duration_since(record.allocated_at)
            .unwrap_or_default();
        Self {
            id: record.id.clone(),
            node_type: record.node_type.clone(),
            allocated_at: now.checked_sub(age).unwrap_or(now),
            allocated_wall: record.allocated_at,
            last_seen_busy: now,
        }
    }

    pub fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_seen_busy)
    }
}

/// All nodes the scaler currently owns, keyed by id.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NodePool {
    nodes: BTreeMap<NodeId, NodeEntry>,
}

impl NodePool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, entry: NodeEntry) {
        self.nodes.insert(entry.id.clone(), entry);
    }

    pub fn remove(&mut self, id: &str) -> Option<NodeEntry> {
        self.nodes.remove(id)
    }

    pub fn get(&self, id: &str) -> Option<&NodeEntry> {
        self.nodes.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.nodes.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &NodeEntry> {
        self.nodes.values()
    }

    pub fn ids(&self) -> BTreeSet<NodeId> {
        self.nodes.keys().cloned().collect()
    }

    pub fn count_of(&self, node_type: &str) -> usize {
        self.nodes
            .values()
            .filter(|n| n.node_type == node_type)
            .count()
    }

    pub fn counts(&self) -> BTreeMap<String, usize> {
        let mut counts = BTreeMap::new();
        for node in self.nodes.values() {
            *counts.entry(node.node_type.clone()).or_insert(0) += 1;
        }
        counts
    }

    /// Refresh `last_seen_busy` for every node the batch system reports busy.
    pub fn mark_busy(&mut self, busy: &BTreeSet<NodeId>, now: Instant) {
        for id in busy {
            if let Some(node) = self.nodes.get_mut(id) {
                node.last_seen_busy = now;
            }
        }
    }

    /// Nodes of `node_type` that are not busy right now and have been idle
    /// longer than `idle_timeout`, most recently allocated first.
    pub fn idle_nodes(
        &self,
        node_type: &str,
        busy: &BTreeSet<NodeId>,
        now: Instant,
        idle_timeout: Duration,
    ) -> Vec<&NodeEntry> {
        let mut idle: Vec<&NodeEntry> = self
            .nodes
            .values()
            .filter(|n| n.node_type == node_type)
            .filter(|n| !busy.contains(&n.id))
            .filter(|n| n.idle_for(now) > idle_timeout)
            .collect();
        idle.sort_by(|a, b| b.allocated_at.cmp(&a.allocated_at).then_with(|| a.id.cmp(&b.id)));
        idle
    }
}
