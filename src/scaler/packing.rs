// src/scaler/packing.rs

//! Bin-packing estimate of how many nodes queued demand needs.
//!
//! Each requirement goes to the cheapest compatible node type (declaration
//! order breaks ties). Per type, requirements are packed first-fit-decreasing
//! into node-shaped bins, ordered by their size relative to the node shape.

use std::collections::BTreeMap;

use tracing::warn;

use crate::dag::ResourceRequirement;
use crate::scaler::node::NodeType;

/// Outcome of packing the current demand.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PackingResult {
    /// Nodes needed per node type name. Types with no demand are present
    /// with a count of zero.
    pub required: BTreeMap<String, usize>,
    /// Requirements no declared node type can ever hold.
    pub unschedulable: Vec<ResourceRequirement>,
}

/// Remaining room in one bin.
#[derive(Debug, Clone, Copy)]
struct Bin {
    cores: f64,
    memory_bytes: u64,
    disk_bytes: u64,
}

impl Bin {
    fn empty(node_type: &NodeType) -> Self {
        Self {
            cores: node_type.cores,
            memory_bytes: node_type.memory_bytes,
            disk_bytes: node_type.disk_bytes,
        }
    }

    fn try_add(&mut self, req: &ResourceRequirement) -> bool {
        if req.cores <= self.cores + f64::EPSILON
            && req.memory_bytes <= self.memory_bytes
            && req.disk_bytes <= self.disk_bytes
        {
            self.cores -= req.cores;
            self.memory_bytes -= req.memory_bytes;
            self.disk_bytes -= req.disk_bytes;
            true
        } else {
            false
        }
    }
}

/// Size of `req` relative to one node of `node_type`, summed over
/// dimensions. Used as the "decreasing" key of first-fit-decreasing.
pub fn weighted_size(req: &ResourceRequirement, node_type: &NodeType) -> f64 {
    fn ratio(used: f64, total: f64) -> f64 {
        if total > 0.0 { used / total } else { 0.0 }
    }
    ratio(req.cores, node_type.cores)
        + ratio(req.memory_bytes as f64, node_type.memory_bytes as f64)
        + ratio(req.disk_bytes as f64, node_type.disk_bytes as f64)
}

/// The cheapest declared type compatible with `req`.
pub fn cheapest_compatible<'a>(
    req: &ResourceRequirement,
    node_types: &'a [NodeType],
) -> Option<&'a NodeType> {
    node_types
        .iter()
        .filter(|t| t.is_compatible(req))
        .min_by(|a, b| a.hourly_cost.total_cmp(&b.hourly_cost))
}

/// Number of `node_type` nodes needed to hold every requirement in `reqs`.
///
/// Assumes every requirement fits an empty node.
pub fn pack(reqs: &[&ResourceRequirement], node_type: &NodeType) -> usize {
    let mut sorted: Vec<&ResourceRequirement> = reqs.to_vec();
    sorted.sort_by(|a, b| {
        weighted_size(b, node_type).total_cmp(&weighted_size(a, node_type))
    });

    let mut bins: Vec<Bin> = Vec::new();
    for req in sorted {
        if bins.iter_mut().any(|bin| bin.try_add(req)) {
            continue;
        }
        let mut bin = Bin::empty(node_type);
        if bin.try_add(req) {
            bins.push(bin);
        }
    }
    bins.len()
}

/// Estimate required nodes per type for the given demand.
///
/// `redirects` maps a node type name to the name of a substitute type: demand
/// assigned to the former is packed into the latter instead. The cluster
/// scaler uses it for preemptible compensation.
pub fn required_nodes(
    demand: &[ResourceRequirement],
    node_types: &[NodeType],
    redirects: &BTreeMap<String, String>,
) -> PackingResult {
    let mut per_type: BTreeMap<&str, Vec<&ResourceRequirement>> = BTreeMap::new();
    let mut result = PackingResult::default();

    for req in demand {
        let Some(assigned) = cheapest_compatible(req, node_types) else {
            warn!(
                cores = req.cores,
                memory_bytes = req.memory_bytes,
                disk_bytes = req.disk_bytes,
                preemptible = req.preemptible,
                "no declared node type can run this job"
            );
            result.unschedulable.push(req.clone());
            continue;
        };

        let target = redirects
            .get(&assigned.name)
            .and_then(|name| node_types.iter().find(|t| &t.name == name))
            .unwrap_or(assigned);
        per_type.entry(target.name.as_str()).or_default().push(req);
    }

    for node_type in node_types {
        let count = per_type
            .get(node_type.name.as_str())
            .map(|reqs| pack(reqs, node_type))
            .unwrap_or(0);
        result.required.insert(node_type.name.clone(), count);
    }

    result
}
