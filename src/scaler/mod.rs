// src/scaler/mod.rs

//! Cluster autoscaling.
//!
//! - [`node`] holds node shapes and the pool of live nodes.
//! - [`packing`] estimates required nodes per type from queued demand.
//! - [`core`] is the pure decision logic (no IO, explicit clock).
//! - [`provisioner`] is the capability used to create and terminate nodes.
//! - [`service`] is the async loop applying decisions through a provisioner.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use crate::batch::NodeId;
use crate::dag::ResourceRequirement;

pub mod core;
pub mod node;
pub mod packing;
pub mod provisioner;
pub mod service;

pub use self::core::{ScalerCore, ScalingAction, ScalingPlan};
pub use node::{NodeEntry, NodePool, NodeType};
pub use packing::{PackingResult, required_nodes};
pub use provisioner::{NodeInfo, Provisioner, ProvisionerFuture};
pub use service::ClusterScaler;

/// Tunables of the cluster scaler.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScalerOptions {
    /// Time between two scaling passes.
    pub interval: Duration,
    /// How long a node must be idle before it may be terminated.
    pub idle_timeout: Duration,
    /// Minimum time between two scaling decisions for the same node type.
    pub cooldown: Duration,
    /// Redirect demand from a preemptible type that keeps under-delivering
    /// to a non-preemptible type of the same shape.
    pub preemptible_compensation: bool,
    /// Consecutive unfulfilled create requests before compensation kicks in.
    pub compensation_threshold: u32,
    pub provisioner_timeout: Duration,
    pub provisioner_max_attempts: u32,
    /// First retry delay; doubled after every failed attempt.
    pub provisioner_backoff: Duration,
}

impl Default for ScalerOptions {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(10),
            idle_timeout: Duration::from_secs(300),
            cooldown: Duration::from_secs(30),
            preemptible_compensation: false,
            compensation_threshold: 3,
            provisioner_timeout: Duration::from_secs(60),
            provisioner_max_attempts: 3,
            provisioner_backoff: Duration::from_secs(1),
        }
    }
}

/// What the leader publishes to the scaler after every iteration.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DemandReport {
    /// Requirements of jobs waiting for capacity.
    pub queued: Vec<ResourceRequirement>,
    /// Nodes that currently run at least one attempt.
    pub busy_nodes: BTreeSet<NodeId>,
    /// The run reached a terminal state; the scaler shuts down.
    pub finished: bool,
}

/// Externally visible scaler health.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScalerStatus {
    /// The last provisioner call gave up after exhausting its retries.
    pub degraded: bool,
    pub last_error: Option<String>,
    /// Live nodes per type.
    pub nodes: BTreeMap<String, usize>,
    /// Queued requirements no declared node type can hold.
    pub unschedulable: usize,
}
