// src/dag/mod.rs

//! Job graph representation and scheduling.
//!
//! - [`job`] holds job metadata, resource requirements and the state machine.
//! - [`graph`] holds the store-backed DAG of one run.
//! - [`scheduler`] is the pure state machine that decides what to issue and
//!   how completions, failures and cancellations change the graph.
//! - [`scheduler_step`] defines the result type for scheduler steps.
//! - [`state_manager`] applies validated transitions and propagation.

pub mod graph;
pub mod job;
pub mod scheduler;
pub mod scheduler_step;
pub mod state_manager;

pub use graph::{JobGraph, check_acyclic, topological_order, validate_descriptors};
pub use job::{Job, JobDescriptor, JobId, JobState, ResourceRequirement, RunId};
pub use scheduler::{ReconcilePolicy, Scheduler};
pub use scheduler_step::SchedulerStep;
