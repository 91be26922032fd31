// src/batch/mod.rs

//! Batch execution layer.
//!
//! - [`backend`] defines the `BatchSystem` trait every execution backend
//!   implements, and the types that cross it.
//! - [`local`] is the reference backend: a single-machine process pool.
//! - [`runner`] runs one attempt as an OS process for the local backend.

pub mod backend;
pub mod local;
pub mod runner;

pub use backend::{
    BatchFuture, BatchJobId, BatchJobSpec, BatchSystem, ExitStatus, NodeId, UpdatedBatchJob,
};
pub use local::{LocalBatchSystem, LocalCapacity};
