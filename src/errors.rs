// src/errors.rs

//! Crate-wide error types.
//!
//! The leader distinguishes errors by how they propagate:
//! - [`BatchError`] is absorbed by the leader (defer, back off, or fail the
//!   one job the backend can never run),
//! - [`ProvisionerError`] is absorbed by the cluster scaler,
//! - [`StoreError::Conflict`], graph cycles and config errors are fatal.

use thiserror::Error;

use crate::dag::JobState;

#[derive(Error, Debug)]
pub enum JobflowError {
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Job not found: {0}")]
    JobNotFound(String),

    #[error("Cycle detected in job graph: {0}")]
    GraphCycle(String),

    #[error("Invalid job graph: {0}")]
    InvalidGraph(String),

    #[error("Invalid state transition for job '{job}': {from:?} -> {to:?}")]
    InvalidTransition {
        job: String,
        from: JobState,
        to: JobState,
    },

    #[error("Run '{0}' already exists in the job store; use --restart to recover it")]
    RunExists(String),

    #[error("Run '{0}' not found in the job store")]
    RunNotFound(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Batch(#[from] BatchError),

    #[error("TOML parsing error: {0}")]
    TomlError(#[from] toml::de::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Errors raised by a [`JobStore`](crate::store::JobStore).
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("key not found: {0}")]
    NotFound(String),

    /// Create on an existing key, or update of a missing key.
    #[error("store conflict on '{key}': {reason}")]
    Conflict { key: String, reason: &'static str },

    #[error("invalid store key '{0}'")]
    InvalidKey(String),

    #[error("store IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("record serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

/// Errors raised by a [`BatchSystem`](crate::batch::BatchSystem).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BatchError {
    /// The backend rejected the job synchronously for lack of capacity.
    #[error("insufficient capacity: {0}")]
    InsufficientCapacity(String),

    /// The backend can never run the job as specified, however long it waits.
    #[error("job can never run on this backend: {0}")]
    Unsatisfiable(String),

    #[error("backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("transient backend error: {0}")]
    Transient(String),
}

/// Errors raised by a [`Provisioner`](crate::scaler::Provisioner).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProvisionerError {
    #[error("provisioner call timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("provisioner error: {0}")]
    Failed(String),
}

pub use anyhow::Error;
pub type Result<T> = std::result::Result<T, JobflowError>;
pub type StoreResult<T> = std::result::Result<T, StoreError>;
pub type BatchResult<T> = std::result::Result<T, BatchError>;
