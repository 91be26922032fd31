// src/store/checkpoint.rs

//! Durable record types and typed JSON helpers on top of [`JobStore`].

use std::time::SystemTime;

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::trace;

use super::{JobStore, keys};
use crate::dag::{Job, JobId, RunId};
use crate::engine::RunOutcome;
use crate::errors::{StoreError, StoreResult};

/// Per-run header record.
///
/// Written last during materialization: a run whose record is missing does
/// not exist as far as recovery is concerned.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: RunId,
    /// Job ids in creation order.
    pub job_ids: Vec<JobId>,
    #[serde(default)]
    pub cancelled: bool,
    /// Set once the run reached a terminal state.
    #[serde(default)]
    pub outcome: Option<RunOutcome>,
}

/// Durable projection of one node pool entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeRecord {
    pub id: String,
    pub node_type: String,
    pub allocated_at: SystemTime,
}

pub fn get_json<T: DeserializeOwned>(store: &dyn JobStore, key: &str) -> StoreResult<T> {
    let bytes = store.get(key)?;
    Ok(serde_json::from_slice(&bytes)?)
}

pub fn put_json<T: Serialize>(store: &dyn JobStore, key: &str, value: &T) -> StoreResult<()> {
    let bytes = serde_json::to_vec(value)?;
    trace!(key, bytes = bytes.len(), "put record");
    store.put(key, &bytes)
}

pub fn update_json<T: Serialize>(store: &dyn JobStore, key: &str, value: &T) -> StoreResult<()> {
    let bytes = serde_json::to_vec(value)?;
    trace!(key, bytes = bytes.len(), "update record");
    store.update(key, &bytes)
}

/// Create-or-overwrite. Only for records whose previous version, if any, was
/// never made visible (partial materialization) or is being replaced
/// wholesale (reports).
pub fn upsert_json<T: Serialize>(store: &dyn JobStore, key: &str, value: &T) -> StoreResult<()> {
    match put_json(store, key, value) {
        Err(StoreError::Conflict { .. }) => update_json(store, key, value),
        other => other,
    }
}

/// Checkpoint an existing job record.
pub fn save_job(store: &dyn JobStore, run: &str, job: &Job) -> StoreResult<()> {
    update_json(store, &keys::job(run, &job.id), job)
}

pub fn load_job(store: &dyn JobStore, run: &str, job: &str) -> StoreResult<Job> {
    get_json(store, &keys::job(run, job))
}

pub fn load_run(store: &dyn JobStore, run: &str) -> StoreResult<RunRecord> {
    get_json(store, &keys::run_meta(run))
}

pub fn save_run(store: &dyn JobStore, record: &RunRecord) -> StoreResult<()> {
    update_json(store, &keys::run_meta(&record.run_id), record)
}
