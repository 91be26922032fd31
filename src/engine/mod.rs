// src/engine/mod.rs

//! Run orchestration.
//!
//! This module ties together:
//! - the pure scheduler (`dag::Scheduler`)
//! - the batch system it issues attempts to
//! - the job store every state change is checkpointed to
//! - the demand report consumed by the cluster scaler
//!
//! [`leader`] is the async loop driving one run, [`recovery`] rebuilds a run
//! from the store after a restart, [`report`] produces the final report.

use std::time::Duration;

use crate::dag::ReconcilePolicy;
use crate::types::CleanPolicy;

pub mod leader;
pub mod recovery;
pub mod report;

pub use leader::Leader;
pub use recovery::{RecoveredRun, recover_run, start_run};
pub use report::{JobReport, RunOutcome, RunReport, clean_run};

/// Commands accepted by a running leader.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaderCommand {
    /// Kill every live attempt and block every pending job.
    Cancel,
}

/// Leader loop tunables.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LeaderOptions {
    /// Longest wait for the first completion event of an iteration.
    pub poll_timeout: Duration,
    /// Upper bound on events handled per iteration.
    pub max_updates_per_iteration: usize,
    /// Time between two reconciliations against the batch system.
    pub reconcile_interval: Duration,
    pub reconcile: ReconcilePolicy,
    /// Pause in issuance after the backend reported itself unavailable.
    pub issue_backoff: Duration,
    pub clean: CleanPolicy,
}

impl Default for LeaderOptions {
    fn default() -> Self {
        Self {
            poll_timeout: Duration::from_secs(1),
            max_updates_per_iteration: 100,
            reconcile_interval: Duration::from_secs(30),
            reconcile: ReconcilePolicy::default(),
            issue_backoff: Duration::from_secs(2),
            clean: CleanPolicy::default(),
        }
    }
}
