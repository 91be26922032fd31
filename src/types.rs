use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// What to delete from the job store once a run reaches a terminal state.
///
/// - `Never`: keep every record (useful for post-mortem inspection).
/// - `OnSuccess`: delete job records and payload blobs only if every job
///   completed (default).
/// - `Always`: delete them regardless of the outcome.
///
/// The run record and the final report are always kept, as are output files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
#[value(rename_all = "snake_case")]
pub enum CleanPolicy {
    Never,
    OnSuccess,
    Always,
}

impl Default for CleanPolicy {
    fn default() -> Self {
        CleanPolicy::OnSuccess
    }
}

impl FromStr for CleanPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "never" => Ok(CleanPolicy::Never),
            "on_success" | "onsuccess" => Ok(CleanPolicy::OnSuccess),
            "always" => Ok(CleanPolicy::Always),
            other => Err(format!(
                "invalid clean policy: {other} (expected \"never\", \"on_success\" or \"always\")"
            )),
        }
    }
}

impl CleanPolicy {
    /// Whether a run with the given success flag should be cleaned.
    pub fn should_clean(self, succeeded: bool) -> bool {
        match self {
            CleanPolicy::Never => false,
            CleanPolicy::OnSuccess => succeeded,
            CleanPolicy::Always => true,
        }
    }
}
