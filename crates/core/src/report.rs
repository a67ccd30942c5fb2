use crate::models::{FileObservation, ProcessObservation};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The two ways a state file and the process table can disagree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MismatchKind {
    RunningButNoStateFile,
    StateSaysRunningButProcessMissing,
}

impl MismatchKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MismatchKind::RunningButNoStateFile => "running_but_no_state_file",
            MismatchKind::StateSaysRunningButProcessMissing => {
                "state_says_running_but_process_missing"
            }
        }
    }
}

/// Evidence attached to a mismatch, tagged by `issue` on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "issue", rename_all = "snake_case")]
pub enum MismatchDetail {
    RunningButNoStateFile { process: ProcessObservation },
    StateSaysRunningButProcessMissing { file_state: FileObservation },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Mismatch {
    pub bot_id: String,
    #[serde(flatten)]
    pub detail: MismatchDetail,
}

impl Mismatch {
    pub fn kind(&self) -> MismatchKind {
        match self.detail {
            MismatchDetail::RunningButNoStateFile { .. } => MismatchKind::RunningButNoStateFile,
            MismatchDetail::StateSaysRunningButProcessMissing { .. } => {
                MismatchKind::StateSaysRunningButProcessMissing
            }
        }
    }
}

/// Result of one reconciliation pass. Logged as a single JSON line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconciliationReport {
    pub timestamp: DateTime<Utc>,
    pub processes_found: usize,
    pub state_files_found: usize,
    pub mismatches: Vec<Mismatch>,
    /// Bot ids whose state file was rewritten in auto-fix mode.
    pub fixed: Vec<String>,
    /// True iff `mismatches` is empty. Fixes never flip this back.
    pub healthy: bool,
}

impl ReconciliationReport {
    pub fn new(processes_found: usize, state_files_found: usize) -> Self {
        Self {
            timestamp: Utc::now(),
            processes_found,
            state_files_found,
            mismatches: Vec::new(),
            fixed: Vec::new(),
            healthy: true,
        }
    }

    pub fn push_mismatch(&mut self, mismatch: Mismatch) {
        self.mismatches.push(mismatch);
        self.healthy = false;
    }

    pub fn mark_fixed(&mut self, bot_id: &str) {
        self.fixed.push(bot_id.to_string());
    }
}
