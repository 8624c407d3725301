//! Lack-of-progress detection over per-step snapshots.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Default number of trailing snapshots that must agree.
pub const DEFAULT_STUCK_WINDOW: usize = 3;

/// Fixed-shape summary of run progress, one per step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressSnapshot {
    pub node: String,
    pub file_change_count: usize,
    pub same_error_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_test_signature: Option<String>,
    pub functional_checks_count: usize,
    pub timestamp: DateTime<Utc>,
}

impl ProgressSnapshot {
    /// Equality used for stuck detection: ignores `timestamp` and `node`.
    fn same_progress(&self, other: &ProgressSnapshot) -> bool {
        self.file_change_count == other.file_change_count
            && self.same_error_count == other.same_error_count
            && self.last_test_signature == other.last_test_signature
            && self.functional_checks_count == other.functional_checks_count
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Detection {
    Ok,
    StuckCandidate { reason: String },
}

/// Report a stuck candidate when the last `k` snapshots show no progress.
pub fn detect(history: &[ProgressSnapshot], k: usize) -> Detection {
    if k == 0 || history.len() < k {
        return Detection::Ok;
    }
    let window = &history[history.len() - k..];
    let last = &window[k - 1];
    if window.iter().all(|s| s.same_progress(last)) {
        return Detection::StuckCandidate {
            reason: format!(
                "No progress in last {k} steps (node {}, {} file changes, {} repeated errors)",
                last.node, last.file_change_count, last.same_error_count
            ),
        };
    }
    Detection::Ok
}
