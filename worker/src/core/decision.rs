//! Outcome classification for a candidate change.
//!
//! The decision engine is a pure function so the policy table can be tested
//! exhaustively. It never touches git or the queue; callers hand it a conflict
//! count and gate results and apply the verdict themselves.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Quarantine reason when the conflict count is at or below the threshold.
pub const REASON_WITHIN_THRESHOLD: &str = "conflict count within review threshold";
/// Quarantine reason when the conflict count exceeds the threshold.
pub const REASON_EXCEEDS_LIMIT: &str = "conflict count exceeds safety limit";

/// Terminal outcome recorded in the audit ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Merged,
    Quarantined,
    Failed,
    RolledBack,
}

/// Thresholds the classification is evaluated against.
#[derive(Debug, Clone)]
pub struct DecisionPolicy {
    /// Conflict counts above zero and up to this value are quarantined for
    /// review; counts above it are quarantined as unsafe.
    pub quarantine_threshold: u32,
    /// Version string stamped into every audit record.
    pub policy_version: String,
}

/// Classification of one candidate change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Merged,
    Quarantined { reason: &'static str },
    Failed,
}

/// Map `(conflicts_found, gate results)` to a verdict.
///
/// A failing gate wins over everything else: a change that does not verify is
/// failed regardless of how cleanly it would merge.
pub fn decide(
    conflicts_found: u32,
    gates: &BTreeMap<String, bool>,
    policy: &DecisionPolicy,
) -> Verdict {
    if gates.values().any(|passed| !passed) {
        return Verdict::Failed;
    }
    if conflicts_found == 0 {
        return Verdict::Merged;
    }
    if conflicts_found <= policy.quarantine_threshold {
        return Verdict::Quarantined {
            reason: REASON_WITHIN_THRESHOLD,
        };
    }
    Verdict::Quarantined {
        reason: REASON_EXCEEDS_LIMIT,
    }
}

/// Decide whether a previously merged change must be rolled back.
///
/// Invoked only by the post-merge verification pass, after a `merged` record
/// has already been appended. A `true` result obliges the caller to append a
/// new `rolled_back` record; the original record is never touched.
pub fn evaluate_rollback(post_merge_gates: &BTreeMap<String, bool>) -> bool {
    post_merge_gates.values().any(|passed| !passed)
}
