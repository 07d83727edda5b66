//! Task identity and per-attempt branch naming.

use std::path::Path;
use std::sync::LazyLock;

use anyhow::{Result, anyhow};
use chrono::{DateTime, Utc};
use regex::Regex;

/// Task ids must be safe both as file names and as branch-name components.
/// Dots are excluded because the claim protocol appends `.<timestamp>.json`.
static TASK_ID_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new("^[A-Za-z0-9_-]+$").expect("task id regex"));

/// Validate a task id against the allowed character set.
pub fn validate_task_id(id: &str) -> Result<()> {
    if TASK_ID_RE.is_match(id) {
        return Ok(());
    }
    Err(anyhow!(
        "invalid task id '{id}' (allowed: letters, digits, '-', '_')"
    ))
}

/// Derive the task id from a payload file name.
///
/// The id is the portion of the file name before the first dot, so both the
/// queued form `<id>.json` and the claimed form `<id>.<timestamp>.json`
/// resolve to the same id.
pub fn task_id_from_filename(path: &Path) -> Result<String> {
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| anyhow!("task path has no file name: {}", path.display()))?;
    let id = name.split('.').next().unwrap_or_default();
    validate_task_id(id)?;
    Ok(id.to_string())
}

/// Render an attempt timestamp with millisecond precision.
///
/// Millisecond precision keeps branch names unique across quick retries of
/// the same task.
pub fn attempt_timestamp(now: DateTime<Utc>) -> String {
    now.format("%Y%m%d-%H%M%S%3f").to_string()
}

/// Explicit context for one task attempt.
///
/// Passed whole into the branch orchestrator so branch names are derived in
/// exactly one place instead of ad hoc string concatenation at call sites.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskContext {
    pub tool_name: String,
    pub task_id: String,
    pub attempt_timestamp: String,
}

impl TaskContext {
    /// Branch name for this attempt: `<prefix>/<tool>/<task-id>-<timestamp>`.
    pub fn branch_name(&self, prefix: &str) -> String {
        format!(
            "{prefix}/{}/{}-{}",
            self.tool_name, self.task_id, self.attempt_timestamp
        )
    }
}
