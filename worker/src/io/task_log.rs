//! Per-attempt artifact logs under `.mergetrain/tasks/`.
//!
//! These are product artifacts (tool output, gate logs, attempt metadata),
//! written unconditionally and unaffected by `RUST_LOG`.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Serialize;

use crate::core::decision::Outcome;
use crate::core::task::TaskContext;

/// Metadata for one task attempt, persisted as `meta.json`.
#[derive(Debug, Clone, Serialize)]
pub struct AttemptMeta {
    pub run_id: String,
    pub task_id: String,
    pub branch: String,
    /// Terminal outcome; absent for no-op attempts that wrote no record.
    pub outcome: Option<Outcome>,
    pub conflicts_found: u32,
    pub duration_ms: u64,
}

/// Stable artifact paths for one attempt.
#[derive(Debug, Clone)]
pub struct AttemptPaths {
    pub dir: PathBuf,
    pub meta_path: PathBuf,
    pub tool_log_path: PathBuf,
    pub gate_dir: PathBuf,
    pub post_gate_dir: PathBuf,
}

impl AttemptPaths {
    pub fn new(workdir: &Path, run_id: &str, ctx: &TaskContext) -> Self {
        let dir = workdir
            .join(".mergetrain")
            .join("tasks")
            .join(run_id)
            .join(format!("{}-{}", ctx.task_id, ctx.attempt_timestamp));
        Self {
            meta_path: dir.join("meta.json"),
            tool_log_path: dir.join("tool.log"),
            gate_dir: dir.join("gates"),
            post_gate_dir: dir.join("post_merge_gates"),
            dir,
        }
    }

    pub fn ensure_dir(&self) -> Result<()> {
        fs::create_dir_all(&self.dir)
            .with_context(|| format!("create attempt dir {}", self.dir.display()))
    }
}

/// Create `.mergetrain/` with a self-ignoring `.gitignore`, so worker
/// artifacts (queue, ledger, attempt logs) never show up as working-tree
/// changes of the repo being operated on.
pub fn ensure_artifact_root(workdir: &Path) -> Result<()> {
    let root = workdir.join(".mergetrain");
    fs::create_dir_all(&root).with_context(|| format!("create {}", root.display()))?;
    let gitignore = root.join(".gitignore");
    if !gitignore.exists() {
        fs::write(&gitignore, "*\n").with_context(|| format!("write {}", gitignore.display()))?;
    }
    Ok(())
}

pub fn write_meta(paths: &AttemptPaths, meta: &AttemptMeta) -> Result<()> {
    paths.ensure_dir()?;
    let mut buf = serde_json::to_string_pretty(meta).context("serialize attempt meta")?;
    buf.push('\n');
    fs::write(&paths.meta_path, buf)
        .with_context(|| format!("write {}", paths.meta_path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attempt_paths_are_stable() {
        let temp = tempfile::tempdir().expect("tempdir");
        let ctx = TaskContext {
            tool_name: "fixer".to_string(),
            task_id: "t1".to_string(),
            attempt_timestamp: "20260828-101500123".to_string(),
        };
        let paths = AttemptPaths::new(temp.path(), "run-1", &ctx);
        assert!(paths
            .dir
            .ends_with(".mergetrain/tasks/run-1/t1-20260828-101500123"));
        assert!(paths.meta_path.ends_with("meta.json"));
        assert!(paths.tool_log_path.ends_with("tool.log"));
    }

    #[test]
    fn writes_meta_json() {
        let temp = tempfile::tempdir().expect("tempdir");
        let ctx = TaskContext {
            tool_name: "fixer".to_string(),
            task_id: "t1".to_string(),
            attempt_timestamp: "20260828-101500123".to_string(),
        };
        let paths = AttemptPaths::new(temp.path(), "run-1", &ctx);
        write_meta(
            &paths,
            &AttemptMeta {
                run_id: "run-1".to_string(),
                task_id: "t1".to_string(),
                branch: ctx.branch_name("mergetrain"),
                outcome: Some(Outcome::Merged),
                conflicts_found: 0,
                duration_ms: 12,
            },
        )
        .expect("write meta");
        assert!(paths.meta_path.is_file());
        let contents = fs::read_to_string(&paths.meta_path).expect("read");
        assert!(contents.contains("\"merged\""));
    }
}
