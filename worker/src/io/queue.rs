//! Filesystem-as-mailbox task queue.
//!
//! A task's state IS its bucket: `queue/` holds queued payloads,
//! `queue/inprogress/` claimed ones, `queue/done/` and `queue/error/` the
//! terminal outcomes. Every transition is a single `fs::rename`, which is
//! atomic on a POSIX filesystem, so no lock service is needed for
//! at-most-one-claimant semantics. Cross-host queues on network filesystems
//! are outside this guarantee.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{debug, info, instrument};

use crate::core::task::task_id_from_filename;

/// A task this worker has exclusive ownership of until it reaches a terminal
/// bucket (or is released back to the queue).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimedTask {
    pub id: String,
    pub path: PathBuf,
}

/// The four queue buckets.
#[derive(Debug, Clone)]
pub struct QueueDirs {
    queued: PathBuf,
    inprogress: PathBuf,
    done: PathBuf,
    error: PathBuf,
}

impl QueueDirs {
    /// Bucket layout rooted at `queue_dir`: queued payloads live directly in
    /// the root, the other buckets are subdirectories.
    pub fn new(queue_dir: impl Into<PathBuf>) -> Self {
        let queued = queue_dir.into();
        Self {
            inprogress: queued.join("inprogress"),
            done: queued.join("done"),
            error: queued.join("error"),
            queued,
        }
    }

    pub fn queued_dir(&self) -> &Path {
        &self.queued
    }

    pub fn inprogress_dir(&self) -> &Path {
        &self.inprogress
    }

    pub fn done_dir(&self) -> &Path {
        &self.done
    }

    pub fn error_dir(&self) -> &Path {
        &self.error
    }

    pub fn ensure_layout(&self) -> Result<()> {
        for dir in [&self.queued, &self.inprogress, &self.done, &self.error] {
            fs::create_dir_all(dir).with_context(|| format!("create {}", dir.display()))?;
        }
        Ok(())
    }

    /// Claimable payload files, sorted by name for deterministic scans.
    pub fn list_queued(&self) -> Result<Vec<PathBuf>> {
        let mut files = Vec::new();
        let entries = fs::read_dir(&self.queued)
            .with_context(|| format!("read queue dir {}", self.queued.display()))?;
        for entry in entries {
            let entry = entry.context("read queue entry")?;
            let path = entry.path();
            if path.is_file() && path.extension().is_some_and(|e| e == "json") {
                files.push(path);
            }
        }
        files.sort();
        Ok(files)
    }

    /// Attempt to claim `candidate` by renaming it into `inprogress/` under a
    /// worker-stamped name.
    ///
    /// A rename that fails because the source is gone means another worker
    /// won the race; that is the expected outcome of contention, reported as
    /// `Ok(None)` and never as an error.
    #[instrument(skip_all, fields(candidate = %candidate.display()))]
    pub fn claim(&self, candidate: &Path, attempt_timestamp: &str) -> Result<Option<ClaimedTask>> {
        let id = task_id_from_filename(candidate)?;
        let dest = self
            .inprogress
            .join(format!("{id}.{attempt_timestamp}.json"));
        match fs::rename(candidate, &dest) {
            Ok(()) => {
                debug!(task_id = %id, "claimed task");
                Ok(Some(ClaimedTask { id, path: dest }))
            }
            Err(err) if err.kind() == ErrorKind::NotFound => {
                debug!(task_id = %id, "lost claim race");
                Ok(None)
            }
            Err(err) => Err(err).with_context(|| {
                format!("claim rename {} -> {}", candidate.display(), dest.display())
            }),
        }
    }

    /// Return a claimed task to the queued bucket under its plain name.
    ///
    /// Used when the failure was environmental (e.g. the target branch could
    /// not be refreshed), not a fault of the task itself.
    pub fn release(&self, task: &ClaimedTask) -> Result<()> {
        let dest = self.queued.join(format!("{}.json", task.id));
        fs::rename(&task.path, &dest)
            .with_context(|| format!("release {} back to queue", task.id))?;
        info!(task_id = %task.id, "task released back to queue");
        Ok(())
    }

    /// Move a claimed task to `done/`.
    pub fn complete(&self, task: &ClaimedTask) -> Result<()> {
        self.move_to_terminal(task, &self.done, "done")
    }

    /// Move a claimed task to `error/`.
    pub fn fail(&self, task: &ClaimedTask) -> Result<()> {
        self.move_to_terminal(task, &self.error, "error")
    }

    fn move_to_terminal(&self, task: &ClaimedTask, bucket: &Path, label: &str) -> Result<()> {
        let file_name = task
            .path
            .file_name()
            .with_context(|| format!("claimed path has no file name: {}", task.path.display()))?;
        let dest = bucket.join(file_name);
        fs::rename(&task.path, &dest)
            .with_context(|| format!("move task {} to {label}", task.id))?;
        debug!(task_id = %task.id, bucket = label, "task reached terminal bucket");
        Ok(())
    }

    /// Sweep stale `inprogress/` entries back to `queued`.
    ///
    /// A worker killed mid-task leaves its claim behind; entries whose mtime
    /// is older than `stale_after` are assumed orphaned and requeued. This is
    /// an explicit recovery command, never run implicitly by the claim path.
    #[instrument(skip_all, fields(stale_secs = stale_after.as_secs()))]
    pub fn reconcile(&self, stale_after: Duration) -> Result<Vec<String>> {
        let mut requeued = Vec::new();
        let entries = fs::read_dir(&self.inprogress)
            .with_context(|| format!("read {}", self.inprogress.display()))?;
        for entry in entries {
            let entry = entry.context("read inprogress entry")?;
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            let modified = entry
                .metadata()
                .and_then(|m| m.modified())
                .with_context(|| format!("stat {}", path.display()))?;
            let age = modified.elapsed().unwrap_or(Duration::ZERO);
            if age < stale_after {
                continue;
            }
            let id = task_id_from_filename(&path)?;
            let dest = self.queued.join(format!("{id}.json"));
            fs::rename(&path, &dest)
                .with_context(|| format!("requeue stale claim {}", path.display()))?;
            info!(task_id = %id, age_secs = age.as_secs(), "requeued stale claim");
            requeued.push(id);
        }
        requeued.sort();
        Ok(requeued)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queue_with_task(id: &str) -> (tempfile::TempDir, QueueDirs, PathBuf) {
        let temp = tempfile::tempdir().expect("tempdir");
        let queue = QueueDirs::new(temp.path().join("queue"));
        queue.ensure_layout().expect("layout");
        let path = queue.queued_dir().join(format!("{id}.json"));
        fs::write(&path, format!("{{\"id\":\"{id}\"}}\n")).expect("write task");
        (temp, queue, path)
    }

    #[test]
    fn claim_moves_task_into_inprogress() {
        let (_temp, queue, path) = queue_with_task("t1");

        let claimed = queue
            .claim(&path, "20260828-101500123")
            .expect("claim")
            .expect("won");
        assert_eq!(claimed.id, "t1");
        assert!(claimed.path.starts_with(queue.inprogress_dir()));
        assert!(!path.exists());
        assert!(queue.list_queued().expect("list").is_empty());
    }

    #[test]
    fn losing_claim_race_is_not_an_error() {
        let (_temp, queue, path) = queue_with_task("t1");

        let first = queue.claim(&path, "a").expect("claim");
        assert!(first.is_some());
        let second = queue.claim(&path, "b").expect("claim");
        assert!(second.is_none());
    }

    #[test]
    fn release_restores_plain_queued_name() {
        let (_temp, queue, path) = queue_with_task("t1");
        let claimed = queue.claim(&path, "a").expect("claim").expect("won");

        queue.release(&claimed).expect("release");
        let queued = queue.list_queued().expect("list");
        assert_eq!(queued, vec![queue.queued_dir().join("t1.json")]);
    }

    #[test]
    fn terminal_buckets_are_mutually_exclusive() {
        let (_temp, queue, path) = queue_with_task("t1");
        let claimed = queue.claim(&path, "a").expect("claim").expect("won");

        queue.complete(&claimed).expect("complete");
        assert!(queue.done_dir().join("t1.a.json").exists());
        assert!(!queue.error_dir().join("t1.a.json").exists());
        assert!(!claimed.path.exists());
    }

    #[test]
    fn reconcile_requeues_stale_claims_only() {
        let (_temp, queue, path) = queue_with_task("t1");
        let claimed = queue.claim(&path, "a").expect("claim").expect("won");

        // Nothing is stale within a generous window.
        let requeued = queue.reconcile(Duration::from_secs(3600)).expect("sweep");
        assert!(requeued.is_empty());
        assert!(claimed.path.exists());

        // A zero window marks every claim as orphaned.
        let requeued = queue.reconcile(Duration::ZERO).expect("sweep");
        assert_eq!(requeued, vec!["t1".to_string()]);
        assert!(queue.queued_dir().join("t1.json").exists());
        assert!(!claimed.path.exists());
    }
}
