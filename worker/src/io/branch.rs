//! Branch lifecycle orchestration.
//!
//! Every task attempt lives on its own branch. The orchestrator owns the
//! whole lifecycle as named, idempotent operations and does not know *why* a
//! branch is being kept or discarded; that is the decision engine's job.

use std::fmt;
use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use tracing::{debug, info, instrument, warn};

use crate::core::retry::RetryBudget;
use crate::core::task::TaskContext;
use crate::io::git::{Git, PushRejected};
use crate::io::process::run_with_timeout;

/// Ref namespace for routing markers consumed by server-side fast-forward
/// tooling.
const MARKER_NAMESPACE: &str = "refs/mergetrain";

const CONSOLIDATE_TIMEOUT: Duration = Duration::from_secs(60);

/// The target integration branch could not be refreshed. Environment-scoped:
/// the task goes back to the queue, and the worker gives up only after its
/// refresh budget is spent.
#[derive(Debug)]
pub struct EnvironmentRefreshError {
    pub detail: String,
}

impl fmt::Display for EnvironmentRefreshError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "environment refresh failed: {}", self.detail)
    }
}

impl std::error::Error for EnvironmentRefreshError {}

/// A branch created for one task attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskBranch {
    pub name: String,
    pub base_commit: String,
}

/// How a finalized push went: attempts used and fallbacks taken.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PushReport {
    pub attempts: u32,
    pub fallbacks: Vec<String>,
}

pub struct BranchOrchestrator<'a> {
    git: &'a Git,
    remote: String,
    target: String,
    prefix: String,
    consolidate_command: Vec<String>,
}

impl<'a> BranchOrchestrator<'a> {
    pub fn new(
        git: &'a Git,
        remote: impl Into<String>,
        target: impl Into<String>,
        prefix: impl Into<String>,
        consolidate_command: Vec<String>,
    ) -> Self {
        Self {
            git,
            remote: remote.into(),
            target: target.into(),
            prefix: prefix.into(),
            consolidate_command,
        }
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    /// Tracking ref for the target branch (`<remote>/<target>`).
    pub fn tracking_ref(&self) -> String {
        format!("{}/{}", self.remote, self.target)
    }

    /// Fetch the remote and fast-forward the local target branch.
    ///
    /// Any failure here is environmental, never the task's fault, and is
    /// reported as [`EnvironmentRefreshError`].
    #[instrument(skip_all)]
    pub fn refresh_target(&self) -> Result<()> {
        let result = (|| -> Result<()> {
            self.git.fetch(&self.remote)?;
            self.git.checkout_branch(&self.target)?;
            self.git.merge_ff_only(&self.tracking_ref())?;
            Ok(())
        })();
        result.map_err(|err| {
            anyhow::Error::new(EnvironmentRefreshError {
                detail: format!("{err:#}"),
            })
        })
    }

    /// Create and checkout the per-attempt branch from the current target tip.
    #[instrument(skip_all, fields(task_id = %ctx.task_id))]
    pub fn begin(&self, ctx: &TaskContext) -> Result<TaskBranch> {
        let name = ctx.branch_name(&self.prefix);
        let base_commit = self.git.rev_parse("HEAD").context("resolve base commit")?;
        self.git
            .checkout_new_branch(&name)
            .with_context(|| format!("create task branch {name}"))?;
        debug!(branch = %name, base = %base_commit, "task branch created");
        Ok(TaskBranch { name, base_commit })
    }

    /// Stage and commit everything the tool changed on the task branch.
    pub fn commit_all(&self, message: &str) -> Result<bool> {
        self.git.add_all()?;
        self.git.commit_staged(message)
    }

    /// Push the branch and its routing marker, retrying rejected pushes a
    /// bounded number of times with a refresh in between.
    ///
    /// The refresh never rewrites the local branch, so a retry only succeeds
    /// when the remote side changed between attempts (e.g. a stale ref of
    /// the same name was cleaned up); a genuinely divergent remote ref
    /// exhausts the budget.
    ///
    /// Idempotent: re-pushing an already-pushed branch is an up-to-date no-op
    /// on the remote side.
    #[instrument(skip_all, fields(branch))]
    pub fn finalize_push(&self, branch: &str, max_attempts: u32) -> Result<PushReport> {
        let mut budget = RetryBudget::new(max_attempts);
        let mut fallbacks = Vec::new();

        loop {
            if !budget.start_attempt() {
                bail!(
                    "push of '{branch}' rejected after {} attempts",
                    budget.attempts_made()
                );
            }
            match self.git.push(&self.remote, branch) {
                Ok(()) => break,
                Err(err) if err.downcast_ref::<PushRejected>().is_some() => {
                    warn!(branch, attempt = budget.attempts_made(), "push rejected, refreshing");
                    fallbacks.push("refresh-and-retry".to_string());
                    self.git.fetch(&self.remote).context("refresh before push retry")?;
                }
                Err(err) => return Err(err),
            }
        }

        let marker = format!("{branch}:{MARKER_NAMESPACE}/{branch}");
        self.git
            .push(&self.remote, &marker)
            .with_context(|| format!("push routing marker for {branch}"))?;

        info!(branch, attempts = budget.attempts_made(), "branch pushed with routing marker");
        Ok(PushReport {
            attempts: budget.attempts_made(),
            fallbacks,
        })
    }

    /// Switch back to the target branch and force-delete the local task
    /// branch. Safe to call when the branch was never created or is already
    /// gone.
    #[instrument(skip_all, fields(branch))]
    pub fn discard(&self, branch: &str) -> Result<()> {
        self.git.checkout_branch(&self.target)?;
        if self.git.branch_exists(branch)? {
            self.git.delete_branch(branch)?;
            debug!(branch, "local task branch deleted");
        }
        Ok(())
    }

    /// Switch back to the target branch, keeping the task branch alive
    /// (quarantined changes stay available for review).
    pub fn return_to_target(&self) -> Result<()> {
        self.git.checkout_branch(&self.target)
    }

    /// Best-effort trigger for server-side fast-forward integration of
    /// pending branches. Never blocks the task outcome; failures only warn.
    #[instrument(skip_all)]
    pub fn consolidate(&self) {
        if self.consolidate_command.is_empty() {
            debug!("no consolidate command configured, skipping");
            return;
        }
        let mut cmd = Command::new(&self.consolidate_command[0]);
        cmd.args(&self.consolidate_command[1..])
            .current_dir(self.git.workdir());
        match run_with_timeout(cmd, CONSOLIDATE_TIMEOUT, 16 * 1024) {
            Ok(output) if output.success() => debug!("consolidate dispatched"),
            Ok(output) => warn!(
                exit_code = ?output.status.code(),
                timed_out = output.timed_out,
                "consolidate trigger failed"
            ),
            Err(err) => warn!(err = %err, "consolidate trigger could not run"),
        }
    }

    /// Best-effort removal of a pushed branch and its routing marker, used on
    /// rollback.
    #[instrument(skip_all, fields(branch))]
    pub fn delete_remote(&self, branch: &str) {
        for reference in [branch.to_string(), format!("{MARKER_NAMESPACE}/{branch}")] {
            if let Err(err) = self.git.push_delete(&self.remote, &reference) {
                warn!(reference = %reference, err = %err, "remote deletion failed");
            }
        }
    }

    /// Delete local prefix-branches already merged into the target.
    /// Housekeeping only; never on the per-task path.
    #[instrument(skip_all)]
    pub fn cleanup(&self) -> Result<Vec<String>> {
        let current = self.git.current_branch()?;
        let mut deleted = Vec::new();
        for branch in self.git.merged_branches(&self.target)? {
            if !branch.starts_with(&format!("{}/", self.prefix)) || branch == current {
                continue;
            }
            self.git.delete_branch(&branch)?;
            deleted.push(branch);
        }
        info!(count = deleted.len(), "merged task branches cleaned up");
        Ok(deleted)
    }
}
