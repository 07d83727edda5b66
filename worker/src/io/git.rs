//! Git adapter for the merge-train worker.
//!
//! Branch lifecycle, pushes, and the conflict probe all go through one
//! explicit wrapper around `git` subprocess calls.

use std::collections::BTreeSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, instrument, warn};

/// Push rejected by the remote because the ref is not a descendant of the
/// current tip. Retryable after a refresh; recovered via `downcast_ref`.
#[derive(Debug, Clone)]
pub struct PushRejected {
    pub refspec: String,
    pub stderr: String,
}

impl fmt::Display for PushRejected {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "push of '{}' rejected by remote", self.refspec)
    }
}

impl std::error::Error for PushRejected {}

/// Parsed `git status --porcelain` entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusEntry {
    /// 2-letter XY code, or "??" for untracked.
    pub code: String,
    pub path: String,
}

/// Wrapper for executing git commands in a working directory.
#[derive(Debug, Clone)]
pub struct Git {
    workdir: PathBuf,
}

impl Git {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self {
            workdir: workdir.into(),
        }
    }

    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    /// Return the current branch name (errors on detached HEAD).
    pub fn current_branch(&self) -> Result<String> {
        let out = self.run_capture(&["rev-parse", "--abbrev-ref", "HEAD"])?;
        let name = out.trim().to_string();
        if name == "HEAD" {
            return Err(anyhow!("detached HEAD (refuse to run)"));
        }
        Ok(name)
    }

    /// Resolve a ref to a full commit id.
    pub fn rev_parse(&self, reference: &str) -> Result<String> {
        let out = self.run_capture(&["rev-parse", reference])?;
        Ok(out.trim().to_string())
    }

    /// Whether a ref (branch, tracking ref, ...) resolves to a commit.
    pub fn ref_exists(&self, reference: &str) -> Result<bool> {
        let status = self
            .run(&["rev-parse", "--verify", "--quiet", reference])?
            .status;
        Ok(status.success())
    }

    /// Check whether a local branch exists.
    pub fn branch_exists(&self, branch: &str) -> Result<bool> {
        let status = self
            .run(&[
                "show-ref",
                "--verify",
                "--quiet",
                &format!("refs/heads/{branch}"),
            ])?
            .status;
        Ok(status.success())
    }

    pub fn fetch(&self, remote: &str) -> Result<()> {
        self.run_checked(&["fetch", "--prune", remote])?;
        Ok(())
    }

    /// Fast-forward the current branch to `reference`; refuses real merges.
    pub fn merge_ff_only(&self, reference: &str) -> Result<()> {
        self.run_checked(&["merge", "--ff-only", reference])?;
        Ok(())
    }

    /// Create and checkout a new branch at current HEAD.
    #[instrument(skip_all, fields(branch))]
    pub fn checkout_new_branch(&self, branch: &str) -> Result<()> {
        debug!(branch, "creating and checking out new branch");
        self.run_checked(&["checkout", "-b", branch])?;
        Ok(())
    }

    /// Checkout an existing branch.
    pub fn checkout_branch(&self, branch: &str) -> Result<()> {
        self.run_checked(&["checkout", branch])?;
        Ok(())
    }

    /// Force-delete a local branch.
    pub fn delete_branch(&self, branch: &str) -> Result<()> {
        self.run_checked(&["branch", "-D", branch])?;
        Ok(())
    }

    /// Push a refspec, distinguishing remote rejection from other failures.
    #[instrument(skip_all, fields(remote, refspec))]
    pub fn push(&self, remote: &str, refspec: &str) -> Result<()> {
        let output = self.run(&["push", remote, refspec])?;
        if output.status.success() {
            return Ok(());
        }
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        if is_push_rejection(&stderr) {
            warn!(refspec, "push rejected by remote");
            return Err(anyhow::Error::new(PushRejected {
                refspec: refspec.to_string(),
                stderr,
            }));
        }
        Err(anyhow!("git push {remote} {refspec} failed: {stderr}"))
    }

    /// Delete a remote branch. Errors are returned, not swallowed; callers
    /// decide whether deletion is best-effort.
    pub fn push_delete(&self, remote: &str, reference: &str) -> Result<()> {
        self.run_checked(&["push", remote, "--delete", reference])?;
        Ok(())
    }

    /// Local branches already merged into `target`.
    pub fn merged_branches(&self, target: &str) -> Result<Vec<String>> {
        let out = self.run_capture(&[
            "branch",
            "--merged",
            target,
            "--format=%(refname:short)",
        ])?;
        Ok(out
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect())
    }

    /// Count paths that would conflict when merging `head` into `base`.
    ///
    /// Uses a dry-run merge (`git merge-tree --write-tree`) rather than diff
    /// overlap, so rename and content-level conflicts are what git itself
    /// would report. Exit 0 means a clean merge; exit 1 lists conflicted
    /// paths after the resulting tree id.
    #[instrument(skip_all, fields(base, head))]
    pub fn conflict_count(&self, base: &str, head: &str) -> Result<u32> {
        let output = self.run(&[
            "merge-tree",
            "--write-tree",
            "--name-only",
            "--no-messages",
            base,
            head,
        ])?;
        match output.status.code() {
            Some(0) => Ok(0),
            Some(1) => {
                let stdout = String::from_utf8_lossy(&output.stdout);
                let paths: BTreeSet<&str> = stdout
                    .lines()
                    .skip(1)
                    .map(str::trim)
                    .filter(|l| !l.is_empty())
                    .collect();
                debug!(conflicts = paths.len(), "dry-run merge found conflicts");
                Ok(paths.len() as u32)
            }
            code => Err(anyhow!(
                "git merge-tree {base} {head} failed (exit {code:?}): {}",
                String::from_utf8_lossy(&output.stderr).trim()
            )),
        }
    }

    /// Get status entries (including untracked) in porcelain format.
    pub fn status_porcelain(&self) -> Result<Vec<StatusEntry>> {
        let out = self.run_capture(&["status", "--porcelain=v1", "-uall"])?;
        let mut entries = Vec::new();
        for line in out.lines() {
            if line.trim().is_empty() {
                continue;
            }
            entries.push(parse_status_line(line)?);
        }
        Ok(entries)
    }

    /// True if the working tree differs from HEAD (including untracked files).
    pub fn has_changes(&self) -> Result<bool> {
        Ok(!self.status_porcelain()?.is_empty())
    }

    /// Ensure the worktree is fully clean (including untracked files).
    pub fn ensure_clean(&self) -> Result<()> {
        let entries = self.status_porcelain()?;
        if entries.is_empty() {
            return Ok(());
        }
        let mut msg = String::from("working tree not clean:\n");
        for entry in entries {
            msg.push_str(&format!("{} {}\n", entry.code, entry.path));
        }
        Err(anyhow!(msg.trim_end().to_string()))
    }

    /// Discard all tracked modifications, restoring the worktree to HEAD.
    pub fn reset_hard(&self) -> Result<()> {
        self.run_checked(&["reset", "--hard"])?;
        Ok(())
    }

    /// Remove untracked files and directories (respects .gitignore).
    pub fn clean_untracked(&self) -> Result<()> {
        self.run_checked(&["clean", "-fd"])?;
        Ok(())
    }

    /// Stage all changes (respects .gitignore).
    pub fn add_all(&self) -> Result<()> {
        self.run_checked(&["add", "-A"])?;
        Ok(())
    }

    /// Commit staged changes; Ok(false) when there is nothing staged.
    pub fn commit_staged(&self, message: &str) -> Result<bool> {
        let staged = self.run(&["diff", "--cached", "--name-only"])?;
        if String::from_utf8_lossy(&staged.stdout).trim().is_empty() {
            debug!("no staged changes, skipping commit");
            return Ok(false);
        }
        self.run_checked(&["commit", "-m", message])?;
        Ok(true)
    }

    fn run_capture(&self, args: &[&str]) -> Result<String> {
        let output = self.run_checked(args)?;
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    fn run_checked(&self, args: &[&str]) -> Result<Output> {
        let output = self.run(args)?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(anyhow!("git {} failed: {}", args.join(" "), stderr.trim()));
        }
        Ok(output)
    }

    fn run(&self, args: &[&str]) -> Result<Output> {
        Command::new("git")
            .args(args)
            .current_dir(&self.workdir)
            .output()
            .with_context(|| format!("spawn git {}", args.join(" ")))
    }
}

fn is_push_rejection(stderr: &str) -> bool {
    stderr.contains("[rejected]")
        || stderr.contains("non-fast-forward")
        || stderr.contains("fetch first")
        || stderr.contains("stale info")
}

fn parse_status_line(line: &str) -> Result<StatusEntry> {
    if let Some(path) = line.strip_prefix("?? ") {
        return Ok(StatusEntry {
            code: "??".to_string(),
            path: path.trim().to_string(),
        });
    }
    if line.len() < 4 {
        return Err(anyhow!("unexpected porcelain line: '{line}'"));
    }
    let code = line[..2].to_string();
    let mut path = line[3..].trim().to_string();
    if let Some((_, new)) = path.split_once("->") {
        path = new.trim().to_string();
    }
    Ok(StatusEntry { code, path })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::TestRepo;
    use std::fs;

    #[test]
    fn parses_untracked_line() {
        let e = parse_status_line("?? foo.txt").expect("parse");
        assert_eq!(e.code, "??");
        assert_eq!(e.path, "foo.txt");
    }

    #[test]
    fn parses_rename_line_uses_new_path() {
        let e = parse_status_line("R  old.txt -> new.txt").expect("parse");
        assert_eq!(e.path, "new.txt");
    }

    #[test]
    fn detects_push_rejection_phrases() {
        assert!(is_push_rejection(
            "! [rejected] main -> main (non-fast-forward)"
        ));
        assert!(!is_push_rejection("fatal: repository not found"));
    }

    #[test]
    fn conflict_count_zero_for_descendant() {
        let repo = TestRepo::new().expect("repo");
        let git = Git::new(repo.workdir());
        git.checkout_new_branch("feature").expect("branch");
        fs::write(repo.workdir().join("new.txt"), "new\n").expect("write");
        git.add_all().expect("add");
        assert!(git.commit_staged("add new file").expect("commit"));

        let conflicts = git.conflict_count("main", "HEAD").expect("probe");
        assert_eq!(conflicts, 0);
    }

    #[test]
    fn conflict_count_detects_competing_edits() {
        let repo = TestRepo::new().expect("repo");
        let git = Git::new(repo.workdir());

        git.checkout_new_branch("feature").expect("branch");
        fs::write(repo.workdir().join("notes.txt"), "feature edit\n").expect("write");
        git.add_all().expect("add");
        assert!(git.commit_staged("feature edit").expect("commit"));

        git.checkout_branch("main").expect("checkout");
        fs::write(repo.workdir().join("notes.txt"), "main edit\n").expect("write");
        git.add_all().expect("add");
        assert!(git.commit_staged("main edit").expect("commit"));

        let conflicts = git.conflict_count("main", "feature").expect("probe");
        assert_eq!(conflicts, 1);
    }

    #[test]
    fn push_rejection_is_typed() {
        let repo = TestRepo::new().expect("repo");
        let git = Git::new(repo.workdir());

        // Advance the remote from a side clone, then push a competing local
        // commit: the remote must reject it as non-fast-forward.
        repo.push_conflicting_commit("notes.txt", "remote edit\n")
            .expect("remote edit");
        fs::write(repo.workdir().join("notes.txt"), "local edit\n").expect("write");
        git.add_all().expect("add");
        assert!(git.commit_staged("local edit").expect("commit"));

        let err = git.push("origin", "main").expect_err("push must fail");
        assert!(err.downcast_ref::<PushRejected>().is_some(), "{err:#}");
    }
}
