//! Test-only helpers: real git repos with a bare remote, and scripted
//! tool/gate doubles for driving the worker loop deterministically.

use std::cell::RefCell;
use std::collections::{BTreeMap, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{Context, Result, anyhow};
use tempfile::TempDir;

use crate::core::task::task_id_from_filename;
use crate::io::config::WorkerConfig;
use crate::io::gates::{GateRequest, GateRunner};
use crate::io::tool::{Tool, ToolOutcome, ToolRequest};

/// A working checkout (`repo/`) plus a bare remote (`remote.git`) it pushes
/// to, both inside one temp dir. The checkout starts on `main` with one
/// commit containing `notes.txt`.
pub struct TestRepo {
    temp: TempDir,
    clones: RefCell<u32>,
}

impl TestRepo {
    pub fn new() -> Result<Self> {
        let temp = tempfile::tempdir().context("create temp dir")?;
        let workdir = temp.path().join("repo");
        fs::create_dir_all(&workdir)?;
        run_git(&workdir, &["init", "-b", "main"])?;
        configure_user(&workdir)?;
        fs::write(workdir.join("notes.txt"), "initial\n")?;
        run_git(&workdir, &["add", "-A"])?;
        run_git(&workdir, &["commit", "-m", "initial commit"])?;

        let remote = temp.path().join("remote.git");
        let remote_str = remote.to_string_lossy().into_owned();
        run_git(temp.path(), &["init", "--bare", "-b", "main", &remote_str])?;
        run_git(&workdir, &["remote", "add", "origin", &remote_str])?;
        run_git(&workdir, &["push", "origin", "main"])?;

        Ok(Self {
            temp,
            clones: RefCell::new(0),
        })
    }

    pub fn root(&self) -> &Path {
        self.temp.path()
    }

    pub fn workdir(&self) -> PathBuf {
        self.root().join("repo")
    }

    pub fn remote_dir(&self) -> PathBuf {
        self.root().join("remote.git")
    }

    pub fn queue_dir(&self) -> PathBuf {
        self.root().join("queue")
    }

    pub fn ledger_dir(&self) -> PathBuf {
        self.root().join("ledger")
    }

    /// Worker config with absolute paths and timings tuned for tests.
    pub fn config(&self) -> WorkerConfig {
        WorkerConfig {
            queue_dir: self.queue_dir(),
            ledger_dir: self.ledger_dir(),
            idle_exit_secs: 1,
            poll_interval_ms: 50,
            tool_timeout_secs: 30,
            gate_timeout_secs: 30,
            ..WorkerConfig::default()
        }
    }

    /// Drop a queued payload file for `id`.
    pub fn enqueue(&self, id: &str) -> Result<()> {
        fs::create_dir_all(self.queue_dir())?;
        let path = self.queue_dir().join(format!("{id}.json"));
        fs::write(&path, format!("{{\"id\":\"{id}\"}}\n"))
            .with_context(|| format!("write {}", path.display()))?;
        Ok(())
    }

    /// Task ids currently in a queue bucket (`"done"`, `"error"`,
    /// `"inprogress"`), sorted.
    pub fn bucket_ids(&self, bucket: &str) -> Result<Vec<String>> {
        let dir = self.queue_dir().join(bucket);
        let mut ids = Vec::new();
        if !dir.exists() {
            return Ok(ids);
        }
        for entry in fs::read_dir(&dir)? {
            let path = entry?.path();
            if path.is_file() {
                ids.push(task_id_from_filename(&path)?);
            }
        }
        ids.sort();
        Ok(ids)
    }

    /// Full ref names on the bare remote, e.g. `refs/heads/main`.
    pub fn remote_refs(&self) -> Result<Vec<String>> {
        let remote = self.remote_dir();
        let output = Command::new("git")
            .args(["--git-dir", &remote.to_string_lossy(), "for-each-ref", "--format=%(refname)"])
            .output()
            .context("spawn git for-each-ref")?;
        if !output.status.success() {
            return Err(anyhow!(
                "for-each-ref failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            ));
        }
        Ok(String::from_utf8_lossy(&output.stdout)
            .lines()
            .map(str::to_string)
            .collect())
    }

    pub fn git_in_workdir(&self, args: &[&str]) -> Result<()> {
        run_git(&self.workdir(), args)
    }

    /// Advance the remote's `main` from a side clone, committing `contents`
    /// to `file`. Used to provoke non-fast-forward rejections and merge
    /// conflicts against the checkout.
    pub fn push_conflicting_commit(&self, file: &str, contents: &str) -> Result<()> {
        let clone = self.side_clone_with_commit(file, contents)?;
        run_git(&clone, &["push", "origin", "main"])
    }

    /// Publish a commit from a side clone under `branch` on the remote,
    /// diverged from the checkout's history of that name. Pushes of the
    /// local branch are then rejected as non-fast-forward.
    pub fn push_divergent_branch(&self, branch: &str, file: &str, contents: &str) -> Result<()> {
        let clone = self.side_clone_with_commit(file, contents)?;
        run_git(&clone, &["push", "origin", &format!("HEAD:refs/heads/{branch}")])
    }

    /// Fresh clone of the bare remote with one new commit on `main`.
    fn side_clone_with_commit(&self, file: &str, contents: &str) -> Result<PathBuf> {
        let n = {
            let mut counter = self.clones.borrow_mut();
            *counter += 1;
            *counter
        };
        let clone = self.root().join(format!("clone-{n}"));
        let remote_str = self.remote_dir().to_string_lossy().into_owned();
        run_git(
            self.root(),
            &["clone", &remote_str, &clone.to_string_lossy()],
        )?;
        configure_user(&clone)?;
        fs::write(clone.join(file), contents)?;
        run_git(&clone, &["add", "-A"])?;
        run_git(&clone, &["commit", "-m", "side edit"])?;
        Ok(clone)
    }
}

fn configure_user(dir: &Path) -> Result<()> {
    run_git(dir, &["config", "user.email", "worker@example.com"])?;
    run_git(dir, &["config", "user.name", "Worker Tests"])
}

fn run_git(dir: &Path, args: &[&str]) -> Result<()> {
    let output = Command::new("git")
        .args(args)
        .current_dir(dir)
        .output()
        .with_context(|| format!("spawn git {}", args.join(" ")))?;
    if !output.status.success() {
        return Err(anyhow!(
            "git {} failed: {}",
            args.join(" "),
            String::from_utf8_lossy(&output.stderr).trim()
        ));
    }
    Ok(())
}

/// One scripted tool invocation: files to write (path relative to the
/// workdir, contents) and the exit code to report.
#[derive(Debug, Clone)]
pub struct ScriptedToolRun {
    pub edits: Vec<(String, String)>,
    pub exit_code: i32,
}

/// Tool double that replays a fixed script of runs. Running past the end of
/// the script is an error, so tests notice unexpected extra invocations.
pub struct ScriptedTool {
    name: String,
    runs: RefCell<VecDeque<ScriptedToolRun>>,
}

impl ScriptedTool {
    pub fn new(name: impl Into<String>, runs: Vec<ScriptedToolRun>) -> Self {
        Self {
            name: name.into(),
            runs: RefCell::new(runs.into()),
        }
    }
}

impl Tool for ScriptedTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn run(&self, request: &ToolRequest) -> Result<ToolOutcome> {
        let run = self
            .runs
            .borrow_mut()
            .pop_front()
            .ok_or_else(|| anyhow!("scripted tool exhausted"))?;
        for (path, contents) in &run.edits {
            let dest = request.workdir.join(path);
            if let Some(parent) = dest.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::write(&dest, contents)?;
        }
        let errors = if run.exit_code == 0 {
            Vec::new()
        } else {
            vec![format!("tool exited with status Some({})", run.exit_code)]
        };
        Ok(ToolOutcome {
            exit_code: Some(run.exit_code),
            timed_out: false,
            errors,
        })
    }
}

/// Tool double backed by a closure, for behaviors a static script cannot
/// express (e.g. racing the remote mid-task).
pub struct FnTool<F>
where
    F: Fn(&ToolRequest) -> Result<ToolOutcome>,
{
    name: String,
    run: F,
}

impl<F> FnTool<F>
where
    F: Fn(&ToolRequest) -> Result<ToolOutcome>,
{
    pub fn new(name: impl Into<String>, run: F) -> Self {
        Self {
            name: name.into(),
            run,
        }
    }
}

impl<F> Tool for FnTool<F>
where
    F: Fn(&ToolRequest) -> Result<ToolOutcome>,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn run(&self, request: &ToolRequest) -> Result<ToolOutcome> {
        (self.run)(request)
    }
}

/// Gate runner double that returns a fixed name -> pass mapping on every
/// call, without spawning anything.
#[derive(Debug, Clone)]
pub struct ScriptedGateRunner {
    results: BTreeMap<String, bool>,
}

impl ScriptedGateRunner {
    pub fn new(results: BTreeMap<String, bool>) -> Self {
        Self { results }
    }

    pub fn passing(names: &[&str]) -> Self {
        Self {
            results: names.iter().map(|n| (n.to_string(), true)).collect(),
        }
    }
}

impl GateRunner for ScriptedGateRunner {
    fn run(&self, _request: &GateRequest) -> Result<BTreeMap<String, bool>> {
        Ok(self.results.clone())
    }
}
