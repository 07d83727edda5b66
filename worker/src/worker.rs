//! The worker loop: claim one task, drive it to a terminal state, repeat.
//!
//! A single worker is strictly sequential; concurrency comes from running N
//! workers against the same queue directory and git remote. The claim
//! protocol in [`crate::io::queue`] is what keeps them from colliding.

use std::collections::BTreeMap;
use std::path::Path;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use chrono::Utc;
use tracing::{info, instrument, warn};

use crate::core::decision::{DecisionPolicy, Outcome, Verdict, decide, evaluate_rollback};
use crate::core::idle::idle_exceeded;
use crate::core::retry::RetryBudget;
use crate::core::task::{TaskContext, attempt_timestamp};
use crate::io::branch::{BranchOrchestrator, EnvironmentRefreshError, TaskBranch};
use crate::io::config::WorkerConfig;
use crate::io::gates::{GateRequest, GateRunner};
use crate::io::git::Git;
use crate::io::ledger::{AuditRecord, Ledger};
use crate::io::queue::{ClaimedTask, QueueDirs};
use crate::io::task_log::{AttemptMeta, AttemptPaths, write_meta};
use crate::io::tool::{Tool, ToolOutcome, ToolRequest};

/// Why the worker loop stopped on its own.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerStop {
    /// No claimable work for the configured idle window.
    Idle,
}

/// Summary of one worker invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerOutcome {
    pub run_id: String,
    pub tasks_processed: u32,
    pub stop: WorkerStop,
}

/// Terminal resolution of one claimed task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskResolution {
    Merged,
    Quarantined,
    Failed,
    RolledBack,
    /// Tool succeeded without changing the tree; done, nothing recorded.
    NoOp,
}

/// Run the worker loop until the queue stays idle past the configured window.
///
/// Task-scoped failures are recorded and the loop continues; environment
/// refresh failures requeue the task and count against a bounded budget;
/// anything else is fatal and leaves the claim in `inprogress/` for
/// `reconcile`.
#[instrument(skip_all, fields(workdir = %workdir.display()))]
pub fn run_worker<T: Tool, G: GateRunner>(
    workdir: &Path,
    cfg: &WorkerConfig,
    tool: &T,
    gate_runner: &G,
    post_merge_runner: Option<&G>,
) -> Result<WorkerOutcome> {
    cfg.validate()?;

    let git = Git::new(workdir);
    let orch = BranchOrchestrator::new(
        &git,
        cfg.remote.clone(),
        cfg.target_branch.clone(),
        cfg.branch_prefix.clone(),
        cfg.consolidate_command.clone(),
    );
    crate::io::task_log::ensure_artifact_root(workdir)?;
    let queue = QueueDirs::new(cfg.resolve(workdir, &cfg.queue_dir));
    queue.ensure_layout()?;

    let started_at = Utc::now();
    let run_id = format!(
        "run-{}-{}",
        started_at.format("%Y%m%d%H%M%S"),
        std::process::id()
    );
    let ledger = Ledger::open(&cfg.resolve(workdir, &cfg.ledger_dir), "merge", started_at)?;
    let policy = DecisionPolicy {
        quarantine_threshold: cfg.quarantine_threshold,
        policy_version: cfg.policy_version.clone(),
    };

    let run = TaskRun {
        workdir,
        cfg,
        git: &git,
        orch: &orch,
        queue: &queue,
        ledger: &ledger,
        policy: &policy,
        run_id: &run_id,
        tool,
        gate_runner,
        post_merge_runner,
    };

    let mut refresh_budget = RetryBudget::new(cfg.refresh_attempts);
    let mut last_claim = Instant::now();
    let mut tasks_processed = 0u32;
    let idle_threshold = Duration::from_secs(cfg.idle_exit_secs);

    info!(run_id = %run_id, "worker started");
    loop {
        let Some(task) = claim_next(&queue)? else {
            if idle_exceeded(Instant::now(), last_claim, idle_threshold) {
                info!(run_id = %run_id, tasks_processed, "queue idle, exiting cleanly");
                return Ok(WorkerOutcome {
                    run_id,
                    tasks_processed,
                    stop: WorkerStop::Idle,
                });
            }
            thread::sleep(Duration::from_millis(cfg.poll_interval_ms));
            continue;
        };
        last_claim = Instant::now();

        match process_task(&run, &task) {
            Ok(resolution) => {
                tasks_processed += 1;
                // The budget bounds consecutive refresh failures, not total
                // failures over the run; a processed task restores it.
                refresh_budget.reset();
                info!(task_id = %task.id, resolution = ?resolution, "task resolved");
            }
            Err(err) if err.downcast_ref::<EnvironmentRefreshError>().is_some() => {
                warn!(task_id = %task.id, err = %err, "refresh failed, requeueing task");
                let within_budget = refresh_budget.start_attempt();
                queue.release(&task)?;
                if !within_budget {
                    return Err(err.context("environment refresh budget exhausted"));
                }
            }
            // Fatal to the worker; the claim stays in inprogress/ for reconcile.
            Err(err) => return Err(err),
        }
    }
}

/// Claim the first queued task we can win. Lost races move on to the next
/// candidate; an empty pass returns None.
fn claim_next(queue: &QueueDirs) -> Result<Option<ClaimedTask>> {
    for candidate in queue.list_queued()? {
        match queue.claim(&candidate, &attempt_timestamp(Utc::now())) {
            Ok(Some(task)) => return Ok(Some(task)),
            Ok(None) => continue,
            Err(err) => {
                warn!(candidate = %candidate.display(), err = %err, "skipping unclaimable entry");
            }
        }
    }
    Ok(None)
}

struct TaskRun<'a, T: Tool, G: GateRunner> {
    workdir: &'a Path,
    cfg: &'a WorkerConfig,
    git: &'a Git,
    orch: &'a BranchOrchestrator<'a>,
    queue: &'a QueueDirs,
    ledger: &'a Ledger,
    policy: &'a DecisionPolicy,
    run_id: &'a str,
    tool: &'a T,
    gate_runner: &'a G,
    post_merge_runner: Option<&'a G>,
}

struct RecordParts<'a> {
    branch: &'a str,
    strategies: Vec<String>,
    fallbacks: Vec<String>,
    conflicts_found: u32,
    gates: BTreeMap<String, bool>,
    outcome: Outcome,
    quarantine_reason: Option<&'static str>,
    errors: Option<Vec<String>>,
}

#[instrument(skip_all, fields(task_id = %task.id))]
fn process_task<T: Tool, G: GateRunner>(
    run: &TaskRun<'_, T, G>,
    task: &ClaimedTask,
) -> Result<TaskResolution> {
    let start = Instant::now();

    run.orch.refresh_target()?;
    run.git.ensure_clean()?;

    let ctx = TaskContext {
        tool_name: run.tool.name().to_string(),
        task_id: task.id.clone(),
        attempt_timestamp: attempt_timestamp(Utc::now()),
    };
    let paths = AttemptPaths::new(run.workdir, run.run_id, &ctx);
    paths.ensure_dir()?;
    let branch = run.orch.begin(&ctx)?;

    let tool_outcome = match run.tool.run(&ToolRequest {
        workdir: run.workdir.to_path_buf(),
        payload: task.path.clone(),
        log_path: paths.tool_log_path.clone(),
        timeout: Duration::from_secs(run.cfg.tool_timeout_secs),
        output_limit_bytes: run.cfg.output_limit_bytes,
    }) {
        Ok(outcome) => outcome,
        // A tool that cannot even be spawned fails the task, not the worker.
        Err(err) => ToolOutcome {
            exit_code: None,
            timed_out: false,
            errors: vec![format!("tool invocation failed: {err:#}")],
        },
    };

    if !tool_outcome.succeeded() {
        abandon_worktree(run, &branch)?;
        run.ledger.append(&build_record(
            run,
            RecordParts {
                branch: &branch.name,
                strategies: Vec::new(),
                fallbacks: Vec::new(),
                conflicts_found: 0,
                gates: BTreeMap::new(),
                outcome: Outcome::Failed,
                quarantine_reason: None,
                errors: Some(tool_outcome.errors),
            },
        ))?;
        run.queue.fail(task)?;
        finish_meta(run, &paths, &ctx, &branch, Some(Outcome::Failed), 0, start)?;
        return Ok(TaskResolution::Failed);
    }

    if !run.git.has_changes()? {
        // No-op success: the tool decided no change is needed. No commit, no
        // audit record; an empty merge would only pollute the ledger.
        run.orch.discard(&branch.name)?;
        run.queue.complete(task)?;
        finish_meta(run, &paths, &ctx, &branch, None, 0, start)?;
        return Ok(TaskResolution::NoOp);
    }

    let committed = run
        .orch
        .commit_all(&format!("{}: apply {}", ctx.tool_name, ctx.task_id))?;
    if !committed {
        run.orch.discard(&branch.name)?;
        run.queue.complete(task)?;
        finish_meta(run, &paths, &ctx, &branch, None, 0, start)?;
        return Ok(TaskResolution::NoOp);
    }

    // Probe against the freshest view of the target tip we can get; if the
    // fetch fails we fall back to the local target refreshed at claim time.
    if let Err(err) = run.git.fetch(&run.cfg.remote) {
        warn!(err = %err, "fetch before conflict probe failed, using local target");
    }
    let tracking = run.orch.tracking_ref();
    let probe_ref = if run.git.ref_exists(&tracking)? {
        tracking
    } else {
        run.cfg.target_branch.clone()
    };
    let conflicts_found = run.git.conflict_count(&probe_ref, "HEAD")?;

    let gates = run.gate_runner.run(&GateRequest {
        workdir: run.workdir.to_path_buf(),
        log_dir: paths.gate_dir.clone(),
        timeout: Duration::from_secs(run.cfg.gate_timeout_secs),
        output_limit_bytes: run.cfg.output_limit_bytes,
    })?;

    match decide(conflicts_found, &gates, run.policy) {
        Verdict::Failed => {
            run.orch.discard(&branch.name)?;
            run.ledger.append(&build_record(
                run,
                RecordParts {
                    branch: &branch.name,
                    strategies: Vec::new(),
                    fallbacks: Vec::new(),
                    conflicts_found,
                    gates,
                    outcome: Outcome::Failed,
                    quarantine_reason: None,
                    errors: None,
                },
            ))?;
            run.queue.fail(task)?;
            finish_meta(
                run,
                &paths,
                &ctx,
                &branch,
                Some(Outcome::Failed),
                conflicts_found,
                start,
            )?;
            Ok(TaskResolution::Failed)
        }
        Verdict::Quarantined { reason } => {
            match run.orch.finalize_push(&branch.name, run.cfg.push_attempts) {
                Ok(report) => {
                    // Quarantined branches are retained for review.
                    run.orch.return_to_target()?;
                    run.ledger.append(&build_record(
                        run,
                        RecordParts {
                            branch: &branch.name,
                            strategies: vec!["fast-forward-push".to_string()],
                            fallbacks: report.fallbacks,
                            conflicts_found,
                            gates,
                            outcome: Outcome::Quarantined,
                            quarantine_reason: Some(reason),
                            errors: None,
                        },
                    ))?;
                    run.queue.complete(task)?;
                    finish_meta(
                        run,
                        &paths,
                        &ctx,
                        &branch,
                        Some(Outcome::Quarantined),
                        conflicts_found,
                        start,
                    )?;
                    Ok(TaskResolution::Quarantined)
                }
                Err(err) => fail_after_push(run, task, &branch, conflicts_found, gates, err, &paths, &ctx, start),
            }
        }
        Verdict::Merged => {
            match run.orch.finalize_push(&branch.name, run.cfg.push_attempts) {
                Ok(report) => {
                    run.orch.consolidate();
                    run.ledger.append(&build_record(
                        run,
                        RecordParts {
                            branch: &branch.name,
                            strategies: vec!["fast-forward-push".to_string()],
                            fallbacks: report.fallbacks,
                            conflicts_found,
                            gates: gates.clone(),
                            outcome: Outcome::Merged,
                            quarantine_reason: None,
                            errors: None,
                        },
                    ))?;

                    if let Some(post_runner) = run.post_merge_runner {
                        let post_gates = post_runner.run(&GateRequest {
                            workdir: run.workdir.to_path_buf(),
                            log_dir: paths.post_gate_dir.clone(),
                            timeout: Duration::from_secs(run.cfg.gate_timeout_secs),
                            output_limit_bytes: run.cfg.output_limit_bytes,
                        })?;
                        if evaluate_rollback(&post_gates) {
                            warn!(branch = %branch.name, "post-merge verification regressed, rolling back");
                            run.orch.delete_remote(&branch.name);
                            run.orch.discard(&branch.name)?;
                            run.ledger.append(&build_record(
                                run,
                                RecordParts {
                                    branch: &branch.name,
                                    strategies: vec!["fast-forward-push".to_string()],
                                    fallbacks: Vec::new(),
                                    conflicts_found,
                                    gates: post_gates,
                                    outcome: Outcome::RolledBack,
                                    quarantine_reason: None,
                                    errors: Some(vec![
                                        "post-merge verification regressed".to_string(),
                                    ]),
                                },
                            ))?;
                            run.queue.fail(task)?;
                            finish_meta(
                                run,
                                &paths,
                                &ctx,
                                &branch,
                                Some(Outcome::RolledBack),
                                conflicts_found,
                                start,
                            )?;
                            return Ok(TaskResolution::RolledBack);
                        }
                    }

                    // Local branch is housekeeping once pushed.
                    run.orch.discard(&branch.name)?;
                    run.queue.complete(task)?;
                    finish_meta(
                        run,
                        &paths,
                        &ctx,
                        &branch,
                        Some(Outcome::Merged),
                        conflicts_found,
                        start,
                    )?;
                    Ok(TaskResolution::Merged)
                }
                Err(err) => fail_after_push(run, task, &branch, conflicts_found, gates, err, &paths, &ctx, start),
            }
        }
    }
}

/// Push retries exhausted (or push infrastructure broke): degrade to failed.
#[allow(clippy::too_many_arguments)]
fn fail_after_push<T: Tool, G: GateRunner>(
    run: &TaskRun<'_, T, G>,
    task: &ClaimedTask,
    branch: &TaskBranch,
    conflicts_found: u32,
    gates: BTreeMap<String, bool>,
    err: anyhow::Error,
    paths: &AttemptPaths,
    ctx: &TaskContext,
    start: Instant,
) -> Result<TaskResolution> {
    warn!(branch = %branch.name, err = %err, "finalize push failed, degrading to failed");
    run.orch.discard(&branch.name)?;
    run.ledger.append(&build_record(
        run,
        RecordParts {
            branch: &branch.name,
            strategies: vec!["fast-forward-push".to_string()],
            fallbacks: Vec::new(),
            conflicts_found,
            gates,
            outcome: Outcome::Failed,
            quarantine_reason: None,
            errors: Some(vec![format!("{err:#}")]),
        },
    ))?;
    run.queue.fail(task)?;
    finish_meta(
        run,
        paths,
        ctx,
        branch,
        Some(Outcome::Failed),
        conflicts_found,
        start,
    )?;
    Ok(TaskResolution::Failed)
}

/// Throw away whatever a failed tool run left behind, then drop the branch.
fn abandon_worktree<T: Tool, G: GateRunner>(
    run: &TaskRun<'_, T, G>,
    branch: &TaskBranch,
) -> Result<()> {
    run.git.reset_hard()?;
    run.git.clean_untracked()?;
    run.orch.discard(&branch.name)
}

fn build_record<T: Tool, G: GateRunner>(
    run: &TaskRun<'_, T, G>,
    parts: RecordParts<'_>,
) -> AuditRecord {
    AuditRecord {
        timestamp: Utc::now().to_rfc3339(),
        run_id: run.run_id.to_string(),
        branch_source: parts.branch.to_string(),
        branch_target: run.cfg.target_branch.clone(),
        policy_version: run.policy.policy_version.clone(),
        strategies_applied: parts.strategies,
        fallbacks_used: parts.fallbacks,
        conflicts_found: parts.conflicts_found,
        verification_gates: parts.gates,
        outcome: parts.outcome,
        quarantine_reason: parts.quarantine_reason.map(str::to_string),
        errors: parts.errors,
    }
}

#[allow(clippy::too_many_arguments)]
fn finish_meta<T: Tool, G: GateRunner>(
    run: &TaskRun<'_, T, G>,
    paths: &AttemptPaths,
    ctx: &TaskContext,
    branch: &TaskBranch,
    outcome: Option<Outcome>,
    conflicts_found: u32,
    start: Instant,
) -> Result<()> {
    write_meta(
        paths,
        &AttemptMeta {
            run_id: run.run_id.to_string(),
            task_id: ctx.task_id.clone(),
            branch: branch.name.clone(),
            outcome,
            conflicts_found,
            duration_ms: start.elapsed().as_millis() as u64,
        },
    )
    .context("write attempt meta")
}
