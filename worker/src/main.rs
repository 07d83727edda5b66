//! Concurrent merge-train worker CLI.
//!
//! Claims task payloads from a shared filesystem queue, applies an external
//! tool on an isolated branch, and merges, quarantines, or fails each change
//! with a full audit trail under `.mergetrain/`.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use worker::exit_codes;
use worker::io::branch::BranchOrchestrator;
use worker::io::config::{WorkerConfig, load_config, write_config};
use worker::io::gates::CommandGateRunner;
use worker::io::git::Git;
use worker::io::ledger::{scan_dir, summarize};
use worker::io::queue::QueueDirs;
use worker::io::task_log::ensure_artifact_root;
use worker::io::tool::CommandTool;
use worker::worker::run_worker;

#[derive(Parser)]
#[command(name = "worker", version, about = "Concurrent merge-train worker")]
struct Cli {
    /// Working directory containing the git checkout.
    #[arg(long, default_value = ".")]
    workdir: PathBuf,

    /// Config file path. Defaults to `<workdir>/.mergetrain/config.toml`.
    #[arg(long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Write a starter config (if missing) and create the queue layout.
    Init {
        /// Overwrite an existing config file.
        #[arg(short, long)]
        force: bool,
    },
    /// Claim and process queued tasks until the queue stays idle.
    Run {
        /// Queue root directory (overrides config).
        #[arg(long)]
        queue_dir: Option<PathBuf>,
        /// Tool command template; `{file}` becomes the payload path.
        #[arg(long, num_args = 1.., value_name = "ARG")]
        command: Option<Vec<String>>,
        /// Tool name used in branch names.
        #[arg(long)]
        tool_name: Option<String>,
        #[arg(long)]
        remote: Option<String>,
        #[arg(long)]
        target_branch: Option<String>,
        #[arg(long)]
        branch_prefix: Option<String>,
        #[arg(long)]
        idle_exit_secs: Option<u64>,
        #[arg(long)]
        poll_interval_ms: Option<u64>,
        #[arg(long)]
        quarantine_threshold: Option<u32>,
    },
    /// Requeue in-progress claims older than the stale window.
    Reconcile {
        /// Claim age in seconds before it counts as orphaned.
        #[arg(long)]
        stale_secs: Option<u64>,
    },
    /// Delete local task branches already merged into the target.
    Cleanup,
    /// Summarize the audit ledger by outcome.
    Report {
        /// Ledger directory (overrides config).
        #[arg(long)]
        ledger_dir: Option<PathBuf>,
    },
}

/// Marker for configuration and usage failures so `main` can exit with
/// [`exit_codes::INVALID`] instead of [`exit_codes::FATAL`].
#[derive(Debug)]
struct UsageError(String);

impl fmt::Display for UsageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::error::Error for UsageError {}

fn invalid(err: anyhow::Error) -> anyhow::Error {
    anyhow::Error::new(UsageError(format!("{err:#}")))
}

fn main() {
    worker::logging::init();
    let cli = Cli::parse();
    let code = match dispatch(cli) {
        Ok(()) => exit_codes::OK,
        Err(err) => {
            eprintln!("{err:#}");
            if err.downcast_ref::<UsageError>().is_some() {
                exit_codes::INVALID
            } else {
                exit_codes::FATAL
            }
        }
    };
    std::process::exit(code);
}

fn dispatch(cli: Cli) -> Result<()> {
    let Cli {
        workdir,
        config,
        command,
    } = cli;
    let config_path =
        config.unwrap_or_else(|| workdir.join(".mergetrain").join("config.toml"));
    let cfg = load_config(&config_path).map_err(invalid)?;

    match command {
        Command::Init { force } => cmd_init(&workdir, cfg, &config_path, force),
        Command::Run {
            queue_dir,
            command,
            tool_name,
            remote,
            target_branch,
            branch_prefix,
            idle_exit_secs,
            poll_interval_ms,
            quarantine_threshold,
        } => {
            let mut cfg = cfg;
            if let Some(v) = queue_dir {
                cfg.queue_dir = v;
            }
            if let Some(v) = command {
                cfg.command = v;
            }
            if let Some(v) = tool_name {
                cfg.tool_name = v;
            }
            if let Some(v) = remote {
                cfg.remote = v;
            }
            if let Some(v) = target_branch {
                cfg.target_branch = v;
            }
            if let Some(v) = branch_prefix {
                cfg.branch_prefix = v;
            }
            if let Some(v) = idle_exit_secs {
                cfg.idle_exit_secs = v;
            }
            if let Some(v) = poll_interval_ms {
                cfg.poll_interval_ms = v;
            }
            if let Some(v) = quarantine_threshold {
                cfg.quarantine_threshold = v;
            }
            cmd_run(&workdir, cfg)
        }
        Command::Reconcile { stale_secs } => cmd_reconcile(&workdir, cfg, stale_secs),
        Command::Cleanup => cmd_cleanup(&workdir, cfg),
        Command::Report { ledger_dir } => cmd_report(&workdir, cfg, ledger_dir),
    }
}

fn cmd_init(workdir: &Path, cfg: WorkerConfig, config_path: &Path, force: bool) -> Result<()> {
    if force || !config_path.exists() {
        write_config(config_path, &cfg).map_err(invalid)?;
        println!("wrote {}", config_path.display());
    }
    ensure_artifact_root(workdir)?;
    let queue = QueueDirs::new(cfg.resolve(workdir, &cfg.queue_dir));
    queue.ensure_layout()?;
    let ledger_dir = cfg.resolve(workdir, &cfg.ledger_dir);
    fs::create_dir_all(&ledger_dir)
        .with_context(|| format!("create ledger dir {}", ledger_dir.display()))?;
    Ok(())
}

fn cmd_run(workdir: &Path, cfg: WorkerConfig) -> Result<()> {
    cfg.validate_for_run().map_err(invalid)?;
    let tool = CommandTool::new(cfg.tool_name(), cfg.command.clone()).map_err(invalid)?;
    let gate_runner = CommandGateRunner::new(cfg.gates.clone()).map_err(invalid)?;
    let post_runner = if cfg.post_merge_gates.is_empty() {
        None
    } else {
        Some(CommandGateRunner::new(cfg.post_merge_gates.clone()).map_err(invalid)?)
    };

    let outcome = run_worker(workdir, &cfg, &tool, &gate_runner, post_runner.as_ref())?;
    println!(
        "{}: processed {} task(s), exiting on idle queue",
        outcome.run_id, outcome.tasks_processed
    );
    Ok(())
}

fn cmd_reconcile(workdir: &Path, cfg: WorkerConfig, stale_secs: Option<u64>) -> Result<()> {
    let queue = QueueDirs::new(cfg.resolve(workdir, &cfg.queue_dir));
    queue.ensure_layout()?;
    let stale_after = Duration::from_secs(stale_secs.unwrap_or(cfg.stale_claim_secs));
    let requeued = queue.reconcile(stale_after)?;
    for id in &requeued {
        println!("requeued {id}");
    }
    println!("{} claim(s) requeued", requeued.len());
    Ok(())
}

fn cmd_cleanup(workdir: &Path, cfg: WorkerConfig) -> Result<()> {
    let git = Git::new(workdir);
    let orch = BranchOrchestrator::new(
        &git,
        cfg.remote.clone(),
        cfg.target_branch.clone(),
        cfg.branch_prefix.clone(),
        cfg.consolidate_command.clone(),
    );
    let deleted = orch.cleanup()?;
    for branch in &deleted {
        println!("deleted {branch}");
    }
    println!("{} branch(es) deleted", deleted.len());
    Ok(())
}

fn cmd_report(workdir: &Path, cfg: WorkerConfig, ledger_dir: Option<PathBuf>) -> Result<()> {
    let dir = ledger_dir.unwrap_or_else(|| cfg.ledger_dir.clone());
    let records = scan_dir(&cfg.resolve(workdir, &dir))?;
    let summary = summarize(&records);
    println!("total       {}", summary.total);
    println!("merged      {}", summary.merged);
    println!("quarantined {}", summary.quarantined);
    println!("failed      {}", summary.failed);
    println!("rolled_back {}", summary.rolled_back);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_init() {
        let cli = Cli::parse_from(["worker", "init"]);
        assert!(matches!(cli.command, Command::Init { force: false }));
    }

    #[test]
    fn parse_run_with_command_template() {
        let cli = Cli::parse_from([
            "worker",
            "run",
            "--command",
            "fix",
            "{file}",
            "--quarantine-threshold",
            "5",
        ]);
        match cli.command {
            Command::Run {
                command,
                quarantine_threshold,
                ..
            } => {
                assert_eq!(command, Some(vec!["fix".to_string(), "{file}".to_string()]));
                assert_eq!(quarantine_threshold, Some(5));
            }
            _ => panic!("expected run"),
        }
    }

    #[test]
    fn parse_reconcile_stale_window() {
        let cli = Cli::parse_from(["worker", "reconcile", "--stale-secs", "60"]);
        match cli.command {
            Command::Reconcile { stale_secs } => assert_eq!(stale_secs, Some(60)),
            _ => panic!("expected reconcile"),
        }
    }
}
