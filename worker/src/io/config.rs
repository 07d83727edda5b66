//! Worker configuration stored under `.mergetrain/config.toml`.

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::io::gates::GateSpec;

/// Worker configuration (TOML).
///
/// Intended to be edited by humans; missing fields default to sensible
/// values. CLI flags override individual fields at startup.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct WorkerConfig {
    /// Queue root; queued payloads live directly in it. The default sits
    /// under `.mergetrain/` so queue files never dirty the working tree.
    pub queue_dir: PathBuf,

    /// Directory for audit ledger files.
    pub ledger_dir: PathBuf,

    /// Tool command template; `{file}` is replaced with the payload path.
    pub command: Vec<String>,

    /// Name used in branch names. Derived from the command when empty.
    pub tool_name: String,

    pub remote: String,
    pub target_branch: String,
    pub branch_prefix: String,

    /// Exit successfully after this many seconds without a successful claim.
    pub idle_exit_secs: u64,

    /// Delay between empty-queue checks.
    pub poll_interval_ms: u64,

    pub quarantine_threshold: u32,
    pub policy_version: String,

    pub tool_timeout_secs: u64,
    pub gate_timeout_secs: u64,
    pub output_limit_bytes: usize,

    /// Push attempts before a rejected push degrades the outcome to failed.
    pub push_attempts: u32,

    /// Environment-refresh failures tolerated before the worker exits fatally.
    pub refresh_attempts: u32,

    /// Age after which `reconcile` treats an in-progress claim as orphaned.
    pub stale_claim_secs: u64,

    /// Pre-merge verification gates.
    pub gates: Vec<GateSpec>,

    /// Post-merge verification gates; a regression here rolls the merge back.
    pub post_merge_gates: Vec<GateSpec>,

    /// Optional command dispatched after a merge to trigger server-side
    /// consolidation. Empty disables the trigger.
    pub consolidate_command: Vec<String>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            queue_dir: PathBuf::from(".mergetrain/queue"),
            ledger_dir: PathBuf::from(".mergetrain/ledger"),
            command: Vec::new(),
            tool_name: String::new(),
            remote: "origin".to_string(),
            target_branch: "main".to_string(),
            branch_prefix: "mergetrain".to_string(),
            idle_exit_secs: 300,
            poll_interval_ms: 1000,
            quarantine_threshold: 3,
            policy_version: "policy-v1".to_string(),
            tool_timeout_secs: 30 * 60,
            gate_timeout_secs: 30 * 60,
            output_limit_bytes: 100_000,
            push_attempts: 3,
            refresh_attempts: 3,
            stale_claim_secs: 3600,
            gates: Vec::new(),
            post_merge_gates: Vec::new(),
            consolidate_command: Vec::new(),
        }
    }
}

impl WorkerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.idle_exit_secs == 0 {
            return Err(anyhow!("idle_exit_secs must be > 0"));
        }
        if self.poll_interval_ms == 0 {
            return Err(anyhow!("poll_interval_ms must be > 0"));
        }
        if self.tool_timeout_secs == 0 || self.gate_timeout_secs == 0 {
            return Err(anyhow!("timeouts must be > 0"));
        }
        if self.output_limit_bytes == 0 {
            return Err(anyhow!("output_limit_bytes must be > 0"));
        }
        if self.remote.trim().is_empty() || self.target_branch.trim().is_empty() {
            return Err(anyhow!("remote and target_branch must be non-empty"));
        }
        if self.branch_prefix.trim().is_empty() || self.branch_prefix.contains('/') {
            return Err(anyhow!("branch_prefix must be non-empty and slash-free"));
        }
        let mut names = BTreeSet::new();
        for spec in self.gates.iter().chain(&self.post_merge_gates) {
            if spec.name.trim().is_empty() {
                return Err(anyhow!("gate names must be non-empty"));
            }
        }
        for spec in &self.gates {
            if !names.insert(&spec.name) {
                return Err(anyhow!("duplicate gate name '{}'", spec.name));
            }
        }
        Ok(())
    }

    /// The command template is only mandatory for `run`; other commands work
    /// without it.
    pub fn validate_for_run(&self) -> Result<()> {
        self.validate()?;
        if self.command.is_empty() || self.command[0].trim().is_empty() {
            return Err(anyhow!("command template must be a non-empty array"));
        }
        Ok(())
    }

    /// Tool name for branch naming; falls back to the command's binary stem.
    pub fn tool_name(&self) -> String {
        if !self.tool_name.trim().is_empty() {
            return self.tool_name.clone();
        }
        self.command
            .first()
            .map(|c| {
                Path::new(c)
                    .file_stem()
                    .map(|s| s.to_string_lossy().into_owned())
                    .unwrap_or_else(|| c.clone())
            })
            .unwrap_or_else(|| "tool".to_string())
    }

    /// Resolve a possibly-relative configured path against the working
    /// directory.
    pub fn resolve(&self, workdir: &Path, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            workdir.join(path)
        }
    }
}

/// Load config from a TOML file; missing file means defaults.
pub fn load_config(path: &Path) -> Result<WorkerConfig> {
    if !path.exists() {
        let cfg = WorkerConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: WorkerConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &WorkerConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    let parent = path
        .parent()
        .with_context(|| format!("config path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("toml.tmp");
    fs::write(&tmp_path, &buf)
        .with_context(|| format!("write temp config {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace config {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_missing_returns_default() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cfg = load_config(&temp.path().join("missing.toml")).expect("load");
        assert_eq!(cfg, WorkerConfig::default());
    }

    #[test]
    fn write_then_load_round_trips() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("config.toml");
        let cfg = WorkerConfig {
            command: vec!["fix".to_string(), "{file}".to_string()],
            quarantine_threshold: 5,
            ..WorkerConfig::default()
        };
        write_config(&path, &cfg).expect("write");
        let loaded = load_config(&path).expect("load");
        assert_eq!(loaded, cfg);
    }

    #[test]
    fn run_requires_a_command_template() {
        let cfg = WorkerConfig::default();
        assert!(cfg.validate().is_ok());
        assert!(cfg.validate_for_run().is_err());
    }

    #[test]
    fn tool_name_falls_back_to_command_stem() {
        let cfg = WorkerConfig {
            command: vec!["/usr/bin/lint-fix".to_string(), "{file}".to_string()],
            ..WorkerConfig::default()
        };
        assert_eq!(cfg.tool_name(), "lint-fix");

        let named = WorkerConfig {
            tool_name: "fixer".to_string(),
            ..cfg
        };
        assert_eq!(named.tool_name(), "fixer");
    }

    #[test]
    fn rejects_slash_in_branch_prefix() {
        let cfg = WorkerConfig {
            branch_prefix: "a/b".to_string(),
            ..WorkerConfig::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_duplicate_gate_names() {
        let gate = GateSpec {
            name: "test".to_string(),
            command: vec!["true".to_string()],
        };
        let cfg = WorkerConfig {
            gates: vec![gate.clone(), gate],
            ..WorkerConfig::default()
        };
        assert!(cfg.validate().is_err());
    }
}
