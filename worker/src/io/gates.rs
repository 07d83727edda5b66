//! Verification gate runner.
//!
//! A gate is a named pass/fail command (test suite, policy scan) run against
//! the candidate change in the working tree. The decision engine consumes
//! only the name -> pass mapping; the runner behind it is pluggable.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Command;
use std::time::Duration;

use anyhow::{Result, anyhow};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

use crate::io::process::run_with_timeout;

/// One configured gate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GateSpec {
    pub name: String,
    /// Command argv, e.g. `["just", "ci"]`.
    pub command: Vec<String>,
}

/// Parameters shared by all gates of one verification pass.
#[derive(Debug, Clone)]
pub struct GateRequest {
    pub workdir: PathBuf,
    /// Directory for per-gate logs (`gate-<name>.log`).
    pub log_dir: PathBuf,
    pub timeout: Duration,
    pub output_limit_bytes: usize,
}

/// Abstraction over gate execution.
pub trait GateRunner {
    /// Run every gate and report gate name -> pass.
    fn run(&self, request: &GateRequest) -> Result<BTreeMap<String, bool>>;
}

/// Gate runner that spawns each configured command.
#[derive(Debug, Clone)]
pub struct CommandGateRunner {
    specs: Vec<GateSpec>,
}

impl CommandGateRunner {
    pub fn new(specs: Vec<GateSpec>) -> Result<Self> {
        for spec in &specs {
            if spec.name.trim().is_empty() {
                return Err(anyhow!("gate name must be non-empty"));
            }
            if spec.command.is_empty() || spec.command[0].trim().is_empty() {
                return Err(anyhow!("gate '{}' has an empty command", spec.name));
            }
        }
        Ok(Self { specs })
    }
}

impl GateRunner for CommandGateRunner {
    #[instrument(skip_all, fields(gate_count = self.specs.len()))]
    fn run(&self, request: &GateRequest) -> Result<BTreeMap<String, bool>> {
        let mut results = BTreeMap::new();
        for spec in &self.specs {
            let mut cmd = Command::new(&spec.command[0]);
            cmd.args(&spec.command[1..]).current_dir(&request.workdir);

            let output = run_with_timeout(cmd, request.timeout, request.output_limit_bytes)?;
            let passed = output.success();
            if passed {
                debug!(gate = %spec.name, "gate passed");
            } else {
                warn!(gate = %spec.name, timed_out = output.timed_out, "gate failed");
            }

            let log_path = request.log_dir.join(format!("gate-{}.log", spec.name));
            if let Some(parent) = log_path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(&log_path, output.render_log())?;

            results.insert(spec.name.clone(), passed);
        }
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(name: &str, script: &str) -> GateSpec {
        GateSpec {
            name: name.to_string(),
            command: vec!["sh".to_string(), "-c".to_string(), script.to_string()],
        }
    }

    #[test]
    fn reports_pass_and_fail_per_gate() {
        let temp = tempfile::tempdir().expect("tempdir");
        let runner = CommandGateRunner::new(vec![
            spec("test", "exit 0"),
            spec("policy", "echo denied >&2; exit 1"),
        ])
        .expect("runner");
        let request = GateRequest {
            workdir: temp.path().to_path_buf(),
            log_dir: temp.path().join("gates"),
            timeout: Duration::from_secs(5),
            output_limit_bytes: 4096,
        };

        let results = runner.run(&request).expect("run");
        assert_eq!(results.get("test"), Some(&true));
        assert_eq!(results.get("policy"), Some(&false));
        assert!(request.log_dir.join("gate-test.log").is_file());
        let policy_log =
            std::fs::read_to_string(request.log_dir.join("gate-policy.log")).expect("log");
        assert!(policy_log.contains("denied"));
    }

    #[test]
    fn no_gates_yields_empty_results() {
        let temp = tempfile::tempdir().expect("tempdir");
        let runner = CommandGateRunner::new(Vec::new()).expect("runner");
        let request = GateRequest {
            workdir: temp.path().to_path_buf(),
            log_dir: temp.path().join("gates"),
            timeout: Duration::from_secs(1),
            output_limit_bytes: 64,
        };
        assert!(runner.run(&request).expect("run").is_empty());
    }

    #[test]
    fn rejects_malformed_specs() {
        assert!(CommandGateRunner::new(vec![GateSpec {
            name: String::new(),
            command: vec!["true".to_string()],
        }])
        .is_err());
        assert!(CommandGateRunner::new(vec![GateSpec {
            name: "test".to_string(),
            command: Vec::new(),
        }])
        .is_err());
    }
}
