//! External change-producing tool invocation.
//!
//! The tool is opaque to the worker: a command template, an exit code, and
//! whatever it leaves in the working tree. The [`Tool`] trait decouples the
//! worker loop from process spawning; tests script outcomes instead.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use tracing::{info, instrument, warn};

use crate::io::process::run_with_timeout;

/// Placeholder in command templates replaced with the payload path.
pub const FILE_PLACEHOLDER: &str = "{file}";

/// Parameters for one tool invocation.
#[derive(Debug, Clone)]
pub struct ToolRequest {
    /// Working directory the tool edits (the git worktree).
    pub workdir: PathBuf,
    /// Path to the task payload file.
    pub payload: PathBuf,
    /// Path to write the captured tool output log.
    pub log_path: PathBuf,
    pub timeout: Duration,
    pub output_limit_bytes: usize,
}

/// Result of one tool invocation. A timeout is treated identically to a
/// non-zero exit by callers.
#[derive(Debug, Clone)]
pub struct ToolOutcome {
    pub exit_code: Option<i32>,
    pub timed_out: bool,
    /// Captured error text for the audit record (stderr tail, timeout note).
    pub errors: Vec<String>,
}

impl ToolOutcome {
    pub fn succeeded(&self) -> bool {
        !self.timed_out && self.exit_code == Some(0)
    }
}

/// Abstraction over the external tool backend.
pub trait Tool {
    /// Name used in branch names and logs.
    fn name(&self) -> &str;

    fn run(&self, request: &ToolRequest) -> Result<ToolOutcome>;
}

/// Tool that spawns a configured command template.
#[derive(Debug, Clone)]
pub struct CommandTool {
    name: String,
    template: Vec<String>,
}

impl CommandTool {
    pub fn new(name: impl Into<String>, template: Vec<String>) -> Result<Self> {
        if template.is_empty() || template[0].trim().is_empty() {
            return Err(anyhow!("tool command template must be a non-empty array"));
        }
        Ok(Self {
            name: name.into(),
            template,
        })
    }

    fn render(&self, payload: &Path) -> Vec<String> {
        let payload = payload.to_string_lossy();
        self.template
            .iter()
            .map(|arg| arg.replace(FILE_PLACEHOLDER, &payload))
            .collect()
    }
}

impl Tool for CommandTool {
    fn name(&self) -> &str {
        &self.name
    }

    #[instrument(skip_all, fields(tool = %self.name, timeout_secs = request.timeout.as_secs()))]
    fn run(&self, request: &ToolRequest) -> Result<ToolOutcome> {
        let argv = self.render(&request.payload);
        info!(command = ?argv, "invoking tool");

        let mut cmd = Command::new(&argv[0]);
        cmd.args(&argv[1..]).current_dir(&request.workdir);

        let output = run_with_timeout(cmd, request.timeout, request.output_limit_bytes)
            .with_context(|| format!("run tool '{}'", argv[0]))?;

        write_tool_log(&request.log_path, &output.render_log())?;

        let mut errors = Vec::new();
        if output.timed_out {
            warn!("tool timed out");
            errors.push(format!(
                "tool timed out after {}s",
                request.timeout.as_secs()
            ));
        } else if !output.status.success() {
            warn!(exit_code = ?output.status.code(), "tool failed");
            errors.push(format!(
                "tool exited with status {:?}",
                output.status.code()
            ));
            let tail = stderr_tail(&output.stderr, 2000);
            if !tail.is_empty() {
                errors.push(tail);
            }
        }

        Ok(ToolOutcome {
            exit_code: output.status.code(),
            timed_out: output.timed_out,
            errors,
        })
    }
}

fn stderr_tail(stderr: &[u8], max_chars: usize) -> String {
    let text = String::from_utf8_lossy(stderr);
    let trimmed = text.trim();
    let start = trimmed
        .char_indices()
        .rev()
        .nth(max_chars.saturating_sub(1))
        .map(|(i, _)| i)
        .unwrap_or(0);
    trimmed[start..].to_string()
}

fn write_tool_log(path: &Path, contents: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create tool log dir {}", parent.display()))?;
    }
    fs::write(path, contents).with_context(|| format!("write tool log {}", path.display()))
}
