//! Append-only audit ledger.
//!
//! One JSON object per line, one file per (operation kind, worker start
//! time), so workers started at different moments never share a file. When
//! they do share one, each record is written with a single append-mode
//! `write_all`, so concurrent appends interleave only at line granularity.
//! There is no update or delete operation; reconciliation scans the files.

use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use jsonschema::{Draft, Validator};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use crate::core::decision::Outcome;

const V1_SCHEMA: &str = include_str!("../../schemas/audit_record/v1.schema.json");

/// One immutable ledger line: the full story of a terminal task attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditRecord {
    /// ISO-8601 wall-clock time the record was built.
    pub timestamp: String,
    /// Unique per worker invocation.
    pub run_id: String,
    /// The per-attempt task branch.
    pub branch_source: String,
    /// The integration branch the change was evaluated against.
    pub branch_target: String,
    pub policy_version: String,
    /// Ordered integration strategies attempted.
    pub strategies_applied: Vec<String>,
    /// Fallbacks taken while applying the strategies (e.g. refresh+retry).
    pub fallbacks_used: Vec<String>,
    pub conflicts_found: u32,
    /// Gate name -> pass.
    pub verification_gates: BTreeMap<String, bool>,
    pub outcome: Outcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quarantine_reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub errors: Option<Vec<String>>,
}

/// Handle on the active ledger file for one worker invocation.
pub struct Ledger {
    path: PathBuf,
    validator: Validator,
}

impl Ledger {
    /// Open (lazily create) the ledger file for `operation` and `started_at`:
    /// `<dir>/<operation>-<YYYYMMDD>-<HHMMSS>.jsonl`.
    pub fn open(dir: &Path, operation: &str, started_at: DateTime<Utc>) -> Result<Self> {
        fs::create_dir_all(dir).with_context(|| format!("create ledger dir {}", dir.display()))?;
        let file_name = format!("{operation}-{}.jsonl", started_at.format("%Y%m%d-%H%M%S"));
        Ok(Self {
            path: dir.join(file_name),
            validator: build_validator()?,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Validate and append one record.
    ///
    /// A record that fails schema validation is rejected before any byte is
    /// written; a malformed record is a programming error, not data to store.
    #[instrument(skip_all, fields(outcome = ?record.outcome))]
    pub fn append(&self, record: &AuditRecord) -> Result<()> {
        let value = serde_json::to_value(record).context("serialize audit record")?;
        let violations: Vec<String> = self
            .validator
            .iter_errors(&value)
            .map(|err| err.to_string())
            .collect();
        if !violations.is_empty() {
            bail!(
                "audit record failed schema validation:\n- {}",
                violations.join("\n- ")
            );
        }

        let mut line = serde_json::to_string(&value).context("render audit record")?;
        line.push('\n');

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("open ledger {}", self.path.display()))?;
        // One write_all per record keeps concurrent appends line-atomic.
        file.write_all(line.as_bytes())
            .with_context(|| format!("append to ledger {}", self.path.display()))?;
        debug!(path = %self.path.display(), "appended audit record");
        Ok(())
    }
}

fn build_validator() -> Result<Validator> {
    let schema: serde_json::Value =
        serde_json::from_str(V1_SCHEMA).context("parse audit record schema")?;
    jsonschema::options()
        .with_draft(Draft::Draft202012)
        .build(&schema)
        .context("compile audit record schema")
}

/// Read every record from every `*.jsonl` file under `dir`, in file-name then
/// line order. Readers reconcile; they never mutate.
pub fn scan_dir(dir: &Path) -> Result<Vec<AuditRecord>> {
    let mut files = Vec::new();
    if !dir.exists() {
        return Ok(Vec::new());
    }
    let entries = fs::read_dir(dir).with_context(|| format!("read ledger dir {}", dir.display()))?;
    for entry in entries {
        let path = entry.context("read ledger entry")?.path();
        if path.is_file() && path.extension().is_some_and(|e| e == "jsonl") {
            files.push(path);
        }
    }
    files.sort();

    let mut records = Vec::new();
    for path in files {
        let contents =
            fs::read_to_string(&path).with_context(|| format!("read {}", path.display()))?;
        for (idx, line) in contents.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let record: AuditRecord = serde_json::from_str(line)
                .with_context(|| format!("parse {} line {}", path.display(), idx + 1))?;
            records.push(record);
        }
    }
    Ok(records)
}

/// Outcome totals over a set of records.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LedgerSummary {
    pub total: usize,
    pub merged: usize,
    pub quarantined: usize,
    pub failed: usize,
    pub rolled_back: usize,
}

pub fn summarize(records: &[AuditRecord]) -> LedgerSummary {
    let mut summary = LedgerSummary::default();
    for record in records {
        summary.total += 1;
        match record.outcome {
            Outcome::Merged => summary.merged += 1,
            Outcome::Quarantined => summary.quarantined += 1,
            Outcome::Failed => summary.failed += 1,
            Outcome::RolledBack => summary.rolled_back += 1,
        }
    }
    summary
}
