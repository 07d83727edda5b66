//! End-to-end worker lifecycle against a real git repo and bare remote.

use std::collections::BTreeMap;
use std::fs;

use worker::core::decision::{Outcome, REASON_WITHIN_THRESHOLD};
use worker::io::git::Git;
use worker::io::ledger::scan_dir;
use worker::io::tool::ToolOutcome;
use worker::test_support::{
    FnTool, ScriptedGateRunner, ScriptedTool, ScriptedToolRun, TestRepo,
};
use worker::worker::{WorkerStop, run_worker};

fn edit(path: &str, contents: &str) -> ScriptedToolRun {
    ScriptedToolRun {
        edits: vec![(path.to_string(), contents.to_string())],
        exit_code: 0,
    }
}

#[test]
fn clean_change_is_merged_and_pushed() {
    let repo = TestRepo::new().expect("repo");
    let cfg = repo.config();
    repo.enqueue("t1").expect("enqueue");

    let tool = ScriptedTool::new("fixer", vec![edit("fix.txt", "patched\n")]);
    let gates = ScriptedGateRunner::passing(&["test"]);

    let outcome = run_worker(&repo.workdir(), &cfg, &tool, &gates, None).expect("worker");
    assert_eq!(outcome.tasks_processed, 1);
    assert_eq!(outcome.stop, WorkerStop::Idle);

    assert_eq!(repo.bucket_ids("done").expect("done"), vec!["t1".to_string()]);
    assert!(repo.bucket_ids("error").expect("error").is_empty());

    let records = scan_dir(&repo.ledger_dir()).expect("scan");
    assert_eq!(records.len(), 1);
    let record = &records[0];
    assert_eq!(record.outcome, Outcome::Merged);
    assert_eq!(record.conflicts_found, 0);
    assert_eq!(record.strategies_applied, vec!["fast-forward-push".to_string()]);
    assert_eq!(record.verification_gates.get("test"), Some(&true));
    assert_eq!(record.branch_target, "main");
    assert!(record.branch_source.starts_with("mergetrain/fixer/t1-"));

    let refs = repo.remote_refs().expect("refs");
    assert!(refs.contains(&format!("refs/heads/{}", record.branch_source)));
    assert!(refs.contains(&format!("refs/mergetrain/{}", record.branch_source)));

    // The worker is back on the target with a clean tree and no task branch.
    let git = Git::new(repo.workdir());
    assert_eq!(git.current_branch().expect("branch"), "main");
    assert!(!git.has_changes().expect("status"));
    assert!(!git.branch_exists(&record.branch_source).expect("exists"));
}

#[test]
fn failing_tool_fails_the_task_and_discards_its_edits() {
    let repo = TestRepo::new().expect("repo");
    let cfg = repo.config();
    repo.enqueue("t3").expect("enqueue");

    let tool = ScriptedTool::new(
        "fixer",
        vec![ScriptedToolRun {
            edits: vec![("broken.txt".to_string(), "partial\n".to_string())],
            exit_code: 1,
        }],
    );
    let gates = ScriptedGateRunner::passing(&["test"]);

    let outcome = run_worker(&repo.workdir(), &cfg, &tool, &gates, None).expect("worker");
    assert_eq!(outcome.tasks_processed, 1);

    assert_eq!(repo.bucket_ids("error").expect("error"), vec!["t3".to_string()]);
    assert!(repo.bucket_ids("done").expect("done").is_empty());

    let records = scan_dir(&repo.ledger_dir()).expect("scan");
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].outcome, Outcome::Failed);
    assert!(records[0].errors.as_ref().is_some_and(|e| !e.is_empty()));

    // Nothing reached the remote and the partial edit is gone.
    let refs = repo.remote_refs().expect("refs");
    assert!(!refs.iter().any(|r| r.contains("/t3-")));
    let git = Git::new(repo.workdir());
    assert_eq!(git.current_branch().expect("branch"), "main");
    assert!(!git.has_changes().expect("status"));
    assert!(!repo.workdir().join("broken.txt").exists());
}

#[test]
fn failing_gate_fails_the_task() {
    let repo = TestRepo::new().expect("repo");
    let cfg = repo.config();
    repo.enqueue("t4").expect("enqueue");

    let tool = ScriptedTool::new("fixer", vec![edit("fix.txt", "patched\n")]);
    let gates = ScriptedGateRunner::new(BTreeMap::from([
        ("test".to_string(), false),
        ("policy".to_string(), true),
    ]));

    run_worker(&repo.workdir(), &cfg, &tool, &gates, None).expect("worker");

    assert_eq!(repo.bucket_ids("error").expect("error"), vec!["t4".to_string()]);
    let records = scan_dir(&repo.ledger_dir()).expect("scan");
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].outcome, Outcome::Failed);
    assert_eq!(records[0].verification_gates.get("test"), Some(&false));
    assert!(!repo.remote_refs().expect("refs").iter().any(|r| r.contains("/t4-")));
}

#[test]
fn conflicting_change_is_quarantined_with_branch_retained() {
    let repo = TestRepo::new().expect("repo");
    let cfg = repo.config();
    repo.enqueue("t5").expect("enqueue");

    // The tool edits notes.txt while a competing edit to the same file lands
    // on the remote, so the dry-run merge reports a conflict.
    let tool = FnTool::new("fixer", |request: &worker::io::tool::ToolRequest| {
        fs::write(request.workdir.join("notes.txt"), "local edit\n")?;
        repo.push_conflicting_commit("notes.txt", "remote edit\n")?;
        Ok(ToolOutcome {
            exit_code: Some(0),
            timed_out: false,
            errors: Vec::new(),
        })
    });
    let gates = ScriptedGateRunner::passing(&["test"]);

    run_worker(&repo.workdir(), &cfg, &tool, &gates, None).expect("worker");

    assert_eq!(repo.bucket_ids("done").expect("done"), vec!["t5".to_string()]);
    let records = scan_dir(&repo.ledger_dir()).expect("scan");
    assert_eq!(records.len(), 1);
    let record = &records[0];
    assert_eq!(record.outcome, Outcome::Quarantined);
    assert_eq!(
        record.quarantine_reason.as_deref(),
        Some(REASON_WITHIN_THRESHOLD)
    );
    assert!(record.conflicts_found >= 1);

    // Quarantined work stays available for review, locally and remotely.
    let git = Git::new(repo.workdir());
    assert_eq!(git.current_branch().expect("branch"), "main");
    assert!(git.branch_exists(&record.branch_source).expect("exists"));
    let refs = repo.remote_refs().expect("refs");
    assert!(refs.contains(&format!("refs/heads/{}", record.branch_source)));
}

#[test]
fn post_merge_regression_rolls_the_merge_back() {
    let repo = TestRepo::new().expect("repo");
    let cfg = repo.config();
    repo.enqueue("t6").expect("enqueue");

    let tool = ScriptedTool::new("fixer", vec![edit("fix.txt", "patched\n")]);
    let gates = ScriptedGateRunner::passing(&["test"]);
    let post_gates = ScriptedGateRunner::new(BTreeMap::from([("smoke".to_string(), false)]));

    run_worker(&repo.workdir(), &cfg, &tool, &gates, Some(&post_gates)).expect("worker");

    // The merged record is never rewritten; a rolled_back record follows it.
    let records = scan_dir(&repo.ledger_dir()).expect("scan");
    assert_eq!(records.len(), 2);
    assert_eq!(records[0].outcome, Outcome::Merged);
    assert_eq!(records[1].outcome, Outcome::RolledBack);
    assert_eq!(records[1].verification_gates.get("smoke"), Some(&false));
    assert_eq!(records[0].branch_source, records[1].branch_source);

    assert_eq!(repo.bucket_ids("error").expect("error"), vec!["t6".to_string()]);

    // Branch and routing marker are gone from the remote again.
    let refs = repo.remote_refs().expect("refs");
    assert!(!refs.iter().any(|r| r.contains("/t6-")));
}

#[test]
fn refresh_failure_requeues_task_and_exits_after_budget() {
    let repo = TestRepo::new().expect("repo");
    let mut cfg = repo.config();
    cfg.refresh_attempts = 2;
    repo.enqueue("t1").expect("enqueue");
    repo.git_in_workdir(&["remote", "set-url", "origin", "/nonexistent/remote.git"])
        .expect("set-url");

    let tool = ScriptedTool::new("fixer", Vec::new());
    let gates = ScriptedGateRunner::passing(&["test"]);

    let err =
        run_worker(&repo.workdir(), &cfg, &tool, &gates, None).expect_err("must exit fatally");
    assert!(
        format!("{err:#}").contains("environment refresh budget exhausted"),
        "{err:#}"
    );

    // The task is back in the queue under its plain name, never failed.
    assert!(repo.queue_dir().join("t1.json").exists());
    assert!(repo.bucket_ids("inprogress").expect("inprogress").is_empty());
    assert!(repo.bucket_ids("error").expect("error").is_empty());
    assert!(scan_dir(&repo.ledger_dir()).expect("scan").is_empty());
}

#[test]
fn drains_multiple_tasks_in_name_order() {
    let repo = TestRepo::new().expect("repo");
    let cfg = repo.config();
    repo.enqueue("a1").expect("enqueue");
    repo.enqueue("a2").expect("enqueue");

    let tool = ScriptedTool::new(
        "fixer",
        vec![edit("one.txt", "1\n"), edit("two.txt", "2\n")],
    );
    let gates = ScriptedGateRunner::passing(&["test"]);

    let outcome = run_worker(&repo.workdir(), &cfg, &tool, &gates, None).expect("worker");
    assert_eq!(outcome.tasks_processed, 2);

    assert_eq!(
        repo.bucket_ids("done").expect("done"),
        vec!["a1".to_string(), "a2".to_string()]
    );
    let records = scan_dir(&repo.ledger_dir()).expect("scan");
    assert_eq!(records.len(), 2);
    assert!(records[0].branch_source.contains("/a1-"));
    assert!(records[1].branch_source.contains("/a2-"));
}
