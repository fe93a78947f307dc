//! CLI tests for the `run-engine` binary.
//!
//! Seeds a file-backed store and event log in a temp dir, spawns the binary and
//! checks exit codes and printed JSON.

use std::process::{Command, Output};

use serde_json::Value;

use run_engine::core::types::{RunStatus, StepStatus};
use run_engine::events::RunEvent;
use run_engine::exit_codes;
use run_engine::io::event_log::EventLog;
use run_engine::io::repository::{FileRepository, Repository};
use run_engine::test_support::{item, plan_of, run_record, step_record, task_record};

fn engine(args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_run-engine"))
        .args(args)
        .output()
        .expect("run-engine")
}

fn stdout_json(output: &Output) -> Value {
    serde_json::from_slice(&output.stdout).expect("json stdout")
}

fn seed_failed_run(repo: &FileRepository) {
    repo.insert_task(&task_record("t1")).expect("task");
    let mut run = run_record("t1", "r1");
    run.status = RunStatus::Failed;
    run.error = Some("step#2 failed: boom".to_string());
    run.plan = Some(plan_of(vec![item("s1"), item("s2"), item("s3")]));
    repo.insert_run(&run).expect("run");
    repo.upsert_step(&step_record(1, StepStatus::Done, None))
        .expect("step 1");
    repo.upsert_step(&step_record(2, StepStatus::Failed, Some("boom")))
        .expect("step 2");
}

#[test]
fn route_prints_heuristic_decision() {
    let output = engine(&["route", "请抓取 https://example.com 的最新价格"]);
    assert_eq!(output.status.code(), Some(exit_codes::OK));
    let decision = stdout_json(&output);
    assert_eq!(decision["mode"], "do");
    assert!(
        decision["reason"]
            .as_str()
            .is_some_and(|r| r.contains("heuristic:url_or_external_task"))
    );
}

#[test]
fn inspect_prints_run_and_ledger() {
    let temp = tempfile::tempdir().expect("tempdir");
    let repo = FileRepository::new(temp.path());
    seed_failed_run(&repo);
    let store = temp.path().to_str().expect("utf8 path");

    let output = engine(&["inspect", "--store", store, "t1", "r1"]);
    assert_eq!(output.status.code(), Some(exit_codes::OK));
    let report = stdout_json(&output);
    assert_eq!(report["status"], "failed");
    assert_eq!(report["items"].as_array().map(Vec::len), Some(3));
    assert_eq!(report["steps"][1]["error"], "boom");
}

#[test]
fn resume_point_continues_at_the_failed_step() {
    let temp = tempfile::tempdir().expect("tempdir");
    let repo = FileRepository::new(temp.path());
    seed_failed_run(&repo);
    let store = temp.path().to_str().expect("utf8 path");

    let output = engine(&["resume-point", "--store", store, "t1", "r1"]);
    assert_eq!(output.status.code(), Some(exit_codes::OK));
    let decision = stdout_json(&output);
    assert_eq!(decision["resume_step_order"], 2);
    assert_eq!(decision["skip_execution"], false);
}

#[test]
fn missing_run_exits_not_found() {
    let temp = tempfile::tempdir().expect("tempdir");
    let store = temp.path().to_str().expect("utf8 path");
    let output = engine(&["inspect", "--store", store, "t1", "nope"]);
    assert_eq!(output.status.code(), Some(exit_codes::NOT_FOUND));
}

#[test]
fn replay_prints_events_after_sequence() {
    let temp = tempfile::tempdir().expect("tempdir");
    let log = EventLog::persistent(temp.path());
    for text in ["one", "two", "three"] {
        log.record(
            "sess",
            &RunEvent::Delta {
                run_id: "r1".to_string(),
                text: text.to_string(),
            },
        )
        .expect("record");
    }
    let dir = temp.path().to_str().expect("utf8 path");

    let output = engine(&["replay", "--events", dir, "sess", "--after", "1"]);
    assert_eq!(output.status.code(), Some(exit_codes::OK));
    let lines: Vec<Value> = String::from_utf8_lossy(&output.stdout)
        .lines()
        .map(|line| serde_json::from_str(line).expect("json line"))
        .collect();
    let seqs: Vec<u64> = lines.iter().filter_map(|l| l["seq"].as_u64()).collect();
    assert_eq!(seqs, vec![2, 3]);
    assert_eq!(lines[0]["event"]["text"], "two");

    let missing = engine(&["replay", "--events", dir, "other"]);
    assert_eq!(missing.status.code(), Some(exit_codes::NOT_FOUND));
}

#[test]
fn config_prints_defaults_when_file_is_missing() {
    let temp = tempfile::tempdir().expect("tempdir");
    let path = temp.path().join("absent.toml");
    let output = engine(&["config", "--path", path.to_str().expect("utf8 path")]);
    assert_eq!(output.status.code(), Some(exit_codes::OK));
    let text = String::from_utf8_lossy(&output.stdout);
    assert!(text.contains("max_reflection_rounds = 2"));
}

#[test]
fn invalid_config_exits_invalid() {
    let temp = tempfile::tempdir().expect("tempdir");
    let path = temp.path().join("engine.toml");
    std::fs::write(&path, "max_plan_steps = 0\n").expect("write");
    let output = engine(&["config", "--path", path.to_str().expect("utf8 path")]);
    assert_eq!(output.status.code(), Some(exit_codes::INVALID));
}
