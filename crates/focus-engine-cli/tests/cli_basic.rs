use std::path::Path;
use std::process::{Command, Output};

use serde_json::Value;
use tempfile::TempDir;

fn run_cli(home: &Path, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_focus-engine"))
        .args(args)
        .env("FOCUS_ENGINE_HOME", home)
        .env_remove("FOCUS_ENGINE_LOG")
        .env_remove("FOCUS_ENGINE_DEBUG")
        .output()
        .expect("failed to run focus-engine")
}

fn run_json(home: &Path, args: &[&str]) -> Value {
    let output = run_cli(home, args);
    assert!(
        output.status.success(),
        "{args:?} failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    serde_json::from_slice(&output.stdout).expect("stdout is not JSON")
}

#[test]
fn test_help() {
    let home = TempDir::new().unwrap();
    let output = run_cli(home.path(), &["--help"]);
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("timer"));
    assert!(stdout.contains("recover"));
}

#[test]
fn test_timer_lifecycle() {
    let home = TempDir::new().unwrap();

    let status = run_json(home.path(), &["timer", "status"]);
    assert_eq!(status["type"], "StateSnapshot");
    assert_eq!(status["state"], "idle");

    let started = run_json(home.path(), &["timer", "start", "--minutes", "25"]);
    assert_eq!(started["type"], "SessionStarted");
    assert_eq!(started["planned_ms"], 25 * 60_000);
    let session_id = started["session_id"].as_str().unwrap().to_string();

    // State lives in the snapshot between processes.
    let status = run_json(home.path(), &["timer", "status"]);
    assert_eq!(status["state"], "running");
    assert_eq!(status["session_id"], session_id.as_str());

    let paused = run_json(home.path(), &["timer", "pause"]);
    assert_eq!(paused["type"], "SessionPaused");
    assert_eq!(paused["interruption_count"], 1);

    let resumed = run_json(home.path(), &["timer", "resume"]);
    assert_eq!(resumed["type"], "SessionResumed");

    let outcome = run_json(home.path(), &["timer", "stop"]);
    assert_eq!(outcome["session_id"], session_id.as_str());
    assert_eq!(outcome["status"], "interrupted");
    assert_eq!(outcome["perfect"], false);

    let status = run_json(home.path(), &["timer", "status"]);
    assert_eq!(status["state"], "idle");

    let recent = run_json(home.path(), &["stats", "recent"]);
    assert_eq!(recent.as_array().unwrap().len(), 1);
}

#[test]
fn test_double_start_fails() {
    let home = TempDir::new().unwrap();
    run_json(home.path(), &["timer", "start", "--type", "short_break"]);

    let output = run_cli(home.path(), &["timer", "start"]);
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.starts_with("error:"), "stderr: {stderr}");
}

#[test]
fn test_pause_when_idle_fails() {
    let home = TempDir::new().unwrap();
    let output = run_cli(home.path(), &["timer", "pause"]);
    assert!(!output.status.success());
}

#[test]
fn test_recover_with_nothing_stored() {
    let home = TempDir::new().unwrap();
    let report = run_json(home.path(), &["recover"]);
    assert_eq!(report["kind"], "nothing");
}

#[test]
fn test_config_get_set() {
    let home = TempDir::new().unwrap();

    let output = run_cli(home.path(), &["config", "get", "durations.focus"]);
    assert!(output.status.success());
    assert_eq!(String::from_utf8_lossy(&output.stdout).trim(), "25");

    let output = run_cli(home.path(), &["config", "set", "durations.focus", "40"]);
    assert!(output.status.success());

    let output = run_cli(home.path(), &["config", "get", "durations.focus"]);
    assert_eq!(String::from_utf8_lossy(&output.stdout).trim(), "40");

    // The configured focus duration is the start default.
    let started = run_json(home.path(), &["timer", "start"]);
    assert_eq!(started["planned_ms"], 40 * 60_000);

    let output = run_cli(home.path(), &["config", "get", "no.such.key"]);
    assert!(!output.status.success());
}

#[test]
fn test_stats_all_on_empty_database() {
    let home = TempDir::new().unwrap();
    let stats = run_json(home.path(), &["stats", "all"]);
    assert_eq!(stats["total_sessions"], 0);
}
