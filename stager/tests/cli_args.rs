//! CLI tests for stager argument validation.
//!
//! Spawns the stager binary and verifies exit codes and diagnostics for
//! inputs that fail before any session or network work starts.

use std::process::Command;

use stager::exit_codes;

#[test]
fn new_rejects_project_without_owner() {
    let output = Command::new(env!("CARGO_BIN_EXE_stager"))
        .args(["new", "widget"])
        .output()
        .expect("stager new");

    assert_eq!(output.status.code(), Some(exit_codes::INVALID));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("owner/repo"), "stderr: {stderr}");
}

#[test]
fn run_tests_without_plan_names_the_missing_file() {
    let temp = tempfile::tempdir().expect("tempdir");
    let output = Command::new(env!("CARGO_BIN_EXE_stager"))
        .current_dir(temp.path())
        .args(["run-tests", "."])
        .output()
        .expect("stager run-tests");

    assert_eq!(output.status.code(), Some(exit_codes::INVALID));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("plan.json"), "stderr: {stderr}");
    assert!(stderr.contains("stager prepare"), "stderr: {stderr}");
}
