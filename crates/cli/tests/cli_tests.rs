//! CLI integration tests

use std::process::Command;

fn resmgr_ctl(args: &[&str]) -> std::process::Output {
    Command::new("cargo")
        .args(["run", "-p", "resmgr-ctl", "--"])
        .args(args)
        .output()
        .expect("Failed to execute command")
}

/// Test that the CLI shows help
#[test]
fn test_cli_help() {
    let output = resmgr_ctl(&["--help"]);
    let stdout = String::from_utf8_lossy(&output.stdout);

    assert!(output.status.success(), "CLI help should succeed");
    assert!(
        stdout.contains("Control the CRI resource manager"),
        "Should show about text"
    );
    assert!(stdout.contains("config"), "Should show config command");
    assert!(stdout.contains("adjustment"), "Should show adjustment command");
    assert!(stdout.contains("reset"), "Should show reset command");
    assert!(stdout.contains("health"), "Should show health command");
}

/// Test that the CLI shows version
#[test]
fn test_cli_version() {
    let output = resmgr_ctl(&["--version"]);
    let stdout = String::from_utf8_lossy(&output.stdout);

    assert!(output.status.success(), "CLI version should succeed");
    assert!(stdout.contains("resmgr-ctl"), "Should show binary name");
}

#[test]
fn test_config_push_help() {
    let output = resmgr_ctl(&["config", "push", "--help"]);
    let stdout = String::from_utf8_lossy(&output.stdout);

    assert!(output.status.success(), "Config push help should succeed");
    assert!(stdout.contains("--node"), "Should show node option");
    assert!(stdout.contains("<FILE>"), "Should take a file argument");
}

#[test]
fn test_reset_help() {
    let output = resmgr_ctl(&["reset", "--help"]);
    let stdout = String::from_utf8_lossy(&output.stdout);

    assert!(output.status.success(), "Reset help should succeed");
    assert!(stdout.contains("policy"), "Should offer policy target");
    assert!(stdout.contains("config"), "Should offer config target");
    assert!(stdout.contains("--relay-socket"), "Should show relay socket option");
    assert!(stdout.contains("--cache-dir"), "Should show cache dir option");
}

#[test]
fn test_format_option() {
    let output = resmgr_ctl(&["--format", "json", "--help"]);
    assert!(output.status.success(), "Format option should be accepted");
}

#[test]
fn test_invalid_reset_target() {
    let output = resmgr_ctl(&["reset", "everything"]);
    assert!(!output.status.success(), "Unknown reset target should fail");
}

#[test]
fn test_invalid_command() {
    let output = resmgr_ctl(&["invalid-command"]);
    assert!(!output.status.success(), "Invalid command should fail");
}

#[test]
fn test_missing_argument() {
    let output = resmgr_ctl(&["config", "push"]);
    assert!(!output.status.success(), "Missing file argument should fail");
}

#[test]
fn test_push_missing_file_fails() {
    let output = resmgr_ctl(&[
        "--config-url",
        "http://127.0.0.1:1",
        "config",
        "push",
        "/nonexistent/resmgr-config.yaml",
    ]);
    assert!(!output.status.success(), "Unreadable file should fail");
}
