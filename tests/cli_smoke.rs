//! CLI smoke tests against the built `nfsmgr` binary.

mod common;

use std::fs;

use common::{TWO_SHARES, run_cli_case, write_config};

fn json_stdout(stdout: &str) -> serde_json::Value {
    serde_json::from_str(stdout.trim()).unwrap_or_else(|e| panic!("bad json {stdout:?}: {e}"))
}

#[test]
fn help_lists_lifecycle_commands() {
    let result = run_cli_case("help", &["--help"]);
    assert!(result.status.success(), "log: {}", result.log_path.display());
    for command in ["start", "stop", "restart", "status", "validate", "completions"] {
        assert!(result.stdout.contains(command), "missing {command}");
    }
}

#[test]
fn validate_accepts_a_good_config() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_config(dir.path(), TWO_SHARES);
    let config_arg = config.to_string_lossy().to_string();

    let result = run_cli_case("validate_ok", &["--config", &config_arg, "--json", "validate"]);

    assert!(result.status.success(), "log: {}", result.log_path.display());
    let payload = json_stdout(&result.stdout);
    assert_eq!(payload["valid"], true);
    assert_eq!(payload["shares"].as_array().unwrap().len(), 2);
    assert_eq!(payload["shares"][0]["docker"], "jellyfin");
    assert_eq!(payload["shares"][1]["docker"], "none");
    assert!(payload["config_hash"].is_string());
}

#[test]
fn validate_accepts_the_legacy_json_layout() {
    let dir = tempfile::tempdir().unwrap();
    let config = dir.path().join("shares.json");
    fs::write(
        &config,
        r#"{"shares": [{"name": "docs", "server": "nas", "remote_path": "/export/docs/",
            "local_path": "/mnt/docs/", "options": "rw"}]}"#,
    )
    .unwrap();
    let config_arg = config.to_string_lossy().to_string();

    let result = run_cli_case("validate_json", &["--config", &config_arg, "--json", "validate"]);

    assert!(result.status.success(), "log: {}", result.log_path.display());
    let payload = json_stdout(&result.stdout);
    assert_eq!(payload["shares"][0]["local_path"], "/mnt/docs");
    assert_eq!(payload["shares"][0]["remote_path"], "/export/docs");
}

#[test]
fn validate_rejects_overlapping_mount_points() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_config(
        dir.path(),
        r#"
[[shares]]
name = "data"
server = "nas"
remote_path = "/export/data"
local_path = "/mnt/data"
options = "rw"

[[shares]]
name = "nested"
server = "nas"
remote_path = "/export/nested"
local_path = "/mnt/data/nested"
options = "rw"
"#,
    );
    let config_arg = config.to_string_lossy().to_string();

    let result = run_cli_case("validate_overlap", &["--config", &config_arg, "validate"]);

    assert_eq!(result.status.code(), Some(1), "log: {}", result.log_path.display());
    assert!(result.stderr.contains("NFSM-1001"), "{}", result.stderr);
    assert!(result.stderr.contains("overlap"), "{}", result.stderr);
}

#[test]
fn missing_config_is_a_user_error() {
    let dir = tempfile::tempdir().unwrap();
    let config_arg = dir.path().join("absent.toml").to_string_lossy().to_string();

    let result = run_cli_case("validate_missing", &["--config", &config_arg, "validate"]);

    assert_eq!(result.status.code(), Some(1));
    assert!(result.stderr.contains("NFSM-1002"), "{}", result.stderr);
}

#[test]
fn completions_are_generated() {
    let result = run_cli_case("completions_bash", &["completions", "bash"]);
    assert!(result.status.success(), "log: {}", result.log_path.display());
    assert!(result.stdout.contains("nfsmgr"));
}

#[test]
fn status_without_state_file_reports_not_running() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_config(dir.path(), TWO_SHARES);
    let config_arg = config.to_string_lossy().to_string();

    let result = run_cli_case("status_missing", &["--config", &config_arg, "--json", "status"]);

    assert!(result.status.success(), "log: {}", result.log_path.display());
    let payload = json_stdout(&result.stdout);
    assert_eq!(payload["running"], false);
    assert!(payload["state"].is_null());
}

#[test]
fn status_renders_the_state_file() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_config(dir.path(), TWO_SHARES);
    fs::write(
        dir.path().join("state.json"),
        r#"{
  "version": "0.1.0",
  "pid": 1,
  "started_at": "2026-01-01T00:00:00.000Z",
  "uptime_seconds": 90,
  "last_updated": "2026-01-01T00:01:30.000Z",
  "write_interval_secs": 30,
  "shares": [
    {"name": "media", "local_path": "/mnt/media", "phase": "mounted",
     "consecutive_failures": 0, "last_error": null, "updated_at": "2026-01-01T00:01:00Z"},
    {"name": "backups", "local_path": "/mnt/backups", "phase": "failed",
     "consecutive_failures": 3, "last_error": "mount.nfs: Connection timed out",
     "updated_at": "2026-01-01T00:01:00Z"}
  ]
}"#,
    )
    .unwrap();
    let config_arg = config.to_string_lossy().to_string();

    let json = run_cli_case("status_json", &["--config", &config_arg, "--json", "status"]);
    assert!(json.status.success(), "log: {}", json.log_path.display());
    let payload = json_stdout(&json.stdout);
    assert_eq!(payload["state"]["shares"][1]["phase"], "failed");
    assert_eq!(payload["state"]["shares"][1]["consecutive_failures"], 3);
    assert_eq!(payload["stale"], true);

    let human = run_cli_case(
        "status_human",
        &["--config", &config_arg, "--no-color", "status"],
    );
    assert!(human.status.success(), "log: {}", human.log_path.display());
}

#[test]
fn corrupt_state_file_is_a_runtime_error() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_config(dir.path(), TWO_SHARES);
    fs::write(dir.path().join("state.json"), "{ not json").unwrap();
    let config_arg = config.to_string_lossy().to_string();

    let result = run_cli_case("status_corrupt", &["--config", &config_arg, "status"]);

    assert_eq!(result.status.code(), Some(2), "log: {}", result.log_path.display());
}

#[test]
fn stop_when_not_running_is_not_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_config(dir.path(), TWO_SHARES);
    let config_arg = config.to_string_lossy().to_string();

    let result = run_cli_case("stop_idle", &["--config", &config_arg, "--json", "stop"]);

    assert!(result.status.success(), "log: {}", result.log_path.display());
    let payload = json_stdout(&result.stdout);
    assert_eq!(payload["status"], "not_running");
}

#[test]
fn stop_clears_a_stale_pid_file() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_config(dir.path(), TWO_SHARES);
    let pid_path = dir.path().join("nfsmgr.pid");
    let mut child = std::process::Command::new("true").spawn().unwrap();
    let dead = child.id();
    child.wait().unwrap();
    fs::write(&pid_path, format!("{dead}\n")).unwrap();
    let config_arg = config.to_string_lossy().to_string();

    let result = run_cli_case("stop_stale", &["--config", &config_arg, "--json", "stop"]);

    assert!(result.status.success(), "log: {}", result.log_path.display());
    assert!(!pid_path.exists());
}
