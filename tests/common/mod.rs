#![allow(dead_code)]

use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus};
use std::thread;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

pub struct CmdResult {
    pub status: ExitStatus,
    pub stdout: String,
    pub stderr: String,
    pub log_path: PathBuf,
}

fn now_millis() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_millis())
}

fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect()
}

fn resolve_bin_path() -> PathBuf {
    if let Ok(path) = std::env::var("CARGO_BIN_EXE_nfsmgr") {
        return PathBuf::from(path);
    }

    let fallback = std::env::current_exe()
        .ok()
        .and_then(|p| p.parent().map(PathBuf::from))
        .and_then(|deps| deps.parent().map(PathBuf::from))
        .map(|debug_dir| debug_dir.join("nfsmgr"));

    match fallback {
        Some(path) if path.exists() => path,
        _ => panic!("unable to resolve nfsmgr binary path for integration test"),
    }
}

/// Run the CLI binary and keep a transcript under the temp dir for
/// post-mortems.
pub fn run_cli_case(case_name: &str, args: &[&str]) -> CmdResult {
    let root = std::env::temp_dir().join("nfsmgr-test-logs");
    fs::create_dir_all(&root).expect("create temp test log dir");

    let log_path = root.join(format!("{}-{}.log", sanitize(case_name), now_millis()));
    let bin_path = resolve_bin_path();

    let output = Command::new(&bin_path)
        .args(args)
        .env("RUST_BACKTRACE", "1")
        .env_remove("NFSM_OUTPUT_FORMAT")
        .output()
        .expect("execute nfsmgr command");

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();

    let mut log_content = String::new();
    log_content.push_str(&format!("case={case_name}\n"));
    log_content.push_str(&format!("bin={}\n", bin_path.display()));
    log_content.push_str(&format!("args={args:?}\n"));
    log_content.push_str(&format!("status={}\n", output.status));
    log_content.push_str("----- stdout -----\n");
    log_content.push_str(&stdout);
    log_content.push('\n');
    log_content.push_str("----- stderr -----\n");
    log_content.push_str(&stderr);
    log_content.push('\n');
    fs::write(&log_path, log_content).expect("write test log");

    CmdResult {
        status: output.status,
        stdout,
        stderr,
        log_path,
    }
}

/// Write a TOML config whose runtime paths all live under `dir`.
pub fn write_config(dir: &Path, shares_toml: &str) -> PathBuf {
    let path = dir.join("config.toml");
    let body = format!(
        r#"{shares_toml}

[paths]
jsonl_log = "{log}"
state_file = "{state}"
pid_file = "{pid}"
"#,
        log = dir.join("activity.jsonl").display(),
        state = dir.join("state.json").display(),
        pid = dir.join("nfsmgr.pid").display(),
    );
    fs::write(&path, body).expect("write config");
    path
}

pub const TWO_SHARES: &str = r#"
[[shares]]
name = "media"
server = "10.0.0.5"
remote_path = "/export/media"
local_path = "/mnt/media"
options = "rw,hard,timeo=600"
docker = "jellyfin"

[[shares]]
name = "backups"
server = "10.0.0.5"
remote_path = "/export/backups"
local_path = "/mnt/backups"
options = "ro"
delete_on_mount = true
"#;

/// Poll `condition` every 5 ms until it holds or `timeout` passes.
pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    condition()
}
