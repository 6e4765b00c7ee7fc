//! `state.json`: the daemon's periodic snapshot for `nfsmgr status`.
//!
//! Written atomically (write `.json.tmp`, then `rename()`) so a concurrent
//! reader always sees a complete document.

#![allow(missing_docs)]

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::core::errors::{NfsmError, Result};
use crate::supervisor::state::{SharePhase, ShareSnapshot};

/// Age beyond which `status` warns that the daemon may be wedged, as a
/// multiple of the write interval.
const STALE_AFTER_INTERVALS: u32 = 3;

/// Top-level document written to `state.json`.
///
/// `#[serde(default)]` keeps older and newer daemons readable.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonState {
    pub version: String,
    pub pid: u32,
    pub started_at: String,
    pub uptime_seconds: u64,
    pub last_updated: String,
    pub write_interval_secs: u64,
    pub dropped_log_events: u64,
    pub shares: Vec<ShareSnapshot>,
}

impl DaemonState {
    /// Shares currently serving their mount.
    #[must_use]
    pub fn mounted_count(&self) -> usize {
        self.shares
            .iter()
            .filter(|s| s.phase == SharePhase::Mounted)
            .count()
    }

    /// Seconds since `last_updated`, if it parses.
    #[must_use]
    pub fn age_secs(&self) -> Option<i64> {
        let updated = chrono::DateTime::parse_from_rfc3339(&self.last_updated).ok()?;
        Some(
            chrono::Utc::now()
                .signed_duration_since(updated)
                .num_seconds(),
        )
    }

    /// True when the daemon has missed several scheduled writes.
    #[must_use]
    pub fn is_stale(&self) -> bool {
        let threshold = self
            .write_interval_secs
            .max(1)
            .saturating_mul(u64::from(STALE_AFTER_INTERVALS));
        self.age_secs()
            .is_some_and(|age| u64::try_from(age).unwrap_or(0) > threshold)
    }
}

/// Rate-limited writer owned by the scheduler's main loop.
pub struct StateFileWriter {
    path: PathBuf,
    interval: Duration,
    last_write: Option<Instant>,
    start_time: Instant,
    started_at_iso: String,
}

impl StateFileWriter {
    #[must_use]
    pub fn new(path: PathBuf, interval: Duration) -> Self {
        Self {
            path,
            interval,
            last_write: None,
            start_time: Instant::now(),
            started_at_iso: now_iso(),
        }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write if the interval has elapsed since the previous attempt.
    /// Returns whether a write was attempted.
    pub fn maybe_write(&mut self, shares: Vec<ShareSnapshot>, dropped_log_events: u64) -> bool {
        if !self.is_due() {
            return false;
        }
        self.write_now(shares, dropped_log_events);
        true
    }

    /// Whether the interval has elapsed since the previous attempt.
    #[must_use]
    pub fn is_due(&self) -> bool {
        self.last_write
            .is_none_or(|last| last.elapsed() >= self.interval)
    }

    /// Write unconditionally. Failures go to stderr; the interval is still
    /// respected afterwards so a read-only disk does not spam the journal.
    pub fn write_now(&mut self, shares: Vec<ShareSnapshot>, dropped_log_events: u64) {
        let state = DaemonState {
            version: env!("CARGO_PKG_VERSION").to_string(),
            pid: std::process::id(),
            started_at: self.started_at_iso.clone(),
            uptime_seconds: self.start_time.elapsed().as_secs(),
            last_updated: now_iso(),
            write_interval_secs: self.interval.as_secs(),
            dropped_log_events,
            shares,
        };
        if let Err(e) = write_state_atomic(&self.path, &state) {
            eprintln!("[NFSM-STATE] failed to write state file: {e}");
        }
        self.last_write = Some(Instant::now());
    }
}

/// Read and parse `state.json`.
pub fn read_state(path: &Path) -> Result<DaemonState> {
    let raw = fs::read_to_string(path).map_err(|source| NfsmError::io(path, source))?;
    serde_json::from_str(&raw).map_err(|e| NfsmError::Serialization {
        context: "state file",
        details: format!("{}: {e}", path.display()),
    })
}

fn write_state_atomic(path: &Path, state: &DaemonState) -> Result<()> {
    let tmp_path = path.with_extension("json.tmp");
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|source| NfsmError::io(parent, source))?;
    }
    let json = serde_json::to_string_pretty(state)?;

    let result = (|| -> std::io::Result<()> {
        let mut opts = OpenOptions::new();
        opts.write(true).create(true).truncate(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt as _;
            opts.mode(0o644);
        }
        let mut file = opts.open(&tmp_path)?;
        file.write_all(json.as_bytes())?;
        file.sync_all()?;
        drop(file);
        fs::rename(&tmp_path, path)
    })();

    result.map_err(|source| {
        let _ = fs::remove_file(&tmp_path);
        NfsmError::io(path, source)
    })
}

fn now_iso() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(name: &str, phase: SharePhase) -> ShareSnapshot {
        ShareSnapshot {
            name: name.to_string(),
            local_path: PathBuf::from(format!("/mnt/{name}")),
            phase,
            consecutive_failures: 0,
            last_error: None,
            updated_at: now_iso(),
        }
    }

    #[test]
    fn write_then_read_round_trips_shares() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        let mut writer = StateFileWriter::new(path.clone(), Duration::from_secs(30));

        writer.write_now(
            vec![
                snapshot("docs", SharePhase::Mounted),
                snapshot("media", SharePhase::Failed),
            ],
            2,
        );

        let state = read_state(&path).unwrap();
        assert_eq!(state.pid, std::process::id());
        assert_eq!(state.shares.len(), 2);
        assert_eq!(state.mounted_count(), 1);
        assert_eq!(state.dropped_log_events, 2);
        assert!(!state.is_stale());
        assert!(!dir.path().join("state.json.tmp").exists());
    }

    #[test]
    fn writes_respect_interval() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        let mut writer = StateFileWriter::new(path.clone(), Duration::from_millis(50));

        assert!(writer.maybe_write(vec![snapshot("docs", SharePhase::Mounting)], 0));
        assert!(!writer.maybe_write(vec![snapshot("docs", SharePhase::Mounted)], 0));
        assert_eq!(read_state(&path).unwrap().shares[0].phase, SharePhase::Mounting);

        std::thread::sleep(Duration::from_millis(60));
        assert!(writer.maybe_write(vec![snapshot("docs", SharePhase::Mounted)], 0));
        assert_eq!(read_state(&path).unwrap().shares[0].phase, SharePhase::Mounted);
    }

    #[cfg(unix)]
    #[test]
    fn state_file_is_world_readable() {
        use std::os::unix::fs::PermissionsExt as _;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        StateFileWriter::new(path.clone(), Duration::from_secs(30)).write_now(Vec::new(), 0);
        let mode = fs::metadata(&path).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o644);
    }

    #[test]
    fn unwritable_path_does_not_panic() {
        let mut writer = StateFileWriter::new(
            PathBuf::from("/proc/nfsm_no_such_dir/state.json"),
            Duration::from_secs(30),
        );
        writer.write_now(Vec::new(), 0);
        assert!(!writer.maybe_write(Vec::new(), 0));
    }

    #[test]
    fn corrupt_state_file_is_serialization_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        fs::write(&path, b"{\"version\": ").unwrap();
        let err = read_state(&path).unwrap_err();
        assert_eq!(err.code(), "NFSM-2101");
    }

    #[test]
    fn missing_state_file_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = read_state(&dir.path().join("absent.json")).unwrap_err();
        assert_eq!(err.code(), "NFSM-3002");
    }

    #[test]
    fn old_timestamp_is_stale() {
        let state = DaemonState {
            last_updated: "2020-01-01T00:00:00.000Z".to_string(),
            write_interval_secs: 30,
            ..DaemonState::default()
        };
        assert!(state.is_stale());
    }

    #[test]
    fn unknown_fields_are_ignored() {
        let json = r#"{"version":"9.9.9","pid":42,"shares":[],"future_field":1}"#;
        let state: DaemonState = serde_json::from_str(json).unwrap();
        assert_eq!(state.pid, 42);
    }
}
