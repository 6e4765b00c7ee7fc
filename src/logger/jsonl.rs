//! JSONL activity log: one self-contained JSON object per line.
//!
//! Lines are assembled in memory and written with a single `write_all`, so a
//! tailing reader never observes a partial line. When the primary file cannot
//! be written the writer degrades through:
//! 1. Primary file path
//! 2. Fallback path (RAM-backed by default)
//! 3. stderr with `[NFSM-JSONL]` prefix
//! 4. Silent discard (supervision must never stop because logging failed)

#![allow(missing_docs)]

use std::fmt;
use std::fs::{self, File, OpenOptions, rename};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::core::errors::{NfsmError, Result};

/// Severity level for log events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Critical => "critical",
        })
    }
}

/// Activity event kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    DaemonStart,
    DaemonStop,
    ShareTransition,
    ContainerAction,
    ClearRefused,
    Notice,
    Error,
}

/// A single JSONL log entry. Only `ts`, `event` and `severity` are always present.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    /// RFC 3339 UTC timestamp with millisecond precision.
    pub ts: String,
    pub event: EventType,
    pub severity: Severity,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub share: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,
    /// `ok`, `degraded`, `failed` or `vetoed`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outcome: Option<String>,
    /// Local mount point involved.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub container: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl LogEntry {
    /// Create a new entry stamped with the current UTC time.
    #[must_use]
    pub fn new(event: EventType, severity: Severity) -> Self {
        Self {
            ts: format_utc_now(),
            event,
            severity,
            share: None,
            from: None,
            to: None,
            outcome: None,
            path: None,
            container: None,
            error_code: None,
            details: None,
        }
    }

    /// Single-line human rendering mirrored to stderr for the service journal.
    #[must_use]
    pub fn human_line(&self) -> String {
        let mut line = format!("[NFSM-{}] {}", tag_for(self.event), self.severity);
        if let Some(share) = &self.share {
            line.push_str(&format!(" share={share}"));
        }
        if let (Some(from), Some(to)) = (&self.from, &self.to) {
            line.push_str(&format!(" {from} -> {to}"));
        }
        if let Some(outcome) = &self.outcome {
            line.push_str(&format!(" ({outcome})"));
        }
        if let Some(container) = &self.container {
            line.push_str(&format!(" container={container}"));
        }
        if let Some(code) = &self.error_code {
            line.push_str(&format!(" code={code}"));
        }
        if let Some(details) = &self.details {
            line.push_str(": ");
            line.push_str(details);
        }
        line
    }
}

fn tag_for(event: EventType) -> &'static str {
    match event {
        EventType::DaemonStart | EventType::DaemonStop => "DAEMON",
        EventType::ShareTransition => "SHARE",
        EventType::ContainerAction => "CONTAINER",
        EventType::ClearRefused => "VETO",
        EventType::Notice => "NOTICE",
        EventType::Error => "ERROR",
    }
}

/// Configuration for the JSONL writer.
#[derive(Debug, Clone)]
pub struct JsonlConfig {
    pub path: PathBuf,
    /// Optional fallback path (e.g. on a different filesystem).
    pub fallback_path: Option<PathBuf>,
    /// Maximum file size before rotation. Default: 16 MiB.
    pub max_size_bytes: u64,
    /// Number of rotated files to keep. Default: 5.
    pub max_rotated_files: u32,
    /// Seconds between forced fsync calls. Default: 10.
    pub fsync_interval_secs: u64,
}

impl Default for JsonlConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("/var/log/nfsmgr/activity.jsonl"),
            fallback_path: Some(PathBuf::from("/dev/shm/nfsmgr.jsonl")),
            max_size_bytes: 16 * 1024 * 1024,
            max_rotated_files: 5,
            fsync_interval_secs: 10,
        }
    }
}

/// An open log file and how many bytes it holds.
struct OpenLog {
    path: PathBuf,
    out: BufWriter<File>,
    size: u64,
}

impl OpenLog {
    fn open(path: &Path) -> Option<Self> {
        let (file, size) = open_append(path).ok()?;
        Some(Self {
            path: path.to_path_buf(),
            out: BufWriter::with_capacity(16 * 1024, file),
            size,
        })
    }

    fn append(&mut self, line: &str) -> io::Result<()> {
        self.out.write_all(line.as_bytes())?;
        self.size += line.len() as u64;
        Ok(())
    }

    fn sync(&mut self) {
        let _ = self.out.flush();
        let _ = self.out.get_ref().sync_data();
    }
}

/// Where lines currently go, most durable first.
enum Sink {
    Primary(OpenLog),
    Fallback(OpenLog),
    Stderr,
    Discard,
}

impl Sink {
    fn file(&mut self) -> Option<&mut OpenLog> {
        match self {
            Self::Primary(log) | Self::Fallback(log) => Some(log),
            Self::Stderr | Self::Discard => None,
        }
    }
}

fn announce(message: &str) {
    let _ = writeln!(io::stderr(), "[NFSM-JSONL] {message}");
}

/// Append-only JSONL log writer with rotation and multi-level fallback.
pub struct JsonlWriter {
    config: JsonlConfig,
    sink: Sink,
    last_fsync: Instant,
}

impl JsonlWriter {
    /// Open the JSONL log file, dropping down the chain until something works.
    #[must_use]
    pub fn open(config: JsonlConfig) -> Self {
        let sink = match OpenLog::open(&config.path) {
            Some(log) => Sink::Primary(log),
            None => fallback_sink(&config, "primary path failed"),
        };
        Self {
            config,
            sink,
            last_fsync: Instant::now(),
        }
    }

    /// Write a single log entry as one JSONL line.
    pub fn write_entry(&mut self, entry: &LogEntry) {
        match serde_json::to_string(entry) {
            Ok(json) => self.write_line(&format!("{json}\n")),
            Err(e) => announce(&format!("serialize error: {e}")),
        }
    }

    pub fn flush(&mut self) {
        if let Some(log) = self.sink.file() {
            let _ = log.out.flush();
        }
    }

    pub fn fsync(&mut self) {
        if let Some(log) = self.sink.file() {
            log.sync();
        }
        self.last_fsync = Instant::now();
    }

    /// Current degradation level.
    #[must_use]
    pub fn state(&self) -> &'static str {
        match self.sink {
            Sink::Primary(_) => "normal",
            Sink::Fallback(_) => "fallback",
            Sink::Stderr => "stderr",
            Sink::Discard => "discard",
        }
    }

    /// Try reopening the primary path after a degradation.
    pub fn try_recover(&mut self) {
        if matches!(self.sink, Sink::Primary(_)) {
            return;
        }
        if let Some(log) = OpenLog::open(&self.config.path) {
            announce(&format!(
                "recovered to primary path: {}",
                self.config.path.display()
            ));
            self.sink = Sink::Primary(log);
        }
    }

    fn write_line(&mut self, line: &str) {
        let limit = self.config.max_size_bytes;
        if self
            .sink
            .file()
            .is_some_and(|log| log.size + line.len() as u64 > limit)
        {
            self.rotate();
        }

        loop {
            let written = match &mut self.sink {
                Sink::Primary(log) | Sink::Fallback(log) => log.append(line).is_ok(),
                Sink::Stderr => {
                    let _ = write!(io::stderr(), "[NFSM-JSONL] {line}");
                    true
                }
                Sink::Discard => true,
            };
            if written {
                break;
            }
            self.degrade();
        }

        if self.last_fsync.elapsed() >= Duration::from_secs(self.config.fsync_interval_secs) {
            self.fsync();
        }
    }

    fn degrade(&mut self) {
        self.sink = match std::mem::replace(&mut self.sink, Sink::Discard) {
            Sink::Primary(_) => fallback_sink(&self.config, "primary write failed"),
            Sink::Fallback(_) => {
                announce("fallback write failed, using stderr");
                Sink::Stderr
            }
            Sink::Stderr | Sink::Discard => Sink::Discard,
        };
    }

    fn rotate(&mut self) {
        let Some(log) = self.sink.file() else {
            return;
        };
        let _ = log.out.flush();
        let base = log.path.clone();
        shift_rotations(&base, self.config.max_rotated_files);

        match OpenLog::open(&base) {
            Some(fresh) => match &mut self.sink {
                Sink::Primary(log) | Sink::Fallback(log) => *log = fresh,
                Sink::Stderr | Sink::Discard => {}
            },
            None => self.degrade(),
        }
    }
}

fn fallback_sink(config: &JsonlConfig, why: &str) -> Sink {
    let Some(path) = &config.fallback_path else {
        announce(&format!("{why} and no fallback configured, using stderr"));
        return Sink::Stderr;
    };
    if let Some(log) = OpenLog::open(path) {
        announce(&format!("{why}, using fallback: {}", path.display()));
        Sink::Fallback(log)
    } else {
        announce(&format!("{why} and fallback unusable, using stderr"));
        Sink::Stderr
    }
}

/// Drop the oldest rotation and shift the rest up by one: `.1` becomes `.2`
/// and the live file becomes `.1`.
fn shift_rotations(base: &Path, keep: u32) {
    let _ = fs::remove_file(rotated_name(base, keep));
    for i in (1..keep).rev() {
        let _ = rename(rotated_name(base, i), rotated_name(base, i + 1));
    }
    let _ = rename(base, rotated_name(base, 1));
}

/// Open or create a file for appending. Returns `(File, current_size)`.
fn open_append(path: &Path) -> Result<(File, u64)> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|source| NfsmError::io(parent, source))?;
    }
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|source| NfsmError::io(path, source))?;
    let size = file.metadata().map(|m| m.len()).unwrap_or(0);
    Ok((file, size))
}

/// `activity.jsonl` → `activity.jsonl.3`.
fn rotated_name(base: &Path, index: u32) -> PathBuf {
    let mut name = base.as_os_str().to_owned();
    name.push(format!(".{index}"));
    PathBuf::from(name)
}

fn format_utc_now() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_at(path: PathBuf) -> JsonlConfig {
        JsonlConfig {
            path,
            fallback_path: None,
            max_size_bytes: 1024 * 1024,
            max_rotated_files: 3,
            fsync_interval_secs: 60,
        }
    }

    fn transition(share: &str) -> LogEntry {
        let mut entry = LogEntry::new(EventType::ShareTransition, Severity::Info);
        entry.share = Some(share.to_string());
        entry.from = Some("mounting".to_string());
        entry.to = Some("mounted".to_string());
        entry.outcome = Some("ok".to_string());
        entry
    }

    #[test]
    fn transition_entry_is_one_json_line() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("activity.jsonl");
        let mut writer = JsonlWriter::open(config_at(path.clone()));

        writer.write_entry(&transition("docs"));
        writer.flush();

        let contents = fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 1);
        let parsed: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(parsed["event"], "share_transition");
        assert_eq!(parsed["share"], "docs");
        assert_eq!(parsed["from"], "mounting");
        assert_eq!(parsed["to"], "mounted");
        assert_eq!(parsed["outcome"], "ok");
    }

    #[test]
    fn optional_fields_omitted_when_none() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sparse.jsonl");
        let mut writer = JsonlWriter::open(config_at(path.clone()));

        writer.write_entry(&LogEntry::new(EventType::DaemonStart, Severity::Info));
        writer.flush();

        let line = fs::read_to_string(&path).unwrap();
        assert!(line.contains("\"daemon_start\""));
        assert!(!line.contains("\"share\""));
        assert!(!line.contains("\"container\""));
    }

    #[test]
    fn rotation_shifts_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rot.jsonl");
        let mut config = config_at(path.clone());
        config.max_size_bytes = 100;
        let mut writer = JsonlWriter::open(config);

        for _ in 0..10 {
            writer.write_entry(&transition("docs"));
        }
        writer.flush();

        assert!(path.exists());
        assert!(rotated_name(&path, 1).exists());
        assert!(!rotated_name(&path, 4).exists());
    }

    #[test]
    fn fallback_when_primary_dir_unwritable() {
        let dir = tempfile::tempdir().unwrap();
        let fallback = dir.path().join("fallback.jsonl");
        let mut config = config_at(PathBuf::from("/proc/nfsm_no_such_dir/primary.jsonl"));
        config.fallback_path = Some(fallback.clone());
        let mut writer = JsonlWriter::open(config);

        assert_eq!(writer.state(), "fallback");
        writer.write_entry(&LogEntry::new(EventType::Error, Severity::Warning));
        writer.flush();
        assert!(!fs::read_to_string(&fallback).unwrap().is_empty());
    }

    #[test]
    fn stderr_when_no_fallback() {
        let writer = JsonlWriter::open(config_at(PathBuf::from(
            "/proc/nfsm_no_such_dir/primary.jsonl",
        )));
        assert_eq!(writer.state(), "stderr");
    }

    #[test]
    fn human_line_carries_transition_and_detail() {
        let mut entry = transition("media");
        entry.details = Some("adopted existing mount".to_string());
        let line = entry.human_line();
        assert!(line.starts_with("[NFSM-SHARE] info"), "{line}");
        assert!(line.contains("share=media"));
        assert!(line.contains("mounting -> mounted"));
        assert!(line.ends_with(": adopted existing mount"));
    }

    #[test]
    fn severity_orders_by_urgency() {
        assert!(Severity::Critical > Severity::Warning);
        assert!(Severity::Warning > Severity::Info);
    }
}
