//! PID file handling for `nfsmgr start|stop|restart`.
//!
//! Liveness uses `kill(pid, 0)`. A PID file whose process is gone is stale
//! and is removed on sight.

#![allow(missing_docs)]

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;

use crate::core::errors::{NfsmError, Result};

/// How long `stop` waits after SIGTERM before escalating to SIGKILL.
pub const STOP_GRACE: Duration = Duration::from_secs(10);
const STOP_POLL: Duration = Duration::from_millis(100);

/// What `stop_instance` had to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    NotRunning,
    Terminated { pid: i32 },
    Killed { pid: i32 },
}

/// Owned PID file; removed when dropped.
#[derive(Debug)]
pub struct PidFile {
    path: PathBuf,
}

impl PidFile {
    /// Claim `path` for this process. Fails if a live process already holds
    /// it; a stale file is replaced.
    pub fn acquire(path: &Path) -> Result<Self> {
        if let Some(pid) = read_live_pid(path)? {
            return Err(NfsmError::Runtime {
                details: format!("already running as pid {pid} ({})", path.display()),
            });
        }
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|source| NfsmError::io(parent, source))?;
        }
        let mut opts = OpenOptions::new();
        opts.write(true).create(true).truncate(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt as _;
            opts.mode(0o644);
        }
        let mut file = opts.open(path).map_err(|source| NfsmError::io(path, source))?;
        writeln!(file, "{}", std::process::id()).map_err(|source| NfsmError::io(path, source))?;
        Ok(Self {
            path: path.to_path_buf(),
        })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for PidFile {
    fn drop(&mut self) {
        // Only remove the file if it still names us.
        if read_pid(&self.path).ok().flatten() == Some(own_pid()) {
            let _ = fs::remove_file(&self.path);
        }
    }
}

/// Parse the PID recorded in `path`. `Ok(None)` when the file is absent.
pub fn read_pid(path: &Path) -> Result<Option<i32>> {
    let raw = match fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(source) => return Err(NfsmError::io(path, source)),
    };
    raw.trim()
        .parse::<i32>()
        .ok()
        .filter(|pid| *pid > 0)
        .map(Some)
        .ok_or_else(|| NfsmError::Runtime {
            details: format!("pid file {} does not contain a pid", path.display()),
        })
}

/// PID of the live instance recorded in `path`, removing the file if the
/// process is gone or the file is garbage.
pub fn read_live_pid(path: &Path) -> Result<Option<i32>> {
    let pid = match read_pid(path) {
        Ok(Some(pid)) => pid,
        Ok(None) => return Ok(None),
        Err(NfsmError::Runtime { details }) => {
            eprintln!("[NFSM-PID] removing unreadable pid file: {details}");
            let _ = fs::remove_file(path);
            return Ok(None);
        }
        Err(e) => return Err(e),
    };
    if is_alive(pid) {
        Ok(Some(pid))
    } else {
        eprintln!(
            "[NFSM-PID] removing stale pid file {} (pid {pid} is gone)",
            path.display()
        );
        let _ = fs::remove_file(path);
        Ok(None)
    }
}

/// `kill(pid, 0)`: EPERM still means the process exists.
#[must_use]
pub fn is_alive(pid: i32) -> bool {
    matches!(kill(Pid::from_raw(pid), None), Ok(()) | Err(Errno::EPERM))
}

/// SIGTERM the recorded instance, wait up to `grace`, then SIGKILL.
pub fn stop_instance(path: &Path, grace: Duration) -> Result<StopOutcome> {
    let Some(pid) = read_live_pid(path)? else {
        return Ok(StopOutcome::NotRunning);
    };
    if pid == own_pid() {
        return Err(NfsmError::Runtime {
            details: format!("pid file {} names this process", path.display()),
        });
    }

    send(pid, Signal::SIGTERM)?;
    let deadline = Instant::now() + grace;
    while Instant::now() < deadline {
        if !is_alive(pid) {
            let _ = fs::remove_file(path);
            return Ok(StopOutcome::Terminated { pid });
        }
        thread::sleep(STOP_POLL);
    }

    eprintln!("[NFSM-PID] pid {pid} ignored SIGTERM for {grace:?}; sending SIGKILL");
    send(pid, Signal::SIGKILL)?;
    let _ = fs::remove_file(path);
    Ok(StopOutcome::Killed { pid })
}

fn send(pid: i32, signal: Signal) -> Result<()> {
    match kill(Pid::from_raw(pid), signal) {
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(Errno::EPERM) => Err(NfsmError::PermissionDenied {
            path: PathBuf::from(format!("/proc/{pid}")),
        }),
        Err(errno) => Err(NfsmError::Runtime {
            details: format!("failed to send {} to pid {pid}: {errno}", signal.as_str()),
        }),
    }
}

fn own_pid() -> i32 {
    i32::try_from(std::process::id()).unwrap_or(i32::MAX)
}
