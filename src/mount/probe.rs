//! Mount presence and stale-handle detection.
//!
//! A share is healthy only when the mount table lists its exact local path
//! and a directory listing of the mount root returns without an I/O error
//! inside the probe deadline. A listing that hangs (classic NFS hard-mount
//! behavior with the server gone) is reported stale once the deadline passes;
//! the blocked helper thread is left behind and further listings of the same
//! path are short-circuited until it returns.

#![allow(missing_docs)]

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam_channel::{RecvTimeoutError, bounded};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::platform::pal::Platform;

/// What a probe observed at a local path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "status", content = "reason")]
pub enum ProbeOutcome {
    MountedHealthy,
    MountedStale(String),
    NotMounted,
}

impl ProbeOutcome {
    /// Anything other than a confirmed absence counts as mounted.
    #[must_use]
    pub fn is_mounted(&self) -> bool {
        !matches!(self, Self::NotMounted)
    }

    #[must_use]
    pub fn is_healthy(&self) -> bool {
        matches!(self, Self::MountedHealthy)
    }

    /// Short label for log lines.
    #[must_use]
    pub fn describe(&self) -> String {
        match self {
            Self::MountedHealthy => "mounted and healthy".to_string(),
            Self::MountedStale(reason) => format!("mounted but stale ({reason})"),
            Self::NotMounted => "not mounted".to_string(),
        }
    }
}

/// Leaf capability: observe a mount point without modifying it.
pub trait MountProbe: Send + Sync {
    /// Must return within a bounded time.
    fn probe(&self, path: &Path) -> ProbeOutcome;
}

/// Probe backed by the platform mount table and a bounded directory listing.
pub struct SystemMountProbe {
    platform: Arc<dyn Platform>,
    timeout: Duration,
    in_flight: Arc<Mutex<HashSet<PathBuf>>>,
}

impl SystemMountProbe {
    #[must_use]
    pub fn new(platform: Arc<dyn Platform>, timeout: Duration) -> Self {
        Self {
            platform,
            timeout,
            in_flight: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    fn check_responsive(&self, path: &Path) -> ProbeOutcome {
        if !self.in_flight.lock().insert(path.to_path_buf()) {
            return ProbeOutcome::MountedStale(
                "previous health check still blocked on the mount".to_string(),
            );
        }

        let (tx, rx) = bounded(1);
        let target = path.to_path_buf();
        let in_flight = Arc::clone(&self.in_flight);
        let spawned = thread::Builder::new()
            .name("nfsm-probe".to_string())
            .spawn(move || {
                let result = list_root(&target);
                in_flight.lock().remove(&target);
                let _ = tx.send(result);
            });
        if let Err(e) = spawned {
            self.in_flight.lock().remove(path);
            return ProbeOutcome::MountedStale(format!("could not spawn probe thread: {e}"));
        }

        match rx.recv_timeout(self.timeout) {
            Ok(Ok(())) => ProbeOutcome::MountedHealthy,
            Ok(Err(e)) => ProbeOutcome::MountedStale(format!("I/O error listing mount root: {e}")),
            Err(RecvTimeoutError::Timeout) => ProbeOutcome::MountedStale(format!(
                "mount root did not respond within {}ms",
                self.timeout.as_millis()
            )),
            Err(RecvTimeoutError::Disconnected) => {
                ProbeOutcome::MountedStale("probe thread exited without a result".to_string())
            }
        }
    }
}

impl MountProbe for SystemMountProbe {
    fn probe(&self, path: &Path) -> ProbeOutcome {
        match self.platform.mount_at(path) {
            Ok(Some(_)) => self.check_responsive(path),
            Ok(None) => ProbeOutcome::NotMounted,
            // An unreadable mount table must never be mistaken for "not
            // mounted": that answer unlocks the destructive clear.
            Err(e) => ProbeOutcome::MountedStale(format!("mount table unavailable: {e}")),
        }
    }
}

/// Read the first entry of the directory, which forces a round trip to the
/// server for NFS mounts.
fn list_root(path: &Path) -> std::io::Result<()> {
    let mut entries = fs::read_dir(path)?;
    if let Some(entry) = entries.next() {
        entry?;
    }
    Ok(())
}
