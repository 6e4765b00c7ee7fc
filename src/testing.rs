//! In-memory host doubles for driving supervisors without touching the OS.
//!
//! [`FakeHost`] implements all three leaf capabilities over one shared
//! model of the mount table and container runtime, and records every
//! effectful call in order so tests can assert on sequencing.

#![allow(missing_docs)]

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;

use crate::container::ContainerController;
use crate::core::config::{ShareConfig, is_no_container};
use crate::core::errors::{NfsmError, Result};
use crate::logger::jsonl::Severity;
use crate::mount::operator::{ClearSummary, MountOperator};
use crate::mount::probe::{MountProbe, ProbeOutcome};
use crate::supervisor::HostAdapters;
use crate::supervisor::report::{EventSink, ShareEvent};
use crate::supervisor::state::SharePhase;

/// One effectful call made against the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    StopContainer(String),
    StartContainer(String),
    Clear(PathBuf),
    Mount(PathBuf),
    ForceUnmount(PathBuf),
}

#[derive(Debug, Default)]
struct HostState {
    mounted: HashSet<PathBuf>,
    stale: HashMap<PathBuf, String>,
    running: HashSet<String>,
    effects: Vec<Effect>,
    mount_failures_remaining: u32,
    fail_mounts_forever: bool,
    mount_lands_stale: bool,
    forced_probe: Option<ProbeOutcome>,
    fail_containers: bool,
    fail_unmounts: bool,
    mount_delay: HashMap<PathBuf, Duration>,
    panic_on_mount: HashSet<PathBuf>,
}

/// Shared fake of the mount table and container runtime.
#[derive(Debug, Clone, Default)]
pub struct FakeHost {
    inner: Arc<Mutex<HostState>>,
}

impl FakeHost {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adapters whose three capabilities all point at this fake.
    #[must_use]
    pub fn adapters(&self) -> HostAdapters {
        HostAdapters {
            probe: Arc::new(self.clone()),
            operator: Arc::new(self.clone()),
            containers: Arc::new(self.clone()),
        }
    }

    /// Fail the next `n` mount calls.
    pub fn fail_mounts(&self, n: u32) {
        self.inner.lock().mount_failures_remaining = n;
    }

    pub fn fail_mounts_forever(&self, on: bool) {
        self.inner.lock().fail_mounts_forever = on;
    }

    /// Mount calls succeed but the fresh mount is immediately unresponsive.
    pub fn mount_lands_stale(&self, on: bool) {
        self.inner.lock().mount_lands_stale = on;
    }

    /// Pretend `path` is already mounted and healthy.
    pub fn set_mounted(&self, path: impl AsRef<Path>) {
        self.inner.lock().mounted.insert(path.as_ref().to_path_buf());
    }

    /// Keep `path` in the mount table but make listings fail.
    pub fn mark_stale(&self, path: impl AsRef<Path>, reason: &str) {
        let mut s = self.inner.lock();
        let path = path.as_ref().to_path_buf();
        s.mounted.insert(path.clone());
        s.stale.insert(path, reason.to_string());
    }

    /// Remove `path` from the mount table behind the supervisor's back.
    pub fn drop_mount(&self, path: impl AsRef<Path>) {
        let mut s = self.inner.lock();
        s.mounted.remove(path.as_ref());
        s.stale.remove(path.as_ref());
    }

    /// Override every probe answer until reset with `None`.
    pub fn force_probe(&self, outcome: Option<ProbeOutcome>) {
        self.inner.lock().forced_probe = outcome;
    }

    pub fn fail_containers(&self, on: bool) {
        self.inner.lock().fail_containers = on;
    }

    pub fn fail_unmounts(&self, on: bool) {
        self.inner.lock().fail_unmounts = on;
    }

    /// Block mount calls for `path` for `delay` (simulates a hung server).
    pub fn set_mount_delay(&self, path: impl AsRef<Path>, delay: Option<Duration>) {
        let path = path.as_ref().to_path_buf();
        let mut s = self.inner.lock();
        match delay {
            Some(delay) => s.mount_delay.insert(path, delay),
            None => s.mount_delay.remove(&path),
        };
    }

    /// Make mount calls for `path` panic.
    pub fn panic_on_mount(&self, path: impl AsRef<Path>, on: bool) {
        let path = path.as_ref().to_path_buf();
        let mut s = self.inner.lock();
        if on {
            s.panic_on_mount.insert(path);
        } else {
            s.panic_on_mount.remove(&path);
        }
    }

    pub fn set_container_running(&self, id: &str) {
        self.inner.lock().running.insert(id.to_string());
    }

    #[must_use]
    pub fn effects(&self) -> Vec<Effect> {
        self.inner.lock().effects.clone()
    }

    pub fn clear_effects(&self) {
        self.inner.lock().effects.clear();
    }

    #[must_use]
    pub fn count(&self, matches: impl Fn(&Effect) -> bool) -> usize {
        self.inner.lock().effects.iter().filter(|e| matches(e)).count()
    }

    #[must_use]
    pub fn is_mounted(&self, path: impl AsRef<Path>) -> bool {
        self.inner.lock().mounted.contains(path.as_ref())
    }

    #[must_use]
    pub fn is_container_running(&self, id: &str) -> bool {
        self.inner.lock().running.contains(id)
    }
}

impl MountProbe for FakeHost {
    fn probe(&self, path: &Path) -> ProbeOutcome {
        let s = self.inner.lock();
        if let Some(forced) = &s.forced_probe {
            return forced.clone();
        }
        if let Some(reason) = s.stale.get(path) {
            return ProbeOutcome::MountedStale(reason.clone());
        }
        if s.mounted.contains(path) {
            ProbeOutcome::MountedHealthy
        } else {
            ProbeOutcome::NotMounted
        }
    }
}

impl MountOperator for FakeHost {
    fn mount(&self, share: &ShareConfig) -> Result<()> {
        let path = share.local_path.clone();
        let (delay, panic_requested) = {
            let mut s = self.inner.lock();
            s.effects.push(Effect::Mount(path.clone()));
            (
                s.mount_delay.get(&path).copied(),
                s.panic_on_mount.contains(&path),
            )
        };
        if let Some(delay) = delay {
            thread::sleep(delay);
        }
        assert!(!panic_requested, "injected mount panic for share {}", share.name);

        let mut s = self.inner.lock();
        if s.fail_mounts_forever || s.mount_failures_remaining > 0 {
            s.mount_failures_remaining = s.mount_failures_remaining.saturating_sub(1);
            return Err(NfsmError::MountFailed {
                source_spec: share.source_spec(),
                path,
                details: "mount.nfs: Connection timed out".to_string(),
            });
        }
        if s.mount_lands_stale {
            s.stale.insert(path.clone(), "Stale file handle".to_string());
        } else {
            s.stale.remove(&path);
        }
        s.mounted.insert(path);
        Ok(())
    }

    fn force_unmount(&self, path: &Path) -> Result<()> {
        let mut s = self.inner.lock();
        s.effects.push(Effect::ForceUnmount(path.to_path_buf()));
        if s.fail_unmounts && s.mounted.contains(path) {
            return Err(NfsmError::UnmountFailed {
                path: path.to_path_buf(),
                details: "umount: target is busy".to_string(),
            });
        }
        s.mounted.remove(path);
        s.stale.remove(path);
        Ok(())
    }

    fn clear_directory(&self, path: &Path) -> Result<ClearSummary> {
        let observed = self.probe(path);
        if observed != ProbeOutcome::NotMounted {
            return Err(NfsmError::SafetyVeto {
                path: path.to_path_buf(),
                reason: format!("refusing to clear: {}", observed.describe()),
            });
        }
        self.inner
            .lock()
            .effects
            .push(Effect::Clear(path.to_path_buf()));
        Ok(ClearSummary::default())
    }
}

impl ContainerController for FakeHost {
    fn stop(&self, id: &str) -> Result<()> {
        if is_no_container(id) {
            return Ok(());
        }
        let mut s = self.inner.lock();
        s.effects.push(Effect::StopContainer(id.to_string()));
        if s.fail_containers {
            return Err(container_error(id, "stop"));
        }
        s.running.remove(id);
        Ok(())
    }

    fn start(&self, id: &str) -> Result<()> {
        if is_no_container(id) {
            return Ok(());
        }
        let mut s = self.inner.lock();
        s.effects.push(Effect::StartContainer(id.to_string()));
        if s.fail_containers {
            return Err(container_error(id, "start"));
        }
        s.running.insert(id.to_string());
        Ok(())
    }

    fn is_running(&self, id: &str) -> Result<bool> {
        Ok(self.inner.lock().running.contains(id))
    }
}

fn container_error(id: &str, action: &'static str) -> NfsmError {
    NfsmError::Container {
        container: id.to_string(),
        action,
        details: "Cannot connect to the Docker daemon".to_string(),
    }
}

/// Sink that keeps every event in memory.
#[derive(Debug, Default)]
pub struct RecordingSink {
    events: Mutex<Vec<ShareEvent>>,
    notices: Mutex<Vec<(Severity, String)>>,
}

impl RecordingSink {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    #[must_use]
    pub fn events(&self) -> Vec<ShareEvent> {
        self.events.lock().clone()
    }

    /// `(from, to)` pairs reported for one share, in order.
    #[must_use]
    pub fn transitions(&self, share: &str) -> Vec<(SharePhase, SharePhase)> {
        self.events
            .lock()
            .iter()
            .filter(|e| e.share == share)
            .map(|e| (e.from, e.to))
            .collect()
    }

    #[must_use]
    pub fn notices(&self) -> Vec<(Severity, String)> {
        self.notices.lock().clone()
    }

    pub fn clear(&self) {
        self.events.lock().clear();
        self.notices.lock().clear();
    }
}

impl EventSink for RecordingSink {
    fn report(&self, event: ShareEvent) {
        self.events.lock().push(event);
    }

    fn notice(&self, severity: Severity, message: &str) {
        self.notices.lock().push((severity, message.to_string()));
    }
}

/// Share fixture with sensible defaults.
#[must_use]
pub fn share(name: &str, local_path: impl Into<PathBuf>) -> ShareConfig {
    ShareConfig {
        name: name.to_string(),
        server: "10.0.0.5".to_string(),
        remote_path: format!("/export/{name}"),
        local_path: local_path.into(),
        options: "rw,sync".to_string(),
        ..ShareConfig::default()
    }
}
